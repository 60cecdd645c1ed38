//! Durable dispatch queue. Each row carries a JSON [`DispatchTask`]; workers
//! lease rows with `claim_next`, delete them on completion and push them back
//! with exponential backoff on fatal errors. A lease that expires (crashed
//! worker) makes the row claimable again, so delivery is at-least-once.

use super::model::QueuedTask;
use crate::model::DispatchTask;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Executor, Row, Sqlite, Transaction};
use tracing::instrument;

use super::Pool;

pub async fn enqueue<'e, E>(executor: E, task: &DispatchTask, due_at: DateTime<Utc>) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let payload = serde_json::to_string(task)?;
    let rec = sqlx::query(
        "INSERT INTO dispatch_queue (payload, attempt, due_at, created_at) VALUES (?, 0, ?, ?) RETURNING id",
    )
    .bind(payload)
    .bind(due_at)
    .bind(Utc::now())
    .fetch_one(executor)
    .await?;
    Ok(rec.get("id"))
}

/// Enqueue one task per subscriber inside the caller's transaction.
pub async fn enqueue_all_tx(
    tx: &mut Transaction<'_, Sqlite>,
    campaign_id: i64,
    subscriber_ids: &[i64],
    due_at: DateTime<Utc>,
) -> Result<usize> {
    for &subscriber_id in subscriber_ids {
        let task = DispatchTask {
            campaign_id,
            subscriber_id,
        };
        enqueue(&mut **tx, &task, due_at).await?;
    }
    Ok(subscriber_ids.len())
}

/// Lease the oldest due task that nobody currently holds.
#[instrument(skip_all)]
pub async fn claim_next(
    pool: &Pool,
    now: DateTime<Utc>,
    lease: std::time::Duration,
) -> Result<Option<QueuedTask>> {
    let lease = Duration::from_std(lease).context("lease out of range")?;
    let row = sqlx::query(
        "UPDATE dispatch_queue SET locked_until = ? \
         WHERE id = ( \
             SELECT id FROM dispatch_queue \
             WHERE julianday(due_at) <= julianday(?) \
               AND (locked_until IS NULL OR julianday(locked_until) <= julianday(?)) \
             ORDER BY julianday(due_at) ASC, id ASC LIMIT 1 \
         ) \
         RETURNING id, payload, attempt",
    )
    .bind(now + lease)
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let id: i64 = row.get("id");
    let payload: String = row.get("payload");
    let task: DispatchTask = serde_json::from_str(&payload)
        .with_context(|| format!("queue entry {id} has an invalid payload"))?;
    Ok(Some(QueuedTask {
        id,
        task,
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn complete(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM dispatch_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delay before the next attempt: 5s * 2^attempt, capped at `max_cap_secs`
/// (or one hour when no positive cap is given).
pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let cap = if max_cap_secs <= 0 { 3600 } else { max_cap_secs };
    secs.min(cap)
}

/// Release the lease and push the task back with exponential backoff.
#[instrument(skip_all)]
pub async fn backoff_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
    error: &str,
) -> Result<()> {
    let due_at = Utc::now() + Duration::seconds(backoff_secs(attempt, max_cap_secs));
    sqlx::query(
        "UPDATE dispatch_queue SET attempt = ?, due_at = ?, locked_until = NULL, last_error = ? \
         WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(due_at)
    .bind(super::delivery::truncate_error(error, super::delivery::DEFAULT_ERROR_MAX_LEN))
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_pending(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dispatch_queue")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
