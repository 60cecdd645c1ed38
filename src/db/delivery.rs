//! Delivery ledger: one row per (campaign, subscriber) pair that has been
//! targeted. The UNIQUE(campaign_id, subscriber_id) constraint is the
//! idempotency key; every status change is guarded by the row's previous
//! status so concurrent or repeated workers cannot apply it twice.

use crate::model::{DeliveryRecord, DeliveryStatus};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqliteConnection};
use tracing::instrument;

/// Upper bound on stored error text, in characters.
pub const DEFAULT_ERROR_MAX_LEN: usize = 255;

const RECORD_COLUMNS: &str =
    "id, campaign_id, subscriber_id, status, sent_at, error, created_at, updated_at";

/// Cut `text` to at most `max_chars` characters without splitting a code point.
pub fn truncate_error(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn record_from_row(row: &SqliteRow) -> Result<DeliveryRecord> {
    let status: String = row.try_get("status")?;
    Ok(DeliveryRecord {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        subscriber_id: row.try_get("subscriber_id")?,
        status: DeliveryStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("unknown delivery status {status}"))?,
        sent_at: row.try_get("sent_at")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Return the record for the pair, creating a `pending` one if none exists.
/// A concurrent creator winning the insert is absorbed by `ON CONFLICT`.
#[instrument(skip_all)]
pub async fn get_or_create(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    subscriber_id: i64,
) -> Result<DeliveryRecord> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO delivery_records (campaign_id, subscriber_id, status, created_at, updated_at) \
         VALUES (?, ?, 'pending', ?, ?) \
         ON CONFLICT (campaign_id, subscriber_id) DO NOTHING",
    )
    .bind(campaign_id)
    .bind(subscriber_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    find(conn, campaign_id, subscriber_id)
        .await?
        .ok_or_else(|| anyhow!("delivery record {campaign_id}/{subscriber_id} vanished"))
}

pub async fn find<'e, E>(
    executor: E,
    campaign_id: i64,
    subscriber_id: i64,
) -> Result<Option<DeliveryRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM delivery_records WHERE campaign_id = ? AND subscriber_id = ?"
    );
    let row = sqlx::query(&sql)
        .bind(campaign_id)
        .bind(subscriber_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

/// `pending -> sent`, clearing any earlier error. Returns `false` when the
/// record was not pending, which includes records already `sent`.
pub async fn mark_sent<'e, E>(executor: E, record_id: i64, now: DateTime<Utc>) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "UPDATE delivery_records SET status = 'sent', sent_at = ?, error = NULL, updated_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(now)
    .bind(now)
    .bind(record_id)
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// `pending -> failed`, storing `error` truncated to `max_len` characters.
pub async fn mark_failed<'e, E>(
    executor: E,
    record_id: i64,
    error: &str,
    max_len: usize,
    now: DateTime<Utc>,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "UPDATE delivery_records SET status = 'failed', error = ?, updated_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(truncate_error(error, max_len))
    .bind(now)
    .bind(record_id)
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// `pending -> skipped` for a recipient that can no longer be mailed.
pub async fn mark_skipped<'e, E>(executor: E, record_id: i64, now: DateTime<Utc>) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "UPDATE delivery_records SET status = 'skipped', updated_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(now)
    .bind(record_id)
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// All `failed` records of a campaign, in subscriber order.
pub async fn list_failed<'e, E>(executor: E, campaign_id: i64) -> Result<Vec<DeliveryRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM delivery_records \
         WHERE campaign_id = ? AND status = 'failed' ORDER BY subscriber_id"
    );
    let rows = sqlx::query(&sql).bind(campaign_id).fetch_all(executor).await?;
    rows.iter().map(record_from_row).collect()
}

pub async fn list_for_campaign<'e, E>(executor: E, campaign_id: i64) -> Result<Vec<DeliveryRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM delivery_records WHERE campaign_id = ? ORDER BY subscriber_id"
    );
    let rows = sqlx::query(&sql).bind(campaign_id).fetch_all(executor).await?;
    rows.iter().map(record_from_row).collect()
}

/// Put a `failed` record back to `pending` for a retry. The error text is
/// kept until the next outcome overwrites it.
pub async fn reopen_failed<'e, E>(executor: E, record_id: i64, now: DateTime<Utc>) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        "UPDATE delivery_records SET status = 'pending', updated_at = ? \
         WHERE id = ? AND status = 'failed'",
    )
    .bind(now)
    .bind(record_id)
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}
