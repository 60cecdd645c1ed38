use super::model::CampaignCounters;
use crate::model::{Campaign, CampaignStatus, Subscriber, SubscriberStatus, User};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

const CAMPAIGN_COLUMNS: &str = "id, user_id, name, subject, body, status, scheduled_at, sent_at, \
     total_recipients, sent_count, failed_count, created_at, updated_at";

const SUBSCRIBER_COLUMNS: &str =
    "id, user_id, email, name, status, unsubscribe_token, unsubscribed_at, created_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {normalized}"))?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL, make sure its parent
/// directory exists and ask SQLite to create the file. Other URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) if q.contains("mode=") => format!("sqlite://{path}?{q}"),
        Some(q) => format!("sqlite://{path}?{q}&mode=rwc"),
        None => format!("sqlite://{path}?mode=rwc"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn campaign_status(raw: &str) -> Result<CampaignStatus> {
    CampaignStatus::parse_state(raw).ok_or_else(|| anyhow!("unknown campaign status {raw}"))
}

fn campaign_from_row(row: &SqliteRow) -> Result<Campaign> {
    let status: String = row.try_get("status")?;
    Ok(Campaign {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        status: campaign_status(&status)?,
        scheduled_at: row.try_get("scheduled_at")?,
        sent_at: row.try_get("sent_at")?,
        total_recipients: row.try_get("total_recipients")?,
        sent_count: row.try_get("sent_count")?,
        failed_count: row.try_get("failed_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn subscriber_from_row(row: &SqliteRow) -> Result<Subscriber> {
    let status: String = row.try_get("status")?;
    Ok(Subscriber {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        status: SubscriberStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("unknown subscriber status {status}"))?,
        unsubscribe_token: row.try_get("unsubscribe_token")?,
        unsubscribed_at: row.try_get("unsubscribed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn counters_from_row(row: &SqliteRow) -> Result<CampaignCounters> {
    let status: String = row.try_get("status")?;
    Ok(CampaignCounters {
        status: campaign_status(&status)?,
        total_recipients: row.try_get("total_recipients")?,
        sent_count: row.try_get("sent_count")?,
        failed_count: row.try_get("failed_count")?,
    })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn get_or_create_user(pool: &Pool, name: &str, email: &str) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query(
        "INSERT INTO users (name, email, created_at) VALUES (?, ?, ?) \
         ON CONFLICT (email) DO UPDATE SET email = excluded.email RETURNING id",
    )
    .bind(name)
    .bind(email)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn get_user(pool: &Pool, id: i64) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, name, email, created_at FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|row| {
        Ok(User {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            created_at: row.try_get("created_at")?,
        })
    })
    .transpose()
}

// ---------------------------------------------------------------------------
// Campaigns
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_campaign(
    pool: &Pool,
    user_id: i64,
    name: &str,
    subject: &str,
    body: &str,
) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO campaigns (user_id, name, subject, body, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(user_id)
    .bind(name)
    .bind(subject)
    .bind(body)
    .bind(CampaignStatus::Draft.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Replace the authored content. Only applies while the campaign is still
/// `draft` or `scheduled`; returns whether a row changed.
#[instrument(skip_all)]
pub async fn update_campaign_content(
    pool: &Pool,
    id: i64,
    name: &str,
    subject: &str,
    body: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE campaigns SET name = ?, subject = ?, body = ?, updated_at = ? \
         WHERE id = ? AND status IN ('draft', 'scheduled')",
    )
    .bind(name)
    .bind(subject)
    .bind(body)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn get_campaign<'e, E>(executor: E, id: i64) -> Result<Option<Campaign>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;
    row.as_ref().map(campaign_from_row).transpose()
}

pub async fn list_campaigns(pool: &Pool, user_id: i64) -> Result<Vec<Campaign>> {
    let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE user_id = ? ORDER BY id");
    let rows = sqlx::query(&sql).bind(user_id).fetch_all(pool).await?;
    rows.iter().map(campaign_from_row).collect()
}

#[instrument(skip_all)]
pub async fn schedule_campaign(pool: &Pool, id: i64, at: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE campaigns SET status = 'scheduled', scheduled_at = ?, updated_at = ? \
         WHERE id = ? AND status IN ('draft', 'scheduled')",
    )
    .bind(at)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn unschedule_campaign(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE campaigns SET status = 'draft', scheduled_at = NULL, updated_at = ? \
         WHERE id = ? AND status = 'scheduled'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Ids of `scheduled` campaigns whose send time has passed, in id order,
/// starting strictly after `after_id`. `julianday` keeps sub-second precision;
/// `datetime` would round a send time later in the same second down to due.
#[instrument(skip_all)]
pub async fn due_campaign_ids(
    pool: &Pool,
    now: DateTime<Utc>,
    after_id: i64,
    limit: i64,
) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM campaigns \
         WHERE status = 'scheduled' AND scheduled_at IS NOT NULL \
           AND julianday(scheduled_at) <= julianday(?) AND id > ? \
         ORDER BY id LIMIT ?",
    )
    .bind(now)
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Move a campaign from `from` into `sending` with zeroed counters. The
/// status guard makes the claim exclusive: a concurrent claimer sees `false`.
pub async fn claim_for_sending_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    from: CampaignStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    let to = from.transition(CampaignStatus::Sending)?;
    let res = sqlx::query(
        "UPDATE campaigns SET status = ?, total_recipients = 0, sent_count = 0, failed_count = 0, \
         sent_at = NULL, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(now)
    .bind(id)
    .bind(from.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Re-enter `sending` from `failed`: failures are forgotten, successes kept.
pub async fn begin_retry_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE campaigns SET status = 'sending', failed_count = 0, sent_at = NULL, updated_at = ? \
         WHERE id = ? AND status = 'failed'",
    )
    .bind(now)
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn set_total_recipients_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    total: i64,
) -> Result<CampaignCounters> {
    let row = sqlx::query(
        "UPDATE campaigns SET total_recipients = ? WHERE id = ? \
         RETURNING status, total_recipients, sent_count, failed_count",
    )
    .bind(total)
    .bind(id)
    .fetch_one(&mut **tx)
    .await?;
    counters_from_row(&row)
}

pub async fn campaign_counters_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
) -> Result<Option<CampaignCounters>> {
    let row = sqlx::query(
        "SELECT status, total_recipients, sent_count, failed_count FROM campaigns WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(counters_from_row).transpose()
}

/// Increment `sent_count` (or `failed_count`) by one and read the counters
/// back from the same statement.
pub async fn increment_counter_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    sent: bool,
    now: DateTime<Utc>,
) -> Result<Option<CampaignCounters>> {
    let sql = if sent {
        "UPDATE campaigns SET sent_count = sent_count + 1, updated_at = ? WHERE id = ? \
         RETURNING status, total_recipients, sent_count, failed_count"
    } else {
        "UPDATE campaigns SET failed_count = failed_count + 1, updated_at = ? WHERE id = ? \
         RETURNING status, total_recipients, sent_count, failed_count"
    };
    let row = sqlx::query(sql)
        .bind(now)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(counters_from_row).transpose()
}

/// Drop one recipient from the campaign's target count.
pub async fn release_recipient_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Option<CampaignCounters>> {
    let row = sqlx::query(
        "UPDATE campaigns SET total_recipients = total_recipients - 1, updated_at = ? \
         WHERE id = ? AND total_recipients > sent_count + failed_count \
         RETURNING status, total_recipients, sent_count, failed_count",
    )
    .bind(now)
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(counters_from_row).transpose()
}

/// Move a `sending` campaign to its terminal status when every recipient has
/// an outcome. Returns the status written, or `None` when nothing changed.
pub async fn finalize_if_complete_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    counters: &CampaignCounters,
    now: DateTime<Utc>,
) -> Result<Option<CampaignStatus>> {
    if counters.status != CampaignStatus::Sending || !counters.is_complete() {
        return Ok(None);
    }
    let terminal = counters
        .status
        .transition(CampaignStatus::terminal_for(counters.failed_count))?;
    let res = sqlx::query(
        "UPDATE campaigns SET status = ?, sent_at = ?, updated_at = ? \
         WHERE id = ? AND status = 'sending'",
    )
    .bind(terminal.as_str())
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok((res.rows_affected() == 1).then_some(terminal))
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Insert an active subscriber with a freshly minted unsubscribe token.
#[instrument(skip_all)]
pub async fn create_subscriber(
    pool: &Pool,
    user_id: i64,
    email: &str,
    name: &str,
) -> Result<Subscriber> {
    let sql = format!(
        "INSERT INTO subscribers (user_id, email, name, status, unsubscribe_token, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING {SUBSCRIBER_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(user_id)
        .bind(email)
        .bind(name)
        .bind(SubscriberStatus::Active.as_str())
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;
    subscriber_from_row(&row)
}

pub async fn get_subscriber<'e, E>(executor: E, id: i64) -> Result<Option<Subscriber>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;
    row.as_ref().map(subscriber_from_row).transpose()
}

pub async fn find_subscriber_by_token(pool: &Pool, token: &str) -> Result<Option<Subscriber>> {
    let sql = format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE unsubscribe_token = ?");
    let row = sqlx::query(&sql).bind(token).fetch_optional(pool).await?;
    row.as_ref().map(subscriber_from_row).transpose()
}

pub async fn list_subscribers(pool: &Pool, user_id: i64) -> Result<Vec<Subscriber>> {
    let sql = format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE user_id = ? ORDER BY id");
    let rows = sqlx::query(&sql).bind(user_id).fetch_all(pool).await?;
    rows.iter().map(subscriber_from_row).collect()
}

/// Snapshot of the owner's currently active subscribers.
pub async fn active_subscriber_ids<'e, E>(executor: E, user_id: i64) -> Result<Vec<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM subscribers WHERE user_id = ? AND status = 'active' ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(executor)
    .await?;
    Ok(ids)
}

/// Flip the subscriber behind `token` to `unsubscribed`. Repeated calls leave
/// the first `unsubscribed_at` untouched. Unknown tokens yield `None`.
#[instrument(skip_all)]
pub async fn unsubscribe_by_token(
    pool: &Pool,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Option<Subscriber>> {
    sqlx::query(
        "UPDATE subscribers SET status = 'unsubscribed', unsubscribed_at = ? \
         WHERE unsubscribe_token = ? AND status = 'active'",
    )
    .bind(now)
    .bind(token)
    .execute(pool)
    .await?;
    find_subscriber_by_token(pool, token).await
}

/// Owner-initiated unsubscribe, scoped to subscribers the owner holds.
#[instrument(skip_all)]
pub async fn unsubscribe_subscriber(
    pool: &Pool,
    user_id: i64,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Option<Subscriber>> {
    sqlx::query(
        "UPDATE subscribers SET status = 'unsubscribed', unsubscribed_at = ? \
         WHERE id = ? AND user_id = ? AND status = 'active'",
    )
    .bind(now)
    .bind(id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(get_subscriber(pool, id)
        .await?
        .filter(|s| s.user_id == user_id))
}

#[instrument(skip_all)]
pub async fn delete_subscriber(pool: &Pool, user_id: i64, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM subscribers WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}
