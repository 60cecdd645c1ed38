//! Campaign state machine: the user-facing actions that move a campaign
//! between `draft`, `scheduled`, `sending`, `sent` and `failed`.
//!
//! Every entry into `sending` happens in one transaction that claims the
//! campaign with a status-guarded update, fixes the recipient set and
//! enqueues one dispatch task per recipient. Losing the claim is a no-op.

use anyhow::Context;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::db::{self, delivery, queue, Pool};
use crate::model::{Campaign, CampaignStatus, InvalidTransition};

#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("campaign {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("campaign {id} is {status} and can no longer be edited")]
    NotEditable { id: i64, status: CampaignStatus },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type CampaignResult<T> = Result<T, CampaignError>;

/// What a send or retry request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The campaign entered `sending` with this many tasks enqueued.
    Enqueued { recipients: usize },
    /// The campaign entered `sending` with nothing left to send and was
    /// finalized in the same transaction.
    Finalized(CampaignStatus),
    /// The campaign was already `sending`; nothing changed.
    AlreadySending,
}

async fn load(pool: &Pool, id: i64) -> CampaignResult<Campaign> {
    db::get_campaign(pool, id)
        .await?
        .ok_or(CampaignError::NotFound(id))
}

/// Claim a campaign currently in `from` and fan it out. Returns `None` when
/// another actor changed the status first.
pub(crate) async fn start_sending(
    pool: &Pool,
    id: i64,
    from: CampaignStatus,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<DispatchOutcome>> {
    let mut tx = pool.begin().await?;
    if !db::claim_for_sending_tx(&mut tx, id, from, now).await? {
        tx.rollback().await?;
        return Ok(None);
    }

    let campaign = db::get_campaign(&mut *tx, id)
        .await?
        .context("claimed campaign disappeared")?;
    let recipients = db::active_subscriber_ids(&mut *tx, campaign.user_id).await?;
    let counters = db::set_total_recipients_tx(&mut tx, id, recipients.len() as i64).await?;
    queue::enqueue_all_tx(&mut tx, id, &recipients, now).await?;
    let finalized = db::finalize_if_complete_tx(&mut tx, id, &counters, now).await?;
    tx.commit().await?;

    Ok(Some(match finalized {
        Some(status) => {
            info!(campaign_id = id, %status, "campaign had no active recipients");
            DispatchOutcome::Finalized(status)
        }
        None => {
            info!(campaign_id = id, recipients = recipients.len(), "campaign dispatched");
            DispatchOutcome::Enqueued {
                recipients: recipients.len(),
            }
        }
    }))
}

/// Start sending a `draft` or `scheduled` campaign immediately.
#[instrument(skip(pool))]
pub async fn send_now(pool: &Pool, id: i64) -> CampaignResult<DispatchOutcome> {
    let campaign = load(pool, id).await?;
    if campaign.status == CampaignStatus::Sending {
        return Ok(DispatchOutcome::AlreadySending);
    }
    campaign.status.transition(CampaignStatus::Sending)?;

    match start_sending(pool, id, campaign.status, Utc::now()).await? {
        Some(outcome) => Ok(outcome),
        None => settle_lost_claim(pool, id).await,
    }
}

/// Re-send to every recipient whose delivery failed. Successful deliveries
/// are kept; `failed_count` starts again from zero.
#[instrument(skip(pool))]
pub async fn retry_failed(pool: &Pool, id: i64) -> CampaignResult<DispatchOutcome> {
    let campaign = load(pool, id).await?;
    if campaign.status == CampaignStatus::Sending {
        return Ok(DispatchOutcome::AlreadySending);
    }
    if campaign.status != CampaignStatus::Failed {
        return Err(InvalidTransition {
            from: campaign.status,
            to: CampaignStatus::Sending,
        }
        .into());
    }

    match reopen_failed_recipients(pool, id, Utc::now()).await? {
        Some(outcome) => Ok(outcome),
        None => settle_lost_claim(pool, id).await,
    }
}

async fn reopen_failed_recipients(
    pool: &Pool,
    id: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<DispatchOutcome>> {
    let mut tx = pool.begin().await?;
    if !db::begin_retry_tx(&mut tx, id, now).await? {
        tx.rollback().await?;
        return Ok(None);
    }

    let failed = delivery::list_failed(&mut *tx, id).await?;
    let mut subscriber_ids = Vec::with_capacity(failed.len());
    for record in &failed {
        if delivery::reopen_failed(&mut *tx, record.id, now).await? {
            subscriber_ids.push(record.subscriber_id);
        }
    }
    queue::enqueue_all_tx(&mut tx, id, &subscriber_ids, now).await?;
    let counters = db::campaign_counters_tx(&mut tx, id)
        .await?
        .context("retried campaign disappeared")?;
    let finalized = db::finalize_if_complete_tx(&mut tx, id, &counters, now).await?;
    tx.commit().await?;

    info!(campaign_id = id, recipients = subscriber_ids.len(), "campaign retry dispatched");
    Ok(Some(match finalized {
        Some(status) => DispatchOutcome::Finalized(status),
        None => DispatchOutcome::Enqueued {
            recipients: subscriber_ids.len(),
        },
    }))
}

/// Someone else moved the campaign between our read and our claim.
async fn settle_lost_claim(pool: &Pool, id: i64) -> CampaignResult<DispatchOutcome> {
    let current = load(pool, id).await?;
    debug!(campaign_id = id, status = %current.status, "lost claim race");
    if current.status == CampaignStatus::Sending {
        Ok(DispatchOutcome::AlreadySending)
    } else {
        Err(InvalidTransition {
            from: current.status,
            to: CampaignStatus::Sending,
        }
        .into())
    }
}

/// Set (or move) the send time of a `draft` or `scheduled` campaign.
#[instrument(skip(pool))]
pub async fn schedule(pool: &Pool, id: i64, at: DateTime<Utc>) -> CampaignResult<()> {
    let campaign = load(pool, id).await?;
    campaign.status.transition(CampaignStatus::Scheduled)?;
    if db::schedule_campaign(pool, id, at).await? {
        Ok(())
    } else {
        let current = load(pool, id).await?;
        Err(InvalidTransition {
            from: current.status,
            to: CampaignStatus::Scheduled,
        }
        .into())
    }
}

/// Return a `scheduled` campaign to `draft`.
#[instrument(skip(pool))]
pub async fn unschedule(pool: &Pool, id: i64) -> CampaignResult<()> {
    let campaign = load(pool, id).await?;
    campaign.status.transition(CampaignStatus::Draft)?;
    if db::unschedule_campaign(pool, id).await? {
        Ok(())
    } else {
        let current = load(pool, id).await?;
        Err(InvalidTransition {
            from: current.status,
            to: CampaignStatus::Draft,
        }
        .into())
    }
}

/// Replace name, subject and body while the campaign has not started sending.
#[instrument(skip(pool, subject, body))]
pub async fn update_content(
    pool: &Pool,
    id: i64,
    name: &str,
    subject: &str,
    body: &str,
) -> CampaignResult<()> {
    let campaign = load(pool, id).await?;
    if !campaign.status.is_editable() || !db::update_campaign_content(pool, id, name, subject, body).await? {
        let current = load(pool, id).await?;
        return Err(CampaignError::NotEditable {
            id,
            status: current.status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeliveryStatus;
    use chrono::Duration;
    use sqlx::SqlitePool;

    async fn setup() -> (Pool, i64) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let uid = db::get_or_create_user(&pool, "Owner", "owner@example.com")
            .await
            .unwrap();
        (pool, uid)
    }

    #[tokio::test]
    async fn send_now_snapshots_active_subscribers() {
        let (pool, uid) = setup().await;
        let a = db::create_subscriber(&pool, uid, "a@example.com", "A").await.unwrap();
        let b = db::create_subscriber(&pool, uid, "b@example.com", "B").await.unwrap();
        db::unsubscribe_by_token(&pool, &b.unsubscribe_token, Utc::now())
            .await
            .unwrap();
        let cid = db::create_campaign(&pool, uid, "c", "s", "b").await.unwrap();

        let outcome = send_now(&pool, cid).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Enqueued { recipients: 1 });

        let c = db::get_campaign(&pool, cid).await.unwrap().unwrap();
        assert_eq!(c.status, CampaignStatus::Sending);
        assert_eq!(c.total_recipients, 1);
        assert_eq!(queue::count_pending(&pool).await.unwrap(), 1);

        let claimed = queue::claim_next(&pool, Utc::now(), std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.task.subscriber_id, a.id);
    }

    #[tokio::test]
    async fn send_now_is_a_noop_while_sending() {
        let (pool, uid) = setup().await;
        db::create_subscriber(&pool, uid, "a@example.com", "A").await.unwrap();
        let cid = db::create_campaign(&pool, uid, "c", "s", "b").await.unwrap();

        send_now(&pool, cid).await.unwrap();
        assert_eq!(send_now(&pool, cid).await.unwrap(), DispatchOutcome::AlreadySending);
        assert_eq!(queue::count_pending(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn campaign_without_recipients_finishes_immediately() {
        let (pool, uid) = setup().await;
        let cid = db::create_campaign(&pool, uid, "c", "s", "b").await.unwrap();

        let outcome = send_now(&pool, cid).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Finalized(CampaignStatus::Sent));
        let c = db::get_campaign(&pool, cid).await.unwrap().unwrap();
        assert_eq!(c.status, CampaignStatus::Sent);
        assert!(c.sent_at.is_some());
    }

    #[tokio::test]
    async fn terminal_campaigns_cannot_be_sent_again() {
        let (pool, uid) = setup().await;
        let cid = db::create_campaign(&pool, uid, "c", "s", "b").await.unwrap();
        send_now(&pool, cid).await.unwrap();

        let err = send_now(&pool, cid).await.unwrap_err();
        assert!(matches!(
            err,
            CampaignError::InvalidTransition(InvalidTransition {
                from: CampaignStatus::Sent,
                to: CampaignStatus::Sending
            })
        ));
        assert!(matches!(
            retry_failed(&pool, cid).await.unwrap_err(),
            CampaignError::InvalidTransition(_)
        ));
    }

    #[tokio::test]
    async fn unknown_campaign_is_not_found() {
        let (pool, _) = setup().await;
        assert!(matches!(
            send_now(&pool, 999).await.unwrap_err(),
            CampaignError::NotFound(999)
        ));
    }

    #[tokio::test]
    async fn schedule_and_edit_rules() {
        let (pool, uid) = setup().await;
        let cid = db::create_campaign(&pool, uid, "c", "s", "b").await.unwrap();
        schedule(&pool, cid, Utc::now() + Duration::hours(2)).await.unwrap();
        update_content(&pool, cid, "c2", "s2", "b2").await.unwrap();
        unschedule(&pool, cid).await.unwrap();
        assert!(matches!(
            unschedule(&pool, cid).await.unwrap_err(),
            CampaignError::InvalidTransition(_)
        ));

        send_now(&pool, cid).await.unwrap();
        assert!(matches!(
            update_content(&pool, cid, "c3", "s3", "b3").await.unwrap_err(),
            CampaignError::NotEditable { .. }
        ));
        assert!(matches!(
            schedule(&pool, cid, Utc::now()).await.unwrap_err(),
            CampaignError::InvalidTransition(_)
        ));
    }

    #[tokio::test]
    async fn retry_reopens_only_failed_records() {
        let (pool, uid) = setup().await;
        let ok = db::create_subscriber(&pool, uid, "ok@example.com", "Ok").await.unwrap();
        let bad = db::create_subscriber(&pool, uid, "bad@example.com", "Bad").await.unwrap();
        let cid = db::create_campaign(&pool, uid, "c", "s", "b").await.unwrap();
        send_now(&pool, cid).await.unwrap();
        sqlx::query("DELETE FROM dispatch_queue").execute(&pool).await.unwrap();

        let now = Utc::now();
        let r_ok = delivery::get_or_create(&mut *pool.acquire().await.unwrap(), cid, ok.id).await.unwrap();
        let r_bad = delivery::get_or_create(&mut *pool.acquire().await.unwrap(), cid, bad.id).await.unwrap();
        delivery::mark_sent(&pool, r_ok.id, now).await.unwrap();
        delivery::mark_failed(&pool, r_bad.id, "550 mailbox unavailable", 255, now)
            .await
            .unwrap();
        sqlx::query(
            "UPDATE campaigns SET sent_count = 1, failed_count = 1, status = 'failed' WHERE id = ?",
        )
        .bind(cid)
        .execute(&pool)
        .await
        .unwrap();

        let outcome = retry_failed(&pool, cid).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Enqueued { recipients: 1 });

        let c = db::get_campaign(&pool, cid).await.unwrap().unwrap();
        assert_eq!(c.status, CampaignStatus::Sending);
        assert_eq!(c.sent_count, 1);
        assert_eq!(c.failed_count, 0);
        assert_eq!(c.total_recipients, 2);

        let claimed = queue::claim_next(&pool, Utc::now(), std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.task.subscriber_id, bad.id);
        assert_eq!(queue::count_pending(&pool).await.unwrap(), 1);

        let kept = delivery::find(&pool, cid, ok.id).await.unwrap().unwrap();
        assert_eq!(kept.status, DeliveryStatus::Sent);
        let reopened = delivery::find(&pool, cid, bad.id).await.unwrap().unwrap();
        assert_eq!(reopened.status, DeliveryStatus::Pending);

        assert_eq!(retry_failed(&pool, cid).await.unwrap(), DispatchOutcome::AlreadySending);
    }
}
