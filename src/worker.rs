//! Dispatch worker: one unit of work per (campaign, subscriber).
//!
//! Tasks arrive at-least-once and run concurrently. The delivery record is
//! the de-duplication point: only a `pending` record is ever sent, and its
//! outcome, the matching counter increment and the completion check commit
//! together. Transport failures are recorded against the recipient; any
//! other error escapes to the queue loop, which backs the task off.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{self, delivery, queue, Pool};
use crate::mailer::{Mailer, TransportError};
use crate::model::{CampaignStatus, DeliveryStatus, DispatchTask};
use crate::render::{render_message, RenderedMessage};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Upper bound on a single transport call; expiry counts as a failure.
    pub send_timeout: Duration,
    /// How long a claimed queue entry stays invisible to other workers.
    pub lease: Duration,
    pub max_backoff_secs: i64,
    pub error_max_len: usize,
    pub unsubscribe_base_url: Option<String>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            lease: Duration::from_secs(120),
            max_backoff_secs: 60,
            error_max_len: delivery::DEFAULT_ERROR_MAX_LEN,
            unsubscribe_base_url: None,
        }
    }
}

/// How a single dispatch task ended. `finalized` carries the terminal status
/// when this task was the one that completed the campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Sent { finalized: Option<CampaignStatus> },
    Failed { finalized: Option<CampaignStatus> },
    /// The subscriber unsubscribed or was deleted; their slot was released.
    Released { finalized: Option<CampaignStatus> },
    /// The record already had an outcome (re-delivered task).
    AlreadyProcessed(DeliveryStatus),
    CampaignMissing,
}

/// Run one dispatch task to completion.
#[instrument(skip(pool, mailer, opts), fields(campaign_id = task.campaign_id, subscriber_id = task.subscriber_id))]
pub async fn process_task(
    pool: &Pool,
    mailer: &dyn Mailer,
    task: &DispatchTask,
    opts: &WorkerOptions,
) -> Result<TaskOutcome> {
    let Some(campaign) = db::get_campaign(pool, task.campaign_id).await? else {
        debug!("campaign no longer exists");
        return Ok(TaskOutcome::CampaignMissing);
    };

    let subscriber = match db::get_subscriber(pool, task.subscriber_id).await? {
        Some(s) if s.is_active() => s,
        Some(_) => {
            debug!("subscriber unsubscribed before send");
            return release_recipient(pool, task).await;
        }
        None => {
            debug!("subscriber no longer exists");
            return release_recipient(pool, task).await;
        }
    };

    let record = {
        let mut conn = pool.acquire().await?;
        delivery::get_or_create(&mut conn, task.campaign_id, task.subscriber_id).await?
    };
    if record.status != DeliveryStatus::Pending {
        debug!(status = record.status.as_str(), "delivery already recorded");
        return Ok(TaskOutcome::AlreadyProcessed(record.status));
    }

    let message = render_message(&campaign, &subscriber, opts.unsubscribe_base_url.as_deref());
    let result = send_with_timeout(mailer, &message, opts.send_timeout).await;
    if let Err(err) = &result {
        warn!(error = %err, to = %message.to, "delivery failed");
    }
    record_outcome(pool, task, record.id, result, opts.error_max_len).await
}

async fn send_with_timeout(
    mailer: &dyn Mailer,
    message: &RenderedMessage,
    limit: Duration,
) -> Result<(), TransportError> {
    match tokio::time::timeout(limit, mailer.send(message)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

/// Write the delivery outcome, bump the matching counter and finalize the
/// campaign if this was the last outstanding recipient, all in one transaction.
async fn record_outcome(
    pool: &Pool,
    task: &DispatchTask,
    record_id: i64,
    result: Result<(), TransportError>,
    error_max_len: usize,
) -> Result<TaskOutcome> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let sent = result.is_ok();
    let changed = match &result {
        Ok(()) => delivery::mark_sent(&mut *tx, record_id, now).await?,
        Err(err) => delivery::mark_failed(&mut *tx, record_id, &err.to_string(), error_max_len, now).await?,
    };
    if !changed {
        let current = delivery::find(&mut *tx, task.campaign_id, task.subscriber_id).await?;
        tx.commit().await?;
        let status = current.map(|r| r.status).unwrap_or(DeliveryStatus::Pending);
        debug!(status = status.as_str(), "outcome already recorded by another worker");
        return Ok(TaskOutcome::AlreadyProcessed(status));
    }

    let finalized = match db::increment_counter_tx(&mut tx, task.campaign_id, sent, now).await? {
        Some(counters) => db::finalize_if_complete_tx(&mut tx, task.campaign_id, &counters, now).await?,
        None => None,
    };
    tx.commit().await?;

    if let Some(status) = finalized {
        info!(campaign_id = task.campaign_id, %status, "campaign finished");
    }
    Ok(if sent {
        TaskOutcome::Sent { finalized }
    } else {
        TaskOutcome::Failed { finalized }
    })
}

/// Mark the pair `skipped` and shrink the campaign's target count so the
/// campaign can still complete without this recipient.
async fn release_recipient(pool: &Pool, task: &DispatchTask) -> Result<TaskOutcome> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let record = delivery::get_or_create(&mut *tx, task.campaign_id, task.subscriber_id).await?;
    if record.status != DeliveryStatus::Pending || !delivery::mark_skipped(&mut *tx, record.id, now).await? {
        tx.commit().await?;
        return Ok(TaskOutcome::AlreadyProcessed(record.status));
    }

    let finalized = match db::release_recipient_tx(&mut tx, task.campaign_id, now).await? {
        Some(counters) => db::finalize_if_complete_tx(&mut tx, task.campaign_id, &counters, now).await?,
        None => None,
    };
    tx.commit().await?;

    if let Some(status) = finalized {
        info!(campaign_id = task.campaign_id, %status, "campaign finished");
    }
    Ok(TaskOutcome::Released { finalized })
}

/// Claim and run the next due task. Returns `false` when the queue had
/// nothing to hand out.
pub async fn process_next_task(pool: &Pool, mailer: &dyn Mailer, opts: &WorkerOptions) -> Result<bool> {
    let Some(entry) = queue::claim_next(pool, Utc::now(), opts.lease).await? else {
        return Ok(false);
    };

    match process_task(pool, mailer, &entry.task, opts).await {
        Ok(outcome) => {
            queue::complete(pool, entry.id).await?;
            debug!(id = entry.id, ?outcome, "dispatch task done");
        }
        Err(err) => {
            error!(
                ?err,
                id = entry.id,
                campaign_id = entry.task.campaign_id,
                subscriber_id = entry.task.subscriber_id,
                attempt = entry.attempt,
                "dispatch task failed; backoff"
            );
            queue::backoff_with_cap(pool, entry.id, entry.attempt, opts.max_backoff_secs, &format!("{err:#}"))
                .await?;
        }
    }
    Ok(true)
}

/// Poll the queue until the process stops.
pub async fn run_worker(
    worker_id: usize,
    pool: Pool,
    mailer: Arc<dyn Mailer>,
    opts: WorkerOptions,
    poll_sleep: Duration,
) {
    info!(worker_id, "dispatch worker started");
    loop {
        match process_next_task(&pool, mailer.as_ref(), &opts).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(poll_sleep).await,
            Err(err) => {
                error!(?err, worker_id, "dispatch worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Spawn `workers` independent queue consumers.
pub fn run_pool(
    workers: usize,
    pool: &Pool,
    mailer: Arc<dyn Mailer>,
    opts: &WorkerOptions,
    poll_sleep: Duration,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker_id| {
            tokio::spawn(run_worker(
                worker_id,
                pool.clone(),
                mailer.clone(),
                opts.clone(),
                poll_sleep,
            ))
        })
        .collect()
}

/// Drain the queue with `workers` concurrent consumers and return once no
/// task is due. Tasks in backoff are left in place.
pub async fn drain(pool: &Pool, mailer: Arc<dyn Mailer>, opts: &WorkerOptions, workers: usize) -> Result<()> {
    let runs = (0..workers.max(1)).map(|_| {
        let mailer = mailer.clone();
        async move {
            while process_next_task(pool, mailer.as_ref(), opts).await? {}
            Ok::<(), anyhow::Error>(())
        }
    });
    for result in join_all(runs).await {
        result?;
    }
    Ok(())
}
