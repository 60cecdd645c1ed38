//! Periodic scan that moves due `scheduled` campaigns into `sending`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use crate::campaign::{self, DispatchOutcome};
use crate::db::{self, Pool};
use crate::model::CampaignStatus;

/// Totals of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub claimed: usize,
    pub skipped: usize,
    pub enqueued: usize,
    /// Campaigns whose claim hit a storage error; they stay `scheduled`.
    pub errored: usize,
}

/// Dispatch every campaign that is `scheduled` with `scheduled_at <= now`.
pub async fn dispatch_scheduled_campaigns(pool: &Pool, chunk_size: i64) -> Result<ScanReport> {
    dispatch_scheduled_campaigns_at(pool, Utc::now(), chunk_size).await
}

/// Same as [`dispatch_scheduled_campaigns`] with an explicit clock. Campaigns
/// are walked in id order, `chunk_size` at a time; each one is claimed in its
/// own transaction, so a campaign another actor already moved is skipped. A
/// campaign that fails to claim is logged and retried on the next scan.
#[instrument(skip(pool))]
pub async fn dispatch_scheduled_campaigns_at(
    pool: &Pool,
    now: DateTime<Utc>,
    chunk_size: i64,
) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    let mut cursor = 0_i64;

    loop {
        let ids = db::due_campaign_ids(pool, now, cursor, chunk_size).await?;
        let Some(&last) = ids.last() else {
            break;
        };
        cursor = last;

        for id in ids {
            debug!(campaign_id = id, "dispatching scheduled campaign");
            match campaign::start_sending(pool, id, CampaignStatus::Scheduled, now).await {
                Ok(Some(DispatchOutcome::Enqueued { recipients })) => {
                    report.claimed += 1;
                    report.enqueued += recipients;
                }
                Ok(Some(_)) => report.claimed += 1,
                Ok(None) => {
                    debug!(campaign_id = id, "campaign already claimed");
                    report.skipped += 1;
                }
                Err(err) => {
                    error!(?err, campaign_id = id, "failed to dispatch scheduled campaign");
                    report.errored += 1;
                }
            }
        }
    }

    if report.claimed > 0 || report.errored > 0 {
        info!(
            claimed = report.claimed,
            enqueued = report.enqueued,
            skipped = report.skipped,
            errored = report.errored,
            "scheduled campaigns dispatched"
        );
    }
    Ok(report)
}

/// Run the scan forever, every `interval`.
pub async fn run(pool: Pool, interval: Duration, chunk_size: i64) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = dispatch_scheduled_campaigns(&pool, chunk_size).await {
            error!(?err, "scheduled campaign scan failed");
        }
    }
}
