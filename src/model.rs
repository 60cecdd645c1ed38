use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle of a campaign. `Sent` and `Failed` are terminal for automatic
/// processing; only a user retry moves a `Failed` campaign back to `Sending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal campaign transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: CampaignStatus,
    pub to: CampaignStatus,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "scheduled" => Some(CampaignStatus::Scheduled),
            "sending" => Some(CampaignStatus::Sending),
            "sent" => Some(CampaignStatus::Sent),
            "failed" => Some(CampaignStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Sent | CampaignStatus::Failed)
    }

    /// Whether the campaign content may still be edited by its owner.
    pub fn is_editable(&self) -> bool {
        matches!(self, CampaignStatus::Draft | CampaignStatus::Scheduled)
    }

    pub fn can_transition_to(&self, to: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, to),
            (Draft, Scheduled)
                | (Scheduled, Scheduled)
                | (Scheduled, Draft)
                | (Draft, Sending)
                | (Scheduled, Sending)
                | (Sending, Sent)
                | (Sending, Failed)
                | (Failed, Sending)
        )
    }

    /// Validate a transition, returning the target state when it is legal.
    pub fn transition(self, to: CampaignStatus) -> Result<CampaignStatus, InvalidTransition> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    /// Terminal status reached once every recipient has an outcome.
    pub fn terminal_for(failed_count: i64) -> CampaignStatus {
        if failed_count > 0 {
            CampaignStatus::Failed
        } else {
            CampaignStatus::Sent
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Active,
    Unsubscribed,
}

impl SubscriberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberStatus::Active => "active",
            SubscriberStatus::Unsubscribed => "unsubscribed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriberStatus::Active),
            "unsubscribed" => Some(SubscriberStatus::Unsubscribed),
            _ => None,
        }
    }
}

/// Per-recipient ledger status. `Skipped` marks a recipient whose slot was
/// released because they unsubscribed or disappeared before sending.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Skipped => "skipped",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            "skipped" => Some(DeliveryStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub total_recipients: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn processed(&self) -> i64 {
        self.sent_count + self.failed_count
    }

    /// Share of recipients with an outcome, rounded to a whole percent.
    pub fn progress_percent(&self) -> u8 {
        if self.total_recipients <= 0 {
            return 0;
        }
        let pct = (self.processed() as f64 / self.total_recipients as f64) * 100.0;
        pct.round().clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub user_id: i64,
    pub email: String,
    pub name: String,
    pub status: SubscriberStatus,
    pub unsubscribe_token: String,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn is_active(&self) -> bool {
        self.status == SubscriberStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: i64,
    pub campaign_id: i64,
    pub subscriber_id: i64,
    pub status: DeliveryStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The descriptor carried by the dispatch queue: one per (campaign, subscriber).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchTask {
    pub campaign_id: i64,
    pub subscriber_id: i64,
}
