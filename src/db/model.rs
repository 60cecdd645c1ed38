//! View models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{CampaignStatus, DispatchTask};

/// Counter snapshot read back in the same statement that changed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignCounters {
    pub status: CampaignStatus,
    pub total_recipients: i64,
    pub sent_count: i64,
    pub failed_count: i64,
}

impl CampaignCounters {
    pub fn is_complete(&self) -> bool {
        self.sent_count + self.failed_count >= self.total_recipients
    }
}

/// A leased queue entry handed to a worker.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: i64,
    pub task: DispatchTask,
    pub attempt: i32,
}
