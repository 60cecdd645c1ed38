//! Database module: view models and SQL repositories.
//!
//! - `model`: slices returned by the transactional primitives.
//! - `repo`: pool setup plus users, campaigns and subscribers.
//! - `delivery`: the per-(campaign, subscriber) delivery ledger.
//! - `queue`: the durable dispatch queue the workers poll.
//!
//! The repository API is re-exported at `crate::db::*`.

pub mod delivery;
pub mod model;
pub mod queue;
pub mod repo;

pub use repo::*;

pub use model::{CampaignCounters, QueuedTask};
