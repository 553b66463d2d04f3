//! fuzzdeploy-scheduler: CPU-core aware scheduler for fuzzing campaigns
//!
//! This crate provides the scheduling logic for a campaign:
//! - Core pool with exclusive leases and rebalancing
//! - Job dispatch, reaping and cancellation
//! - Progress tracking from output counters
//! - Campaign orchestration

pub mod core_pool;
pub mod dispatcher;
pub mod handle;
pub mod orchestrator;
pub mod progress;

pub use core_pool::{CoreGrant, CorePool, LeaseId, Reassignment, SharedCorePool};
pub use dispatcher::{Dispatcher, RunningJob};
pub use handle::CampaignHandle;
pub use orchestrator::{CampaignOrchestrator, CampaignReport, OrchestratorOptions};
pub use progress::{ProgressSnapshot, ProgressSource, ProgressTracker, ProgressUnit, StageProgress};
