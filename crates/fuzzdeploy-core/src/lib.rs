//! fuzzdeploy-core: Core types for the fuzzdeploy campaign scheduler
//!
//! This crate provides the fundamental types used throughout fuzzdeploy:
//! - CPU core identifiers and range handling
//! - Job specifications, handles and statuses
//! - Campaign configuration
//! - Campaign directory layout and side-channel counters
//! - Error handling

pub mod config;
pub mod cpu;
pub mod error;
pub mod job;
pub mod layout;
pub mod plan;

pub use config::*;
pub use cpu::*;
pub use error::*;
pub use job::*;
pub use layout::*;
pub use plan::{build_job, enumerate_keys, plan_jobs};
