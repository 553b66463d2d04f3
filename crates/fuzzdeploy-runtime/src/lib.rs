//! fuzzdeploy-runtime: Job backend abstraction layer
//!
//! This crate provides backends for running campaign workers:
//! - Docker-based backend (one container per job)
//! - Process-based backend for hosts without docker

pub mod docker;
pub mod process;
pub mod traits;

use fuzzdeploy_core::{BackendConfig, BackendKind};
use std::sync::Arc;

pub use docker::DockerBackend;
pub use process::ProcessBackend;
pub use traits::JobBackend;

/// Build the backend selected by `config`
pub fn backend_from_config(config: &BackendConfig) -> Arc<dyn JobBackend> {
    match config.kind {
        BackendKind::Docker => Arc::new(DockerBackend::new(config.docker.clone())),
        BackendKind::Process => Arc::new(ProcessBackend::new(config.process.clone())),
    }
}
