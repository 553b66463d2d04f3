//! Job backend trait definitions

use async_trait::async_trait;
use fuzzdeploy_core::{CoreId, FuzzDeployResult, JobHandle, JobSpec};

/// Backend that runs one worker per job
///
/// Core assignments are advisory hints; a backend may apply them as CPU
/// affinity but the scheduler never relies on it.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Start a worker for `spec` bound to `cores`
    ///
    /// Fails with `FuzzDeployError::Launch` when the environment for the
    /// job's target does not exist or cannot be started.
    async fn start(&self, spec: &JobSpec, cores: &[CoreId]) -> FuzzDeployResult<JobHandle>;

    /// Check if a worker is still running
    async fn is_running(&self, handle: &JobHandle) -> FuzzDeployResult<bool>;

    /// Stop a worker; stopping an already stopped worker succeeds
    async fn terminate(&self, handle: &JobHandle) -> FuzzDeployResult<()>;

    /// Move a running worker onto `cores`
    async fn update_affinity(&self, _handle: &JobHandle, _cores: &[CoreId]) -> FuzzDeployResult<()> {
        Ok(())
    }

    /// Check that the environment named by `image` exists
    async fn has_environment(&self, image: &str) -> FuzzDeployResult<bool>;

    /// Get the backend name
    fn name(&self) -> &'static str;
}
