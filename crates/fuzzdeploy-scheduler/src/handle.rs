//! Handle to a campaign running in the background

use fuzzdeploy_core::{FuzzDeployError, FuzzDeployResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::{CampaignOrchestrator, CampaignReport};
use crate::progress::ProgressSnapshot;

/// Cancellable campaign task with a progress stream
pub struct CampaignHandle {
    task: JoinHandle<FuzzDeployResult<CampaignReport>>,
    cancel: CancellationToken,
    progress: watch::Receiver<ProgressSnapshot>,
}

impl CampaignHandle {
    /// Spawn `orchestrator` on the current runtime
    pub fn spawn(orchestrator: CampaignOrchestrator) -> Self {
        Self::spawn_with_token(orchestrator, CancellationToken::new())
    }

    /// Spawn `orchestrator`, stopping it when `cancel` fires
    pub fn spawn_with_token(orchestrator: CampaignOrchestrator, cancel: CancellationToken) -> Self {
        let progress = orchestrator.subscribe();
        let task = tokio::spawn(orchestrator.run(cancel.clone()));

        Self {
            task,
            cancel,
            progress,
        }
    }

    /// Request cancellation; running jobs are terminated
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Receiver of progress snapshots
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the campaign to end
    pub async fn wait(self) -> FuzzDeployResult<CampaignReport> {
        self.task
            .await
            .map_err(|e| FuzzDeployError::Internal(format!("Campaign task failed: {}", e)))?
    }
}
