//! Campaign orchestration
//!
//! The orchestrator owns the job list and drives a single cooperative loop:
//! skip already-satisfied jobs, wait for cores and launch the rest in
//! enumeration order, then drain. Reaping and progress polling interleave
//! with core waits so progress stays visible while the pool is full.
//! Rebalancing under the `All` policy only starts once nothing waits for
//! cores, so new jobs always get cores before running jobs grow.

use chrono::Utc;
use fuzzdeploy_core::{
    detect_core_count, plan_jobs, resolve_cores, CampaignConfig, CampaignLayout,
    FuzzDeployError, FuzzDeployResult, JobHandle, JobKey, JobSpec, JobStatus, RebalancePolicy,
};
use fuzzdeploy_runtime::JobBackend;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core_pool::{CorePool, SharedCorePool};
use crate::dispatcher::{Dispatcher, RunningJob};
use crate::progress::{ProgressSnapshot, ProgressSource, ProgressTracker, StageProgress};

/// Timings and policy of the scheduling loop
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub policy: RebalancePolicy,
    /// Sleep between core acquisition attempts, each preceded by a reap
    pub core_poll_interval: Duration,
    /// How long a job waits for cores before the wait is logged again
    pub core_wait_timeout: Duration,
    /// Sleep between reaps once every job is launched
    pub reap_interval: Duration,
    /// File written into the output directory of a job that exits on its own
    pub finish_marker: Option<String>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            policy: RebalancePolicy::Per,
            core_poll_interval: Duration::from_secs(1),
            core_wait_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_secs(5),
            finish_marker: None,
        }
    }
}

/// Outcome of a campaign run
#[derive(Debug, Clone)]
pub struct CampaignReport {
    /// Campaign identifier used in logs
    pub id: Uuid,
    /// Where results live
    pub output: PathBuf,
    /// Final status of every job, in enumeration order
    pub jobs: Vec<(JobKey, JobStatus)>,
    /// Progress at the end of the run
    pub progress: ProgressSnapshot,
    /// Whether the run was cancelled
    pub interrupted: bool,
}

impl CampaignReport {
    /// Number of jobs that ended in `status`
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|(_, s)| *s == status).count()
    }
}

/// Drives one campaign from enumeration to drain
pub struct CampaignOrchestrator {
    id: Uuid,
    jobs: Vec<JobSpec>,
    statuses: Vec<JobStatus>,
    running: HashMap<JobHandle, usize>,
    dispatcher: Dispatcher,
    source: Arc<dyn ProgressSource>,
    output: PathBuf,
    options: OrchestratorOptions,
    progress_tx: watch::Sender<ProgressSnapshot>,
}

impl CampaignOrchestrator {
    /// Create an orchestrator over already-planned jobs
    pub fn new(
        jobs: Vec<JobSpec>,
        pool: CorePool,
        backend: Arc<dyn JobBackend>,
        source: Arc<dyn ProgressSource>,
        output: PathBuf,
        options: OrchestratorOptions,
    ) -> Self {
        let statuses = vec![JobStatus::Pending; jobs.len()];
        let (progress_tx, _) = watch::channel(ProgressSnapshot::default());

        Self {
            id: Uuid::new_v4(),
            jobs,
            statuses,
            running: HashMap::new(),
            dispatcher: Dispatcher::new(pool.shared(), backend),
            source,
            output,
            options,
            progress_tx,
        }
    }

    /// Build an orchestrator from a campaign configuration
    ///
    /// Fails before anything runs when the campaign root or source stage is
    /// missing or the core range is invalid.
    pub fn from_config(config: &CampaignConfig, backend: Arc<dyn JobBackend>) -> FuzzDeployResult<Self> {
        config.validate()?;

        let layout = CampaignLayout::new(&config.root);
        layout.check_exists(match &config.matrix {
            Some(_) => None,
            None => config.stage.source.as_deref(),
        })?;

        let cores = resolve_cores(config.cores.as_deref(), detect_core_count())?;
        let pool = CorePool::new(cores)?;
        let jobs = plan_jobs(config, &layout)?;
        let source = Arc::new(StageProgress::new(layout.clone(), config.stage.clone()));

        let options = OrchestratorOptions {
            policy: config.policy,
            core_poll_interval: config.scheduling.core_poll_interval(),
            core_wait_timeout: config.scheduling.core_wait_timeout(),
            reap_interval: config.scheduling.reap_interval(),
            finish_marker: config.stage.finish_marker.clone(),
        };

        Ok(Self::new(
            jobs,
            pool,
            backend,
            source,
            layout.stage_dir(&config.stage.name),
            options,
        ))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Core pool shared with the dispatcher
    pub fn core_pool(&self) -> SharedCorePool {
        self.dispatcher.pool().clone()
    }

    /// Receiver of progress snapshots
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress_tx.subscribe()
    }

    /// Current status of every job
    pub fn statuses(&self) -> Vec<(JobKey, JobStatus)> {
        self.jobs
            .iter()
            .map(|j| j.key.clone())
            .zip(self.statuses.iter().copied())
            .collect()
    }

    /// Mark jobs whose output is already complete as skipped
    ///
    /// Returns the number of jobs skipped.
    pub fn classify(&mut self) -> usize {
        let mut skipped = 0;
        for (spec, status) in self.jobs.iter().zip(self.statuses.iter_mut()) {
            if *status == JobStatus::Pending && self.source.is_satisfied(&spec.key) {
                *status = JobStatus::Skipped;
                skipped += 1;
                info!(job = %spec.key, "Output already complete, skipping");
            }
        }
        skipped
    }

    /// Fail unless the backend knows every environment still needed
    async fn check_environments(&self) -> FuzzDeployResult<()> {
        let images: BTreeSet<&str> = self
            .jobs
            .iter()
            .zip(&self.statuses)
            .filter(|(_, s)| **s == JobStatus::Pending)
            .map(|(j, _)| j.launch.image.as_str())
            .collect();

        let backend = self.dispatcher.backend();
        for image in images {
            match backend.has_environment(image).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(FuzzDeployError::Precondition(format!(
                        "{} environment {} not found",
                        backend.name(),
                        image
                    )))
                }
                Err(e) => {
                    return Err(FuzzDeployError::Precondition(format!(
                        "Cannot check environment {}: {}",
                        image, e
                    )))
                }
            }
        }
        Ok(())
    }

    /// Run the campaign until every job is finished or `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> FuzzDeployResult<CampaignReport> {
        let total_cores = self.dispatcher.pool().lock().await.total();
        info!(
            campaign = %self.id,
            jobs = self.jobs.len(),
            cores = total_cores,
            policy = %self.options.policy,
            output = %self.output.display(),
            "Campaign starting"
        );

        let skipped = self.classify();
        self.check_environments().await?;

        let keys: Vec<JobKey> = self.jobs.iter().map(|j| j.key.clone()).collect();
        let mut tracker = ProgressTracker::new(self.source.clone(), &keys);
        self.progress_tx.send_replace(tracker.snapshot());
        info!(
            skipped = skipped,
            expected = tracker.snapshot().total,
            "Jobs classified"
        );

        for index in 0..self.jobs.len() {
            if self.statuses[index] != JobStatus::Pending {
                continue;
            }
            if cancel.is_cancelled() {
                return Ok(self.cancel_campaign(&mut tracker).await);
            }

            let spec = self.jobs[index].clone();
            let min_cores = spec.min_cores as usize;
            if min_cores > total_cores {
                let err = FuzzDeployError::ResourceExhausted(format!(
                    "{} needs {} cores, the pool holds {}",
                    spec.key, min_cores, total_cores
                ));
                error!(job = %spec.key, error = %err, "Job can never be scheduled");
                self.statuses[index] = JobStatus::Failed;
                continue;
            }

            if let Err(e) = std::fs::create_dir_all(&spec.launch.output_dir) {
                error!(job = %spec.key, error = %e, "Cannot create output directory");
                self.statuses[index] = JobStatus::Failed;
                continue;
            }

            self.statuses[index] = JobStatus::CoreWait;
            let mut waiting_since = Instant::now();
            let grant = loop {
                self.reap().await;
                self.report_progress(&mut tracker);

                // One poll interval per round so exited workers are reaped
                // before the next attempt
                let attempt = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    grant = self.dispatcher.acquire_cores_for(
                        &spec,
                        min_cores,
                        self.options.core_poll_interval,
                        self.options.core_poll_interval,
                    ) => Some(grant),
                };

                match attempt {
                    None => return Ok(self.cancel_campaign(&mut tracker).await),
                    Some(Some(grant)) => break grant,
                    Some(None) => {
                        if waiting_since.elapsed() >= self.options.core_wait_timeout {
                            info!(
                                job = %spec.key,
                                cores = min_cores,
                                running = self.dispatcher.active_count(),
                                "Still waiting for free cores"
                            );
                            waiting_since = Instant::now();
                        }
                    }
                }
            };

            match self.dispatcher.launch(spec, grant).await {
                Ok(job) => {
                    self.running.insert(job.handle.clone(), index);
                    self.statuses[index] = JobStatus::Running;
                }
                Err(e) => {
                    error!(error = %e, "Job launch failed, continuing with remaining jobs");
                    self.statuses[index] = JobStatus::Failed;
                }
            }
        }

        info!(running = self.dispatcher.active_count(), "All jobs launched, draining");

        loop {
            self.reap().await;
            if self.dispatcher.active_count() == 0 {
                break;
            }
            self.dispatcher.rebalance(self.options.policy).await;
            self.report_progress(&mut tracker);

            let interrupted = tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(self.options.reap_interval) => false,
            };
            if interrupted {
                return Ok(self.cancel_campaign(&mut tracker).await);
            }
        }

        self.report_progress(&mut tracker);
        info!(
            campaign = %self.id,
            progress = %tracker.snapshot(),
            "All DONE! The results can be found in {}",
            self.output.display()
        );

        Ok(self.report(&tracker, false))
    }

    async fn reap(&mut self) {
        let finished = self.dispatcher.reap_finished().await;
        if let Some(marker) = &self.options.finish_marker {
            for job in &finished {
                write_finish_marker(job, marker);
            }
        }
        self.mark(finished, JobStatus::Done);
    }

    fn mark(&mut self, jobs: Vec<RunningJob>, status: JobStatus) {
        for job in jobs {
            if let Some(index) = self.running.remove(&job.handle) {
                self.statuses[index] = status;
            }
        }
    }

    fn report_progress(&self, tracker: &mut ProgressTracker) {
        if tracker.poll_deltas() > 0 {
            let snapshot = tracker.snapshot();
            info!(
                completed = snapshot.completed,
                total = snapshot.total,
                "Progress"
            );
            self.progress_tx.send_replace(snapshot);
        }
    }

    async fn cancel_campaign(mut self, tracker: &mut ProgressTracker) -> CampaignReport {
        warn!(campaign = %self.id, "Interrupted, removing running workers");

        let stopped = self.dispatcher.cancel_all().await;
        self.mark(stopped, JobStatus::Cancelled);
        for status in self.statuses.iter_mut() {
            if !status.is_terminal() {
                *status = JobStatus::Cancelled;
            }
        }

        tracker.poll_deltas();
        info!(
            campaign = %self.id,
            "Workers removed. The results can be found in {}",
            self.output.display()
        );

        self.report(tracker, true)
    }

    fn report(&self, tracker: &ProgressTracker, interrupted: bool) -> CampaignReport {
        let progress = tracker.snapshot();
        self.progress_tx.send_replace(progress);

        CampaignReport {
            id: self.id,
            output: self.output.clone(),
            jobs: self.statuses(),
            progress,
            interrupted,
        }
    }
}

fn write_finish_marker(job: &RunningJob, marker: &str) {
    let path = job.spec.launch.output_dir.join(marker);
    let contents = format!(
        "started: {}\nfinished: {}\n",
        job.started_at.to_rfc3339(),
        Utc::now().to_rfc3339()
    );
    if let Err(e) = std::fs::write(&path, contents) {
        warn!(
            job = %job.spec.key,
            path = %path.display(),
            error = %e,
            "Cannot write finish marker, the job will run again on resume"
        );
    }
}
