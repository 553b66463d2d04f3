//! Dispatching jobs onto cores and reaping them when they exit

use chrono::{DateTime, Utc};
use futures::future::join_all;
use fuzzdeploy_core::{
    format_core_list, CoreId, FuzzDeployError, FuzzDeployResult, JobHandle, JobSpec,
    RebalancePolicy,
};
use fuzzdeploy_runtime::JobBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core_pool::{CoreGrant, LeaseId, SharedCorePool};

/// A job whose worker has been started
#[derive(Debug, Clone)]
pub struct RunningJob {
    /// Unique identifier of this run
    pub id: Uuid,
    /// What was launched
    pub spec: JobSpec,
    /// Backend handle of the worker
    pub handle: JobHandle,
    /// Core lease backing `cores`
    pub lease: LeaseId,
    /// Cores currently assigned
    pub cores: Vec<CoreId>,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
}

/// Dispatcher binds pending jobs to cores and tracks their workers
pub struct Dispatcher {
    /// Core pool
    pool: SharedCorePool,
    /// Job backend
    backend: Arc<dyn JobBackend>,
    /// Running jobs in launch order
    active: Vec<RunningJob>,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(pool: SharedCorePool, backend: Arc<dyn JobBackend>) -> Self {
        Self {
            pool,
            backend,
            active: Vec::new(),
        }
    }

    /// Core pool used by this dispatcher
    pub fn pool(&self) -> &SharedCorePool {
        &self.pool
    }

    /// Job backend used by this dispatcher
    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.backend
    }

    /// Running jobs in launch order
    pub fn active(&self) -> &[RunningJob] {
        &self.active
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Wait up to `timeout` for `min_cores` free cores
    ///
    /// Retries every `poll_interval`. Returns `None` once the timeout elapses
    /// so the caller can reap and report progress before trying again.
    pub async fn acquire_cores_for(
        &self,
        spec: &JobSpec,
        min_cores: usize,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Option<CoreGrant> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(grant) = self.pool.lock().await.try_acquire(min_cores) {
                return Some(grant);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(job = %spec.key, cores = min_cores, "No free cores before timeout");
                return None;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Start a worker for `spec` on the granted cores
    ///
    /// On failure the cores go back to the pool and the error is scoped to
    /// this job.
    pub async fn launch(&mut self, spec: JobSpec, grant: CoreGrant) -> FuzzDeployResult<&RunningJob> {
        match self.backend.start(&spec, &grant.cores).await {
            Ok(handle) => {
                info!(
                    handle = %handle.short(),
                    fuzzer = %spec.key.fuzzer,
                    target = %spec.key.target,
                    repeat = %spec.key.repeat,
                    cores = %format_core_list(&grant.cores),
                    "Job started"
                );

                self.active.push(RunningJob {
                    id: Uuid::new_v4(),
                    spec,
                    handle,
                    lease: grant.lease,
                    cores: grant.cores,
                    started_at: Utc::now(),
                });
                self.active
                    .last()
                    .ok_or_else(|| FuzzDeployError::Internal("running job vanished".to_string()))
            }
            Err(e) => {
                self.pool.lock().await.release(&grant.cores);
                warn!(job = %spec.key, error = %e, "Failed to start job");

                Err(match e {
                    FuzzDeployError::Launch { .. } => e,
                    other => FuzzDeployError::Launch {
                        job: spec.key.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Remove jobs whose workers exited and return their cores to the pool
    ///
    /// A job whose liveness cannot be queried is kept; its cores are never
    /// released while the worker might still run.
    pub async fn reap_finished(&mut self) -> Vec<RunningJob> {
        let mut exited = Vec::new();

        for (index, job) in self.active.iter().enumerate() {
            match self.backend.is_running(&job.handle).await {
                Ok(true) => {}
                Ok(false) => exited.push(index),
                Err(e) => {
                    warn!(
                        handle = %job.handle.short(),
                        job = %job.spec.key,
                        error = %e,
                        "Liveness query failed"
                    );
                }
            }
        }

        let mut finished = Vec::with_capacity(exited.len());
        if exited.is_empty() {
            return finished;
        }

        let mut pool = self.pool.lock().await;
        for index in exited.into_iter().rev() {
            let job = self.active.remove(index);
            pool.release(&job.cores);
            info!(
                handle = %job.handle.short(),
                job = %job.spec.key,
                cores = %format_core_list(&job.cores),
                "Job finished"
            );
            finished.push(job);
        }
        finished.reverse();

        finished
    }

    /// Terminate every running job and release all held cores
    ///
    /// Backend errors are logged; cores are released regardless.
    pub async fn cancel_all(&mut self) -> Vec<RunningJob> {
        let jobs = std::mem::take(&mut self.active);
        if jobs.is_empty() {
            return jobs;
        }

        let results = join_all(jobs.iter().map(|job| self.backend.terminate(&job.handle))).await;
        for (job, result) in jobs.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    handle = %job.handle.short(),
                    job = %job.spec.key,
                    error = %e,
                    "Failed to terminate job"
                );
            }
        }

        let mut pool = self.pool.lock().await;
        for job in &jobs {
            pool.release(&job.cores);
        }

        info!(jobs = jobs.len(), "Cancelled running jobs");
        jobs
    }

    /// Hand free cores to running jobs per `policy` and hint the backend
    ///
    /// Returns the number of jobs whose cores changed. Affinity hints that
    /// the backend rejects are logged and otherwise ignored.
    pub async fn rebalance(&mut self, policy: RebalancePolicy) -> usize {
        let moves = self.pool.lock().await.rebalance_once(policy);
        let mut changed = 0;

        for mv in moves {
            let Some(job) = self.active.iter_mut().find(|j| j.lease == mv.lease) else {
                debug!(lease = %mv.lease, "Rebalanced lease has no running job");
                continue;
            };

            job.cores = mv.cores;
            changed += 1;

            if let Err(e) = self.backend.update_affinity(&job.handle, &job.cores).await {
                warn!(
                    handle = %job.handle.short(),
                    cores = %format_core_list(&job.cores),
                    error = %e,
                    "Affinity update not applied"
                );
            } else {
                info!(
                    handle = %job.handle.short(),
                    job = %job.spec.key,
                    cores = %format_core_list(&job.cores),
                    "Job cores extended"
                );
            }
        }

        changed
    }
}
