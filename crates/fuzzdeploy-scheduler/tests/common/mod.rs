#![allow(dead_code)]

use async_trait::async_trait;
use fuzzdeploy_core::{
    CoreId, FuzzDeployError, FuzzDeployResult, JobHandle, JobKey, JobSpec, LaunchParams,
};
use fuzzdeploy_runtime::JobBackend;
use fuzzdeploy_scheduler::ProgressSource;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct FakeJob {
    key: JobKey,
    cores: Vec<CoreId>,
    started: Instant,
    stopped: bool,
}

#[derive(Default)]
struct FakeState {
    next: u64,
    jobs: HashMap<JobHandle, FakeJob>,
    started: Vec<(JobKey, Vec<CoreId>)>,
    terminated: Vec<JobHandle>,
    affinity: Vec<(JobKey, Vec<CoreId>)>,
    overlaps: Vec<CoreId>,
}

/// In-memory backend recording every call
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    lifetime: Option<Duration>,
    failing_targets: HashSet<String>,
    missing_images: HashSet<String>,
}

impl FakeBackend {
    /// Jobs run until finished or terminated
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs exit on their own after `lifetime`
    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            lifetime: Some(lifetime),
            ..Self::default()
        }
    }

    pub fn failing_target(mut self, target: &str) -> Self {
        self.failing_targets.insert(target.to_string());
        self
    }

    pub fn missing_image(mut self, image: &str) -> Self {
        self.missing_images.insert(image.to_string());
        self
    }

    fn alive(&self, job: &FakeJob) -> bool {
        !job.stopped
            && self
                .lifetime
                .map_or(true, |lifetime| job.started.elapsed() < lifetime)
    }

    /// Record cores that a live job other than `except` already uses
    fn check_overlap(&self, state: &mut FakeState, except: Option<&JobHandle>, cores: &[CoreId]) {
        let busy: HashSet<CoreId> = state
            .jobs
            .iter()
            .filter(|(handle, job)| Some(*handle) != except && self.alive(job))
            .flat_map(|(_, job)| job.cores.iter().copied())
            .collect();
        let overlaps: Vec<CoreId> = cores.iter().copied().filter(|c| busy.contains(c)).collect();
        state.overlaps.extend(overlaps);
    }

    /// Make the job for `key` exit
    pub fn finish(&self, key: &JobKey) {
        let mut state = self.state.lock().unwrap();
        for job in state.jobs.values_mut() {
            if &job.key == key {
                job.stopped = true;
            }
        }
    }

    pub fn finish_all(&self) {
        let mut state = self.state.lock().unwrap();
        for job in state.jobs.values_mut() {
            job.stopped = true;
        }
    }

    /// Keys in start order with their initial cores
    pub fn started(&self) -> Vec<(JobKey, Vec<CoreId>)> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn started_keys(&self) -> Vec<JobKey> {
        self.started().into_iter().map(|(key, _)| key).collect()
    }

    pub fn terminated(&self) -> Vec<JobHandle> {
        self.state.lock().unwrap().terminated.clone()
    }

    pub fn affinity_updates(&self) -> Vec<(JobKey, Vec<CoreId>)> {
        self.state.lock().unwrap().affinity.clone()
    }

    pub fn running_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.jobs.values().filter(|job| self.alive(job)).count()
    }

    /// Cores handed to a job while another live job held them
    pub fn overlaps(&self) -> Vec<CoreId> {
        self.state.lock().unwrap().overlaps.clone()
    }
}

#[async_trait]
impl JobBackend for FakeBackend {
    async fn start(&self, spec: &JobSpec, cores: &[CoreId]) -> FuzzDeployResult<JobHandle> {
        if self.failing_targets.contains(&spec.key.target) {
            return Err(FuzzDeployError::Launch {
                job: spec.key.to_string(),
                reason: "target environment broken".to_string(),
            });
        }

        let mut state = self.state.lock().unwrap();
        self.check_overlap(&mut state, None, cores);

        state.next += 1;
        let handle = JobHandle(format!("fake-{:04}", state.next));
        state.jobs.insert(
            handle.clone(),
            FakeJob {
                key: spec.key.clone(),
                cores: cores.to_vec(),
                started: Instant::now(),
                stopped: false,
            },
        );
        state.started.push((spec.key.clone(), cores.to_vec()));
        Ok(handle)
    }

    async fn is_running(&self, handle: &JobHandle) -> FuzzDeployResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.get(handle).map_or(false, |job| self.alive(job)))
    }

    async fn terminate(&self, handle: &JobHandle) -> FuzzDeployResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(handle) {
            job.stopped = true;
        }
        state.terminated.push(handle.clone());
        Ok(())
    }

    async fn update_affinity(&self, handle: &JobHandle, cores: &[CoreId]) -> FuzzDeployResult<()> {
        let mut state = self.state.lock().unwrap();
        self.check_overlap(&mut state, Some(handle), cores);

        let key = match state.jobs.get_mut(handle) {
            Some(job) => {
                job.cores = cores.to_vec();
                job.key.clone()
            }
            None => return Err(FuzzDeployError::Backend(format!("unknown handle {}", handle))),
        };
        state.affinity.push((key, cores.to_vec()));
        Ok(())
    }

    async fn has_environment(&self, image: &str) -> FuzzDeployResult<bool> {
        Ok(!self.missing_images.contains(image))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Progress counts set by the test
#[derive(Default)]
pub struct FakeProgress {
    counts: Mutex<HashMap<JobKey, (u64, u64)>>,
}

impl FakeProgress {
    pub fn set(&self, key: &JobKey, expected: u64, completed: u64) {
        self.counts
            .lock()
            .unwrap()
            .insert(key.clone(), (expected, completed));
    }
}

impl ProgressSource for FakeProgress {
    fn expected(&self, key: &JobKey) -> Option<u64> {
        self.counts.lock().unwrap().get(key).map(|c| c.0)
    }

    fn completed(&self, key: &JobKey) -> Option<u64> {
        self.counts.lock().unwrap().get(key).map(|c| c.1)
    }
}

pub fn key(target: &str) -> JobKey {
    JobKey::new("aflplusplus", target, "1")
}

/// Job for `target` writing below `root`
pub fn job(root: &Path, target: &str) -> JobSpec {
    let key = key(target);
    let launch = LaunchParams {
        image: format!("{}/{}", key.fuzzer, key.target),
        entrypoint: "${SRC}/run.sh".to_string(),
        output_dir: root
            .join("ar")
            .join(&key.fuzzer)
            .join(&key.target)
            .join(&key.repeat),
        ..Default::default()
    };
    JobSpec::new(key, launch)
}

pub fn cores(count: u32) -> Vec<CoreId> {
    (0..count).map(CoreId).collect()
}

/// Let the paused clock run until `cond` holds
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached");
}
