//! Job, launch parameter and status type definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Identity of one (fuzzer, target, repeat) combination
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    /// Fuzzer name (e.g., "aflplusplus")
    pub fuzzer: String,
    /// Target name (e.g., "libxml2")
    pub target: String,
    /// Repeat index, kept textual as it names a directory
    pub repeat: String,
}

impl JobKey {
    /// Create a new job key
    pub fn new(
        fuzzer: impl Into<String>,
        target: impl Into<String>,
        repeat: impl Into<String>,
    ) -> Self {
        Self {
            fuzzer: fuzzer.into(),
            target: target.into(),
            repeat: repeat.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.fuzzer, self.target, self.repeat)
    }
}

/// Host directory bound into a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path
    pub host: PathBuf,
    /// Path inside the worker environment
    pub target: String,
}

/// Backend-specific launch parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    /// Environment selector (image name for docker)
    pub image: String,
    /// Command run inside the environment
    pub entrypoint: String,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Directory bindings
    pub mounts: Vec<Mount>,
    /// Output directory of this job; created before launch
    pub output_dir: PathBuf,
}

/// A job to schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job identity
    pub key: JobKey,
    /// How to start the worker
    pub launch: LaunchParams,
    /// Minimum number of cores the job needs (at least 1)
    pub min_cores: u32,
}

impl JobSpec {
    /// Create a job spec requiring a single core
    pub fn new(key: JobKey, launch: LaunchParams) -> Self {
        Self {
            key,
            launch,
            min_cores: 1,
        }
    }

    /// Set the minimum core requirement, never below one
    pub fn with_min_cores(mut self, min_cores: u32) -> Self {
        self.min_cores = min_cores.max(1);
        self
    }
}

/// Opaque handle returned by a job backend (container id, pid, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl JobHandle {
    /// Shortened form for log lines
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Campaign status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Enumerated, not yet considered for launch
    Pending,
    /// Waiting for free cores
    CoreWait,
    /// Worker is running
    Running,
    /// Worker exited
    Done,
    /// Output already satisfied by a previous run
    Skipped,
    /// Interrupted before finishing
    Cancelled,
    /// Backend refused to start the worker
    Failed,
}

impl JobStatus {
    /// Whether no further transition can happen
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Skipped | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "Pending"),
            JobStatus::CoreWait => write!(f, "CoreWait"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Done => write!(f, "Done"),
            JobStatus::Skipped => write!(f, "Skipped"),
            JobStatus::Cancelled => write!(f, "Cancelled"),
            JobStatus::Failed => write!(f, "Failed"),
        }
    }
}
