//! Configuration types for fuzzdeploy

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::{FuzzDeployError, FuzzDeployResult};

/// Campaign configuration file (TOML)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    /// Campaign root; stages live in `<root>/<stage>/<fuzzer>/<target>/<repeat>`
    pub root: PathBuf,
    /// Core rebalancing policy
    pub policy: RebalancePolicy,
    /// Explicit core range (e.g., "0-7,12"); all cores but one when absent
    pub cores: Option<String>,
    /// Parameter matrix; jobs are discovered from `stage.source` when absent
    pub matrix: Option<MatrixConfig>,
    /// Stage to run
    pub stage: StageConfig,
    /// Scheduling loop timings
    pub scheduling: SchedulingConfig,
    /// Job backend settings
    pub backend: BackendConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("workdir"),
            policy: RebalancePolicy::Per,
            cores: None,
            matrix: None,
            stage: StageConfig::default(),
            scheduling: SchedulingConfig::default(),
            backend: BackendConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CampaignConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> FuzzDeployResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FuzzDeployError::Config(format!("Failed to read config file: {}", e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| FuzzDeployError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for contradictions
    pub fn validate(&self) -> FuzzDeployResult<()> {
        if self.stage.name.trim().is_empty() {
            return Err(FuzzDeployError::Config("stage.name should not be empty".into()));
        }
        if self.stage.image.trim().is_empty() {
            return Err(FuzzDeployError::Config("stage.image should not be empty".into()));
        }

        match &self.matrix {
            Some(matrix) => {
                if matrix.fuzzers.is_empty() {
                    return Err(FuzzDeployError::Config(
                        "matrix.fuzzers should contain one fuzzer at least".into(),
                    ));
                }
                if matrix.targets.is_empty() {
                    return Err(FuzzDeployError::Config(
                        "matrix.targets should contain one target at least".into(),
                    ));
                }
                if matrix.repeats.indices().is_empty() {
                    return Err(FuzzDeployError::Config(
                        "matrix.repeats should contain one repeat at least".into(),
                    ));
                }
            }
            None if self.stage.source.is_none() => {
                return Err(FuzzDeployError::Config(
                    "either [matrix] or stage.source is required to enumerate jobs".into(),
                ));
            }
            None => {}
        }

        Ok(())
    }
}

/// How free cores are handed out once jobs are running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalancePolicy {
    /// A job keeps its launch allocation until it exits
    #[default]
    Per,
    /// Free cores are redistributed to the running jobs holding the fewest
    All,
}

impl std::fmt::Display for RebalancePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RebalancePolicy::Per => write!(f, "per"),
            RebalancePolicy::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for RebalancePolicy {
    type Err = FuzzDeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "per" => Ok(RebalancePolicy::Per),
            "all" => Ok(RebalancePolicy::All),
            other => Err(FuzzDeployError::Config(format!(
                "Unknown policy '{}', expected 'per' or 'all'",
                other
            ))),
        }
    }
}

/// Cross product of campaign parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Fuzzer names
    pub fuzzers: Vec<String>,
    /// Target names mapped to their launch arguments
    pub targets: BTreeMap<String, String>,
    /// Per-fuzzer, per-target fuzzer arguments
    pub fuzzer_args: BTreeMap<String, BTreeMap<String, String>>,
    /// Repeats, as a count or an explicit list of indices
    pub repeats: Repeats,
    /// Fuzzing timeout handed to each worker
    pub timeout: String,
}

impl MatrixConfig {
    /// Arguments for `fuzzer` on `target`, empty when unset
    pub fn fuzzer_args_for(&self, fuzzer: &str, target: &str) -> &str {
        self.fuzzer_args
            .get(fuzzer)
            .and_then(|t| t.get(target))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Repeat specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Repeats {
    /// Indices `1..=n`
    Count(u32),
    /// Explicit indices
    List(Vec<String>),
}

impl Default for Repeats {
    fn default() -> Self {
        Repeats::Count(1)
    }
}

impl Repeats {
    /// Repeat indices as directory names
    pub fn indices(&self) -> Vec<String> {
        match self {
            Repeats::Count(n) => (1..=*n).map(|i| i.to_string()).collect(),
            Repeats::List(list) => list.clone(),
        }
    }
}

/// File the scheduler writes into a fuzzing job's directory once its worker exits
pub const FINISH_MARKER: &str = ".fuzzdeploy_finished";

/// Stage definition: what a job runs and how its output is counted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Output directory name under the campaign root (e.g., "ar")
    pub name: String,
    /// Environment selector template (e.g., "{fuzzer}/{target}")
    pub image: String,
    /// Command run in the environment
    pub entrypoint: String,
    /// Stage whose job directory is mounted at `/shared`
    pub source: Option<String>,
    /// Where this stage's own output directory is mounted
    pub mount_point: Option<String>,
    /// Environment templates
    pub env: BTreeMap<String, String>,
    /// Units a job is expected to produce
    pub expected: CountRule,
    /// Units a job has produced so far
    pub completed: CountRule,
    /// Entry that must exist for a job with matching counts to be skipped
    pub done_marker: Option<String>,
    /// File the scheduler writes into a job's output directory when its
    /// worker exits on its own; never written for cancelled jobs
    pub finish_marker: Option<String>,
    /// Cores each job needs at launch
    pub min_cores: u32,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::fuzzing()
    }
}

impl StageConfig {
    /// Fuzzing stage writing into `ar`
    pub fn fuzzing() -> Self {
        let mut env = BTreeMap::new();
        env.insert("FUZZER_ARGS".to_string(), "{fuzzer_args}".to_string());
        env.insert("TARGET_ARGS".to_string(), "{target_args}".to_string());
        env.insert("TIMEOUT".to_string(), "{timeout}".to_string());

        Self {
            name: "ar".to_string(),
            image: "{fuzzer}/{target}".to_string(),
            entrypoint: "${SRC}/run.sh".to_string(),
            source: None,
            mount_point: None,
            env,
            expected: CountRule::Fixed { count: 1 },
            // fuzzer_stats appears right after startup; only a finished run counts
            completed: CountRule::Marker {
                stage: None,
                name: FINISH_MARKER.to_string(),
            },
            done_marker: None,
            finish_marker: Some(FINISH_MARKER.to_string()),
            min_cores: 1,
        }
    }

    /// Crash triage stage over the fuzzing output
    pub fn triage(base: &str) -> Self {
        Self {
            name: "triage_by_casr".to_string(),
            image: format!("{}/{{target}}", base),
            entrypoint: "${SRC}/triage_by_casr.sh".to_string(),
            source: Some("ar".to_string()),
            mount_point: None,
            env: BTreeMap::new(),
            expected: CountRule::Search {
                stage: Some("ar".to_string()),
                dir: "crashes".to_string(),
                exclude: vec!["README.txt".to_string()],
            },
            completed: CountRule::Dirs {
                stage: None,
                dirs: vec!["failed".to_string(), "reports".to_string()],
                exclude: Vec::new(),
            },
            done_marker: Some("summary_by_unique_line".to_string()),
            finish_marker: None,
            min_cores: 1,
        }
    }

    /// Mount point of this stage's output inside a worker
    pub fn output_mount(&self) -> String {
        match (&self.mount_point, &self.source) {
            (Some(mount), _) => mount.clone(),
            (None, Some(_)) => format!("/{}", self.name),
            (None, None) => "/shared".to_string(),
        }
    }
}

/// How to count units for a job from its directory tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CountRule {
    /// A constant
    Fixed { count: u64 },
    /// Entries of the first directory named `dir` beneath the job directory
    Search {
        stage: Option<String>,
        dir: String,
        #[serde(default)]
        exclude: Vec<String>,
    },
    /// Sum of entries in the named immediate subdirectories
    Dirs {
        stage: Option<String>,
        dirs: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
    /// One when an entry named `name` exists beneath the job directory
    Marker { stage: Option<String>, name: String },
}

/// Scheduling loop timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Sleep between core acquisition attempts
    pub core_poll_interval_ms: u64,
    /// Log a still-waiting job again after this long
    pub core_wait_timeout_ms: u64,
    /// Interval between liveness polls once every job is launched
    pub reap_interval_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            core_poll_interval_ms: 1000,
            core_wait_timeout_ms: 10_000,
            reap_interval_ms: 5000,
        }
    }
}

impl SchedulingConfig {
    pub fn core_poll_interval(&self) -> Duration {
        Duration::from_millis(self.core_poll_interval_ms)
    }

    pub fn core_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.core_wait_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Job backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend type
    pub kind: BackendKind,
    /// Docker settings
    pub docker: DockerSettings,
    /// Local process settings
    pub process: ProcessSettings,
}

/// Backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Workers are docker containers
    #[default]
    Docker,
    /// Workers are local child processes
    Process,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Docker => write!(f, "docker"),
            BackendKind::Process => write!(f, "process"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = FuzzDeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "process" => Ok(BackendKind::Process),
            other => Err(FuzzDeployError::Config(format!(
                "Unknown backend '{}', expected 'docker' or 'process'",
                other
            ))),
        }
    }
}

/// Docker backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// Path to the docker binary
    pub docker_path: PathBuf,
    /// Run containers with `--privileged`
    pub privileged: bool,
    /// Run containers with `--network=none`
    pub network_disabled: bool,
    /// Capabilities to add
    pub cap_add: Vec<String>,
    /// Security options
    pub security_opt: Vec<String>,
    /// Additional `docker run` arguments
    pub extra_args: Vec<String>,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            docker_path: PathBuf::from("docker"),
            privileged: false,
            network_disabled: true,
            cap_add: vec!["SYS_PTRACE".to_string()],
            security_opt: vec!["seccomp=unconfined".to_string()],
            extra_args: Vec::new(),
        }
    }
}

/// Local process backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Shell used to run entrypoints
    pub shell: PathBuf,
    /// Pin workers with `taskset`
    pub pin_with_taskset: bool,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("sh"),
            pin_with_taskset: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_campaign_config() {
        let config = CampaignConfig::default();
        assert_eq!(config.policy, RebalancePolicy::Per);
        assert_eq!(config.stage.name, "ar");
        assert_eq!(config.backend.kind, BackendKind::Docker);
        assert_eq!(config.scheduling.core_wait_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_campaign_config_parse() {
        let toml_str = r#"
root = "/srv/campaign"
policy = "all"
cores = "0-3"

[matrix]
fuzzers = ["aflplusplus", "htfuzz"]
repeats = 3
timeout = "86400"

[matrix.targets]
libxml2 = "@@"
readelf = "-a @@"

[matrix.fuzzer_args.aflplusplus]
libxml2 = "-m none"

[scheduling]
core_poll_interval_ms = 500
"#;
        let config: CampaignConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.policy, RebalancePolicy::All);
        assert_eq!(config.cores.as_deref(), Some("0-3"));
        let matrix = config.matrix.unwrap();
        assert_eq!(matrix.repeats.indices(), vec!["1", "2", "3"]);
        assert_eq!(matrix.fuzzer_args_for("aflplusplus", "libxml2"), "-m none");
        assert_eq!(matrix.fuzzer_args_for("htfuzz", "libxml2"), "");
        assert_eq!(config.scheduling.core_poll_interval_ms, 500);
        assert_eq!(config.scheduling.reap_interval_ms, 5000);
    }

    #[test]
    fn test_stage_count_rules_parse() {
        let toml_str = r#"
root = "/srv/campaign"

[stage]
name = "triage_by_casr"
image = "casr/{target}"
entrypoint = "${SRC}/triage_by_casr.sh"
source = "ar"
done_marker = "summary_by_unique_line"

[stage.expected]
kind = "search"
stage = "ar"
dir = "crashes"
exclude = ["README.txt"]

[stage.completed]
kind = "dirs"
dirs = ["failed", "reports"]
"#;
        let config: CampaignConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.stage.output_mount(), "/triage_by_casr");
        assert_eq!(config.stage.expected, StageConfig::triage("casr").expected);
        assert_eq!(config.stage.completed, StageConfig::triage("casr").completed);
    }

    #[test]
    fn test_fuzzing_completes_on_finish_marker() {
        let stage = StageConfig::fuzzing();
        assert_eq!(stage.finish_marker.as_deref(), Some(FINISH_MARKER));
        assert_eq!(
            stage.completed,
            CountRule::Marker {
                stage: None,
                name: FINISH_MARKER.to_string(),
            }
        );
        assert!(StageConfig::triage("casr").finish_marker.is_none());
    }

    #[test]
    fn test_repeat_list() {
        let repeats: Repeats = serde_json::from_str(r#"["2", "5"]"#).unwrap();
        assert_eq!(repeats.indices(), vec!["2", "5"]);
    }

    #[test]
    fn test_validate_requires_job_source() {
        let config = CampaignConfig::default();
        assert!(config.validate().is_err());

        let mut config = CampaignConfig::default();
        config.matrix = Some(MatrixConfig {
            fuzzers: vec!["aflplusplus".into()],
            targets: BTreeMap::new(),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("ALL".parse::<RebalancePolicy>().unwrap(), RebalancePolicy::All);
        assert_eq!("per".parse::<RebalancePolicy>().unwrap(), RebalancePolicy::Per);
        assert!("some".parse::<RebalancePolicy>().is_err());
        assert_eq!("process".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert!("podman".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_fuzzing_stage_mount() {
        assert_eq!(StageConfig::fuzzing().output_mount(), "/shared");
    }
}
