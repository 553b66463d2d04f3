//! CLI commands implementation

use anyhow::{Context, Result};
use clap::Args;
use fuzzdeploy_core::{
    default_core_range, detect_core_count, detect_cores, format_core_list, plan_jobs,
    BackendKind, CampaignConfig, CampaignLayout, JobStatus, MatrixConfig, RebalancePolicy,
    Repeats, StageConfig,
};
use fuzzdeploy_runtime::backend_from_config;
use fuzzdeploy_scheduler::{
    CampaignHandle, CampaignOrchestrator, CampaignReport, ProgressSnapshot, ProgressSource,
    StageProgress,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Exit status after an interrupt
pub const EXIT_INTERRUPTED: u8 = 130;

/// Flags that override values from the configuration
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Core range to run on (e.g., 0-7,12)
    #[arg(long)]
    pub cores: Option<String>,

    /// Core rebalancing policy (per, all)
    #[arg(long)]
    pub policy: Option<RebalancePolicy>,

    /// Job backend (docker, process)
    #[arg(long)]
    pub backend: Option<BackendKind>,
}

impl Overrides {
    pub fn apply(&self, config: &mut CampaignConfig) {
        if let Some(cores) = &self.cores {
            config.cores = Some(cores.clone());
        }
        if let Some(policy) = self.policy {
            config.policy = policy;
        }
        if let Some(backend) = self.backend {
            config.backend.kind = backend;
        }
    }
}

/// Parameters of a matrix fuzzing campaign
#[derive(Args, Debug, Clone)]
pub struct FuzzArgs {
    /// Campaign root
    #[arg(long, default_value = "workdir")]
    pub root: PathBuf,

    /// Fuzzer to run (repeatable)
    #[arg(long = "fuzzer", required = true)]
    pub fuzzers: Vec<String>,

    /// Target with its launch arguments, as NAME=ARGS (repeatable)
    #[arg(long = "target", required = true, value_parser = parse_target)]
    pub targets: Vec<(String, String)>,

    /// Fuzzer arguments for one target, as FUZZER:TARGET=ARGS (repeatable)
    #[arg(long = "fuzzer-args", value_parser = parse_fuzzer_args)]
    pub fuzzer_args: Vec<(String, String, String)>,

    /// Repeat count, or a comma separated list of repeat names
    #[arg(long, default_value = "1", value_parser = parse_repeats)]
    pub repeat: Repeats,

    /// Fuzzing timeout handed to each worker (e.g., 24h)
    #[arg(long)]
    pub timeout: String,
}

/// Parse `NAME=ARGS`; a bare `NAME` has empty arguments
pub fn parse_target(s: &str) -> Result<(String, String), String> {
    let (name, args) = s.split_once('=').unwrap_or((s, ""));
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("target '{}' has no name", s));
    }
    Ok((name.to_string(), args.to_string()))
}

/// Parse `FUZZER:TARGET=ARGS`
pub fn parse_fuzzer_args(s: &str) -> Result<(String, String, String), String> {
    let (selector, args) = s
        .split_once('=')
        .ok_or_else(|| format!("expected FUZZER:TARGET=ARGS, got '{}'", s))?;
    let (fuzzer, target) = selector
        .split_once(':')
        .ok_or_else(|| format!("expected FUZZER:TARGET before '=', got '{}'", selector))?;
    if fuzzer.trim().is_empty() || target.trim().is_empty() {
        return Err(format!("empty fuzzer or target in '{}'", s));
    }
    Ok((
        fuzzer.trim().to_string(),
        target.trim().to_string(),
        args.to_string(),
    ))
}

/// Parse a repeat count (`3`) or list (`1,2,5`)
pub fn parse_repeats(s: &str) -> Result<Repeats, String> {
    let s = s.trim();
    if s.contains(',') {
        let list: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from)
            .collect();
        if list.is_empty() {
            return Err("repeat list is empty".to_string());
        }
        return Ok(Repeats::List(list));
    }

    match s.parse::<u32>() {
        Ok(0) => Err("repeat count should be at least 1".to_string()),
        Ok(n) => Ok(Repeats::Count(n)),
        Err(_) if !s.is_empty() => Ok(Repeats::List(vec![s.to_string()])),
        Err(_) => Err("repeat is empty".to_string()),
    }
}

/// Campaign configuration for the default fuzzing stage
pub fn fuzz_config(args: FuzzArgs) -> CampaignConfig {
    let mut matrix = MatrixConfig {
        fuzzers: args.fuzzers,
        targets: args.targets.into_iter().collect(),
        repeats: args.repeat,
        timeout: args.timeout,
        ..MatrixConfig::default()
    };
    for (fuzzer, target, fuzzer_args) in args.fuzzer_args {
        matrix
            .fuzzer_args
            .entry(fuzzer)
            .or_default()
            .insert(target, fuzzer_args);
    }

    CampaignConfig {
        root: args.root,
        matrix: Some(matrix),
        stage: StageConfig::fuzzing(),
        ..CampaignConfig::default()
    }
}

/// Run a campaign until it drains or `cancel` fires
pub async fn run_campaign(config: CampaignConfig, cancel: CancellationToken) -> Result<ExitCode> {
    let backend = backend_from_config(&config.backend);
    let orchestrator = CampaignOrchestrator::from_config(&config, backend)?;

    let handle = CampaignHandle::spawn_with_token(orchestrator, cancel);
    let reporter = tokio::spawn(print_progress(handle.progress()));
    let result = handle.wait().await;
    reporter.abort();

    let report = result?;
    print_report(&report);

    if report.interrupted {
        Ok(ExitCode::from(EXIT_INTERRUPTED))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Run a matrix fuzzing campaign, creating the root if needed
pub async fn fuzz(args: FuzzArgs, overrides: &Overrides, cancel: CancellationToken) -> Result<ExitCode> {
    let mut config = fuzz_config(args);
    overrides.apply(&mut config);
    config.validate()?;

    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("Failed to create campaign root {}", config.root.display()))?;
    info!(root = %config.root.display(), "Campaign root ready");

    run_campaign(config, cancel).await
}

async fn print_progress(mut rx: watch::Receiver<ProgressSnapshot>) {
    while rx.changed().await.is_ok() {
        let snapshot = *rx.borrow_and_update();
        println!(
            "Progress: {} ({:.1}%)",
            snapshot,
            snapshot.fraction() * 100.0
        );
    }
}

fn print_report(report: &CampaignReport) {
    println!();
    if report.interrupted {
        println!("Campaign {} interrupted", report.id);
    } else {
        println!("Campaign {} finished", report.id);
    }
    for status in [
        JobStatus::Done,
        JobStatus::Skipped,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ] {
        let count = report.count(status);
        if count > 0 {
            println!("  {:<10} {}", status.to_string(), count);
        }
    }
    println!("  Progress:  {}", report.progress);
    println!("Results: {}", report.output.display());
}

/// Print every job with its classification without launching anything
pub fn plan(config: &CampaignConfig) -> Result<()> {
    config.validate()?;
    let layout = CampaignLayout::new(&config.root);
    let jobs = plan_jobs(config, &layout)?;
    let progress = StageProgress::new(layout, config.stage.clone());

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!(
        "{:<16} {:<20} {:<8} {:<6} {:<10} {}",
        "FUZZER", "TARGET", "REPEAT", "CORES", "STATUS", "IMAGE"
    );
    println!("{}", "-".repeat(90));

    let mut skipped = 0;
    for job in &jobs {
        let status = if progress.is_satisfied(&job.key) {
            skipped += 1;
            JobStatus::Skipped
        } else {
            JobStatus::Pending
        };
        println!(
            "{:<16} {:<20} {:<8} {:<6} {:<10} {}",
            job.key.fuzzer,
            job.key.target,
            job.key.repeat,
            job.min_cores,
            status.to_string(),
            job.launch.image
        );
    }

    println!();
    println!(
        "{} jobs: {} pending, {} skipped",
        jobs.len(),
        jobs.len() - skipped,
        skipped
    );
    Ok(())
}

/// Show core information
pub fn cores() {
    let available = detect_core_count();
    println!("Cores: {} online", available);
    println!("  Detected:      {}", format_core_list(&detect_cores()));
    println!(
        "  Default range: {}",
        format_core_list(&default_core_range(available))
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("libxml2=@@ -x").unwrap(),
            ("libxml2".to_string(), "@@ -x".to_string())
        );
        assert_eq!(
            parse_target("sqlite3").unwrap(),
            ("sqlite3".to_string(), String::new())
        );
        assert!(parse_target("=args").is_err());
    }

    #[test]
    fn test_parse_fuzzer_args() {
        assert_eq!(
            parse_fuzzer_args("aflplusplus:libxml2=-x xml.dict").unwrap(),
            (
                "aflplusplus".to_string(),
                "libxml2".to_string(),
                "-x xml.dict".to_string()
            )
        );
        assert!(parse_fuzzer_args("aflplusplus=-x").is_err());
        assert!(parse_fuzzer_args("aflplusplus:libxml2").is_err());
    }

    #[test]
    fn test_parse_repeats() {
        assert_eq!(parse_repeats("3").unwrap(), Repeats::Count(3));
        assert_eq!(
            parse_repeats("1, 4,").unwrap(),
            Repeats::List(vec!["1".to_string(), "4".to_string()])
        );
        assert_eq!(
            parse_repeats("rerun").unwrap(),
            Repeats::List(vec!["rerun".to_string()])
        );
        assert!(parse_repeats("0").is_err());
        assert!(parse_repeats(",").is_err());
    }

    #[test]
    fn test_fuzz_config() {
        let args = FuzzArgs {
            root: PathBuf::from("/tmp/campaign"),
            fuzzers: vec!["aflplusplus".to_string(), "honggfuzz".to_string()],
            targets: vec![("libxml2".to_string(), "@@".to_string())],
            fuzzer_args: vec![(
                "aflplusplus".to_string(),
                "libxml2".to_string(),
                "-x xml.dict".to_string(),
            )],
            repeat: Repeats::Count(2),
            timeout: "1h".to_string(),
        };

        let config = fuzz_config(args);
        config.validate().unwrap();
        let matrix = config.matrix.as_ref().unwrap();
        assert_eq!(matrix.fuzzer_args_for("aflplusplus", "libxml2"), "-x xml.dict");
        assert_eq!(matrix.fuzzer_args_for("honggfuzz", "libxml2"), "");
        assert_eq!(matrix.targets["libxml2"], "@@");
        assert_eq!(config.stage.name, "ar");
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = CampaignConfig::default();
        Overrides::default().apply(&mut config);
        assert_eq!(config.cores, None);
        assert_eq!(config.policy, RebalancePolicy::Per);

        let overrides = Overrides {
            cores: Some("0-3".to_string()),
            policy: Some(RebalancePolicy::All),
            backend: Some(BackendKind::Process),
        };
        overrides.apply(&mut config);
        assert_eq!(config.cores.as_deref(), Some("0-3"));
        assert_eq!(config.policy, RebalancePolicy::All);
        assert_eq!(config.backend.kind, BackendKind::Process);
    }

    #[test]
    fn test_plan_lists_matrix_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let args = FuzzArgs {
            root: tmp.path().to_path_buf(),
            fuzzers: vec!["aflplusplus".to_string()],
            targets: vec![("libxml2".to_string(), String::new())],
            fuzzer_args: Vec::new(),
            repeat: Repeats::Count(2),
            timeout: "1h".to_string(),
        };
        plan(&fuzz_config(args)).unwrap();
    }
}
