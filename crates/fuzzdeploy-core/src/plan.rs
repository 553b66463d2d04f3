//! Turning a campaign configuration into an ordered list of job specs

use std::collections::BTreeMap;
use tracing::debug;

use crate::{
    CampaignConfig, CampaignLayout, FuzzDeployResult, JobKey, JobSpec, LaunchParams, Mount,
};

/// File a fuzzing job leaves behind recording the arguments of its target
pub const TARGET_ARGS_FILE: &str = "target_args";

/// Enumerate job keys for a campaign
///
/// With a matrix the order is repeat-major, then fuzzer, then target, so the
/// first repeat of every combination is launched before any second repeat.
/// Without one, jobs are discovered from the stage's source directory.
pub fn enumerate_keys(
    config: &CampaignConfig,
    layout: &CampaignLayout,
) -> FuzzDeployResult<Vec<JobKey>> {
    match (&config.matrix, &config.stage.source) {
        (Some(matrix), _) => {
            let mut keys = Vec::new();
            for repeat in matrix.repeats.indices() {
                for fuzzer in &matrix.fuzzers {
                    for target in matrix.targets.keys() {
                        keys.push(JobKey::new(fuzzer.clone(), target.clone(), repeat.clone()));
                    }
                }
            }
            Ok(keys)
        }
        (None, Some(source)) => layout.discover_jobs(source),
        (None, None) => Ok(Vec::new()),
    }
}

/// Build the spec for one job
pub fn build_job(config: &CampaignConfig, layout: &CampaignLayout, key: &JobKey) -> JobSpec {
    let stage = &config.stage;
    let vars = template_vars(config, layout, key);

    let output_dir = layout.job_dir(&stage.name, key);
    let mut mounts = Vec::new();
    if let Some(source) = &stage.source {
        mounts.push(Mount {
            host: layout.job_dir(source, key),
            target: "/shared".to_string(),
        });
    }
    mounts.push(Mount {
        host: output_dir.clone(),
        target: stage.output_mount(),
    });

    let env = stage
        .env
        .iter()
        .map(|(k, v)| (k.clone(), render(v, &vars)))
        .collect();

    let launch = LaunchParams {
        image: render(&stage.image, &vars),
        entrypoint: stage.entrypoint.clone(),
        env,
        mounts,
        output_dir,
    };

    JobSpec::new(key.clone(), launch).with_min_cores(stage.min_cores)
}

/// Enumerate and build every job of a campaign
pub fn plan_jobs(config: &CampaignConfig, layout: &CampaignLayout) -> FuzzDeployResult<Vec<JobSpec>> {
    let keys = enumerate_keys(config, layout)?;
    debug!(jobs = keys.len(), stage = %config.stage.name, "Planned jobs");
    Ok(keys.iter().map(|k| build_job(config, layout, k)).collect())
}

fn template_vars(
    config: &CampaignConfig,
    layout: &CampaignLayout,
    key: &JobKey,
) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    vars.insert("fuzzer", key.fuzzer.clone());
    vars.insert("target", key.target.clone());
    vars.insert("repeat", key.repeat.clone());

    match &config.matrix {
        Some(matrix) => {
            vars.insert(
                "target_args",
                matrix.targets.get(&key.target).cloned().unwrap_or_default(),
            );
            vars.insert(
                "fuzzer_args",
                matrix.fuzzer_args_for(&key.fuzzer, &key.target).to_string(),
            );
            vars.insert("timeout", matrix.timeout.clone());
        }
        None => {
            let target_args = config
                .stage
                .source
                .as_ref()
                .map(|source| layout.job_dir(source, key).join(TARGET_ARGS_FILE))
                .and_then(|path| std::fs::read_to_string(path).ok())
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            vars.insert("target_args", target_args);
            vars.insert("fuzzer_args", String::new());
            vars.insert("timeout", String::new());
        }
    }

    vars
}

/// Substitute `{name}` placeholders; unknown placeholders are left as is
pub fn render(template: &str, vars: &BTreeMap<&'static str, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}
