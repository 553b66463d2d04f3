//! Campaign root layout and filesystem side-channel counters
//!
//! Every stage writes into `<root>/<stage>/<fuzzer>/<target>/<repeat>`. Workers
//! report progress only through entries they create there, so counting those
//! entries is how the scheduler observes them. A missing directory counts as
//! zero; existing output is never removed.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{CountRule, FuzzDeployError, FuzzDeployResult, JobKey};

/// Campaign directory layout
#[derive(Debug, Clone)]
pub struct CampaignLayout {
    root: PathBuf,
}

impl CampaignLayout {
    /// Create a layout rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Campaign root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<stage>`
    pub fn stage_dir(&self, stage: &str) -> PathBuf {
        self.root.join(stage)
    }

    /// `<root>/<stage>/<fuzzer>/<target>/<repeat>`
    pub fn job_dir(&self, stage: &str, key: &JobKey) -> PathBuf {
        self.stage_dir(stage)
            .join(&key.fuzzer)
            .join(&key.target)
            .join(&key.repeat)
    }

    /// Create the job directory if missing
    pub fn ensure_job_dir(&self, stage: &str, key: &JobKey) -> FuzzDeployResult<PathBuf> {
        let dir = self.job_dir(stage, key);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Fail unless the campaign root (and `stage`, if given) exist
    pub fn check_exists(&self, stage: Option<&str>) -> FuzzDeployResult<()> {
        if !self.root.is_dir() {
            return Err(FuzzDeployError::Precondition(format!(
                "{} does not exist",
                self.root.display()
            )));
        }
        if let Some(stage) = stage {
            let dir = self.stage_dir(stage);
            if !dir.is_dir() {
                return Err(FuzzDeployError::Precondition(format!(
                    "{} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Jobs that already have a directory in `stage`, sorted
    pub fn discover_jobs(&self, stage: &str) -> FuzzDeployResult<Vec<JobKey>> {
        let mut keys = Vec::new();

        for fuzzer in sorted_subdirs(&self.stage_dir(stage))? {
            let fuzzer_dir = self.stage_dir(stage).join(&fuzzer);
            for target in sorted_subdirs(&fuzzer_dir)? {
                for repeat in sorted_subdirs(&fuzzer_dir.join(&target))? {
                    keys.push(JobKey::new(fuzzer.clone(), target.clone(), repeat));
                }
            }
        }

        debug!(stage = stage, jobs = keys.len(), "Discovered jobs");
        Ok(keys)
    }

    /// Evaluate a counting rule for one job
    ///
    /// `stage` is the stage used when the rule does not name one.
    pub fn count(&self, rule: &CountRule, stage: &str, key: &JobKey) -> io::Result<u64> {
        match rule {
            CountRule::Fixed { count } => Ok(*count),
            CountRule::Search {
                stage: rule_stage,
                dir,
                exclude,
            } => {
                let job_dir = self.job_dir(rule_stage.as_deref().unwrap_or(stage), key);
                match find_entry(&job_dir, dir, true)? {
                    Some(found) => count_entries(&found, exclude),
                    None => Ok(0),
                }
            }
            CountRule::Dirs {
                stage: rule_stage,
                dirs,
                exclude,
            } => {
                let job_dir = self.job_dir(rule_stage.as_deref().unwrap_or(stage), key);
                let mut total = 0;
                for dir in dirs {
                    total += count_entries(&job_dir.join(dir), exclude)?;
                }
                Ok(total)
            }
            CountRule::Marker {
                stage: rule_stage,
                name,
            } => {
                let job_dir = self.job_dir(rule_stage.as_deref().unwrap_or(stage), key);
                Ok(find_entry(&job_dir, name, false)?.map_or(0, |_| 1))
            }
        }
    }

    /// Whether an entry named `name` exists beneath the job directory
    pub fn has_marker(&self, stage: &str, key: &JobKey, name: &str) -> io::Result<bool> {
        Ok(find_entry(&self.job_dir(stage, key), name, false)?.is_some())
    }
}

/// Number of entries in `dir` whose name is not in `exclude`; 0 if `dir` is absent
pub fn count_entries(dir: &Path, exclude: &[String]) -> io::Result<u64> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut count = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if exclude.iter().any(|x| name.to_str() == Some(x.as_str())) {
            continue;
        }
        count += 1;
    }
    Ok(count)
}

/// Breadth-first search for an entry called `name` beneath `root`
///
/// With `dirs_only` set, only directories match.
pub fn find_entry(root: &Path, name: &str, dirs_only: bool) -> io::Result<Option<PathBuf>> {
    let mut queue = VecDeque::from([root.to_path_buf()]);

    while let Some(dir) = queue.pop_front() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        let mut subdirs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let is_dir = entry.file_type()?.is_dir();
            if entry.file_name().to_str() == Some(name) && (is_dir || !dirs_only) {
                return Ok(Some(entry.path()));
            }
            if is_dir {
                subdirs.push(entry.path());
            }
        }
        subdirs.sort();
        queue.extend(subdirs);
    }

    Ok(None)
}

fn sorted_subdirs(dir: &Path) -> FuzzDeployResult<Vec<String>> {
    let mut names = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
