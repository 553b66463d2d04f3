//! CPU core identifiers, range parsing and detection

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{FuzzDeployError, FuzzDeployResult};

/// One schedulable CPU-affinity unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoreId(pub u32);

impl CoreId {
    /// Numeric core index as understood by the operating system
    pub fn index(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Render cores as a cpuset list (`0,1,4`)
pub fn format_core_list(cores: &[CoreId]) -> String {
    cores
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a core range such as `0-3,6,8-9`
///
/// The result is ordered and free of duplicates. An empty result is an error.
pub fn parse_core_range(range: &str) -> FuzzDeployResult<Vec<CoreId>> {
    let mut cores = BTreeSet::new();

    for part in range.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start = parse_index(start, range)?;
                let end = parse_index(end, range)?;
                if start > end {
                    return Err(FuzzDeployError::Config(format!(
                        "Invalid core range '{}': {} > {}",
                        range, start, end
                    )));
                }
                cores.extend((start..=end).map(CoreId));
            }
            None => {
                cores.insert(CoreId(parse_index(part, range)?));
            }
        }
    }

    if cores.is_empty() {
        return Err(FuzzDeployError::Precondition(format!(
            "Core range '{}' should contain one core at least",
            range
        )));
    }

    Ok(cores.into_iter().collect())
}

fn parse_index(text: &str, range: &str) -> FuzzDeployResult<u32> {
    text.trim().parse::<u32>().map_err(|_| {
        FuzzDeployError::Config(format!("Invalid core index '{}' in range '{}'", text, range))
    })
}

/// Number of online cores on this host
pub fn detect_core_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// All online cores on this host
pub fn detect_cores() -> Vec<CoreId> {
    (0..detect_core_count()).map(CoreId).collect()
}

/// Default campaign cores: every core but one when more than one is online
pub fn default_core_range(available: u32) -> Vec<CoreId> {
    let usable = if available > 1 { available - 1 } else { available };
    (0..usable).map(CoreId).collect()
}

/// Check an explicit core list against the host's core count
pub fn validate_core_range(cores: &[CoreId], available: u32) -> FuzzDeployResult<()> {
    if cores.is_empty() {
        return Err(FuzzDeployError::Precondition(
            "Core range should contain one core at least".to_string(),
        ));
    }

    if let Some(bad) = cores.iter().find(|c| c.0 >= available) {
        return Err(FuzzDeployError::Precondition(format!(
            "Core {} is out of range, available cores: 0-{}",
            bad,
            available.saturating_sub(1)
        )));
    }

    Ok(())
}

/// Resolve the campaign cores from an optional range string
pub fn resolve_cores(range: Option<&str>, available: u32) -> FuzzDeployResult<Vec<CoreId>> {
    match range {
        Some(range) => {
            let cores = parse_core_range(range)?;
            validate_core_range(&cores, available)?;
            Ok(cores)
        }
        None => Ok(default_core_range(available)),
    }
}
