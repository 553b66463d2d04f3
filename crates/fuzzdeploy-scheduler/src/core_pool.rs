//! Core pool for tracking and assigning CPU cores
//!
//! The pool is the single source of truth for core exclusivity: a core is
//! either free or owned by exactly one lease. Leases are numbered in
//! acquisition order, which is also the order jobs are started in.

use fuzzdeploy_core::{CoreId, FuzzDeployError, FuzzDeployResult, RebalancePolicy};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Pool shared between the dispatcher and whoever observes it
pub type SharedCorePool = Arc<Mutex<CorePool>>;

/// Identifier of one core grant; ordered by acquisition time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseId(pub u64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cores granted by a successful acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreGrant {
    pub lease: LeaseId,
    pub cores: Vec<CoreId>,
}

/// New core set of a lease after rebalancing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassignment {
    pub lease: LeaseId,
    pub cores: Vec<CoreId>,
}

/// Core pool that tracks core ownership
#[derive(Debug)]
pub struct CorePool {
    /// Cores in configured order
    cores: Vec<CoreId>,
    /// Busy cores and their owning lease
    owners: HashMap<CoreId, LeaseId>,
    /// Cores held per lease
    leases: BTreeMap<LeaseId, Vec<CoreId>>,
    next_lease: u64,
}

impl CorePool {
    /// Create a pool over `cores`
    pub fn new(cores: Vec<CoreId>) -> FuzzDeployResult<Self> {
        let mut seen = BTreeSet::new();
        let cores: Vec<CoreId> = cores.into_iter().filter(|c| seen.insert(*c)).collect();

        if cores.is_empty() {
            return Err(FuzzDeployError::Precondition(
                "Core pool needs one core at least".to_string(),
            ));
        }

        info!(cores = cores.len(), "Core pool initialized");

        Ok(Self {
            cores,
            owners: HashMap::new(),
            leases: BTreeMap::new(),
            next_lease: 0,
        })
    }

    /// Wrap the pool for sharing
    pub fn shared(self) -> SharedCorePool {
        Arc::new(Mutex::new(self))
    }

    /// Get the total number of cores
    pub fn total(&self) -> usize {
        self.cores.len()
    }

    /// Get the number of free cores
    pub fn free_count(&self) -> usize {
        self.cores.len() - self.owners.len()
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    fn first_free(&self) -> Option<CoreId> {
        self.cores
            .iter()
            .copied()
            .find(|c| !self.owners.contains_key(c))
    }

    /// Claim `count` free cores, all or nothing
    pub fn try_acquire(&mut self, count: usize) -> Option<CoreGrant> {
        if count == 0 || self.free_count() < count {
            return None;
        }

        let cores: Vec<CoreId> = self
            .cores
            .iter()
            .copied()
            .filter(|c| !self.owners.contains_key(c))
            .take(count)
            .collect();

        let lease = LeaseId(self.next_lease);
        self.next_lease += 1;

        for core in &cores {
            self.owners.insert(*core, lease);
        }
        self.leases.insert(lease, cores.clone());

        debug!(lease = %lease, cores = ?cores, "Acquired cores");

        Some(CoreGrant { lease, cores })
    }

    /// Mark cores free again
    ///
    /// # Panics
    ///
    /// Panics if a core is not busy; releasing a free core means the caller
    /// lost track of ownership.
    pub fn release(&mut self, cores: &[CoreId]) {
        for core in cores {
            let Some(lease) = self.owners.remove(core) else {
                panic!("core {} released while free", core);
            };

            if let Some(held) = self.leases.get_mut(&lease) {
                held.retain(|c| c != core);
                if held.is_empty() {
                    self.leases.remove(&lease);
                }
            }

            debug!(core = %core, lease = %lease, "Released core");
        }
    }

    /// Redistribute free cores according to `policy`
    ///
    /// Under `All`, each free core goes to the lease holding the fewest
    /// cores, earliest lease first on ties. Under `Per` nothing changes.
    pub fn rebalance_once(&mut self, policy: RebalancePolicy) -> Vec<Reassignment> {
        if policy == RebalancePolicy::Per {
            return Vec::new();
        }

        let mut touched = BTreeSet::new();
        while let Some(core) = self.first_free() {
            let Some(lease) = self
                .leases
                .iter()
                .min_by_key(|(lease, held)| (held.len(), **lease))
                .map(|(lease, _)| *lease)
            else {
                break;
            };

            self.owners.insert(core, lease);
            if let Some(held) = self.leases.get_mut(&lease) {
                held.push(core);
            }
            touched.insert(lease);
        }

        let reassignments: Vec<Reassignment> = touched
            .into_iter()
            .filter_map(|lease| {
                self.leases.get(&lease).map(|cores| Reassignment {
                    lease,
                    cores: cores.clone(),
                })
            })
            .collect();

        if !reassignments.is_empty() {
            info!(leases = reassignments.len(), "Rebalanced free cores");
        }

        reassignments
    }

    /// Cores held by `lease`
    pub fn cores_of(&self, lease: LeaseId) -> Option<&[CoreId]> {
        self.leases.get(&lease).map(Vec::as_slice)
    }
}
