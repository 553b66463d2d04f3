//! Process-based backend implementation
//!
//! This backend runs each job's entrypoint as a direct child process of the
//! scheduler, in the job's output directory. Used on hosts without docker
//! and for local dry runs of a stage script.
//!
//! Every worker leads its own process group. A worker counts as running
//! while any process of its group is alive, and terminating it signals the
//! whole group, so fuzzers forked by a stage script go down with it.

use async_trait::async_trait;
use fuzzdeploy_core::{
    format_core_list, CoreId, FuzzDeployError, FuzzDeployResult, JobHandle, JobSpec,
    ProcessSettings,
};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::traits::JobBackend;

/// A spawned worker and the process group it leads
struct Worker {
    child: Child,
    pgid: Option<u32>,
}

/// Process-based backend for running workers
pub struct ProcessBackend {
    settings: ProcessSettings,
    children: Mutex<HashMap<JobHandle, Worker>>,
}

impl ProcessBackend {
    /// Create a new process backend
    pub fn new(settings: ProcessSettings) -> Self {
        Self {
            settings,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Build the command to start a worker
    fn build_command(&self, spec: &JobSpec, cores: &[CoreId]) -> Command {
        let mut cmd = if self.settings.pin_with_taskset && !cores.is_empty() {
            let mut cmd = Command::new("taskset");
            cmd.arg("-c").arg(format_core_list(cores));
            cmd.arg(&self.settings.shell);
            cmd
        } else {
            Command::new(&self.settings.shell)
        };
        cmd.arg("-c").arg(&spec.launch.entrypoint);
        cmd.current_dir(&spec.launch.output_dir);

        cmd.envs(&spec.launch.env);
        for mount in &spec.launch.mounts {
            cmd.env(mount_env_name(&mount.target), &mount.host);
        }
        if let Some(first) = cores.first() {
            cmd.env("CPU_ID", first.to_string());
        }
        cmd.env("FUZZDEPLOY_CORES", format_core_list(cores));

        // Workers report through files; an unread pipe would eventually block them
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

/// Send SIGKILL to every process in group `pgid`
#[cfg(unix)]
fn kill_group(pgid: u32) -> std::io::Result<()> {
    // Safety: killpg takes plain integers and only sends a signal.
    let ret = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

/// Whether any process of group `pgid` is still alive
#[cfg(unix)]
fn group_alive(pgid: u32) -> std::io::Result<bool> {
    // Safety: signal 0 only checks that the group exists.
    let ret = unsafe { libc::killpg(pgid as libc::pid_t, 0) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        // Members exist but belong to another user
        Some(libc::EPERM) => Ok(true),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn group_alive(_pgid: u32) -> std::io::Result<bool> {
    Ok(false)
}

/// Environment variable exposing a mount to a local process (`/shared` -> `FUZZDEPLOY_MOUNT_SHARED`)
fn mount_env_name(target: &str) -> String {
    let name: String = target
        .trim_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("FUZZDEPLOY_MOUNT_{}", name)
}

#[async_trait]
impl JobBackend for ProcessBackend {
    async fn start(&self, spec: &JobSpec, cores: &[CoreId]) -> FuzzDeployResult<JobHandle> {
        info!(
            job = %spec.key,
            cores = %format_core_list(cores),
            "Starting worker process"
        );

        let mut cmd = self.build_command(spec, cores);

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                let handle = JobHandle(format!("pid:{}", pid));

                debug!(job = %spec.key, pid = pid, "Worker process spawned");

                let worker = Worker {
                    pgid: child.id(),
                    child,
                };
                self.children.lock().await.insert(handle.clone(), worker);
                Ok(handle)
            }
            Err(e) => {
                error!(job = %spec.key, error = %e, "Failed to spawn worker process");
                Err(FuzzDeployError::Launch {
                    job: spec.key.to_string(),
                    reason: format!("Failed to spawn worker: {}", e),
                })
            }
        }
    }

    async fn is_running(&self, handle: &JobHandle) -> FuzzDeployResult<bool> {
        let mut children = self.children.lock().await;
        let Some(worker) = children.get_mut(handle) else {
            return Ok(false);
        };

        match worker.child.try_wait() {
            Ok(None) => return Ok(true),
            Ok(Some(status)) => {
                debug!(handle = %handle, status = %status, "Worker process exited");
            }
            Err(e) => {
                return Err(FuzzDeployError::Backend(format!(
                    "Failed to query {}: {}",
                    handle, e
                )))
            }
        }

        // The leader is gone; processes it forked may still hold the cores
        if let Some(pgid) = worker.pgid {
            match group_alive(pgid) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    return Err(FuzzDeployError::Backend(format!(
                        "Failed to query process group of {}: {}",
                        handle, e
                    )))
                }
            }
        }

        children.remove(handle);
        Ok(false)
    }

    async fn terminate(&self, handle: &JobHandle) -> FuzzDeployResult<()> {
        let worker = self.children.lock().await.remove(handle);

        if let Some(mut worker) = worker {
            info!(handle = %handle, "Stopping worker process group");
            if let Some(pgid) = worker.pgid {
                if let Err(e) = kill_group(pgid) {
                    debug!(handle = %handle, error = %e, "Worker process group already gone");
                }
            }
            if let Err(e) = worker.child.kill().await {
                debug!(handle = %handle, error = %e, "Worker process already gone");
            }
        }

        Ok(())
    }

    async fn update_affinity(&self, handle: &JobHandle, cores: &[CoreId]) -> FuzzDeployResult<()> {
        if !self.settings.pin_with_taskset {
            return Ok(());
        }

        let pid = {
            let children = self.children.lock().await;
            children.get(handle).and_then(|w| w.pgid)
        };
        let Some(pid) = pid else {
            return Ok(());
        };

        let output = Command::new("taskset")
            .arg("-a")
            .arg("-pc")
            .arg(format_core_list(cores))
            .arg(pid.to_string())
            .output()
            .await?;

        if !output.status.success() {
            warn!(handle = %handle, "taskset refused the new affinity");
            return Err(FuzzDeployError::Backend(format!(
                "taskset failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }

    async fn has_environment(&self, _image: &str) -> FuzzDeployResult<bool> {
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "process"
    }
}
