//! Docker backend implementation
//!
//! Each job runs as a detached, self-removing container. Cores are applied
//! with `--cpuset-cpus` and later moved with `docker update`.

use async_trait::async_trait;
use fuzzdeploy_core::{
    format_core_list, CoreId, DockerSettings, FuzzDeployError, FuzzDeployResult, JobHandle,
    JobSpec,
};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::traits::JobBackend;

/// Docker-based backend for running workers
pub struct DockerBackend {
    settings: DockerSettings,
}

impl DockerBackend {
    /// Create a new docker backend
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }

    /// Arguments for `docker run`
    pub fn run_args(&self, spec: &JobSpec, cores: &[CoreId]) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string(), "--rm".to_string()];

        for mount in &spec.launch.mounts {
            args.push(format!("--volume={}:{}", mount.host.display(), mount.target));
        }

        for cap in &self.settings.cap_add {
            args.push(format!("--cap-add={}", cap));
        }
        for opt in &self.settings.security_opt {
            args.push("--security-opt".to_string());
            args.push(opt.clone());
        }

        if !cores.is_empty() {
            args.push(format!("--cpuset-cpus={}", format_core_list(cores)));
        }
        if let Some(first) = cores.first() {
            args.push(format!("--env=CPU_ID={}", first));
        }
        for (key, value) in &spec.launch.env {
            args.push(format!("--env={}={}", key, value));
        }

        if self.settings.network_disabled {
            args.push("--network=none".to_string());
        }
        if self.settings.privileged {
            args.push("--privileged".to_string());
        }
        args.extend(self.settings.extra_args.iter().cloned());

        args.push(spec.launch.image.clone());
        args.push("-c".to_string());
        args.push(spec.launch.entrypoint.clone());

        args
    }

    async fn docker<I, S>(&self, args: I) -> std::io::Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        Command::new(&self.settings.docker_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
    }
}

/// Whether docker's stderr says the object does not exist
fn is_missing(stderr: &str) -> bool {
    ["No such object", "No such container", "No such image"]
        .iter()
        .any(|m| stderr.contains(m))
}

#[async_trait]
impl JobBackend for DockerBackend {
    async fn start(&self, spec: &JobSpec, cores: &[CoreId]) -> FuzzDeployResult<JobHandle> {
        let launch_error = |reason: String| FuzzDeployError::Launch {
            job: spec.key.to_string(),
            reason,
        };

        if !self.has_environment(&spec.launch.image).await? {
            return Err(launch_error(format!(
                "docker image {} not found",
                spec.launch.image
            )));
        }

        let output = self
            .docker(self.run_args(spec, cores))
            .await
            .map_err(|e| launch_error(format!("Failed to run docker: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(job = %spec.key, error = %stderr, "docker run failed");
            return Err(launch_error(stderr));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(launch_error("docker run returned no container id".to_string()));
        }

        let handle = JobHandle(id);
        info!(
            container = %handle.short(),
            job = %spec.key,
            cores = %format_core_list(cores),
            "Container started"
        );
        Ok(handle)
    }

    async fn is_running(&self, handle: &JobHandle) -> FuzzDeployResult<bool> {
        let output = self
            .docker(["inspect", "-f", "{{.State.Running}}", handle.0.as_str()])
            .await
            .map_err(|e| FuzzDeployError::Backend(format!("Failed to run docker: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Containers run with --rm, so an unknown container has exited
            if is_missing(&stderr) {
                return Ok(false);
            }
            return Err(FuzzDeployError::Backend(format!(
                "Cannot inspect container {}: {}",
                handle.short(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn terminate(&self, handle: &JobHandle) -> FuzzDeployResult<()> {
        info!(container = %handle.short(), "Removing container");

        let output = self
            .docker(["rm", "-f", handle.0.as_str()])
            .await
            .map_err(|e| FuzzDeployError::Backend(format!("Failed to run docker: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                debug!(container = %handle.short(), "Container already gone");
                return Ok(());
            }
            return Err(FuzzDeployError::Backend(stderr.trim().to_string()));
        }

        Ok(())
    }

    async fn update_affinity(&self, handle: &JobHandle, cores: &[CoreId]) -> FuzzDeployResult<()> {
        let cpus = format_core_list(cores);
        let output = self
            .docker(["update", "--cpuset-cpus", cpus.as_str(), handle.0.as_str()])
            .await
            .map_err(|e| FuzzDeployError::Backend(format!("Failed to run docker: {}", e)))?;

        if !output.status.success() {
            return Err(FuzzDeployError::Backend(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        debug!(container = %handle.short(), cores = %cpus, "Container affinity updated");
        Ok(())
    }

    async fn has_environment(&self, image: &str) -> FuzzDeployResult<bool> {
        let output = self
            .docker(["image", "inspect", "--format", "{{.Id}}", image])
            .await
            .map_err(|e| FuzzDeployError::Backend(format!("Failed to run docker: {}", e)))?;

        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing(&stderr) {
            return Ok(false);
        }
        Err(FuzzDeployError::Backend(stderr.trim().to_string()))
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzdeploy_core::{JobKey, LaunchParams, Mount};
    use std::path::PathBuf;

    fn fuzz_spec() -> JobSpec {
        let launch = LaunchParams {
            image: "aflplusplus/libxml2".to_string(),
            entrypoint: "${SRC}/run.sh".to_string(),
            env: [("TIMEOUT".to_string(), "86400".to_string())].into(),
            mounts: vec![Mount {
                host: PathBuf::from("/srv/campaign/ar/aflplusplus/libxml2/1"),
                target: "/shared".to_string(),
            }],
            output_dir: PathBuf::from("/srv/campaign/ar/aflplusplus/libxml2/1"),
        };
        JobSpec::new(JobKey::new("aflplusplus", "libxml2", "1"), launch)
    }

    #[test]
    fn test_run_args_defaults() {
        let backend = DockerBackend::new(DockerSettings::default());
        let args = backend.run_args(&fuzz_spec(), &[CoreId(3)]);

        assert_eq!(&args[..3], &["run", "-d", "--rm"]);
        assert!(args.contains(&"--volume=/srv/campaign/ar/aflplusplus/libxml2/1:/shared".to_string()));
        assert!(args.contains(&"--cap-add=SYS_PTRACE".to_string()));
        assert!(args.contains(&"--cpuset-cpus=3".to_string()));
        assert!(args.contains(&"--env=CPU_ID=3".to_string()));
        assert!(args.contains(&"--env=TIMEOUT=86400".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(!args.contains(&"--privileged".to_string()));

        let tail: Vec<&str> = args[args.len() - 3..].iter().map(String::as_str).collect();
        assert_eq!(tail, vec!["aflplusplus/libxml2", "-c", "${SRC}/run.sh"]);
    }

    #[test]
    fn test_run_args_privileged_multi_core() {
        let settings = DockerSettings {
            privileged: true,
            network_disabled: false,
            ..Default::default()
        };
        let backend = DockerBackend::new(settings);
        let args = backend.run_args(&fuzz_spec(), &[CoreId(0), CoreId(1)]);

        assert!(args.contains(&"--cpuset-cpus=0,1".to_string()));
        assert!(args.contains(&"--env=CPU_ID=0".to_string()));
        assert!(args.contains(&"--privileged".to_string()));
        assert!(!args.contains(&"--network=none".to_string()));
        assert_eq!(backend.name(), "docker");
    }

    #[tokio::test]
    async fn test_missing_docker_binary_is_backend_error() {
        let backend = DockerBackend::new(DockerSettings {
            docker_path: PathBuf::from("/nonexistent/docker"),
            ..Default::default()
        });
        let handle = JobHandle("deadbeef".to_string());

        assert!(matches!(
            backend.is_running(&handle).await,
            Err(FuzzDeployError::Backend(_))
        ));
        assert!(backend.has_environment("aflplusplus/libxml2").await.is_err());
    }

    /// Backend whose docker binary prints `stderr` and exits 1
    #[cfg(unix)]
    fn failing_docker(dir: &std::path::Path, stderr: &str) -> DockerBackend {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        std::fs::write(
            &path,
            format!("#!/bin/sh\necho '{}' >&2\nexit 1\n", stderr),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        DockerBackend::new(DockerSettings {
            docker_path: path,
            ..Default::default()
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreachable_daemon_is_not_an_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = failing_docker(
            tmp.path(),
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        let handle = JobHandle("deadbeef".to_string());

        assert!(matches!(
            backend.is_running(&handle).await,
            Err(FuzzDeployError::Backend(_))
        ));
        assert!(backend.has_environment("aflplusplus/libxml2").await.is_err());
        assert!(backend.terminate(&handle).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_removed_container_has_exited() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = failing_docker(tmp.path(), "Error: No such object: deadbeef");
        let handle = JobHandle("deadbeef".to_string());

        assert!(!backend.is_running(&handle).await.unwrap());
        assert!(!backend.has_environment("aflplusplus/libxml2").await.unwrap());
    }

    #[test]
    fn test_is_missing() {
        assert!(is_missing("Error response from daemon: No such container: 3f2a"));
        assert!(is_missing("Error: No such image: aflplusplus/libxml2"));
        assert!(!is_missing("Cannot connect to the Docker daemon"));
    }
}
