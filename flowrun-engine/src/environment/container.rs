// Container Environment
// Runs a job instance's steps inside a detached Docker container

use super::local::LocalEnvironmentProvider;
use super::{EnvironmentProvider, ExecTarget, IsolatedEnvironment, CONTAINER_FILES, CONTAINER_WORKSPACE};
use crate::error::{EngineError, EngineResult};
use crate::execution::matrix::JobInstance;

use tokio::process::Command;

/// Docker-backed isolation.
///
/// Directories come from the local provider; the workspace is mounted at
/// `/workspace` and the command-file directory at `/flowrun/files`. The
/// container idles on `tail -f /dev/null` and steps run through
/// `docker exec`.
pub struct ContainerEnvironmentProvider {
    local: LocalEnvironmentProvider,
    docker: String,
}

impl ContainerEnvironmentProvider {
    pub fn new(local: LocalEnvironmentProvider) -> Self {
        Self {
            local,
            docker: "docker".to_string(),
        }
    }

    /// Use a different docker-compatible CLI (e.g. `podman`)
    pub fn with_docker_binary(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    fn container_name(instance: &JobInstance) -> String {
        let sanitized: String = instance
            .key()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!("flowrun-{}-{}", instance.run_id, sanitized)
    }

    async fn start(&self, instance: &JobInstance, environment: &IsolatedEnvironment, image: &str) -> Result<String, String> {
        which::which(&self.docker)
            .map_err(|_| format!("'{}' was not found on PATH", self.docker))?;

        let args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            Self::container_name(instance),
            "-w".to_string(),
            CONTAINER_WORKSPACE.to_string(),
            "-v".to_string(),
            format!("{}:{}", environment.workspace.display(), CONTAINER_WORKSPACE),
            "-v".to_string(),
            format!("{}:{}", environment.files_dir.display(), CONTAINER_FILES),
            "--entrypoint".to_string(),
            "tail".to_string(),
            image.to_string(),
            "-f".to_string(),
            "/dev/null".to_string(),
        ];

        let output = Command::new(&self.docker)
            .args(&args)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.docker, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("failed to start container from {}: {}", image, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait::async_trait]
impl EnvironmentProvider for ContainerEnvironmentProvider {
    async fn provision(&self, instance: &JobInstance) -> EngineResult<IsolatedEnvironment> {
        let Some(image) = instance.definition.container.clone() else {
            return self.local.create(instance).await;
        };

        let mut environment = self.local.create(instance).await?;
        match self.start(instance, &environment, &image).await {
            Ok(id) => {
                tracing::debug!(instance = %environment.name, container = %id, %image, "started container");
                environment.target = ExecTarget::Container { id, image };
                Ok(environment)
            }
            Err(reason) => {
                self.local.remove(&environment).await;
                Err(EngineError::EnvironmentProvision {
                    instance: instance.label(),
                    reason,
                })
            }
        }
    }

    async fn release(&self, environment: IsolatedEnvironment) {
        if let ExecTarget::Container { id, .. } = &environment.target {
            let result = Command::new(&self.docker)
                .args(["rm", "-f", id.as_str()])
                .output()
                .await;
            match result {
                Ok(output) if output.status.success() => {}
                Ok(output) => tracing::warn!(
                    container = %id,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "failed to remove container"
                ),
                Err(e) => tracing::warn!(container = %id, error = %e, "failed to remove container"),
            }
        }
        self.local.remove(&environment).await
    }
}
