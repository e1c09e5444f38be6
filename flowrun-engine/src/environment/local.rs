use super::{EnvironmentProvider, IsolatedEnvironment};
use crate::error::{EngineError, EngineResult};
use crate::execution::matrix::JobInstance;
use crate::utils::is_safe_segment;

use std::path::{Path, PathBuf};

/// Directory-per-instance isolation on the host.
///
/// Layout: `<work-root>/<run-id>/<job>-<index>/{workspace,files}`.
#[derive(Debug, Clone)]
pub struct LocalEnvironmentProvider {
    work_root: PathBuf,
    keep_workspaces: bool,
}

impl LocalEnvironmentProvider {
    pub fn new(work_root: impl Into<PathBuf>, keep_workspaces: bool) -> Self {
        Self {
            work_root: work_root.into(),
            keep_workspaces,
        }
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn keep_workspaces(&self) -> bool {
        self.keep_workspaces
    }

    /// Create the instance directories, starting from an empty root
    pub async fn create(&self, instance: &JobInstance) -> EngineResult<IsolatedEnvironment> {
        let key = instance.key();
        let root = self.work_root.join(instance.run_id.as_str()).join(&key);

        let provision_error = |reason: String| EngineError::EnvironmentProvision {
            instance: instance.label(),
            reason,
        };

        if !is_safe_segment(instance.run_id.as_str()) || !is_safe_segment(&key) {
            return Err(provision_error(format!(
                "'{}/{}' is not a safe directory name",
                instance.run_id, key
            )));
        }

        if tokio::fs::try_exists(&root).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&root).await.map_err(|e| {
                provision_error(format!("failed to clear {}: {}", root.display(), e))
            })?;
        }

        let environment = IsolatedEnvironment::create(key, root.clone())
            .await
            .map_err(|e| provision_error(format!("failed to create {}: {}", root.display(), e)))?;

        tracing::debug!(
            instance = %environment.name,
            workspace = %environment.workspace.display(),
            "provisioned local environment"
        );
        Ok(environment)
    }

    /// Remove the instance directory unless workspaces are kept
    pub async fn remove(&self, environment: &IsolatedEnvironment) {
        if self.keep_workspaces {
            tracing::info!(
                instance = %environment.name,
                path = %environment.root.display(),
                "keeping workspace"
            );
            return;
        }

        if let Err(e) = tokio::fs::remove_dir_all(&environment.root).await {
            tracing::warn!(
                instance = %environment.name,
                error = %e,
                "failed to remove workspace"
            );
        }
    }
}

#[async_trait::async_trait]
impl EnvironmentProvider for LocalEnvironmentProvider {
    async fn provision(&self, instance: &JobInstance) -> EngineResult<IsolatedEnvironment> {
        self.create(instance).await
    }

    async fn release(&self, environment: IsolatedEnvironment) {
        self.remove(&environment).await
    }
}
