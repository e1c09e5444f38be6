// Engine Configuration
// Defaults, `.flowrun.yml` loading and validation

use crate::error::{EngineError, EngineResult};
use crate::runners::Shell;
use crate::utils::resolve_source_dir;

use serde::{Deserialize, Serialize};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File looked up at the source root when no config file is given
pub const CONFIG_FILE_NAME: &str = ".flowrun.yml";

/// Settings of the engine.
///
/// Every field is optional in the YAML file; missing ones take the
/// defaults below. CLI flags override file values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct EngineConfig {
    /// Global bound on concurrently running instances
    pub max_parallel: usize,
    /// Where instance environments are created
    pub work_root: PathBuf,
    /// Root of the filesystem artifact store
    pub artifact_dir: PathBuf,
    /// Tree that `checkout` populates workspaces from
    pub source_dir: PathBuf,
    pub default_step_timeout_minutes: u64,
    /// Leave instance directories behind for inspection
    pub keep_workspaces: bool,
    /// Shell for `run:` steps that name none (bash when installed, else sh)
    pub default_shell: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let max_parallel = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let artifact_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".flowrun")
            .join("artifacts");

        Self {
            max_parallel,
            work_root: std::env::temp_dir().join("flowrun").join("work"),
            artifact_dir,
            source_dir: resolve_source_dir(),
            default_step_timeout_minutes: 360,
            keep_workspaces: false,
            default_shell: None,
        }
    }
}

impl EngineConfig {
    /// Load and validate a config file
    pub fn load<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config: EngineConfig = serde_yaml::from_str(&content)?;

        // Relative paths are relative to the file
        if let Some(base) = path.parent() {
            config.work_root = base.join(&config.work_root);
            config.artifact_dir = base.join(&config.artifact_dir);
            config.source_dir = base.join(&config.source_dir);
        }

        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load `.flowrun.yml` from `source_root` when present, else defaults
    pub fn discover(source_root: &Path) -> EngineResult<Self> {
        let candidate = source_root.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            Self::load(candidate)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_parallel == 0 {
            return Err(EngineError::InvalidInput(
                "max-parallel must be at least 1".to_string(),
            ));
        }
        if self.default_step_timeout_minutes == 0 {
            return Err(EngineError::InvalidInput(
                "default-step-timeout-minutes must be at least 1".to_string(),
            ));
        }
        self.shell()?;
        Ok(())
    }

    /// Parsed `default-shell`
    pub fn shell(&self) -> EngineResult<Option<Shell>> {
        match &self.default_shell {
            None => Ok(None),
            Some(name) => Shell::parse(name).map(Some).ok_or_else(|| {
                EngineError::InvalidInput(format!(
                    "unsupported default-shell '{}', expected bash, sh, pwsh or python",
                    name
                ))
            }),
        }
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_minutes.saturating_mul(60))
    }
}
