// Environment Providers
// Isolated workspaces for job instances, on the host or in a container

pub mod container;
pub mod local;

pub use container::ContainerEnvironmentProvider;
pub use local::LocalEnvironmentProvider;

use crate::error::EngineResult;
use crate::execution::matrix::JobInstance;

use indexmap::IndexMap;
use tokio::process::Command;

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Workspace mount point inside containers
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Command-file directory mount point inside containers
pub const CONTAINER_FILES: &str = "/flowrun/files";

const CONTAINER_DEFAULT_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Where step processes run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecTarget {
    Host,
    Container { id: String, image: String },
}

/// A provisioned, instance-private environment
#[derive(Debug, Clone)]
pub struct IsolatedEnvironment {
    /// Instance key the environment belongs to
    pub name: String,
    /// Directory holding everything below
    pub root: PathBuf,
    /// Host path of the workspace
    pub workspace: PathBuf,
    /// Host path of the directory for command files
    pub files_dir: PathBuf,
    pub target: ExecTarget,
}

impl IsolatedEnvironment {
    /// Create the directory layout under `root`
    pub async fn create(name: impl Into<String>, root: PathBuf) -> std::io::Result<Self> {
        let workspace = root.join("workspace");
        let files_dir = root.join("files");
        tokio::fs::create_dir_all(&workspace).await?;
        tokio::fs::create_dir_all(&files_dir).await?;

        Ok(Self {
            name: name.into(),
            root,
            workspace,
            files_dir,
            target: ExecTarget::Host,
        })
    }

    pub fn is_container(&self) -> bool {
        matches!(self.target, ExecTarget::Container { .. })
    }

    /// Workspace path as seen by step processes
    pub fn visible_workspace(&self) -> String {
        match self.target {
            ExecTarget::Host => self.workspace.display().to_string(),
            ExecTarget::Container { .. } => CONTAINER_WORKSPACE.to_string(),
        }
    }

    /// Translate a host path below the workspace or files directory into
    /// the path step processes see
    pub fn visible_path(&self, host_path: &Path) -> String {
        if let ExecTarget::Container { .. } = self.target {
            let mounts = [
                (&self.workspace, CONTAINER_WORKSPACE),
                (&self.files_dir, CONTAINER_FILES),
            ];
            for (host_dir, mount) in mounts {
                if let Ok(relative) = host_path.strip_prefix(host_dir) {
                    let relative = relative.to_string_lossy().replace('\\', "/");
                    return if relative.is_empty() {
                        mount.to_string()
                    } else {
                        format!("{}/{}", mount, relative)
                    };
                }
            }
        }
        host_path.display().to_string()
    }

    /// Build a command running `program` inside the environment.
    ///
    /// `working_directory` is relative to the workspace. `path_prepends` are
    /// put in front of the target's PATH.
    pub fn command(
        &self,
        program: &str,
        args: &[String],
        working_directory: Option<&str>,
        env: &IndexMap<String, String>,
        path_prepends: &[String],
    ) -> Command {
        match &self.target {
            ExecTarget::Host => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                let cwd = match working_directory {
                    Some(dir) => self.workspace.join(dir),
                    None => self.workspace.clone(),
                };
                cmd.current_dir(cwd);
                cmd.envs(env);
                if !path_prepends.is_empty() {
                    let base = std::env::var("PATH").unwrap_or_default();
                    cmd.env("PATH", join_path(path_prepends, &base));
                }
                cmd
            }
            ExecTarget::Container { id, .. } => {
                let mut cmd = Command::new("docker");
                cmd.arg("exec");
                let cwd = match working_directory {
                    Some(dir) if dir.starts_with('/') => dir.to_string(),
                    Some(dir) => format!("{}/{}", CONTAINER_WORKSPACE, dir.trim_start_matches("./")),
                    None => CONTAINER_WORKSPACE.to_string(),
                };
                cmd.arg("-w").arg(&cwd);
                for (key, value) in env {
                    cmd.arg("-e").arg(format!("{}={}", key, value));
                }
                if !path_prepends.is_empty() {
                    cmd.arg("-e").arg(format!(
                        "PATH={}",
                        join_path(path_prepends, CONTAINER_DEFAULT_PATH)
                    ));
                }
                cmd.arg(id).arg(program).args(args);
                cmd
            }
        }
    }
}

fn join_path(prepends: &[String], base: &str) -> String {
    let separator = if cfg!(windows) { ";" } else { ":" };
    let mut parts: Vec<&str> = prepends.iter().map(String::as_str).collect();
    if !base.is_empty() {
        parts.push(base);
    }
    parts.join(separator)
}

/// Creates and tears down isolated environments
#[async_trait::async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Provision a fresh environment for `instance`.
    ///
    /// Fails with `EngineError::EnvironmentProvision`.
    async fn provision(&self, instance: &JobInstance) -> EngineResult<IsolatedEnvironment>;

    /// Tear down an environment. Failures are logged, never propagated.
    async fn release(&self, environment: IsolatedEnvironment);
}

/// Picks the container provider for jobs that declare an image and the
/// local provider otherwise
pub struct Provisioner {
    local: Arc<dyn EnvironmentProvider>,
    container: Arc<dyn EnvironmentProvider>,
}

impl Provisioner {
    pub fn new(local: Arc<dyn EnvironmentProvider>, container: Arc<dyn EnvironmentProvider>) -> Self {
        Self { local, container }
    }

    /// Standard providers rooted at `work_root`
    pub fn with_work_root(work_root: impl Into<PathBuf>, keep_workspaces: bool) -> Self {
        let local = LocalEnvironmentProvider::new(work_root, keep_workspaces);
        let container = ContainerEnvironmentProvider::new(local.clone());
        Self::new(Arc::new(local), Arc::new(container))
    }

    fn provider_for(&self, instance: &JobInstance) -> &Arc<dyn EnvironmentProvider> {
        if instance.definition.container.is_some() {
            &self.container
        } else {
            &self.local
        }
    }
}

#[async_trait::async_trait]
impl EnvironmentProvider for Provisioner {
    async fn provision(&self, instance: &JobInstance) -> EngineResult<IsolatedEnvironment> {
        self.provider_for(instance).provision(instance).await
    }

    async fn release(&self, environment: IsolatedEnvironment) {
        let provider = if environment.is_container() {
            &self.container
        } else {
            &self.local
        };
        provider.release(environment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment(target: ExecTarget) -> IsolatedEnvironment {
        IsolatedEnvironment {
            name: "test-0".to_string(),
            root: PathBuf::from("/work/r1/test-0"),
            workspace: PathBuf::from("/work/r1/test-0/workspace"),
            files_dir: PathBuf::from("/work/r1/test-0/files"),
            target,
        }
    }

    #[test]
    fn test_visible_paths() {
        let host = environment(ExecTarget::Host);
        let file = PathBuf::from("/work/r1/test-0/files/env_1.txt");
        assert_eq!(host.visible_path(&file), "/work/r1/test-0/files/env_1.txt");
        assert_eq!(host.visible_workspace(), "/work/r1/test-0/workspace");

        let container = environment(ExecTarget::Container {
            id: "abc".to_string(),
            image: "python:3.11".to_string(),
        });
        assert_eq!(container.visible_path(&file), "/flowrun/files/env_1.txt");
        assert_eq!(
            container.visible_path(Path::new("/work/r1/test-0/workspace")),
            "/workspace"
        );
        assert_eq!(container.visible_workspace(), "/workspace");
    }

    #[test]
    fn test_container_command_uses_docker_exec() {
        let container = environment(ExecTarget::Container {
            id: "abc".to_string(),
            image: "python:3.11".to_string(),
        });
        let mut env = IndexMap::new();
        env.insert("CI".to_string(), "true".to_string());

        let cmd = container.command(
            "sh",
            &["-c".to_string(), "make".to_string()],
            Some("./pkg"),
            &env,
            &["/opt/bin".to_string()],
        );
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "docker");
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(&args[..3], &["exec", "-w", "/workspace/pkg"]);
        assert!(args.contains(&"CI=true".to_string()));
        assert!(args.iter().any(|a| a.starts_with("PATH=/opt/bin:")));
        assert_eq!(&args[args.len() - 4..], &["abc", "sh", "-c", "make"]);
    }

    #[test]
    fn test_join_path() {
        let joined = join_path(&["/a".to_string(), "/b".to_string()], "/usr/bin");
        if cfg!(windows) {
            assert_eq!(joined, "/a;/b;/usr/bin");
        } else {
            assert_eq!(joined, "/a:/b:/usr/bin");
        }
    }
}
