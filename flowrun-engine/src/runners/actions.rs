// Built-in Actions
// checkout, setup-<tool> and upload-artifact

use super::shell::run_streaming;
use super::{StepContext, StepOutcome, StepRunner};
use crate::artifacts::Artifact;
use crate::execution::events::ExecutionEvent;

use chrono::Utc;
use tokio::process::Command;
use walkdir::WalkDir;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Populates the workspace from the source directory.
///
/// Git repositories are cloned (`ref` checked out when given); any other
/// source tree is copied. `path` places the checkout below the workspace.
pub struct Checkout;

impl Checkout {
    async fn run_git(ctx: &StepContext<'_>, args: &[&str]) -> Result<(), String> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&ctx.environment.workspace);
        match run_streaming(cmd, ctx).await {
            Ok(Some(0)) => Ok(()),
            Ok(code) => Err(format!(
                "git {} failed with exit code {}",
                args.first().copied().unwrap_or_default(),
                code.map_or_else(|| "none".to_string(), |c| c.to_string())
            )),
            Err(e) => Err(format!("failed to run git: {}", e)),
        }
    }

    async fn clone_repository(ctx: &StepContext<'_>, target: &Path, git_ref: Option<&str>) -> Result<(), String> {
        let source = ctx.source_dir.to_string_lossy().to_string();
        let target_str = target.to_string_lossy().to_string();
        Self::run_git(ctx, &["clone", "--quiet", &source, &target_str]).await?;

        if let Some(git_ref) = git_ref {
            Self::run_git(ctx, &["-C", &target_str, "checkout", "--quiet", git_ref]).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StepRunner for Checkout {
    async fn run(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let target = match ctx.input("path") {
            Some(path) => ctx.environment.workspace.join(path),
            None => ctx.environment.workspace.clone(),
        };
        let git_ref = ctx.input("ref");
        let is_repository = ctx.source_dir.join(".git").exists();

        if is_repository && which::which("git").is_ok() {
            ctx.emit_output(
                format!(
                    "Cloning {} ({})",
                    ctx.source_dir.display(),
                    git_ref.unwrap_or("HEAD")
                ),
                false,
            );
            return match Self::clone_repository(ctx, &target, git_ref).await {
                Ok(()) => StepOutcome::success(),
                Err(e) => StepOutcome::failure(e),
            };
        }

        if let Some(git_ref) = git_ref {
            return StepOutcome::failure(format!(
                "cannot check out '{}': {} is not a git repository",
                git_ref,
                ctx.source_dir.display()
            ));
        }

        ctx.emit_output(format!("Copying {}", ctx.source_dir.display()), false);
        let source = ctx.source_dir.to_path_buf();
        let skip = ctx.environment.root.clone();
        let copy = tokio::task::spawn_blocking(move || copy_tree(&source, &target, &skip)).await;
        match copy {
            Ok(Ok(count)) => {
                ctx.emit_output(format!("Copied {} files", count), false);
                StepOutcome::success()
            }
            Ok(Err(e)) => StepOutcome::failure(format!("failed to copy source tree: {}", e)),
            Err(e) => StepOutcome::failure(format!("copy task failed: {}", e)),
        }
    }
}

/// Copy `source` into `target`, leaving out `.git` and the tree containing
/// `skip` (the environment itself when the work root lies inside the source)
fn copy_tree(source: &Path, target: &Path, skip: &Path) -> std::io::Result<usize> {
    let source = source.canonicalize()?;
    let skip = skip.canonicalize().unwrap_or_else(|_| skip.to_path_buf());
    let mut copied = 0;

    let walker = WalkDir::new(&source).into_iter().filter_entry(|entry| {
        entry.depth() == 0 || (entry.file_name() != ".git" && !skip.starts_with(entry.path()))
    });

    for entry in walker {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(&source) else {
            continue;
        };
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &destination)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Verifies a toolchain is available inside the environment.
///
/// Requested versions are reported, not enforced.
pub struct ToolSetup {
    tool: String,
}

impl ToolSetup {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }

    /// Executables that satisfy the tool, in preference order
    pub fn candidates(&self) -> Vec<&str> {
        match self.tool.as_str() {
            "python" => vec!["python3", "python"],
            "rust" => vec!["cargo"],
            other => vec![other],
        }
    }
}

#[async_trait::async_trait]
impl StepRunner for ToolSetup {
    async fn run(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let version_key = format!("{}-version", self.tool);
        if let Some(version) = ctx.input(&version_key).or_else(|| ctx.input("version")) {
            ctx.emit_output(
                format!("Requested {} {}; using the installed version", self.tool, version),
                false,
            );
        }

        let candidates = self.candidates();
        let probe = candidates
            .iter()
            .map(|candidate| format!("command -v {}", candidate))
            .collect::<Vec<_>>()
            .join(" || ");

        let cmd = ctx.environment.command(
            "sh",
            &["-c".to_string(), probe],
            None,
            ctx.env,
            ctx.path_prepends,
        );

        match run_streaming(cmd, ctx).await {
            Ok(Some(0)) => StepOutcome::success(),
            Ok(_) => StepOutcome::failure(format!(
                "{} is not available in the environment (looked for {})",
                self.tool,
                candidates.join(", ")
            )),
            Err(e) => StepOutcome::failure(format!("failed to probe for {}: {}", self.tool, e)),
        }
    }
}

/// What to do when no file matches the upload paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfNoFilesFound {
    Warn,
    Error,
    Ignore,
}

impl IfNoFilesFound {
    fn parse(value: Option<&str>) -> Result<Self, String> {
        match value.map(str::trim) {
            None | Some("warn") => Ok(Self::Warn),
            Some("error") => Ok(Self::Error),
            Some("ignore") => Ok(Self::Ignore),
            Some(other) => Err(format!(
                "invalid if-no-files-found '{}', expected warn, error or ignore",
                other
            )),
        }
    }
}

/// Stores workspace files in the artifact store.
///
/// `path` holds one glob per line, relative to the workspace; lines starting
/// with `!` exclude matches. A single matched file is stored as `name`,
/// several as `name/<path relative to the workspace>`.
pub struct UploadArtifact;

impl UploadArtifact {
    /// Files matched by the `path` patterns, in match order without duplicates
    pub fn matched_files(workspace: &Path, patterns: &str) -> Result<Vec<PathBuf>, String> {
        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        for line in patterns.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.strip_prefix('!') {
                Some(pattern) => excludes.push(Self::compile(pattern.trim())?),
                None => includes.push(line),
            }
        }

        let mut seen = HashSet::new();
        let mut files = Vec::new();
        for pattern in includes {
            let full = Self::absolute(workspace, pattern);
            let matches = glob::glob(&full.to_string_lossy())
                .map_err(|e| format!("invalid path pattern '{}': {}", pattern, e))?;

            for path in matches.flatten() {
                let candidates: Vec<PathBuf> = if path.is_dir() {
                    WalkDir::new(&path)
                        .sort_by_file_name()
                        .into_iter()
                        .flatten()
                        .filter(|entry| entry.file_type().is_file())
                        .map(|entry| entry.into_path())
                        .collect()
                } else {
                    vec![path]
                };

                for file in candidates {
                    let relative = relative_name(workspace, &file);
                    if excludes.iter().any(|exclude| exclude.matches(&relative)) {
                        continue;
                    }
                    if seen.insert(file.clone()) {
                        files.push(file);
                    }
                }
            }
        }

        Ok(files)
    }

    fn compile(pattern: &str) -> Result<glob::Pattern, String> {
        glob::Pattern::new(pattern.trim_start_matches("./"))
            .map_err(|e| format!("invalid exclude pattern '{}': {}", pattern, e))
    }

    fn absolute(workspace: &Path, pattern: &str) -> PathBuf {
        if Path::new(pattern).is_absolute() {
            PathBuf::from(pattern)
        } else {
            workspace.join(pattern.trim_start_matches("./").trim_end_matches('/'))
        }
    }

    async fn upload(
        ctx: &StepContext<'_>,
        name: &str,
        files: Vec<PathBuf>,
        overwrite: bool,
    ) -> StepOutcome {
        let single = files.len() == 1;
        let mut artifacts = Vec::new();

        for file in files {
            let artifact_name = if single {
                name.to_string()
            } else {
                format!("{}/{}", name, relative_name(&ctx.environment.workspace, &file))
            };

            let bytes = match tokio::fs::read(&file).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    return StepOutcome::failure(format!("failed to read {}: {}", file.display(), e))
                        .with_artifacts(artifacts)
                }
            };

            match ctx
                .artifacts
                .put(&ctx.instance.run_id, &artifact_name, bytes, overwrite)
                .await
            {
                Ok(handle) => {
                    ctx.emit(ExecutionEvent::ArtifactUploaded {
                        instance: ctx.instance.key(),
                        name: handle.name.clone(),
                        size: handle.size,
                    });
                    tracing::info!(
                        instance = %ctx.instance.key(),
                        artifact = %handle.name,
                        size = handle.size,
                        "uploaded artifact"
                    );
                    artifacts.push(Artifact {
                        handle,
                        source_path: file,
                        instance: ctx.instance.key(),
                        created_at: Utc::now(),
                    });
                }
                Err(e) => return StepOutcome::failure(e.to_string()).with_artifacts(artifacts),
            }
        }

        StepOutcome::success().with_artifacts(artifacts)
    }
}

#[async_trait::async_trait]
impl StepRunner for UploadArtifact {
    async fn run(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let name = ctx.input("name").unwrap_or("artifact").trim().to_string();
        let Some(patterns) = ctx.input("path") else {
            return StepOutcome::failure("upload-artifact requires a 'path' input");
        };
        let if_no_files_found = match IfNoFilesFound::parse(ctx.input("if-no-files-found")) {
            Ok(policy) => policy,
            Err(e) => return StepOutcome::failure(e),
        };
        let overwrite = matches!(ctx.input("overwrite").map(str::trim), Some("true"));

        let files = match Self::matched_files(&ctx.environment.workspace, patterns) {
            Ok(files) => files,
            Err(e) => return StepOutcome::failure(e),
        };

        if files.is_empty() {
            let message = format!("No files were found with the provided path: {}", patterns.trim());
            return match if_no_files_found {
                IfNoFilesFound::Error => StepOutcome::failure(message),
                IfNoFilesFound::Warn => {
                    ctx.emit(ExecutionEvent::warning(message.clone(), Some(ctx.instance.key())));
                    tracing::warn!(instance = %ctx.instance.key(), "{}", message);
                    StepOutcome::success()
                }
                IfNoFilesFound::Ignore => StepOutcome::success(),
            };
        }

        Self::upload(ctx, &name, files, overwrite).await
    }
}

/// `/`-separated path of `file` relative to `workspace` (file name when
/// the file lies outside it)
fn relative_name(workspace: &Path, file: &Path) -> String {
    match file.strip_prefix(workspace) {
        Ok(relative) => relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default(),
    }
}
