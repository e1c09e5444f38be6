// Utility Functions
// Source root detection and environment variable naming

use std::path::{Path, PathBuf};

/// Find the root of a git repository by walking up from the given starting path.
///
/// Traverses ancestor directories looking for a `.git` entry, which indicates
/// the repository root. Returns `None` if no `.git` entry is found.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    // Canonicalize to resolve symlinks and get an absolute path
    let start = start.canonicalize().ok()?;
    start
        .ancestors()
        .find(|ancestor| ancestor.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Resolve the directory that `checkout` copies into each workspace.
///
/// The git repository root containing the current directory, else the
/// current directory itself.
pub fn resolve_source_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_repo_root(&cwd).unwrap_or(cwd)
}

/// Whether `value` can be used as a single directory or container name
/// segment: ASCII letters, digits, `-`, `_` and `.`, not starting with `.`
/// or `-`
pub fn is_safe_segment(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && !value.starts_with(['.', '-'])
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Environment variable name for a matrix axis or input, e.g.
/// `MATRIX_PYTHON_VERSION` for axis `python-version`
pub fn env_var_name(prefix: &str, name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}", prefix, suffix)
}
