// CLI subcommands

pub mod artifacts;
pub mod matrix;
pub mod run;
pub mod validate;

use crate::output;

use std::path::{Path, PathBuf};

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use flowrun_engine::utils::resolve_source_dir;
use flowrun_engine::{DefinitionLoader, EngineConfig, Workflow};

/// Options shared by every subcommand
#[derive(Debug, Clone, Default)]
pub struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub quiet: bool,
}

/// Engine config from `--config`, else `.flowrun.yml` at the source root
pub fn load_config(global: &GlobalArgs, source: Option<&Path>) -> Result<EngineConfig> {
    let mut config = match &global.config {
        Some(path) => EngineConfig::load(path)
            .wrap_err_with(|| format!("Failed to load config {}", path.display()))?,
        None => {
            let root = source.map(Path::to_path_buf).unwrap_or_else(resolve_source_dir);
            EngineConfig::discover(&root).wrap_err("Failed to load .flowrun.yml")?
        }
    };

    if let Some(source) = source {
        config.source_dir = source.to_path_buf();
    }
    Ok(config)
}

/// Parse a workflow file, printing parse errors with their context
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    if !path.exists() {
        bail!("Workflow file not found: {}", path.display());
    }

    match DefinitionLoader::from_file(path) {
        Ok(workflow) => Ok(workflow),
        Err(e) => {
            output::error(&format!("{}: {}", path.display(), e));
            bail!("Invalid workflow {}", path.display())
        }
    }
}

/// Split `NAME=VALUE` pairs
pub fn parse_assignments(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                Ok((name.trim().to_string(), value.to_string()))
            }
            _ => bail!("Invalid input format '{}'. Expected name=value", pair),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignments() {
        let parsed = parse_assignments(&["branch=main".to_string(), "expr=a=b".to_string()]).unwrap();
        assert_eq!(parsed[0], ("branch".to_string(), "main".to_string()));
        assert_eq!(parsed[1], ("expr".to_string(), "a=b".to_string()));

        assert!(parse_assignments(&["novalue".to_string()]).is_err());
        assert!(parse_assignments(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_load_config_prefers_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.yml");
        std::fs::write(&path, "max-parallel: 7\n").unwrap();
        std::fs::write(dir.path().join(".flowrun.yml"), "max-parallel: 3\n").unwrap();

        let global = GlobalArgs {
            config: Some(path),
            quiet: false,
        };
        assert_eq!(load_config(&global, Some(dir.path())).unwrap().max_parallel, 7);

        let discovered = load_config(&GlobalArgs::default(), Some(dir.path())).unwrap();
        assert_eq!(discovered.max_parallel, 3);
        assert_eq!(discovered.source_dir, dir.path());
    }

    #[test]
    fn test_load_workflow_reports_missing_file() {
        let err = load_workflow(Path::new("/nonexistent/ci.yml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
