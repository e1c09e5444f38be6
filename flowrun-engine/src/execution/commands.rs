// File Commands
// Env, output and PATH files that steps write to talk back to the engine

use crate::environment::IsolatedEnvironment;

use indexmap::IndexMap;

use std::path::{Path, PathBuf};

/// Changes requested by a step through its command files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandUpdates {
    pub env: IndexMap<String, String>,
    pub outputs: IndexMap<String, String>,
    pub path: Vec<String>,
}

/// Command files of one step attempt.
///
/// Steps find the files through `FLOWRUN_ENV`, `FLOWRUN_OUTPUT` and
/// `FLOWRUN_PATH` (and the `GITHUB_*` aliases).
#[derive(Debug)]
pub struct FileCommands {
    env_file: PathBuf,
    output_file: PathBuf,
    path_file: PathBuf,
}

impl FileCommands {
    /// Create empty command files in the environment's files directory
    pub async fn create(environment: &IsolatedEnvironment) -> std::io::Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let commands = Self {
            env_file: environment.files_dir.join(format!("env_{}", id)),
            output_file: environment.files_dir.join(format!("output_{}", id)),
            path_file: environment.files_dir.join(format!("path_{}", id)),
        };

        for file in [&commands.env_file, &commands.output_file, &commands.path_file] {
            tokio::fs::write(file, "").await?;
        }
        Ok(commands)
    }

    /// Variables pointing the step at its command files
    pub fn variables(&self, environment: &IsolatedEnvironment) -> IndexMap<String, String> {
        let env = environment.visible_path(&self.env_file);
        let output = environment.visible_path(&self.output_file);
        let path = environment.visible_path(&self.path_file);

        let mut vars = IndexMap::new();
        vars.insert("FLOWRUN_ENV".to_string(), env.clone());
        vars.insert("GITHUB_ENV".to_string(), env);
        vars.insert("FLOWRUN_OUTPUT".to_string(), output.clone());
        vars.insert("GITHUB_OUTPUT".to_string(), output);
        vars.insert("FLOWRUN_PATH".to_string(), path.clone());
        vars.insert("GITHUB_PATH".to_string(), path);
        vars
    }

    /// Read what the step wrote and delete the files
    pub async fn collect(self) -> CommandUpdates {
        let env = read(&self.env_file).await;
        let outputs = read(&self.output_file).await;
        let path = read(&self.path_file).await;

        for file in [&self.env_file, &self.output_file, &self.path_file] {
            let _ = tokio::fs::remove_file(file).await;
        }

        CommandUpdates {
            env: parse_assignments(&env),
            outputs: parse_assignments(&outputs),
            path: path
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

async fn read(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "command file unreadable");
            String::new()
        }
    }
}

/// Parse `NAME=VALUE` lines and `NAME<<DELIMITER` heredocs
pub fn parse_assignments(content: &str) -> IndexMap<String, String> {
    let mut values = IndexMap::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let heredoc = trimmed.find("<<");
        let assign = trimmed.find('=');

        match (heredoc, assign) {
            // `<<` before any `=` starts a heredoc
            (Some(pos), eq) if eq.map_or(true, |eq| pos < eq) => {
                let name = trimmed[..pos].trim();
                let delimiter = trimmed[pos + 2..].trim();
                if name.is_empty() || delimiter.is_empty() {
                    tracing::warn!(line = trimmed, "invalid heredoc in command file");
                    continue;
                }

                let mut body = Vec::new();
                let mut terminated = false;
                for value_line in lines.by_ref() {
                    if value_line.trim_end() == delimiter {
                        terminated = true;
                        break;
                    }
                    body.push(value_line);
                }
                if !terminated {
                    tracing::warn!(name, delimiter, "unterminated heredoc in command file");
                }
                values.insert(name.to_string(), body.join("\n"));
            }
            (_, Some(pos)) => {
                let name = trimmed[..pos].trim();
                if name.is_empty() {
                    tracing::warn!(line = trimmed, "empty name in command file");
                    continue;
                }
                values.insert(name.to_string(), trimmed[pos + 1..].to_string());
            }
            _ => tracing::warn!(line = trimmed, "unrecognized command file line"),
        }
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ExecTarget;

    #[test]
    fn test_parse_simple_assignments() {
        let parsed = parse_assignments("MY_VAR=hello\n\nOTHER=a=b\n");
        assert_eq!(parsed["MY_VAR"], "hello");
        assert_eq!(parsed["OTHER"], "a=b");
    }

    #[test]
    fn test_parse_heredoc() {
        let parsed = parse_assignments("NOTES<<EOF\nline1\nline2\nEOF\nAFTER=1\n");
        assert_eq!(parsed["NOTES"], "line1\nline2");
        assert_eq!(parsed["AFTER"], "1");
    }

    #[test]
    fn test_value_containing_heredoc_marker() {
        let parsed = parse_assignments("CMD=cat <<EOF\n");
        assert_eq!(parsed["CMD"], "cat <<EOF");
    }

    #[test]
    fn test_later_assignment_wins() {
        let parsed = parse_assignments("A=1\nA=2\n");
        assert_eq!(parsed["A"], "2");
        assert_eq!(parsed.len(), 1);
    }

    #[tokio::test]
    async fn test_create_and_collect() {
        let dir = tempfile::tempdir().unwrap();
        let environment = IsolatedEnvironment::create("test-0", dir.path().join("test-0"))
            .await
            .unwrap();
        assert_eq!(environment.target, ExecTarget::Host);

        let commands = FileCommands::create(&environment).await.unwrap();
        let vars = commands.variables(&environment);
        assert_eq!(vars["FLOWRUN_ENV"], vars["GITHUB_ENV"]);

        tokio::fs::write(&vars["FLOWRUN_ENV"], "COVERAGE=cov.xml\n").await.unwrap();
        tokio::fs::write(&vars["GITHUB_OUTPUT"], "version=1.0\n").await.unwrap();
        tokio::fs::write(&vars["FLOWRUN_PATH"], "/opt/tool/bin\n\n").await.unwrap();

        let updates = commands.collect().await;
        assert_eq!(updates.env["COVERAGE"], "cov.xml");
        assert_eq!(updates.outputs["version"], "1.0");
        assert_eq!(updates.path, vec!["/opt/tool/bin"]);

        let leftover = std::fs::read_dir(&environment.files_dir).unwrap().count();
        assert_eq!(leftover, 0);
    }
}
