// Shell Runner
// Executes inline `run:` scripts with bash, sh, pwsh or python

use super::{StepContext, StepOutcome, StepRunner};
use crate::definition::StepKind;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};

use std::io;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Shells supported for inline commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// `bash --noprofile --norc -e -o pipefail`
    Bash,
    /// `sh -e`
    Sh,
    /// PowerShell Core with `$ErrorActionPreference = 'stop'`
    Pwsh,
    /// Script passed to `python -c`
    Python,
}

impl Shell {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "bash" => Some(Shell::Bash),
            "sh" => Some(Shell::Sh),
            "pwsh" | "powershell" => Some(Shell::Pwsh),
            "python" | "python3" => Some(Shell::Python),
            _ => None,
        }
    }

    /// Program and arguments running `script`
    fn command(&self, script: &str) -> (&'static str, Vec<String>) {
        let args: &[&str] = match self {
            Shell::Bash => &["--noprofile", "--norc", "-e", "-o", "pipefail", "-c"],
            Shell::Sh => &["-e", "-c"],
            Shell::Pwsh => &["-NoLogo", "-NoProfile", "-NonInteractive", "-Command"],
            Shell::Python => &["-c"],
        };
        let mut args: Vec<String> = args.iter().map(|a| a.to_string()).collect();

        match self {
            Shell::Pwsh => args.push(format!("$ErrorActionPreference = 'stop'\n{}", script)),
            _ => args.push(script.to_string()),
        }

        let program = match self {
            Shell::Bash => "bash",
            Shell::Sh => "sh",
            Shell::Pwsh => "pwsh",
            Shell::Python => "python",
        };
        (program, args)
    }
}

/// Shell runner for inline commands
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    /// Shell used when a step names none
    default_shell: Option<Shell>,
}

impl ShellRunner {
    /// Runner choosing bash when it is installed and sh otherwise
    pub fn new() -> Self {
        Self { default_shell: None }
    }

    /// Create a shell runner with a specific default shell
    pub fn with_default_shell(shell: Shell) -> Self {
        Self {
            default_shell: Some(shell),
        }
    }

    /// Shell for a step: its own `shell:`, else the configured default,
    /// else bash on hosts that have it and sh everywhere else
    pub fn shell_for(&self, requested: Option<&str>, in_container: bool) -> Result<Shell, String> {
        if let Some(name) = requested {
            return Shell::parse(name).ok_or_else(|| {
                format!(
                    "unsupported shell '{}', expected bash, sh, pwsh or python",
                    name
                )
            });
        }
        if let Some(shell) = self.default_shell {
            return Ok(shell);
        }
        if !in_container && which::which("bash").is_ok() {
            Ok(Shell::Bash)
        } else {
            Ok(Shell::Sh)
        }
    }
}

#[async_trait::async_trait]
impl StepRunner for ShellRunner {
    async fn run(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let StepKind::InlineCommand { script, shell } = &ctx.step.kind else {
            return StepOutcome::failure("shell runner received an action step");
        };

        let shell = match self.shell_for(shell.as_deref(), ctx.environment.is_container()) {
            Ok(shell) => shell,
            Err(e) => return StepOutcome::failure(e),
        };
        let (program, args) = shell.command(script);

        let cmd = ctx.environment.command(
            program,
            &args,
            ctx.step.working_directory.as_deref(),
            ctx.env,
            ctx.path_prepends,
        );

        match run_streaming(cmd, ctx).await {
            Ok(code) => StepOutcome::from_exit_code(code),
            Err(e) => StepOutcome::failure(format!("Failed to spawn '{}': {}", program, e)),
        }
    }
}

/// Spawn `cmd`, forward its output lines as step output events and wait
/// for it. Returns the exit code (`None` when killed by a signal).
///
/// The child is killed if the returned future is dropped.
pub(crate) async fn run_streaming(
    mut cmd: Command,
    ctx: &StepContext<'_>,
) -> io::Result<Option<i32>> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr was not captured"))?;

    let instance = ctx.instance.key();
    let step_index = ctx.step.index;
    let stdout_handle = tokio::spawn(forward_lines(
        stdout,
        instance.clone(),
        step_index,
        ctx.events.clone(),
        false,
    ));
    let stderr_handle = tokio::spawn(forward_lines(
        stderr,
        instance,
        step_index,
        ctx.events.clone(),
        true,
    ));

    let status = child.wait().await?;
    let _ = stdout_handle.await;
    let _ = stderr_handle.await;

    Ok(status.code())
}

async fn forward_lines<R>(
    reader: R,
    instance: String,
    step_index: usize,
    events: Option<ProgressSender>,
    is_error: bool,
) where
    R: AsyncRead + Unpin,
{
    // Raw bytes: invalid UTF-8 is replaced, never ends the stream
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(instance = %instance, step = step_index, error = %e, "output closed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']).to_string();
        tracing::trace!(instance = %instance, step = step_index, is_error, "{}", line);
        events.send_event(ExecutionEvent::step_output(
            instance.as_str(),
            step_index,
            line,
            is_error,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::progress_channel;
    use crate::runners::tests::Fixture;

    fn inline(script: &str) -> StepKind {
        StepKind::InlineCommand {
            script: script.to_string(),
            shell: None,
        }
    }

    #[test]
    fn test_shell_parse_and_command() {
        assert_eq!(Shell::parse("bash"), Some(Shell::Bash));
        assert_eq!(Shell::parse("powershell"), Some(Shell::Pwsh));
        assert_eq!(Shell::parse("cmd"), None);

        let (program, args) = Shell::Bash.command("echo hi");
        assert_eq!(program, "bash");
        assert!(args.contains(&"pipefail".to_string()));
        assert_eq!(args.last().unwrap(), "echo hi");
    }

    #[test]
    fn test_shell_selection() {
        let runner = ShellRunner::new();
        assert_eq!(runner.shell_for(Some("sh"), false), Ok(Shell::Sh));
        assert!(runner.shell_for(Some("fish"), false).is_err());
        assert_eq!(runner.shell_for(None, true), Ok(Shell::Sh));

        let pinned = ShellRunner::with_default_shell(Shell::Python);
        assert_eq!(pinned.shell_for(None, false), Ok(Shell::Python));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_success_streams_output() {
        let mut fixture = Fixture::new(inline("echo hello\necho oops >&2")).await;
        let (tx, mut rx) = progress_channel();
        fixture.events = Some(tx);

        let outcome = ShellRunner::new().run(&fixture.ctx()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.exit_code, Some(0));

        drop(fixture);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::StepOutput { output, is_error, .. } = event {
                if is_error {
                    stderr.push(output);
                } else {
                    stdout.push(output);
                }
            }
        }
        assert_eq!(stdout, vec!["hello"]);
        assert_eq!(stderr, vec!["oops"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_output_keeps_draining() {
        let script = "printf '\\377caf\\351\\n'\ni=0\nwhile [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done\nexit 0";
        let mut fixture = Fixture::new(inline(script)).await;
        let (tx, mut rx) = progress_channel();
        fixture.events = Some(tx);

        let outcome = ShellRunner::new().run(&fixture.ctx()).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.exit_code, Some(0));

        drop(fixture);
        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::StepOutput { output, .. } = event {
                lines.push(output);
            }
        }
        assert_eq!(lines.len(), 20001);
        assert!(lines[0].contains('\u{FFFD}'));
        assert_eq!(lines[20000], "line 19999");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_failure_exit_code() {
        let fixture = Fixture::new(inline("exit 3")).await;
        let outcome = ShellRunner::new().run(&fixture.ctx()).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_errexit_stops_script() {
        let fixture = Fixture::new(inline("false\ntouch should-not-exist")).await;
        let outcome = ShellRunner::new().run(&fixture.ctx()).await;
        assert!(!outcome.is_success());
        assert!(!fixture
            .environment
            .workspace
            .join("should-not-exist")
            .exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_and_working_directory() {
        let mut fixture = Fixture::new(inline("echo \"$GREETING\" > greeting.txt")).await;
        fixture
            .env
            .insert("GREETING".to_string(), "hi there".to_string());
        std::fs::create_dir(fixture.environment.workspace.join("pkg")).unwrap();
        fixture.step.working_directory = Some("pkg".to_string());

        let outcome = ShellRunner::new().run(&fixture.ctx()).await;
        assert!(outcome.is_success());
        let written =
            std::fs::read_to_string(fixture.environment.workspace.join("pkg/greeting.txt"))
                .unwrap();
        assert_eq!(written.trim(), "hi there");
    }

    #[tokio::test]
    async fn test_missing_shell_binary() {
        let fixture = Fixture::new(StepKind::InlineCommand {
            script: "echo hi".to_string(),
            shell: Some("fish".to_string()),
        })
        .await;
        let outcome = ShellRunner::new().run(&fixture.ctx()).await;
        assert!(outcome.error.unwrap().contains("unsupported shell"));
    }
}
