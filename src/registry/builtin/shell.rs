//! External command capability.
//!
//! Commands run through `sh -c` with:
//! - Optional working directory
//! - Timeout enforcement (the child is killed when the timeout fires)
//! - Output capture and truncation
//! - A small set of always-blocked patterns

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ShellConfig;
use crate::error::TaskError;
use crate::payload::{Args, Payload};
use crate::registry::Namespace;
use crate::task::Callable;

use super::require_text;

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Commands that are always refused.
static BLOCKED_COMMANDS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "rm -rf /",
        "rm -rf /*",
        ":(){ :|:& };:",
        "mkfs",
        "dd if=/dev/zero",
        "> /dev/sda",
    ]
});

/// Captured result of one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i64,
    pub success: bool,
}

impl CommandOutput {
    pub fn new(output: String, exit_code: i64) -> Self {
        Self {
            output,
            exit_code,
            success: exit_code == 0,
        }
    }
}

impl From<CommandOutput> for Payload {
    fn from(out: CommandOutput) -> Self {
        let mut map = BTreeMap::new();
        map.insert("output".to_string(), Payload::Text(out.output));
        map.insert("exit_code".to_string(), Payload::Int(out.exit_code));
        map.insert("success".to_string(), Payload::Bool(out.success));
        Payload::Map(map)
    }
}

/// Something that can execute an external command line.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput, TaskError>;
}

/// Runs commands through the system shell.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellCommand {
    pub fn new() -> Self {
        Self::from_config(&ShellConfig::default())
    }

    pub fn from_config(config: &ShellConfig) -> Self {
        Self {
            working_dir: config.working_dir.clone(),
            timeout: config.timeout,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn is_blocked(&self, command: &str) -> bool {
        let normalized = command.to_lowercase();
        BLOCKED_COMMANDS.iter().any(|b| normalized.contains(b))
    }

    /// A task-ready callable that runs `command` through `runner`.
    pub fn callable(runner: Arc<dyn CommandRunner>, command: impl Into<String>) -> Callable {
        let command: String = command.into();
        let name = format!("shell({})", truncate_for_error(&command));
        Callable::new_async(name, move |_args| {
            let runner = Arc::clone(&runner);
            let command = command.clone();
            async move { runner.run(&command).await.map(Payload::from) }
        })
    }

    /// The `shell` namespace: `shell.run(command)`.
    pub fn namespace(runner: Arc<dyn CommandRunner>) -> Namespace {
        let run = Callable::new_async("shell.run", move |args: Args| {
            let runner = Arc::clone(&runner);
            async move {
                let command = match args.get(0, "command") {
                    Some(value) => require_text("shell.run", value)?.to_string(),
                    None => return Err(TaskError::arguments("shell.run", "missing command")),
                };
                runner.run(&command).await.map(Payload::from)
            }
        });
        Namespace::new("shell").callable("run", run)
    }
}

impl Default for ShellCommand {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellCommand {
    async fn run(&self, command: &str) -> Result<CommandOutput, TaskError> {
        if self.is_blocked(command) {
            return Err(TaskError::fault(format!(
                "command contains blocked pattern: {}",
                truncate_for_error(command)
            )));
        }

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| TaskError::fault(format!("failed to spawn command: {e}")))?;

        let result = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(TaskError::fault(format!("command execution failed: {e}"))),
            Err(_) => {
                return Err(TaskError::fault(format!(
                    "command timed out after {:?}: {}",
                    self.timeout,
                    truncate_for_error(command)
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.into_owned()
        } else if stdout.is_empty() {
            stderr.into_owned()
        } else {
            format!("{stdout}\n\n--- stderr ---\n{stderr}")
        };
        let code = output.status.code().unwrap_or(-1) as i64;
        tracing::debug!(command = %truncate_for_error(command), exit_code = code, "Command finished");
        Ok(CommandOutput::new(truncate_output(&combined), code))
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Largest byte index <= `i` that is a char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}
