//! Shell tool: execute system commands.
//!
//! Streams stdout/stderr lines as they arrive, kills the child process on
//! cancellation and enforces a timeout.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use turnwright_core::error::ToolError;
use turnwright_core::tool::{OutputSink, Tool, ToolKind, ToolOutput};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Execute shell commands in the workspace.
pub struct ShellTool {
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellTool {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self {
            working_dir,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Read `reader` line by line, forwarding each line to `sink`.
async fn pump<R>(reader: Option<R>, sink: OutputSink) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut collected = String::new();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.emit(&line);
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout/stderr. Use this for running programs, builds, tests and git operations."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Execute
    }

    async fn execute(
        &self,
        args: Value,
        cancel: CancellationToken,
        output: OutputSink,
    ) -> Result<ToolOutput, ToolError> {
        let command = args["command"]
            .as_str()
            .ok_or_else(|| ToolError::invalid_args("shell", "missing 'command' argument"))?;

        debug!(command = %command, "Executing shell command");

        let mut child = self
            .command(command)
            .spawn()
            .map_err(|e| ToolError::failed("shell", e.to_string()))?;

        let stdout_task = tokio::spawn(pump(child.stdout.take(), output.clone()));
        let stderr_task = tokio::spawn(pump(child.stderr.take(), output));

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ToolError::Cancelled(format!("command '{command}' was interrupted")));
            }
            _ = tokio::time::sleep(self.timeout) => {
                let _ = child.kill().await;
                return Err(ToolError::Timeout {
                    tool_name: "shell".into(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
            status = child.wait() => status.map_err(|e| ToolError::failed("shell", e.to_string()))?,
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let text = if status.success() {
            if stderr.is_empty() {
                stdout
            } else {
                format!("{stdout}\n[stderr]: {stderr}")
            }
        } else {
            let code = status.code().unwrap_or(-1);
            warn!(command = %command, exit_code = code, "Command failed");
            format!("[exit code: {code}]\n{stdout}\n{stderr}")
        };

        let summary = match status.code() {
            Some(0) => "exited 0".to_string(),
            Some(code) => format!("exited {code}"),
            None => "terminated by signal".to_string(),
        };
        Ok(ToolOutput::new(text.trim()).with_summary(summary))
    }
}
