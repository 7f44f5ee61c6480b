//! External tool execution: spawning, output streaming, time bounds.
//!
//! Every call into the Android toolchain (`repo`, `git`, `make`/`mka`) goes
//! through the `Toolchain` trait and returns a tagged `ToolOutcome`. Stages never
//! poll shared flags; the deadline is part of the call.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

use crate::error::BuildError;
use crate::log_collector::LogCollector;
use crate::orchestrator::state::BuildStage;

/// Purpose of an invocation. Lets simulated toolchains react per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolStep {
    ProbeTool,
    ManifestInit,
    ManifestSync,
    TreeClone,
    TreeUpdate,
    Compile,
}

/// One external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub step: ToolStep,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ToolInvocation {
    pub fn new(step: ToolStep, program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        ToolInvocation {
            step,
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Value of an environment override, if set.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Shell-like rendering for the build log.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Tagged result of one time-bounded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success,
    Failed { code: Option<i32>, message: String },
    TimedOut,
}

impl ToolOutcome {
    /// Map onto the in-run error taxonomy for `stage`.
    pub fn into_result(self, stage: BuildStage, timeout_secs: u64) -> Result<(), BuildError> {
        match self {
            ToolOutcome::Success => Ok(()),
            ToolOutcome::Failed { message, .. } => Err(BuildError::StageFailure { stage, message }),
            ToolOutcome::TimedOut => Err(BuildError::StageTimeout {
                stage,
                seconds: timeout_secs,
            }),
        }
    }
}

/// The external Android build toolchain.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Whether `name` is installed and runnable.
    async fn tool_available(&self, name: &str) -> bool;

    /// Run `invocation`, streaming its output into `log`, until it exits or
    /// `deadline` passes.
    async fn run(
        &self,
        invocation: &ToolInvocation,
        deadline: Instant,
        log: &LogCollector,
    ) -> ToolOutcome;
}

/// Toolchain backed by real processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessToolchain;

impl ProcessToolchain {
    pub fn new() -> Self {
        ProcessToolchain
    }
}

#[async_trait]
impl Toolchain for ProcessToolchain {
    async fn tool_available(&self, name: &str) -> bool {
        matches!(
            Command::new("which")
                .arg(name)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await,
            Ok(status) if status.success()
        )
    }

    async fn run(
        &self,
        invocation: &ToolInvocation,
        deadline: Instant,
        log: &LogCollector,
    ) -> ToolOutcome {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ToolOutcome::Failed {
                    code: None,
                    message: format!(
                        "Failed to spawn {} in {}: {}",
                        invocation.program,
                        invocation.cwd.display(),
                        e
                    ),
                }
            }
        };

        // Dropping the future on timeout drops the child, which kills it.
        match tokio::time::timeout_at(deadline, stream_until_exit(child, &invocation.program, log))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                log.log_str(format!("[TIMEOUT] {} exceeded its deadline", invocation.program));
                ToolOutcome::TimedOut
            }
        }
    }
}

async fn stream_until_exit(
    mut child: tokio::process::Child,
    program: &str,
    log: &LogCollector,
) -> ToolOutcome {
    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            return ToolOutcome::Failed {
                code: None,
                message: format!("Failed to capture output of {}", program),
            }
        }
    };

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_closed = false;
    let mut stderr_closed = false;
    let mut last_stderr: Option<String> = None;

    while !(stdout_closed && stderr_closed) {
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_closed => match line {
                Ok(Some(line)) => log.log_str(line),
                Ok(None) => stdout_closed = true,
                Err(e) => {
                    log.log_str(format!("stdout read error: {}", e));
                    stdout_closed = true;
                }
            },
            line = stderr_lines.next_line(), if !stderr_closed => match line {
                Ok(Some(line)) => {
                    log.log_str(format!("[STDERR] {}", line));
                    if !line.trim().is_empty() {
                        last_stderr = Some(line);
                    }
                }
                Ok(None) => stderr_closed = true,
                Err(e) => {
                    log.log_str(format!("stderr read error: {}", e));
                    stderr_closed = true;
                }
            },
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => ToolOutcome::Success,
        Ok(status) => {
            let mut message = match status.code() {
                Some(code) => format!("{} exited with code {}", program, code),
                None => format!("{} terminated by signal", program),
            };
            if let Some(last) = last_stderr {
                message.push_str(": ");
                message.push_str(&last);
            }
            ToolOutcome::Failed {
                code: status.code(),
                message,
            }
        }
        Err(e) => ToolOutcome::Failed {
            code: None,
            message: format!("Failed to wait for {}: {}", program, e),
        },
    }
}
