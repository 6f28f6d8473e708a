//! Resolving collaborator programs and running them.
//!
//! Collaborators are addressed by a logical name (`gpio_blink`, `spi_sd_card`)
//! and resolved against an apps directory. The same [`Launcher`] builds the
//! command for long-running tasks (see [`crate::slot`]) and for run-to-completion
//! calls made through an [`Invoker`].

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::channel::LogMessage;
use crate::process_group::{self, GroupGuard};

pub const DEFAULT_ONESHOT_TIMEOUT: Duration = Duration::from_secs(30);

/// A program name plus the arguments it is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl TaskSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Could not find {program}")]
    NotFound { program: String, path: PathBuf },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} timed out after {secs}s")]
    TimedOut { program: String, secs: f32 },
}

impl LaunchError {
    /// Classify a spawn failure; a missing binary or interpreter is `NotFound`.
    pub fn from_spawn(program: &str, path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound {
                program: program.to_string(),
                path: path.to_path_buf(),
            }
        } else {
            Self::Spawn {
                program: program.to_string(),
                source,
            }
        }
    }
}

/// Maps logical program names to commands.
#[derive(Debug, Clone)]
pub struct Launcher {
    apps_dir: PathBuf,
    interpreter: Option<String>,
    suffix: String,
}

impl Default for Launcher {
    fn default() -> Self {
        Self {
            apps_dir: PathBuf::from("."),
            interpreter: None,
            suffix: String::new(),
        }
    }
}

impl Launcher {
    pub fn new(apps_dir: impl Into<PathBuf>) -> Self {
        Self {
            apps_dir: apps_dir.into(),
            ..Self::default()
        }
    }

    /// Run every program through `interpreter` (e.g. `python3`).
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    /// Appended to the logical name when resolving the file (e.g. `.py`).
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn apps_dir(&self) -> &Path {
        &self.apps_dir
    }

    pub fn resolve(&self, program: &str) -> PathBuf {
        self.apps_dir.join(format!("{}{}", program, self.suffix))
    }

    /// Build the command for `spec`.
    ///
    /// Output pipes are left to the caller. The child gets a null stdin, its own
    /// process group and unbuffered Python output.
    pub fn command(&self, spec: &TaskSpec) -> Result<Command, LaunchError> {
        let path = self.resolve(&spec.program);
        if !path.is_file() {
            return Err(LaunchError::NotFound {
                program: spec.program.clone(),
                path,
            });
        }

        let mut cmd = match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&path);
                cmd
            }
            None => Command::new(&path),
        };
        cmd.args(&spec.args)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        process_group::isolate(&mut cmd);

        Ok(cmd)
    }
}

/// Captured result of a run-to-completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Completion {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Render the captured output as outbound log lines.
    ///
    /// Each non-empty stdout line is passed through, each stderr line becomes an
    /// `Error:` line. A failed call with no output still reports its status.
    pub fn log_messages(&self, program: &str) -> Vec<LogMessage> {
        let mut messages: Vec<LogMessage> = self
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(LogMessage::new)
            .collect();

        messages.extend(
            self.stderr
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| LogMessage::new(format!("Error: {}", l))),
        );

        if messages.is_empty() && !self.success() {
            let status = match self.code {
                Some(code) => code.to_string(),
                None => "signal".to_string(),
            };
            messages.push(LogMessage::new(format!(
                "Error: {} exited with status {}",
                program, status
            )));
        }

        messages
    }
}

/// Runs a collaborator to completion and captures what it printed.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn run_to_completion(&self, spec: &TaskSpec) -> Result<Completion, LaunchError>;
}

#[async_trait]
impl<T: Invoker + ?Sized> Invoker for Arc<T> {
    async fn run_to_completion(&self, spec: &TaskSpec) -> Result<Completion, LaunchError> {
        (**self).run_to_completion(spec).await
    }
}

/// [`Invoker`] backed by real child processes.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    launcher: Launcher,
    timeout: Duration,
}

impl ProcessInvoker {
    pub fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            timeout: DEFAULT_ONESHOT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Invoker for ProcessInvoker {
    async fn run_to_completion(&self, spec: &TaskSpec) -> Result<Completion, LaunchError> {
        let mut cmd = self.launcher.command(spec)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let path = self.launcher.resolve(&spec.program);
        let child = cmd
            .spawn()
            .map_err(|e| LaunchError::from_spawn(&spec.program, &path, e))?;
        let pid = child.id();
        // Leftovers in the group die with the call, whether it completes, times
        // out or is cancelled.
        let _group = pid.map(GroupGuard::new);

        tracing::debug!(program = %spec.program, ?pid, args = ?spec.args, "Running to completion");

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(Completion {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(LaunchError::Spawn {
                program: spec.program.clone(),
                source: e,
            }),
            Err(_) => {
                tracing::warn!(program = %spec.program, ?pid, timeout = ?self.timeout, "One-shot call timed out");
                Err(LaunchError::TimedOut {
                    program: spec.program.clone(),
                    secs: self.timeout.as_secs_f32(),
                })
            }
        }
    }
}
