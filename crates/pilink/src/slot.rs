//! The single task slot.
//!
//! At most one long-running collaborator exists at a time. [`TaskSlot`] is the
//! seam the dispatcher and supervisor work against; [`ProcessSlot`] is the real
//! implementation over child processes, each in its own process group.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::process::Child;
use tokio_util::codec::FramedRead;

use crate::channel::{LineCodec, LogMessage};
use crate::launcher::{LaunchError, Launcher, TaskSpec};
use crate::process_group::{self, GroupGuard, GroupSignal};

pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(1);

/// What the slot knows about its running task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub spec: TaskSpec,
    pub pid: u32,
    pub started_at: Instant,
}

impl TaskInfo {
    pub fn new(spec: TaskSpec, pid: u32) -> Self {
        Self {
            spec,
            pid,
            started_at: Instant::now(),
        }
    }

    pub fn program(&self) -> &str {
        &self.spec.program
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Result of [`TaskSlot::kill_current`]. The slot is empty afterwards in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    /// Nothing was running.
    Empty,
    Stopped { program: String, pid: u32 },
    /// SIGTERM was not honoured within the bound; the group got SIGKILL.
    Forced {
        program: String,
        pid: u32,
        waited: Duration,
    },
    /// The group could not be signalled at all.
    SignalFailed {
        program: String,
        pid: u32,
        reason: String,
    },
}

impl KillOutcome {
    pub fn log_message(&self) -> Option<LogMessage> {
        match self {
            Self::Empty => None,
            Self::Stopped { program, pid } => {
                Some(format!("Stopped {} (PID {})", program, pid).into())
            }
            Self::Forced {
                program,
                pid,
                waited,
            } => Some(
                format!(
                    "Task {} (PID {}) did not exit within {}ms; forced",
                    program,
                    pid,
                    waited.as_millis()
                )
                .into(),
            ),
            Self::SignalFailed { reason, .. } => {
                Some(format!("Error killing process: {}", reason).into())
            }
        }
    }
}

/// Result of [`TaskSlot::start`].
#[derive(Debug)]
pub struct StartOutcome {
    /// What happened to the task that was running before.
    pub preempted: KillOutcome,
    pub spec: TaskSpec,
    /// The new task's pid, or why it could not be started.
    pub launched: Result<u32, LaunchError>,
}

impl StartOutcome {
    pub fn log_messages(&self) -> Vec<LogMessage> {
        let mut messages: Vec<LogMessage> = self.preempted.log_message().into_iter().collect();
        messages.push(match &self.launched {
            Ok(_) => LogMessage::new(format!(
                "Started {} with args [{}]",
                self.spec.program,
                self.spec.args.join(", ")
            )),
            Err(e) => LogMessage::new(format!("Error: {}", e)),
        });
        messages
    }
}

/// A task that ended on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    pub program: String,
    pub pid: u32,
    /// `None` when ended by a signal or when the status could not be read.
    pub code: Option<i32>,
}

/// Owner of zero or one running task.
///
/// Only `start` and `kill_current` may wait, and only for a bounded time. The
/// other operations never block.
#[async_trait]
pub trait TaskSlot: Send {
    /// Kill whatever is running, then launch `spec` in a fresh process group.
    async fn start(&mut self, spec: TaskSpec) -> StartOutcome;

    /// Signal the running task's group and reap it. No-op on an empty slot.
    async fn kill_current(&mut self) -> KillOutcome;

    /// One line of the running task's output, if one is ready now.
    fn drain_one_line(&mut self) -> Option<String>;

    /// Detect self-exit. Empties the slot and reports the exit exactly once.
    fn poll_exited(&mut self) -> Option<TaskExit>;

    fn current(&self) -> Option<&TaskInfo>;

    fn is_occupied(&self) -> bool {
        self.current().is_some()
    }
}

struct RunningTask {
    info: TaskInfo,
    child: Child,
    /// stdout and stderr merged line by line.
    output: BoxStream<'static, String>,
    /// Kills whatever is left of the group once the task leaves the slot.
    group: GroupGuard,
}

/// [`TaskSlot`] over real child processes.
pub struct ProcessSlot {
    launcher: Launcher,
    kill_timeout: Duration,
    running: Option<RunningTask>,
}

impl ProcessSlot {
    pub fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            running: None,
        }
    }

    /// How long to wait for a task to exit after SIGTERM before sending SIGKILL.
    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    fn launch(&self, spec: &TaskSpec) -> Result<RunningTask, LaunchError> {
        let mut cmd = self.launcher.command(spec)?;
        cmd.stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let path = self.launcher.resolve(&spec.program);
        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::from_spawn(&spec.program, &path, e))?;

        let pid = child.id().ok_or_else(|| LaunchError::Spawn {
            program: spec.program.clone(),
            source: std::io::Error::other("exited before it could be tracked"),
        })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| lines(FramedRead::new(out, LineCodec::new())));
        let stderr = child
            .stderr
            .take()
            .map(|err| lines(FramedRead::new(err, LineCodec::new())));
        let output = match (stdout, stderr) {
            (Some(out), Some(err)) => futures::stream::select(out, err).boxed(),
            (Some(one), None) | (None, Some(one)) => one,
            (None, None) => futures::stream::empty().boxed(),
        };

        Ok(RunningTask {
            info: TaskInfo::new(spec.clone(), pid),
            child,
            output,
            group: GroupGuard::new(pid),
        })
    }
}

fn lines<S>(framed: S) -> BoxStream<'static, String>
where
    S: futures::Stream<Item = std::io::Result<String>> + Send + 'static,
{
    framed
        .filter_map(|line| futures::future::ready(line.ok()))
        .boxed()
}

#[async_trait]
impl TaskSlot for ProcessSlot {
    async fn start(&mut self, spec: TaskSpec) -> StartOutcome {
        let preempted = self.kill_current().await;

        let launched = match self.launch(&spec) {
            Ok(running) => {
                let pid = running.info.pid;
                tracing::info!(program = %spec.program, pid, args = ?spec.args, "Task started");
                self.running = Some(running);
                Ok(pid)
            }
            Err(e) => {
                tracing::warn!(program = %spec.program, error = %e, "Task failed to start");
                Err(e)
            }
        };

        StartOutcome {
            preempted,
            spec,
            launched,
        }
    }

    async fn kill_current(&mut self) -> KillOutcome {
        let Some(mut running) = self.running.take() else {
            return KillOutcome::Empty;
        };
        let program = running.info.program().to_string();
        let pid = running.info.pid;

        match process_group::signal_group(pid, GroupSignal::Terminate) {
            Err(e) => {
                // Dropping the task still SIGKILLs the group.
                tracing::error!(%program, pid, error = %e, "Failed to signal task group");
                return KillOutcome::SignalFailed {
                    program,
                    pid,
                    reason: e.to_string(),
                };
            }
            Ok(false) => tracing::debug!(%program, pid, "Task group already gone"),
            Ok(true) => {}
        }

        match tokio::time::timeout(self.kill_timeout, running.child.wait()).await {
            Ok(status) => {
                tracing::info!(
                    %program,
                    pid,
                    status = ?status.ok(),
                    ran_for = ?running.info.elapsed(),
                    "Task stopped"
                );
                KillOutcome::Stopped { program, pid }
            }
            Err(_) => {
                tracing::warn!(%program, pid, timeout = ?self.kill_timeout, "Task ignored SIGTERM, sending SIGKILL");
                if let Err(e) = process_group::signal_group(pid, GroupSignal::Kill) {
                    tracing::error!(%program, pid, error = %e, "Failed to SIGKILL task group");
                }
                KillOutcome::Forced {
                    program,
                    pid,
                    waited: self.kill_timeout,
                }
            }
        }
    }

    fn drain_one_line(&mut self) -> Option<String> {
        let running = self.running.as_mut()?;
        running.output.next().now_or_never().flatten()
    }

    fn poll_exited(&mut self) -> Option<TaskExit> {
        let running = self.running.as_mut()?;
        let code = match running.child.try_wait() {
            Ok(None) => return None,
            Ok(Some(status)) => status.code(),
            Err(e) => {
                tracing::warn!(program = %running.info.program(), error = %e, "Could not read task status");
                None
            }
        };

        let RunningTask { info, group, .. } = self.running.take()?;
        // The leader is gone; descendants it left behind go with it.
        drop(group);
        tracing::info!(program = %info.program(), pid = info.pid, ?code, "Task exited");
        Some(TaskExit {
            program: info.spec.program,
            pid: info.pid,
            code,
        })
    }

    fn current(&self) -> Option<&TaskInfo> {
        self.running.as_ref().map(|r| &r.info)
    }
}
