//! Process-group isolation and group-wide signals.
//!
//! Every collaborator is started as the leader of a fresh process group, so one
//! signal to the group reaches the collaborator and anything it spawned without
//! touching the supervisor's own group.

use std::io;

use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    /// SIGTERM: ask politely, collaborators clean up their pins.
    Terminate,
    /// SIGKILL: no cleanup.
    Kill,
}

/// Make the spawned child the leader of a new process group.
#[cfg(unix)]
pub fn isolate(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
pub fn isolate(_cmd: &mut Command) {}

/// Signal every process in the group led by `pgid`.
///
/// Returns `Ok(false)` when the group no longer exists.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: GroupSignal) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    // 0 addresses our own group and 1 is init.
    let raw = i32::try_from(pgid)
        .ok()
        .filter(|raw| *raw > 1)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to signal process group {}", pgid),
            )
        })?;

    let sig = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };

    match killpg(Pid::from_raw(raw), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(unix))]
pub fn signal_group(pgid: u32, _signal: GroupSignal) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("process groups are not supported on this platform (group {})", pgid),
    ))
}

/// SIGKILLs the group led by `pgid` when dropped.
///
/// Held alongside a collaborator's child handle so the whole group goes away
/// however the handle is released: reaped, preempted, timed out or cancelled.
#[derive(Debug)]
pub struct GroupGuard {
    pgid: u32,
}

impl GroupGuard {
    pub fn new(pgid: u32) -> Self {
        Self { pgid }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        match signal_group(self.pgid, GroupSignal::Kill) {
            Ok(true) => tracing::debug!(pgid = self.pgid, "Killed leftover process group"),
            Ok(false) => {}
            Err(e) => tracing::warn!(pgid = self.pgid, error = %e, "Failed to kill process group"),
        }
    }
}
