//! pilink: serial remote-control listener for a Raspberry Pi.
//!
//! Commands arrive as `CMD:<MODULE>:<ACTION>[:<ARG>...]` lines on a serial link.
//! The supervisor keeps at most one hardware micro-app running, relays its output
//! back as `LOG:` lines, and runs SPI requests to completion.

pub mod channel;
pub mod command;
pub mod dispatch;
pub mod launcher;
pub mod logging;
mod process_group;
#[cfg(unix)]
pub mod serial;
pub mod shutdown;
pub mod slot;
pub mod supervisor;

pub use channel::{LineChannel, LineCodec, LogMessage};
pub use command::{Command, Module, ParseError};
pub use dispatch::{Action, Dispatcher, plan};
pub use launcher::{Completion, Invoker, LaunchError, Launcher, ProcessInvoker, TaskSpec};
pub use process_group::GroupSignal;
pub use slot::{KillOutcome, ProcessSlot, StartOutcome, TaskExit, TaskInfo, TaskSlot};
pub use supervisor::{Supervisor, SupervisorConfig};
