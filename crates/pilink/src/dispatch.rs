//! Command to action mapping.
//!
//! [`plan`] is the whole routing table and is pure. [`Dispatcher`] carries the
//! chosen [`Action`] out against a [`TaskSlot`] and an [`Invoker`], and returns
//! the log lines the supervisor should write.

use std::sync::Arc;

use crate::channel::LogMessage;
use crate::command::{Command, Module};
use crate::launcher::{Invoker, TaskSpec};
use crate::slot::TaskSlot;

pub const GPIO_BLINK: &str = "gpio_blink";
pub const PWM_MONITOR: &str = "pwm_monitor";
pub const I2C_TIMER: &str = "i2c_timer";
pub const I2C_WORLD_CLOCK: &str = "i2c_world_clock";
pub const SPI_SD_CARD: &str = "spi_sd_card";

/// Blink delay that tells `gpio_blink` to hold the LED on.
pub const STATIC_ON_DELAY: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Kill the running task and start this one.
    Replace(TaskSpec),
    /// Kill the running task and report `notice`.
    Stop { notice: &'static str },
    /// Run synchronously and report the captured output; the slot is untouched.
    RunToCompletion(TaskSpec),
    Ignore,
}

/// Decide what `cmd` does. Unknown combinations map to [`Action::Ignore`].
pub fn plan(cmd: &Command) -> Action {
    match (cmd.module, cmd.action.as_str()) {
        (Module::Gpio, "BLINK") => single_arg(cmd, GPIO_BLINK),
        (Module::Gpio, "ON") => Action::Replace(TaskSpec::new(GPIO_BLINK, [STATIC_ON_DELAY])),
        (Module::Gpio, "OFF") => Action::Stop {
            notice: "GPIO Turned OFF",
        },
        (Module::Pwm, "START") => Action::Replace(TaskSpec::new(PWM_MONITOR, Vec::<String>::new())),
        (Module::Pwm, "STOP") => Action::Stop {
            notice: "PWM Stopped",
        },
        (Module::I2c, "TIMER") => single_arg(cmd, I2C_TIMER),
        (Module::I2c, "CLOCK") => {
            Action::Replace(TaskSpec::new(I2C_WORLD_CLOCK, Vec::<String>::new()))
        }
        // The collaborator always takes ACTION, arg1, arg2.
        (Module::Spi, action) => Action::RunToCompletion(TaskSpec::new(
            SPI_SD_CARD,
            [
                action,
                cmd.arg(0).unwrap_or_default(),
                cmd.arg(1).unwrap_or_default(),
            ],
        )),
        _ => Action::Ignore,
    }
}

fn single_arg(cmd: &Command, program: &str) -> Action {
    let Some(arg) = cmd.arg(0).filter(|a| !a.is_empty()) else {
        return Action::Ignore;
    };
    if cmd.args.len() > 1 {
        tracing::warn!(
            command = %cmd,
            used = arg,
            "Extra ':' tokens ignored; argument values cannot contain ':'"
        );
    }
    Action::Replace(TaskSpec::new(program, [arg]))
}

pub struct Dispatcher {
    invoker: Arc<dyn Invoker>,
}

impl Dispatcher {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self { invoker }
    }

    pub async fn dispatch<S>(&self, slot: &mut S, cmd: &Command) -> Vec<LogMessage>
    where
        S: TaskSlot + ?Sized,
    {
        let action = plan(cmd);
        tracing::debug!(command = %cmd, ?action, "Dispatching");
        self.execute(slot, action).await
    }

    pub async fn execute<S>(&self, slot: &mut S, action: Action) -> Vec<LogMessage>
    where
        S: TaskSlot + ?Sized,
    {
        match action {
            Action::Replace(spec) => slot.start(spec).await.log_messages(),
            Action::Stop { notice } => {
                let mut messages: Vec<LogMessage> =
                    slot.kill_current().await.log_message().into_iter().collect();
                messages.push(LogMessage::new(notice));
                messages
            }
            Action::RunToCompletion(spec) => match self.invoker.run_to_completion(&spec).await {
                Ok(done) => done.log_messages(&spec.program),
                Err(e) => {
                    tracing::warn!(program = %spec.program, error = %e, "One-shot call failed");
                    vec![LogMessage::new(format!("Error: {}", e))]
                }
            },
            Action::Ignore => Vec::new(),
        }
    }
}
