//! The supervisor loop.
//!
//! Every tick runs three phases in order, each bounded:
//! 1. read at most one command line and dispatch it
//! 2. relay at most one line of the running task's output
//! 3. reap the running task if it exited on its own
//!
//! The supervisor owns the channel and the slot outright. Nothing else writes to
//! the link, so no locking is needed.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::MissedTickBehavior;

use crate::channel::{LineChannel, LogMessage};
use crate::command::Command;
use crate::dispatch::Dispatcher;
use crate::slot::TaskSlot;

pub const DEFAULT_TICK: Duration = Duration::from_millis(50);
pub const READY_BANNER: &str = "Pi System Ready";
pub const TASK_FINISHED: &str = "Task finished.";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub tick: Duration,
    /// Bound on a single outbound write; a stalled link drops the line.
    pub write_timeout: Duration,
    pub ready_banner: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            write_timeout: Duration::from_secs(1),
            ready_banner: Some(READY_BANNER.to_string()),
        }
    }
}

impl SupervisorConfig {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_ready_banner(mut self, banner: Option<String>) -> Self {
        self.ready_banner = banner;
        self
    }
}

pub struct Supervisor<R, W, S> {
    channel: LineChannel<R, W>,
    slot: S,
    dispatcher: Dispatcher,
    config: SupervisorConfig,
}

impl<R, W, S> Supervisor<R, W, S>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: TaskSlot,
{
    pub fn new(
        channel: LineChannel<R, W>,
        slot: S,
        dispatcher: Dispatcher,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            channel,
            slot,
            dispatcher,
            config,
        }
    }

    pub fn slot(&self) -> &S {
        &self.slot
    }

    pub fn slot_mut(&mut self) -> &mut S {
        &mut self.slot
    }

    /// Write the ready banner, if configured.
    pub async fn announce(&mut self) {
        if let Some(banner) = self.config.ready_banner.clone() {
            self.emit(LogMessage::new(banner)).await;
        }
    }

    /// Run one pass of the three phases.
    pub async fn tick(&mut self) {
        if let Some(line) = self.channel.read_line() {
            match Command::parse(&line) {
                Ok(cmd) => {
                    tracing::info!(command = %cmd, "Command received");
                    let messages = self.dispatcher.dispatch(&mut self.slot, &cmd).await;
                    self.emit_all(messages).await;
                }
                Err(e) => tracing::trace!(%line, reason = %e, "Ignoring line"),
            }
        }

        if let Some(program) = self.slot.current().map(|t| t.program().to_string())
            && let Some(line) = self.slot.drain_one_line()
        {
            self.emit(LogMessage::relayed(&program, &line)).await;
        }

        if self.slot.poll_exited().is_some() {
            self.emit(LogMessage::new(TASK_FINISHED)).await;
        }
    }

    /// Announce, then tick until `shutdown` resolves. Kills the running task on the way out.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.announce().await;

        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(tick = ?self.config.tick, "Supervisor running");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            // A long dispatch, such as a hung SPI call, is abandoned on shutdown.
            // Dropping it takes down whatever it spawned.
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.tick() => {}
            }
        }
        tracing::info!("Shutdown requested");

        self.shutdown().await;
    }

    /// Kill the running task, if any.
    pub async fn shutdown(&mut self) {
        let outcome = self.slot.kill_current().await;
        if let Some(message) = outcome.log_message() {
            self.emit(message).await;
        }
        tracing::info!("Supervisor stopped");
    }

    async fn emit_all(&mut self, messages: Vec<LogMessage>) {
        for message in messages {
            self.emit(message).await;
        }
    }

    async fn emit(&mut self, message: LogMessage) {
        match tokio::time::timeout(self.config.write_timeout, self.channel.write_log(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, line = %message, "Dropped outbound line"),
            Err(_) => tracing::warn!(line = %message, "Outbound write timed out, line dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use futures::StreamExt;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::FramedRead;

    use crate::channel::LineCodec;
    use crate::dispatch::tests::{CannedInvoker, RecordingSlot};
    use crate::launcher::{Completion, Invoker, LaunchError, TaskSpec};
    use crate::slot::TaskInfo;

    type TestSupervisor = Supervisor<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>, RecordingSlot>;

    struct Harness {
        sup: TestSupervisor,
        commands: WriteHalf<DuplexStream>,
        logs: FramedRead<ReadHalf<DuplexStream>, LineCodec>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_invoker(CannedInvoker::sd_card())
        }

        fn with_invoker(invoker: Arc<dyn Invoker>) -> Self {
            let (far, near) = tokio::io::duplex(4096);
            let (r, w) = tokio::io::split(near);
            let (far_r, far_w) = tokio::io::split(far);
            let sup = Supervisor::new(
                LineChannel::new(r, w),
                RecordingSlot::default(),
                Dispatcher::new(invoker),
                SupervisorConfig::default(),
            );
            Self {
                sup,
                commands: far_w,
                logs: FramedRead::new(far_r, LineCodec::new()),
            }
        }

        async fn send(&mut self, line: &str) {
            self.commands.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        }

        async fn next_log(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(2), self.logs.next())
                .await
                .expect("no log line")
                .unwrap()
                .unwrap()
        }

        async fn command(&mut self, line: &str) {
            self.send(line).await;
            self.sup.tick().await;
        }
    }

    #[tokio::test]
    async fn blink_on_off_scenario() {
        let mut h = Harness::new();

        h.command("CMD:GPIO:BLINK:0.5").await;
        assert_eq!(h.next_log().await, "LOG:Started gpio_blink with args [0.5]");
        assert_eq!(h.sup.slot().current().unwrap().spec.args, vec!["0.5"]);

        h.command("CMD:GPIO:ON").await;
        assert_eq!(h.next_log().await, "LOG:Stopped gpio_blink (PID 101)");
        assert_eq!(h.next_log().await, "LOG:Started gpio_blink with args [0]");

        h.command("CMD:GPIO:OFF").await;
        assert_eq!(h.next_log().await, "LOG:Stopped gpio_blink (PID 102)");
        assert_eq!(h.next_log().await, "LOG:GPIO Turned OFF");
        assert!(!h.sup.slot().is_occupied());
    }

    #[tokio::test]
    async fn spi_create_reports_without_a_task() {
        let mut h = Harness::new();

        h.command("CMD:SPI:CREATE:test.txt").await;
        assert_eq!(h.next_log().await, "LOG:Success: Created test.txt");
        assert!(!h.sup.slot().is_occupied());
    }

    #[tokio::test]
    async fn noise_is_dropped_silently() {
        let mut h = Harness::new();

        for line in ["garbage", "CMD:GPIO", "CMD:FOO:BAR", "CMD:GPIO:BLINK", "LOG:echo"] {
            h.command(line).await;
        }
        h.command("CMD:PWM:STOP").await;

        assert_eq!(h.next_log().await, "LOG:PWM Stopped");
        assert!(h.sup.slot().events.is_empty());
    }

    #[tokio::test]
    async fn one_command_per_tick() {
        let mut h = Harness::new();

        h.send("CMD:PWM:START").await;
        h.send("CMD:I2C:CLOCK").await;
        h.sup.tick().await;
        assert_eq!(h.sup.slot().events.len(), 1);
        h.sup.tick().await;
        assert_eq!(h.sup.slot().current().unwrap().program(), "i2c_world_clock");
    }

    #[tokio::test]
    async fn task_output_is_relayed_one_line_per_tick() {
        let mut h = Harness::new();
        h.command("CMD:I2C:TIMER:3").await;
        assert_eq!(h.next_log().await, "LOG:Started i2c_timer with args [3]");

        h.sup.slot_mut().output = vec!["00:03 ".into(), "00:02".into()];
        h.sup.tick().await;
        assert_eq!(h.sup.slot().output.len(), 1);
        h.sup.tick().await;

        assert_eq!(h.next_log().await, "LOG:[i2c_timer] 00:03");
        assert_eq!(h.next_log().await, "LOG:[i2c_timer] 00:02");
    }

    #[tokio::test]
    async fn self_exit_reported_once() {
        let mut h = Harness::new();
        h.command("CMD:I2C:TIMER:1").await;
        h.next_log().await;

        h.sup.slot_mut().exited = true;
        h.sup.tick().await;
        h.sup.tick().await;
        h.command("CMD:PWM:STOP").await;

        assert_eq!(h.next_log().await, "LOG:Task finished.");
        assert_eq!(h.next_log().await, "LOG:PWM Stopped");
        assert!(!h.sup.slot().is_occupied());
    }

    #[tokio::test]
    async fn run_announces_and_kills_on_shutdown() {
        let mut h = Harness::new();
        h.sup.slot_mut().current = Some(TaskInfo::new(TaskSpec::new("pwm_monitor", Vec::<String>::new()), 7));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tx.send(()).unwrap();
        h.sup
            .run(async {
                let _ = rx.await;
            })
            .await;

        assert_eq!(h.next_log().await, "LOG:Pi System Ready");
        assert_eq!(h.next_log().await, "LOG:Stopped pwm_monitor (PID 7)");
        assert!(!h.sup.slot().is_occupied());
    }

    #[tokio::test]
    async fn run_dispatches_until_shutdown() {
        let mut h = Harness::new();
        h.send("CMD:PWM:START").await;

        let shutdown = tokio::time::sleep(Duration::from_millis(300));
        h.sup.run(shutdown).await;

        assert_eq!(h.next_log().await, "LOG:Pi System Ready");
        assert_eq!(h.next_log().await, "LOG:Started pwm_monitor with args []");
        assert_eq!(h.next_log().await, "LOG:Stopped pwm_monitor (PID 101)");
    }

    #[tokio::test]
    async fn stalled_link_does_not_stall_the_loop() {
        // Nobody reads the far side, so the tiny buffer fills on the first write.
        let (far, near) = tokio::io::duplex(16);
        let (r, w) = tokio::io::split(near);
        let (_far_r, mut far_w) = tokio::io::split(far);
        let mut sup = Supervisor::new(
            LineChannel::new(r, w),
            RecordingSlot::default(),
            Dispatcher::new(CannedInvoker::sd_card()),
            SupervisorConfig::default().with_write_timeout(Duration::from_millis(50)),
        );

        for (i, line) in ["CMD:PWM:START", "CMD:I2C:CLOCK", "CMD:GPIO:OFF"].iter().enumerate() {
            far_w.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
            let started = std::time::Instant::now();
            tokio::time::timeout(Duration::from_millis(500), sup.tick())
                .await
                .expect("tick blocked on the link");
            assert!(started.elapsed() < Duration::from_millis(400));
            assert!(sup.slot().events.len() > i);
        }

        assert_eq!(
            sup.slot().events,
            vec![
                "start pwm_monitor []",
                "kill 101",
                "start i2c_world_clock []",
                "kill 102",
            ]
        );
        assert!(!sup.slot().is_occupied());
    }

    /// Invoker whose calls never complete.
    struct HangingInvoker;

    #[async_trait::async_trait]
    impl Invoker for HangingInvoker {
        async fn run_to_completion(&self, _spec: &TaskSpec) -> Result<Completion, LaunchError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_hung_call() {
        let mut h = Harness::with_invoker(Arc::new(HangingInvoker));
        h.send("CMD:SPI:LIST").await;

        let shutdown = tokio::time::sleep(Duration::from_millis(200));
        tokio::time::timeout(Duration::from_secs(2), h.sup.run(shutdown))
            .await
            .expect("shutdown waited on the call");

        assert_eq!(h.next_log().await, "LOG:Pi System Ready");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn real_task_exit_is_noticed_without_input() {
        use crate::launcher::{Launcher, ProcessInvoker};
        use crate::slot::ProcessSlot;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("i2c_timer.sh"), "exit 0\n").unwrap();

        let (far, near) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(near);
        let (far_r, mut far_w) = tokio::io::split(far);
        let launcher = Launcher::new(dir.path())
            .with_interpreter("/bin/sh")
            .with_suffix(".sh");
        let mut sup = Supervisor::new(
            LineChannel::new(r, w),
            ProcessSlot::new(launcher),
            Dispatcher::new(Arc::new(ProcessInvoker::new(Launcher::default()))),
            SupervisorConfig::default().with_ready_banner(None),
        );
        let mut logs = FramedRead::new(far_r, LineCodec::new());

        far_w.write_all(b"CMD:I2C:TIMER:1\n").await.unwrap();
        for _ in 0..100 {
            sup.tick().await;
            if !sup.slot().is_occupied() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(logs.next().await.unwrap().unwrap(), "LOG:Started i2c_timer with args [1]");
        assert_eq!(logs.next().await.unwrap().unwrap(), "LOG:Task finished.");
    }
}
