//! pilink-listener: supervise hardware micro-apps over a serial link.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncRead, AsyncWrite};
#[cfg(unix)]
use {
    pilink::serial::SerialStream,
    std::os::fd::BorrowedFd,
    tokio::io::{Stdin, Stdout},
    tokio_util::either::Either,
};

use pilink::logging::init_tracing;
use pilink::shutdown::shutdown_signal;
use pilink::{
    Dispatcher, LineChannel, Launcher, ProcessInvoker, ProcessSlot, Supervisor, SupervisorConfig,
};

#[derive(Debug, Parser)]
#[command(name = "pilink-listener", version, about)]
struct Args {
    /// Serial device carrying commands and logs
    #[arg(long, env = "PILINK_SERIAL_PORT", default_value = "/dev/serial0")]
    port: String,

    #[arg(long, env = "PILINK_BAUD", default_value_t = 115_200)]
    baud: u32,

    /// Use stdin/stdout as the command link instead of a serial device
    #[arg(long, env = "PILINK_STDIO")]
    stdio: bool,

    /// Directory holding the micro-apps
    #[arg(long, env = "PILINK_APPS_DIR", default_value = ".")]
    apps_dir: PathBuf,

    /// Interpreter the micro-apps are run with, e.g. python3
    #[arg(long, env = "PILINK_INTERPRETER")]
    interpreter: Option<String>,

    /// Suffix appended to app names, e.g. .py
    #[arg(long, env = "PILINK_APP_SUFFIX")]
    app_suffix: Option<String>,

    #[arg(long, env = "PILINK_TICK_MS", default_value_t = 50)]
    tick_ms: u64,

    /// Grace period after SIGTERM before a task is SIGKILLed
    #[arg(long, env = "PILINK_KILL_TIMEOUT_MS", default_value_t = 1000)]
    kill_timeout_ms: u64,

    /// Upper bound on an SPI run-to-completion call
    #[arg(long, env = "PILINK_ONESHOT_TIMEOUT_SECS", default_value_t = 30)]
    oneshot_timeout_secs: u64,
}

impl Args {
    fn launcher(&self) -> Launcher {
        let mut launcher = Launcher::new(&self.apps_dir);
        if let Some(interpreter) = &self.interpreter {
            launcher = launcher.with_interpreter(interpreter);
        }
        if let Some(suffix) = &self.app_suffix {
            launcher = launcher.with_suffix(suffix);
        }
        launcher
    }
}

/// Grace given to leftover runtime work, such as a blocking stdin read, on exit.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    tracing::debug!(?args, "Starting listener");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not start the async runtime")?;
    let result = runtime.block_on(listen(&args));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

async fn listen(args: &Args) -> anyhow::Result<()> {
    if args.stdio {
        tracing::info!("Using stdin/stdout as the command link");
        #[cfg(unix)]
        {
            use std::os::fd::AsFd;
            let (reader, writer) = stdio_link(std::io::stdin().as_fd(), std::io::stdout().as_fd());
            return serve(args, reader, writer, shutdown_signal()).await;
        }
        #[cfg(not(unix))]
        {
            return serve(args, tokio::io::stdin(), tokio::io::stdout(), shutdown_signal()).await;
        }
    }

    #[cfg(unix)]
    {
        let config = pilink::serial::PortConfig::new(&args.port).with_baud_rate(args.baud);
        let stream = pilink::serial::open(&config)
            .with_context(|| format!("could not open serial link {}", args.port))?;
        let (reader, writer) = tokio::io::split(stream);
        serve(args, reader, writer, shutdown_signal()).await
    }

    #[cfg(not(unix))]
    {
        anyhow::bail!("serial devices are only supported on unix; use --stdio")
    }
}

/// Put the stdio descriptors on the reactor so a pending read never pins a
/// blocking thread. Files and other unpollable descriptors fall back to
/// tokio's blocking stdio.
#[cfg(unix)]
fn stdio_link(
    input: BorrowedFd<'_>,
    output: BorrowedFd<'_>,
) -> (Either<SerialStream, Stdin>, Either<SerialStream, Stdout>) {
    let reader = match SerialStream::from_fd("stdin", input) {
        Ok(stream) => Either::Left(stream),
        Err(e) => {
            tracing::warn!(error = %e, "stdin is not pollable, reading it on a blocking thread");
            Either::Right(tokio::io::stdin())
        }
    };
    let writer = match SerialStream::from_fd("stdout", output) {
        Ok(stream) => Either::Left(stream),
        Err(e) => {
            tracing::warn!(error = %e, "stdout is not pollable, writing it on a blocking thread");
            Either::Right(tokio::io::stdout())
        }
    };
    (reader, writer)
}

async fn serve<R, W>(
    args: &Args,
    reader: R,
    writer: W,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let launcher = args.launcher();
    let apps_dir = launcher.apps_dir().to_path_buf();
    anyhow::ensure!(
        apps_dir.is_dir(),
        "apps directory {} does not exist",
        apps_dir.display()
    );

    let invoker = ProcessInvoker::new(launcher.clone())
        .with_timeout(Duration::from_secs(args.oneshot_timeout_secs));
    let slot = ProcessSlot::new(launcher)
        .with_kill_timeout(Duration::from_millis(args.kill_timeout_ms));
    let config = SupervisorConfig::default().with_tick(Duration::from_millis(args.tick_ms.max(1)));

    let mut supervisor = Supervisor::new(
        LineChannel::new(reader, writer),
        slot,
        Dispatcher::new(Arc::new(invoker)),
        config,
    );

    tracing::info!(apps_dir = %apps_dir.display(), "Listener ready");
    supervisor.run(shutdown).await;
    Ok(())
}
