//! pilink-console: drive a pilink listener from a browser.

mod bridge;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use pilink::logging::init_tracing;
use pilink::shutdown::shutdown_signal;

use crate::bridge::{Bridge, DEFAULT_HISTORY, LinkWriter};

#[derive(Debug, Parser)]
#[command(name = "pilink-console", version, about)]
struct Args {
    /// USB serial device wired to the Pi
    #[arg(long, env = "PILINK_SERIAL_PORT", default_value = "/dev/ttyUSB0")]
    port: String,

    #[arg(long, env = "PILINK_BAUD", default_value_t = 115_200)]
    baud: u32,

    #[arg(long, env = "PILINK_CONSOLE_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PILINK_CONSOLE_PORT", default_value_t = 5000)]
    http_port: u16,

    /// Inbound lines kept for /logs
    #[arg(long, env = "PILINK_CONSOLE_HISTORY", default_value_t = DEFAULT_HISTORY)]
    history: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let bridge = match connect(&args) {
        Some((reader, writer)) => {
            let bridge = Arc::new(Bridge::new(Some(writer), args.history));
            tokio::spawn(bridge::pump(bridge.clone(), reader));
            bridge
        }
        None => Arc::new(Bridge::simulated(args.history)),
    };

    let addr: SocketAddr = format!("{}:{}", args.host, args.http_port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.http_port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!(%addr, connected = bridge.is_connected(), "Console listening");

    axum::serve(listener, routes::routes(bridge))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Console shutdown complete");
    Ok(())
}

#[cfg(unix)]
fn connect(
    args: &Args,
) -> Option<(impl tokio::io::AsyncRead + Unpin + Send + 'static, LinkWriter)> {
    let config = pilink::serial::PortConfig::new(&args.port).with_baud_rate(args.baud);
    match pilink::serial::open(&config) {
        Ok(stream) => {
            let (reader, writer) = tokio::io::split(stream);
            Some((reader, Box::new(writer) as LinkWriter))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not open serial link, running in simulation mode");
            None
        }
    }
}

#[cfg(not(unix))]
fn connect(args: &Args) -> Option<(tokio::io::Empty, LinkWriter)> {
    tracing::warn!(port = %args.port, "Serial links need unix, running in simulation mode");
    None
}
