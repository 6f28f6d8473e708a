//! Diagnostics setup shared by the binaries.
//!
//! Diagnostics always go to stderr: in `--stdio` mode stdout is the command link.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Env var selecting the default level when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "PILINK_LOG";

/// Crates whose diagnostics the default filter enables.
const CRATES: &[&str] = &["pilink", "pilink_console", "pilink_sdcard"];

/// Map a `PILINK_LOG` value to a level; anything unrecognised is `info`.
pub fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

/// Filter directives for `level` across the workspace crates.
pub fn default_directives(level: &str) -> String {
    CRATES
        .iter()
        .map(|krate| format!("{}={}", krate, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. Safe to call more than once.
///
/// `RUST_LOG` wins when set. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
        EnvFilter::new(default_directives(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
