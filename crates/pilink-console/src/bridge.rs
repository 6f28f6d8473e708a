//! Shared state between the HTTP handlers and the serial link.
//!
//! Outbound: handlers write whole command lines through one locked writer.
//! Inbound: [`pump`] reads lines off the link into a bounded history and
//! broadcasts each one to live subscribers.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite};

use pilink::LineCodec;

pub const DEFAULT_HISTORY: usize = 200;
const EVENT_BUFFER: usize = 256;
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One inbound line as seen by the console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub line: String,
    pub received_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn now(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Command is empty")]
    Empty,

    #[error("Command must be a single line")]
    MultiLine,

    #[error("Serial not connected")]
    NotConnected,

    #[error("Serial write timed out")]
    TimedOut,

    #[error("Serial write failed: {0}")]
    Io(#[from] io::Error),
}

pub struct Bridge {
    link: Option<tokio::sync::Mutex<FramedWrite<LinkWriter, LineCodec>>>,
    history: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    events: broadcast::Sender<LogEntry>,
}

impl Bridge {
    /// `link` is `None` in simulation mode.
    pub fn new(link: Option<LinkWriter>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            link: link.map(|w| tokio::sync::Mutex::new(FramedWrite::new(w, LineCodec::new()))),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            events,
        }
    }

    pub fn simulated(capacity: usize) -> Self {
        Self::new(None, capacity)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Write `command` as one line. Returns the text actually sent.
    pub async fn send(&self, command: &str) -> Result<String, SendError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(SendError::Empty);
        }
        if command.contains(['\n', '\r']) {
            return Err(SendError::MultiLine);
        }
        let link = self.link.as_ref().ok_or(SendError::NotConnected)?;

        let mut writer = link.lock().await;
        tokio::time::timeout(WRITE_TIMEOUT, writer.send(command))
            .await
            .map_err(|_| SendError::TimedOut)??;

        tracing::info!(%command, "Command sent");
        Ok(command.to_string())
    }

    /// Store and broadcast an inbound line.
    pub fn record(&self, line: impl Into<String>) -> LogEntry {
        let entry = LogEntry::now(line);
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            while history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(entry.clone());
        }
        // No subscribers is fine.
        let _ = self.events.send(entry.clone());
        entry
    }

    /// Retained lines, oldest first.
    pub fn history(&self) -> Vec<LogEntry> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.events.subscribe()
    }
}

/// Feed inbound lines from `reader` into `bridge` until the link closes.
pub async fn pump<R>(bridge: Arc<Bridge>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LineCodec::new());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => {
                let line = line.trim().to_string();
                tracing::info!(target: "pilink_console::uart", "{}", line);
                bridge.record(line);
            }
            Err(e) => tracing::warn!(error = %e, "Serial read error"),
        }
    }
    tracing::warn!("Serial link closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn connected() -> (Bridge, tokio::io::DuplexStream) {
        let (far, near) = tokio::io::duplex(1024);
        (Bridge::new(Some(Box::new(near)), 3), far)
    }

    #[tokio::test]
    async fn send_writes_one_line() {
        let (bridge, mut far) = connected();
        assert!(bridge.is_connected());

        let sent = bridge.send("  CMD:GPIO:ON ").await.unwrap();
        assert_eq!(sent, "CMD:GPIO:ON");

        let mut buf = [0u8; 32];
        let n = far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"CMD:GPIO:ON\n");
    }

    #[tokio::test]
    async fn send_rejects_bad_input() {
        let (bridge, _far) = connected();
        assert!(matches!(bridge.send("   ").await, Err(SendError::Empty)));
        assert!(matches!(
            bridge.send("CMD:GPIO:ON\nCMD:GPIO:OFF").await,
            Err(SendError::MultiLine)
        ));

        let offline = Bridge::simulated(10);
        let err = offline.send("CMD:GPIO:ON").await.unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
        assert_eq!(err.to_string(), "Serial not connected");
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let bridge = Bridge::simulated(3);
        for i in 0..5 {
            bridge.record(format!("LOG:{}", i));
        }
        let lines: Vec<String> = bridge.history().into_iter().map(|e| e.line).collect();
        assert_eq!(lines, vec!["LOG:2", "LOG:3", "LOG:4"]);
    }

    #[tokio::test]
    async fn pump_records_and_broadcasts() {
        let bridge = Arc::new(Bridge::simulated(10));
        let mut events = bridge.subscribe();
        let (mut far, near) = tokio::io::duplex(1024);

        let task = tokio::spawn(pump(bridge.clone(), near));
        far.write_all(b"LOG:Pi System Ready\r\n\nLOG:Started gpio_blink with args [1]\n")
            .await
            .unwrap();
        drop(far);
        task.await.unwrap();

        assert_eq!(events.recv().await.unwrap().line, "LOG:Pi System Ready");
        assert_eq!(
            events.recv().await.unwrap().line,
            "LOG:Started gpio_blink with args [1]"
        );
        assert_eq!(bridge.history().len(), 2);
    }

    #[test]
    fn entry_serializes_with_rfc3339_timestamp() {
        let entry = LogEntry {
            line: "LOG:GPIO Turned OFF".into(),
            received_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        insta::assert_snapshot!(
            serde_json::to_string(&entry).unwrap(),
            @r#"{"line":"LOG:GPIO Turned OFF","received_at":"2024-05-01T12:00:00Z"}"#
        );
    }
}
