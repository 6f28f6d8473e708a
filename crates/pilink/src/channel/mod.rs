//! Line channel over the duplex serial link.
//!
//! - **codec**: newline framing that tolerates noise
//! - [`LineChannel`]: non-blocking line reads, whole-line `LOG:` writes
//!
//! The supervisor owns the only [`LineChannel`], so it is also the only writer:
//! status text and relayed child output can never interleave mid-line.

pub mod codec;

use std::fmt;
use std::io;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

pub use codec::LineCodec;

/// Prefix of every outbound line.
pub const LOG_PREFIX: &str = "LOG:";

/// A line of free text bound for the far end of the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage(String);

impl LogMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// A line copied from a running task's output, tagged with its program.
    pub fn relayed(program: &str, line: &str) -> Self {
        Self(format!("[{}] {}", program, line.trim()))
    }

    pub fn text(&self) -> &str {
        &self.0
    }

    /// The exact wire form, without the line terminator.
    pub fn to_line(&self) -> String {
        format!("{}{}", LOG_PREFIX, self.0)
    }
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", LOG_PREFIX, self.0)
    }
}

impl From<&str> for LogMessage {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for LogMessage {
    fn from(text: String) -> Self {
        Self(text)
    }
}

pub struct LineChannel<R, W> {
    reader: FramedRead<R, LineCodec>,
    writer: FramedWrite<W, LineCodec>,
    eof_reported: bool,
}

impl<R, W> LineChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, LineCodec::new()),
            writer: FramedWrite::new(writer, LineCodec::new()),
            eof_reported: false,
        }
    }

    /// Return the next complete inbound line if one is already available.
    ///
    /// Polls the reader exactly once and never waits. Read errors and
    /// end-of-stream both come back as `None`.
    pub fn read_line(&mut self) -> Option<String> {
        match self.reader.next().now_or_never() {
            None => None,
            Some(Some(Ok(line))) => {
                self.eof_reported = false;
                Some(line)
            }
            Some(Some(Err(e))) => {
                tracing::debug!(error = %e, "Channel read error ignored");
                None
            }
            Some(None) => {
                if !self.eof_reported {
                    tracing::warn!("Command channel reached end of stream");
                    self.eof_reported = true;
                }
                None
            }
        }
    }

    /// Whether the inbound side has been observed at end-of-stream.
    pub fn inbound_closed(&self) -> bool {
        self.eof_reported
    }

    /// Write one `LOG:` line and flush it.
    pub async fn write_log(&mut self, message: &LogMessage) -> io::Result<()> {
        tracing::info!(target: "pilink::uart", "{}", message.text());
        self.writer.send(message.to_line()).await
    }
}
