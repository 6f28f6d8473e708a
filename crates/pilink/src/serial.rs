//! Serial device plumbing.
//!
//! The tty is configured once through `serialport` (8N1, no flow control), then
//! handed to the tokio reactor as a non-blocking descriptor so the supervisor can
//! poll it without ever blocking the loop.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub const DEFAULT_PORT: &str = "/dev/serial0";
pub const DEFAULT_BAUD: u32 = 115_200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub path: String,
    pub baud_rate: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD,
        }
    }
}

impl PortConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("failed to open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },

    #[error("failed to make {path} non-blocking: {source}")]
    NonBlocking {
        path: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to duplicate {path}: {source}")]
    Duplicate {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to register {path} with the reactor: {source}")]
    Register {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Open and configure the device. Must be called inside a tokio runtime.
pub fn open(config: &PortConfig) -> Result<SerialStream, SerialError> {
    let port = serialport::new(&config.path, config.baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native()
        .map_err(|source| SerialError::Open {
            path: config.path.clone(),
            source,
        })?;

    // SAFETY: into_raw_fd hands over sole ownership of an open descriptor.
    let file = unsafe { File::from_raw_fd(port.into_raw_fd()) };
    let stream = SerialStream::from_file(&config.path, file)?;

    tracing::info!(path = %config.path, baud = config.baud_rate, "Serial port open");
    Ok(stream)
}

/// A non-blocking serial descriptor driven by the tokio reactor.
///
/// Split it with [`tokio::io::split`] for a [`crate::channel::LineChannel`].
#[derive(Debug)]
pub struct SerialStream {
    inner: AsyncFd<File>,
}

impl SerialStream {
    /// Wrap an already-configured descriptor. `label` is only used in errors.
    pub fn from_file(label: &str, file: File) -> Result<Self, SerialError> {
        set_nonblocking(&file).map_err(|source| SerialError::NonBlocking {
            path: label.to_string(),
            source,
        })?;
        let inner = AsyncFd::new(file).map_err(|source| SerialError::Register {
            path: label.to_string(),
            source,
        })?;
        Ok(Self { inner })
    }

    /// Drive a borrowed descriptor, such as stdin, through its own duplicate.
    ///
    /// The duplicate shares the file description, so the original becomes
    /// non-blocking too. Fails with [`SerialError::Register`] for descriptors
    /// epoll cannot watch, like regular files.
    pub fn from_fd(label: &str, fd: BorrowedFd<'_>) -> Result<Self, SerialError> {
        let owned = fd
            .try_clone_to_owned()
            .map_err(|source| SerialError::Duplicate {
                path: label.to_string(),
                source,
            })?;
        Self::from_file(label, File::from(owned))
    }

    pub fn raw_fd(&self) -> i32 {
        self.inner.get_ref().as_raw_fd()
    }
}

fn set_nonblocking(file: &File) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(file, FcntlArg::F_GETFL)?);
    fcntl(file, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

impl AsyncRead for SerialStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SerialStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    // The kernel owns the tty buffer; there is nothing to flush here.
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
