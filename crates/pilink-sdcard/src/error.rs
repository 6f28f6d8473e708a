//! Error types for the SD card stand-in.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum SdError {
    #[error("Missing {0}")]
    Missing(&'static str),

    #[error("Invalid file name {0}")]
    InvalidName(String),

    #[error("Unknown action {0}")]
    UnknownAction(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SdError {
    /// The single stdout line reporting this error.
    pub fn reply_line(&self) -> String {
        match self {
            Self::Io(e) => format!("SPI Error: {e}"),
            other => format!("Error: {other}"),
        }
    }
}
