//! pilink-sdcard: a directory standing in for an SPI SD card.
//!
//! Each invocation handles one request and prints one reply line. Outcomes,
//! failures included, are reported as text; the listener relays them verbatim.

pub mod error;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub use error::SdError;

pub const ROOT_ENV: &str = "PILINK_SD_ROOT";
pub const DEFAULT_ROOT: &str = "sd_card_storage";

/// A decoded `ACTION [arg1] [arg2]` request. Empty arguments count as missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Create { name: String },
    Write { name: String, data: String },
    Read { name: String },
    List,
}

impl Request {
    pub fn parse(action: &str, args: &[String]) -> Result<Self, SdError> {
        let arg = |i: usize, what: &'static str| -> Result<String, SdError> {
            args.get(i)
                .filter(|a| !a.is_empty())
                .cloned()
                .ok_or(SdError::Missing(what))
        };

        match action {
            "CREATE" => Ok(Self::Create {
                name: arg(0, "file name")?,
            }),
            "WRITE" => Ok(Self::Write {
                name: arg(0, "file name")?,
                data: arg(1, "data")?,
            }),
            "READ" => Ok(Self::Read {
                name: arg(0, "file name")?,
            }),
            "LIST" => Ok(Self::List),
            other => Err(SdError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Created(String),
    AlreadyExists(String),
    Wrote(String),
    Data(String),
    NotFound(String),
    Files(Vec<String>),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created(name) => write!(f, "Success: Created {name}"),
            Self::AlreadyExists(name) => write!(f, "Error: {name} already exists."),
            Self::Wrote(name) => write!(f, "Success: Wrote data to {name}"),
            Self::Data(content) => write!(f, "READ_DATA: {content}"),
            Self::NotFound(name) => write!(f, "Error: File {name} not found"),
            Self::Files(names) => write!(f, "FILE_LIST: {}", names.join(", ")),
        }
    }
}

/// Render a request outcome as its reply line.
pub fn reply_line(result: &Result<Reply, SdError>) -> String {
    match result {
        Ok(reply) => reply.to_string(),
        Err(e) => e.reply_line(),
    }
}

#[derive(Debug, Clone)]
pub struct SdCard {
    root: PathBuf,
}

impl SdCard {
    /// Use `root` as the card, creating it if missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SdError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root from `PILINK_SD_ROOT`, falling back to `sd_card_storage`.
    pub fn from_env() -> Result<Self, SdError> {
        let root = std::env::var_os(ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        Self::open(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn execute(&self, request: &Request) -> Result<Reply, SdError> {
        tracing::debug!(?request, root = %self.root.display(), "SD request");
        match request {
            Request::Create { name } => self.create(name),
            Request::Write { name, data } => self.write(name, data),
            Request::Read { name } => self.read(name),
            Request::List => self.list(),
        }
    }

    pub fn create(&self, name: &str) -> Result<Reply, SdError> {
        let path = self.path(name)?;
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Reply::Created(name.to_string())),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Ok(Reply::AlreadyExists(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, name: &str, data: &str) -> Result<Reply, SdError> {
        fs::write(self.path(name)?, data)?;
        Ok(Reply::Wrote(name.to_string()))
    }

    pub fn read(&self, name: &str) -> Result<Reply, SdError> {
        match fs::read_to_string(self.path(name)?) {
            Ok(content) => Ok(Reply::Data(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Reply::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self) -> Result<Reply, SdError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(Reply::Files(names))
    }

    /// Files live directly under the root; no separators, no `..`.
    fn path(&self, name: &str) -> Result<PathBuf, SdError> {
        if name.is_empty() || name == "." || name.contains("..") || name.contains(['/', '\\']) {
            return Err(SdError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}
