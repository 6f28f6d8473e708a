//! Inbound command grammar: `CMD:<MODULE>:<ACTION>[:<ARG>...]`.
//!
//! Parsing is strict about the prefix and module and forgiving about everything
//! else. Anything that is not a command comes back as a [`ParseError`], which the
//! supervisor drops without a trace on the link.
//!
//! Tokens are split naively on `:`. An argument value containing a colon (an
//! `MM:SS` timer, a timestamped payload) arrives as several tokens; only actions
//! that read trailing tokens see the whole value.

use std::fmt;
use std::str::FromStr;

pub const COMMAND_PREFIX: &str = "CMD";
pub const SEPARATOR: char = ':';

/// Hardware family a command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    Gpio,
    Pwm,
    I2c,
    Spi,
}

impl Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpio => "GPIO",
            Self::Pwm => "PWM",
            Self::I2c => "I2C",
            Self::Spi => "SPI",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Module {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GPIO" => Ok(Self::Gpio),
            "PWM" => Ok(Self::Pwm),
            "I2C" => Ok(Self::I2c),
            "SPI" => Ok(Self::Spi),
            other => Err(ParseError::UnknownModule(other.to_string())),
        }
    }
}

/// Why a line was not accepted as a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("line does not start with CMD")]
    NotACommand,

    #[error("expected at least module and action, got {0} token(s)")]
    TooFewTokens(usize),

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("{module}:{action} needs {expected} non-empty argument(s), got {got}")]
    MissingArgument {
        module: Module,
        action: String,
        expected: usize,
        got: usize,
    },
}

/// A decoded command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub module: Module,
    pub action: String,
    pub args: Vec<String>,
}

/// Number of leading arguments an action cannot do without.
///
/// Actions not listed here take none; trailing extras are always tolerated.
fn required_args(module: Module, action: &str) -> usize {
    match (module, action) {
        (Module::Gpio, "BLINK") | (Module::I2c, "TIMER") => 1,
        _ => 0,
    }
}

impl Command {
    pub fn new(module: Module, action: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            module,
            action: action.into(),
            args,
        }
    }

    /// Decode one raw line.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let tokens: Vec<&str> = line.split(SEPARATOR).collect();

        if tokens.first() != Some(&COMMAND_PREFIX) {
            return Err(ParseError::NotACommand);
        }
        if tokens.len() < 3 {
            return Err(ParseError::TooFewTokens(tokens.len()));
        }

        let module: Module = tokens[1].parse()?;
        let action = tokens[2].to_string();
        let args: Vec<String> = tokens[3..].iter().map(|t| t.to_string()).collect();

        let expected = required_args(module, &action);
        let present = args.iter().take(expected).filter(|a| !a.is_empty()).count();
        if present < expected {
            return Err(ParseError::MissingArgument {
                module,
                action,
                expected,
                got: present,
            });
        }

        Ok(Self {
            module,
            action,
            args,
        })
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", COMMAND_PREFIX, self.module, self.action)?;
        for arg in &self.args {
            write!(f, "{}{}", SEPARATOR, arg)?;
        }
        Ok(())
    }
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
