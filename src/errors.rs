//! Definition of errors.

use core::fmt;
use std::error::Error;

/// Error used when the argument is invalid.
#[derive(Debug)]
pub struct InvalidArgumentError {
    msg: &'static str,
}

impl fmt::Display for InvalidArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidArgumentError: {}", self.msg)
    }
}

impl Error for InvalidArgumentError {}

/// Error used when an input line or a configuration entry is malformed.
#[derive(Debug)]
pub struct ParseError {
    line: usize,
    msg: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ParseError: line {}: {}", self.line, self.msg)
    }
}

impl Error for ParseError {}

/// Error used when a model file fails validation on load.
#[derive(Debug)]
pub struct CorruptModelError {
    msg: String,
}

impl fmt::Display for CorruptModelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CorruptModelError: {}", self.msg)
    }
}

impl Error for CorruptModelError {}

/// Error used when the objective or gradient leaves the finite range.
#[derive(Debug)]
pub struct NumericBreakdownError {
    msg: &'static str,
}

impl fmt::Display for NumericBreakdownError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NumericBreakdownError: {}", self.msg)
    }
}

impl Error for NumericBreakdownError {}

/// Error used when the optimizer cannot make progress.
#[derive(Debug)]
pub struct OptimizerFailedError {
    msg: String,
}

impl fmt::Display for OptimizerFailedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OptimizerFailedError: {}", self.msg)
    }
}

impl Error for OptimizerFailedError {}

/// The error type for this crate.
#[derive(Debug)]
pub enum TricrfError {
    /// Error variant for [`InvalidArgumentError`].
    InvalidArgument(InvalidArgumentError),

    /// Error variant for [`ParseError`].
    Parse(ParseError),

    /// Error variant for [`CorruptModelError`].
    CorruptModel(CorruptModelError),

    /// Error variant for [`NumericBreakdownError`].
    NumericBreakdown(NumericBreakdownError),

    /// Error variant for [`OptimizerFailedError`].
    OptimizerFailed(OptimizerFailedError),

    /// Error variant for I/O failures.
    Io(std::io::Error),

    /// Error variant for model decoding failures.
    Decode(bincode::error::DecodeError),

    /// Error variant for model encoding failures.
    Encode(bincode::error::EncodeError),
}

impl TricrfError {
    /// Creates a new [`InvalidArgumentError`].
    pub const fn invalid_argument(msg: &'static str) -> Self {
        Self::InvalidArgument(InvalidArgumentError { msg })
    }

    /// Creates a new [`ParseError`].
    pub fn parse<S>(line: usize, msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::Parse(ParseError {
            line,
            msg: msg.into(),
        })
    }

    /// Creates a new [`CorruptModelError`].
    pub fn corrupt_model<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::CorruptModel(CorruptModelError { msg: msg.into() })
    }

    /// Creates a new [`NumericBreakdownError`].
    pub const fn numeric_breakdown(msg: &'static str) -> Self {
        Self::NumericBreakdown(NumericBreakdownError { msg })
    }

    /// Creates a new [`OptimizerFailedError`].
    pub fn optimizer_failed<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::OptimizerFailed(OptimizerFailedError { msg: msg.into() })
    }

    /// Returns the process exit code associated with this error kind.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse(_) => 2,
            Self::NumericBreakdown(_) => 3,
            Self::OptimizerFailed(_) => 4,
            _ => 1,
        }
    }
}

impl fmt::Display for TricrfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidArgument(e) => e.fmt(f),
            Self::Parse(e) => e.fmt(f),
            Self::CorruptModel(e) => e.fmt(f),
            Self::NumericBreakdown(e) => e.fmt(f),
            Self::OptimizerFailed(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::Encode(e) => e.fmt(f),
        }
    }
}

impl Error for TricrfError {}

impl From<std::io::Error> for TricrfError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<bincode::error::DecodeError> for TricrfError {
    fn from(error: bincode::error::DecodeError) -> Self {
        Self::Decode(error)
    }
}

impl From<bincode::error::EncodeError> for TricrfError {
    fn from(error: bincode::error::EncodeError) -> Self {
        Self::Encode(error)
    }
}

/// A specialized Result type.
pub type Result<T, E = TricrfError> = core::result::Result<T, E>;
