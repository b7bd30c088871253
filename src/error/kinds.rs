use std::{fmt, io};

/// Crate-wide `Result` type using [`ExportError`] as the error.
///
/// This alias is re-exported by the parent `error` module and is intended
/// to be used throughout the crate for fallible operations.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Message recorded on a job whose output file is already on disk.
pub const OUTPUT_EXISTS_MESSAGE: &str = "file with same name already exists";

/// Top-level error type for export operations.
#[derive(Debug)]
pub enum ExportError {
    /// Invalid CSV formatting parameters.
    Format(String),

    /// The output file already exists; jobs never overwrite.
    OutputExists(String),

    /// Failure reported by the hit source.
    Source(SourceError),

    /// Write or flush failure on the output sink.
    Sink(io::Error),

    /// Configuration errors.
    Config(ConfigError),

    /// Other I/O errors.
    Io(io::Error),

    /// Generic error with a free-form message.
    Generic(String),
}

/// Hit source errors.
#[derive(Debug)]
pub enum SourceError {
    /// The referenced fact or index does not exist.
    NotFound(String),

    /// Reading from the backend failed.
    Read(String),

    /// A record could not be decoded.
    Decode(String),
}

/// Configuration-specific errors.
#[derive(Debug)]
pub enum ConfigError {
    /// Config file not found.
    FileNotFound(String),

    /// Invalid config format.
    InvalidFormat(String),

    /// Invalid field value.
    InvalidValue { field: String, value: String },
}

impl ExportError {
    /// Message stored on a failed job item.
    ///
    /// `OutputExists` maps to the fixed user-facing message; everything else
    /// uses its `Display` form.
    pub fn job_message(&self) -> String {
        match self {
            ExportError::OutputExists(_) => OUTPUT_EXISTS_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }
}

/* ========================= Display & Error impls ========================= */

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::Format(msg) => write!(f, "Format error: {msg}"),
            ExportError::OutputExists(path) => {
                write!(f, "{OUTPUT_EXISTS_MESSAGE}: {path}")
            }
            ExportError::Source(e) => write!(f, "Source error: {e}"),
            ExportError::Sink(e) => write!(f, "Write error: {e}"),
            ExportError::Config(e) => write!(f, "Configuration error: {e}"),
            ExportError::Io(e) => write!(f, "I/O error: {e}"),
            ExportError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::NotFound(name) => write!(f, "source not found: {name}"),
            SourceError::Read(msg) => write!(f, "read failed: {msg}"),
            SourceError::Decode(msg) => write!(f, "invalid record: {msg}"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::InvalidFormat(msg) => write!(f, "Invalid config format: {msg}"),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value '{value}' for field '{field}'")
            }
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportError::Sink(e) | ExportError::Io(e) => Some(e),
            ExportError::Source(e) => Some(e),
            ExportError::Config(e) => Some(e),
            _ => None,
        }
    }
}
impl std::error::Error for SourceError {}
impl std::error::Error for ConfigError {}

/* ========================= Conversions to ExportError ========================= */

impl From<io::Error> for ExportError {
    fn from(err: io::Error) -> Self {
        ExportError::Io(err)
    }
}

impl From<SourceError> for ExportError {
    fn from(err: SourceError) -> Self {
        ExportError::Source(err)
    }
}

impl From<ConfigError> for ExportError {
    fn from(err: ConfigError) -> Self {
        ExportError::Config(err)
    }
}

impl From<String> for ExportError {
    fn from(msg: String) -> Self {
        ExportError::Generic(msg)
    }
}

impl From<&str> for ExportError {
    fn from(msg: &str) -> Self {
        ExportError::Generic(msg.to_owned())
    }
}
