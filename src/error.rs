//! Error types for the minit supervisor.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, constructing or running units.
#[derive(Error, Debug)]
pub enum Error {
    /// Unit is missing a field its kind requires
    #[error("missing unit field: {0}")]
    MissingField(&'static str),

    /// Unit failed validation
    #[error("invalid unit: {0}")]
    InvalidUnit(String),

    /// Unknown unit kind
    #[error("unknown unit kind: {0}")]
    UnknownKind(String),

    /// Working directory is missing or not a directory
    #[error("invalid working directory: {path}: {reason}")]
    InvalidDir { path: PathBuf, reason: String },

    /// Shell string could not be tokenized
    #[error("invalid shell: {0}")]
    InvalidShell(String),

    /// Command resolved to an empty argv
    #[error("empty command")]
    EmptyCommand,

    /// Cron expression failed to parse
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    /// Render file pattern failed to parse
    #[error("invalid file pattern: {0}")]
    InvalidPattern(String),

    /// Process could not be spawned
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Process exited with a code outside the accepted set
    #[error("exit code: {0} is not in success_codes")]
    ExitCode(i32),

    /// Template failed to compile or render
    #[error("template error: {0}")]
    Template(String),

    /// A single render task failed
    #[error("failed rendering {path}: {reason}")]
    Render { path: PathBuf, reason: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A critical unit failed
    #[error("critical unit {unit} failed: {source}")]
    Critical {
        unit: String,
        #[source]
        source: Box<Error>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unit file parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Glob pattern error
    #[error("glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),

    /// Nix error
    #[error("system error: {0}")]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Wrap an error as the failure of a critical unit.
    pub fn critical(unit: impl Into<String>, source: Error) -> Self {
        Error::Critical {
            unit: unit.into(),
            source: Box::new(source),
        }
    }
}
