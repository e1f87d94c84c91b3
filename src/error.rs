//! Error types shared across the runtime.
//!
//! Configuration errors and routing misses are reported as values (see
//! [`Removal`]) or as these enums; none of them is fatal to the process.

use thiserror::Error;

/// Errors raised while constructing an [`Event`](crate::event::Event).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("invalid event kind: '{0}'")]
    InvalidEventKind(String),

    #[error("{kind} event '{id}' requires a non-empty agent filter")]
    MissingAgentFilter { kind: String, id: String },

    #[error("event id must not be empty")]
    EmptyId,
}

/// Errors raised by the command registry.
///
/// The `Display` strings are user-visible: command execution returns them
/// as its reply text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Command not found: '{0}'")]
    NotFound(String),

    #[error("Could not locate function: '{0}'")]
    HandlerNotFound(String),

    #[error("Command '{name}' is invalid: {reason}")]
    Invalid { name: String, reason: String },

    #[error("Command '{0}' is already defined")]
    Duplicate(String),

    #[error("Error: Not authorized")]
    NotAuthorized,

    #[error("Error: {0}")]
    ValidationFailed(String),
}

/// Errors raised by the scheduler.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule '{0}' can never occur")]
    Unresolvable(String),

    #[error("failed to start timer runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Errors raised while parsing absolute date/time fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("'{value}' does not match format '{format}'")]
    InvalidFormat { value: String, format: String },
}

/// Errors raised while reading or writing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config: {0}")]
    Write(#[from] std::io::Error),
}

/// Outcome of removing something by key.
///
/// Removing a missing entry is not a fault: callers get `NotFound` and
/// every other entry is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    NotFound,
}

impl Removal {
    pub fn is_removed(self) -> bool {
        matches!(self, Self::Removed)
    }

    pub fn is_not_found(self) -> bool {
        matches!(self, Self::NotFound)
    }
}
