//! Unified error types for Brig
//!
//! Every failure carries an [`ErrorKind`]. Sub-component failures raised during
//! a lifecycle transition are wrapped in [`Error::Jail`], which names the jail
//! and the component but keeps the original kind visible through [`Error::kind`].

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Brig operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to create C string: {0}")]
    CString(#[from] std::ffi::NulError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Lookup errors
    #[error("'{0}' not found")]
    NotFound(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("Jail name '{0}' is already in use")]
    NameConflict(String),

    #[error("Template '{0}' not found")]
    TemplateNotFound(String),

    // Storage errors
    #[error("Dataset '{0}' is busy")]
    Busy(String),

    #[error("'{target}' has dependent clones: {}", .dependents.join(", "))]
    HasDependents {
        target: String,
        dependents: Vec<String>,
    },

    #[error("Dataset '{0}' is not a clone")]
    NoOriginPresent(String),

    #[error("Not enough space for '{dataset}': requested {requested} bytes, {available} available")]
    CapacityExceeded {
        dataset: String,
        requested: u64,
        available: u64,
    },

    #[error("Storage inconsistent for jail '{jail}': {reason}")]
    StorageInconsistent { jail: String, reason: String },

    #[error("ZFS operation failed: {0}")]
    Zfs(String),

    // Limit errors
    #[error("Unsupported resource '{0}'")]
    UnsupportedResource(String),

    #[error("Invalid threshold for '{resource}': soft {soft} exceeds hard {hard}")]
    InvalidThreshold { resource: String, soft: u64, hard: u64 },

    #[error("Invalid limit '{0}'")]
    InvalidLimit(String),

    #[error("rctl failed: {0}")]
    Rctl(String),

    // Network errors
    #[error("No interface available: {0}")]
    InterfaceExhausted(String),

    #[error("Address {address} is already bound by {holder}")]
    AddressConflict { address: String, holder: String },

    #[error("Address {0} is not reachable from any host interface")]
    AddressUnreachable(String),

    #[error("Network error: {0}")]
    Network(String),

    // Jail errors
    #[error("jail_set syscall failed: {0}")]
    JailSet(String),

    #[error("jail_get syscall failed: {0}")]
    JailGet(String),

    #[error("jail_remove syscall failed")]
    JailRemoveFailed,

    #[error("Jail '{jail}' did not stop within {seconds} seconds")]
    Timeout { jail: String, seconds: u64 },

    #[error("Jail '{jail}' is {state}, cannot {operation}")]
    InvalidState {
        jail: String,
        state: String,
        operation: String,
    },

    #[error("Invalid property '{key}': {reason}")]
    InvalidProperty { key: String, reason: String },

    #[error("Transition for jail '{0}' was cancelled")]
    Cancelled(String),

    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("Jail '{jail}' {component}: {source}")]
    Jail {
        jail: String,
        component: Component,
        #[source]
        source: Box<Error>,
    },

    // System errors
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("{0} is not supported on this platform")]
    UnsupportedPlatform(String),
}

/// Classification of an [`Error`], stable across wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NameConflict,
    TemplateNotFound,
    Busy,
    HasDependents,
    NoOriginPresent,
    CapacityExceeded,
    StorageInconsistent,
    UnsupportedResource,
    InvalidThreshold,
    InterfaceExhausted,
    AddressConflict,
    AddressUnreachable,
    Timeout,
    InvalidState,
    InvalidProperty,
    Cancelled,
    Config,
    Failed,
}

impl ErrorKind {
    /// Process exit code reported by the command line for this kind
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Failed => 1,
            ErrorKind::Config => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::AlreadyExists => 4,
            ErrorKind::NameConflict => 5,
            ErrorKind::TemplateNotFound => 6,
            ErrorKind::Busy => 7,
            ErrorKind::HasDependents => 8,
            ErrorKind::NoOriginPresent => 9,
            ErrorKind::CapacityExceeded => 10,
            ErrorKind::StorageInconsistent => 11,
            ErrorKind::UnsupportedResource => 12,
            ErrorKind::InvalidThreshold => 13,
            ErrorKind::InterfaceExhausted => 14,
            ErrorKind::AddressConflict => 15,
            ErrorKind::AddressUnreachable => 16,
            ErrorKind::Timeout => 17,
            ErrorKind::InvalidState => 18,
            ErrorKind::InvalidProperty => 19,
            ErrorKind::Cancelled => 20,
        }
    }
}

/// Sub-component a transition step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Storage,
    Properties,
    Kernel,
    Network,
    Limits,
    Launch,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Storage => "storage",
            Component::Properties => "properties",
            Component::Kernel => "kernel",
            Component::Network => "network",
            Component::Limits => "limits",
            Component::Launch => "launch",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Wrap an error with the jail and component it was raised for
    pub fn in_jail(self, jail: impl Into<String>, component: Component) -> Self {
        match self {
            // Never double wrap; the innermost context is the accurate one
            wrapped @ Error::Jail { .. } => wrapped,
            other => Error::Jail {
                jail: jail.into(),
                component,
                source: Box::new(other),
            },
        }
    }

    /// The kind of this error, looking through jail context
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Jail { source, .. } => source.kind(),
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NameConflict(_) => ErrorKind::NameConflict,
            Error::TemplateNotFound(_) => ErrorKind::TemplateNotFound,
            Error::Busy(_) => ErrorKind::Busy,
            Error::HasDependents { .. } => ErrorKind::HasDependents,
            Error::NoOriginPresent(_) => ErrorKind::NoOriginPresent,
            Error::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Error::StorageInconsistent { .. } => ErrorKind::StorageInconsistent,
            Error::UnsupportedResource(_) => ErrorKind::UnsupportedResource,
            Error::InvalidThreshold { .. } => ErrorKind::InvalidThreshold,
            Error::InterfaceExhausted(_) => ErrorKind::InterfaceExhausted,
            Error::AddressConflict { .. } => ErrorKind::AddressConflict,
            Error::AddressUnreachable(_) => ErrorKind::AddressUnreachable,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::InvalidProperty { .. } | Error::InvalidLimit(_) => ErrorKind::InvalidProperty,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::ConfigRead { .. } | Error::ConfigParse(_) | Error::ConfigValidation(_) => {
                ErrorKind::Config
            }
            _ => ErrorKind::Failed,
        }
    }
}

/// Result type alias for Brig operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_wrapping() {
        let err = Error::AddressConflict {
            address: "10.0.0.5".into(),
            holder: "web2".into(),
        }
        .in_jail("web1", Component::Network);

        assert_eq!(err.kind(), ErrorKind::AddressConflict);
        let msg = err.to_string();
        assert!(msg.contains("web1"));
        assert!(msg.contains("network"));
    }

    #[test]
    fn test_no_double_wrap() {
        let err = Error::Busy("zroot/brig/jails/a".into())
            .in_jail("a", Component::Storage)
            .in_jail("a", Component::Kernel);
        match err {
            Error::Jail { component, .. } => assert_eq!(component, Component::Storage),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_exit_codes_distinct() {
        let kinds = [
            ErrorKind::NotFound,
            ErrorKind::Busy,
            ErrorKind::HasDependents,
            ErrorKind::AddressConflict,
            ErrorKind::Timeout,
        ];
        let codes: std::collections::HashSet<_> = kinds.iter().map(|k| k.exit_code()).collect();
        assert_eq!(codes.len(), kinds.len());
    }
}
