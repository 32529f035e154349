//! Error types for the fastcs core.
//!
//! `FastCsError` is the single error type returned by every fallible operation
//! in this crate. Variants are grouped by when they occur and how the runtime
//! reacts to them:
//!
//! - **Startup (fatal)**: `Configuration`, `ConnectionEstablishment`,
//!   `InvalidState`, `Sealed`. These abort the lifecycle before any periodic
//!   task is started.
//! - **Per call (recoverable)**: `DeviceCommunication`, `Io`, `Disconnected`.
//!   A periodic task that hits one of these logs it and keeps its schedule; the
//!   attribute keeps its last known value.
//! - **Per request**: `Validation`, `AccessMode`, `NotFound`. Returned to the
//!   transport that issued the request; never a process fault.
//! - **Shutdown**: `TaskFailed`, `ShutdownFailed`. Collected while tearing
//!   down and returned once every controller has been disconnected.
//!
//! Use [`FastCsError::is_recoverable`] rather than matching variants when
//! deciding whether a background task may continue.

use thiserror::Error;

/// Convenience alias for results using the core error type.
pub type Result<T> = std::result::Result<T, FastCsError>;

/// Primary error type for the fastcs core.
#[derive(Error, Debug)]
pub enum FastCsError {
    /// Static configuration of the controller tree is invalid.
    ///
    /// Raised for unresolvable or ambiguous attribute IO bindings, invalid
    /// scheduling periods, duplicate member names and unmet member
    /// declarations. Always fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single exchange with a device failed.
    ///
    /// Covers lost connections, timeouts and responses that cannot be parsed
    /// into the attribute's datatype.
    #[error("Device communication error: {0}")]
    DeviceCommunication(String),

    /// A controller failed to establish its device connection during the
    /// connect phase.
    #[error("Controller '{controller}' failed to connect: {message}")]
    ConnectionEstablishment {
        /// Dotted path of the controller (empty for the root)
        controller: String,
        /// Underlying failure
        message: String,
    },

    /// A value was rejected by the attribute's datatype constraints.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A path, index or name lookup found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The controller tree was mutated after the API snapshot was built.
    #[error("Controller tree is sealed, cannot {0}")]
    Sealed(String),

    /// The operation is not permitted by the attribute's access mode.
    #[error("Attribute '{attribute}' does not support {operation}")]
    AccessMode {
        /// Dotted path of the attribute
        attribute: String,
        /// Rejected operation (e.g. "put", "update")
        operation: &'static str,
    },

    /// A lifecycle operation was called out of order.
    #[error("Invalid lifecycle transition: cannot {operation} while {state}")]
    InvalidState {
        /// Requested operation
        operation: &'static str,
        /// Current lifecycle state
        state: String,
    },

    /// A connection was used before `connect` or after `close`.
    #[error("Not connected: {0}")]
    Disconnected(String),

    /// Standard I/O failure from a socket or serial port.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A transport failed to connect or its serve loop returned an error.
    #[error("Transport '{name}' failed: {message}")]
    Transport {
        /// Transport name
        name: String,
        /// Underlying failure
        message: String,
    },

    /// A background task panicked or had to be aborted.
    #[error("Task '{task}' failed: {message}")]
    TaskFailed {
        /// Task name, e.g. `update:ramp.1.actual`
        task: String,
        /// Panic payload or abort reason
        message: String,
    },

    /// Shutdown completed but one or more tasks or controllers reported errors.
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<FastCsError>),
}

impl FastCsError {
    /// Whether a periodic task that hit this error may keep running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FastCsError::DeviceCommunication(_) | FastCsError::Io(_) | FastCsError::Disconnected(_)
        )
    }

    /// Shorthand for a malformed device response.
    pub fn malformed(response: &str, expected: impl std::fmt::Display) -> Self {
        FastCsError::DeviceCommunication(format!(
            "malformed response {response:?}, expected {expected}"
        ))
    }
}
