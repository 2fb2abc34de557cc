//! Error types and handling for the phone core
//!
//! Errors reach application code in two ways:
//!
//! - **Synchronously** as a [`PhoneError`] returned from a [`Phone`](crate::Phone)
//!   operation. Precondition violations (empty arguments, wrong connect state,
//!   busy line) are detected before any engine interaction; failures of a
//!   submitted command (engine refused the operation, loop stopped, timeout)
//!   come back through the same `Result`.
//! - **Asynchronously** as [`PhoneEvent::Error`](crate::events::PhoneEvent::Error)
//!   carrying an [`ErrorKind`]. Anything the engine reports through its own
//!   callbacks (registration failed, call error) is detected on the engine loop,
//!   which has no caller to return to.
//!
//! # Error Handling Guide
//!
//! ```rust,no_run
//! # use sipline_phone_core::{Phone, PhoneError};
//! # fn example(phone: &Phone) {
//! match phone.make_call("sip:bob@example.com") {
//!     Ok(()) => {}
//!     Err(PhoneError::LineBusy) => {
//!         // Wait for CallCompleted before dialing again
//!     }
//!     Err(PhoneError::Order { operation, state }) => {
//!         eprintln!("{} not allowed while {:?}", operation, state);
//!     }
//!     Err(e) if e.is_recoverable() => {
//!         eprintln!("transient failure, retry later: {}", e);
//!     }
//!     Err(e) => eprintln!("call failed: {}", e),
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::Capability;
use crate::phone::ConnectState;

/// Result type for phone core operations
pub type PhoneResult<T> = Result<T, PhoneError>;

/// Errors that can occur while driving the phone
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PhoneError {
    /// A required argument was missing or malformed
    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    /// The operation is not allowed in the current connect state
    #[error("Operation '{operation}' not allowed while phone is {state:?}")]
    Order {
        operation: String,
        state: ConnectState,
    },

    /// A call-initiating operation was attempted while another call occupies the line
    #[error("Line is busy")]
    LineBusy,

    /// The engine loop is not running
    #[error("Engine loop is not running")]
    EngineNotRunning,

    /// The engine loop is stopping; the command was not executed
    #[error("Engine loop is shutting down")]
    ShuttingDown,

    /// The command was still queued when the timeout elapsed and will not run
    #[error("Command timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The command had already started when the timeout elapsed; it runs to
    /// completion and its result is discarded
    #[error("Command still running after {duration_ms}ms, result discarded")]
    TimedOutRunning { duration_ms: u64 },

    /// The submitted closure panicked on the engine loop
    #[error("Command panicked on engine loop: {message}")]
    CommandPanicked { message: String },

    /// Submit was called from the engine loop thread itself
    #[error("Submit called from the engine loop thread")]
    Reentrant,

    /// The call is no longer known to the engine
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: uuid::Uuid },

    /// The engine does not provide the required feature
    #[error("Engine does not support {capability:?}")]
    Unsupported { capability: Capability },

    /// The engine could not be created
    #[error("Engine creation failed: {reason}")]
    EngineCreation { reason: String },

    /// An engine entry point reported failure
    #[error("Engine operation '{operation}' failed: {reason}")]
    Engine { operation: String, reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    Configuration { field: String, reason: String },

    /// Internal invariant broken
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PhoneError {
    /// Create an invalid argument error
    pub fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an order error for `operation` attempted in `state`
    pub fn order(operation: impl Into<String>, state: ConnectState) -> Self {
        Self::Order {
            operation: operation.into(),
            state,
        }
    }

    /// Create an engine operation error
    pub fn engine(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Engine {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Reject empty string arguments
    pub(crate) fn require_non_empty(name: &str, value: &str) -> PhoneResult<()> {
        if value.trim().is_empty() {
            return Err(Self::invalid_argument(name, "must not be empty"));
        }
        Ok(())
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            PhoneError::LineBusy
            | PhoneError::Timeout { .. }
            | PhoneError::ShuttingDown
            | PhoneError::EngineNotRunning
            | PhoneError::Engine { .. } => true,

            PhoneError::InvalidArgument { .. }
            | PhoneError::Configuration { .. }
            | PhoneError::Unsupported { .. }
            | PhoneError::TimedOutRunning { .. }
            | PhoneError::Reentrant => false,

            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            PhoneError::InvalidArgument { .. } | PhoneError::Configuration { .. } => "argument",

            PhoneError::Order { .. } | PhoneError::LineBusy => "state",

            PhoneError::EngineNotRunning
            | PhoneError::ShuttingDown
            | PhoneError::Timeout { .. }
            | PhoneError::TimedOutRunning { .. }
            | PhoneError::CommandPanicked { .. }
            | PhoneError::Reentrant => "dispatch",

            PhoneError::CallNotFound { .. } => "call",

            PhoneError::Unsupported { .. }
            | PhoneError::EngineCreation { .. }
            | PhoneError::Engine { .. } => "engine",

            PhoneError::Internal { .. } => "system",
        }
    }
}

/// Kind of an asynchronously reported error
///
/// Carried by [`PhoneEvent::Error`](crate::events::PhoneEvent::Error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Registration with the proxy failed; the engine has been torn down
    RegisterFailed,
    /// Tried to make a call while another call occupies the line
    LineIsBusyError,
    /// Tried to connect while connected or disconnect while not connected
    OrderError,
    /// A call failed; the line has been freed
    CallError,
    /// Engine failure not otherwise classified
    UnknownError,
}
