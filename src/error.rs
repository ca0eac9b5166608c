//! Error types for kapsule-dbus-dispatch.

use thiserror::Error;

use crate::message::error_names;

/// Result type alias for kapsule-dbus-dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by exported objects, proxies and connections.
#[derive(Debug, Error)]
pub enum Error {
    /// A message or pending call could not be built or queued.
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// The connection refused to register an object path.
    #[error("Failed to register object path {path}: {reason}")]
    RegistrationFailed { path: String, reason: String },

    /// The connection is closed.
    #[error("Connection is closed")]
    Disconnected,

    /// A blocking call got no reply (timeout or disconnection).
    #[error("No reply ({name}): {message}")]
    NoReply { name: String, message: String },

    /// The remote side answered with an error reply.
    #[error("{name}: {message}")]
    RemoteFault { name: String, message: String },

    /// Adding or removing a broker-side match rule failed.
    #[error("Match rule update failed ({name}): {message}")]
    FilterSyncFailed { name: String, message: String },

    /// A method or signal name was rejected.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// D-Bus error from zbus.
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The D-Bus error name this error is reported under.
    pub fn name(&self) -> &str {
        match self {
            Error::AllocationFailed(_) => error_names::NO_MEMORY,
            Error::RegistrationFailed { .. } => error_names::OBJECT_PATH_IN_USE,
            Error::Disconnected => error_names::DISCONNECTED,
            Error::NoReply { name, .. }
            | Error::RemoteFault { name, .. }
            | Error::FilterSyncFailed { name, .. } => name,
            Error::InvalidName(_) => error_names::INVALID_ARGS,
            Error::DBus(zbus::Error::MethodError(name, _, _)) => name.as_str(),
            Error::DBus(_) | Error::Io(_) | Error::Config(_) => error_names::FAILED,
        }
    }

    /// The human-readable part of the error, without the name.
    pub fn message(&self) -> String {
        match self {
            Error::NoReply { message, .. }
            | Error::RemoteFault { message, .. }
            | Error::FilterSyncFailed { message, .. } => message.clone(),
            Error::DBus(zbus::Error::MethodError(_, detail, _)) => detail.clone().unwrap_or_default(),
            other => other.to_string(),
        }
    }

    /// No reply arrived before the call's deadline.
    pub fn no_reply_timeout() -> Self {
        Error::NoReply {
            name: error_names::NO_REPLY.to_string(),
            message: "Did not receive a reply. Possible causes include: the remote application \
                      did not send a reply, the message bus security policy blocked the reply, \
                      the reply timeout expired, or the network connection was broken."
                .to_string(),
        }
    }

    /// The connection went away while the call was outstanding.
    pub fn no_reply_disconnected() -> Self {
        Error::NoReply {
            name: error_names::DISCONNECTED.to_string(),
            message: "Connection is closed".to_string(),
        }
    }
}

/// Failure returned by a method or signal handler.
///
/// The exported-object dispatcher maps these onto error replies: `DBus`
/// is sent verbatim, `Failed` is wrapped under
/// [`error_names::HANDLER_FAULT`].
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A fault with a wire-visible D-Bus error name.
    #[error("{name}: {message}")]
    DBus { name: String, message: String },

    /// Any other failure; its description becomes the error message.
    #[error("{0}")]
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Create a fault that is reported to the caller under `name`.
    pub fn dbus(name: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::DBus {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Wrap an arbitrary error.
    pub fn failed<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        HandlerError::Failed(err.into())
    }
}

impl From<Error> for HandlerError {
    fn from(err: Error) -> Self {
        match err {
            Error::RemoteFault { name, message } => HandlerError::DBus { name, message },
            other => HandlerError::Failed(Box::new(other)),
        }
    }
}

impl From<zbus::Error> for HandlerError {
    fn from(err: zbus::Error) -> Self {
        match err {
            // Body decoding failures mean the caller sent the wrong arguments
            zbus::Error::Variant(e) => HandlerError::dbus(error_names::INVALID_ARGS, e.to_string()),
            zbus::Error::MethodError(name, detail, _) => {
                HandlerError::dbus(name.to_string(), detail.unwrap_or_default())
            }
            other => HandlerError::Failed(Box::new(other)),
        }
    }
}

/// Name and message of the last failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorState {
    /// D-Bus error name.
    pub name: String,
    /// Human-readable message.
    pub message: String,
}

impl From<&Error> for ErrorState {
    fn from(err: &Error) -> Self {
        Self {
            name: err.name().to_string(),
            message: err.message(),
        }
    }
}

/// Error state kept by proxies and exported objects.
///
/// Reset at the start of each fallible operation and set when it fails.
#[derive(Debug, Default)]
pub struct LastError {
    state: parking_lot::Mutex<Option<ErrorState>>,
}

impl LastError {
    /// Clear the recorded error.
    pub fn reset(&self) {
        *self.state.lock() = None;
    }

    /// Record the error carried by `result`, if any, and pass it through.
    pub fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            *self.state.lock() = Some(ErrorState::from(e));
        }
        result
    }

    /// The most recent error, if the last operation failed.
    pub fn get(&self) -> Option<ErrorState> {
        self.state.lock().clone()
    }
}
