//! The connection seam.
//!
//! Exported objects, proxies and signal routers never talk to a transport
//! directly; they go through [`BusConnection`]. The crate ships two
//! implementations: [`crate::bus_connection::ZbusConnection`] for real
//! buses and [`crate::loopback::LoopbackConnection`] for in-process use.

use std::sync::Arc;
use std::time::Duration;

use zbus::Message;

use crate::error::{Error, Result};
use crate::message::remote_fault;
use crate::pending::PendingCall;

/// Reply timeout used when a call asks for [`Timeout::Default`].
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// How long to wait for a method reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// The transport default, 25 seconds.
    #[default]
    Default,
    /// Wait forever.
    Infinite,
    /// Wait for the given duration.
    After(Duration),
}

impl Timeout {
    /// Resolve to a concrete duration; `None` means no deadline.
    pub fn resolve(self) -> Option<Duration> {
        match self {
            Timeout::Default => Some(DEFAULT_CALL_TIMEOUT),
            Timeout::Infinite => None,
            Timeout::After(d) => Some(d),
        }
    }

    /// Build a timeout from milliseconds, where a negative value means the
    /// default and `0` means no deadline.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => Timeout::Default,
            0 => Timeout::Infinite,
            ms => Timeout::After(Duration::from_millis(ms as u64)),
        }
    }
}

/// Wrap an error from [`BusConnection::send_with_reply`].
pub(crate) fn submission_failed(err: Error) -> Error {
    Error::AllocationFailed(format!("Unable to send method call: {}", err))
}

/// What a per-path handler did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The message was consumed.
    Handled,
    /// The handler declined; the connection may try a fallback.
    NotYetHandled,
}

/// Callback registered for one object path on a connection.
pub trait ObjectPathHandler: Send + Sync {
    /// Handle a method call or signal addressed to the registered path.
    ///
    /// `conn` is the connection the message arrived on; replies go out
    /// through it.
    fn handle_message(&self, conn: &dyn BusConnection, msg: &Message) -> DispatchOutcome;
}

/// A D-Bus connection as seen by the dispatch layer.
pub trait BusConnection: Send + Sync {
    /// Whether the connection is still open.
    fn is_connected(&self) -> bool;

    /// Whether this is a peer-to-peer connection with no broker.
    ///
    /// Private connections receive every signal their peer emits, so signal
    /// routers skip broker-side match rules on them.
    fn is_private(&self) -> bool;

    /// The unique name the broker assigned, if any.
    fn unique_name(&self) -> Option<String>;

    /// Queue a message for sending.
    fn send(&self, msg: &Message) -> Result<()>;

    /// Send a method call and return a handle for its reply.
    ///
    /// `Ok(None)` means the call could not be tracked because the
    /// connection is closed.
    fn send_with_reply(&self, msg: &Message, timeout: Timeout) -> Result<Option<PendingCall>>;

    /// Send a method call and block the calling thread until the reply
    /// arrives or the timeout expires.
    ///
    /// A call the transport refuses gives [`Error::AllocationFailed`], a
    /// closed connection [`Error::NoReply`], and an error reply
    /// [`Error::RemoteFault`].
    fn send_with_reply_and_block(&self, msg: &Message, timeout: Timeout) -> Result<Message> {
        let pending = self
            .send_with_reply(msg, timeout)
            .map_err(submission_failed)?
            .ok_or_else(Error::no_reply_disconnected)?;
        let reply = pending.block(timeout.resolve())?;
        match remote_fault(&reply) {
            Some(err) => Err(err),
            None => Ok(reply),
        }
    }

    /// Register a handler for an object path.
    ///
    /// Fails with [`Error::RegistrationFailed`] if the path is taken.
    fn register_object_path(&self, path: &str, handler: Arc<dyn ObjectPathHandler>) -> Result<()>;

    /// Remove the handler registered for a path.
    fn unregister_object_path(&self, path: &str) -> bool;

    /// Names of the registered paths directly below `path`.
    fn child_nodes(&self, path: &str) -> Vec<String>;

    /// Ask the broker to route matching messages to this connection.
    fn add_match(&self, rule: &str) -> Result<()>;

    /// Undo an earlier [`BusConnection::add_match`].
    fn remove_match(&self, rule: &str) -> Result<()>;
}
