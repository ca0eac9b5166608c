//! Client proxy for a remote object, with owned signal handlers.

use std::sync::Arc;

use tracing::debug;
use zbus::zvariant::Type;
use zbus::Message;

use crate::connection::{BusConnection, ObjectPathHandler, Timeout};
use crate::error::{Error, ErrorState, HandlerError, Result};
use crate::pending::PendingCall;
use crate::proxy::{MethodCallback, OutgoingCall, ProxyCore};
use crate::signal_router::{SignalHandler, SignalRouter};

/// Proxy for one remote object.
///
/// Signals emitted from the proxy's path are routed to handlers installed
/// with [`ObjectProxy::enable_signal`]. Dropping the proxy unregisters its
/// path and removes every handler along with its match rule.
pub struct ObjectProxy {
    core: ProxyCore,
    signals: Arc<SignalRouter<Box<dyn SignalHandler>>>,
}

impl ObjectProxy {
    /// Create a proxy for `path` on `conn`, optionally bound to
    /// `destination`.
    ///
    /// Registers the path on the connection so signals can be routed.
    pub fn new(conn: Arc<dyn BusConnection>, path: &str, destination: Option<&str>) -> Result<Self> {
        if !conn.is_connected() {
            return Err(Error::Disconnected);
        }
        let signals = Arc::new(SignalRouter::new(path));
        conn.register_object_path(path, Arc::clone(&signals) as Arc<dyn ObjectPathHandler>)?;
        debug!(path = %path, destination = ?destination, "Created object proxy");

        Ok(Self {
            core: ProxyCore::new(conn, path, destination),
            signals,
        })
    }

    /// Get the shared call machinery.
    pub fn core(&self) -> &ProxyCore {
        &self.core
    }

    /// Get the object path.
    pub fn path(&self) -> &str {
        self.core.path()
    }

    /// Set the interface used for calls.
    pub fn set_interface(&mut self, interface: Option<&str>) {
        self.core.set_interface(interface);
    }

    /// Set the destination used for calls.
    pub fn set_destination(&mut self, destination: Option<&str>) {
        self.core.set_destination(destination);
    }

    /// Set the reply timeout.
    pub fn set_timeout(&mut self, timeout: Timeout) {
        self.core.set_timeout(timeout);
    }

    /// The error recorded by the last failed operation.
    pub fn last_error(&self) -> Option<ErrorState> {
        self.core.last_error()
    }

    /// Build a method call to `method` carrying `args`.
    pub fn create_call<B>(&self, method: &str, args: &B) -> OutgoingCall
    where
        B: serde::Serialize + Type,
    {
        self.core.create_call(method, args)
    }

    /// Send `call` and block until its reply arrives.
    pub fn call(&self, call: &Message) -> Result<Message> {
        self.core.call(call)
    }

    /// Send a built call and return its reply.
    pub fn process_in_args(&self, call: OutgoingCall) -> Result<Message> {
        self.core.process_in_args(call)
    }

    /// Check a reply for an error.
    pub fn process_out_args(&self, reply: &Message) -> Result<()> {
        self.core.process_out_args(reply)
    }

    /// Build, send and check a call in one step.
    pub fn call_method<B>(&self, method: &str, args: &B) -> Result<Message>
    where
        B: serde::Serialize + Type,
    {
        self.core.call_method(method, args)
    }

    /// Send `call` without waiting for the reply.
    pub fn send_async(&self, call: &Message) -> Result<PendingCall> {
        self.core.send_async(call)
    }

    /// Send `call` and hand its outcome to `callback`.
    pub fn execute_async<C>(&self, call: OutgoingCall, callback: C) -> Result<PendingCall>
    where
        C: MethodCallback + 'static,
    {
        self.core.execute_async(call, callback)
    }

    /// Route signals named `name` to `handler`; the empty name catches any
    /// signal without its own handler.
    pub fn enable_signal<H>(&self, name: &str, handler: H) -> Result<()>
    where
        H: SignalHandler + 'static,
    {
        let last_error = self.core.error_state();
        last_error.reset();
        let result = self
            .signals
            .enable(self.core.connection().as_ref(), name, Box::new(handler));
        last_error.track(result)
    }

    /// Route signals named `name` to a closure.
    pub fn enable_signal_fn<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: FnMut(&Message) -> std::result::Result<(), HandlerError> + Send + 'static,
    {
        self.enable_signal(name, handler)
    }

    /// Remove the handler for `name`. Unknown names are ignored.
    pub fn remove_signal_handler(&self, name: &str) -> Result<()> {
        let last_error = self.core.error_state();
        last_error.reset();
        let result = self.signals.remove(self.core.connection().as_ref(), name);
        last_error.track(result)
    }

    /// Check whether `name` has a signal handler.
    pub fn has_signal_handler(&self, name: &str) -> bool {
        self.signals.contains(name)
    }

    /// Get the number of signal handlers.
    pub fn signal_handler_count(&self) -> usize {
        self.signals.len()
    }
}

impl Drop for ObjectProxy {
    fn drop(&mut self) {
        let conn = self.core.connection();
        conn.unregister_object_path(self.core.path());
        self.signals.drain(conn.as_ref());
    }
}
