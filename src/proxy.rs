//! Client-side call machinery shared by both proxy kinds.
//!
//! [`ProxyCore`] builds method calls for one remote object, sends them
//! blocking or asynchronously, and turns error replies into
//! [`Error::RemoteFault`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, trace};
use zbus::zvariant::Type;
use zbus::Message;

use crate::connection::{submission_failed, BusConnection, Timeout};
use crate::error::{Error, ErrorState, LastError, Result};
use crate::message::{create_method_call, remote_fault};
use crate::pending::PendingCall;

/// An outgoing call, or the error that prevented building it.
pub type OutgoingCall = Result<Message>;

/// Completion callback for an asynchronous call.
///
/// Implemented for any `FnOnce(Result<Message>) + Send`. Error replies
/// arrive as `Err(Error::RemoteFault { .. })`.
pub trait MethodCallback: Send {
    /// Consume the callback with the call's outcome.
    fn on_reply(self: Box<Self>, reply: Result<Message>);
}

impl<F> MethodCallback for F
where
    F: FnOnce(Result<Message>) + Send,
{
    fn on_reply(self: Box<Self>, reply: Result<Message>) {
        (*self)(reply)
    }
}

/// Turn an error reply into [`Error::RemoteFault`]; other replies pass
/// through.
pub fn into_outcome(reply: Result<Message>) -> Result<Message> {
    let reply = reply?;
    match remote_fault(&reply) {
        Some(err) => Err(err),
        None => Ok(reply),
    }
}

/// Connection, addressing and error state for calls to one remote object.
pub struct ProxyCore {
    connection: Arc<dyn BusConnection>,
    path: String,
    destination: Option<String>,
    interface: Option<String>,
    timeout: Timeout,
    last_error: LastError,
}

impl ProxyCore {
    /// Create a proxy core for `path`, optionally bound to `destination`.
    pub fn new(
        connection: Arc<dyn BusConnection>,
        path: impl Into<String>,
        destination: Option<&str>,
    ) -> Self {
        Self {
            connection,
            path: path.into(),
            destination: destination.map(str::to_string),
            interface: None,
            timeout: Timeout::Default,
            last_error: LastError::default(),
        }
    }

    /// Get the connection calls are sent on.
    pub fn connection(&self) -> &Arc<dyn BusConnection> {
        &self.connection
    }

    /// Get the object path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the destination bus name.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Set the destination bus name; `None` lets the broker resolve it.
    pub fn set_destination(&mut self, destination: Option<&str>) {
        self.destination = destination.map(str::to_string);
    }

    /// Get the interface name.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Set the interface name; `None` leaves calls unqualified.
    pub fn set_interface(&mut self, interface: Option<&str>) {
        self.interface = interface.map(str::to_string);
    }

    /// Get the reply timeout.
    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// Set the reply timeout for blocking and asynchronous calls.
    pub fn set_timeout(&mut self, timeout: Timeout) {
        self.timeout = timeout;
    }

    /// The error recorded by the last failed operation.
    pub fn last_error(&self) -> Option<ErrorState> {
        self.last_error.get()
    }

    pub(crate) fn error_state(&self) -> &LastError {
        &self.last_error
    }

    /// Build a method call to `method` carrying `args`.
    pub fn create_call<B>(&self, method: &str, args: &B) -> OutgoingCall
    where
        B: serde::Serialize + Type,
    {
        self.last_error.reset();
        let result = create_method_call(
            self.destination.as_deref(),
            &self.path,
            self.interface.as_deref(),
            method,
            args,
        );
        self.last_error.track(result)
    }

    /// Send `call` and block until its reply arrives.
    ///
    /// A timeout or closed connection gives [`Error::NoReply`]; an error
    /// reply gives [`Error::RemoteFault`].
    pub fn call(&self, call: &Message) -> Result<Message> {
        self.last_error.reset();
        trace!(path = %self.path, "Blocking call");
        let result = self.connection.send_with_reply_and_block(call, self.timeout);
        self.last_error.track(result)
    }

    /// Send a call that was built successfully and return its reply.
    ///
    /// A call that failed to build is returned as its error, unsent.
    pub fn process_in_args(&self, call: OutgoingCall) -> Result<Message> {
        let call = self.last_error.track(call)?;
        self.call(&call)
    }

    /// Check a reply for an error, converting it to [`Error::RemoteFault`].
    pub fn process_out_args(&self, reply: &Message) -> Result<()> {
        self.last_error.reset();
        let result = match remote_fault(reply) {
            Some(err) => Err(err),
            None => Ok(()),
        };
        self.last_error.track(result)
    }

    /// Build, send and check a call in one step.
    pub fn call_method<B>(&self, method: &str, args: &B) -> Result<Message>
    where
        B: serde::Serialize + Type,
    {
        let call = self.create_call(method, args)?;
        let reply = self.call(&call)?;
        self.process_out_args(&reply)?;
        Ok(reply)
    }

    /// Send `call` without waiting; the reply is collected through the
    /// returned handle.
    pub fn send_async(&self, call: &Message) -> Result<PendingCall> {
        self.last_error.reset();
        let result = self.submit(call);
        self.last_error.track(result)
    }

    fn submit(&self, call: &Message) -> Result<PendingCall> {
        let pending = self
            .connection
            .send_with_reply(call, self.timeout)
            .map_err(submission_failed)?;
        pending.ok_or(Error::Disconnected)
    }

    /// Send `call` and hand its outcome to `callback` when it completes.
    ///
    /// If `call` carries an error, or the call cannot be submitted, the
    /// callback is dropped without being invoked and the error returned.
    pub fn execute_async<C>(&self, call: OutgoingCall, callback: C) -> Result<PendingCall>
    where
        C: MethodCallback + 'static,
    {
        self.last_error.reset();
        let result = self.submit_with_callback(call, Box::new(callback));
        self.last_error.track(result)
    }

    fn submit_with_callback(
        &self,
        call: OutgoingCall,
        callback: Box<dyn MethodCallback>,
    ) -> Result<PendingCall> {
        let call = call?;
        let pending = self.submit(&call)?;

        let path = self.path.clone();
        pending
            .set_notify(move |reply| {
                let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
                    callback.on_reply(into_outcome(reply));
                }));
                if outcome.is_err() {
                    error!(path = %path, "Completion callback panicked");
                }
            })
            .map_err(|e| Error::AllocationFailed(format!("Unable to attach completion: {}", e)))?;

        debug!(path = %self.path, serial = pending.serial(), "Asynchronous call submitted");
        Ok(pending)
    }
}
