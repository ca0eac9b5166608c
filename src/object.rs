//! Exported objects.
//!
//! An [`ExportedObject`] owns a method dispatch table for one object path.
//! Once enabled on a connection it receives every method call addressed to
//! its path, runs the matching handler and sends exactly one reply: the
//! handler's return value, or an error reply describing how it failed.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use zbus::zvariant::Type;
use zbus::Message;

use crate::connection::{BusConnection, DispatchOutcome, ObjectPathHandler};
use crate::error::{Error, ErrorState, HandlerError, LastError, Result};
use crate::introspect;
use crate::message::{create_error, create_method_return, create_signal, error_names, MessageExt, Reply};

/// Handler for one exported method.
///
/// Implemented for any `FnMut(&Message, &mut Reply) -> Result<(), HandlerError>`.
pub trait MethodHandler: Send {
    /// Process a call, filling in `reply` on success.
    fn process_call(&mut self, call: &Message, reply: &mut Reply) -> std::result::Result<(), HandlerError>;
}

impl<F> MethodHandler for F
where
    F: FnMut(&Message, &mut Reply) -> std::result::Result<(), HandlerError> + Send,
{
    fn process_call(&mut self, call: &Message, reply: &mut Reply) -> std::result::Result<(), HandlerError> {
        self(call, reply)
    }
}

type SharedHandler = Arc<Mutex<Box<dyn MethodHandler>>>;

/// The part of an exported object the connection holds on to.
struct ObjectInner {
    path: String,
    interface: Mutex<Option<String>>,
    methods: Mutex<HashMap<String, SharedHandler>>,
}

impl ObjectInner {
    fn method_names(&self) -> Vec<String> {
        self.methods.lock().keys().cloned().collect()
    }

    fn introspect(&self, conn: &dyn BusConnection, call: &Message) {
        let interface = self.interface.lock().clone();
        let xml = introspect::describe(
            interface.as_deref(),
            &self.method_names(),
            &conn.child_nodes(&self.path),
        );
        match create_method_return(call, &(xml,)) {
            Ok(reply) => send_reply(conn, &self.path, reply),
            Err(e) => warn!(path = %self.path, error = %e, "Failed to build introspection reply"),
        }
    }
}

fn send_reply(conn: &dyn BusConnection, path: &str, reply: Message) {
    if let Err(e) = conn.send(&reply) {
        warn!(path = %path, error = %e, "Failed to send reply");
    }
}

/// Translate a handler's outcome into the message sent back to the caller.
///
/// Returns `None` when the error reply could not be built.
fn reply_for(
    call: &Message,
    outcome: std::thread::Result<std::result::Result<(), HandlerError>>,
    reply: Reply,
) -> Option<Message> {
    let (name, text) = match outcome {
        Ok(Ok(())) => return Some(reply.into_message()),
        Ok(Err(HandlerError::DBus { name, message })) => (name, message),
        Ok(Err(HandlerError::Failed(e))) => (error_names::HANDLER_FAULT.to_string(), e.to_string()),
        Err(_) => (
            error_names::HANDLER_FAULT.to_string(),
            "Unknown fault".to_string(),
        ),
    };
    debug!(error_name = %name, message = %text, "Method handler failed");
    match create_error(call, &name, &text) {
        Ok(err) => Some(err),
        Err(e) => {
            warn!(error_name = %name, error = %e, "Failed to build error reply");
            None
        }
    }
}

impl ObjectPathHandler for ObjectInner {
    fn handle_message(&self, conn: &dyn BusConnection, msg: &Message) -> DispatchOutcome {
        if !msg.is_method_call() || msg.path_str().as_deref() != Some(self.path.as_str()) {
            return DispatchOutcome::NotYetHandled;
        }
        let Some(member) = msg.member_str() else {
            return DispatchOutcome::NotYetHandled;
        };

        let handler = self.methods.lock().get(&member).cloned();
        let Some(handler) = handler else {
            if introspect::is_introspect_call(msg) {
                self.introspect(conn, msg);
                return DispatchOutcome::Handled;
            }
            return DispatchOutcome::NotYetHandled;
        };

        let mut reply = match Reply::new(msg) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(path = %self.path, member = %member, error = %e, "Failed to allocate reply");
                return DispatchOutcome::Handled;
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.lock().process_call(msg, &mut reply)
        }));

        if let Some(response) = reply_for(msg, outcome, reply) {
            send_reply(conn, &self.path, response);
        }
        DispatchOutcome::Handled
    }
}

/// A server-side object with a method dispatch table.
pub struct ExportedObject {
    inner: Arc<ObjectInner>,
    connection: Mutex<Option<Arc<dyn BusConnection>>>,
    last_error: LastError,
}

impl ExportedObject {
    /// Create an object for `path` that is not yet registered anywhere.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                path: path.into(),
                interface: Mutex::new(None),
                methods: Mutex::new(HashMap::new()),
            }),
            connection: Mutex::new(None),
            last_error: LastError::default(),
        }
    }

    /// Create an object and register it on `conn` straight away.
    pub fn with_connection(path: impl Into<String>, conn: Arc<dyn BusConnection>) -> Result<Self> {
        let object = Self::new(path);
        object.enable(conn)?;
        Ok(object)
    }

    /// Get the object path.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Set the interface reported by introspection and used for signals.
    pub fn set_interface(&self, interface: impl Into<String>) {
        *self.inner.interface.lock() = Some(interface.into());
    }

    /// Get the interface name, if one was set.
    pub fn interface(&self) -> Option<String> {
        self.inner.interface.lock().clone()
    }

    /// Register the object path on `conn`.
    ///
    /// An object already enabled elsewhere is disabled first. If the
    /// connection refuses the path the object stays unregistered.
    pub fn enable(&self, conn: Arc<dyn BusConnection>) -> Result<()> {
        self.last_error.reset();
        let result = self.register(conn);
        self.last_error.track(result)
    }

    fn register(&self, conn: Arc<dyn BusConnection>) -> Result<()> {
        if !conn.is_connected() {
            return Err(Error::Disconnected);
        }
        self.disable();

        let handler: Arc<dyn ObjectPathHandler> = Arc::clone(&self.inner) as Arc<dyn ObjectPathHandler>;
        conn.register_object_path(&self.inner.path, handler)?;
        info!(path = %self.inner.path, "Exported object");
        *self.connection.lock() = Some(conn);
        Ok(())
    }

    /// Unregister the object path. Does nothing if the object is not
    /// enabled.
    pub fn disable(&self) {
        let previous = self.connection.lock().take();
        if let Some(conn) = previous {
            if conn.unregister_object_path(&self.inner.path) {
                debug!(path = %self.inner.path, "Object unexported");
            }
        }
    }

    /// Check if the object is registered on a connection.
    pub fn is_enabled(&self) -> bool {
        self.connection.lock().is_some()
    }

    /// Install `handler` for `name`, dropping any handler it replaces.
    pub fn export_method<H>(&self, name: &str, handler: H) -> Result<()>
    where
        H: MethodHandler + 'static,
    {
        if name.is_empty() {
            return Err(Error::InvalidName(name.to_string()));
        }
        let handler: SharedHandler = Arc::new(Mutex::new(Box::new(handler)));
        let replaced = self.inner.methods.lock().insert(name.to_string(), handler);
        if replaced.is_some() {
            debug!(path = %self.inner.path, method = %name, "Replaced method handler");
        }
        drop(replaced);
        Ok(())
    }

    /// Install a closure as the handler for `name`.
    pub fn export_fn<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: FnMut(&Message, &mut Reply) -> std::result::Result<(), HandlerError> + Send + 'static,
    {
        self.export_method(name, handler)
    }

    /// Remove the handler for `name`.
    pub fn unexport_method(&self, name: &str) -> bool {
        let removed = self.inner.methods.lock().remove(name);
        removed.is_some()
    }

    /// Check whether `name` has a handler.
    pub fn has_method(&self, name: &str) -> bool {
        self.inner.methods.lock().contains_key(name)
    }

    /// Names of the exported methods.
    pub fn methods(&self) -> Vec<String> {
        self.inner.method_names()
    }

    /// Emit a signal from this object's path.
    pub fn emit_signal<B>(&self, member: &str, body: &B) -> Result<()>
    where
        B: serde::Serialize + Type,
    {
        self.last_error.reset();
        let result = self.build_and_send_signal(member, body);
        self.last_error.track(result)
    }

    fn build_and_send_signal<B>(&self, member: &str, body: &B) -> Result<()>
    where
        B: serde::Serialize + Type,
    {
        let conn = self.connection.lock().clone().ok_or(Error::Disconnected)?;
        let interface = self
            .interface()
            .ok_or_else(|| Error::InvalidName("signal emitted without an interface".to_string()))?;
        let signal = create_signal(&self.inner.path, &interface, member, body)?;
        conn.send(&signal)
    }

    /// The error recorded by the last failed operation.
    pub fn last_error(&self) -> Option<ErrorState> {
        self.last_error.get()
    }

    /// Get the dispatch handler the connection invokes for this object.
    ///
    /// Useful for driving dispatch without a connection pump.
    pub fn dispatcher(&self) -> Arc<dyn ObjectPathHandler> {
        Arc::clone(&self.inner) as Arc<dyn ObjectPathHandler>
    }
}

impl Drop for ExportedObject {
    fn drop(&mut self) {
        self.disable();
    }
}
