//! Proxy with raw functor callbacks.
//!
//! [`ServerProxy`] is the low-level sibling of
//! [`crate::object_proxy::ObjectProxy`]: signal handlers and completion
//! callbacks are plain function pointers paired with an opaque context and an
//! optional destroy function, for callers that manage their own state.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;
use zbus::zvariant::Type;
use zbus::Message;

use crate::connection::{BusConnection, ObjectPathHandler, Timeout};
use crate::error::{Error, ErrorState, Result};
use crate::pending::PendingCall;
use crate::proxy::{OutgoingCall, ProxyCore};
use crate::signal_router::{FunctorContext, SignalFunctor, SignalRouter};

/// Completion callback made of a function pointer, its context and an
/// optional destroy function.
///
/// The destroy function receives the context exactly once: after `notify`
/// ran, or when the call is abandoned without completing.
pub struct CompletionFunctor {
    context: Option<FunctorContext>,
    notify: fn(&mut (dyn Any + Send), Result<Message>),
    destroy: Option<fn(FunctorContext)>,
}

impl CompletionFunctor {
    /// Create a completion functor from its parts.
    pub fn new(
        context: FunctorContext,
        notify: fn(&mut (dyn Any + Send), Result<Message>),
        destroy: Option<fn(FunctorContext)>,
    ) -> Self {
        Self {
            context: Some(context),
            notify,
            destroy,
        }
    }

    fn complete(mut self, reply: Result<Message>) {
        let notify = self.notify;
        if let Some(context) = self.context.as_deref_mut() {
            notify(context, reply);
        }
    }
}

impl Drop for CompletionFunctor {
    fn drop(&mut self) {
        if let (Some(context), Some(destroy)) = (self.context.take(), self.destroy) {
            destroy(context);
        }
    }
}

/// Proxy for one remote object using raw functors.
pub struct ServerProxy {
    core: ProxyCore,
    signals: Arc<SignalRouter<SignalFunctor>>,
}

impl ServerProxy {
    /// Create a proxy for `path` on `conn`, optionally bound to
    /// `destination`.
    pub fn new(conn: Arc<dyn BusConnection>, path: &str, destination: Option<&str>) -> Result<Self> {
        if !conn.is_connected() {
            return Err(Error::Disconnected);
        }
        let signals = Arc::new(SignalRouter::new(path));
        conn.register_object_path(path, Arc::clone(&signals) as Arc<dyn ObjectPathHandler>)?;
        debug!(path = %path, destination = ?destination, "Created server proxy");

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

    /// Send `call` and hand its outcome to `functor`.
    ///
    /// Error replies arrive as [`Error::RemoteFault`]. If the call cannot be
    /// submitted the functor is destroyed without being notified.
    pub fn execute_async(&self, call: &Message, functor: CompletionFunctor) -> Result<PendingCall> {
        self.core
            .execute_async(Ok(call.clone()), move |reply: Result<Message>| functor.complete(reply))
    }

    /// Route signals named `name` to `functor`; the empty name is the
    /// wildcard.
    pub fn enable_signal(&self, name: &str, functor: SignalFunctor) -> Result<()> {
        let last_error = self.core.error_state();
        last_error.reset();
        let result = self
            .signals
            .enable(self.core.connection().as_ref(), name, functor);
        last_error.track(result)
    }

    /// Build and install a signal functor in one step.
    pub fn add_signal_functor(
        &self,
        name: &str,
        context: FunctorContext,
        call: fn(&mut (dyn Any + Send), &Message),
        destroy: Option<fn(FunctorContext)>,
    ) -> Result<()> {
        self.enable_signal(name, SignalFunctor::new(context, call, destroy))
    }

    /// Remove the functor for `name`, destroying its context.
    pub fn remove_signal_handler(&self, name: &str) -> Result<()> {
        let last_error = self.core.error_state();
        last_error.reset();
        let result = self.signals.remove(self.core.connection().as_ref(), name);
        last_error.track(result)
    }

    /// Check whether `name` has a signal functor.
    pub fn has_signal_handler(&self, name: &str) -> bool {
        self.signals.contains(name)
    }
}

impl Drop for ServerProxy {
    fn drop(&mut self) {
        let conn = self.core.connection();
        conn.unregister_object_path(self.core.path());
        self.signals.drain(conn.as_ref());
    }
}
