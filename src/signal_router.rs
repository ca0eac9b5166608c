//! Per-proxy signal routing.
//!
//! A [`SignalRouter`] maps signal names to handlers for one object path.
//! The empty name is a wildcard that catches any signal without an exact
//! entry. Adding the first handler for a name installs a broker-side match
//! rule; removing it tears the rule down again, so the broker only sends
//! what some handler wants.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};
use zbus::Message;

use crate::connection::{BusConnection, DispatchOutcome, ObjectPathHandler};
use crate::error::{Error, HandlerError, Result};
use crate::match_rules::signal_match_rule;
use crate::message::MessageExt;

/// Table key that matches any signal without its own entry.
pub const WILDCARD: &str = "";

/// Owned signal handler.
///
/// Implemented for any `FnMut(&Message) -> Result<(), HandlerError> + Send`.
pub trait SignalHandler: Send {
    /// Handle one signal.
    fn handle_signal(&mut self, signal: &Message) -> std::result::Result<(), HandlerError>;
}

impl<F> SignalHandler for F
where
    F: FnMut(&Message) -> std::result::Result<(), HandlerError> + Send,
{
    fn handle_signal(&mut self, signal: &Message) -> std::result::Result<(), HandlerError> {
        self(signal)
    }
}

/// Something a [`SignalRouter`] can store and invoke.
pub trait SignalSlot: Send {
    /// Deliver a signal to the slot.
    fn invoke(&mut self, signal: &Message) -> std::result::Result<(), HandlerError>;
}

impl SignalSlot for Box<dyn SignalHandler> {
    fn invoke(&mut self, signal: &Message) -> std::result::Result<(), HandlerError> {
        self.handle_signal(signal)
    }
}

/// Opaque context passed to raw functors.
pub type FunctorContext = Box<dyn Any + Send>;

/// A raw signal functor: a function pointer, its context and an optional
/// destroy function.
///
/// The destroy function receives the context exactly once, when the functor
/// is replaced, removed or drained.
pub struct SignalFunctor {
    context: Option<FunctorContext>,
    call: fn(&mut (dyn Any + Send), &Message),
    destroy: Option<fn(FunctorContext)>,
}

impl SignalFunctor {
    /// Create a functor from its parts.
    pub fn new(
        context: FunctorContext,
        call: fn(&mut (dyn Any + Send), &Message),
        destroy: Option<fn(FunctorContext)>,
    ) -> Self {
        Self {
            context: Some(context),
            call,
            destroy,
        }
    }
}

impl SignalSlot for SignalFunctor {
    fn invoke(&mut self, signal: &Message) -> std::result::Result<(), HandlerError> {
        let call = self.call;
        if let Some(context) = self.context.as_deref_mut() {
            call(context, signal);
        }
        Ok(())
    }
}

impl Drop for SignalFunctor {
    fn drop(&mut self) {
        if let (Some(context), Some(destroy)) = (self.context.take(), self.destroy) {
            destroy(context);
        }
    }
}

/// Turn the broker-side match rule for `name` on `path` on or off.
///
/// Private connections already receive everything their peer sends, so
/// nothing is done for them.
pub fn set_watch_signal(conn: &dyn BusConnection, path: &str, name: &str, enable: bool) -> Result<()> {
    if conn.is_private() {
        return Ok(());
    }

    let rule = signal_match_rule(path, name);
    let result = if enable {
        conn.add_match(&rule)
    } else {
        conn.remove_match(&rule)
    };

    result.map_err(|e| match e {
        e @ Error::FilterSyncFailed { .. } => e,
        other => Error::FilterSyncFailed {
            name: other.name().to_string(),
            message: other.message(),
        },
    })
}

/// Signal table for one object path, generic over the handler shape.
pub struct SignalRouter<S> {
    path: String,
    slots: Mutex<HashMap<String, Arc<Mutex<S>>>>,
}

impl<S: SignalSlot> SignalRouter<S> {
    /// Create an empty router for `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get the object path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Install `slot` for `name`.
    ///
    /// Replacing an existing entry drops the old slot and leaves the match
    /// rule alone. A new entry first installs the match rule; if that fails
    /// the slot is dropped and the table is unchanged.
    pub fn enable(&self, conn: &dyn BusConnection, name: &str, slot: S) -> Result<()> {
        let slot = Arc::new(Mutex::new(slot));
        {
            let mut slots = self.slots.lock();
            if let Some(existing) = slots.get_mut(name) {
                let previous = std::mem::replace(existing, slot);
                drop(slots);
                drop(previous);
                debug!(path = %self.path, signal = %name, "Replaced signal handler");
                return Ok(());
            }
        }

        set_watch_signal(conn, &self.path, name, true)?;

        let previous = self.slots.lock().insert(name.to_string(), slot);
        if previous.is_some() {
            // Another thread installed the same name meanwhile; keep one rule
            drop(previous);
            if let Err(e) = set_watch_signal(conn, &self.path, name, false) {
                warn!(path = %self.path, signal = %name, error = %e, "Failed to drop duplicate match rule");
            }
        }
        debug!(path = %self.path, signal = %name, "Enabled signal handler");
        Ok(())
    }

    /// Remove the entry for `name` and its match rule.
    ///
    /// Unknown names are ignored. The entry is gone even if removing the
    /// match rule fails.
    pub fn remove(&self, conn: &dyn BusConnection, name: &str) -> Result<()> {
        let removed = self.slots.lock().remove(name);
        match removed {
            Some(slot) => {
                drop(slot);
                debug!(path = %self.path, signal = %name, "Removed signal handler");
                set_watch_signal(conn, &self.path, name, false)
            }
            None => Ok(()),
        }
    }

    /// Remove every entry, logging match rule failures.
    pub fn drain(&self, conn: &dyn BusConnection) {
        let names: Vec<String> = self.slots.lock().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.remove(conn, &name) {
                warn!(path = %self.path, signal = %name, error = %e, "Failed to remove match rule");
            }
        }
    }

    /// Check whether `name` has an entry.
    pub fn contains(&self, name: &str) -> bool {
        self.slots.lock().contains_key(name)
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Deliver a signal to the exact entry for its member, falling back to
    /// the wildcard.
    ///
    /// Handler failures and panics are logged and reported as handled.
    pub fn route(&self, msg: &Message) -> DispatchOutcome {
        if !msg.is_signal() || msg.path_str().as_deref() != Some(self.path.as_str()) {
            return DispatchOutcome::NotYetHandled;
        }

        let member = msg.member_str().unwrap_or_default();
        let slot = {
            let slots = self.slots.lock();
            slots.get(&member).or_else(|| slots.get(WILDCARD)).cloned()
        };
        let Some(slot) = slot else {
            return DispatchOutcome::NotYetHandled;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| slot.lock().invoke(msg)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(path = %self.path, signal = %member, error = %e, "Signal handler failed"),
            Err(_) => error!(path = %self.path, signal = %member, "Signal handler panicked"),
        }
        DispatchOutcome::Handled
    }
}

impl<S: SignalSlot + 'static> ObjectPathHandler for SignalRouter<S> {
    fn handle_message(&self, _conn: &dyn BusConnection, msg: &Message) -> DispatchOutcome {
        self.route(msg)
    }
}
