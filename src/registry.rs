//! Per-path handler registry shared by the connection backends.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use zbus::Message;

use crate::connection::{BusConnection, DispatchOutcome, ObjectPathHandler};
use crate::error::{Error, Result};
use crate::introspect::{describe, is_introspect_call};
use crate::message::{create_error, create_method_return, error_names, MessageExt};

/// Object path handlers registered on one connection.
#[derive(Default)]
pub struct PathRegistry {
    handlers: Mutex<HashMap<String, Arc<dyn ObjectPathHandler>>>,
}

impl PathRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler for `path`.
    pub fn register(&self, path: &str, handler: Arc<dyn ObjectPathHandler>) -> Result<()> {
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(path) {
            return Err(Error::RegistrationFailed {
                path: path.to_string(),
                reason: "Object path already registered".to_string(),
            });
        }
        handlers.insert(path.to_string(), handler);
        debug!(path = %path, "Registered object path");
        Ok(())
    }

    /// Remove the handler for `path`, returning whether one was registered.
    pub fn unregister(&self, path: &str) -> bool {
        let removed = self.handlers.lock().remove(path);
        if removed.is_some() {
            debug!(path = %path, "Unregistered object path");
        }
        removed.is_some()
    }

    /// Check whether `path` has a handler.
    pub fn contains(&self, path: &str) -> bool {
        self.handlers.lock().contains_key(path)
    }

    /// Names of registered paths one level below `path`, sorted.
    ///
    /// Registered descendants further down contribute their first segment.
    pub fn child_nodes(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };

        let handlers = self.handlers.lock();
        let children: BTreeSet<String> = handlers
            .keys()
            .filter_map(|registered| registered.strip_prefix(prefix.as_str()))
            .filter_map(|rest| rest.split('/').next())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();
        children.into_iter().collect()
    }

    /// Hand a message to the handler registered for its exact path.
    ///
    /// The registry lock is released before the handler runs, so handlers
    /// may register or unregister paths.
    pub fn dispatch(&self, conn: &dyn BusConnection, msg: &Message) -> DispatchOutcome {
        let Some(path) = msg.path_str() else {
            return DispatchOutcome::NotYetHandled;
        };
        let handler = self.handlers.lock().get(&path).cloned();
        match handler {
            Some(handler) => handler.handle_message(conn, msg),
            None => {
                trace!(path = %path, "No handler registered for path");
                DispatchOutcome::NotYetHandled
            }
        }
    }

    /// Remove every registration.
    pub fn clear(&self) {
        let drained: Vec<_> = self.handlers.lock().drain().collect();
        drop(drained);
    }
}

/// Dispatch an incoming call or signal, answering calls nobody handled
/// with `UnknownMethod` unless the caller asked for no reply.
///
/// A path with no handler of its own but with registered descendants still
/// answers `Introspect`, listing its children.
pub fn dispatch_incoming(registry: &PathRegistry, conn: &dyn BusConnection, msg: &Message) {
    if registry.dispatch(conn, msg) == DispatchOutcome::Handled {
        return;
    }
    if !msg.is_method_call() || msg.no_reply_expected() {
        return;
    }
    if is_introspect_call(msg) && introspect_parent(registry, conn, msg) {
        return;
    }

    let member = msg.member_str().unwrap_or_default();
    let signature = msg.body().signature().to_string();
    let interface = msg.interface_str().unwrap_or_default();
    let text = format!(
        "Method \"{}\" with signature \"{}\" on interface \"{}\" doesn't exist",
        member, signature, interface
    );

    match create_error(msg, error_names::UNKNOWN_METHOD, &text) {
        Ok(reply) => {
            if let Err(e) = conn.send(&reply) {
                warn!(member = %member, error = %e, "Failed to send UnknownMethod reply");
            }
        }
        Err(e) => warn!(member = %member, error = %e, "Failed to build UnknownMethod reply"),
    }
}

fn introspect_parent(registry: &PathRegistry, conn: &dyn BusConnection, msg: &Message) -> bool {
    let Some(path) = msg.path_str() else {
        return false;
    };
    let children = registry.child_nodes(&path);
    if children.is_empty() {
        return false;
    }

    match create_method_return(msg, &(describe(None, &[], &children),)) {
        Ok(reply) => {
            if let Err(e) = conn.send(&reply) {
                warn!(path = %path, error = %e, "Failed to send introspection reply");
            }
        }
        Err(e) => warn!(path = %path, error = %e, "Failed to build introspection reply"),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always(DispatchOutcome);

    impl ObjectPathHandler for Always {
        fn handle_message(&self, _conn: &dyn BusConnection, _msg: &Message) -> DispatchOutcome {
            self.0
        }
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = PathRegistry::new();
        registry
            .register("/a", Arc::new(Always(DispatchOutcome::Handled)))
            .unwrap();
        let err = registry
            .register("/a", Arc::new(Always(DispatchOutcome::Handled)))
            .unwrap_err();
        assert!(matches!(err, Error::RegistrationFailed { .. }));

        assert!(registry.unregister("/a"));
        assert!(!registry.unregister("/a"));
        registry
            .register("/a", Arc::new(Always(DispatchOutcome::Handled)))
            .unwrap();
    }

    #[test]
    fn test_child_nodes() {
        let registry = PathRegistry::new();
        for path in ["/org/a", "/org/a/b", "/org/a/c/d", "/org/b", "/other"] {
            registry
                .register(path, Arc::new(Always(DispatchOutcome::Handled)))
                .unwrap();
        }

        assert_eq!(registry.child_nodes("/org/a"), vec!["b", "c"]);
        assert_eq!(registry.child_nodes("/org"), vec!["a", "b"]);
        assert_eq!(registry.child_nodes("/"), vec!["org", "other"]);
        assert!(registry.child_nodes("/org/b").is_empty());
    }
}
