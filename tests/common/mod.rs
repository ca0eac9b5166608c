//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use zbus::Message;

use kapsule_dbus_dispatch::connection::{BusConnection, ObjectPathHandler, Timeout};
use kapsule_dbus_dispatch::message::error_names;
use kapsule_dbus_dispatch::pending::PendingCall;
use kapsule_dbus_dispatch::registry::{dispatch_incoming, PathRegistry};
use kapsule_dbus_dispatch::{Error, Result};

/// Connection double that records everything sent through it and counts
/// match rule traffic. Incoming messages are injected with
/// [`RecordingConnection::inject`].
pub struct RecordingConnection {
    private: bool,
    connected: AtomicBool,
    registry: PathRegistry,
    pub sent: Mutex<Vec<Message>>,
    pub added_rules: Mutex<Vec<String>>,
    pub removed_rules: Mutex<Vec<String>>,
    pub add_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub fail_add: AtomicBool,
    pub fail_remove: AtomicBool,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Self::with_private(false)
    }

    pub fn private() -> Arc<Self> {
        Self::with_private(true)
    }

    fn with_private(private: bool) -> Arc<Self> {
        Arc::new(Self {
            private,
            connected: AtomicBool::new(true),
            registry: PathRegistry::new(),
            sent: Mutex::new(Vec::new()),
            added_rules: Mutex::new(Vec::new()),
            removed_rules: Mutex::new(Vec::new()),
            add_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            fail_add: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
        })
    }

    /// Deliver `msg` as if it arrived from the bus.
    pub fn inject(&self, msg: &Message) {
        dispatch_incoming(&self.registry, self, msg);
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn last_sent(&self) -> Option<Message> {
        self.sent.lock().last().cloned()
    }

    pub fn add_count(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    fn rule_failure() -> Error {
        Error::FilterSyncFailed {
            name: error_names::FAILED.to_string(),
            message: "match rule rejected".to_string(),
        }
    }
}

impl BusConnection for RecordingConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_private(&self) -> bool {
        self.private
    }

    fn unique_name(&self) -> Option<String> {
        Some(":test.1".to_string())
    }

    fn send(&self, msg: &Message) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        self.sent.lock().push(msg.clone());
        Ok(())
    }

    fn send_with_reply(&self, msg: &Message, _timeout: Timeout) -> Result<Option<PendingCall>> {
        if !self.is_connected() {
            return Ok(None);
        }
        self.sent.lock().push(msg.clone());
        Err(Error::AllocationFailed("recording connection tracks no replies".to_string()))
    }

    fn register_object_path(&self, path: &str, handler: Arc<dyn ObjectPathHandler>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        self.registry.register(path, handler)
    }

    fn unregister_object_path(&self, path: &str) -> bool {
        self.registry.unregister(path)
    }

    fn child_nodes(&self, path: &str) -> Vec<String> {
        self.registry.child_nodes(path)
    }

    fn add_match(&self, rule: &str) -> Result<()> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(Self::rule_failure());
        }
        self.added_rules.lock().push(rule.to_string());
        Ok(())
    }

    fn remove_match(&self, rule: &str) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(Self::rule_failure());
        }
        self.removed_rules.lock().push(rule.to_string());
        Ok(())
    }
}

/// Build a method call addressed to `path`.
pub fn method_call(path: &str, interface: &str, member: &str) -> Message {
    Message::method_call(path, member)
        .unwrap()
        .interface(interface)
        .unwrap()
        .build(&())
        .unwrap()
}

/// Build a signal emitted from `path`.
pub fn signal(path: &str, interface: &str, member: &str) -> Message {
    Message::signal(path, interface, member)
        .unwrap()
        .build(&())
        .unwrap()
}
