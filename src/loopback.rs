//! In-process message bus.
//!
//! [`LoopbackBus`] brokers messages between [`LoopbackConnection`]s living
//! in the same process. It assigns `:loop.N` unique names, resolves
//! well-known names, routes replies back to the caller and delivers signals
//! according to each connection's match rules. Delivery is synchronous on
//! the sending thread unless the receiving connection is paused, in which
//! case messages queue until [`LoopbackConnection::dispatch_pending`].
//!
//! Each connection dispatches one message at a time. A message that arrives
//! while the connection is already dispatching, including one sent by a
//! handler running on it, waits in the queue until the running dispatch
//! gets to it. A handler blocking on a reply routed through its own
//! connection therefore times out, as it would behind a real bus pump.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use zbus::Message;

use crate::connection::{BusConnection, ObjectPathHandler, Timeout};
use crate::error::{Error, Result};
use crate::match_rules::{MatchRule, MatchRuleSet};
use crate::message::{create_error, error_names, MessageExt};
use crate::pending::{PendingCall, PendingTable};
use crate::registry::{dispatch_incoming, PathRegistry};

/// Broker state shared by every connection on the bus.
#[derive(Default)]
struct BusInner {
    /// Connected peers by unique name.
    peers: Mutex<HashMap<String, Weak<LoopbackConnection>>>,
    /// Well-known name to unique name.
    names: Mutex<HashMap<String, String>>,
    /// Call serial to the unique name of the caller awaiting the reply.
    routes: Mutex<HashMap<u32, String>>,
    /// Counter for unique names.
    next_id: AtomicU64,
}

impl BusInner {
    fn peer(&self, name: &str) -> Option<Arc<LoopbackConnection>> {
        let unique = if name.starts_with(':') {
            name.to_string()
        } else {
            self.names.lock().get(name)?.clone()
        };
        self.peers
            .lock()
            .get(&unique)
            .and_then(Weak::upgrade)
            .filter(|peer| peer.is_connected())
    }

    fn route(&self, sender: &LoopbackConnection, msg: &Message) -> Result<()> {
        if msg.is_method_call() {
            self.route_call(sender, msg)
        } else if msg.is_method_return() || msg.is_error() {
            self.route_reply(msg);
            Ok(())
        } else {
            self.route_signal(msg);
            Ok(())
        }
    }

    fn route_call(&self, sender: &LoopbackConnection, msg: &Message) -> Result<()> {
        let target = msg.destination_str().and_then(|dest| self.peer(&dest));
        let Some(target) = target else {
            let destination = msg.destination_str();
            debug!(destination = ?destination, "No owner for call destination");
            if !msg.no_reply_expected() {
                let (name, text) = match destination {
                    Some(dest) => (
                        error_names::SERVICE_UNKNOWN,
                        format!("The name {} was not provided by any .service files", dest),
                    ),
                    None => (
                        error_names::UNKNOWN_METHOD,
                        "The loopback bus has no driver object".to_string(),
                    ),
                };
                sender.deliver(create_error(msg, name, &text)?);
            }
            return Ok(());
        };

        if !msg.no_reply_expected() {
            self.routes
                .lock()
                .insert(msg.serial(), sender.unique_name.clone());
        }
        target.deliver(msg.clone());
        Ok(())
    }

    fn route_reply(&self, msg: &Message) {
        let Some(reply_serial) = msg.reply_serial() else {
            return;
        };
        let caller = self.routes.lock().remove(&reply_serial);
        match caller.and_then(|name| self.peer(&name)) {
            Some(caller) => caller.deliver(msg.clone()),
            None => trace!(reply_serial = reply_serial, "Dropping reply with no waiting caller"),
        }
    }

    fn route_signal(&self, msg: &Message) {
        if let Some(dest) = msg.destination_str() {
            if let Some(peer) = self.peer(&dest) {
                peer.deliver(msg.clone());
            }
            return;
        }

        let peers: Vec<Arc<LoopbackConnection>> = self
            .peers
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for peer in peers {
            if peer.private || peer.rules.lock().matches(msg) {
                peer.deliver(msg.clone());
            }
        }
    }

    fn drop_route(&self, serial: u32, caller: &str) {
        let mut routes = self.routes.lock();
        if routes.get(&serial).map(String::as_str) == Some(caller) {
            routes.remove(&serial);
            trace!(serial = serial, caller = %caller, "Dropped reply route");
        }
    }

    fn forget(&self, unique_name: &str) {
        self.peers.lock().remove(unique_name);
        self.names.lock().retain(|_, owner| owner != unique_name);
        self.routes.lock().retain(|_, caller| caller != unique_name);
    }
}

/// An in-process message bus.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    inner: Arc<BusInner>,
}

impl LoopbackBus {
    /// Create a new, empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new client to the bus.
    pub fn connect(&self) -> Arc<LoopbackConnection> {
        self.attach(false)
    }

    /// Connect a client flagged private.
    ///
    /// Private connections see every signal on the bus without registering
    /// match rules, like a peer-to-peer link.
    pub fn connect_private(&self) -> Arc<LoopbackConnection> {
        self.attach(true)
    }

    fn attach(&self, private: bool) -> Arc<LoopbackConnection> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let unique_name = format!(":loop.{}", id);

        let routes = Arc::downgrade(&self.inner);
        let caller = unique_name.clone();
        let pending = PendingTable::with_cancel_hook(move |serial| {
            if let Some(bus) = routes.upgrade() {
                bus.drop_route(serial, &caller);
            }
        });

        let conn = Arc::new(LoopbackConnection {
            unique_name: unique_name.clone(),
            private,
            bus: Arc::downgrade(&self.inner),
            registry: PathRegistry::new(),
            pending,
            rules: Mutex::new(MatchRuleSet::new()),
            connected: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            dispatching: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
        });
        self.inner
            .peers
            .lock()
            .insert(unique_name.clone(), Arc::downgrade(&conn));
        info!(unique_name = %unique_name, private = private, "Loopback client connected");
        conn
    }

    /// Get the number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.inner
            .peers
            .lock()
            .values()
            .filter(|peer| peer.strong_count() > 0)
            .count()
    }
}

/// One client connection on a [`LoopbackBus`].
pub struct LoopbackConnection {
    unique_name: String,
    private: bool,
    bus: Weak<BusInner>,
    registry: PathRegistry,
    pending: PendingTable,
    rules: Mutex<MatchRuleSet>,
    connected: AtomicBool,
    paused: AtomicBool,
    /// Set while some thread is draining the queue.
    dispatching: AtomicBool,
    queue: Mutex<VecDeque<Message>>,
}

impl LoopbackConnection {
    fn bus(&self) -> Result<Arc<BusInner>> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        self.bus.upgrade().ok_or(Error::Disconnected)
    }

    /// Claim a well-known name for this connection.
    pub fn request_name(&self, name: &str) -> Result<()> {
        let bus = self.bus()?;
        let mut names = bus.names.lock();
        match names.get(name) {
            Some(owner) if *owner != self.unique_name => Err(Error::RemoteFault {
                name: error_names::NAME_IN_USE.to_string(),
                message: format!("Name {} is owned by {}", name, owner),
            }),
            _ => {
                names.insert(name.to_string(), self.unique_name.clone());
                debug!(name = %name, owner = %self.unique_name, "Name acquired");
                Ok(())
            }
        }
    }

    /// Queue incoming messages instead of dispatching them.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume dispatching and drain anything queued while paused.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.dispatch_pending();
    }

    /// Check if dispatch is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Dispatch every queued message and expire overdue pending calls.
    ///
    /// Returns the number of messages dispatched. Called from a handler
    /// running on this connection, it only expires calls; the running
    /// dispatch drains the queue once the handler returns.
    pub fn dispatch_pending(&self) -> usize {
        let count = self.drain(true);

        let expired = self.pending.take_expired();
        for completion in expired {
            trace!(serial = completion.serial(), "Pending call timed out");
            completion.finish(Err(Error::no_reply_timeout()));
        }
        count
    }

    /// Get the number of messages waiting for dispatch.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Get the number of registered match rules.
    pub fn match_rule_count(&self) -> usize {
        self.rules.lock().len()
    }

    /// Close the connection.
    ///
    /// Outstanding calls fail with a disconnection error and registered
    /// paths are dropped.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.forget(&self.unique_name);
        }

        let outstanding = self.pending.take_all();
        for completion in outstanding {
            completion.finish(Err(Error::no_reply_disconnected()));
        }
        self.queue.lock().clear();
        self.registry.clear();
        info!(unique_name = %self.unique_name, "Loopback client disconnected");
    }

    fn deliver(&self, msg: Message) {
        if !self.is_connected() {
            trace!(unique_name = %self.unique_name, "Dropping message for closed connection");
            return;
        }
        self.queue.lock().push_back(msg);
        if !self.is_paused() {
            self.drain(false);
        }
    }

    /// Process queued messages unless another dispatch is already running,
    /// in which case that dispatch picks them up.
    ///
    /// Without `force`, draining stops as soon as the connection is paused.
    fn drain(&self, force: bool) -> usize {
        let mut count = 0;
        loop {
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                trace!(unique_name = %self.unique_name, "Dispatch already running; message queued");
                return count;
            }

            loop {
                if !force && self.is_paused() {
                    break;
                }
                let next = self.queue.lock().pop_front();
                let Some(msg) = next else {
                    break;
                };
                self.process(&msg);
                count += 1;
            }
            self.dispatching.store(false, Ordering::SeqCst);

            // Re-check for messages queued after the last pop
            if (!force && self.is_paused()) || self.queue.lock().is_empty() {
                return count;
            }
        }
    }

    fn process(&self, msg: &Message) {
        if msg.is_method_return() || msg.is_error() {
            let completion = msg
                .reply_serial()
                .and_then(|serial| self.pending.take(serial));
            match completion {
                Some(completion) => completion.finish(Ok(msg.clone())),
                None => trace!(reply_serial = ?msg.reply_serial(), "Unexpected reply"),
            }
            return;
        }
        dispatch_incoming(&self.registry, self, msg);
    }
}

impl BusConnection for LoopbackConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_private(&self) -> bool {
        self.private
    }

    fn unique_name(&self) -> Option<String> {
        Some(self.unique_name.clone())
    }

    fn send(&self, msg: &Message) -> Result<()> {
        let bus = self.bus()?;
        bus.route(self, msg)
    }

    fn send_with_reply(&self, msg: &Message, timeout: Timeout) -> Result<Option<PendingCall>> {
        let Ok(bus) = self.bus() else {
            return Ok(None);
        };
        let serial = msg.serial();
        let pending = self.pending.insert(serial, timeout);
        if let Err(e) = bus.route(self, msg) {
            self.pending.take(serial);
            return Err(e);
        }
        Ok(Some(pending))
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
        self.bus()?;
        let parsed = MatchRule::parse(rule).map_err(|e| Error::FilterSyncFailed {
            name: error_names::MATCH_RULE_INVALID.to_string(),
            message: e.to_string(),
        })?;
        self.rules.lock().add(parsed);
        debug!(unique_name = %self.unique_name, rule = %rule, "Match rule added");
        Ok(())
    }

    fn remove_match(&self, rule: &str) -> Result<()> {
        self.bus()?;
        if !self.rules.lock().remove(rule) {
            warn!(unique_name = %self.unique_name, rule = %rule, "Removing unknown match rule");
            return Err(Error::FilterSyncFailed {
                name: error_names::MATCH_RULE_NOT_FOUND.to_string(),
                message: "The given match rule wasn't found and can't be removed".to_string(),
            });
        }
        debug!(unique_name = %self.unique_name, rule = %rule, "Match rule removed");
        Ok(())
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
