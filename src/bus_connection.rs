//! D-Bus connection backend using zbus.
//!
//! [`ZbusConnection`] owns a small tokio runtime. A pump task reads the
//! connection's message stream: replies complete pending calls, method calls
//! and signals go to the registered object path handlers. A writer task
//! sends queued outbound messages in order. Handlers therefore run on the
//! pump, one message at a time.
//!
//! Everything the pump does that can reach user code (handlers, completion
//! callbacks, expiry) runs inside [`tokio::task::block_in_place`], so that
//! code may block and make broker round trips. Connections must be created
//! outside any tokio runtime.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use zbus::connection::Builder as ConnectionBuilder;
use zbus::{Connection, Message, MessageStream};

use crate::connection::{BusConnection, ObjectPathHandler, Timeout};
use crate::error::{Error, Result};
use crate::message::{error_names, MessageExt};
use crate::pending::{PendingCall, PendingTable};
use crate::registry::{dispatch_incoming, PathRegistry};

/// How often overdue pending calls are expired.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

const DBUS_DRIVER_NAME: &str = "org.freedesktop.DBus";
const DBUS_DRIVER_PATH: &str = "/org/freedesktop/DBus";

/// State shared between the public handle and the runtime's tasks.
struct ZbusInner {
    connection: Connection,
    handle: Handle,
    outbound: mpsc::UnboundedSender<Message>,
    registry: PathRegistry,
    pending: PendingTable,
    connected: AtomicBool,
    private: bool,
    name: String,
}

impl ZbusInner {
    fn process(&self, msg: &Message) {
        if msg.is_method_return() || msg.is_error() {
            let completion = msg
                .reply_serial()
                .and_then(|serial| self.pending.take(serial));
            if let Some(completion) = completion {
                completion.finish(Ok(msg.clone()));
            }
            return;
        }
        dispatch_incoming(&self.registry, self, msg);
    }

    fn expire(&self) {
        let expired = self.pending.take_expired();
        for completion in expired {
            debug!(bus = %self.name, serial = completion.serial(), "Pending call timed out");
            completion.finish(Err(Error::no_reply_timeout()));
        }
    }

    fn mark_disconnected(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let outstanding = self.pending.take_all();
        for completion in outstanding {
            completion.finish(Err(Error::no_reply_disconnected()));
        }
        info!(bus = %self.name, "D-Bus connection closed");
    }

    fn call_driver(&self, method: &str, rule: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        let connection = self.connection.clone();
        let result = self.handle.block_on(async move {
            connection
                .call_method(
                    Some(DBUS_DRIVER_NAME),
                    DBUS_DRIVER_PATH,
                    Some(DBUS_DRIVER_NAME),
                    method,
                    &(rule,),
                )
                .await
        });

        match result {
            Ok(_) => {
                trace!(bus = %self.name, method = %method, rule = %rule, "Match rule updated");
                Ok(())
            }
            Err(zbus::Error::MethodError(name, detail, _)) => Err(Error::FilterSyncFailed {
                name: name.to_string(),
                message: detail.unwrap_or_default(),
            }),
            Err(e) => Err(Error::FilterSyncFailed {
                name: error_names::FAILED.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

impl BusConnection for ZbusInner {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_private(&self) -> bool {
        self.private
    }

    fn unique_name(&self) -> Option<String> {
        self.connection.unique_name().map(|n| n.to_string())
    }

    fn send(&self, msg: &Message) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        self.outbound
            .send(msg.clone())
            .map_err(|_| Error::Disconnected)
    }

    fn send_with_reply(&self, msg: &Message, timeout: Timeout) -> Result<Option<PendingCall>> {
        if !self.is_connected() {
            return Ok(None);
        }
        let serial = msg.serial();
        let pending = self.pending.insert(serial, timeout);
        if self.outbound.send(msg.clone()).is_err() {
            self.pending.take(serial);
            return Ok(None);
        }
        Ok(Some(pending))
    }

    fn register_object_path(&self, path: &str, handler: Arc<dyn ObjectPathHandler>) -> Result<()> {
        self.registry.register(path, handler)
    }

    fn unregister_object_path(&self, path: &str) -> bool {
        self.registry.unregister(path)
    }

    fn child_nodes(&self, path: &str) -> Vec<String> {
        self.registry.child_nodes(path)
    }

    fn add_match(&self, rule: &str) -> Result<()> {
        self.call_driver("AddMatch", rule)
    }

    fn remove_match(&self, rule: &str) -> Result<()> {
        self.call_driver("RemoveMatch", rule)
    }
}

/// Read incoming messages until the connection closes.
async fn pump(inner: Arc<ZbusInner>, mut stream: MessageStream) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(msg)) => {
                    trace!(
                        bus = %inner.name,
                        serial = msg.serial(),
                        member = ?msg.member_str(),
                        "Received message"
                    );
                    // Handlers may block on broker round trips
                    tokio::task::block_in_place(|| inner.process(&msg));
                }
                Some(Err(e)) => {
                    error!(bus = %inner.name, error = %e, "Error receiving message");
                }
                None => break,
            },
            _ = sweep.tick() => tokio::task::block_in_place(|| inner.expire()),
        }
    }
    tokio::task::block_in_place(|| inner.mark_disconnected());
}

/// Send queued messages in order.
async fn writer(connection: Connection, mut outbound: mpsc::UnboundedReceiver<Message>, name: String) {
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = connection.send(&msg).await {
            warn!(bus = %name, serial = msg.serial(), error = %e, "Failed to send message");
        }
    }
    trace!(bus = %name, "Writer stopped");
}

fn new_runtime() -> Result<Runtime> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("dbus-dispatch")
        .enable_all()
        .build()?;
    Ok(runtime)
}

/// The connection owns a runtime and blocks on it, which tokio forbids
/// from inside another runtime.
fn ensure_outside_runtime() -> Result<()> {
    if Handle::try_current().is_ok() {
        return Err(Error::Config(
            "D-Bus connections must be opened outside a tokio runtime".to_string(),
        ));
    }
    Ok(())
}

/// A [`BusConnection`] backed by a zbus connection.
pub struct ZbusConnection {
    inner: Arc<ZbusInner>,
    runtime: Mutex<Option<Runtime>>,
}

impl ZbusConnection {
    /// Connect to the session bus.
    ///
    /// # Arguments
    /// * `address` - Optional override for the session bus address.
    ///   If None, uses DBUS_SESSION_BUS_ADDRESS env var.
    pub fn session(address: Option<&str>) -> Result<Self> {
        match address {
            Some(addr) => {
                info!(address = %addr, "Connecting to session bus at custom address");
                let addr = addr.to_string();
                Self::start("session", false, move || async move {
                    ConnectionBuilder::address(addr.as_str())?.build().await
                })
            }
            None => {
                info!("Connecting to default session bus");
                Self::start("session", false, Connection::session)
            }
        }
    }

    /// Connect to the system bus.
    pub fn system() -> Result<Self> {
        info!("Connecting to system bus");
        Self::start("system", false, Connection::system)
    }

    /// Connect to a message bus at the given address.
    ///
    /// # Arguments
    /// * `address` - The D-Bus address (e.g., "unix:path=/path/to/socket").
    pub fn connect(address: &str) -> Result<Self> {
        info!(address = %address, "Connecting to D-Bus");
        let addr = address.to_string();
        Self::start(address, false, move || async move {
            ConnectionBuilder::address(addr.as_str())?.build().await
        })
    }

    /// Open a peer-to-peer connection with no broker in between.
    pub fn connect_private(address: &str) -> Result<Self> {
        info!(address = %address, "Opening private D-Bus connection");
        let addr = address.to_string();
        Self::start(address, true, move || async move {
            ConnectionBuilder::address(addr.as_str())?.p2p().build().await
        })
    }

    /// Open both ends of a peer-to-peer connection over a Unix socket pair.
    ///
    /// The first connection acts as the server side of the handshake. Both
    /// are private and have no unique name.
    #[cfg(unix)]
    pub fn private_pair() -> Result<(Self, Self)> {
        ensure_outside_runtime()?;
        let (server_end, client_end) = std::os::unix::net::UnixStream::pair()?;
        server_end.set_nonblocking(true)?;
        client_end.set_nonblocking(true)?;

        let server_runtime = new_runtime()?;
        let client_runtime = new_runtime()?;
        let guid = zbus::Guid::generate();

        // The handshake needs both sides running at once
        let server = server_runtime.spawn(async move {
            let stream = tokio::net::UnixStream::from_std(server_end)?;
            ConnectionBuilder::unix_stream(stream)
                .server(guid)?
                .p2p()
                .build()
                .await
        });
        let client = client_runtime.block_on(async move {
            let stream = tokio::net::UnixStream::from_std(client_end)?;
            ConnectionBuilder::unix_stream(stream).p2p().build().await
        })?;
        let server = server_runtime
            .block_on(server)
            .map_err(|e| Error::Config(format!("Peer handshake task failed: {}", e)))??;

        info!("Opened private connection pair");
        Ok((
            Self::attach(server_runtime, "p2p-server", true, server),
            Self::attach(client_runtime, "p2p-client", true, client),
        ))
    }

    fn start<F, Fut>(name: &str, private: bool, connect: F) -> Result<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = zbus::Result<Connection>>,
    {
        ensure_outside_runtime()?;
        let runtime = new_runtime()?;
        let connection = runtime.block_on(connect())?;
        Ok(Self::attach(runtime, name, private, connection))
    }

    fn attach(runtime: Runtime, name: &str, private: bool, connection: Connection) -> Self {
        let stream = MessageStream::from(&connection);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ZbusInner {
            connection: connection.clone(),
            handle: runtime.handle().clone(),
            outbound,
            registry: PathRegistry::new(),
            pending: PendingTable::new(),
            connected: AtomicBool::new(true),
            private,
            name: name.to_string(),
        });

        runtime.spawn(pump(Arc::clone(&inner), stream));
        runtime.spawn(writer(connection, outbound_rx, name.to_string()));

        debug!(
            name = %name,
            unique_name = ?inner.unique_name(),
            private = private,
            "Connected to D-Bus"
        );

        Self {
            inner,
            runtime: Mutex::new(Some(runtime)),
        }
    }

    /// Get a reference to the underlying zbus connection.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Request a well-known name on the bus.
    pub fn request_name(&self, name: &str) -> Result<()> {
        if !self.inner.is_connected() {
            return Err(Error::Disconnected);
        }
        self.inner
            .handle
            .block_on(self.inner.connection.request_name(name))?;
        info!(name = %name, "Acquired bus name");
        Ok(())
    }

    /// Block until the process receives SIGINT.
    pub fn wait_for_interrupt(&self) -> Result<()> {
        self.inner.handle.block_on(tokio::signal::ctrl_c())?;
        info!("Received interrupt");
        Ok(())
    }

    /// Close the connection and stop its runtime.
    ///
    /// Outstanding calls fail with a disconnection error.
    pub fn close(&self) {
        self.inner.mark_disconnected();
        self.inner.registry.clear();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl BusConnection for ZbusConnection {
    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn is_private(&self) -> bool {
        self.inner.is_private()
    }

    fn unique_name(&self) -> Option<String> {
        self.inner.unique_name()
    }

    fn send(&self, msg: &Message) -> Result<()> {
        self.inner.send(msg)
    }

    fn send_with_reply(&self, msg: &Message, timeout: Timeout) -> Result<Option<PendingCall>> {
        self.inner.send_with_reply(msg, timeout)
    }

    fn register_object_path(&self, path: &str, handler: Arc<dyn ObjectPathHandler>) -> Result<()> {
        if !self.inner.is_connected() {
            return Err(Error::Disconnected);
        }
        self.inner.register_object_path(path, handler)
    }

    fn unregister_object_path(&self, path: &str) -> bool {
        self.inner.unregister_object_path(path)
    }

    fn child_nodes(&self, path: &str) -> Vec<String> {
        self.inner.child_nodes(path)
    }

    fn add_match(&self, rule: &str) -> Result<()> {
        self.inner.add_match(rule)
    }

    fn remove_match(&self, rule: &str) -> Result<()> {
        self.inner.remove_match(rule)
    }
}

impl Drop for ZbusConnection {
    fn drop(&mut self) {
        self.close();
    }
}
