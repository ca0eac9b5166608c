//! Shared default bus connections.
//!
//! Most programs want one session and one system bus connection for the
//! whole process. [`SharedConnections`] creates each lazily, hands out
//! clones, and tears everything down once on [`SharedConnections::shutdown`],
//! running registered hooks first in reverse registration order.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::bus_connection::ZbusConnection;
use crate::error::{Error, Result};

/// Which default bus a shared connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    /// The per-user session bus.
    Session,
    /// The system-wide bus.
    System,
}

/// Hook run when shared connections are shut down.
pub type ShutdownHook = Box<dyn FnOnce() + Send>;

struct SharedState<C: ?Sized> {
    connections: HashMap<BusKind, Arc<C>>,
    hooks: Vec<ShutdownHook>,
    shut_down: bool,
}

/// Lazily created connections plus a shutdown hook registry.
pub struct SharedConnections<C: ?Sized> {
    state: Mutex<SharedState<C>>,
}

impl<C: ?Sized> Default for SharedConnections<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized> SharedConnections<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SharedState {
                connections: HashMap::new(),
                hooks: Vec::new(),
                shut_down: false,
            }),
        }
    }

    /// Get the connection for `kind`, creating it with `init` on first use.
    ///
    /// Fails with [`Error::Disconnected`] after shutdown.
    pub fn get_or_init<F>(&self, kind: BusKind, init: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> Result<Arc<C>>,
    {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(Error::Disconnected);
        }
        if let Some(conn) = state.connections.get(&kind) {
            return Ok(Arc::clone(conn));
        }

        let conn = init()?;
        state.connections.insert(kind, Arc::clone(&conn));
        debug!(kind = ?kind, "Shared connection created");
        Ok(conn)
    }

    /// Register a hook to run at shutdown.
    pub fn on_shutdown<F>(&self, hook: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(Error::Disconnected);
        }
        state.hooks.push(Box::new(hook));
        Ok(())
    }

    /// Run the shutdown hooks, newest first, then release the connections.
    ///
    /// Only the first call does anything; it returns `true`.
    pub fn shutdown(&self) -> bool {
        let (hooks, connections) = {
            let mut state = self.state.lock();
            if state.shut_down {
                return false;
            }
            state.shut_down = true;
            (
                std::mem::take(&mut state.hooks),
                std::mem::take(&mut state.connections),
            )
        };

        for hook in hooks.into_iter().rev() {
            if panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
                error!("Shutdown hook panicked");
            }
        }
        drop(connections);
        info!("Shared connections shut down");
        true
    }

    /// Check if [`SharedConnections::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }
}

fn process_wide() -> &'static SharedConnections<ZbusConnection> {
    static SHARED: OnceLock<SharedConnections<ZbusConnection>> = OnceLock::new();
    SHARED.get_or_init(SharedConnections::new)
}

/// The process-wide session bus connection.
pub fn session_bus() -> Result<Arc<ZbusConnection>> {
    process_wide().get_or_init(BusKind::Session, || Ok(Arc::new(ZbusConnection::session(None)?)))
}

/// The process-wide system bus connection.
pub fn system_bus() -> Result<Arc<ZbusConnection>> {
    process_wide().get_or_init(BusKind::System, || Ok(Arc::new(ZbusConnection::system()?)))
}

/// Register a hook to run before the process-wide connections close.
pub fn on_shutdown<F>(hook: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    process_wide().on_shutdown(hook)
}

/// Close the process-wide connections.
pub fn shutdown() -> bool {
    process_wide().shutdown()
}
