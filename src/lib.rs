//! kapsule-dbus-dispatch - typed dispatch on top of D-Bus connections.
//!
//! This crate maps incoming method calls on exported objects to handlers and
//! turns their results or failures into replies, issues outgoing calls
//! through proxies (blocking or with pending-call callbacks), and routes
//! signals to per-proxy handlers while keeping broker-side match rules in
//! step with the handler tables.
//!
//! Connections are reached through the [`BusConnection`] trait. Two
//! implementations ship with the crate: [`ZbusConnection`] for real buses and
//! [`LoopbackBus`] for in-process use and tests.

pub mod bus_connection;
pub mod connection;
pub mod error;
pub mod introspect;
pub mod loopback;
pub mod match_rules;
pub mod message;
pub mod object;
pub mod object_proxy;
pub mod pending;
pub mod proxy;
pub mod registry;
pub mod server_proxy;
pub mod shared;
pub mod signal_router;

pub use bus_connection::ZbusConnection;
pub use connection::{BusConnection, DispatchOutcome, ObjectPathHandler, Timeout};
pub use error::{Error, ErrorState, HandlerError, Result};
pub use loopback::{LoopbackBus, LoopbackConnection};
pub use message::{MessageExt, Reply};
pub use object::{ExportedObject, MethodHandler};
pub use object_proxy::ObjectProxy;
pub use pending::PendingCall;
pub use proxy::{MethodCallback, OutgoingCall};
pub use server_proxy::{CompletionFunctor, ServerProxy};
pub use signal_router::{SignalFunctor, SignalHandler, WILDCARD};
