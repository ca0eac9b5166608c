//! Integration tests for call proxies.
//!
//! Blocking calls, asynchronous calls with completion callbacks, the raw
//! functor flavour on server proxies, and reply timeouts, all over the
//! loopback bus.

mod common;

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use zbus::Message;

use common::RecordingConnection;

use kapsule_dbus_dispatch::message::error_names;
use kapsule_dbus_dispatch::signal_router::FunctorContext;
use kapsule_dbus_dispatch::{
    CompletionFunctor, Error, ExportedObject, HandlerError, LoopbackBus,
    LoopbackConnection, MethodCallback, ObjectProxy, Result, ServerProxy, Timeout,
};

const SERVICE: &str = "org.example.Service";
const PATH: &str = "/org/example/Calculator";
const IFACE: &str = "org.example.Calculator";

/// Start a server exporting a small calculator object.
fn calculator(bus: &LoopbackBus) -> (Arc<LoopbackConnection>, ExportedObject) {
    let server = bus.connect();
    server.request_name(SERVICE).unwrap();

    let object = ExportedObject::new(PATH);
    object.set_interface(IFACE);
    object
        .export_fn("Double", |call, reply| {
            let n: i64 = call.body().deserialize()?;
            reply.set_body(&(n * 2,))
        })
        .unwrap();
    object
        .export_fn("Divide", |call, reply| {
            let (a, b): (i64, i64) = call.body().deserialize()?;
            if b == 0 {
                return Err(HandlerError::dbus("org.example.Error.DivideByZero", "b is zero"));
            }
            reply.set_body(&(a / b,))
        })
        .unwrap();
    object.enable(server.clone()).unwrap();
    (server, object)
}

fn proxy(bus: &LoopbackBus) -> ObjectProxy {
    let mut proxy = ObjectProxy::new(bus.connect(), PATH, Some(SERVICE)).unwrap();
    proxy.set_interface(Some(IFACE));
    proxy
}

// =============================================================================
// Blocking Call Tests
// =============================================================================

#[test]
fn test_blocking_call_returns_handler_value() {
    let bus = LoopbackBus::new();
    let (_server, _object) = calculator(&bus);
    let proxy = proxy(&bus);

    let call = proxy.create_call("Double", &(21i64,));
    let reply = proxy.process_in_args(call).unwrap();
    proxy.process_out_args(&reply).unwrap();
    assert_eq!(reply.body().deserialize::<i64>().unwrap(), 42);
}

#[test]
fn test_remote_fault_is_verbatim() {
    let bus = LoopbackBus::new();
    let (_server, _object) = calculator(&bus);
    let proxy = proxy(&bus);

    let err = proxy.call_method("Divide", &(1i64, 0i64)).unwrap_err();
    match err {
        Error::RemoteFault { ref name, ref message } => {
            assert_eq!(name, "org.example.Error.DivideByZero");
            assert_eq!(message, "b is zero");
        }
        other => panic!("unexpected {other:?}"),
    }

    let state = proxy.last_error().unwrap();
    assert_eq!(state.name, "org.example.Error.DivideByZero");
}

#[test]
fn test_last_error_resets_on_success() {
    let bus = LoopbackBus::new();
    let (_server, _object) = calculator(&bus);
    let proxy = proxy(&bus);

    assert!(proxy.call_method("Divide", &(1i64, 0i64)).is_err());
    assert!(proxy.last_error().is_some());
    proxy.call_method("Divide", &(4i64, 2i64)).unwrap();
    assert!(proxy.last_error().is_none());
}

#[test]
fn test_call_to_missing_service() {
    let bus = LoopbackBus::new();
    let proxy = proxy(&bus);

    let err = proxy.call_method("Double", &(1i64,)).unwrap_err();
    assert_eq!(err.name(), error_names::SERVICE_UNKNOWN);
}

#[test]
fn test_timeout_against_paused_server() {
    let bus = LoopbackBus::new();
    let (server, _object) = calculator(&bus);
    let mut proxy = proxy(&bus);
    proxy.set_timeout(Timeout::After(Duration::from_millis(50)));

    server.pause();
    let started = Instant::now();
    let err = proxy.call_method("Double", &(1i64,)).unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(matches!(err, Error::NoReply { .. }));
    assert_eq!(err.name(), error_names::NO_REPLY);
    assert_eq!(server.queued(), 1);

    // The late reply is discarded; the next call works normally
    server.resume();
    let reply = proxy.call_method("Double", &(2i64,)).unwrap();
    assert_eq!(reply.body().deserialize::<i64>().unwrap(), 4);
}

#[test]
fn test_reentrant_call_times_out_instead_of_hanging() {
    let bus = LoopbackBus::new();
    let server = bus.connect();
    server.request_name(SERVICE).unwrap();

    let mut nested = ObjectProxy::new(bus.connect(), PATH, Some(SERVICE)).unwrap();
    nested.set_interface(Some(IFACE));
    nested.set_timeout(Timeout::After(Duration::from_millis(200)));

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let object = ExportedObject::new(PATH);
    object.set_interface(IFACE);
    object
        .export_fn("Nest", move |call, reply| {
            counter.fetch_add(1, Ordering::SeqCst);
            let depth: u32 = call.body().deserialize()?;
            let outcome = if depth == 0 {
                "leaf".to_string()
            } else {
                match nested.call_method("Nest", &(depth - 1,)) {
                    Ok(_) => "answered".to_string(),
                    Err(e) => e.name().to_string(),
                }
            };
            reply.set_body(&(outcome,))
        })
        .unwrap();
    object.enable(server.clone()).unwrap();

    let proxy = proxy(&bus);
    let started = Instant::now();
    let reply = proxy.call_method("Nest", &(1u32,)).unwrap();
    let elapsed = started.elapsed();

    // The nested call waits behind the running handler, like a busy pump
    assert_eq!(reply.body().deserialize::<String>().unwrap(), error_names::NO_REPLY);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(5));

    // The queued nested call still ran once the outer handler returned
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(server.queued(), 0);

    let reply = proxy.call_method("Nest", &(0u32,)).unwrap();
    assert_eq!(reply.body().deserialize::<String>().unwrap(), "leaf");
}

#[test]
fn test_refused_submission_maps_the_same_on_both_paths() {
    let conn = RecordingConnection::new();
    let mut proxy = ObjectProxy::new(conn.clone(), PATH, Some(SERVICE)).unwrap();
    proxy.set_interface(Some(IFACE));

    let blocking = proxy.call_method("Double", &(1i64,)).unwrap_err();
    let call = proxy.create_call("Double", &(1i64,)).unwrap();
    let queued = proxy.send_async(&call).unwrap_err();

    for err in [&blocking, &queued] {
        assert!(
            matches!(err, Error::AllocationFailed(text) if text.starts_with("Unable to send method call")),
            "unexpected {err:?}"
        );
    }
    assert_eq!(blocking.name(), error_names::NO_MEMORY);
    assert_eq!(conn.sent_count(), 2);
}

#[test]
fn test_build_failure_is_not_sent() {
    let bus = LoopbackBus::new();
    let (server, _object) = calculator(&bus);
    let proxy = proxy(&bus);
    server.pause();

    let call = proxy.create_call("not a member!", &());
    assert!(matches!(proxy.process_in_args(call), Err(Error::AllocationFailed(_))));
    assert_eq!(server.queued(), 0);
}

#[test]
fn test_proxy_on_closed_connection() {
    let bus = LoopbackBus::new();
    let conn = bus.connect();
    conn.disconnect();
    assert!(matches!(
        ObjectProxy::new(conn, PATH, Some(SERVICE)),
        Err(Error::Disconnected)
    ));
}

// =============================================================================
// Asynchronous Call Tests
// =============================================================================

#[test]
fn test_execute_async_delivers_reply() {
    let bus = LoopbackBus::new();
    let (_server, _object) = calculator(&bus);
    let proxy = proxy(&bus);

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    proxy
        .execute_async(proxy.create_call("Double", &(5i64,)), move |reply: Result<Message>| {
            *sink.lock() = Some(reply.map(|m| m.body().deserialize::<i64>().unwrap()));
        })
        .unwrap();

    assert!(matches!(*seen.lock(), Some(Ok(10))));
}

#[test]
fn test_execute_async_reports_remote_fault() {
    let bus = LoopbackBus::new();
    let (server, _object) = calculator(&bus);
    let proxy = proxy(&bus);
    server.pause();

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let pending = proxy
        .execute_async(proxy.create_call("Divide", &(1i64, 0i64)), move |reply: Result<Message>| {
            *sink.lock() = Some(reply.map_err(|e| e.name().to_string()));
        })
        .unwrap();
    assert!(seen.lock().is_none());
    assert!(!pending.is_complete());

    server.resume();
    match seen.lock().take() {
        Some(Err(name)) => assert_eq!(name, "org.example.Error.DivideByZero"),
        other => panic!("unexpected {other:?}"),
    };
}

struct DropCounted {
    invoked: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl MethodCallback for DropCounted {
    fn on_reply(self: Box<Self>, _reply: Result<Message>) {
        self.invoked.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for DropCounted {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_execute_async_with_failed_build_drops_callback() {
    let bus = LoopbackBus::new();
    let proxy = proxy(&bus);
    let invoked = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));

    let callback = DropCounted {
        invoked: Arc::clone(&invoked),
        dropped: Arc::clone(&dropped),
    };
    let err = proxy
        .execute_async(Err(Error::AllocationFailed("no call".into())), callback)
        .unwrap_err();

    assert!(matches!(err, Error::AllocationFailed(_)));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_execute_async_on_closed_connection_drops_callback() {
    let bus = LoopbackBus::new();
    let proxy = proxy(&bus);
    let call = proxy.create_call("Double", &(1i64,));
    let invoked = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));

    // Closing the client makes submission fail
    let conn = bus.connect();
    let mut closed = ObjectProxy::new(conn.clone(), PATH, Some(SERVICE)).unwrap();
    closed.set_interface(Some(IFACE));
    conn.disconnect();

    let callback = DropCounted {
        invoked: Arc::clone(&invoked),
        dropped: Arc::clone(&dropped),
    };
    let err = closed.execute_async(call, callback).unwrap_err();

    assert!(matches!(err, Error::Disconnected));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_callback_runs_once_and_is_dropped() {
    let bus = LoopbackBus::new();
    let (_server, _object) = calculator(&bus);
    let proxy = proxy(&bus);
    let invoked = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));

    let callback = DropCounted {
        invoked: Arc::clone(&invoked),
        dropped: Arc::clone(&dropped),
    };
    proxy
        .execute_async(proxy.create_call("Double", &(3i64,)), callback)
        .unwrap();

    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_disconnect_fails_outstanding_call() {
    let bus = LoopbackBus::new();
    let (server, _object) = calculator(&bus);
    let client = bus.connect();
    let mut proxy = ObjectProxy::new(client.clone(), PATH, Some(SERVICE)).unwrap();
    proxy.set_interface(Some(IFACE));
    server.pause();

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    proxy
        .execute_async(proxy.create_call("Double", &(1i64,)), move |reply: Result<Message>| {
            *sink.lock() = Some(reply.map_err(|e| e.name().to_string()));
        })
        .unwrap();

    client.disconnect();
    match seen.lock().take() {
        Some(Err(name)) => assert_eq!(name, error_names::DISCONNECTED),
        other => panic!("unexpected {other:?}"),
    };
}

#[test]
fn test_cancelled_call_never_notifies() {
    let bus = LoopbackBus::new();
    let (server, _object) = calculator(&bus);
    let proxy = proxy(&bus);
    server.pause();

    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invoked);
    let pending = proxy
        .execute_async(proxy.create_call("Double", &(1i64,)), move |_: Result<Message>| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    pending.cancel();

    server.resume();
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_send_async_reply_future() {
    let bus = LoopbackBus::new();
    let (server, _object) = calculator(&bus);
    let proxy = proxy(&bus);
    server.pause();

    let call = proxy.create_call("Double", &(8i64,)).unwrap();
    let pending = proxy.send_async(&call).unwrap();
    assert_eq!(pending.serial(), call.primary_header().serial_num().get());

    server.resume();
    let reply = pending.reply().await.unwrap();
    assert_eq!(reply.body().deserialize::<i64>().unwrap(), 16);
}

// =============================================================================
// Server Proxy Completion Functor Tests
// =============================================================================

static COMPLETION_DESTROYED: AtomicUsize = AtomicUsize::new(0);

fn record_completion(context: &mut (dyn Any + Send), reply: Result<Message>) {
    if let Some(slot) = context.downcast_mut::<Arc<Mutex<Vec<i64>>>>() {
        if let Ok(reply) = reply {
            slot.lock().push(reply.body().deserialize::<i64>().unwrap());
        }
    }
}

fn destroy_completion(_context: FunctorContext) {
    COMPLETION_DESTROYED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_completion_functor_notifies_then_destroys_once() {
    let bus = LoopbackBus::new();
    let (server, _object) = calculator(&bus);
    let mut proxy = ServerProxy::new(bus.connect(), PATH, Some(SERVICE)).unwrap();
    proxy.set_interface(Some(IFACE));
    server.pause();

    let results = Arc::new(Mutex::new(Vec::<i64>::new()));
    let functor = CompletionFunctor::new(
        Box::new(Arc::clone(&results)),
        record_completion,
        Some(destroy_completion),
    );
    let call = proxy.create_call("Double", &(4i64,)).unwrap();
    let before = COMPLETION_DESTROYED.load(Ordering::SeqCst);
    proxy.execute_async(&call, functor).unwrap();
    assert_eq!(COMPLETION_DESTROYED.load(Ordering::SeqCst), before);

    server.resume();
    assert_eq!(*results.lock(), vec![8]);
    assert_eq!(COMPLETION_DESTROYED.load(Ordering::SeqCst), before + 1);
}

static TIMED_OUT_DESTROYED: AtomicUsize = AtomicUsize::new(0);

fn destroy_timed_out(_context: FunctorContext) {
    TIMED_OUT_DESTROYED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_completion_functor_times_out_once() {
    let bus = LoopbackBus::new();
    let (server, _object) = calculator(&bus);
    let client = bus.connect();
    let mut proxy = ServerProxy::new(client.clone(), PATH, Some(SERVICE)).unwrap();
    proxy.set_interface(Some(IFACE));
    proxy.set_timeout(Timeout::After(Duration::from_millis(50)));
    server.pause();

    let outcomes = Arc::new(Mutex::new(Vec::<String>::new()));
    let functor = CompletionFunctor::new(
        Box::new(Arc::clone(&outcomes)),
        record_outcome,
        Some(destroy_timed_out),
    );
    let call = proxy.create_call("Double", &(4i64,)).unwrap();
    let before = TIMED_OUT_DESTROYED.load(Ordering::SeqCst);
    let pending = proxy.execute_async(&call, functor).unwrap();

    // Nothing expires before the deadline
    client.dispatch_pending();
    assert!(outcomes.lock().is_empty());

    std::thread::sleep(Duration::from_millis(80));
    client.dispatch_pending();
    assert_eq!(*outcomes.lock(), vec![error_names::NO_REPLY.to_string()]);
    assert!(pending.is_complete());
    assert_eq!(TIMED_OUT_DESTROYED.load(Ordering::SeqCst), before + 1);

    // The late reply finds no caller and changes nothing
    server.resume();
    client.dispatch_pending();
    assert_eq!(outcomes.lock().len(), 1);
    assert_eq!(TIMED_OUT_DESTROYED.load(Ordering::SeqCst), before + 1);
}

fn record_outcome(context: &mut (dyn Any + Send), reply: Result<Message>) {
    if let Some(log) = context.downcast_mut::<Arc<Mutex<Vec<String>>>>() {
        let entry = match reply {
            Ok(_) => "ok".to_string(),
            Err(e) => e.name().to_string(),
        };
        log.lock().push(entry);
    }
}

#[test]
fn test_server_proxy_blocking_call() {
    let bus = LoopbackBus::new();
    let (_server, _object) = calculator(&bus);
    let mut proxy = ServerProxy::new(bus.connect(), PATH, Some(SERVICE)).unwrap();
    proxy.set_interface(Some(IFACE));
    proxy.set_timeout(Timeout::from_millis(1000));

    let reply = proxy
        .process_in_args(proxy.create_call("Double", &(50i64,)))
        .unwrap();
    assert_eq!(reply.body().deserialize::<i64>().unwrap(), 100);
    assert!(proxy.core().connection().is_connected());
}
