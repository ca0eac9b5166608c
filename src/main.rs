//! kapsule-dbus-dispatch - command-line demo for the dispatch layer.
//!
//! `serve` exports an echo object, `call` invokes a method through an object
//! proxy, and `listen` prints signals routed to a proxy.

use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kapsule_dbus_dispatch::message::error_names;
use kapsule_dbus_dispatch::{
    shared, BusConnection, Error, ExportedObject, HandlerError, MessageExt, ObjectProxy, Result,
    Timeout, ZbusConnection, WILDCARD,
};

const DEFAULT_NAME: &str = "org.kapsule.DBusDispatch.Demo";
const DEFAULT_PATH: &str = "/org/kapsule/DBusDispatch/Demo";
const DEFAULT_INTERFACE: &str = "org.kapsule.DBusDispatch.Demo";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BusChoice {
    Session,
    System,
}

/// Typed D-Bus method dispatch, call proxies and signal routing.
#[derive(Parser, Debug)]
#[command(name = "kapsule-dbus-dispatch")]
#[command(author, about, long_about = None)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_TIMESTAMP"), ")"))]
struct Args {
    /// Which default bus to use.
    #[arg(long, short = 'b', value_enum, default_value = "session")]
    bus: BusChoice,

    /// Connect to this D-Bus address instead of a default bus.
    ///
    /// Should be in D-Bus address format, e.g., "unix:path=/path/to/socket".
    #[arg(long, short = 'a')]
    address: Option<String>,

    /// Reply timeout in milliseconds; negative uses the default, 0 waits
    /// forever.
    #[arg(long, short = 't', default_value_t = -1, allow_negative_numbers = true)]
    timeout_ms: i64,

    /// Log level filter (e.g., "debug", "info", "warn", "error").
    #[arg(long, short = 'v', default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export an object answering Echo and Ping until interrupted.
    Serve {
        /// Well-known name to request.
        #[arg(long, default_value = DEFAULT_NAME)]
        name: String,

        /// Object path to export.
        #[arg(long, default_value = DEFAULT_PATH)]
        path: String,
    },

    /// Call a method and print the reply.
    Call {
        /// Destination bus name.
        #[arg(long, default_value = DEFAULT_NAME)]
        dest: String,

        /// Object path.
        #[arg(long, default_value = DEFAULT_PATH)]
        path: String,

        /// Interface name.
        #[arg(long, default_value = DEFAULT_INTERFACE)]
        interface: String,

        /// Method name.
        method: String,

        /// Optional string argument.
        arg: Option<String>,
    },

    /// Print signals emitted from an object path until interrupted.
    Listen {
        /// Object path.
        #[arg(long, default_value = DEFAULT_PATH)]
        path: String,

        /// Signal name; all signals if omitted.
        #[arg(long, default_value = WILDCARD)]
        signal: String,
    },
}

fn connect(args: &Args) -> Result<Arc<ZbusConnection>> {
    match (&args.address, args.bus) {
        (Some(address), _) => Ok(Arc::new(ZbusConnection::connect(address)?)),
        (None, BusChoice::Session) => shared::session_bus(),
        (None, BusChoice::System) => shared::system_bus(),
    }
}

fn serve(conn: Arc<ZbusConnection>, name: &str, path: &str) -> Result<()> {
    let object = ExportedObject::new(path);
    object.set_interface(DEFAULT_INTERFACE);

    object.export_fn("Echo", |call, reply| {
        let text: String = call.body().deserialize()?;
        reply.set_body(&(text,))
    })?;

    let mut pings = 0u64;
    object.export_fn("Ping", move |_, reply| {
        pings += 1;
        reply.set_body(&(pings,))
    })?;

    object.export_fn("Fail", |_, _| {
        Err(HandlerError::dbus(
            "org.kapsule.DBusDispatch.Demo.Failed",
            "Failure requested",
        ))
    })?;

    object.enable(conn.clone())?;
    conn.request_name(name)?;
    info!(name = %name, path = %path, "Serving");

    conn.wait_for_interrupt()?;
    object.emit_signal("Stopping", &())?;
    Ok(())
}

fn call(
    conn: Arc<ZbusConnection>,
    timeout: Timeout,
    dest: &str,
    path: &str,
    interface: &str,
    method: &str,
    arg: Option<&str>,
) -> Result<()> {
    let mut proxy = ObjectProxy::new(conn, path, Some(dest))?;
    proxy.set_interface(Some(interface));
    proxy.set_timeout(timeout);

    let reply = match arg {
        Some(arg) => proxy.call_method(method, &(arg,))?,
        None => proxy.call_method(method, &())?,
    };

    let body = reply.body();
    let signature = body.signature().to_string();
    match body.deserialize::<String>() {
        Ok(text) => println!("{}", text),
        Err(_) => println!("reply {} with signature \"{}\"", reply.serial(), signature),
    }
    Ok(())
}

fn listen(conn: Arc<ZbusConnection>, path: &str, signal: &str) -> Result<()> {
    let proxy = ObjectProxy::new(conn.clone(), path, None)?;
    proxy.enable_signal_fn(signal, |msg| {
        println!(
            "{}.{} from {}",
            msg.interface_str().unwrap_or_default(),
            msg.member_str().unwrap_or_default(),
            msg.path_str().unwrap_or_default()
        );
        Ok(())
    })?;
    info!(path = %path, signal = %signal, "Listening");

    conn.wait_for_interrupt()?;
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let conn = connect(&args)?;
    let timeout = Timeout::from_millis(args.timeout_ms);
    info!(
        unique_name = ?conn.unique_name(),
        timeout = ?timeout,
        "Connected"
    );

    match &args.command {
        Command::Serve { name, path } => serve(conn, name, path),
        Command::Call {
            dest,
            path,
            interface,
            method,
            arg,
        } => call(conn, timeout, dest, path, interface, method, arg.as_deref()),
        Command::Listen { path, signal } => listen(conn, path, signal),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up tracing/logging
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&args.log_level)
            .map_err(|e| Error::Config(format!("Invalid log level {:?}: {}", args.log_level, e)))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    let result = run(args);
    if let Err(ref e) = result {
        if e.name() == error_names::NO_REPLY {
            warn!("No reply; is the service running?");
        }
    }

    shared::shutdown();
    result
}
