//! Message helpers.
//!
//! Header accessors, builders for calls, signals and replies, and the
//! [`Reply`] slot handed to method handlers.

use zbus::message::{Flags, Message, Type as MessageType};
use zbus::zvariant::Type;

use crate::error::{Error, HandlerError, Result};

/// Header accessors used throughout the dispatch layer.
///
/// Header fields come back as owned strings so callers can hold them past
/// the message borrow. Only [`MessageExt::kind`] decides the message type;
/// the `is_*` checks are built on it.
pub trait MessageExt {
    /// Type from the primary header.
    fn kind(&self) -> MessageType;
    fn serial(&self) -> u32;
    /// Serial of the call a return or error answers.
    fn reply_serial(&self) -> Option<u32>;
    /// Whether the sender set `NO_REPLY_EXPECTED`.
    fn no_reply_expected(&self) -> bool;

    fn path_str(&self) -> Option<String>;
    fn interface_str(&self) -> Option<String>;
    /// Method or signal name.
    fn member_str(&self) -> Option<String>;
    fn destination_str(&self) -> Option<String>;
    /// Error name carried by an error reply.
    fn error_name_str(&self) -> Option<String>;

    fn is_method_call(&self) -> bool {
        self.kind() == MessageType::MethodCall
    }

    fn is_method_return(&self) -> bool {
        self.kind() == MessageType::MethodReturn
    }

    fn is_error(&self) -> bool {
        self.kind() == MessageType::Error
    }

    fn is_signal(&self) -> bool {
        self.kind() == MessageType::Signal
    }
}

fn owned<T: ToString>(field: Option<T>) -> Option<String> {
    field.map(|value| value.to_string())
}

impl MessageExt for Message {
    fn kind(&self) -> MessageType {
        self.primary_header().msg_type()
    }

    fn serial(&self) -> u32 {
        self.primary_header().serial_num().get()
    }

    fn reply_serial(&self) -> Option<u32> {
        self.header().reply_serial().map(|serial| serial.get())
    }

    fn no_reply_expected(&self) -> bool {
        self.primary_header()
            .flags()
            .contains(Flags::NoReplyExpected)
    }

    fn path_str(&self) -> Option<String> {
        owned(self.header().path())
    }

    fn interface_str(&self) -> Option<String> {
        owned(self.header().interface())
    }

    fn member_str(&self) -> Option<String> {
        owned(self.header().member())
    }

    fn destination_str(&self) -> Option<String> {
        owned(self.header().destination())
    }

    fn error_name_str(&self) -> Option<String> {
        owned(self.header().error_name())
    }
}

/// Build a method call message.
///
/// `destination` and `interface` may be `None` to let the broker resolve
/// them.
pub fn create_method_call<B: serde::Serialize + Type>(
    destination: Option<&str>,
    path: &str,
    interface: Option<&str>,
    member: &str,
    body: &B,
) -> Result<Message> {
    let build = || -> zbus::Result<Message> {
        let mut builder = Message::method_call(path, member)?;
        if let Some(dest) = destination {
            builder = builder.destination(dest)?;
        }
        if let Some(iface) = interface {
            builder = builder.interface(iface)?;
        }
        builder.build(body)
    };
    build().map_err(|e| Error::AllocationFailed(format!("Unable to build D-Bus method call: {}", e)))
}

/// Build a signal message.
pub fn create_signal<B: serde::Serialize + Type>(
    path: &str,
    interface: &str,
    member: &str,
    body: &B,
) -> Result<Message> {
    Message::signal(path, interface, member)
        .and_then(|builder| builder.build(body))
        .map_err(|e| Error::AllocationFailed(format!("Unable to build D-Bus signal: {}", e)))
}

/// Build the method return answering `request`.
pub fn create_method_return<B: serde::Serialize + Type>(
    request: &Message,
    body: &B,
) -> Result<Message> {
    let reply = Message::method_return(&request.header())?.build(body)?;
    Ok(reply)
}

/// Build an error reply answering `request`, with `error_message` as its
/// only argument.
pub fn create_error(request: &Message, error_name: &str, error_message: &str) -> Result<Message> {
    let reply = Message::error(&request.header(), error_name)?.build(&(error_message,))?;
    Ok(reply)
}

/// Decode an error reply into [`Error::RemoteFault`].
///
/// Returns `None` if the message is not an error reply.
pub fn remote_fault(reply: &Message) -> Option<Error> {
    if !reply.is_error() {
        return None;
    }

    let name = reply
        .error_name_str()
        .unwrap_or_else(|| error_names::FAILED.to_string());
    // The first string argument is the message, by convention
    let message = reply
        .body()
        .deserialize::<String>()
        .or_else(|_| reply.body().deserialize::<(String,)>().map(|(m,)| m))
        .unwrap_or_default();

    Some(Error::RemoteFault { name, message })
}

/// The reply slot a method handler fills in.
///
/// It starts out as an empty method return correlated to the call; setting
/// a body rebuilds it.
#[derive(Debug)]
pub struct Reply {
    call: Message,
    message: Message,
}

impl Reply {
    /// Allocate an empty reply correlated to `call`.
    pub fn new(call: &Message) -> Result<Self> {
        let message = create_method_return(call, &())?;
        Ok(Self {
            call: call.clone(),
            message,
        })
    }

    /// Replace the reply body.
    pub fn set_body<B: serde::Serialize + Type>(
        &mut self,
        body: &B,
    ) -> std::result::Result<(), HandlerError> {
        self.message = Message::method_return(&self.call.header())?.build(body)?;
        Ok(())
    }

    /// The reply built so far.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Consume the slot, returning the message to send.
    pub fn into_message(self) -> Message {
        self.message
    }
}

/// Common D-Bus error names.
pub mod error_names {
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const NO_MEMORY: &str = "org.freedesktop.DBus.Error.NoMemory";
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
    pub const OBJECT_PATH_IN_USE: &str = "org.freedesktop.DBus.Error.ObjectPathInUse";
    pub const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
    pub const MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
    pub const NAME_IN_USE: &str = "org.freedesktop.DBus.Error.NameInUse";

    /// Reported when a local method handler fails without a D-Bus error name.
    pub const HANDLER_FAULT: &str = "org.kapsule.DBusDispatch.HandlerFault";
}
