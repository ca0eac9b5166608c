//! Introspection XML for exported objects.

use std::fmt::Write;

use zbus::Message;

use crate::message::MessageExt;

/// Interface every exported object answers on.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
                       \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

/// Check whether `call` asks for introspection data. Calls without an
/// interface header count.
pub fn is_introspect_call(call: &Message) -> bool {
    call.is_method_call()
        && call.member_str().as_deref() == Some("Introspect")
        && call
            .interface_str()
            .map_or(true, |iface| iface == INTROSPECTABLE_INTERFACE)
}

/// Build the introspection document for one object.
///
/// `methods` are listed under `interface` in sorted order, and only when
/// there is an interface to put them in. `children` become `<node/>`
/// entries.
pub fn describe(interface: Option<&str>, methods: &[String], children: &[String]) -> String {
    let mut methods: Vec<&str> = methods.iter().map(String::as_str).collect();
    methods.sort_unstable();

    let mut xml = String::from(DOCTYPE);
    xml.push_str("<node>\n");
    let _ = writeln!(xml, "  <interface name=\"{}\">", INTROSPECTABLE_INTERFACE);
    xml.push_str("    <method name=\"Introspect\">\n");
    xml.push_str("      <arg name=\"xml_data\" type=\"s\" direction=\"out\"/>\n");
    xml.push_str("    </method>\n");
    xml.push_str("  </interface>\n");

    match interface {
        Some(name) if !methods.is_empty() => {
            let _ = writeln!(xml, "  <interface name=\"{}\">", escape(name));
            for method in methods {
                let _ = writeln!(xml, "    <method name=\"{}\"/>", escape(method));
            }
            xml.push_str("  </interface>\n");
        }
        _ => {}
    }

    for child in children {
        let _ = writeln!(xml, "  <node name=\"{}\"/>", escape(child));
    }
    xml.push_str("</node>\n");
    xml
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
