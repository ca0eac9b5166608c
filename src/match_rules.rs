//! D-Bus match rule parsing and matching.
//!
//! Signal routers subscribe through match rules built by
//! [`signal_match_rule`]; the loopback broker parses them back with
//! [`MatchRule::parse`] to decide which connections see a broadcast.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::trace;
use zbus::message::{Message, Type as MessageType};

use crate::message::MessageExt;

/// Highest `argN` index a rule may filter on.
const MAX_ARG_INDEX: u8 = 63;

/// Build the rule a signal router registers for `member` on `path`.
///
/// An empty member produces a path-only rule covering every signal
/// emitted from that path.
pub fn signal_match_rule(path: &str, member: &str) -> String {
    if member.is_empty() {
        format!("type='signal',path='{}'", path)
    } else {
        format!("type='signal',path='{}',member='{}'", path, member)
    }
}

/// Errors from [`MatchRule::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchRuleError {
    /// The rule is not a list of `key='value'` pairs.
    #[error("Invalid match rule format: {0}")]
    InvalidFormat(String),

    /// An `argN` key with a bad or out of range index.
    #[error("Invalid argument index: {0}")]
    InvalidArgIndex(String),

    /// A `type` value that names no message type.
    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

/// A parsed D-Bus match rule.
///
/// Absent filters match anything. Keys the parser does not know are
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRule {
    /// The rule exactly as it was given; removal matches on this.
    pub rule_string: String,
    pub msg_type: Option<MessageType>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    /// Matches the path itself and everything below it.
    pub path_namespace: Option<String>,
    pub destination: Option<String>,
    /// `argN` string filters by index.
    pub args: BTreeMap<u8, String>,
}

impl MatchRule {
    /// Parse a rule such as `type='signal',path='/org/example',member='Changed'`.
    pub fn parse(rule: &str) -> Result<Self, MatchRuleError> {
        let mut parsed = MatchRule {
            rule_string: rule.to_string(),
            ..Default::default()
        };

        for (key, value) in pairs(rule)? {
            match key {
                "type" => parsed.msg_type = Some(message_type(&value)?),
                "sender" => parsed.sender = Some(value),
                "interface" => parsed.interface = Some(value),
                "member" => parsed.member = Some(value),
                "path" => parsed.path = Some(value),
                "path_namespace" => parsed.path_namespace = Some(value),
                "destination" => parsed.destination = Some(value),
                _ => match key.strip_prefix("arg").map(str::parse::<u8>) {
                    Some(Ok(index)) if index <= MAX_ARG_INDEX => {
                        parsed.args.insert(index, value);
                    }
                    Some(_) if !key.ends_with("path") && !key.ends_with("namespace") => {
                        return Err(MatchRuleError::InvalidArgIndex(key.to_string()));
                    }
                    _ => trace!(key = %key, "Ignoring unsupported match rule key"),
                },
            }
        }

        if parsed.path.is_some() && parsed.path_namespace.is_some() {
            return Err(MatchRuleError::InvalidFormat(
                "path and path_namespace are mutually exclusive".to_string(),
            ));
        }
        Ok(parsed)
    }

    /// Check whether `msg` passes every filter of this rule.
    pub fn matches(&self, msg: &Message) -> bool {
        if self
            .msg_type
            .is_some_and(|wanted| wanted != msg.primary_header().msg_type())
        {
            return false;
        }

        let sender = msg.header().sender().map(|s| s.to_string());
        let headers_match = [
            (&self.sender, sender),
            (&self.interface, msg.interface_str()),
            (&self.member, msg.member_str()),
            (&self.path, msg.path_str()),
            (&self.destination, msg.destination_str()),
        ]
        .into_iter()
        .all(|(filter, actual)| filter.is_none() || filter.as_deref() == actual.as_deref());
        if !headers_match {
            return false;
        }

        if let Some(namespace) = &self.path_namespace {
            let Some(path) = msg.path_str() else {
                return false;
            };
            if !in_namespace(&path, namespace) {
                return false;
            }
        }

        if self.args.is_empty() {
            return true;
        }
        let args = string_args(msg);
        self.args.iter().all(|(index, expected)| {
            matches!(args.get(usize::from(*index)), Some(Some(actual)) if actual == expected)
        })
    }
}

/// Split a rule into `(key, value)` pairs. Values may be quoted with `'`.
fn pairs(rule: &str) -> Result<Vec<(&str, String)>, MatchRuleError> {
    let mut out = Vec::new();
    let mut rest = rule.trim();

    while !rest.is_empty() {
        let (key, after_key) = rest
            .split_once('=')
            .ok_or_else(|| MatchRuleError::InvalidFormat(format!("Missing '=' in: {}", rest)))?;
        let after_key = after_key.trim_start();

        let (value, tail) = match after_key.strip_prefix('\'') {
            Some(quoted) => quoted
                .split_once('\'')
                .ok_or_else(|| MatchRuleError::InvalidFormat("Unclosed quote".to_string()))?,
            None => {
                let (bare, tail) = after_key.split_at(after_key.find(',').unwrap_or(after_key.len()));
                (bare.trim_end(), tail)
            }
        };
        out.push((key.trim(), value.to_string()));

        rest = tail.trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }
    Ok(out)
}

fn message_type(value: &str) -> Result<MessageType, MatchRuleError> {
    match value {
        "signal" => Ok(MessageType::Signal),
        "method_call" => Ok(MessageType::MethodCall),
        "method_return" => Ok(MessageType::MethodReturn),
        "error" => Ok(MessageType::Error),
        other => Err(MatchRuleError::UnknownType(other.to_string())),
    }
}

fn in_namespace(path: &str, namespace: &str) -> bool {
    namespace == "/"
        || path == namespace
        || path
            .strip_prefix(namespace)
            .is_some_and(|below| below.starts_with('/'))
}

/// Positional string arguments of a message body; non-string arguments
/// are `None`.
fn string_args(msg: &Message) -> Vec<Option<String>> {
    use zbus::zvariant::{Structure, Value};

    let body = msg.body();
    if let Ok(structure) = body.deserialize::<Structure>() {
        return structure
            .fields()
            .iter()
            .map(|field| match field {
                Value::Str(s) => Some(s.to_string()),
                Value::ObjectPath(p) => Some(p.to_string()),
                _ => None,
            })
            .collect();
    }
    body.deserialize::<String>()
        .map(|s| vec![Some(s)])
        .unwrap_or_default()
}

/// Match rules registered by one connection.
///
/// Adding the same rule twice keeps two references and each removal drops
/// one, as the bus daemon does.
#[derive(Debug, Default)]
pub struct MatchRuleSet {
    rules: Vec<MatchRule>,
}

impl MatchRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: MatchRule) {
        self.rules.push(rule);
    }

    /// Drop one reference to the rule registered as `rule_string`.
    ///
    /// Returns `false` if no such rule is held.
    pub fn remove(&mut self, rule_string: &str) -> bool {
        let found = self.rules.iter().rposition(|r| r.rule_string == rule_string);
        found.map(|idx| self.rules.remove(idx)).is_some()
    }

    /// Check if any held rule matches `msg`.
    pub fn matches(&self, msg: &Message) -> bool {
        self.rules.iter().any(|r| r.matches(msg))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// The rule strings held, one entry per reference.
    pub fn rule_strings(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.rule_string.clone()).collect()
    }
}
