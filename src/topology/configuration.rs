//! Declarative description of exchanges, queues and bindings.
use amq_protocol_types::{AMQPValue, FieldTable};
use serde::Deserialize;
use std::collections::BTreeMap;

/// The routing algorithm of an exchange.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    /// A plugin-provided type, e.g. `x-delayed-message`.
    Custom(String),
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
        }
    }
}

/// A value in the `arguments` table of a declaration (e.g. `x-message-ttl`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ArgumentValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Declaration arguments, keyed by argument name.
pub type Arguments = BTreeMap<String, ArgumentValue>;

/// Convert declaration arguments into the table sent over the wire.
pub fn field_table(arguments: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = match value {
            ArgumentValue::Bool(b) => AMQPValue::Boolean(*b),
            ArgumentValue::Integer(i) => AMQPValue::LongLongInt(*i),
            ArgumentValue::Float(f) => AMQPValue::Double(*f),
            ArgumentValue::Text(s) => AMQPValue::LongString(s.clone().into()),
        };
        table.insert(key.clone().into(), value);
    }
    table
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExchangeDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    /// The exchange survives broker restarts.
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    /// Only check that the exchange exists.
    pub passive: bool,
    pub no_wait: bool,
    pub arguments: Arguments,
}

impl ExchangeDescriptor {
    /// A durable exchange of the given kind.
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub passive: bool,
    pub no_wait: bool,
    pub arguments: Arguments,
}

impl QueueDescriptor {
    /// A durable, non-exclusive queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            ..Self::default()
        }
    }
}

/// A binding from `source` (always an exchange) to `destination` (a queue or an exchange).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct BindingDescriptor {
    pub source: String,
    pub destination: String,
    pub routing_key: String,
    pub no_wait: bool,
    pub arguments: Arguments,
}

impl BindingDescriptor {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            routing_key: routing_key.into(),
            ..Self::default()
        }
    }
}

/// Everything [`Topologer::build_topology`](super::Topologer::build_topology) declares,
/// in declaration order.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopologyConfig {
    pub exchanges: Vec<ExchangeDescriptor>,
    pub queues: Vec<QueueDescriptor>,
    pub exchange_bindings: Vec<BindingDescriptor>,
    pub queue_bindings: Vec<BindingDescriptor>,
}
