//! Value types shared by the public API and the service contracts.

use std::{collections::BTreeMap, fmt, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::ClientError;

/// Delivery guarantee for sends and subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    /// Fire and forget. A message may be lost but is never duplicated.
    #[default]
    AtMostOnce,
    /// Acknowledged. A message may be delivered more than once.
    AtLeastOnce,
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QoS::AtMostOnce => write!(f, "at-most-once"),
            QoS::AtLeastOnce => write!(f, "at-least-once"),
        }
    }
}

/// An application property value carried alongside a message.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    Bytes(Bytes),
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

/// Application properties, ordered by key.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Outbound message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    /// A JSON document, already serialized.
    Json(String),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(b) => b.len(),
            Payload::Text(s) | Payload::Json(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for Payload {
    fn from(v: Bytes) -> Self {
        Payload::Bytes(v)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for Payload {
    fn from(v: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(v))
    }
}

impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Payload::Text(v.to_string())
    }
}

impl From<String> for Payload {
    fn from(v: String) -> Self {
        Payload::Text(v)
    }
}

/// Options for [`Client::send`](crate::Client::send).
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub qos: QoS,
    /// How long the server keeps the message if nobody consumes it.
    pub ttl: Option<Duration>,
    pub properties: Properties,
}

impl SendOptions {
    pub fn at_least_once() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Default link credit granted to the server for a new subscription.
pub const DEFAULT_CREDIT: u32 = 1024;

/// Options for [`Client::subscribe`](crate::Client::subscribe).
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Shared subscription name. Clients using the same share split the
    /// messages between them.
    pub share: Option<String>,
    pub qos: QoS,
    /// Maximum number of unconfirmed messages the server may push.
    pub credit: u32,
    /// Confirm at-least-once deliveries automatically once the listener has
    /// run. Always true for at-most-once subscriptions.
    pub auto_confirm: bool,
    /// How long the server keeps the subscription alive while this client is
    /// disconnected. Rounded to whole seconds.
    pub ttl: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            share: None,
            qos: QoS::AtMostOnce,
            credit: DEFAULT_CREDIT,
            auto_confirm: true,
            ttl: Duration::ZERO,
        }
    }
}

impl SubscribeOptions {
    pub fn shared(share: impl Into<String>) -> Self {
        Self {
            share: Some(share.into()),
            ..Default::default()
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_auto_confirm(mut self, auto_confirm: bool) -> Self {
        self.auto_confirm = auto_confirm;
        self
    }

    pub fn with_credit(mut self, credit: u32) -> Self {
        self.credit = credit;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Options for [`Client::unsubscribe`](crate::Client::unsubscribe).
#[derive(Debug, Clone, Default)]
pub struct UnsubscribeOptions {
    pub share: Option<String>,
    /// `Some(Duration::ZERO)` discards the subscription on the server
    /// immediately. Any other value is rejected.
    pub ttl: Option<Duration>,
}

/// Identity of a subscription: a topic pattern plus an optional share name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionTopic {
    pub pattern: String,
    pub share: Option<String>,
}

impl SubscriptionTopic {
    pub fn new(pattern: impl Into<String>, share: Option<String>) -> Self {
        Self {
            pattern: pattern.into(),
            share,
        }
    }

    /// Checks the pattern and share name without building anything.
    pub fn validate(pattern: &str, share: Option<&str>) -> Result<(), ClientError> {
        if pattern.is_empty() {
            return Err(ClientError::Argument("topic pattern must not be empty".into()));
        }
        if let Some(share) = share {
            if share.is_empty() {
                return Err(ClientError::Argument("share name must not be empty".into()));
            }
            if share.contains(':') {
                return Err(ClientError::Argument(format!(
                    "share name '{share}' must not contain a colon"
                )));
            }
        }
        Ok(())
    }

    /// Server-side link address: `share:<share>:<pattern>` or `private:<pattern>`.
    pub fn address(&self) -> String {
        match &self.share {
            Some(share) => format!("share:{share}:{}", self.pattern),
            None => format!("private:{}", self.pattern),
        }
    }
}

impl fmt::Display for SubscriptionTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Identifier the client assigns to each connection it asks the connection
/// service to open. Events and responses carry it so that anything from a
/// superseded connection can be recognised and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport-level identifier of an inbound message, used to acknowledge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

/// Rounds a millisecond ttl to the nearest whole second, halves rounding up.
pub fn ttl_seconds(ttl: Duration) -> u64 {
    let millis = ttl.as_millis();
    u64::try_from((millis + 500) / 1000).unwrap_or(u64::MAX)
}

/// Checks an outbound topic.
pub(crate) fn validate_topic(topic: &str) -> Result<(), ClientError> {
    if topic.is_empty() {
        return Err(ClientError::Argument("topic must not be empty".into()));
    }
    Ok(())
}
