//! Inbound messages as the application sees them, and confirmation tracking.
//!
//! Every delivery carries a [`DeliveryInfo`]. At-least-once deliveries on a
//! subscription without auto-confirm also carry a [`ConfirmHandle`]; the
//! application must confirm them before the server will release more credit.
//!
//! Confirming posts to the client mailbox; the outstanding set lives with the
//! rest of the session state and is only touched while the mailbox drains.
//! Confirmation fails synchronously when the delivery never needed
//! confirming or was already confirmed, and through the returned promise
//! when the connection it arrived on has since been lost.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{
    error::ClientError,
    promise::Promise,
    services::{InboundMessage, InboundPayload, MalformedReason},
    types::{ConnectionId, DeliveryTag, Properties, QoS, SubscriptionTopic},
};

/// Fields shared by every kind of delivery.
#[derive(Debug, Clone)]
pub struct DeliveryInfo {
    /// Topic the message was sent to.
    pub topic: String,
    /// Pattern of the subscription that matched.
    pub pattern: String,
    pub share: Option<String>,
    pub qos: QoS,
    pub ttl: Option<Duration>,
    pub properties: Properties,
    confirmation: Option<ConfirmHandle>,
}

impl DeliveryInfo {
    /// True when the application is expected to call [`Delivery::confirm`].
    pub fn needs_confirmation(&self) -> bool {
        self.confirmation.is_some()
    }
}

/// A JSON body, parsed on first use.
pub struct JsonPayload {
    raw: String,
    parsed: OnceLock<Result<serde_json::Value, String>>,
}

impl JsonPayload {
    fn new(raw: String) -> Self {
        Self {
            raw,
            parsed: OnceLock::new(),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The parsed document. Parsing happens once; later calls reuse it.
    pub fn value(&self) -> Result<&serde_json::Value, ClientError> {
        self.parsed
            .get_or_init(|| serde_json::from_str(&self.raw).map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|e| ClientError::Argument(format!("invalid JSON payload: {e}")))
    }

    /// Deserializes the body into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_str(&self.raw)
            .map_err(|e| ClientError::Argument(format!("invalid JSON payload: {e}")))
    }
}

impl fmt::Debug for JsonPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JsonPayload").field(&self.raw).finish()
    }
}

/// A message received on a subscription.
#[derive(Debug)]
pub enum Delivery {
    Bytes {
        info: DeliveryInfo,
        data: Bytes,
    },
    Text {
        info: DeliveryInfo,
        text: String,
    },
    Json {
        info: DeliveryInfo,
        json: JsonPayload,
    },
    /// A message that could not be mapped to any of the other kinds.
    Malformed {
        info: DeliveryInfo,
        data: Bytes,
        reason: MalformedReason,
        description: String,
    },
}

impl Delivery {
    /// Builds the application view of an inbound message.
    pub(crate) fn from_inbound(message: InboundMessage, confirmation: Option<ConfirmHandle>) -> Self {
        let info = DeliveryInfo {
            topic: message.topic,
            pattern: message.subscription.pattern,
            share: message.subscription.share,
            qos: message.qos,
            ttl: message.ttl,
            properties: message.properties,
            confirmation,
        };
        match message.payload {
            InboundPayload::Bytes(data) => Delivery::Bytes { info, data },
            InboundPayload::Text(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => Delivery::Text { info, text },
                Err(e) => Delivery::Malformed {
                    info,
                    data,
                    reason: MalformedReason::FormatNoMapping,
                    description: format!("text body is not UTF-8: {e}"),
                },
            },
            InboundPayload::Json(data) => match String::from_utf8(data.to_vec()) {
                Ok(raw) => Delivery::Json {
                    info,
                    json: JsonPayload::new(raw),
                },
                Err(e) => Delivery::Malformed {
                    info,
                    data,
                    reason: MalformedReason::FormatNoMapping,
                    description: format!("JSON body is not UTF-8: {e}"),
                },
            },
            InboundPayload::Malformed {
                data,
                reason,
                description,
            } => Delivery::Malformed {
                info,
                data,
                reason,
                description,
            },
        }
    }

    pub fn info(&self) -> &DeliveryInfo {
        match self {
            Delivery::Bytes { info, .. }
            | Delivery::Text { info, .. }
            | Delivery::Json { info, .. }
            | Delivery::Malformed { info, .. } => info,
        }
    }

    pub fn topic(&self) -> &str {
        &self.info().topic
    }

    pub fn qos(&self) -> QoS {
        self.info().qos
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Delivery::Malformed { .. })
    }

    /// Confirms that the application has processed this delivery. The
    /// promise fails with [`ClientError::State`] if the connection it arrived
    /// on has been lost.
    ///
    /// # Errors
    /// [`ClientError::State`] if the delivery is at-most-once or
    /// auto-confirmed, or if it was already confirmed.
    pub fn confirm(&self) -> Result<Promise<()>, ClientError> {
        match &self.info().confirmation {
            Some(handle) => handle.confirm(),
            None => Err(ClientError::State(
                "delivery does not need confirmation (at-most-once or auto-confirmed)".into(),
            )),
        }
    }
}

/// A delivery awaiting confirmation: enough to acknowledge it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDelivery {
    pub connection: ConnectionId,
    pub tag: DeliveryTag,
}

/// Outstanding at-least-once deliveries that the application must confirm.
/// Owned by the orchestrator.
#[derive(Debug, Default)]
pub(crate) struct ConfirmationTracker {
    next_id: u64,
    pending: HashMap<u64, PendingDelivery>,
}

impl ConfirmationTracker {
    pub fn track(&mut self, delivery: PendingDelivery) -> u64 {
        self.next_id += 1;
        self.pending.insert(self.next_id, delivery);
        self.next_id
    }

    /// Removes and returns a tracked delivery.
    pub fn take(&mut self, id: u64) -> Option<PendingDelivery> {
        self.pending.remove(&id)
    }

    /// Forgets every outstanding delivery; later confirms fail.
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }
}

/// Posts a confirm for a tracked delivery and returns its promise.
pub(crate) type ConfirmSink = Arc<dyn Fn(u64) -> Promise<()> + Send + Sync + 'static>;

/// Lets the application confirm one delivery, once.
#[derive(Clone)]
pub struct ConfirmHandle {
    id: u64,
    confirmed: Arc<AtomicBool>,
    sink: ConfirmSink,
}

impl ConfirmHandle {
    pub(crate) fn new(id: u64, sink: ConfirmSink) -> Self {
        Self {
            id,
            confirmed: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    fn confirm(&self) -> Result<Promise<()>, ClientError> {
        if self.confirmed.swap(true, Ordering::SeqCst) {
            return Err(ClientError::State("delivery already confirmed".into()));
        }
        Ok((self.sink)(self.id))
    }
}

impl fmt::Debug for ConfirmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmHandle")
            .field("id", &self.id)
            .field("confirmed", &self.confirmed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Receives the messages and lifecycle events of one subscription.
///
/// Callbacks run on the callback service, one at a time and in order, never
/// on the thread driving the protocol. A panicking callback stops the client
/// with [`ClientError::Callback`].
pub trait DestinationListener: Send + Sync + 'static {
    fn on_message(&self, delivery: Delivery);

    /// A message arrived that could not be decoded. Logged by default.
    fn on_malformed(&self, delivery: Delivery) {
        if let Delivery::Malformed {
            info,
            reason,
            description,
            ..
        } = &delivery
        {
            warn!(topic = %info.topic, ?reason, %description, "Malformed delivery dropped");
        }
    }

    /// The subscription ended: after an unsubscribe, when the client stopped,
    /// or when a re-subscribe after reconnect failed (`error` set).
    fn on_unsubscribed(&self, _topic: &SubscriptionTopic, _error: Option<ClientError>) {}
}
