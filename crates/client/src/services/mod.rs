//! Contracts for the collaborators the client core drives.
//!
//! The core never touches sockets, clocks or thread pools directly. Each of
//! these concerns sits behind a trait whose operations are asynchronous and
//! report back by completing a [`Promise`]:
//!
//! | Service | Purpose |
//! |---------|---------|
//! | [`EndpointService`] | Picks the next server to try, or says how long to wait |
//! | [`ConnectionService`] | Opens connections and carries sends, subscriptions and acks |
//! | [`TimerService`] | Single-shot, cancellable delays |
//! | [`CallbackService`] | Runs application callbacks off the protocol thread |
//!
//! Implementations must never block, and must never complete a promise
//! while holding a lock that the completion might need: a completion can
//! post into the client mailbox and drain it on the calling thread.
//!
//! Default implementations backed by tokio live in the submodules.

pub mod callback;
pub mod endpoint;
pub mod timer;

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;

pub use callback::TokioCallbackService;
pub use endpoint::{Endpoint, StaticEndpointService};
pub use timer::TokioTimerService;

use super::{
    error::ClientError,
    promise::Promise,
    types::{ConnectionId, DeliveryTag, Payload, Properties, QoS, SubscriptionTopic},
};

/// An application callback, queued for execution.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Tasks submitted under the same context run one at a time, in submission
/// order. Each client owns one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderingContext(u64);

impl OrderingContext {
    /// Allocates a fresh context.
    pub fn next() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Runs application code.
pub trait CallbackService: Send + Sync + 'static {
    /// Runs `task` asynchronously, after every task previously submitted with
    /// the same `context`. Completes `completion`, if given, once the task has
    /// finished: with success, or with [`ClientError::Callback`] if it
    /// panicked.
    fn run(&self, task: Task, context: OrderingContext, completion: Option<Promise<()>>);

    /// Called when the client owning `context` has stopped. Tasks already
    /// submitted still run in order; resources held for the context may be
    /// dropped afterwards. A later `run` with the same context must keep
    /// ordering after those tasks.
    fn release(&self, _context: OrderingContext) {}
}

/// Single-shot timers.
pub trait TimerService: Send + Sync + 'static {
    /// Succeeds `promise` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, promise: Promise<()>);

    /// Fails a scheduled promise with [`ClientError::Cancelled`]. Does nothing
    /// if the timer already popped.
    fn cancel(&self, promise: &Promise<()>);
}

/// Answer to an endpoint lookup.
#[derive(Debug, Clone)]
pub enum EndpointLookup {
    /// Try this endpoint next.
    Found(Endpoint),
    /// Every candidate has been tried; wait this long before asking again.
    RetryAfter(Duration),
}

/// Chooses which server to connect to.
pub trait EndpointService: Send + Sync + 'static {
    /// Completes `promise` with the next endpoint, a retry wait, or a
    /// permanent failure.
    fn lookup(&self, promise: Promise<EndpointLookup>);

    /// Reports that a connection to `endpoint` was established.
    fn on_success(&self, endpoint: &Endpoint);
}

/// Why an inbound payload could not be handed over as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// The frame was not a well-formed message at all.
    PayloadNotAmqp,
    /// The message was well formed but its body could not be mapped to a
    /// supported format, e.g. a text body that is not UTF-8.
    FormatNoMapping,
}

/// Body of an inbound message as decoded by the transport.
#[derive(Debug, Clone)]
pub enum InboundPayload {
    Bytes(Bytes),
    /// A text body, still raw: UTF-8 is checked when the delivery is built.
    Text(Bytes),
    /// A JSON body, still raw.
    Json(Bytes),
    Malformed {
        data: Bytes,
        reason: MalformedReason,
        description: String,
    },
}

/// A message pushed by the server for one of this client's subscriptions.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The subscription that matched.
    pub subscription: SubscriptionTopic,
    /// The topic the message was sent to.
    pub topic: String,
    pub qos: QoS,
    pub tag: DeliveryTag,
    pub ttl: Option<Duration>,
    pub properties: Properties,
    pub payload: InboundPayload,
}

/// Asynchronous notifications from an open connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    Delivery(InboundMessage),
    /// The connection is gone. Network errors lead to a retry; security and
    /// replacement errors stop the client.
    Disconnected(ClientError),
}

type EventSink = Arc<dyn Fn(ConnectionId, ConnectionEvent) + Send + Sync + 'static>;

/// Handle a connection service uses to report events for one connection.
#[derive(Clone)]
pub struct ConnectionEvents {
    connection: ConnectionId,
    sink: EventSink,
}

impl ConnectionEvents {
    pub fn new(
        connection: ConnectionId,
        sink: impl Fn(ConnectionId, ConnectionEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            connection,
            sink: Arc::new(sink),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn deliver(&self, message: InboundMessage) {
        (self.sink)(self.connection, ConnectionEvent::Delivery(message));
    }

    pub fn disconnected(&self, cause: ClientError) {
        (self.sink)(self.connection, ConnectionEvent::Disconnected(cause));
    }
}

impl fmt::Debug for ConnectionEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEvents")
            .field("connection", &self.connection)
            .finish()
    }
}

/// Everything a connection service needs to open a connection.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Identifier the client will use for this connection from now on.
    pub connection: ConnectionId,
    pub endpoint: Endpoint,
    pub client_id: String,
    pub events: ConnectionEvents,
}

/// A message to send.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Payload,
    pub qos: QoS,
    pub ttl: Option<Duration>,
    pub properties: Properties,
}

/// Parameters of a subscribe request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeParams {
    pub topic: SubscriptionTopic,
    pub qos: QoS,
    pub credit: u32,
    pub auto_confirm: bool,
    /// Subscription ttl, already rounded to whole seconds.
    pub ttl_seconds: u64,
}

/// Carries protocol traffic to and from the server.
///
/// Failures reported through the promises use [`ClientError::Network`] for
/// anything worth retrying and [`ClientError::Security`] or
/// [`ClientError::Replaced`] for failures that must stop the client.
pub trait ConnectionService: Send + Sync + 'static {
    /// Opens a connection. Events for it are reported through
    /// `request.events` until the connection is closed or lost.
    fn open(&self, request: OpenRequest, promise: Promise<()>);

    fn close(&self, connection: ConnectionId, promise: Promise<()>);

    /// Sends a message. At-least-once sends complete when the server has
    /// acknowledged them, at-most-once sends when they have been written.
    fn send(&self, connection: ConnectionId, message: OutboundMessage, promise: Promise<()>);

    fn subscribe(&self, connection: ConnectionId, params: SubscribeParams, promise: Promise<()>);

    /// Detaches a subscription. With `zero_ttl` the server discards it
    /// instead of keeping it for a later reattach.
    fn unsubscribe(
        &self,
        connection: ConnectionId,
        topic: SubscriptionTopic,
        zero_ttl: bool,
        promise: Promise<()>,
    );

    /// Acknowledges an at-least-once delivery and returns its credit.
    fn confirm(&self, connection: ConnectionId, tag: DeliveryTag);
}

/// The full set of collaborators a client is built with.
#[derive(Clone)]
pub struct Services {
    pub endpoint: Arc<dyn EndpointService>,
    pub connection: Arc<dyn ConnectionService>,
    pub timer: Arc<dyn TimerService>,
    pub callback: Arc<dyn CallbackService>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::mailbox::lock;

    #[test]
    fn test_ordering_contexts_are_unique() {
        let a = OrderingContext::next();
        let b = OrderingContext::next();
        assert_ne!(a, b);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_connection_events_tag_connection_id() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let events = ConnectionEvents::new(ConnectionId(7), {
            let seen = seen.clone();
            move |id, event| lock(&seen).push((id, matches!(event, ConnectionEvent::Disconnected(_))))
        });
        events.disconnected(ClientError::Network("reset".into()));
        assert_eq!(*lock(&seen), vec![(ConnectionId(7), true)]);
        assert_eq!(events.connection(), ConnectionId(7));
    }
}
