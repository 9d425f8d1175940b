//! Messages carried by the client mailbox.

use std::sync::Arc;

use super::{
    delivery::{DestinationListener, PendingDelivery},
    error::ClientError,
    promise::Promise,
    services::{EndpointLookup, InboundMessage, OutboundMessage, SubscribeParams},
    types::{ConnectionId, SubscriptionTopic},
};

pub(crate) struct SendRequest {
    pub message: OutboundMessage,
    pub promise: Promise<()>,
}

pub(crate) struct SubscribeRequest {
    pub params: SubscribeParams,
    pub listener: Arc<dyn DestinationListener>,
    pub promise: Promise<()>,
}

pub(crate) struct UnsubscribeRequest {
    pub topic: SubscriptionTopic,
    pub zero_ttl: bool,
    pub promise: Promise<()>,
}

/// Application work: accepted, buffered or rejected depending on state.
pub(crate) enum Work {
    Send(SendRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
}

impl Work {
    pub fn promise(&self) -> &Promise<()> {
        match self {
            Work::Send(r) => &r.promise,
            Work::Subscribe(r) => &r.promise,
            Work::Unsubscribe(r) => &r.promise,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Work::Send(_) => "send",
            Work::Subscribe(_) => "subscribe",
            Work::Unsubscribe(_) => "unsubscribe",
        }
    }
}

/// Everything that can happen to a client, in the order it happened.
pub(crate) enum InternalMessage {
    /// `None` when the client restarts itself after a start queued during stop.
    Start(Option<Promise<()>>),
    Stop(Promise<()>),
    Work(Work),

    EndpointResponse(Result<EndpointLookup, ClientError>),
    OpenResponse {
        connection: ConnectionId,
        result: Result<(), ClientError>,
    },
    CloseResponse {
        connection: ConnectionId,
    },
    SendResponse {
        connection: ConnectionId,
        id: u64,
        result: Result<(), ClientError>,
    },
    SubscribeResponse {
        connection: ConnectionId,
        topic: SubscriptionTopic,
        result: Result<(), ClientError>,
    },
    UnsubscribeResponse {
        connection: ConnectionId,
        topic: SubscriptionTopic,
        result: Result<(), ClientError>,
    },
    TimerResponse {
        timer: u64,
        popped: bool,
    },

    Delivery {
        connection: ConnectionId,
        message: InboundMessage,
    },
    Disconnected {
        connection: ConnectionId,
        cause: ClientError,
    },

    /// The application confirmed the tracked delivery `id`.
    Confirm { id: u64, promise: Promise<()> },
    /// The listener for an auto-confirmed delivery has finished.
    AutoConfirm(PendingDelivery),
    /// Every callback queued before the flush request has run.
    FlushComplete,
    SubscriptionsRemade,
    /// An application callback panicked.
    CallbackFailed(ClientError),
}

impl InternalMessage {
    pub fn name(&self) -> &'static str {
        match self {
            InternalMessage::Start(_) => "start",
            InternalMessage::Stop(_) => "stop",
            InternalMessage::Work(work) => work.kind(),
            InternalMessage::EndpointResponse(_) => "endpoint-response",
            InternalMessage::OpenResponse { .. } => "open-response",
            InternalMessage::CloseResponse { .. } => "close-response",
            InternalMessage::SendResponse { .. } => "send-response",
            InternalMessage::SubscribeResponse { .. } => "subscribe-response",
            InternalMessage::UnsubscribeResponse { .. } => "unsubscribe-response",
            InternalMessage::TimerResponse { .. } => "timer-response",
            InternalMessage::Delivery { .. } => "delivery",
            InternalMessage::Disconnected { .. } => "disconnected",
            InternalMessage::Confirm { .. } => "confirm",
            InternalMessage::AutoConfirm(_) => "auto-confirm",
            InternalMessage::FlushComplete => "flush-complete",
            InternalMessage::SubscriptionsRemade => "subscriptions-remade",
            InternalMessage::CallbackFailed(_) => "callback-failed",
        }
    }
}
