//! skylark-client, a non-blocking publish/subscribe client core
//!
//! The client drives a connection lifecycle (endpoint lookup, connect,
//! subscribe and send, recover from failure, retry with backoff, stop) while
//! exposing a fully non-blocking API. Every application call becomes a
//! message on a single-consumer mailbox; one orchestrator drains it, runs the
//! protocol state machine and talks to the outside world through four service
//! traits.
//!
//! ## Modules
//!
//! * `mailbox`: Single-consumer FIFO with at most one concurrent drain.
//! * `promise`: Single-assignment completions and callback dispatch.
//! * `fsm`: The protocol state machine as a pure transition function.
//! * `subscription`, `delivery`: Per-destination tracking, inbound messages
//!   and at-least-once confirmation.
//! * `services`: Endpoint, connection, timer and callback contracts, with
//!   tokio-backed timer and callback services and a static endpoint list.
//! * `config`: Client options, validated in one pass.
//! * `client`: The public [`Client`] handle.
//!
//! ## Delivery guarantees
//!
//! At-most-once sends in flight when a connection drops are reported as
//! successful; at-least-once sends are resent after reconnecting. Inbound
//! at-least-once messages must be confirmed on the connection they arrived
//! on: a disconnect invalidates every outstanding confirmation.

pub mod backoff;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod fsm;
pub mod mailbox;
pub(crate) mod message;
pub(crate) mod orchestrator;
pub mod promise;
pub mod services;
pub mod state;
pub mod subscription;
pub mod types;

pub use client::{Client, ClientListener, Sent};
pub use config::{ClientOptions, RetryOptions, TlsOptions};
pub use delivery::{ConfirmHandle, Delivery, DeliveryInfo, DestinationListener, JsonPayload};
pub use error::{ClientError, ErrorKind};
pub use promise::Promise;
pub use services::{
    CallbackService, ConnectionService, Endpoint, EndpointLookup, EndpointService, Services,
    TimerService,
};
pub use state::ClientState;
pub use subscription::SubscriptionState;
pub use types::{
    ConnectionId, DeliveryTag, Payload, Properties, PropertyValue, QoS, SendOptions,
    SubscribeOptions, SubscriptionTopic, UnsubscribeOptions,
};

pub type Result<T> = std::result::Result<T, ClientError>;
