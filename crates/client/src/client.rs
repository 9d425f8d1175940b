//! Public client API.
//!
//! Every method is non-blocking and thread-safe. Argument errors and calls
//! made while the client is stopping or stopped fail synchronously; anything
//! else is posted to the client's mailbox and reported through the returned
//! [`Promise`], whose listener runs on the callback service.
//!
//! ```ignore
//! let client = Client::new(options, services, Arc::new(MyListener))?;
//! client.start().on_complete(|r| println!("started: {r:?}"))?;
//!
//! client.subscribe("/kittens", SubscribeOptions::default(), Arc::new(Printer))?;
//! let sent = client.send("/kittens", "meow", SendOptions::default())?;
//! if !sent.accepting {
//!     // Hold further sends until ClientListener::on_drain.
//! }
//! ```

use std::{fmt, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use super::{
    config::ClientOptions,
    delivery::DestinationListener,
    error::ClientError,
    mailbox::Mailbox,
    message::{InternalMessage, SendRequest, SubscribeRequest, UnsubscribeRequest, Work},
    orchestrator::{Orchestrator, SendWindow},
    promise::{CallbackDispatch, Promise},
    services::{OutboundMessage, Services, SubscribeParams},
    state::ClientState,
    subscription::SubscriptionState,
    types::{
        ttl_seconds, validate_topic, Payload, QoS, SendOptions, SubscribeOptions,
        SubscriptionTopic, UnsubscribeOptions,
    },
    Result,
};

/// Lifecycle notifications. Every method defaults to doing nothing.
///
/// Notifications run on the callback service, in order, never on the thread
/// driving the protocol. A panic in any of them stops the client.
pub trait ClientListener: Send + Sync + 'static {
    /// A start cycle has begun: the client left the stopped state.
    fn on_starting(&self) {}

    /// The first connection of a start cycle is up.
    fn on_started(&self) {}

    /// The client reconnected after losing its connection and every
    /// subscription has been re-established.
    fn on_restarted(&self) {}

    /// The client is waiting for, or attempting, another connection. `cause`
    /// is the failure that led here, if one was recorded since the previous
    /// notification; an endpoint service asking the client to wait has none.
    fn on_retrying(&self, _cause: Option<ClientError>) {}

    /// The client stopped. `cause` is `None` when the application asked for
    /// the stop.
    fn on_stopped(&self, _cause: Option<ClientError>) {}

    /// Sends that were holding back the application have drained.
    fn on_drain(&self) {}
}

impl ClientListener for () {}

/// Result of [`Client::send`].
#[derive(Debug)]
pub struct Sent {
    /// Completes when the transport has handled the message.
    pub promise: Promise<()>,
    /// False when enough sends are outstanding that the application should
    /// hold off until [`ClientListener::on_drain`].
    pub accepting: bool,
}

/// A non-blocking publish/subscribe client.
///
/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Client {
    id: Arc<str>,
    mailbox: Arc<Mailbox<Orchestrator>>,
    dispatch: CallbackDispatch,
    state: watch::Receiver<ClientState>,
    window: Arc<SendWindow>,
}

impl Client {
    /// Builds a stopped client. Call [`Client::start`] to connect.
    ///
    /// # Errors
    /// [`ClientError::Argument`] or [`ClientError::Config`] if the options
    /// are invalid.
    pub fn new(
        options: ClientOptions,
        services: Services,
        listener: Arc<dyn ClientListener>,
    ) -> Result<Self> {
        let options = options.validated()?;
        let id: Arc<str> = Arc::from(options.client_id().unwrap_or_default());
        let (state_tx, state) = watch::channel(ClientState::Stopped);
        let window = Arc::new(SendWindow::new(options.send_backpressure_threshold));

        let mailbox = Mailbox::with_handle({
            let id = id.to_string();
            let window = window.clone();
            move |handle| Orchestrator::new(id, services, listener, handle, state_tx, window)
        });
        let dispatch = mailbox.inspect(|core| core.dispatch().clone());
        debug!(client = %id, "Client created");

        Ok(Self {
            id,
            mailbox,
            dispatch,
            state,
            window,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// A receiver that observes every lifecycle state change.
    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    /// Sends submitted but not yet resolved.
    pub fn undrained_sends(&self) -> usize {
        self.window.undrained()
    }

    /// Starts the client. Completes when the client is started, or fails if
    /// it stops first.
    pub fn start(&self) -> Promise<()> {
        let promise = self.promise();
        self.mailbox.post(InternalMessage::Start(Some(promise.clone())));
        promise
    }

    /// Stops the client. Completes once it has stopped and every queued
    /// callback has run.
    pub fn stop(&self) -> Promise<()> {
        let promise = self.promise();
        self.mailbox.post(InternalMessage::Stop(promise.clone()));
        promise
    }

    /// Sends a message to `topic`.
    ///
    /// # Errors
    /// [`ClientError::Argument`] for an empty topic, [`ClientError::Stopped`]
    /// if the client is stopping or stopped.
    pub fn send(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        options: SendOptions,
    ) -> Result<Sent> {
        validate_topic(topic)?;
        self.check_not_stopped()?;

        let promise = self.promise();
        let accepting = self.window.admit();
        self.mailbox.post(InternalMessage::Work(Work::Send(SendRequest {
            message: OutboundMessage {
                topic: topic.to_string(),
                payload: payload.into(),
                qos: options.qos,
                ttl: options.ttl,
                properties: options.properties,
            },
            promise: promise.clone(),
        })));
        Ok(Sent { promise, accepting })
    }

    /// Serializes `value` as JSON and sends it.
    ///
    /// # Errors
    /// As [`Client::send`], plus [`ClientError::Argument`] if `value` cannot
    /// be serialized.
    pub fn send_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        options: SendOptions,
    ) -> Result<Sent> {
        let json = serde_json::to_string(value)
            .map_err(|e| ClientError::Argument(format!("cannot serialize payload: {e}")))?;
        self.send(topic, Payload::Json(json), options)
    }

    /// Subscribes to `pattern`. Messages go to `listener`.
    ///
    /// The promise fails with [`ClientError::AlreadySubscribed`] if an
    /// identical subscription exists with nothing queued behind it.
    ///
    /// # Errors
    /// [`ClientError::Argument`] for an empty pattern or a share name with a
    /// colon, [`ClientError::Stopped`] if the client is stopping or stopped.
    pub fn subscribe(
        &self,
        pattern: &str,
        options: SubscribeOptions,
        listener: Arc<dyn DestinationListener>,
    ) -> Result<Promise<()>> {
        SubscriptionTopic::validate(pattern, options.share.as_deref())?;
        self.check_not_stopped()?;

        let promise = self.promise();
        let params = SubscribeParams {
            topic: SubscriptionTopic::new(pattern, options.share),
            qos: options.qos,
            credit: options.credit,
            auto_confirm: options.auto_confirm || options.qos == QoS::AtMostOnce,
            ttl_seconds: ttl_seconds(options.ttl),
        };
        self.mailbox
            .post(InternalMessage::Work(Work::Subscribe(SubscribeRequest {
                params,
                listener,
                promise: promise.clone(),
            })));
        Ok(promise)
    }

    /// Unsubscribes from `pattern`.
    ///
    /// # Errors
    /// [`ClientError::Argument`] if `options.ttl` is anything but zero, an
    /// empty pattern or a bad share name. [`ClientError::Stopped`] if the
    /// client is stopping or stopped.
    pub fn unsubscribe(&self, pattern: &str, options: UnsubscribeOptions) -> Result<Promise<()>> {
        let zero_ttl = match options.ttl {
            None => false,
            Some(ttl) if ttl == Duration::ZERO => true,
            Some(ttl) => {
                return Err(ClientError::Argument(format!(
                    "unsubscribe ttl must be zero, got {}ms",
                    ttl.as_millis()
                )))
            }
        };
        SubscriptionTopic::validate(pattern, options.share.as_deref())?;
        self.check_not_stopped()?;

        let promise = self.promise();
        self.mailbox
            .post(InternalMessage::Work(Work::Unsubscribe(UnsubscribeRequest {
                topic: SubscriptionTopic::new(pattern, options.share),
                zero_ttl,
                promise: promise.clone(),
            })));
        Ok(promise)
    }

    /// The tracking state of a subscription, if one exists.
    pub fn subscription_state(&self, pattern: &str, share: Option<&str>) -> Option<SubscriptionState> {
        let topic = SubscriptionTopic::new(pattern, share.map(str::to_string));
        self.mailbox.inspect(|core| core.subscription_state(&topic))
    }

    fn promise(&self) -> Promise<()> {
        Promise::dispatched(self.dispatch.clone())
    }

    fn check_not_stopped(&self) -> Result<()> {
        if self.state().is_rejecting_work() {
            return Err(ClientError::stopped());
        }
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("undrained_sends", &self.undrained_sends())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_listener_is_noop() {
        let listener: Arc<dyn ClientListener> = Arc::new(());
        listener.on_starting();
        listener.on_started();
        listener.on_retrying(None);
        listener.on_stopped(Some(ClientError::stopped()));
        listener.on_drain();
    }
}
