//! The client core.
//!
//! [`Orchestrator`] is the mailbox actor that owns every piece of mutable
//! session state: subscriptions, outstanding sends, buffered work, the current
//! endpoint and connection. It turns each [`InternalMessage`] into a trigger
//! for the protocol state machine and performs the actions the machine
//! returns. Service responses come back as further messages, so the
//! orchestrator never waits on anything.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::{
    client::ClientListener,
    delivery::{ConfirmHandle, ConfirmationTracker, Delivery, PendingDelivery},
    error::ClientError,
    fsm::{self, Action, State, Trigger},
    mailbox::{Actor, MailboxHandle},
    message::{InternalMessage, SendRequest, SubscribeRequest, UnsubscribeRequest, Work},
    promise::{settle, CallbackDispatch, Promise},
    services::{
        ConnectionEvent, ConnectionEvents, Endpoint, EndpointLookup, InboundMessage, OpenRequest,
        OrderingContext, Services, SubscribeParams,
    },
    state::ClientState,
    subscription::{Subscription, SubscriptionState, SubscriptionTracker},
    types::{ConnectionId, QoS, SubscriptionTopic},
};

/// Send accounting shared between the public API and the orchestrator.
///
/// A send counts as undrained from the moment it is submitted until its
/// promise is resolved.
#[derive(Debug)]
pub(crate) struct SendWindow {
    undrained: AtomicUsize,
    drain_pending: AtomicBool,
    threshold: usize,
}

impl SendWindow {
    pub fn new(threshold: usize) -> Self {
        Self {
            undrained: AtomicUsize::new(0),
            drain_pending: AtomicBool::new(false),
            threshold: threshold.max(1),
        }
    }

    /// Counts a new send. Returns false once the window is full, in which
    /// case the application is owed an `on_drain` notification.
    pub fn admit(&self) -> bool {
        let undrained = self.undrained.fetch_add(1, Ordering::SeqCst) + 1;
        let accepting = undrained < self.threshold;
        if !accepting {
            self.drain_pending.store(true, Ordering::SeqCst);
        }
        accepting
    }

    /// Releases one send. Returns true when the window has emptied and a
    /// drain notification is owed.
    fn release(&self) -> bool {
        let previous = self
            .undrained
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous <= 1 && self.drain_pending.swap(false, Ordering::SeqCst)
    }

    /// Takes the drain obligation, if any.
    fn take_drain(&self) -> bool {
        self.drain_pending.swap(false, Ordering::SeqCst)
    }

    pub fn undrained(&self) -> usize {
        self.undrained.load(Ordering::SeqCst)
    }
}

struct OutstandingSend {
    connection: ConnectionId,
    request: SendRequest,
}

/// Owns and mutates all session state. Runs only inside the mailbox drain.
pub(crate) struct Orchestrator {
    client_id: String,
    state: State,
    state_tx: watch::Sender<ClientState>,
    handle: MailboxHandle<Orchestrator>,
    services: Services,
    listener: Arc<dyn ClientListener>,
    dispatch: CallbackDispatch,

    endpoint: Option<Endpoint>,
    connection: Option<ConnectionId>,
    next_connection: u64,
    retry_delay: Duration,
    timer: Option<Promise<()>>,
    last_error: Option<ClientError>,
    stopped_by_user: bool,

    pending_starts: Vec<Promise<()>>,
    pending_stops: Vec<Promise<()>>,
    pending_work: VecDeque<Work>,

    next_send_id: u64,
    outstanding: BTreeMap<u64, OutstandingSend>,
    window: Arc<SendWindow>,

    subscriptions: SubscriptionTracker,
    remakes_outstanding: usize,
    confirmations: ConfirmationTracker,
}

impl Orchestrator {
    pub fn new(
        client_id: String,
        services: Services,
        listener: Arc<dyn ClientListener>,
        handle: MailboxHandle<Orchestrator>,
        state_tx: watch::Sender<ClientState>,
        window: Arc<SendWindow>,
    ) -> Self {
        let failures = handle.clone();
        let dispatch = CallbackDispatch::new(services.callback.clone(), OrderingContext::next())
            .with_failure_hook(move |e| {
                failures.post(InternalMessage::CallbackFailed(e));
            });
        Self {
            client_id,
            state: State::Stopped,
            state_tx,
            handle,
            services,
            listener,
            dispatch,
            endpoint: None,
            connection: None,
            next_connection: 0,
            retry_delay: Duration::ZERO,
            timer: None,
            last_error: None,
            stopped_by_user: false,
            pending_starts: Vec::new(),
            pending_stops: Vec::new(),
            pending_work: VecDeque::new(),
            next_send_id: 0,
            outstanding: BTreeMap::new(),
            window,
            subscriptions: SubscriptionTracker::default(),
            remakes_outstanding: 0,
            confirmations: ConfirmationTracker::default(),
        }
    }

    pub fn dispatch(&self) -> &CallbackDispatch {
        &self.dispatch
    }

    pub fn subscription_state(&self, topic: &SubscriptionTopic) -> Option<SubscriptionState> {
        self.subscriptions.state_of(topic)
    }

    // State machine

    fn fire(&mut self, trigger: Trigger) {
        let Some(transition) = fsm::transition(self.state, trigger) else {
            debug!(state = %self.state, ?trigger, "Ignoring trigger with no transition");
            return;
        };
        let from = self.state;
        self.state = transition.to;
        if from != transition.to {
            debug!(client = %self.client_id, %from, to = %transition.to, ?trigger, "State transition");
        }
        self.state_tx.send_replace(transition.to.public());
        for action in transition.actions {
            self.perform(*action);
        }
    }

    fn perform(&mut self, action: Action) {
        trace!(?action, state = %self.state, "Performing action");
        match action {
            Action::RequestEndpoint => self.request_endpoint(),
            Action::OpenConnection => self.open_connection(),
            Action::CloseConnection => self.close_connection(),
            Action::StartRetryTimer => self.start_retry_timer(),
            Action::CancelRetryTimer => {
                if let Some(timer) = &self.timer {
                    self.services.timer.cancel(timer);
                }
            }
            Action::MarkEndpointGood => {
                self.retry_delay = Duration::ZERO;
                if let Some(endpoint) = &self.endpoint {
                    self.services.endpoint.on_success(endpoint);
                }
            }
            Action::RemakeInboundLinks => self.remake_inbound_links(),
            Action::BreakInboundLinks => self.break_inbound_links(),
            Action::DiscardConnection => self.connection = None,
            Action::Cleanup => self.cleanup(),
            Action::FlushCallbacks => self.flush_callbacks(),
            Action::ResetSession => {
                self.last_error = None;
                self.stopped_by_user = false;
                self.retry_delay = Duration::ZERO;
            }
            Action::SucceedPendingStarts => {
                for promise in self.pending_starts.drain(..) {
                    settle(&promise, Ok(()));
                }
            }
            Action::FailPendingStarts => {
                let cause = self.last_error.clone().unwrap_or_else(ClientError::stopped);
                for promise in self.pending_starts.drain(..) {
                    settle(&promise, Err(cause.clone()));
                }
            }
            Action::SucceedPendingStops => {
                for promise in self.pending_stops.drain(..) {
                    settle(&promise, Ok(()));
                }
            }
            Action::ReplayPendingWork => {
                let work = std::mem::take(&mut self.pending_work);
                if !work.is_empty() {
                    debug!(count = work.len(), "Replaying buffered work");
                }
                for item in work {
                    self.on_work(item);
                }
            }
            Action::NotifyStarting => {
                info!(client = %self.client_id, "Client starting");
                let listener = self.listener.clone();
                self.dispatch.run(Box::new(move || listener.on_starting()));
            }
            Action::NotifyStarted => {
                info!(client = %self.client_id, "Client started");
                let listener = self.listener.clone();
                self.dispatch.run(Box::new(move || listener.on_started()));
            }
            Action::NotifyRestarted => {
                info!(client = %self.client_id, "Client restarted");
                let listener = self.listener.clone();
                self.dispatch.run(Box::new(move || listener.on_restarted()));
            }
            Action::NotifyRetrying => {
                let cause = self.last_error.take();
                match &cause {
                    Some(e) => info!(client = %self.client_id, error = %e, "Client retrying"),
                    None => info!(client = %self.client_id, "Client retrying"),
                }
                let listener = self.listener.clone();
                self.dispatch.run(Box::new(move || listener.on_retrying(cause)));
            }
            Action::NotifyStopped => {
                let cause = self.last_error.take();
                match &cause {
                    Some(e) => info!(client = %self.client_id, error = %e, "Client stopped"),
                    None => info!(client = %self.client_id, "Client stopped"),
                }
                let listener = self.listener.clone();
                self.dispatch.run(Box::new(move || listener.on_stopped(cause)));
            }
            Action::ReleaseCallbacks => {
                self.services.callback.release(self.dispatch.context());
            }
            Action::ResumeStart => {
                if !self.pending_starts.is_empty() {
                    self.handle.post(InternalMessage::Start(None));
                }
            }
        }
    }

    /// Remembers the first cause of a stop or retry cycle.
    fn record_error(&mut self, cause: &ClientError) {
        if self.stopped_by_user || self.last_error.is_some() {
            trace!(error = %cause, "Discarding later error");
            return;
        }
        self.last_error = Some(cause.clone());
    }

    // Actions

    fn request_endpoint(&self) {
        let handle = self.handle.clone();
        let promise = Promise::new();
        let _ = promise.on_complete(move |result: Result<EndpointLookup, ClientError>| {
            handle.post(InternalMessage::EndpointResponse(result));
        });
        self.services.endpoint.lookup(promise);
    }

    fn open_connection(&mut self) {
        let Some(endpoint) = self.endpoint.clone() else {
            error!("Open requested without an endpoint");
            self.handle.post(InternalMessage::OpenResponse {
                connection: ConnectionId(self.next_connection),
                result: Err(ClientError::State("no endpoint".into())),
            });
            return;
        };
        self.next_connection += 1;
        let connection = ConnectionId(self.next_connection);
        self.connection = Some(connection);
        debug!(%connection, endpoint = %endpoint, "Opening connection");

        let events = {
            let handle = self.handle.clone();
            ConnectionEvents::new(connection, move |connection, event| {
                let message = match event {
                    ConnectionEvent::Delivery(message) => {
                        InternalMessage::Delivery { connection, message }
                    }
                    ConnectionEvent::Disconnected(cause) => {
                        InternalMessage::Disconnected { connection, cause }
                    }
                };
                handle.post(message);
            })
        };
        let handle = self.handle.clone();
        let promise = Promise::new();
        let _ = promise.on_complete(move |result| {
            handle.post(InternalMessage::OpenResponse { connection, result });
        });
        self.services.connection.open(
            OpenRequest {
                connection,
                endpoint,
                client_id: self.client_id.clone(),
                events,
            },
            promise,
        );
    }

    fn close_connection(&mut self) {
        let Some(connection) = self.connection else {
            warn!("Close requested without a connection");
            self.fire(Trigger::ConnectionClosed);
            return;
        };
        let handle = self.handle.clone();
        let promise = Promise::new();
        let _ = promise.on_complete(move |_: Result<(), ClientError>| {
            handle.post(InternalMessage::CloseResponse { connection });
        });
        self.services.connection.close(connection, promise);
    }

    fn start_retry_timer(&mut self) {
        if let Some(existing) = &self.timer {
            error!(timer = existing.id(), "Retry timer already running, replacing it");
            self.services.timer.cancel(existing);
        }
        let handle = self.handle.clone();
        let promise = Promise::new();
        let id = promise.id();
        let _ = promise.on_complete(move |result: Result<(), ClientError>| {
            handle.post(InternalMessage::TimerResponse {
                timer: id,
                popped: result.is_ok(),
            });
        });
        debug!(delay_ms = self.retry_delay.as_millis() as u64, "Waiting before retrying");
        self.timer = Some(promise.clone());
        self.services.timer.schedule(self.retry_delay, promise);
    }

    fn remake_inbound_links(&mut self) {
        let Some(connection) = self.connection else {
            self.handle.post(InternalMessage::SubscriptionsRemade);
            return;
        };
        let remakes = self.subscriptions.begin_remake();
        self.remakes_outstanding = remakes.len();
        debug!(count = remakes.len(), "Re-subscribing after reconnect");
        if remakes.is_empty() {
            self.handle.post(InternalMessage::SubscriptionsRemade);
            return;
        }
        for params in remakes {
            self.issue_subscribe(connection, params);
        }
    }

    fn break_inbound_links(&mut self) {
        // At-most-once sends never promise delivery; at-least-once sends go
        // back to the front of the queue, ahead of anything buffered since.
        let mut recovered = Vec::new();
        for (_, send) in std::mem::take(&mut self.outstanding) {
            match send.request.message.qos {
                QoS::AtMostOnce => self.finish_send(&send.request.promise, Ok(())),
                QoS::AtLeastOnce => recovered.push(Work::Send(send.request)),
            }
        }
        recovered.extend(self.subscriptions.break_all());
        for work in recovered.into_iter().rev() {
            self.pending_work.push_front(work);
        }
        self.remakes_outstanding = 0;

        let dropped = self.confirmations.clear();
        if dropped > 0 {
            debug!(dropped, "Outstanding confirmations invalidated by disconnect");
        }
        if self.window.take_drain() {
            self.notify_drain();
        }
    }

    fn cleanup(&mut self) {
        let stopped = ClientError::stopped();
        for mut row in self.subscriptions.take_all() {
            for promise in row.take_promises() {
                settle(&promise, Err(stopped.clone()));
            }
            if row.established_once {
                let listener = row.listener.clone();
                let topic = row.params.topic.clone();
                self.dispatch
                    .run(Box::new(move || listener.on_unsubscribed(&topic, None)));
            }
        }
        self.remakes_outstanding = 0;

        for (_, send) in std::mem::take(&mut self.outstanding) {
            let result = match send.request.message.qos {
                QoS::AtMostOnce => Ok(()),
                QoS::AtLeastOnce => Err(stopped.clone()),
            };
            self.finish_send(&send.request.promise, result);
        }
        for work in std::mem::take(&mut self.pending_work) {
            self.reject(work, stopped.clone());
        }

        self.confirmations.clear();
        self.connection = None;
        if let Some(timer) = self.timer.take() {
            self.services.timer.cancel(&timer);
        }
        if self.window.take_drain() {
            self.notify_drain();
        }
    }

    fn flush_callbacks(&self) {
        let handle = self.handle.clone();
        let completion = Promise::new();
        let _ = completion.on_complete(move |_: Result<(), ClientError>| {
            handle.post(InternalMessage::FlushComplete);
        });
        self.dispatch.run_with(Box::new(|| {}), completion);
    }

    fn notify_drain(&self) {
        let listener = self.listener.clone();
        self.dispatch.run(Box::new(move || listener.on_drain()));
    }

    // Work

    fn on_work(&mut self, work: Work) {
        let public = self.state.public();
        if public.is_rejecting_work() {
            self.reject(work, ClientError::stopped());
        } else if public.is_queueing_work() {
            trace!(kind = work.kind(), "Buffering work until started");
            self.pending_work.push_back(work);
        } else {
            self.execute(work);
        }
    }

    fn reject(&self, work: Work, cause: ClientError) {
        match work {
            Work::Send(request) => self.finish_send(&request.promise, Err(cause)),
            other => settle(other.promise(), Err(cause)),
        }
    }

    fn execute(&mut self, work: Work) {
        let Some(connection) = self.connection else {
            error!(kind = work.kind(), "Accepting work without a connection");
            self.pending_work.push_back(work);
            return;
        };
        match work {
            Work::Send(request) => self.execute_send(connection, request),
            Work::Subscribe(request) => self.execute_subscribe(connection, request),
            Work::Unsubscribe(request) => self.execute_unsubscribe(connection, request),
        }
    }

    fn execute_send(&mut self, connection: ConnectionId, request: SendRequest) {
        self.next_send_id += 1;
        let id = self.next_send_id;
        let handle = self.handle.clone();
        let promise = Promise::new();
        let _ = promise.on_complete(move |result| {
            handle.post(InternalMessage::SendResponse {
                connection,
                id,
                result,
            });
        });
        let message = request.message.clone();
        trace!(id, topic = %message.topic, qos = %message.qos, "Sending");
        self.outstanding.insert(
            id,
            OutstandingSend {
                connection,
                request,
            },
        );
        self.services.connection.send(connection, message, promise);
    }

    fn finish_send(&self, promise: &Promise<()>, result: Result<(), ClientError>) {
        settle(promise, result);
        if self.window.release() {
            self.notify_drain();
        }
    }

    fn execute_subscribe(&mut self, connection: ConnectionId, request: SubscribeRequest) {
        let topic = request.params.topic.clone();
        match self.subscriptions.get_mut(&topic) {
            None => {
                let params = request.params.clone();
                self.subscriptions.insert(Subscription::new(
                    request.params,
                    request.listener,
                    request.promise,
                ));
                self.issue_subscribe(connection, params);
            }
            Some(row) if row.is_idle() => {
                settle(
                    &request.promise,
                    Err(ClientError::AlreadySubscribed(topic.to_string())),
                );
            }
            Some(row) => {
                trace!(%topic, state = %row.state, "Queueing subscribe behind in-flight operation");
                row.pending.push_back(Work::Subscribe(request));
            }
        }
    }

    fn issue_subscribe(&self, connection: ConnectionId, params: SubscribeParams) {
        let handle = self.handle.clone();
        let topic = params.topic.clone();
        let promise = Promise::new();
        let _ = promise.on_complete(move |result| {
            handle.post(InternalMessage::SubscribeResponse {
                connection,
                topic,
                result,
            });
        });
        debug!(topic = %params.topic, qos = %params.qos, ttl = params.ttl_seconds, "Subscribing");
        self.services.connection.subscribe(connection, params, promise);
    }

    fn execute_unsubscribe(&mut self, connection: ConnectionId, request: UnsubscribeRequest) {
        let topic = request.topic.clone();
        let Some(row) = self.subscriptions.get_mut(&topic) else {
            settle(
                &request.promise,
                Err(ClientError::NotSubscribed(topic.to_string())),
            );
            return;
        };
        if row.state == SubscriptionState::Established && row.pending.is_empty() {
            row.state = SubscriptionState::Detaching;
            let zero_ttl = request.zero_ttl;
            row.unsubscribing = Some(request);

            let handle = self.handle.clone();
            let promise = Promise::new();
            let response_topic = topic.clone();
            let _ = promise.on_complete(move |result| {
                handle.post(InternalMessage::UnsubscribeResponse {
                    connection,
                    topic: response_topic,
                    result,
                });
            });
            debug!(%topic, zero_ttl, "Unsubscribing");
            self.services
                .connection
                .unsubscribe(connection, topic, zero_ttl, promise);
        } else {
            trace!(%topic, state = %row.state, "Queueing unsubscribe behind in-flight operation");
            row.pending.push_back(Work::Unsubscribe(request));
        }
    }

    /// Re-executes operations that queued behind a settled one, in order.
    fn replay_row(&mut self, queued: VecDeque<Work>) {
        for work in queued {
            self.on_work(work);
        }
    }

    // Responses

    fn is_current(&self, connection: ConnectionId) -> bool {
        self.connection == Some(connection)
    }

    fn on_endpoint_response(&mut self, result: Result<EndpointLookup, ClientError>) {
        match result {
            Ok(EndpointLookup::Found(endpoint)) => {
                debug!(endpoint = %endpoint, "Endpoint found");
                self.endpoint = Some(endpoint);
                self.fire(Trigger::EndpointFound);
            }
            Ok(EndpointLookup::RetryAfter(delay)) => {
                self.retry_delay = delay;
                self.fire(Trigger::EndpointRetry);
            }
            Err(e) => {
                warn!(error = %e, "Endpoint lookup failed permanently");
                self.record_error(&e);
                self.fire(Trigger::EndpointFatal);
            }
        }
    }

    fn on_open_response(&mut self, connection: ConnectionId, result: Result<(), ClientError>) {
        if !self.is_current(connection) {
            trace!(%connection, "Ignoring open response for superseded connection");
            return;
        }
        match result {
            Ok(()) => {
                info!(%connection, "Connection open");
                self.fire(Trigger::OpenSucceeded);
            }
            Err(e) => {
                self.connection = None;
                self.record_error(&e);
                if e.is_retryable() {
                    warn!(%connection, error = %e, "Connection failed, will retry");
                    self.fire(Trigger::OpenRetryable);
                } else {
                    error!(%connection, error = %e, "Connection failed permanently");
                    self.fire(Trigger::OpenFatal);
                }
            }
        }
    }

    fn on_send_response(&mut self, connection: ConnectionId, id: u64, result: Result<(), ClientError>) {
        match self.outstanding.get(&id) {
            Some(send) if send.connection == connection => {}
            _ => {
                trace!(id, "Ignoring response for unknown send");
                return;
            }
        }
        if let Err(e) = &result {
            if e.is_retryable() {
                // The disconnect that follows decides this send's fate.
                trace!(id, error = %e, "Send failed with network error");
                return;
            }
        }
        if let Some(send) = self.outstanding.remove(&id) {
            self.finish_send(&send.request.promise, result);
        }
    }

    fn on_subscribe_response(
        &mut self,
        connection: ConnectionId,
        topic: SubscriptionTopic,
        result: Result<(), ClientError>,
    ) {
        if !self.is_current(connection) {
            trace!(%topic, "Ignoring subscribe response for superseded connection");
            return;
        }
        let Some(row) = self.subscriptions.get_mut(&topic) else {
            warn!(%topic, "Subscribe response for unknown subscription");
            return;
        };
        if matches!(&result, Err(e) if e.is_retryable()) {
            trace!(%topic, "Subscribe failed with network error, awaiting disconnect");
            return;
        }
        if self.state.is_stopping() {
            // Cleanup fails the row's promises once the connection is closed.
            trace!(%topic, "Subscribe response while stopping");
            if std::mem::replace(&mut row.remaking, false) {
                self.remake_settled();
            }
            return;
        }

        if row.remaking {
            row.remaking = false;
            match result {
                Ok(()) => {
                    row.state = SubscriptionState::Established;
                    row.established_once = true;
                    for promise in row.awaiting.drain(..) {
                        settle(&promise, Ok(()));
                    }
                }
                Err(e) => {
                    warn!(%topic, error = %e, "Re-subscribe failed, dropping subscription");
                    if let Some(mut row) = self.subscriptions.remove(&topic) {
                        for promise in row.take_promises() {
                            settle(&promise, Err(e.clone()));
                        }
                        let listener = row.listener.clone();
                        self.dispatch.run(Box::new(move || {
                            listener.on_unsubscribed(&topic, Some(e));
                        }));
                    }
                }
            }
            self.remake_settled();
            return;
        }

        let promise = row.subscribing.take();
        match result {
            Ok(()) => {
                debug!(%topic, "Subscribed");
                row.state = SubscriptionState::Established;
                row.established_once = true;
                if let Some(promise) = promise {
                    settle(&promise, Ok(()));
                }
                let queued = std::mem::take(&mut row.pending);
                self.replay_row(queued);
            }
            Err(e) => {
                warn!(%topic, error = %e, "Subscribe rejected");
                if let Some(promise) = promise {
                    settle(&promise, Err(e));
                }
                if let Some(mut row) = self.subscriptions.remove(&topic) {
                    let queued = std::mem::take(&mut row.pending);
                    self.replay_row(queued);
                }
            }
        }
    }

    fn remake_settled(&mut self) {
        self.remakes_outstanding = self.remakes_outstanding.saturating_sub(1);
        if self.remakes_outstanding == 0 {
            self.handle.post(InternalMessage::SubscriptionsRemade);
        }
    }

    fn on_unsubscribe_response(
        &mut self,
        connection: ConnectionId,
        topic: SubscriptionTopic,
        result: Result<(), ClientError>,
    ) {
        if !self.is_current(connection) {
            trace!(%topic, "Ignoring unsubscribe response for superseded connection");
            return;
        }
        if matches!(&result, Err(e) if e.is_retryable()) {
            trace!(%topic, "Unsubscribe failed with network error, awaiting disconnect");
            return;
        }
        if self.state.is_stopping() {
            trace!(%topic, "Unsubscribe response while stopping");
            return;
        }
        let Some(row) = self.subscriptions.get_mut(&topic) else {
            warn!(%topic, "Unsubscribe response for unknown subscription");
            return;
        };
        let request = row.unsubscribing.take();
        match result {
            Ok(()) => {
                debug!(%topic, "Unsubscribed");
                if let Some(mut row) = self.subscriptions.remove(&topic) {
                    if let Some(request) = request {
                        settle(&request.promise, Ok(()));
                    }
                    let listener = row.listener.clone();
                    let notified = topic.clone();
                    self.dispatch
                        .run(Box::new(move || listener.on_unsubscribed(&notified, None)));
                    let queued = std::mem::take(&mut row.pending);
                    self.replay_row(queued);
                }
            }
            Err(e) => {
                warn!(%topic, error = %e, "Unsubscribe rejected");
                row.state = SubscriptionState::Established;
                if let Some(request) = request {
                    settle(&request.promise, Err(e));
                }
                let queued = std::mem::take(&mut row.pending);
                self.replay_row(queued);
            }
        }
    }

    fn on_timer_response(&mut self, timer: u64, popped: bool) {
        match &self.timer {
            Some(current) if current.id() == timer => self.timer = None,
            _ => {
                trace!(timer, "Ignoring response from stale timer");
                return;
            }
        }
        self.fire(if popped {
            Trigger::TimerPopped
        } else {
            Trigger::TimerCancelled
        });
    }

    fn on_delivery(&mut self, connection: ConnectionId, message: InboundMessage) {
        if !self.is_current(connection) {
            trace!(%connection, "Dropping delivery from superseded connection");
            return;
        }
        let Some(row) = self.subscriptions.get(&message.subscription) else {
            warn!(subscription = %message.subscription, "Delivery for unknown subscription");
            return;
        };
        let listener = row.listener.clone();
        let pending = PendingDelivery {
            connection,
            tag: message.tag,
        };
        let auto_confirm = message.qos == QoS::AtLeastOnce && row.params.auto_confirm;
        let confirmation = (message.qos == QoS::AtLeastOnce && !row.params.auto_confirm).then(|| {
            let id = self.confirmations.track(pending);
            let handle = self.handle.clone();
            let dispatch = self.dispatch.clone();
            ConfirmHandle::new(
                id,
                Arc::new(move |id| {
                    let promise = Promise::dispatched(dispatch.clone());
                    handle.post(InternalMessage::Confirm {
                        id,
                        promise: promise.clone(),
                    });
                    promise
                }),
            )
        });

        let delivery = Delivery::from_inbound(message, confirmation);
        trace!(topic = %delivery.topic(), qos = %delivery.qos(), "Dispatching delivery");
        let task = Box::new(move || {
            if delivery.is_malformed() {
                listener.on_malformed(delivery);
            } else {
                listener.on_message(delivery);
            }
        });

        let handle = self.handle.clone();
        let completion = Promise::new();
        let _ = completion.on_complete(move |result: Result<(), ClientError>| match result {
            Ok(()) if auto_confirm => {
                handle.post(InternalMessage::AutoConfirm(pending));
            }
            Ok(()) => {}
            Err(e) => {
                handle.post(InternalMessage::CallbackFailed(e));
            }
        });
        self.dispatch.run_with(task, completion);
    }

    fn on_disconnected(&mut self, connection: ConnectionId, cause: ClientError) {
        if !self.is_current(connection) {
            trace!(%connection, "Ignoring disconnect of superseded connection");
            return;
        }
        self.record_error(&cause);
        if cause.is_fatal() {
            error!(%connection, error = %cause, "Connection ended by fatal error");
            self.fire(Trigger::Replaced);
        } else {
            warn!(%connection, error = %cause, "Connection lost");
            self.fire(Trigger::NetworkError);
        }
    }

    fn on_confirm(&mut self, id: u64, promise: Promise<()>) {
        match self.confirmations.take(id) {
            Some(pending) => {
                self.acknowledge(pending);
                settle(&promise, Ok(()));
            }
            None => {
                warn!(delivery = id, "Confirm after the delivering connection was lost");
                settle(
                    &promise,
                    Err(ClientError::State(
                        "connection lost since the delivery arrived, it can no longer be confirmed"
                            .into(),
                    )),
                );
            }
        }
    }

    fn acknowledge(&self, pending: PendingDelivery) {
        if self.is_current(pending.connection) {
            self.services.connection.confirm(pending.connection, pending.tag);
        } else {
            trace!(connection = %pending.connection, "Dropping confirm for superseded connection");
        }
    }
}

impl Actor for Orchestrator {
    type Message = InternalMessage;

    fn on_receive(&mut self, message: InternalMessage) -> Result<(), ClientError> {
        trace!(message = message.name(), state = %self.state, "Handling message");
        match message {
            InternalMessage::Start(promise) => {
                self.pending_starts.extend(promise);
                self.fire(Trigger::Start);
            }
            InternalMessage::Stop(promise) => {
                self.pending_stops.push(promise);
                self.stopped_by_user = true;
                self.fire(Trigger::Stop);
            }
            InternalMessage::Work(work) => self.on_work(work),
            InternalMessage::EndpointResponse(result) => self.on_endpoint_response(result),
            InternalMessage::OpenResponse { connection, result } => {
                self.on_open_response(connection, result)
            }
            InternalMessage::CloseResponse { connection } => {
                if self.is_current(connection) {
                    self.connection = None;
                    self.fire(Trigger::ConnectionClosed);
                }
            }
            InternalMessage::SendResponse {
                connection,
                id,
                result,
            } => self.on_send_response(connection, id, result),
            InternalMessage::SubscribeResponse {
                connection,
                topic,
                result,
            } => self.on_subscribe_response(connection, topic, result),
            InternalMessage::UnsubscribeResponse {
                connection,
                topic,
                result,
            } => self.on_unsubscribe_response(connection, topic, result),
            InternalMessage::TimerResponse { timer, popped } => self.on_timer_response(timer, popped),
            InternalMessage::Delivery {
                connection,
                message,
            } => self.on_delivery(connection, message),
            InternalMessage::Disconnected { connection, cause } => {
                self.on_disconnected(connection, cause)
            }
            InternalMessage::Confirm { id, promise } => self.on_confirm(id, promise),
            InternalMessage::AutoConfirm(pending) => self.acknowledge(pending),
            InternalMessage::FlushComplete => self.fire(Trigger::CallbacksFlushed),
            InternalMessage::SubscriptionsRemade => self.fire(Trigger::SubscriptionsRemade),
            InternalMessage::CallbackFailed(cause) => {
                error!(error = %cause, "Application callback failed, stopping client");
                self.record_error(&cause);
                self.fire(Trigger::Stop);
            }
        }
        Ok(())
    }
}
