//! Deterministic mock services for driving a client step by step.
//!
//! Nothing here spawns threads. Service calls are recorded and answered either
//! immediately (auto mode) or when the test says so. Application callbacks
//! are queued and only run on [`ManualCallbacks::run_all`], so tests control
//! exactly when listener code executes.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use skylark_client::{
    delivery::{Delivery, DestinationListener},
    services::{
        CallbackService, ConnectionEvents, ConnectionService, Endpoint, EndpointLookup,
        EndpointService, InboundMessage, InboundPayload, OpenRequest, OrderingContext,
        OutboundMessage, Services, SubscribeParams, Task, TimerService,
    },
    Client, ClientError, ClientListener, ClientOptions, ClientState, ConnectionId, DeliveryTag,
    Payload, Promise, Properties, QoS, SubscriptionTopic,
};

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn endpoint(host: &str) -> Endpoint {
    Endpoint::from_service(&format!("amqp://{host}"), &ClientOptions::default()).unwrap()
}

/// Result slot filled by a promise listener.
pub type Observed = Arc<Mutex<Option<Result<(), ClientError>>>>;

pub fn observe(promise: &Promise<()>) -> Observed {
    let slot: Observed = Arc::new(Mutex::new(None));
    let target = slot.clone();
    promise
        .on_complete(move |result| *lock(&target) = Some(result))
        .unwrap();
    slot
}

pub fn outcome(slot: &Observed) -> Option<Result<(), ClientError>> {
    lock(slot).clone()
}

// Endpoint service

#[derive(Default)]
struct EndpointState {
    manual: bool,
    script: VecDeque<Result<EndpointLookup, ClientError>>,
    waiting: VecDeque<Promise<EndpointLookup>>,
    lookups: usize,
    successes: Vec<Endpoint>,
}

/// Answers lookups from a script, falling back to `localhost`.
#[derive(Default)]
pub struct ScriptedEndpoints {
    state: Mutex<EndpointState>,
}

impl ScriptedEndpoints {
    /// Queues the answer for a future lookup.
    pub fn script(&self, answer: Result<EndpointLookup, ClientError>) {
        lock(&self.state).script.push_back(answer);
    }

    /// Holds lookups until [`ScriptedEndpoints::respond`] is called.
    pub fn hold(&self) {
        lock(&self.state).manual = true;
    }

    pub fn respond(&self, answer: Result<EndpointLookup, ClientError>) {
        let promise = lock(&self.state).waiting.pop_front();
        promise.expect("no lookup waiting").complete(answer).unwrap();
    }

    pub fn waiting(&self) -> usize {
        lock(&self.state).waiting.len()
    }

    pub fn lookups(&self) -> usize {
        lock(&self.state).lookups
    }

    pub fn successes(&self) -> Vec<Endpoint> {
        lock(&self.state).successes.clone()
    }
}

impl EndpointService for ScriptedEndpoints {
    fn lookup(&self, promise: Promise<EndpointLookup>) {
        let answer = {
            let mut state = lock(&self.state);
            state.lookups += 1;
            if state.manual {
                state.waiting.push_back(promise);
                return;
            }
            state
                .script
                .pop_front()
                .unwrap_or_else(|| Ok(EndpointLookup::Found(endpoint("localhost"))))
        };
        promise.complete(answer).unwrap();
    }

    fn on_success(&self, endpoint: &Endpoint) {
        lock(&self.state).successes.push(endpoint.clone());
    }
}

// Connection service

/// One recorded call. `promise` is `None` once answered.
pub struct Call<T> {
    pub connection: ConnectionId,
    pub value: T,
    promise: Option<Promise<()>>,
}

struct ConnectionState {
    auto_open: bool,
    auto_close: bool,
    auto_ack: bool,
    opens: Vec<Call<OpenRequest>>,
    closes: Vec<Call<()>>,
    sends: Vec<Call<OutboundMessage>>,
    subscribes: Vec<Call<SubscribeParams>>,
    unsubscribes: Vec<Call<(SubscriptionTopic, bool)>>,
    confirms: Vec<(ConnectionId, DeliveryTag)>,
}

/// Records every call. Opens and closes succeed immediately unless told
/// otherwise; sends and subscription changes wait for an explicit answer.
pub struct MockConnection {
    state: Mutex<ConnectionState>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self {
            state: Mutex::new(ConnectionState {
                auto_open: true,
                auto_close: true,
                auto_ack: false,
                opens: Vec::new(),
                closes: Vec::new(),
                sends: Vec::new(),
                subscribes: Vec::new(),
                unsubscribes: Vec::new(),
                confirms: Vec::new(),
            }),
        }
    }
}

fn answer<T>(calls: &mut [Call<T>], index: usize) -> Promise<()> {
    calls[index].promise.take().expect("call already answered")
}

impl MockConnection {
    pub fn manual_open(&self) {
        lock(&self.state).auto_open = false;
    }

    pub fn manual_close(&self) {
        lock(&self.state).auto_close = false;
    }

    /// Acknowledge sends and subscription changes immediately.
    pub fn auto_ack(&self) {
        lock(&self.state).auto_ack = true;
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens.len()
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes.len()
    }

    /// Event handle of the most recently opened connection.
    pub fn events(&self) -> ConnectionEvents {
        lock(&self.state)
            .opens
            .last()
            .expect("no connection opened")
            .value
            .events
            .clone()
    }

    pub fn current(&self) -> ConnectionId {
        self.events().connection()
    }

    pub fn respond_open(&self, index: usize, result: Result<(), ClientError>) {
        let promise = answer(&mut lock(&self.state).opens, index);
        promise.complete(result).unwrap();
    }

    pub fn respond_close(&self, index: usize) {
        let promise = answer(&mut lock(&self.state).closes, index);
        promise.succeed(()).unwrap();
    }

    pub fn sends(&self) -> Vec<(ConnectionId, String, QoS)> {
        lock(&self.state)
            .sends
            .iter()
            .map(|c| (c.connection, c.value.topic.clone(), c.value.qos))
            .collect()
    }

    pub fn payloads(&self) -> Vec<Payload> {
        lock(&self.state)
            .sends
            .iter()
            .map(|c| c.value.payload.clone())
            .collect()
    }

    pub fn respond_send(&self, index: usize, result: Result<(), ClientError>) {
        let promise = answer(&mut lock(&self.state).sends, index);
        promise.complete(result).unwrap();
    }

    pub fn subscribes(&self) -> Vec<(ConnectionId, SubscribeParams)> {
        lock(&self.state)
            .subscribes
            .iter()
            .map(|c| (c.connection, c.value.clone()))
            .collect()
    }

    pub fn respond_subscribe(&self, index: usize, result: Result<(), ClientError>) {
        let promise = answer(&mut lock(&self.state).subscribes, index);
        promise.complete(result).unwrap();
    }

    pub fn unsubscribes(&self) -> Vec<(ConnectionId, SubscriptionTopic, bool)> {
        lock(&self.state)
            .unsubscribes
            .iter()
            .map(|c| (c.connection, c.value.0.clone(), c.value.1))
            .collect()
    }

    pub fn respond_unsubscribe(&self, index: usize, result: Result<(), ClientError>) {
        let promise = answer(&mut lock(&self.state).unsubscribes, index);
        promise.complete(result).unwrap();
    }

    pub fn confirms(&self) -> Vec<(ConnectionId, DeliveryTag)> {
        lock(&self.state).confirms.clone()
    }

    /// Pushes a message from the server on the current connection.
    pub fn deliver(&self, pattern: &str, qos: QoS, tag: u64, payload: InboundPayload) {
        self.events().deliver(InboundMessage {
            subscription: SubscriptionTopic::new(pattern, None),
            topic: pattern.to_string(),
            qos,
            tag: DeliveryTag(tag),
            ttl: None,
            properties: Properties::new(),
            payload,
        });
    }

    pub fn deliver_text(&self, pattern: &str, qos: QoS, tag: u64, text: &'static str) {
        self.deliver(pattern, qos, tag, InboundPayload::Text(Bytes::from_static(text.as_bytes())));
    }

    /// Drops the current connection.
    pub fn disconnect(&self, cause: ClientError) {
        self.events().disconnected(cause);
    }

    fn record<T>(
        &self,
        pick: impl FnOnce(&mut ConnectionState) -> (&mut Vec<Call<T>>, bool),
        connection: ConnectionId,
        value: T,
        promise: Promise<()>,
    ) {
        let immediate = {
            let mut state = lock(&self.state);
            let (calls, auto) = pick(&mut state);
            if auto {
                calls.push(Call {
                    connection,
                    value,
                    promise: None,
                });
                Some(promise)
            } else {
                calls.push(Call {
                    connection,
                    value,
                    promise: Some(promise),
                });
                None
            }
        };
        if let Some(promise) = immediate {
            promise.succeed(()).unwrap();
        }
    }
}

impl ConnectionService for MockConnection {
    fn open(&self, request: OpenRequest, promise: Promise<()>) {
        let connection = request.connection;
        self.record(|s| (&mut s.opens, s.auto_open), connection, request, promise);
    }

    fn close(&self, connection: ConnectionId, promise: Promise<()>) {
        self.record(|s| (&mut s.closes, s.auto_close), connection, (), promise);
    }

    fn send(&self, connection: ConnectionId, message: OutboundMessage, promise: Promise<()>) {
        self.record(|s| (&mut s.sends, s.auto_ack), connection, message, promise);
    }

    fn subscribe(&self, connection: ConnectionId, params: SubscribeParams, promise: Promise<()>) {
        self.record(|s| (&mut s.subscribes, s.auto_ack), connection, params, promise);
    }

    fn unsubscribe(
        &self,
        connection: ConnectionId,
        topic: SubscriptionTopic,
        zero_ttl: bool,
        promise: Promise<()>,
    ) {
        self.record(
            |s| (&mut s.unsubscribes, s.auto_ack),
            connection,
            (topic, zero_ttl),
            promise,
        );
    }

    fn confirm(&self, connection: ConnectionId, tag: DeliveryTag) {
        lock(&self.state).confirms.push((connection, tag));
    }
}

// Timer service

#[derive(Default)]
pub struct ManualTimers {
    scheduled: Mutex<Vec<(Duration, Promise<()>)>>,
}

impl ManualTimers {
    pub fn delays(&self) -> Vec<Duration> {
        lock(&self.scheduled).iter().map(|(d, _)| *d).collect()
    }

    pub fn active(&self) -> usize {
        lock(&self.scheduled).iter().filter(|(_, p)| !p.is_done()).count()
    }

    /// Pops the most recently scheduled timer.
    pub fn pop(&self) {
        let promise = lock(&self.scheduled).last().map(|(_, p)| p.clone());
        promise.expect("no timer scheduled").succeed(()).unwrap();
    }
}

impl TimerService for ManualTimers {
    fn schedule(&self, delay: Duration, promise: Promise<()>) {
        lock(&self.scheduled).push((delay, promise));
    }

    fn cancel(&self, promise: &Promise<()>) {
        if !promise.is_done() {
            let _ = promise.fail(ClientError::Cancelled);
        }
    }
}

// Callback service

/// Queues callbacks until the test runs them.
#[derive(Default)]
pub struct ManualCallbacks {
    queue: Mutex<VecDeque<(Task, Option<Promise<()>>)>>,
    released: Mutex<Vec<OrderingContext>>,
}

impl ManualCallbacks {
    /// Contexts released so far, in order.
    pub fn released(&self) -> Vec<OrderingContext> {
        lock(&self.released).clone()
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Runs callbacks, including any queued while running, until none are
    /// left. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = lock(&self.queue).pop_front();
            let Some((task, completion)) = next else {
                return ran;
            };
            ran += 1;
            let result = panic::catch_unwind(AssertUnwindSafe(task)).map_err(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                ClientError::Callback(message)
            });
            if let Some(completion) = completion {
                completion.complete(result).unwrap();
            }
        }
    }
}

impl CallbackService for ManualCallbacks {
    fn run(&self, task: Task, _context: OrderingContext, completion: Option<Promise<()>>) {
        lock(&self.queue).push_back((task, completion));
    }

    fn release(&self, context: OrderingContext) {
        lock(&self.released).push(context);
    }
}

// Listeners

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
    panic_on_started: bool,
}

impl RecordingListener {
    pub fn panicking_on_started() -> Self {
        Self {
            panic_on_started: true,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.events).iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        lock(&self.events).push(event);
    }
}

impl ClientListener for RecordingListener {
    fn on_starting(&self) {
        self.push("starting".into());
    }

    fn on_started(&self) {
        self.push("started".into());
        if self.panic_on_started {
            panic!("listener refused to start");
        }
    }

    fn on_restarted(&self) {
        self.push("restarted".into());
    }

    fn on_retrying(&self, cause: Option<ClientError>) {
        match cause {
            Some(cause) => self.push(format!("retrying: {cause}")),
            None => self.push("retrying".into()),
        }
    }

    fn on_stopped(&self, cause: Option<ClientError>) {
        match cause {
            Some(cause) => self.push(format!("stopped: {cause}")),
            None => self.push("stopped".into()),
        }
    }

    fn on_drain(&self) {
        self.push("drain".into());
    }
}

#[derive(Default)]
pub struct RecordingDestination {
    pub messages: Mutex<Vec<Delivery>>,
    pub malformed: Mutex<Vec<Delivery>>,
    pub unsubscribed: Mutex<Vec<(SubscriptionTopic, Option<ClientError>)>>,
}

impl DestinationListener for RecordingDestination {
    fn on_message(&self, delivery: Delivery) {
        lock(&self.messages).push(delivery);
    }

    fn on_malformed(&self, delivery: Delivery) {
        lock(&self.malformed).push(delivery);
    }

    fn on_unsubscribed(&self, topic: &SubscriptionTopic, error: Option<ClientError>) {
        lock(&self.unsubscribed).push((topic.clone(), error));
    }
}

// Harness

pub struct Harness {
    pub client: Client,
    pub endpoints: Arc<ScriptedEndpoints>,
    pub connection: Arc<MockConnection>,
    pub timers: Arc<ManualTimers>,
    pub callbacks: Arc<ManualCallbacks>,
    pub listener: Arc<RecordingListener>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(ClientOptions::default().with_id("test_client"), RecordingListener::default())
    }

    pub fn build(options: ClientOptions, listener: RecordingListener) -> Self {
        let endpoints = Arc::new(ScriptedEndpoints::default());
        let connection = Arc::new(MockConnection::default());
        let timers = Arc::new(ManualTimers::default());
        let callbacks = Arc::new(ManualCallbacks::default());
        let listener = Arc::new(listener);
        let client = Client::new(
            options,
            Services {
                endpoint: endpoints.clone(),
                connection: connection.clone(),
                timer: timers.clone(),
                callback: callbacks.clone(),
            },
            listener.clone(),
        )
        .unwrap();
        Self {
            client,
            endpoints,
            connection,
            timers,
            callbacks,
            listener,
        }
    }

    /// Starts the client against auto-answering services.
    pub fn started() -> Self {
        let harness = Self::new();
        let started = observe(&harness.client.start());
        harness.callbacks.run_all();
        assert_eq!(harness.client.state(), ClientState::Started);
        assert!(matches!(outcome(&started), Some(Ok(()))));
        harness
    }

    /// Subscribes and acknowledges, leaving an established subscription.
    pub fn subscribed(&self, pattern: &str, qos: QoS, auto_confirm: bool) -> Arc<RecordingDestination> {
        let destination = Arc::new(RecordingDestination::default());
        let options = skylark_client::SubscribeOptions::default()
            .with_qos(qos)
            .with_auto_confirm(auto_confirm);
        let promise = self
            .client
            .subscribe(pattern, options, destination.clone())
            .unwrap();
        let done = observe(&promise);
        let index = self.connection.subscribes().len() - 1;
        self.connection.respond_subscribe(index, Ok(()));
        self.callbacks.run_all();
        assert!(matches!(outcome(&done), Some(Ok(()))));
        destination
    }

    pub fn stop(&self) -> Observed {
        let stopped = observe(&self.client.stop());
        self.callbacks.run_all();
        stopped
    }
}

pub fn network(reason: &str) -> ClientError {
    ClientError::Network(reason.to_string())
}
