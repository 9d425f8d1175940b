//! Per-destination subscription tracking.
//!
//! A row exists for a subscription topic from the first subscribe until a
//! successful unsubscribe. While a row has a subscribe or unsubscribe in
//! flight, further operations on the same topic wait in the row's pending
//! queue. When the in-flight operation settles, the orchestrator replays the
//! queue in order, which keeps per-destination operations in call order even
//! though the transport answers asynchronously.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::Arc,
};

use super::{
    delivery::DestinationListener,
    message::{UnsubscribeRequest, Work},
    promise::Promise,
    services::SubscribeParams,
    types::SubscriptionTopic,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// A subscribe request is in flight.
    Attaching,
    /// The server has acknowledged the subscription.
    Established,
    /// An unsubscribe request is in flight.
    Detaching,
    /// The connection was lost; the row is re-subscribed on reconnect.
    Broken,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) struct Subscription {
    pub state: SubscriptionState,
    pub params: SubscribeParams,
    pub listener: Arc<dyn DestinationListener>,
    /// Operations waiting for the in-flight one to settle.
    pub pending: VecDeque<Work>,
    /// Promise of the application subscribe currently in flight.
    pub subscribing: Option<Promise<()>>,
    /// Application unsubscribe currently in flight.
    pub unsubscribing: Option<UnsubscribeRequest>,
    /// Application subscribes interrupted by a disconnect. They complete when
    /// the row is re-established after reconnect.
    pub awaiting: Vec<Promise<()>>,
    /// The in-flight subscribe is a re-subscribe after reconnect.
    pub remaking: bool,
    /// The server has acknowledged this row at least once.
    pub established_once: bool,
}

impl Subscription {
    pub fn new(
        params: SubscribeParams,
        listener: Arc<dyn DestinationListener>,
        promise: Promise<()>,
    ) -> Self {
        Self {
            state: SubscriptionState::Attaching,
            params,
            listener,
            pending: VecDeque::new(),
            subscribing: Some(promise),
            unsubscribing: None,
            awaiting: Vec::new(),
            remaking: false,
            established_once: false,
        }
    }

    /// Idle: settled and nothing queued behind it.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
            && matches!(
                self.state,
                SubscriptionState::Established | SubscriptionState::Attaching
            )
    }

    /// Every application promise attached to this row, in flight or queued.
    pub fn take_promises(&mut self) -> Vec<Promise<()>> {
        let mut promises: Vec<_> = self.subscribing.take().into_iter().collect();
        promises.append(&mut self.awaiting);
        promises.extend(self.unsubscribing.take().map(|r| r.promise));
        promises.extend(self.pending.drain(..).map(|w| w.promise().clone()));
        promises
    }
}

/// All subscription rows, ordered by topic so re-subscribes are issued in a
/// stable order.
#[derive(Default)]
pub(crate) struct SubscriptionTracker {
    rows: BTreeMap<SubscriptionTopic, Subscription>,
}

impl SubscriptionTracker {
    pub fn get(&self, topic: &SubscriptionTopic) -> Option<&Subscription> {
        self.rows.get(topic)
    }

    pub fn get_mut(&mut self, topic: &SubscriptionTopic) -> Option<&mut Subscription> {
        self.rows.get_mut(topic)
    }

    pub fn insert(&mut self, row: Subscription) {
        self.rows.insert(row.params.topic.clone(), row);
    }

    pub fn remove(&mut self, topic: &SubscriptionTopic) -> Option<Subscription> {
        self.rows.remove(topic)
    }

    pub fn state_of(&self, topic: &SubscriptionTopic) -> Option<SubscriptionState> {
        self.rows.get(topic).map(|row| row.state)
    }

    /// Marks every row broken after a disconnect.
    ///
    /// Application subscribes in flight are kept on the row and complete once
    /// it is re-established. In-flight unsubscribes and queued operations are
    /// returned, in order, for replay once the client is started again.
    pub fn break_all(&mut self) -> Vec<Work> {
        let mut recovered = Vec::new();
        for row in self.rows.values_mut() {
            if let Some(promise) = row.subscribing.take() {
                row.awaiting.push(promise);
            }
            if let Some(request) = row.unsubscribing.take() {
                recovered.push(Work::Unsubscribe(request));
            }
            recovered.extend(row.pending.drain(..));
            row.state = SubscriptionState::Broken;
            row.remaking = false;
        }
        recovered
    }

    /// Moves every broken row back to attaching and returns the subscribe
    /// requests to re-issue.
    pub fn begin_remake(&mut self) -> Vec<SubscribeParams> {
        self.rows
            .values_mut()
            .filter(|row| row.state == SubscriptionState::Broken)
            .map(|row| {
                row.state = SubscriptionState::Attaching;
                row.remaking = true;
                row.params.clone()
            })
            .collect()
    }

    /// Removes and returns every row.
    pub fn take_all(&mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.rows).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{delivery::Delivery, message::SubscribeRequest, types::QoS};

    struct Ignore;
    impl DestinationListener for Ignore {
        fn on_message(&self, _delivery: Delivery) {}
    }

    fn params(pattern: &str) -> SubscribeParams {
        SubscribeParams {
            topic: SubscriptionTopic::new(pattern, None),
            qos: QoS::AtLeastOnce,
            credit: 10,
            auto_confirm: true,
            ttl_seconds: 0,
        }
    }

    fn row(pattern: &str) -> Subscription {
        Subscription::new(params(pattern), Arc::new(Ignore), Promise::new())
    }

    #[test]
    fn test_new_row_is_attaching_and_idle() {
        let row = row("/a");
        assert_eq!(row.state, SubscriptionState::Attaching);
        assert!(row.is_idle());
    }

    #[test]
    fn test_row_with_queue_is_not_idle() {
        let mut row = row("/a");
        row.pending.push_back(Work::Subscribe(SubscribeRequest {
            params: params("/a"),
            listener: Arc::new(Ignore),
            promise: Promise::new(),
        }));
        assert!(!row.is_idle());

        row.pending.clear();
        row.state = SubscriptionState::Detaching;
        assert!(!row.is_idle());
    }

    #[test]
    fn test_break_all_keeps_subscribes_and_recovers_queue() {
        let mut tracker = SubscriptionTracker::default();

        let mut attaching = row("/a");
        attaching.pending.push_back(Work::Unsubscribe(UnsubscribeRequest {
            topic: SubscriptionTopic::new("/a", None),
            zero_ttl: false,
            promise: Promise::new(),
        }));
        tracker.insert(attaching);

        let mut detaching = row("/b");
        detaching.subscribing = None;
        detaching.state = SubscriptionState::Detaching;
        detaching.unsubscribing = Some(UnsubscribeRequest {
            topic: SubscriptionTopic::new("/b", None),
            zero_ttl: true,
            promise: Promise::new(),
        });
        tracker.insert(detaching);

        let recovered = tracker.break_all();
        assert_eq!(recovered.len(), 2);
        assert!(recovered.iter().all(|w| w.kind() == "unsubscribe"));

        let a = tracker.get(&SubscriptionTopic::new("/a", None)).unwrap();
        assert_eq!(a.state, SubscriptionState::Broken);
        assert!(a.subscribing.is_none());
        assert_eq!(a.awaiting.len(), 1);
        assert_eq!(
            tracker.state_of(&SubscriptionTopic::new("/b", None)),
            Some(SubscriptionState::Broken)
        );
    }

    #[test]
    fn test_begin_remake_reattaches_broken_rows() {
        let mut tracker = SubscriptionTracker::default();
        tracker.insert(row("/b"));
        tracker.insert(row("/a"));
        tracker.break_all();

        let remade: Vec<_> = tracker
            .begin_remake()
            .into_iter()
            .map(|p| p.topic.pattern)
            .collect();
        assert_eq!(remade, vec!["/a", "/b"]);
        let a = tracker.get(&SubscriptionTopic::new("/a", None)).unwrap();
        assert!(a.remaking);
        assert_eq!(a.state, SubscriptionState::Attaching);
    }

    #[test]
    fn test_take_promises_collects_everything() {
        let mut row = row("/a");
        row.awaiting.push(Promise::new());
        row.pending.push_back(Work::Unsubscribe(UnsubscribeRequest {
            topic: SubscriptionTopic::new("/a", None),
            zero_ttl: false,
            promise: Promise::new(),
        }));
        assert_eq!(row.take_promises().len(), 3);
        assert!(row.take_promises().is_empty());
    }
}
