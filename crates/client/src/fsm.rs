//! Protocol state machine.
//!
//! The machine is a pure function from `(state, trigger)` to the next state
//! plus an ordered list of actions. The orchestrator updates its state first
//! and then performs the actions in order, so an action always observes the
//! destination state. Because the action list is chosen per transition, two
//! triggers arriving in the same state can have different side effects.
//!
//! State families:
//!
//! ```text
//! Starting   StartingLookup, StartingOpen
//! Retry A    RetryAWait, RetryALookup, RetryAOpen       (never started yet)
//! Started    Started
//! Retry B    RetryBWait, RetryBLookup, RetryBOpen,      (lost a connection)
//!            RetryBRemaking
//! Stopping   StoppingLookup, StoppingOpen, StoppingTimer,
//!            StoppingRemake, StoppingClose, StoppingFlush
//! Stopped    Stopped
//! ```
//!
//! Each stopping state records which asynchronous operation was outstanding
//! when stop was requested, because that decides what must be awaited or
//! cancelled before cleanup can run.

use std::fmt;

use super::state::ClientState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Stopped,
    StartingLookup,
    StartingOpen,
    RetryAWait,
    RetryALookup,
    RetryAOpen,
    Started,
    RetryBWait,
    RetryBLookup,
    RetryBOpen,
    /// Reconnected, re-subscribing every tracked destination.
    RetryBRemaking,
    StoppingLookup,
    StoppingOpen,
    StoppingTimer,
    StoppingRemake,
    StoppingClose,
    /// Waiting for queued application callbacks to run.
    StoppingFlush,
}

impl State {
    /// The coarse state applications see.
    pub fn public(&self) -> ClientState {
        use State::*;
        match self {
            Stopped => ClientState::Stopped,
            StartingLookup | StartingOpen => ClientState::Starting,
            RetryAWait | RetryALookup | RetryAOpen | RetryBWait | RetryBLookup | RetryBOpen
            | RetryBRemaking => ClientState::Retrying,
            Started => ClientState::Started,
            StoppingLookup | StoppingOpen | StoppingTimer | StoppingRemake | StoppingClose
            | StoppingFlush => ClientState::Stopping,
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.public() == ClientState::Stopping
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Start,
    Stop,
    EndpointFound,
    EndpointRetry,
    EndpointFatal,
    OpenSucceeded,
    OpenRetryable,
    OpenFatal,
    SubscriptionsRemade,
    NetworkError,
    Replaced,
    TimerPopped,
    TimerCancelled,
    ConnectionClosed,
    CallbacksFlushed,
}

/// Side effects of a transition, executed in list order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    RequestEndpoint,
    OpenConnection,
    CloseConnection,
    StartRetryTimer,
    CancelRetryTimer,
    MarkEndpointGood,
    RemakeInboundLinks,
    BreakInboundLinks,
    /// Forget the current connection without closing it: it is already gone.
    DiscardConnection,
    Cleanup,
    FlushCallbacks,
    ResetSession,
    SucceedPendingStarts,
    FailPendingStarts,
    SucceedPendingStops,
    ReplayPendingWork,
    NotifyStarting,
    NotifyStarted,
    NotifyRestarted,
    NotifyRetrying,
    NotifyStopped,
    /// The session is over; the callback service may drop its worker for
    /// this client once the queued callbacks have run.
    ReleaseCallbacks,
    /// A start arrived while stopping; begin again now that we are stopped.
    ResumeStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: State,
    pub actions: &'static [Action],
}

const fn go(to: State, actions: &'static [Action]) -> Option<Transition> {
    Some(Transition { to, actions })
}

const FLUSH: &[Action] = &[Action::Cleanup, Action::FlushCallbacks];
const FATAL: &[Action] = &[Action::FailPendingStarts, Action::Cleanup, Action::FlushCallbacks];

/// Looks up the transition for `trigger` in `state`.
///
/// Returns `None` for a trigger that has no meaning in `state`; the caller
/// logs and ignores it.
pub fn transition(state: State, trigger: Trigger) -> Option<Transition> {
    use Action::*;
    use State::*;
    use Trigger as T;

    match (state, trigger) {
        // Start
        (Stopped, T::Start) => go(StartingLookup, &[ResetSession, NotifyStarting, RequestEndpoint]),
        (Started, T::Start) => go(Started, &[SucceedPendingStarts]),
        (s, T::Start) => go(s, &[]),

        // Stop
        (Stopped, T::Stop) => go(Stopped, &[SucceedPendingStops]),
        (StartingLookup | RetryALookup | RetryBLookup, T::Stop) => {
            go(StoppingLookup, &[FailPendingStarts])
        }
        (StartingOpen | RetryAOpen | RetryBOpen, T::Stop) => go(StoppingOpen, &[FailPendingStarts]),
        (RetryAWait | RetryBWait, T::Stop) => {
            go(StoppingTimer, &[FailPendingStarts, CancelRetryTimer])
        }
        (Started, T::Stop) => go(StoppingClose, &[FailPendingStarts, CloseConnection]),
        (RetryBRemaking, T::Stop) => go(StoppingRemake, &[FailPendingStarts]),
        // A later stop overrides a start queued while stopping.
        (s, T::Stop) if s.is_stopping() => go(s, &[FailPendingStarts]),

        // Endpoint lookup
        (StartingLookup, T::EndpointFound) => go(StartingOpen, &[OpenConnection]),
        (RetryALookup, T::EndpointFound) => go(RetryAOpen, &[OpenConnection]),
        (RetryBLookup, T::EndpointFound) => go(RetryBOpen, &[OpenConnection]),
        (StartingLookup | RetryALookup, T::EndpointRetry) => {
            go(RetryAWait, &[NotifyRetrying, StartRetryTimer])
        }
        (RetryBLookup, T::EndpointRetry) => go(RetryBWait, &[NotifyRetrying, StartRetryTimer]),
        (StartingLookup | RetryALookup | RetryBLookup, T::EndpointFatal) => go(StoppingFlush, FATAL),
        (StoppingLookup, T::EndpointFound | T::EndpointRetry | T::EndpointFatal) => {
            go(StoppingFlush, FLUSH)
        }

        // Connection open
        (StartingOpen | RetryAOpen, T::OpenSucceeded) => go(
            Started,
            &[MarkEndpointGood, SucceedPendingStarts, NotifyStarted, ReplayPendingWork],
        ),
        (RetryBOpen, T::OpenSucceeded) => go(RetryBRemaking, &[MarkEndpointGood, RemakeInboundLinks]),
        (StartingOpen | RetryAOpen, T::OpenRetryable) => {
            go(RetryALookup, &[NotifyRetrying, RequestEndpoint])
        }
        (RetryBOpen, T::OpenRetryable) => go(RetryBLookup, &[NotifyRetrying, RequestEndpoint]),
        (StartingOpen | RetryAOpen | RetryBOpen, T::OpenFatal) => go(StoppingFlush, FATAL),
        (StoppingOpen, T::OpenSucceeded) => go(StoppingClose, &[CloseConnection]),
        (StoppingOpen, T::OpenRetryable | T::OpenFatal) => go(StoppingFlush, FLUSH),

        // Connection lost before its open was acknowledged
        (StartingOpen | RetryAOpen, T::NetworkError) => {
            go(RetryALookup, &[DiscardConnection, NotifyRetrying, RequestEndpoint])
        }
        (RetryBOpen, T::NetworkError) => {
            go(RetryBLookup, &[DiscardConnection, NotifyRetrying, RequestEndpoint])
        }
        (StartingOpen | RetryAOpen | RetryBOpen, T::Replaced) => go(
            StoppingFlush,
            &[DiscardConnection, FailPendingStarts, Cleanup, FlushCallbacks],
        ),
        (StoppingOpen, T::NetworkError | T::Replaced) => {
            go(StoppingFlush, &[DiscardConnection, Cleanup, FlushCallbacks])
        }

        // Retry timer
        (RetryAWait, T::TimerPopped) => go(RetryALookup, &[RequestEndpoint]),
        (RetryBWait, T::TimerPopped) => go(RetryBLookup, &[RequestEndpoint]),
        (StoppingTimer, T::TimerPopped | T::TimerCancelled) => go(StoppingFlush, FLUSH),

        // Established connection
        (Started | RetryBRemaking, T::NetworkError) => go(
            RetryBLookup,
            &[BreakInboundLinks, DiscardConnection, NotifyRetrying, RequestEndpoint],
        ),
        (Started | RetryBRemaking, T::Replaced) => {
            go(StoppingClose, &[FailPendingStarts, CloseConnection])
        }
        (RetryBRemaking, T::SubscriptionsRemade) => go(
            Started,
            &[SucceedPendingStarts, NotifyRestarted, ReplayPendingWork],
        ),
        (StoppingRemake, T::SubscriptionsRemade) => go(StoppingClose, &[CloseConnection]),
        (StoppingRemake, T::NetworkError) => go(
            StoppingFlush,
            &[BreakInboundLinks, DiscardConnection, Cleanup, FlushCallbacks],
        ),
        (StoppingRemake, T::Replaced) => go(StoppingClose, &[CloseConnection]),
        (StoppingClose, T::ConnectionClosed | T::NetworkError | T::Replaced) => {
            go(StoppingFlush, FLUSH)
        }

        // Flush
        (StoppingFlush, T::CallbacksFlushed) => {
            go(
                Stopped,
                &[SucceedPendingStops, NotifyStopped, ReleaseCallbacks, ResumeStart],
            )
        }

        _ => None,
    }
}
