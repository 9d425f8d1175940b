//! Error handling for the non-blocking client.
//!
//! `ClientError` is the single error type surfaced by every public operation,
//! by every promise, and by every lifecycle notification. It is `Clone`
//! because one cause is routinely fanned out: a fatal connection error fails
//! every pending start request, is reported through `on_stopped`, and may be
//! remembered as the session's last error all at once.
//!
//! # Error Categories
//!
//! **State errors** (operation invalid for the current lifecycle state):
//! - `Stopped`, `AlreadySubscribed`, `NotSubscribed`, `State`,
//!   `AlreadyCompleted`, `Cancelled`
//!
//! **Argument errors** (surfaced synchronously, never queued):
//! - `Argument`, `Config`
//!
//! **Network errors** (trigger automatic retry unless stopping):
//! - `Network`, `RetryLimit`
//!
//! **Fatal errors** (always route to stop, never retried):
//! - `Security`, `Replaced`
//!
//! **Callback errors** (an application callback panicked):
//! - `Callback`
//!
//! # Usage
//!
//! ```ignore
//! match client.send("/kittens", "meow", SendOptions::default()) {
//!     Ok(sent) => { /* attach a listener to sent.promise */ }
//!     Err(e) if e.kind() == ErrorKind::State => eprintln!("client is stopped"),
//!     Err(e) => eprintln!("bad request: {e}"),
//! }
//! ```

use thiserror::Error;

use super::backoff::BackoffError;

/// Coarse classification of a [`ClientError`].
///
/// The protocol state machine only cares about the kind of a failure: network
/// failures are retried, security and replacement failures stop the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    State,
    Argument,
    Network,
    Security,
    Replaced,
    Callback,
}

/// The unified error type for client operations.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The client is stopping or stopped and cannot accept the request.
    #[error("Client is stopped: {0}")]
    Stopped(String),

    /// A subscription to the same pattern and share already exists.
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),

    /// No subscription to the pattern and share exists.
    #[error("Not subscribed to {0}")]
    NotSubscribed(String),

    /// The operation is invalid in the current state, e.g. confirming a
    /// delivery twice or after the connection it arrived on was lost.
    #[error("Invalid state: {0}")]
    State(String),

    /// A promise was completed more than once. This is a programming error.
    #[error("Promise already completed")]
    AlreadyCompleted,

    /// A scheduled timer was cancelled before it popped.
    #[error("Timer cancelled")]
    Cancelled,

    /// Invalid input: empty topic, non-zero unsubscribe ttl, colon in a share
    /// name, malformed client id.
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Client options failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level failure. Retried automatically unless stopping.
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication or TLS failure. Fatal.
    #[error("Security error: {0}")]
    Security(String),

    /// The server replaced this client with another instance using the same
    /// client id. Fatal.
    #[error("Replaced by another client instance: {0}")]
    Replaced(String),

    /// An application callback panicked.
    #[error("Callback error: {0}")]
    Callback(String),

    /// The endpoint service exhausted its retry policy.
    #[error("Retry policy error: {0}")]
    RetryLimit(#[from] BackoffError),
}

impl ClientError {
    /// Returns the coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Stopped(_)
            | ClientError::AlreadySubscribed(_)
            | ClientError::NotSubscribed(_)
            | ClientError::State(_)
            | ClientError::AlreadyCompleted
            | ClientError::Cancelled => ErrorKind::State,
            ClientError::Argument(_) | ClientError::Config(_) => ErrorKind::Argument,
            ClientError::Network(_) | ClientError::RetryLimit(_) => ErrorKind::Network,
            ClientError::Security(_) => ErrorKind::Security,
            ClientError::Replaced(_) => ErrorKind::Replaced,
            ClientError::Callback(_) => ErrorKind::Callback,
        }
    }

    /// True when the failure is worth another connection attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Network(_))
    }

    /// True when the failure must stop the client regardless of state.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Security | ErrorKind::Replaced)
    }

    pub(crate) fn stopped() -> Self {
        ClientError::Stopped("the client is stopped".into())
    }
}

impl From<validator::ValidationErrors> for ClientError {
    fn from(err: validator::ValidationErrors) -> Self {
        ClientError::Config(err.to_string())
    }
}
