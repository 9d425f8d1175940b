//! Externally visible client lifecycle state.
//!
//! The protocol state machine has many internal states (see [`crate::fsm`]);
//! applications only see the five coarse states below. The current value is
//! published through a `tokio::sync::watch` channel so callers can await
//! changes without polling.
//!
//! # Examples
//!
//! ```ignore
//! let mut states = client.state_receiver();
//! while states.changed().await.is_ok() {
//!     println!("client is now {}", *states.borrow());
//! }
//! ```

use std::fmt;

/// Coarse lifecycle state of a client.
///
/// ```text
/// Stopped -> Starting -> Started <-> Retrying
///    ^          |           |           |
///    +------ Stopping <-----+-----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Looking up an endpoint or opening the first connection. Work submitted
    /// now is buffered until the client is started.
    Starting,

    /// Connected. Sends and subscription changes go straight to the server.
    Started,

    /// The connection was lost, or never came up, and the client is trying
    /// again. Work is buffered.
    Retrying,

    /// Shutting down. New work is rejected.
    Stopping,

    /// Not connected and not trying to be. New work is rejected.
    Stopped,
}

impl ClientState {
    /// Short identifier for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Starting => "Starting",
            ClientState::Started => "Started",
            ClientState::Retrying => "Retrying",
            ClientState::Stopping => "Stopping",
            ClientState::Stopped => "Stopped",
        }
    }

    /// Work is forwarded to the connection immediately.
    pub fn is_accepting_work(&self) -> bool {
        matches!(self, ClientState::Started)
    }

    /// Work is buffered and replayed once started.
    pub fn is_queueing_work(&self) -> bool {
        matches!(self, ClientState::Starting | ClientState::Retrying)
    }

    /// Work fails with [`ClientError::Stopped`](crate::ClientError::Stopped).
    pub fn is_rejecting_work(&self) -> bool {
        matches!(self, ClientState::Stopping | ClientState::Stopped)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
