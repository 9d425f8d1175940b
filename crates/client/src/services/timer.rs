//! Timer service backed by the tokio runtime.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::TimerService;
use crate::{
    error::ClientError,
    mailbox::lock,
    promise::{settle, Promise},
};

/// Runs each timer as a task on a tokio runtime.
///
/// Every scheduled promise owns a [`CancellationToken`]; whichever of the
/// sleep and the token finishes first decides how the promise completes.
#[derive(Debug, Clone)]
pub struct TokioTimerService {
    runtime: Handle,
    timers: Arc<Mutex<HashMap<u64, CancellationToken>>>,
}

impl TokioTimerService {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Uses the runtime of the calling context.
    ///
    /// # Errors
    /// [`ClientError::State`] when called outside a tokio runtime.
    pub fn current() -> Result<Self, ClientError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ClientError::State(format!("no tokio runtime: {e}")))
    }

    /// Number of timers that have neither popped nor been cancelled.
    pub fn active(&self) -> usize {
        lock(&self.timers).len()
    }
}

impl TimerService for TokioTimerService {
    fn schedule(&self, delay: Duration, promise: Promise<()>) {
        let token = CancellationToken::new();
        let id = promise.id();
        lock(&self.timers).insert(id, token.clone());
        trace!(timer = id, delay_ms = delay.as_millis() as u64, "Timer scheduled");

        let timers = self.timers.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    // A cancel that already removed the entry wins the race.
                    let popped = lock(&timers).remove(&id).is_some();
                    if popped {
                        trace!(timer = id, "Timer popped");
                        settle(&promise, Ok(()));
                    } else {
                        settle(&promise, Err(ClientError::Cancelled));
                    }
                }
                _ = token.cancelled() => {
                    trace!(timer = id, "Timer cancelled");
                    settle(&promise, Err(ClientError::Cancelled));
                }
            }
        });
    }

    fn cancel(&self, promise: &Promise<()>) {
        if let Some(token) = lock(&self.timers).remove(&promise.id()) {
            token.cancel();
        }
    }
}
