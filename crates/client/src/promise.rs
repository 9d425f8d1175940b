//! Single-assignment completion objects.
//!
//! A [`Promise`] is completed exactly once with `succeed` or `fail`; a second
//! completion is a programming error reported as
//! [`ClientError::AlreadyCompleted`]. One listener may be attached before or
//! after completion. A result that arrives before the listener is stored and
//! handed over on attach; a result nobody listens for is dropped.
//!
//! Promises come in two flavours:
//! - **direct** promises run their listener on the completing thread. The
//!   client uses these internally, where the listener only posts a response
//!   message into the mailbox.
//! - **dispatched** promises hand their listener to the
//!   [`CallbackService`](crate::services::CallbackService). Every promise
//!   returned to the application is dispatched, so application code never
//!   runs on the thread that drives the protocol.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tracing::warn;

use super::{
    error::ClientError,
    mailbox::lock,
    services::{CallbackService, OrderingContext, Task},
};

type Listener<T> = Box<dyn FnOnce(Result<T, ClientError>) + Send + 'static>;
type FailureHook = Arc<dyn Fn(ClientError) + Send + Sync + 'static>;

static NEXT_PROMISE_ID: AtomicU64 = AtomicU64::new(1);

enum Slot<T> {
    Pending(Option<Listener<T>>),
    /// Holds the result until a listener takes it.
    Completed(Option<Result<T, ClientError>>),
}

struct Inner<T> {
    id: u64,
    slot: Mutex<Slot<T>>,
    dispatch: Option<CallbackDispatch>,
}

/// A single-assignment result with an optional completion listener.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Promise<T> {
    /// Creates a direct promise: its listener runs on the completing thread.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a promise whose listener is run by the callback service.
    pub fn dispatched(dispatch: CallbackDispatch) -> Self {
        Self::build(Some(dispatch))
    }

    fn build(dispatch: Option<CallbackDispatch>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_PROMISE_ID.fetch_add(1, Ordering::Relaxed),
                slot: Mutex::new(Slot::Pending(None)),
                dispatch,
            }),
        }
    }

    /// Process-unique identifier, usable as a key by service implementations.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_done(&self) -> bool {
        matches!(*lock(&self.inner.slot), Slot::Completed(_))
    }

    /// Completes the promise successfully.
    ///
    /// # Errors
    /// [`ClientError::AlreadyCompleted`] if the promise was already completed.
    pub fn succeed(&self, value: T) -> Result<(), ClientError> {
        self.complete(Ok(value))
    }

    /// Completes the promise with a failure.
    ///
    /// # Errors
    /// [`ClientError::AlreadyCompleted`] if the promise was already completed.
    pub fn fail(&self, error: ClientError) -> Result<(), ClientError> {
        self.complete(Err(error))
    }

    /// Completes the promise with `result`.
    pub fn complete(&self, result: Result<T, ClientError>) -> Result<(), ClientError> {
        let listener = {
            let mut slot = lock(&self.inner.slot);
            match &mut *slot {
                Slot::Completed(_) => return Err(ClientError::AlreadyCompleted),
                Slot::Pending(listener) => match listener.take() {
                    Some(listener) => {
                        *slot = Slot::Completed(None);
                        listener
                    }
                    None => {
                        *slot = Slot::Completed(Some(result));
                        return Ok(());
                    }
                },
            }
        };
        self.deliver(listener, result);
        Ok(())
    }

    /// Attaches the completion listener.
    ///
    /// If the promise is already complete the stored result is delivered
    /// straight away (through the callback service for dispatched promises).
    ///
    /// # Errors
    /// [`ClientError::State`] if a listener was already attached.
    pub fn on_complete<F>(&self, listener: F) -> Result<(), ClientError>
    where
        F: FnOnce(Result<T, ClientError>) + Send + 'static,
    {
        let result = {
            let mut slot = lock(&self.inner.slot);
            match &mut *slot {
                Slot::Pending(existing @ None) => {
                    *existing = Some(Box::new(listener) as Listener<T>);
                    return Ok(());
                }
                Slot::Completed(stored @ Some(_)) => stored.take(),
                Slot::Pending(Some(_)) | Slot::Completed(None) => None,
            }
        };
        match result {
            Some(result) => {
                self.deliver(Box::new(listener), result);
                Ok(())
            }
            None => Err(ClientError::State(
                "a listener is already attached to this promise".into(),
            )),
        }
    }

    fn deliver(&self, listener: Listener<T>, result: Result<T, ClientError>) {
        match &self.inner.dispatch {
            None => listener(result),
            Some(dispatch) => dispatch.run(Box::new(move || listener(result))),
        }
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(*lock(&self.inner.slot), Slot::Completed(_));
        f.debug_struct("Promise")
            .field("id", &self.inner.id)
            .field("done", &done)
            .field("dispatched", &self.inner.dispatch.is_some())
            .finish()
    }
}

/// Completes an internal promise, logging instead of failing on double
/// completion.
pub(crate) fn settle<T: Send + 'static>(promise: &Promise<T>, result: Result<T, ClientError>) {
    if let Err(e) = promise.complete(result) {
        warn!(promise = promise.id(), error = %e, "Ignoring second completion of promise");
    }
}

/// Routes work to a [`CallbackService`] under a fixed ordering context.
///
/// When a failure hook is installed, every task is run with a completion
/// promise whose failure (an application panic) is passed to the hook.
#[derive(Clone)]
pub struct CallbackDispatch {
    service: Arc<dyn CallbackService>,
    context: OrderingContext,
    on_failure: Option<FailureHook>,
}

impl CallbackDispatch {
    pub fn new(service: Arc<dyn CallbackService>, context: OrderingContext) -> Self {
        Self {
            service,
            context,
            on_failure: None,
        }
    }

    /// Installs the hook that receives callback failures.
    pub fn with_failure_hook(
        mut self,
        hook: impl Fn(ClientError) + Send + Sync + 'static,
    ) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    pub fn context(&self) -> OrderingContext {
        self.context
    }

    /// Runs `task` through the callback service.
    pub fn run(&self, task: Task) {
        let completion = self.on_failure.clone().map(|hook| {
            let promise = Promise::new();
            // A fresh direct promise has no listener yet.
            let _ = promise.on_complete(move |result: Result<(), ClientError>| {
                if let Err(e) = result {
                    hook(e);
                }
            });
            promise
        });
        self.service.run(task, self.context, completion);
    }

    /// Runs `task`, then completes `completion` once it has finished.
    pub fn run_with(&self, task: Task, completion: Promise<()>) {
        self.service.run(task, self.context, Some(completion));
    }
}

impl fmt::Debug for CallbackDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDispatch")
            .field("context", &self.context)
            .field("has_failure_hook", &self.on_failure.is_some())
            .finish()
    }
}
