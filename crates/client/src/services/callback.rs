//! Callback service backed by the tokio runtime.
//!
//! Each [`OrderingContext`] gets its own worker: an unbounded queue drained by
//! one async task, which hands every callback to the blocking pool and waits
//! for it before taking the next. Callbacks for one client therefore run in
//! submission order, never concurrently, and never on the thread that
//! submitted them.
//!
//! Releasing a context closes its queue. The worker exits once the queue is
//! empty, and a worker started later for the same context waits for it first.

use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use super::{CallbackService, OrderingContext, Task};
use crate::{
    error::ClientError,
    mailbox::{lock, panic_message},
    promise::{settle, Promise},
};

type Job = (Task, Option<Promise<()>>);

#[derive(Debug)]
struct Worker {
    queue: mpsc::UnboundedSender<Job>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Workers {
    active: HashMap<OrderingContext, Worker>,
    /// Released workers that may still be draining.
    retired: HashMap<OrderingContext, JoinHandle<()>>,
}

#[derive(Debug)]
pub struct TokioCallbackService {
    runtime: Handle,
    workers: Mutex<Workers>,
    closed: AtomicBool,
}

impl TokioCallbackService {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            workers: Mutex::new(Workers::default()),
            closed: AtomicBool::new(false),
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

    /// Stops accepting callbacks. Callbacks already queued still run.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let workers = std::mem::take(&mut *lock(&self.workers));
        debug!(workers = workers.active.len(), "Callback service shut down");
    }

    /// Number of contexts with a live queue.
    pub fn active_contexts(&self) -> usize {
        lock(&self.workers).active.len()
    }

    fn spawn_worker(&self, context: OrderingContext, previous: Option<JoinHandle<()>>) -> Worker {
        let (queue, mut rx) = mpsc::unbounded_channel::<Job>();
        let runtime = self.runtime.clone();
        let task = self.runtime.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            while let Some((task, completion)) = rx.recv().await {
                let result = match runtime
                    .spawn_blocking(move || panic::catch_unwind(AssertUnwindSafe(task)))
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(payload)) => Err(ClientError::Callback(panic_message(payload.as_ref()))),
                    Err(e) => Err(ClientError::Callback(e.to_string())),
                };
                if let Err(e) = &result {
                    warn!(context = context.id(), error = %e, "Application callback failed");
                }
                if let Some(completion) = completion {
                    settle(&completion, result);
                }
            }
            debug!(context = context.id(), "Callback worker finished");
        });
        Worker { queue, task }
    }
}

impl CallbackService for TokioCallbackService {
    fn run(&self, task: Task, context: OrderingContext, completion: Option<Promise<()>>) {
        let rejected = {
            let mut workers = lock(&self.workers);
            if self.closed.load(Ordering::SeqCst) {
                Some((task, completion))
            } else {
                let Workers { active, retired } = &mut *workers;
                let worker = active
                    .entry(context)
                    .or_insert_with(|| self.spawn_worker(context, retired.remove(&context)));
                worker.queue.send((task, completion)).err().map(|e| e.0)
            }
        };
        if let Some((_task, completion)) = rejected {
            warn!(context = context.id(), "Callback rejected, service is shut down");
            if let Some(completion) = completion {
                settle(&completion, Err(ClientError::Stopped("callback service is shut down".into())));
            }
        }
    }

    fn release(&self, context: OrderingContext) {
        let mut workers = lock(&self.workers);
        workers.retired.retain(|_, task| !task.is_finished());
        if let Some(worker) = workers.active.remove(&context) {
            debug!(context = context.id(), "Callback context released");
            workers.retired.insert(context, worker.task);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;

    fn completion() -> (Promise<()>, oneshot::Receiver<Result<(), ClientError>>) {
        let (tx, rx) = oneshot::channel();
        let promise = Promise::new();
        promise
            .on_complete(move |result| {
                let _ = tx.send(result);
            })
            .unwrap();
        (promise, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callbacks_run_in_order_per_context() {
        let service = TokioCallbackService::current().unwrap();
        let context = OrderingContext::next();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..50 {
            let seen = seen.clone();
            service.run(Box::new(move || lock(&seen).push(n)), context, None);
        }
        let (done, rx) = completion();
        service.run(Box::new(|| {}), context, Some(done));

        assert!(rx.await.unwrap().is_ok());
        assert_eq!(*lock(&seen), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_callback_fails_completion() {
        let service = TokioCallbackService::current().unwrap();
        let context = OrderingContext::next();

        let (done, rx) = completion();
        service.run(Box::new(|| panic!("listener blew up")), context, Some(done));
        match rx.await.unwrap() {
            Err(ClientError::Callback(msg)) => assert!(msg.contains("listener blew up")),
            other => panic!("unexpected result: {other:?}"),
        }

        // The worker survives the panic.
        let (done, rx) = completion();
        service.run(Box::new(|| {}), context, Some(done));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_released_context_keeps_order_when_reused() {
        let service = TokioCallbackService::current().unwrap();
        let context = OrderingContext::next();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        {
            let seen = seen.clone();
            service.run(
                Box::new(move || {
                    let _ = gate_rx.recv();
                    lock(&seen).push("before release");
                }),
                context,
                None,
            );
        }
        service.release(context);
        assert_eq!(service.active_contexts(), 0);

        let (done, rx) = completion();
        {
            let seen = seen.clone();
            service.run(Box::new(move || lock(&seen).push("after release")), context, Some(done));
        }
        gate_tx.send(()).unwrap();

        assert!(rx.await.unwrap().is_ok());
        assert_eq!(*lock(&seen), vec!["before release", "after release"]);
        assert_eq!(service.active_contexts(), 1);
    }

    #[tokio::test]
    async fn test_run_after_shutdown_is_rejected() {
        let service = TokioCallbackService::current().unwrap();
        service.shutdown();

        let (done, rx) = completion();
        service.run(Box::new(|| panic!("must not run")), OrderingContext::next(), Some(done));
        assert!(matches!(rx.await.unwrap(), Err(ClientError::Stopped(_))));
    }
}
