//! Single-consumer FIFO mailbox.
//!
//! Every mutation of client state happens inside [`Actor::on_receive`], and the
//! mailbox guarantees that at most one `on_receive` call is running at any
//! instant. There is no dedicated thread: whichever thread posts into an idle
//! mailbox drains it, synchronously, until the queue is empty. Posts made while
//! a drain is in progress (from another thread, or re-entrantly from inside
//! `on_receive`) are appended and picked up by the active drain before it
//! exits.
//!
//! ```text
//!  post(a) ─┐                     ┌─> on_receive(a)
//!  post(b) ─┼─> [ a | b | c ] ────┼─> on_receive(b)   (one drainer at a time)
//!  post(c) ─┘                     └─> on_receive(c)
//! ```
//!
//! A failing or panicking handler is logged and the drain carries on with the
//! next message; an aborted drain would stall the whole session.

use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tracing::{error, trace};

use super::error::ClientError;

/// The message handler owned by a [`Mailbox`].
pub trait Actor: Send + 'static {
    type Message: Send + 'static;

    /// Handles one message. Runs with exclusive access to the actor's state.
    fn on_receive(&mut self, message: Self::Message) -> Result<(), ClientError>;
}

struct Queue<M> {
    messages: VecDeque<M>,
    draining: bool,
}

/// A FIFO queue with an at-most-one-concurrent-drain guarantee.
pub struct Mailbox<A: Actor> {
    queue: Mutex<Queue<A::Message>>,
    actor: Mutex<A>,
}

impl<A: Actor> Mailbox<A> {
    /// Creates a mailbox around an actor that does not need to post to itself.
    pub fn new(actor: A) -> Arc<Self> {
        Self::with_handle(|_| actor)
    }

    /// Creates a mailbox whose actor receives a [`MailboxHandle`] back to it,
    /// so that asynchronous responses can re-enter the same queue.
    pub fn with_handle(build: impl FnOnce(MailboxHandle<A>) -> A) -> Arc<Self> {
        Arc::new_cyclic(|weak| Mailbox {
            queue: Mutex::new(Queue {
                messages: VecDeque::new(),
                draining: false,
            }),
            actor: Mutex::new(build(MailboxHandle {
                inner: weak.clone(),
            })),
        })
    }

    /// Enqueues a message and drains the mailbox on the calling thread unless
    /// a drain is already in progress.
    pub fn post(&self, message: A::Message) {
        {
            let mut queue = lock(&self.queue);
            queue.messages.push_back(message);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        self.drain();
    }

    /// Number of messages waiting to be handled.
    pub fn pending(&self) -> usize {
        lock(&self.queue).messages.len()
    }

    /// Runs `f` against the actor's state between two messages.
    ///
    /// Intended for inspection from tests and diagnostics. Must not be called
    /// from inside `on_receive`.
    pub fn inspect<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        f(&lock(&self.actor))
    }

    fn drain(&self) {
        loop {
            let message = {
                let mut queue = lock(&self.queue);
                match queue.messages.pop_front() {
                    Some(message) => message,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            let mut actor = lock(&self.actor);
            match panic::catch_unwind(AssertUnwindSafe(|| actor.on_receive(message))) {
                Ok(Ok(())) => trace!("Mailbox message handled"),
                Ok(Err(e)) => error!(error = %e, "Mailbox handler failed, continuing drain"),
                Err(payload) => error!(
                    panic = %panic_message(payload.as_ref()),
                    "Mailbox handler panicked, continuing drain"
                ),
            }
        }
    }
}

impl<A: Actor> fmt::Debug for Mailbox<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("pending", &self.pending())
            .finish()
    }
}

/// A weak, cloneable reference used to post back into a mailbox.
///
/// Posting through a handle whose mailbox has been dropped is a no-op.
pub struct MailboxHandle<A: Actor> {
    inner: Weak<Mailbox<A>>,
}

impl<A: Actor> MailboxHandle<A> {
    /// Posts a message. Returns false if the mailbox no longer exists.
    pub fn post(&self, message: A::Message) -> bool {
        match self.inner.upgrade() {
            Some(mailbox) => {
                mailbox.post(message);
                true
            }
            None => {
                trace!("Dropping message posted to a closed mailbox");
                false
            }
        }
    }

    pub fn upgrade(&self) -> Option<Arc<Mailbox<A>>> {
        self.inner.upgrade()
    }
}

impl<A: Actor> Clone for MailboxHandle<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use tracing_test::traced_test;

    use super::*;

    enum Msg {
        Record(u32),
        RecordThenPost(u32, u32),
        Fail,
        Panic,
    }

    struct Recorder {
        seen: Arc<Mutex<Vec<u32>>>,
        handle: MailboxHandle<Recorder>,
        active: Arc<std::sync::atomic::AtomicUsize>,
        max_active: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Actor for Recorder {
        type Message = Msg;

        fn on_receive(&mut self, message: Msg) -> Result<(), ClientError> {
            use std::sync::atomic::Ordering;
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let result = match message {
                Msg::Record(n) => {
                    lock(&self.seen).push(n);
                    Ok(())
                }
                Msg::RecordThenPost(n, next) => {
                    lock(&self.seen).push(n);
                    self.handle.post(Msg::Record(next));
                    // Anything posted re-entrantly runs after this handler returns.
                    lock(&self.seen).push(n + 1000);
                    Ok(())
                }
                Msg::Fail => Err(ClientError::State("boom".into())),
                Msg::Panic => panic!("handler exploded"),
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn recorder() -> (Arc<Mailbox<Recorder>>, Arc<Mutex<Vec<u32>>>, Arc<std::sync::atomic::AtomicUsize>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let max_active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mailbox = Mailbox::with_handle({
            let seen = seen.clone();
            let max_active = max_active.clone();
            move |handle| Recorder {
                seen,
                handle,
                active: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
                max_active,
            }
        });
        (mailbox, seen, max_active)
    }

    #[test]
    fn test_messages_are_handled_in_post_order() {
        let (mailbox, seen, _) = recorder();
        for n in 0..10 {
            mailbox.post(Msg::Record(n));
        }
        assert_eq!(*lock(&seen), (0..10).collect::<Vec<_>>());
        assert_eq!(mailbox.pending(), 0);
    }

    #[test]
    fn test_reentrant_post_runs_after_current_message() {
        let (mailbox, seen, _) = recorder();
        mailbox.post(Msg::RecordThenPost(1, 2));
        assert_eq!(*lock(&seen), vec![1, 1001, 2]);
    }

    #[test]
    #[traced_test]
    fn test_failing_handler_does_not_stop_drain() {
        let (mailbox, seen, _) = recorder();
        mailbox.post(Msg::Fail);
        mailbox.post(Msg::Record(7));
        assert_eq!(*lock(&seen), vec![7]);
        assert!(logs_contain("Mailbox handler failed"));
    }

    #[test]
    #[traced_test]
    fn test_panicking_handler_does_not_stop_drain() {
        let (mailbox, seen, _) = recorder();
        mailbox.post(Msg::Panic);
        mailbox.post(Msg::Record(3));
        assert_eq!(*lock(&seen), vec![3]);
        assert!(logs_contain("handler exploded"));
    }

    #[test]
    fn test_concurrent_posts_never_overlap() {
        let (mailbox, seen, max_active) = recorder();
        let threads = 8;
        let per_thread = 200;
        let barrier = Arc::new(Barrier::new(threads));

        let joins: Vec<_> = (0..threads)
            .map(|t| {
                let mailbox = mailbox.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..per_thread {
                        mailbox.post(Msg::Record((t * per_thread + i) as u32));
                    }
                })
            })
            .collect();
        for join in joins {
            join.join().unwrap();
        }

        let seen = lock(&seen);
        assert_eq!(seen.len(), threads * per_thread);
        assert_eq!(max_active.load(std::sync::atomic::Ordering::SeqCst), 1);
        // Per-thread order survives interleaving.
        for t in 0..threads {
            let lo = (t * per_thread) as u32;
            let hi = lo + per_thread as u32;
            let mine: Vec<_> = seen.iter().copied().filter(|n| (lo..hi).contains(n)).collect();
            assert_eq!(mine, (lo..hi).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_handle_post_after_drop_is_noop() {
        let (mailbox, _, _) = recorder();
        let handle = mailbox.inspect(|actor| actor.handle.clone());
        drop(mailbox);
        assert!(!handle.post(Msg::Record(1)));
    }
}
