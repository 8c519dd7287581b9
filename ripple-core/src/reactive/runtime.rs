//! Reactive Runtime
//!
//! The runtime is the central coordinator between a source that changed and
//! the computations that depend on it. Every notification raised by a
//! [`SubscriberSet`](super::subscriber::SubscriberSet) passes through
//! [`Runtime::dispatch`], which either delivers it immediately or defers it
//! to the end of the current batch.
//!
//! # Batching
//!
//! 1. `batch` increments a thread-local nesting depth and runs the closure.
//!
//! 2. While the depth is non-zero, notifications are queued, keyed by their
//!    target. A target notified several times keeps its first queue position
//!    and is delivered once.
//!
//! 3. When the outermost batch exits, the queue is flushed in enqueue order.
//!    Callbacks read their source's value at flush time, so `a.set(1);
//!    a.set(2)` inside one batch produces one delivery observing `2`.
//!
//! Writes are not transactional: if the closure panics, every value it wrote
//! stays written and the queue is flushed before the panic resumes.
//!
//! # Failure Isolation
//!
//! Each delivery runs under `catch_unwind`. A panicking subscriber is logged
//! and the remaining subscribers of the same pass still run, so a write never
//! panics because of one of its consumers.
//!
//! # Threads
//!
//! Batch state is thread-local, like the context stack: each thread batches
//! its own writes, and a flush delivers on the thread that opened the batch.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use indexmap::IndexMap;

use super::context::ReactiveContext;
use super::error::panic_message;
use super::subscriber::{Subscriber, SubscriberId};

thread_local! {
    static BATCH: RefCell<BatchState> = RefCell::new(BatchState::default());
}

/// Per-thread batching state.
#[derive(Default)]
struct BatchState {
    /// Number of `batch` calls currently on the stack.
    depth: usize,
    /// Deferred notifications, keyed by target, in first-enqueue order.
    queue: IndexMap<SubscriberId, Subscriber>,
}

/// The reactive runtime.
///
/// A namespace for the scheduling operations; all state lives in
/// thread-locals.
pub struct Runtime;

impl Runtime {
    /// Run `f` as a batch and flush deferred notifications when the
    /// outermost batch exits.
    ///
    /// If `f` panics, the queue is still flushed (when this is the
    /// outermost batch) and the panic then resumes in the caller.
    pub fn batch<R>(f: impl FnOnce() -> R) -> R {
        let depth = BATCH.with(|state| {
            let mut state = state.borrow_mut();
            state.depth += 1;
            state.depth
        });
        tracing::trace!(depth, "batch entered");

        let outcome = panic::catch_unwind(AssertUnwindSafe(f));

        let outermost = BATCH.with(|state| {
            let mut state = state.borrow_mut();
            state.depth -= 1;
            state.depth == 0
        });

        if outermost {
            Self::flush();
        }

        match outcome {
            Ok(value) => value,
            Err(payload) => {
                tracing::debug!(depth, "batch body panicked; pending notifications flushed");
                panic::resume_unwind(payload)
            }
        }
    }

    /// Whether a batch is open on this thread.
    pub fn is_batching() -> bool {
        Self::batch_depth() > 0
    }

    /// Current batch nesting depth on this thread.
    pub fn batch_depth() -> usize {
        BATCH.with(|state| state.borrow().depth)
    }

    /// Number of distinct targets waiting for the current batch to flush.
    pub fn pending_notifications() -> usize {
        BATCH.with(|state| state.borrow().queue.len())
    }

    /// Route one notification: queue it inside a batch, deliver it now
    /// otherwise.
    pub(crate) fn dispatch(subscriber: Subscriber) {
        let deferred = BATCH.with(|state| {
            let mut state = state.borrow_mut();
            if state.depth == 0 {
                return None;
            }
            match state.queue.get_mut(&subscriber.target()) {
                // The target re-subscribed since it was queued (a recompute
                // inside the batch); the old slot would be skipped at flush.
                Some(queued) if !queued.is_active() => *queued = subscriber.clone(),
                Some(_) => {}
                None => {
                    state.queue.insert(subscriber.target(), subscriber.clone());
                }
            }
            Some(state.queue.len())
        });

        match deferred {
            Some(pending) => {
                tracing::trace!(subscriber = %subscriber.target(), pending, "notification deferred");
            }
            None => Self::deliver(&subscriber),
        }
    }

    /// Drain the queue, delivering each target once.
    fn flush() {
        loop {
            let pending = BATCH.with(|state| std::mem::take(&mut state.borrow_mut().queue));
            if pending.is_empty() {
                break;
            }

            tracing::debug!(pending = pending.len(), "flushing batch");
            for subscriber in pending.into_values() {
                Self::deliver(&subscriber);
            }
        }
    }

    /// Invoke one subscriber with tracking suspended, isolating panics.
    fn deliver(subscriber: &Subscriber) {
        if !subscriber.is_active() {
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            ReactiveContext::untracked(|| subscriber.notify())
        }));

        if let Err(payload) = outcome {
            tracing::error!(
                subscriber = %subscriber.target(),
                panic = %panic_message(&*payload),
                "subscriber panicked during notification"
            );
        }
    }
}

/// Run `f` as a batch: writes inside it notify once, after the outermost
/// batch exits.
///
/// ```rust,ignore
/// let a = create_signal(0);
/// let b = create_signal(0);
///
/// batch(|| {
///     a.set(1);
///     b.set(1);
/// });
/// // Effects reading both `a` and `b` ran once.
/// ```
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    Runtime::batch(f)
}

/// Whether a batch is open on this thread.
pub fn is_batching() -> bool {
    Runtime::is_batching()
}
