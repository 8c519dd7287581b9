//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a signal or computed value
//! is read, it registers itself in the current computation's frame.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Running a computed value or an
//! effect pushes a frame, the body executes, and the frame's collected
//! dependencies are handed back when it is popped. Popping happens in the
//! guard's `Drop`, so the stack depth is restored even if the body panics.
//!
//! Nested computations (a computed value read from inside an effect, a
//! notification that synchronously re-runs another effect) push and pop in
//! strict LIFO order.
//!
//! A frame may also be *untracked*: reads inside it register nothing. The
//! runtime delivers notifications inside an untracked frame so a subscriber
//! cannot leak dependencies into whichever computation performed the write.
//!
//! Frames never survive a suspension point; the core has none.

use std::cell::RefCell;
use std::sync::Arc;

use indexmap::IndexMap;

use super::subscriber::{SourceId, SubscriberId, Trackable};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the reactive context stack.
struct ContextEntry {
    /// The computation owning this frame, or `None` for an untracked frame.
    subscriber_id: Option<SubscriberId>,
    /// Sources read during this computation, in first-read order.
    dependencies: IndexMap<SourceId, Arc<dyn Trackable>>,
}

/// Guard that pops the context when dropped.
///
/// This ensures the context stack is properly maintained even if
/// the computation panics.
pub struct ReactiveContext {
    subscriber_id: Option<SubscriberId>,
    depth: usize,
}

impl ReactiveContext {
    /// Enter a new reactive context for the given subscriber.
    ///
    /// While this context is active, any source that is read registers
    /// itself as a dependency of `subscriber_id`.
    ///
    /// The context is automatically exited when the returned guard is dropped.
    pub fn enter(subscriber_id: SubscriberId) -> Self {
        Self::push(Some(subscriber_id))
    }

    /// Enter a context in which reads are not tracked.
    pub fn enter_untracked() -> Self {
        Self::push(None)
    }

    fn push(subscriber_id: Option<SubscriberId>) -> Self {
        let depth = CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(ContextEntry {
                subscriber_id,
                dependencies: IndexMap::new(),
            });
            stack.len()
        });

        Self {
            subscriber_id,
            depth,
        }
    }

    /// Run `f` inside a fresh frame owned by `subscriber_id`.
    ///
    /// Returns `f`'s result together with every source it read, in the order
    /// they were first read. If `f` panics the frame is still popped and the
    /// panic continues; callers that need the partial dependency set catch the
    /// panic inside `f`.
    pub fn run<R>(subscriber_id: SubscriberId, f: impl FnOnce() -> R) -> (R, Vec<Arc<dyn Trackable>>) {
        let ctx = Self::enter(subscriber_id);
        let result = f();
        let dependencies = ctx.take_dependencies();
        (result, dependencies)
    }

    /// Run `f` with tracking suspended.
    pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
        let _ctx = Self::enter_untracked();
        f()
    }

    /// Check if reads are currently being tracked.
    pub fn is_active() -> bool {
        Self::current_subscriber().is_some()
    }

    /// Get the subscriber owning the top frame, if it is a tracking frame.
    pub fn current_subscriber() -> Option<SubscriberId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().and_then(|entry| entry.subscriber_id))
    }

    /// Whether `subscriber_id` owns any frame on this thread's stack.
    ///
    /// A computation that finds itself already running is being read from
    /// inside its own body.
    pub fn is_running(subscriber_id: SubscriberId) -> bool {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .any(|entry| entry.subscriber_id == Some(subscriber_id))
        })
    }

    /// Number of frames on this thread's stack.
    pub fn depth() -> usize {
        CONTEXT_STACK.with(|stack| stack.borrow().len())
    }

    /// Record a read of `source` in the current frame.
    ///
    /// Reading the same source twice in one frame records it once. Does
    /// nothing outside a tracking frame.
    pub fn track<S>(source: &Arc<S>)
    where
        S: Trackable + 'static,
    {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(entry) = stack.last_mut() {
                if entry.subscriber_id.is_some() {
                    entry
                        .dependencies
                        .entry(source.source_id())
                        .or_insert_with(|| Arc::clone(source) as Arc<dyn Trackable>);
                }
            }
        });
    }

    /// Drain the dependencies collected in this guard's frame.
    pub fn take_dependencies(&self) -> Vec<Arc<dyn Trackable>> {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(stack.len(), self.depth, "ReactiveContext is not the top frame");
            stack
                .get_mut(self.depth - 1)
                .map(|entry| std::mem::take(&mut entry.dependencies).into_values().collect())
                .unwrap_or_default()
        })
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        let popped = CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(
                stack.len(),
                self.depth,
                "ReactiveContext dropped out of order"
            );
            stack.pop()
        });

        // Verify we're popping the right context.
        // This helps catch bugs where contexts are mismatched.
        if let Some(entry) = &popped {
            debug_assert_eq!(
                entry.subscriber_id, self.subscriber_id,
                "ReactiveContext mismatch: expected {:?}, got {:?}",
                self.subscriber_id, entry.subscriber_id
            );
        }

        // Dependencies are released here, outside the RefCell borrow.
        drop(popped);
    }
}

/// Run `f` without tracking any reads it performs.
///
/// Inside an effect or computed body, `untrack(|| other.get())` reads `other`
/// without making the surrounding computation depend on it.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    ReactiveContext::untracked(f)
}
