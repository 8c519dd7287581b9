//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computed Values Work
//!
//! 1. Nothing runs at construction. The first read (or subscribe) runs the
//!    derivation inside a fresh reactive context and caches the result.
//!
//! 2. Every source read during the derivation is subscribed to. The set is
//!    rebuilt from scratch on each run, so a branch no longer taken stops
//!    invalidating the value.
//!
//! 3. When a dependency changes, the computed value is marked dirty.
//!
//! 4. If nobody subscribes to the computed value, that is all: the next read
//!    recomputes (pull). If something does (a callback, an effect, another
//!    computed value that read it), it recomputes right away and notifies
//!    downstream only when the new value differs from the old one (push).
//!
//! # Failure Modes
//!
//! - **Derivation panics**: the reader sees the panic (`get`) or an error
//!   (`try_get`). The last good value stays cached and readable through
//!   `peek`, the value stays dirty so the next read retries, and the sources
//!   read before the panic stay subscribed.
//! - **Self-read**: reading a computed value from inside its own derivation
//!   is reported as [`ReactiveError::Cycle`].
//!
//! # Lifetime
//!
//! Downstream `unsubscribe` only detaches the callback; the computed value
//! keeps its upstream subscriptions until its last handle is dropped.

use std::any::Any;
use std::fmt::{self, Debug};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::context::ReactiveContext;
use super::error::{panic_message, ReactiveError};
use super::signal::EqualsFn;
use super::subscriber::{Notify, SourceId, SubscriberId, SubscriberSet, Trackable, Unsubscribe};

/// Dirty state for a computed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputedState {
    /// The cached value is up-to-date.
    Clean,

    /// The value must be recomputed before it is read again.
    Dirty,
}

/// Why a refresh produced no value.
enum Failure {
    Cycle,
    Panicked(Box<dyn Any + Send>),
}

/// Mutable part of a computed value, guarded by one lock.
struct ComputedCore<T> {
    /// The cached value (None if never computed successfully).
    value: Option<T>,
    state: ComputedState,
    /// One subscription per source read during the last run.
    sources: SmallVec<[Unsubscribe; 4]>,
}

struct ComputedInner<T> {
    id: SourceId,

    /// The subscriber ID used for dependency tracking.
    subscriber_id: SubscriberId,

    derive: Box<dyn Fn() -> T + Send + Sync>,
    equals: EqualsFn<T>,
    core: Mutex<ComputedCore<T>>,

    /// Callbacks and computations that depend on this value.
    subscribers: Arc<SubscriberSet>,
}

impl<T> ComputedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Return the cached value, recomputing first if dirty.
    fn refresh(self: &Arc<Self>) -> Result<T, Failure> {
        if ReactiveContext::is_running(self.subscriber_id) {
            return Err(Failure::Cycle);
        }

        {
            let core = self.core.lock();
            if core.state == ComputedState::Clean {
                if let Some(value) = &core.value {
                    return Ok(value.clone());
                }
            }
        }

        self.recompute()
    }

    /// Run the derivation and rebuild the dependency set.
    fn recompute(self: &Arc<Self>) -> Result<T, Failure> {
        let stale = std::mem::take(&mut self.core.lock().sources);
        for source in &stale {
            source.unsubscribe();
        }

        let (outcome, dependencies) = ReactiveContext::run(self.subscriber_id, || {
            panic::catch_unwind(AssertUnwindSafe(|| (self.derive)()))
        });
        let sources = self.subscribe_to(dependencies);

        let mut core = self.core.lock();
        core.sources = sources;

        match outcome {
            Ok(value) => {
                core.value = Some(value.clone());
                core.state = ComputedState::Clean;
                tracing::trace!(source = %self.id, dependencies = core.sources.len(), "computed recomputed");
                Ok(value)
            }
            Err(payload) => {
                core.state = ComputedState::Dirty;
                Err(Failure::Panicked(payload))
            }
        }
    }

    fn subscribe_to(self: &Arc<Self>, dependencies: Vec<Arc<dyn Trackable>>) -> SmallVec<[Unsubscribe; 4]> {
        dependencies
            .into_iter()
            .map(|dependency| {
                let weak: Weak<Self> = Arc::downgrade(self);
                dependency.subscribe_dependent(
                    self.subscriber_id,
                    Arc::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.invalidate();
                        }
                    }),
                )
            })
            .collect()
    }

    /// Called when any dependency changes.
    fn invalidate(self: &Arc<Self>) {
        let previous = {
            let mut core = self.core.lock();
            core.state = ComputedState::Dirty;
            if self.subscribers.is_empty() || ReactiveContext::is_running(self.subscriber_id) {
                tracing::trace!(source = %self.id, "computed marked dirty");
                return;
            }
            core.value.clone()
        };

        match self.recompute() {
            Ok(next) => {
                let changed = previous.map_or(true, |prev| !(self.equals)(&prev, &next));
                if changed {
                    self.subscribers.notify();
                }
            }
            Err(failure) => {
                match failure {
                    Failure::Panicked(payload) => tracing::warn!(
                        source = %self.id,
                        panic = %panic_message(&*payload),
                        "eager recompute failed; keeping last value"
                    ),
                    Failure::Cycle => tracing::warn!(source = %self.id, "eager recompute skipped: cycle"),
                }
                // Dependents must go dirty so their next read reaches this
                // value and sees the failure. Value callbacks skip a dirty
                // value.
                self.subscribers.notify();
            }
        }
    }

    /// The cached value if it is up to date.
    fn clean_value(&self) -> Option<T> {
        let core = self.core.lock();
        match core.state {
            ComputedState::Clean => core.value.clone(),
            ComputedState::Dirty => None,
        }
    }

    fn peek(&self) -> Option<T> {
        self.core.lock().value.clone()
    }
}

impl<T> Trackable for ComputedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn source_id(&self) -> SourceId {
        self.id
    }

    fn subscribe_dependent(&self, target: SubscriberId, notify: Notify) -> Unsubscribe {
        self.subscribers.add(target, notify)
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        for source in self.core.get_mut().sources.drain(..) {
            source.unsubscribe();
        }
    }
}

/// A cached derived value that recomputes only when dependencies change.
///
/// # Type Parameters
///
/// - `T`: The type of the computed value. Must be Clone + Send + Sync.
///
/// [`Computed::new`] additionally needs `PartialEq` to detect when a
/// recompute actually produced a different value (some computations return
/// the same value even if inputs changed); [`Computed::with_equals`] takes the
/// comparison explicitly.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(2);
/// let doubled = Computed::new({
///     let count = count.clone();
///     move || count.get() * 2
/// });
///
/// assert_eq!(doubled.get(), 4);
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// ```
pub struct Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<ComputedInner<T>>,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new computed value with the given derivation.
    ///
    /// The derivation is not run immediately. It runs on first access.
    pub fn new<F>(derive: F) -> Self
    where
        T: PartialEq,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_equals(derive, |a: &T, b: &T| a == b)
    }

    /// Create a computed value with a custom change detector for pushed
    /// updates.
    pub fn with_equals<F, E>(derive: F, equals: E) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ComputedInner {
                id: SourceId::new(),
                subscriber_id: SubscriberId::new(),
                derive: Box::new(derive),
                equals: Arc::new(equals),
                core: Mutex::new(ComputedCore {
                    value: None,
                    state: ComputedState::Dirty,
                    sources: SmallVec::new(),
                }),
                subscribers: SubscriberSet::new(),
            }),
        }
    }

    /// Get the computed value's unique ID.
    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// Get the subscriber ID this value tracks its own dependencies under.
    pub fn subscriber_id(&self) -> SubscriberId {
        self.inner.subscriber_id
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// If called within a reactive context, this computed value becomes a
    /// dependency of the current computation.
    ///
    /// # Panics
    ///
    /// Resumes the derivation's panic if it fails, and panics on a cycle.
    /// Use [`try_get`](Self::try_get) to receive these as errors.
    pub fn get(&self) -> T {
        match self.read(true) {
            Ok(value) => value,
            Err(Failure::Panicked(payload)) => panic::resume_unwind(payload),
            Err(Failure::Cycle) => panic!("{}", ReactiveError::Cycle { computed: self.inner.id }),
        }
    }

    /// Get the current value, reporting derivation failures as errors.
    pub fn try_get(&self) -> Result<T, ReactiveError> {
        self.read(true).map_err(|failure| self.to_error(failure))
    }

    /// Get the current value without tracking, recomputing if necessary.
    pub fn get_untracked(&self) -> Result<T, ReactiveError> {
        self.read(false).map_err(|failure| self.to_error(failure))
    }

    fn read(&self, tracked: bool) -> Result<T, Failure> {
        if ReactiveContext::is_running(self.inner.subscriber_id) {
            return Err(Failure::Cycle);
        }
        if tracked {
            ReactiveContext::track(&self.inner);
        }
        self.inner.refresh()
    }

    fn to_error(&self, failure: Failure) -> ReactiveError {
        match failure {
            Failure::Cycle => ReactiveError::Cycle {
                computed: self.inner.id,
            },
            Failure::Panicked(payload) => ReactiveError::Derivation {
                message: panic_message(&*payload),
            },
        }
    }

    /// The last successfully computed value, without recomputing or
    /// tracking.
    pub fn peek(&self) -> Option<T> {
        self.inner.peek()
    }

    /// Register a callback invoked with each recomputed value that differs
    /// from the previous one.
    ///
    /// Forces the initial computation so upstream changes are pushed from
    /// now on. The current value is not replayed.
    ///
    /// Unlike [`get`](Self::get), a failing initial computation does not
    /// propagate: it is logged at `warn` and the callback is registered
    /// anyway. The callback never sees a failed recompute; it fires with
    /// the first value computed successfully afterwards. Call
    /// [`try_get`](Self::try_get) first to reject a failing value up front.
    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        if let Err(failure) = self.inner.refresh() {
            let error = self.to_error(failure);
            tracing::warn!(source = %self.inner.id, %error, "initial computation failed at subscribe");
        }

        let weak: Weak<ComputedInner<T>> = Arc::downgrade(&self.inner);
        self.inner.subscribers.add(
            SubscriberId::new(),
            Arc::new(move || {
                if let Some(value) = weak.upgrade().and_then(|inner| inner.clean_value()) {
                    callback(&value);
                }
            }),
        )
    }

    /// Get the current dirty state.
    pub fn state(&self) -> ComputedState {
        self.inner.core.lock().state
    }

    /// Check if the computed value has a cached value.
    pub fn has_value(&self) -> bool {
        self.inner.core.lock().value.is_some()
    }

    /// Number of sources read during the last run.
    pub fn dependency_count(&self) -> usize {
        self.inner.core.lock().sources.len()
    }

    /// Get the number of downstream subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl<T> Trackable for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn source_id(&self) -> SourceId {
        self.inner.id
    }

    fn subscribe_dependent(&self, target: SubscriberId, notify: Notify) -> Unsubscribe {
        self.inner.subscribe_dependent(target, notify)
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Computed")
            .field("id", &self.inner.id)
            .field("state", &core.state)
            .field("value", &core.value)
            .field("dependency_count", &core.sources.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
