//! Subscriber types for the reactive system.
//!
//! Every reactive source (signal or computed) owns a [`SubscriberSet`]: an
//! insertion-ordered list of callbacks to run when the source changes. A
//! registration hands back an [`Unsubscribe`] handle, which is the only
//! capability the subscriber holds over the source.
//!
//! Each registration carries a *target* [`SubscriberId`]. For a plain
//! callback the target is unique to that callback; for a computed value or
//! an effect it is the id of the computation, so that several sources feeding
//! the same computation collapse into one pending notification inside a
//! batch.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::runtime::Runtime;

/// Unique identifier for a subscriber.
///
/// Each computation (computed value, effect, or plain callback) gets a unique
/// ID when created. This ID is used to deduplicate batched notifications and
/// to detect a computation reading itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Unique identifier for a reactive source (a signal or a computed value).
///
/// Signals and computed values draw from the same counter, so a tracking
/// frame can key its dependency set by `SourceId` regardless of kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// Generate a new unique source ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src#{}", self.0)
    }
}

/// Callback invoked when a source changes.
///
/// It takes no arguments: value-carrying subscribers read the source's
/// current value at call time.
pub type Notify = Arc<dyn Fn() + Send + Sync>;

/// Anything that can be depended upon by a reactive computation.
///
/// Implemented by [`Signal`](super::Signal) and
/// [`Computed`](super::Computed). Tracking frames store dependencies as
/// `Arc<dyn Trackable>` and subscribe to them uniformly once the computation
/// finishes.
pub trait Trackable: Send + Sync {
    /// Identity of this source, used to deduplicate reads within one frame.
    fn source_id(&self) -> SourceId;

    /// Register `notify` to run whenever this source changes.
    ///
    /// `target` identifies the computation being notified. Notifications for
    /// the same target raised inside one batch are delivered once.
    fn subscribe_dependent(&self, target: SubscriberId, notify: Notify) -> Unsubscribe;
}

/// A subscriber to a reactive source.
///
/// Cloned out of the [`SubscriberSet`] before delivery so no lock is held
/// while the callback runs.
#[derive(Clone)]
pub(crate) struct Subscriber {
    target: SubscriberId,
    notify: Notify,
    active: Arc<AtomicBool>,
}

impl Subscriber {
    /// The computation this subscriber notifies.
    pub(crate) fn target(&self) -> SubscriberId {
        self.target
    }

    /// Whether the subscription is still registered.
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Run the callback, unless it was unsubscribed in the meantime.
    pub(crate) fn notify(&self) {
        if self.is_active() {
            (self.notify)();
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("target", &self.target)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Insertion-ordered set of subscribers owned by one source.
#[derive(Default)]
pub(crate) struct SubscriberSet {
    entries: Mutex<IndexMap<SubscriberId, Subscriber>>,
}

impl SubscriberSet {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a callback and return its disposer.
    pub(crate) fn add(self: &Arc<Self>, target: SubscriberId, notify: Notify) -> Unsubscribe {
        let slot = SubscriberId::new();
        let active = Arc::new(AtomicBool::new(true));

        self.entries.lock().insert(
            slot,
            Subscriber {
                target,
                notify,
                active: Arc::clone(&active),
            },
        );

        Unsubscribe {
            set: Arc::downgrade(self),
            slot,
            active,
        }
    }

    fn remove(&self, slot: SubscriberId) {
        // shift_remove keeps the remaining subscribers in subscription order.
        self.entries.lock().shift_remove(&slot);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Notify every current subscriber, in subscription order.
    ///
    /// The set is snapshotted first: callbacks registered during this pass
    /// wait for the next change, and callbacks removed during this pass are
    /// skipped through their `active` flag.
    pub(crate) fn notify(&self) {
        let snapshot: SmallVec<[Subscriber; 4]> = self.entries.lock().values().cloned().collect();

        for subscriber in snapshot {
            Runtime::dispatch(subscriber);
        }
    }
}

impl fmt::Debug for SubscriberSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberSet")
            .field("len", &self.len())
            .finish()
    }
}

/// Disposer returned by every `subscribe` call.
///
/// Calling [`unsubscribe`](Self::unsubscribe) removes exactly the callback it
/// was returned for. Repeated calls are no-ops. Dropping the handle does
/// *not* unsubscribe.
#[must_use = "dropping an `Unsubscribe` keeps the callback registered for the life of the source"]
pub struct Unsubscribe {
    set: Weak<SubscriberSet>,
    slot: SubscriberId,
    active: Arc<AtomicBool>,
}

impl Unsubscribe {
    /// Detach the callback from its source.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(set) = self.set.upgrade() {
                set.remove(self.slot);
            }
        }
    }

    /// Whether the callback is still registered.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Identifier of this particular registration.
    pub fn id(&self) -> SubscriberId {
        self.slot
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("slot", &self.slot)
            .field("active", &self.is_active())
            .finish()
    }
}
