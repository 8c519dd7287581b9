//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! notifies subscribers when that value changes.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a reactive context (computed/effect), the
//!    signal registers itself in that context's dependency set.
//!
//! 2. When a signal's value changes, all subscribers are notified in the
//!    order they subscribed. Inside a batch the notification is deferred.
//!
//! 3. Writing a value equal to the current one (per the signal's equality
//!    predicate) does nothing.
//!
//! # Thread Safety
//!
//! Signals are `Send + Sync`. The value is protected by an `RwLock` that is
//! never held while user code runs, so subscribers may freely read or write
//! the signal that notified them.

use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::context::ReactiveContext;
use super::subscriber::{Notify, SourceId, SubscriberId, SubscriberSet, Trackable, Unsubscribe};

/// Equality predicate deciding whether a write is a change.
pub type EqualsFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Construction options for a [`Signal`].
///
/// The default compares values with `PartialEq`.
pub struct SignalOptions<T> {
    equals: EqualsFn<T>,
}

impl<T: PartialEq + 'static> Default for SignalOptions<T> {
    fn default() -> Self {
        Self {
            equals: Arc::new(|a: &T, b: &T| a == b),
        }
    }
}

impl<T: 'static> SignalOptions<T> {
    /// Treat two values as unchanged when `equals` returns true.
    ///
    /// ```rust,ignore
    /// // Only the id matters for change detection.
    /// let user = Signal::with_options(u, SignalOptions::with_equals(|a: &User, b: &User| a.id == b.id));
    /// ```
    pub fn with_equals<F>(equals: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            equals: Arc::new(equals),
        }
    }

    /// Notify on every write, even when the value is unchanged.
    pub fn always_notify() -> Self {
        Self::with_equals(|_, _| false)
    }
}

impl<T> Clone for SignalOptions<T> {
    fn clone(&self) -> Self {
        Self {
            equals: Arc::clone(&self.equals),
        }
    }
}

impl<T> Debug for SignalOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalOptions").finish_non_exhaustive()
    }
}

/// Shared state behind every handle to one signal.
struct SignalInner<T> {
    id: SourceId,
    value: RwLock<T>,
    equals: EqualsFn<T>,
    subscribers: Arc<SubscriberSet>,
}

impl<T> Trackable for SignalInner<T>
where
    T: Send + Sync + 'static,
{
    fn source_id(&self) -> SourceId {
        self.id
    }

    fn subscribe_dependent(&self, target: SubscriberId, notify: Notify) -> Unsubscribe {
        self.subscribers.add(target, notify)
    }
}

/// A reactive signal holding a value of type T.
///
/// # Type Parameters
///
/// - `T`: The type of value stored in the signal. Must be Clone + Send + Sync.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (notifies subscribers)
/// count.set(5);
/// ```
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<SignalInner<T>>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_options(value, SignalOptions::default())
    }

    /// Create a new signal with a custom change detector.
    pub fn with_options(value: T, options: SignalOptions<T>) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                id: SourceId::new(),
                value: RwLock::new(value),
                equals: options.equals,
                subscribers: SubscriberSet::new(),
            }),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// If called within a reactive context, this also registers the signal
    /// as a dependency of the current computation.
    pub fn get(&self) -> T {
        ReactiveContext::track(&self.inner);
        self.get_untracked()
    }

    /// Get the current value without tracking dependencies.
    ///
    /// Use this when you need to read the value without establishing
    /// a reactive dependency.
    pub fn get_untracked(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Borrow the current value without cloning it. Tracks like `get`.
    ///
    /// The value is read-locked while `f` runs; writing this signal from
    /// inside `f` deadlocks.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        ReactiveContext::track(&self.inner);
        f(&self.inner.value.read())
    }

    /// Set a new value and notify subscribers.
    ///
    /// A value equal to the current one is ignored. Panics raised by
    /// subscribers are isolated and logged; `set` itself never panics on
    /// their account.
    pub fn set(&self, value: T) {
        let unchanged = {
            let current = self.inner.value.read();
            (self.inner.equals)(&current, &value)
        };
        if unchanged {
            tracing::trace!(source = %self.inner.id, "write ignored: value unchanged");
            return;
        }

        *self.inner.value.write() = value;
        tracing::trace!(source = %self.inner.id, subscribers = self.subscriber_count(), "signal changed");

        self.inner.subscribers.notify();
    }

    /// Update the value using a function of the current value.
    ///
    /// The read of the current value is not tracked, so calling `update`
    /// inside a computation does not make it depend on this signal.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.get_untracked();
        self.set(f(&current));
    }

    /// Register a callback invoked with the new value after every change.
    ///
    /// The current value is not replayed; pair this with [`get`](Self::get)
    /// to observe the initial state.
    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        self.inner.subscribers.add(
            SubscriberId::new(),
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let value = inner.value.read().clone();
                    callback(&value);
                }
            }),
        )
    }

    /// Get the number of subscribers.
    ///
    /// Counts plain callbacks as well as dependent computations.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl<T> Trackable for Signal<T>
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

impl<T> Clone for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("value", &self.get_untracked())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(feature = "serde")]
impl<T> serde::Serialize for Signal<T>
where
    T: Clone + Send + Sync + serde::Serialize + 'static,
{
    /// Serializes the current value, untracked.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde::Serialize::serialize(&*self.inner.value.read(), serializer)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::batch;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Debug, Clone)]
    struct User {
        id: u32,
        name: &'static str,
    }

    #[test]
    fn signal_get_and_set() {
        let signal = Signal::new(0);
        assert_eq!(signal.get(), 0);

        signal.set(42);
        assert_eq!(signal.get(), 42);
    }

    #[test]
    fn signal_update() {
        let signal = Signal::new(10);
        signal.update(|v| v + 5);
        assert_eq!(signal.get(), 15);
    }

    #[test]
    fn signal_with_borrows_and_tracks() {
        let names = Signal::new(vec!["a".to_string(), "bb".to_string()]);

        let (total, dependencies) =
            ReactiveContext::run(SubscriberId::new(), || names.with(|v| v.iter().map(String::len).sum::<usize>()));

        assert_eq!(total, 3);
        assert_eq!(dependencies.len(), 1);
        assert_eq!(dependencies[0].source_id(), names.id());
    }

    #[test]
    fn signal_notifies_subscribers_with_new_value() {
        let signal = Signal::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _sub = signal.subscribe(move |v| seen_clone.lock().push(*v));

        // No replay on subscribe.
        assert!(seen.lock().is_empty());

        signal.set(1);
        signal.set(2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn equal_write_is_a_no_op() {
        let signal = Signal::new(7);
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let _sub = signal.subscribe(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(8);
        signal.set(8);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signal_unsubscribe() {
        let signal = Signal::new(0);
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let sub = signal.subscribe(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        signal.set(2);
        signal.set(3);
        // Should not have been called again
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn custom_equality_suppresses_notification() {
        let user = Signal::with_options(
            User { id: 1, name: "ada" },
            SignalOptions::with_equals(|a: &User, b: &User| a.id == b.id),
        );
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();
        let _sub = user.subscribe(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        user.set(User { id: 1, name: "grace" });
        assert_eq!(call_count.load(Ordering::SeqCst), 0);
        // Same id: the write is ignored entirely.
        assert_eq!(user.get().name, "ada");

        user.set(User { id: 2, name: "grace" });
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn always_notify_fires_on_equal_writes() {
        let signal = Signal::with_options(5, SignalOptions::always_notify());
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();
        let _sub = signal.subscribe(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(5);
        signal.set(5);
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let signal = Signal::new(0);
        let call_count = Arc::new(AtomicI32::new(0));

        let _broken = signal.subscribe(|_| panic!("subscriber failure"));
        let call_count_clone = call_count.clone();
        let _healthy = signal.subscribe(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.get(), 1);
    }

    #[test]
    fn subscriber_may_write_back_to_signal() {
        let signal = Signal::new(0);
        let writer = signal.clone();

        // Clamp anything above 10.
        let _sub = signal.subscribe(move |v| {
            if *v > 10 {
                writer.set(10);
            }
        });

        signal.set(50);
        assert_eq!(signal.get(), 10);
    }

    #[test]
    fn batched_writes_deliver_final_value_once() {
        let signal = Signal::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = signal.subscribe(move |v| seen_clone.lock().push(*v));

        batch(|| {
            signal.set(1);
            signal.set(2);
            assert!(seen.lock().is_empty());
        });

        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn signal_clone_shares_state() {
        let signal1 = Signal::new(0);
        let signal2 = signal1.clone();

        signal1.set(42);
        assert_eq!(signal2.get(), 42);

        signal2.set(100);
        assert_eq!(signal1.get(), 100);
        assert_eq!(signal1.id(), signal2.id());
    }

    #[test]
    fn signal_ids_are_unique() {
        let s1 = Signal::new(0);
        let s2 = Signal::new(0);
        let s3 = Signal::new(0);

        assert_ne!(s1.id(), s2.id());
        assert_ne!(s2.id(), s3.id());
        assert_ne!(s1.id(), s3.id());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn signal_serializes_current_value() {
        let signal = Signal::new(vec![1, 2, 3]);
        signal.update(|v| {
            let mut next = v.clone();
            next.push(4);
            next
        });
        assert_eq!(serde_json::to_string(&signal).unwrap(), "[1,2,3,4]");
    }
}
