//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, computed values,
//! effects, and batching. These primitives form the foundation of Ripple's
//! fine-grained reactivity.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (such as a computed value or effect), the signal
//! registers itself as a dependency of that context. When the signal's value
//! changes, all dependents are notified.
//!
//! ## Computed Values
//!
//! A Computed is a derived value that caches its result. It re-evaluates only
//! when one of its dependencies changes: lazily on the next read, or right
//! away when something subscribes to it.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Effects are used to synchronize reactive state with
//! external systems, such as updating a view or logging.
//!
//! ## Batches
//!
//! A batch coalesces the notifications of several writes: each dependent runs
//! once, after the outermost batch exits, and sees the final values.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to automatically
//! detect dependencies. When a source is read, we check if there is an active
//! tracking context and, if so, register the dependency.
//!
//! Every run of a computed value or effect rebuilds its dependency set from
//! scratch. No topological ordering is imposed across a diamond-shaped graph:
//! an effect reading two computed values derived from the same signal may
//! briefly observe one updated and one stale value, then run again once the
//! second one catches up. Wrapping the write in [`batch`] does not change
//! that ordering.

mod computed;
mod context;
mod effect;
mod error;
mod runtime;
mod signal;
mod subscriber;

pub use computed::{Computed, ComputedState};
pub use context::{untrack, ReactiveContext};
pub use effect::{Cleanup, Effect, MAX_EFFECT_RERUNS};
pub use error::{ReactiveError, Result};
pub use runtime::{batch, is_batching, Runtime};
pub use signal::{EqualsFn, Signal, SignalOptions};
pub use subscriber::{Notify, SourceId, SubscriberId, Trackable, Unsubscribe};

/// Create a signal holding `value`.
pub fn create_signal<T>(value: T) -> Signal<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    Signal::new(value)
}

/// Create a signal with a custom change detector.
pub fn create_signal_with<T>(value: T, options: SignalOptions<T>) -> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    Signal::with_options(value, options)
}

/// Create a computed value derived by `derive`.
pub fn create_computed<T, F>(derive: F) -> Computed<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    Computed::new(derive)
}

/// Create an effect and run it once immediately.
///
/// The returned handle's [`Effect::dispose`] stops it.
pub fn create_effect<F>(run: F) -> Effect
where
    F: Fn() + Send + Sync + 'static,
{
    Effect::new(run)
}
