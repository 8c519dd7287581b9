//! Ripple Core
//!
//! This crate provides the fine-grained reactive runtime for Ripple.
//! It implements:
//!
//! - Reactive primitives (signals, computed values, effects)
//! - Automatic dependency tracking through a thread-local context stack
//! - Lazy memoization with push-on-subscribe invalidation
//! - Batched, deduplicated change notification
//!
//! Everything built on top (persistence, validation, rendering, bindings)
//! talks to the runtime only through signal creation, read, write, subscribe,
//! and `batch`.
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::{create_computed, create_effect, create_signal};
//!
//! // Create a signal
//! let count = create_signal(0);
//!
//! // Create a derived value
//! let doubled = create_computed({
//!     let count = count.clone();
//!     move || count.get() * 2
//! });
//!
//! // Create an effect
//! let effect = create_effect({
//!     let (count, doubled) = (count.clone(), doubled.clone());
//!     move || println!("Count: {}, Doubled: {}", count.get(), doubled.get())
//! });
//!
//! // Update the signal
//! count.set(5);
//! // Effect automatically runs, prints: "Count: 5, Doubled: 10"
//!
//! effect.dispose();
//! ```

pub mod reactive;

pub use reactive::{
    batch, create_computed, create_effect, create_signal, create_signal_with, is_batching, untrack,
    Computed, Effect, ReactiveError, Signal, SignalOptions, Trackable, Unsubscribe,
};
