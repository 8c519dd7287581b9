//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the effect re-runs synchronously (or once
//!    at the end of the current batch).
//!
//! 3. Before re-running, the effect calls the previous cleanup, drops its old
//!    subscriptions, and tracks new ones during execution.
//!
//! # Differences from Computed
//!
//! - Computed values return a value; effects do not.
//! - Computed values are lazy unless observed; effects are always eager.
//! - Computed values cache results; effects just run their side effect.
//!
//! # Cleanup
//!
//! [`Effect::with_cleanup`] bodies return a cleanup closure. It is called
//! right before the next run and when the effect is disposed.
//!
//! # Lifetime
//!
//! An effect stays alive for as long as any source it depends on is alive,
//! even if every `Effect` handle is dropped. [`Effect::dispose`] is the only
//! way to stop it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::context::ReactiveContext;
use super::error::panic_message;
use super::subscriber::{SubscriberId, Trackable, Unsubscribe};

/// Cleanup returned by an effect body.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Maximum number of back-to-back re-runs an effect performs when its own
/// body keeps invalidating it.
pub const MAX_EFFECT_RERUNS: usize = 100;

type Body = Box<dyn Fn() -> Option<Cleanup> + Send + Sync>;

struct EffectCore {
    cleanup: Option<Cleanup>,
    sources: SmallVec<[Unsubscribe; 4]>,
    run_count: usize,
    /// The body is executing.
    running: bool,
    /// A dependency changed while the body was executing.
    rerun_requested: bool,
}

struct EffectInner {
    subscriber_id: SubscriberId,
    body: Body,
    core: Mutex<EffectCore>,
    disposed: AtomicBool,
}

impl EffectInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Run the effect: cleanup, re-track, execute.
    ///
    /// Returns the body's panic payload, if it panicked.
    fn run(self: &Arc<Self>) -> Result<(), Box<dyn Any + Send>> {
        if self.is_disposed() {
            return Ok(());
        }

        {
            let mut core = self.core.lock();
            if core.running {
                core.rerun_requested = true;
                tracing::trace!(effect = %self.subscriber_id, "re-run requested while running");
                return Ok(());
            }
            core.running = true;
        }

        let mut reruns = 0;
        loop {
            let (cleanup, stale) = {
                let mut core = self.core.lock();
                (core.cleanup.take(), std::mem::take(&mut core.sources))
            };
            if let Some(cleanup) = cleanup {
                self.run_cleanup(cleanup);
            }
            for source in &stale {
                source.unsubscribe();
            }

            let (outcome, dependencies) = ReactiveContext::run(self.subscriber_id, || {
                panic::catch_unwind(AssertUnwindSafe(|| (self.body)()))
            });
            let sources = self.subscribe_to(dependencies);

            let mut core = self.core.lock();
            core.sources = sources;
            core.run_count += 1;
            let outcome = match outcome {
                Ok(cleanup) => {
                    core.cleanup = cleanup;
                    Ok(())
                }
                Err(payload) => Err(payload),
            };

            let again = core.rerun_requested && outcome.is_ok() && !self.is_disposed();
            core.rerun_requested = false;
            if again {
                if reruns < MAX_EFFECT_RERUNS {
                    reruns += 1;
                    continue;
                }
                tracing::error!(
                    effect = %self.subscriber_id,
                    limit = MAX_EFFECT_RERUNS,
                    "effect keeps invalidating itself; giving up until the next change"
                );
            }

            core.running = false;
            drop(core);

            // The body (or another thread) may have disposed the effect
            // while it was running.
            if self.is_disposed() {
                self.teardown();
            }
            return outcome;
        }
    }

    fn subscribe_to(self: &Arc<Self>, dependencies: Vec<Arc<dyn Trackable>>) -> SmallVec<[Unsubscribe; 4]> {
        dependencies
            .into_iter()
            .map(|dependency| {
                let effect = Arc::clone(self);
                dependency.subscribe_dependent(
                    self.subscriber_id,
                    Arc::new(move || {
                        if let Err(payload) = effect.run() {
                            panic::resume_unwind(payload);
                        }
                    }),
                )
            })
            .collect()
    }

    fn run_cleanup(&self, cleanup: Cleanup) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| ReactiveContext::untracked(cleanup)));
        if let Err(payload) = outcome {
            tracing::error!(
                effect = %self.subscriber_id,
                panic = %panic_message(&*payload),
                "effect cleanup panicked"
            );
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(effect = %self.subscriber_id, "effect disposed");
        self.teardown();
    }

    /// Run the latest cleanup and drop every subscription.
    fn teardown(&self) {
        let (cleanup, sources) = {
            let mut core = self.core.lock();
            (core.cleanup.take(), std::mem::take(&mut core.sources))
        };
        if let Some(cleanup) = cleanup {
            self.run_cleanup(cleanup);
        }
        for source in &sources {
            source.unsubscribe();
        }
    }
}

/// A side-effecting computation that runs when dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// let effect = Effect::new({
///     let count = count.clone();
///     move || println!("Count is: {}", count.get())
/// });
///
/// count.set(5);  // Prints: "Count is: 5"
/// effect.dispose();
/// ```
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl Effect {
    /// Create a new effect with the given function.
    ///
    /// The function runs immediately to establish initial dependencies.
    ///
    /// # Panics
    ///
    /// If the first run panics, the effect is disposed and the panic is
    /// resumed in the caller.
    pub fn new<F>(run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::from_body(Box::new(move || {
            run();
            None
        }))
    }

    /// Create an effect whose body returns a cleanup closure.
    ///
    /// The cleanup runs right before each re-run and on disposal.
    pub fn with_cleanup<F, C>(run: F) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        Self::from_body(Box::new(move || Some(Box::new(run()) as Cleanup)))
    }

    fn from_body(body: Body) -> Self {
        let inner = Arc::new(EffectInner {
            subscriber_id: SubscriberId::new(),
            body,
            core: Mutex::new(EffectCore {
                cleanup: None,
                sources: SmallVec::new(),
                run_count: 0,
                running: false,
                rerun_requested: false,
            }),
            disposed: AtomicBool::new(false),
        });

        if let Err(payload) = inner.run() {
            inner.dispose();
            panic::resume_unwind(payload);
        }

        Self { inner }
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.inner.subscriber_id
    }

    /// Dispose of the effect.
    ///
    /// Runs the latest cleanup and unsubscribes from every dependency. After
    /// disposal the effect never runs again. Calling this more than once has
    /// no further effect.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.inner.core.lock().run_count
    }

    /// Get the number of dependencies.
    pub fn dependency_count(&self) -> usize {
        self.inner.core.lock().sources.len()
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.subscriber_id)
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{batch, Computed, Signal};
    use std::sync::atomic::AtomicI32;

    #[test]
    fn effect_runs_on_creation() {
        let run_count = Arc::new(AtomicI32::new(0));
        let run_count_clone = run_count.clone();

        let effect = Effect::new(move || {
            run_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Effect should have run once on creation
        assert_eq!(run_count.load(Ordering::SeqCst), 1);
        assert_eq!(effect.run_count(), 1);
    }

    #[test]
    fn effect_reruns_when_dependency_changes() {
        let signal = Signal::new(0);
        let observed = Arc::new(AtomicI32::new(-1));
        let observed_clone = observed.clone();

        let source = signal.clone();
        let effect = Effect::new(move || {
            observed_clone.store(source.get(), Ordering::SeqCst);
        });

        assert_eq!(observed.load(Ordering::SeqCst), 0);
        assert_eq!(effect.dependency_count(), 1);

        signal.set(42);
        assert_eq!(observed.load(Ordering::SeqCst), 42);
        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn effect_does_not_run_after_disposal() {
        let signal = Signal::new(0);
        let run_count = Arc::new(AtomicI32::new(0));
        let run_count_clone = run_count.clone();

        let source = signal.clone();
        let effect = Effect::new(move || {
            source.get();
            run_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        effect.dispose();
        effect.dispose();
        assert!(effect.is_disposed());
        assert_eq!(signal.subscriber_count(), 0);

        signal.set(1);
        signal.set(2);
        assert_eq!(run_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_runs_before_rerun_and_on_dispose() {
        let signal = Signal::new(0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let source = signal.clone();
        let log_clone = log.clone();
        let effect = Effect::with_cleanup(move || {
            let value = source.get();
            log_clone.lock().push(format!("run {value}"));
            let log = log_clone.clone();
            move || log.lock().push(format!("cleanup {value}"))
        });

        signal.set(1);
        effect.dispose();
        signal.set(2);

        assert_eq!(
            *log.lock(),
            vec!["run 0", "cleanup 0", "run 1", "cleanup 1"]
        );
    }

    #[test]
    fn effect_retracks_dependencies_each_run() {
        let cond = Signal::new(true);
        let a = Signal::new(0);
        let b = Signal::new(0);
        let runs = Arc::new(AtomicI32::new(0));

        let (c, sa, sb, r) = (cond.clone(), a.clone(), b.clone(), runs.clone());
        let _effect = Effect::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
            if c.get() {
                sa.get();
            } else {
                sb.get();
            }
        });

        cond.set(false);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        a.set(1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        b.set(1);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn batched_writes_run_effect_once() {
        let a = Signal::new(0);
        let b = Signal::new(0);
        let runs = Arc::new(AtomicI32::new(0));

        let (sa, sb, r) = (a.clone(), b.clone(), runs.clone());
        let _effect = Effect::new(move || {
            sa.get();
            sb.get();
            r.fetch_add(1, Ordering::SeqCst);
        });

        batch(|| {
            a.set(1);
            b.set(1);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn effect_can_dispose_itself() {
        let signal = Signal::new(0);
        let slot: Arc<Mutex<Option<Effect>>> = Arc::new(Mutex::new(None));
        let cleaned = Arc::new(AtomicI32::new(0));

        let (source, slot_clone, cleaned_clone) = (signal.clone(), slot.clone(), cleaned.clone());
        let effect = Effect::with_cleanup(move || {
            if source.get() >= 2 {
                if let Some(me) = slot_clone.lock().clone() {
                    me.dispose();
                }
            }
            let cleaned = cleaned_clone.clone();
            move || {
                cleaned.fetch_add(1, Ordering::SeqCst);
            }
        });
        *slot.lock() = Some(effect.clone());

        signal.set(1);
        signal.set(2);
        assert!(effect.is_disposed());
        assert_eq!(effect.dependency_count(), 0);
        assert_eq!(signal.subscriber_count(), 0);
        // Cleanups from runs 0 and 1, plus the final one at teardown.
        assert_eq!(cleaned.load(Ordering::SeqCst), 3);

        signal.set(3);
        assert_eq!(effect.run_count(), 3);
    }

    #[test]
    fn body_writes_do_not_retrigger_itself() {
        let signal = Signal::new(0);
        let source = signal.clone();

        // Subscriptions are rebuilt only after the body returns, so the
        // body's own write is not observed by this run.
        let effect = Effect::new(move || {
            let value = source.get();
            if value < 5 {
                source.set(value + 1);
            }
        });

        assert_eq!(signal.get(), 1);
        assert_eq!(effect.run_count(), 1);

        signal.set(3);
        assert_eq!(signal.get(), 4);
        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn runaway_cleanup_is_capped() {
        let signal = Signal::new(0_u64);
        let (source, writer) = (signal.clone(), signal.clone());

        // Every cleanup bumps the dependency the next run reads.
        let effect = Effect::with_cleanup(move || {
            source.get();
            let writer = writer.clone();
            move || writer.update(|v| v + 1)
        });
        assert_eq!(effect.run_count(), 1);

        signal.set(100);

        let iterations = MAX_EFFECT_RERUNS + 1;
        assert_eq!(effect.run_count(), 1 + iterations);
        assert_eq!(signal.get(), 100 + iterations as u64);
        assert!(!effect.is_disposed());
        assert_eq!(effect.dependency_count(), 1);
    }

    #[test]
    fn panicking_first_run_disposes_effect() {
        let signal = Signal::new(0);
        let source = signal.clone();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            Effect::new(move || {
                source.get();
                panic!("bad effect");
            })
        }));

        assert!(result.is_err());
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn panicking_rerun_is_isolated_and_recovers() {
        let signal = Signal::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (source, seen_clone) = (signal.clone(), seen.clone());
        let _effect = Effect::new(move || {
            let value = source.get();
            if value == 1 {
                panic!("odd state");
            }
            seen_clone.lock().push(value);
        });

        let other = Arc::new(AtomicI32::new(0));
        let other_clone = other.clone();
        let _sub = signal.subscribe(move |_| {
            other_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(1);
        assert_eq!(other.load(Ordering::SeqCst), 1);

        signal.set(2);
        assert_eq!(*seen.lock(), vec![0, 2]);
    }

    #[test]
    fn effect_observes_computed_updates() {
        let count = Signal::new(0);
        let source = count.clone();
        let doubled = Computed::new(move || source.get() * 2);

        let log = Arc::new(Mutex::new(Vec::new()));
        let (d, l) = (doubled.clone(), log.clone());
        let _effect = Effect::new(move || l.lock().push(d.get()));

        count.set(5);
        assert_eq!(*log.lock(), vec![0, 10]);
    }
}
