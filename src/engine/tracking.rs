use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::error::{ContractViolation, violation};

/// Something to be told, once, that a value or a set of prerequisites became
/// available.
pub trait Callback: Send + Sync {
    fn notify(&self);
}

/// Shared handle to a callback.
pub type CallbackRef = Arc<dyn Callback>;

struct FnCallback<F>(Mutex<Option<F>>);

impl<F> Callback for FnCallback<F>
where
    F: FnOnce() + Send,
{
    fn notify(&self) {
        let func = self.0.lock().take();
        if let Some(func) = func {
            func();
        }
    }
}

/// Wraps a closure as a [`Callback`]. The closure runs on the first
/// notification only.
pub fn callback<F>(func: F) -> CallbackRef
where
    F: FnOnce() + Send + 'static,
{
    Arc::new(FnCallback(Mutex::new(Some(func))))
}

pub(crate) const MAX_CALLBACKS: usize = 8;

pub(crate) type CallbackList<const N: usize> = SmallVec<[CallbackRef; N]>;

/// Runs callbacks taken out of their owner. The owner's lock must already be
/// released, a callback may drop the owner.
pub(crate) fn run_callbacks<const N: usize>(callbacks: CallbackList<N>) {
    for callback in callbacks {
        callback.notify();
    }
}

struct TrackerState {
    pending: i64,
    callbacks: CallbackList<MAX_CALLBACKS>,
}

/// Counts outstanding prerequisites and fires its callbacks exactly once,
/// when the count reaches zero.
///
/// A tracker created with `n` pending dependencies fires after exactly `n`
/// calls to [`dec`](Self::dec), whatever their order or the threads they come
/// from. It is also a [`Callback`] itself: notifying a tracker decrements it,
/// which lets one tracker wait on several futures.
///
/// Dropping a tracker whose count is not zero means a promised dependency was
/// lost, and is a contract violation.
pub struct DependencyTracker {
    state: Mutex<TrackerState>,
}

impl DependencyTracker {
    pub fn new(pending: i64) -> Self {
        if pending < 0 {
            violation(ContractViolation::NegativeCount(pending));
        }

        Self {
            state: Mutex::new(TrackerState {
                pending,
                callbacks: SmallVec::new(),
            }),
        }
    }

    /// Number of unsatisfied dependencies.
    pub fn pending(&self) -> i64 {
        self.state.lock().pending
    }

    pub fn probe(&self) -> bool {
        self.pending() == 0
    }

    pub fn inc(&self) {
        self.state.lock().pending += 1;
    }

    pub fn dec(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.pending == 0 {
                drop(state);
                violation(ContractViolation::DecrementBelowZero {
                    tracker: format!("{:p}", self),
                });
            }

            state.pending -= 1;
            if state.pending != 0 {
                return;
            }

            std::mem::take(&mut state.callbacks)
        };

        run_callbacks(callbacks);
    }

    /// Registers `callback` to run when the count reaches zero. If it already
    /// is zero the callback runs right away, on this thread.
    pub fn register_callback(&self, callback: CallbackRef) {
        {
            let mut state = self.state.lock();
            if state.pending != 0 {
                state.callbacks.push(callback);
                return;
            }
        }

        callback.notify();
    }
}

impl Callback for DependencyTracker {
    fn notify(&self) {
        self.dec();
    }
}

impl std::fmt::Debug for DependencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DependencyTracker")
            .field("pending", &state.pending)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

impl Drop for DependencyTracker {
    fn drop(&mut self) {
        let pending = self.state.get_mut().pending;
        if pending != 0 && !std::thread::panicking() {
            violation(ContractViolation::PendingOnDrop {
                tracker: format!("{:p}", self),
                pending,
            });
        }
    }
}

/// One-shot flag a waiting thread can sleep on.
#[derive(Default)]
pub(crate) struct Signal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn is_fired(&self) -> bool {
        *self.fired.lock()
    }

    /// Sleeps until fired or until `timeout` elapses.
    pub(crate) fn wait_for(&self, timeout: Duration) {
        let mut fired = self.fired.lock();
        if !*fired {
            self.cond.wait_for(&mut fired, timeout);
        }
    }
}

impl Callback for Signal {
    fn notify(&self) {
        *self.fired.lock() = true;
        self.cond.notify_all();
    }
}
