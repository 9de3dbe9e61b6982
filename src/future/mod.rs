//! Single-assignment values.
//!
//! A [`Future<T>`] is written at most once and read any number of times after
//! that. Reading an unassigned future blocks, but a worker thread blocked in
//! [`Future::get`] keeps running other ready tasks of its pool in the
//! meantime (see [`crate::engine`]).
//!
//! Most futures in numeric code are created around a value that is already
//! known, for example to pass a constant as a task argument.
//! [`Future::ready`] covers that case without allocating any shared state.
//! The general form is a reference-counted cell that holds the value once
//! assigned, the callbacks waiting for it, the futures chained to it by
//! [`Future::link`], and optionally a link to a process that owns the real
//! copy. Writes to such a future are relayed to its owner.

mod remote;

use std::any::type_name;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::engine::tracking::{CallbackList, CallbackRef, Signal, run_callbacks};
use crate::engine::wait;
use crate::error::{ContractViolation, violation};

pub use crate::future::remote::RemoteRef;
pub(crate) use crate::future::remote::{Export, FailMessage, RemoteLink, SetMessage, SlotTable};

const MAX_CALLBACKS: usize = 4;

struct FutureState<T> {
    callbacks: CallbackList<MAX_CALLBACKS>,
    chained: SmallVec<[Arc<FutureImpl<T>>; MAX_CALLBACKS]>,
    remote: Option<RemoteLink<T>>,
    /// Slot table entries through which other processes may still assign us.
    exports: SmallVec<[Export; 1]>,
    #[cfg(test)]
    registered: usize,
}

/// Shared state of a deferred future.
///
/// `value` and `failure` are only written with `state` locked, and at most one
/// of them is ever written.
pub(crate) struct FutureImpl<T> {
    value: OnceLock<T>,
    /// Panic message of the task that should have produced the value.
    failure: OnceLock<Arc<str>>,
    state: Mutex<FutureState<T>>,
}

impl<T> FutureImpl<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(remote: Option<RemoteLink<T>>) -> Self {
        Self {
            value: OnceLock::new(),
            failure: OnceLock::new(),
            state: Mutex::new(FutureState {
                callbacks: SmallVec::new(),
                chained: SmallVec::new(),
                remote,
                exports: SmallVec::new(),
                #[cfg(test)]
                registered: 0,
            }),
        }
    }

    fn describe(&self) -> String {
        format!("{}@{:p}", type_name::<T>(), self)
    }

    fn probe(&self) -> bool {
        self.value.get().is_some()
    }

    fn is_settled(&self) -> bool {
        self.probe() || self.failure.get().is_some()
    }

    fn is_local(&self) -> bool {
        self.state.lock().remote.is_none()
    }

    pub(crate) fn set(&self, value: T) {
        let (value, callbacks, chained, remote, exports) = {
            let mut state = self.state.lock();
            let mut stored = false;
            let value = match self.failure.get() {
                Some(_) => None,
                None => Some(self.value.get_or_init(|| {
                    stored = true;
                    value
                })),
            };

            let Some(value) = value.filter(|_| stored) else {
                drop(state);
                violation(ContractViolation::DoubleSet {
                    future: self.describe(),
                });
            };

            (
                value,
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.chained),
                state.remote.take(),
                std::mem::take(&mut state.exports),
            )
        };

        exports.into_iter().for_each(Export::withdraw);

        if let Some(link) = remote {
            link.relay(value);
        }

        run_callbacks(callbacks);

        for future in chained {
            future.set(value.clone());
        }
    }

    /// Marks the future as never to be assigned because the task producing
    /// it panicked. Waiters wake up and re-raise `failure`. Does nothing once
    /// the future is assigned.
    pub(crate) fn fail(&self, failure: Arc<str>) {
        let (failure, callbacks, chained, remote, exports) = {
            let mut state = self.state.lock();
            if self.is_settled() {
                return;
            }

            (
                self.failure.get_or_init(|| failure),
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.chained),
                state.remote.take(),
                std::mem::take(&mut state.exports),
            )
        };

        tracing::debug!(future = %self.describe(), "future failed: {failure}");
        exports.into_iter().for_each(Export::withdraw);

        if let Some(link) = remote {
            link.relay_failure(failure);
        }

        run_callbacks(callbacks);

        for future in chained {
            future.fail(failure.clone());
        }
    }

    fn get(&self) -> &T {
        if let Some(value) = self.value.get() {
            return value;
        }

        if let Some(failure) = self.failure.get() {
            panic!("future {} will never be assigned: {failure}", self.describe());
        }

        if let Some(link) = &self.state.lock().remote {
            let owner = link.owner();
            violation(ContractViolation::RemoteGet {
                future: self.describe(),
                owner,
            });
        }

        let signal = Arc::new(Signal::default());
        self.register_callback(signal.clone());
        wait::cooperate(|| self.is_settled(), |timeout| signal.wait_for(timeout));

        self.get()
    }

    fn register_callback(&self, callback: CallbackRef) {
        {
            let mut state = self.state.lock();
            #[cfg(test)]
            {
                state.registered += 1;
            }
            if !self.is_settled() {
                state.callbacks.push(callback);
                return;
            }
        }

        callback.notify();
    }

    /// Arranges for `target` to receive this future's value.
    fn chain(&self, target: Arc<FutureImpl<T>>) {
        {
            let mut state = self.state.lock();
            if !self.is_settled() {
                state.chained.push(target);
                return;
            }
        }

        match (self.value.get(), self.failure.get()) {
            (Some(value), _) => target.set(value.clone()),
            (None, Some(failure)) => target.fail(failure.clone()),
            (None, None) => {}
        }
    }
}

enum Repr<T> {
    Ready(T),
    Deferred(Arc<FutureImpl<T>>),
}

/// A single-assignment value, possibly not yet known, possibly owned by
/// another process.
///
/// Cloning a future is shallow: all clones observe the same assignment.
///
/// ```rust
/// use mikomi::Future;
///
/// let a = Future::<i32>::new();
/// let b = a.clone();
/// a.set(42);
/// assert_eq!(*b.get(), 42);
/// ```
pub struct Future<T> {
    repr: Repr<T>,
}

impl<T> Future<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an unassigned local future.
    pub fn new() -> Self {
        Self::deferred(FutureImpl::new(None))
    }

    /// Creates a future that already holds `value`.
    pub fn ready(value: T) -> Self {
        Self {
            repr: Repr::Ready(value),
        }
    }

    fn deferred(inner: FutureImpl<T>) -> Self {
        Self {
            repr: Repr::Deferred(Arc::new(inner)),
        }
    }

    /// Returns `true` once the value has been assigned.
    pub fn probe(&self) -> bool {
        match &self.repr {
            Repr::Ready(_) => true,
            Repr::Deferred(inner) => inner.probe(),
        }
    }

    /// `false` while writes to this future are forwarded to another process.
    pub fn is_local(&self) -> bool {
        match &self.repr {
            Repr::Ready(_) => true,
            Repr::Deferred(inner) => inner.is_local(),
        }
    }

    pub fn is_remote(&self) -> bool {
        !self.is_local()
    }

    /// Assigns the value, then runs the registered callbacks in registration
    /// order and sets every future linked to this one.
    ///
    /// A future forwarding to another process relays the value to its owner
    /// and keeps a local copy.
    ///
    /// # Panics
    ///
    /// Assigning a future a second time is a contract violation. The first
    /// value stays in place.
    pub fn set(&self, value: T) {
        match &self.repr {
            Repr::Ready(_) => violation(ContractViolation::SetImmediate {
                future: type_name::<T>().to_string(),
            }),
            Repr::Deferred(inner) => inner.set(value),
        }
    }

    /// Returns the value, waiting for it if necessary.
    ///
    /// # Panics
    ///
    /// Waiting on a future whose value will be delivered to another process
    /// is a contract violation. If the task producing the value panicked,
    /// its message is raised here again.
    pub fn get(&self) -> &T {
        match &self.repr {
            Repr::Ready(value) => value,
            Repr::Deferred(inner) => inner.get(),
        }
    }

    /// Makes this future resolve to the same value as `other`. If `other` is
    /// already assigned this is an immediate [`set`](Self::set).
    ///
    /// Links must not form a cycle.
    pub fn link(&self, other: &Future<T>) {
        let target = match &self.repr {
            Repr::Ready(_) => violation(ContractViolation::SetImmediate {
                future: type_name::<T>().to_string(),
            }),
            Repr::Deferred(inner) => inner,
        };

        if target.probe() {
            violation(ContractViolation::DoubleSet {
                future: target.describe(),
            });
        }

        match &other.repr {
            Repr::Ready(value) => target.set(value.clone()),
            Repr::Deferred(source) if Arc::ptr_eq(source, target) => {}
            Repr::Deferred(source) => source.chain(target.clone()),
        }
    }

    /// Runs `callback` once the value is assigned, or right away if it
    /// already is.
    pub fn register_callback(&self, callback: CallbackRef) {
        match &self.repr {
            Repr::Ready(_) => callback.notify(),
            Repr::Deferred(inner) => inner.register_callback(callback),
        }
    }

    /// `true` if the task that was to assign this future panicked instead.
    pub fn is_failed(&self) -> bool {
        match &self.repr {
            Repr::Ready(_) => false,
            Repr::Deferred(inner) => inner.failure.get().is_some(),
        }
    }

    pub(crate) fn fail(&self, failure: Arc<str>) {
        if let Repr::Deferred(inner) = &self.repr {
            inner.fail(failure);
        }
    }

    /// Number of callbacks ever registered on this future, run or not.
    #[cfg(test)]
    pub(crate) fn callbacks_registered(&self) -> usize {
        match &self.repr {
            Repr::Ready(_) => 0,
            Repr::Deferred(inner) => inner.state.lock().registered,
        }
    }
}

impl<T> Default for Future<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Clone for Future<T> {
    fn clone(&self) -> Self {
        let repr = match &self.repr {
            Repr::Ready(value) => Repr::Ready(value.clone()),
            Repr::Deferred(inner) => Repr::Deferred(inner.clone()),
        };

        Self { repr }
    }
}

impl<T> From<T> for Future<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        Self::ready(value)
    }
}

impl<T> std::fmt::Debug for Future<T>
where
    T: std::fmt::Debug + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.repr {
            Repr::Ready(value) => write!(f, "Future({value:?})"),
            Repr::Deferred(inner) => match inner.value.get() {
                Some(value) => write!(f, "Future({value:?})"),
                None if inner.failure.get().is_some() => write!(f, "Future(<failed>)"),
                None if inner.is_local() => write!(f, "Future(<unassigned>)"),
                None => write!(f, "Future(<remote>)"),
            },
        }
    }
}
