//! Dependency-gated task execution.
//!
//! A task is a closure plus a list of arguments, some of which may be
//! futures that are not assigned yet. The queue counts the unready ones in
//! the task's [`DependencyTracker`] and hands the task to the worker pool
//! once the count reaches zero.

mod node;
mod queue;
mod range;
pub(crate) mod tracking;
pub(crate) mod wait;

use std::any::Any;

use crate::future::Future;

pub use crate::engine::queue::{TaskFn, TaskQueue};
pub use crate::engine::range::{Range, Split};
pub use crate::engine::tracking::{Callback, CallbackRef, DependencyTracker, callback};

pub(crate) use crate::engine::queue::SpawnMessage;

/// A single task argument.
///
/// Implemented for [`Future<T>`], which resolves to `T`, and for
/// `Vec<Future<T>>`, which resolves to `Vec<T>` and counts one dependency per
/// unassigned element.
pub trait TaskArg: Send + 'static {
    type Value: Send + 'static;

    fn is_ready(&self) -> bool;

    /// Adds one pending dependency to `deps` per unassigned future and
    /// registers `node` to be notified when that future resolves.
    fn register(&self, node: &CallbackRef, deps: &DependencyTracker);

    /// Extracts the assigned value. Only called once every future is ready.
    fn resolve(self) -> Self::Value;
}

impl<T> TaskArg for Future<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn is_ready(&self) -> bool {
        self.probe()
    }

    fn register(&self, node: &CallbackRef, deps: &DependencyTracker) {
        if !self.probe() {
            deps.inc();
            self.register_callback(node.clone());
        }
    }

    fn resolve(self) -> T {
        self.get().clone()
    }
}

impl<T> TaskArg for Vec<Future<T>>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = Vec<T>;

    fn is_ready(&self) -> bool {
        self.iter().all(Future::probe)
    }

    fn register(&self, node: &CallbackRef, deps: &DependencyTracker) {
        for future in self {
            TaskArg::register(future, node, deps);
        }
    }

    fn resolve(self) -> Vec<T> {
        self.into_iter().map(TaskArg::resolve).collect()
    }
}

/// The complete argument list of a task.
///
/// Implemented for `()`, for any single [`TaskArg`], and for tuples of up to
/// nine of them. The task body receives [`Values`](TaskArgs::Values), the
/// same shape with every future replaced by its value.
pub trait TaskArgs: Send + 'static {
    type Values: Send + 'static;

    /// Position of the first argument that is not ready, if any.
    fn first_unready(&self) -> Option<usize>;

    fn register(&self, node: &CallbackRef, deps: &DependencyTracker);

    fn resolve(self) -> Self::Values;
}

impl TaskArgs for () {
    type Values = ();

    fn first_unready(&self) -> Option<usize> {
        None
    }

    fn register(&self, _: &CallbackRef, _: &DependencyTracker) {}

    fn resolve(self) -> Self::Values {}
}

impl<A> TaskArgs for A
where
    A: TaskArg,
{
    type Values = A::Value;

    fn first_unready(&self) -> Option<usize> {
        (!self.is_ready()).then_some(0)
    }

    fn register(&self, node: &CallbackRef, deps: &DependencyTracker) {
        TaskArg::register(self, node, deps);
    }

    fn resolve(self) -> Self::Values {
        TaskArg::resolve(self)
    }
}

macro_rules! impl_args {
    ($($A:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($A),*> TaskArgs for ($($A,)*)
        where
            $($A: TaskArg),* {
            type Values = ($($A::Value,)*);

            fn first_unready(&self) -> Option<usize> {
                let ($($A,)*) = self;
                [$($A.is_ready(),)*].iter().position(|ready| !ready)
            }

            fn register(&self, node: &CallbackRef, deps: &DependencyTracker) {
                let ($($A,)*) = self;
                $(TaskArg::register($A, node, deps);)*
            }

            fn resolve(self) -> Self::Values {
                let ($($A,)*) = self;
                ($(TaskArg::resolve($A),)*)
            }
        }
    };
}

impl_args!(A);
impl_args!(A, B);
impl_args!(A, B, C);
impl_args!(A, B, C, D);
impl_args!(A, B, C, D, E);
impl_args!(A, B, C, D, E, F);
impl_args!(A, B, C, D, E, F, G);
impl_args!(A, B, C, D, E, F, G, H);
impl_args!(A, B, C, D, E, F, G, H, I);

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        String::from("<opaque panic payload>")
    }
}
