#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod atomic;
mod cluster;
mod codec;
mod core;
pub mod engine;
mod error;
pub mod future;
#[cfg(feature = "logging")]
mod logging;
pub mod transport;
mod world;

pub use crate::atomic::AtomicCounter;
pub use crate::cluster::Cluster;
pub use crate::core::{Config, Locality, Priority, ProcessId, TaskAttributes};
pub use crate::engine::{
    Callback, CallbackRef, DependencyTracker, Range, Split, TaskArg, TaskArgs, TaskFn, TaskQueue,
    callback,
};
pub use crate::error::*;
pub use crate::future::{Future, RemoteRef};
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::world::{TaskId, World};
