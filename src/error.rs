use thiserror::Error;

use crate::core::ProcessId;
use crate::transport::HandlerId;
use crate::world::TaskId;

/// Failure to turn a value into a CBOR payload or back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Couldn't encode payload.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode payload.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Payload has the wrong shape.\n{0}")]
    Value(#[from] ciborium::value::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Process {0} is not part of this world")]
    UnknownProcess(ProcessId),

    #[error("Process {0} is no longer receiving messages")]
    Disconnected(ProcessId),
}

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("Failed to build the worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to spawn the message dispatcher")]
    Spawn(#[from] std::io::Error),

    #[error("Invalid configuration.\n{0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("No message handler registered for {0:?}")]
    UnknownHandler(HandlerId),

    #[error("No task registered for {0:?}")]
    UnknownTask(TaskId),

    #[error("Remote reference {0} does not point at a live future")]
    UnknownSlot(u64),

    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("Message handler panicked: {0}")]
    HandlerPanicked(String),
}

/// Misuse of the runtime. These are never returned to the caller, see
/// [`violation`].
#[derive(Debug, Error)]
pub enum ContractViolation {
    #[error("future {future} assigned twice")]
    DoubleSet { future: String },

    #[error("future {future} was created holding a value and cannot be assigned")]
    SetImmediate { future: String },

    #[error("future {future} forwards to process {owner}, its value cannot be read here")]
    RemoteGet { future: String, owner: ProcessId },

    #[error("remote reference requested for future {future} which is already assigned")]
    RemoteRefAssigned { future: String },

    #[error("remote reference {handle} on process {owner} is not a live {expected}")]
    BadLoopbackRef {
        owner: ProcessId,
        handle: u64,
        expected: &'static str,
    },

    #[error("dependency tracker {tracker} dropped with {pending} unsatisfied dependencies")]
    PendingOnDrop { tracker: String, pending: i64 },

    #[error("dependency tracker created with negative count {0}")]
    NegativeCount(i64),

    #[error("dependency tracker {tracker} decremented below zero")]
    DecrementBelowZero { tracker: String },

    #[error("argument {index} of a task sent to process {dest} is not assigned")]
    UnreadyRemoteArgument { dest: ProcessId, index: usize },

    #[error("task queue used after its world was dropped")]
    WorldGone,
}

/// Logs the violated invariant and unwinds.
#[track_caller]
pub(crate) fn violation(err: ContractViolation) -> ! {
    tracing::error!(%err, "contract violation");
    panic!("contract violation: {err}")
}

/// Fire-and-forget paths have no caller to hand an error back to.
#[track_caller]
pub(crate) fn fatal(context: &str, err: impl std::fmt::Display) -> ! {
    tracing::error!(%err, "{context}");
    panic!("{context}: {err}")
}
