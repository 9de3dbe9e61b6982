//! Point-to-point delivery of opaque messages between processes.
//!
//! The runtime only needs one primitive from the outside world: hand a byte
//! payload to a named handler on another process. Messages from one sender to
//! one receiver arrive in the order they were sent, there is no other ordering
//! guarantee.

mod channel;

use serde::{Deserialize, Serialize};

use crate::core::ProcessId;
use crate::error::TransportError;

pub use channel::{ChannelTransport, mesh};

/// Names the receiving side of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerId(pub u16);

impl HandlerId {
    /// Assigns a future previously exported by the receiver.
    pub const SET_FUTURE: Self = Self(1);
    /// Runs a registered task on the receiver.
    pub const SPAWN_TASK: Self = Self(2);
    /// Tells the receiver that an exported future will never be assigned.
    pub const FAIL_FUTURE: Self = Self(3);
}

/// A message as it arrives at its destination.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub source: ProcessId,
    pub handler: HandlerId,
    pub payload: Vec<u8>,
}

pub trait Transport: Send + Sync + 'static {
    /// Rank of the local process.
    fn rank(&self) -> ProcessId;

    /// Number of processes reachable through this transport.
    fn size(&self) -> usize;

    fn send(
        &self,
        dest: ProcessId,
        handler: HandlerId,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;
}
