use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use ciborium::Value;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::core::ProcessId;
use crate::error::{CodecError, ContractViolation, fatal, violation};
use crate::future::{Future, FutureImpl, Repr};
use crate::transport::{HandlerId, Transport};
use crate::world::{World, WorldInner};

/// Serializable name of a future living on some process.
///
/// A reference is a one-time token: it is consumed by the first value
/// delivered through it, or by converting it back into a future on its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    pub owner: ProcessId,
    pub handle: u64,
}

/// Body of a [`HandlerId::SET_FUTURE`] message.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SetMessage {
    pub target: u64,
    pub value: Value,
}

/// Body of a [`HandlerId::FAIL_FUTURE`] message.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FailMessage {
    pub target: u64,
    pub failure: String,
}

/// Where and how to forward the value of a proxy future.
pub(crate) struct RemoteLink<T> {
    target: RemoteRef,
    transport: Arc<dyn Transport>,
    encode: fn(&T) -> Result<Value, CodecError>,
}

impl<T> RemoteLink<T> {
    pub(crate) fn owner(&self) -> ProcessId {
        self.target.owner
    }

    pub(crate) fn relay(self, value: &T) {
        let payload = (self.encode)(value).and_then(|value| {
            codec::encode(&SetMessage {
                target: self.target.handle,
                value,
            })
        });

        self.forward(HandlerId::SET_FUTURE, payload);
    }

    pub(crate) fn relay_failure(self, failure: &str) {
        let payload = codec::encode(&FailMessage {
            target: self.target.handle,
            failure: failure.to_string(),
        });

        self.forward(HandlerId::FAIL_FUTURE, payload);
    }

    fn forward(&self, handler: HandlerId, payload: Result<Vec<u8>, CodecError>) {
        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => fatal("couldn't encode a value for its owner", err),
        };

        tracing::trace!(owner = self.target.owner, handle = self.target.handle, "relaying value");
        if let Err(err) = self.transport.send(self.target.owner, handler, payload) {
            fatal("couldn't relay a value to its owner", err);
        }
    }
}

/// A slot table entry held by the future it points at, so a future assigned
/// locally can retract the references it handed out.
pub(crate) struct Export {
    world: Weak<WorldInner>,
    handle: u64,
}

impl Export {
    pub(crate) fn withdraw(self) {
        if let Some(inner) = self.world.upgrade() {
            World::from_inner(inner).slots().remove(self.handle);
        }
    }
}

/// Type-erased future registered to receive a value from another process.
pub(crate) trait RemoteSlot: Send + Sync + 'static {
    fn deliver(&self, value: &Value) -> Result<(), CodecError>;

    fn deliver_failure(&self, failure: Arc<str>);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> RemoteSlot for FutureImpl<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn deliver(&self, value: &Value) -> Result<(), CodecError> {
        let value: T = codec::from_value(value)?;
        self.set(value);
        Ok(())
    }

    fn deliver_failure(&self, failure: Arc<str>) {
        self.fail(failure);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Futures of this process that have handed out a [`RemoteRef`] and wait
/// for a value to come back through it.
#[derive(Default)]
pub(crate) struct SlotTable {
    next: AtomicU64,
    slots: Mutex<HashMap<u64, Arc<dyn RemoteSlot>>>,
}

impl SlotTable {
    pub(crate) fn insert(&self, slot: Arc<dyn RemoteSlot>) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().insert(handle, slot);
        handle
    }

    pub(crate) fn take(&self, handle: u64) -> Option<Arc<dyn RemoteSlot>> {
        self.slots.lock().remove(&handle)
    }

    pub(crate) fn remove(&self, handle: u64) {
        if self.take(handle).is_some() {
            tracing::trace!(handle, "withdrew remote reference");
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Value, CodecError> {
    codec::to_value(value)
}

impl<T> Future<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Returns a reference other processes can use to assign this future.
    ///
    /// A proxy future hands out the reference it already forwards to, so a
    /// value written anywhere along the way goes straight to the owner.
    ///
    /// # Panics
    ///
    /// Asking an assigned future for a remote reference is a contract
    /// violation.
    pub fn remote_ref(&self, world: &World) -> RemoteRef {
        if let Repr::Deferred(inner) = &self.repr {
            if let Some(link) = &inner.state.lock().remote {
                return link.target;
            }
        }

        self.export(world)
    }

    /// Registers this future in the world's slot table, even if it already
    /// forwards somewhere else. A value arriving through the new reference
    /// is then relayed on again.
    pub(crate) fn export(&self, world: &World) -> RemoteRef {
        let inner = match &self.repr {
            Repr::Deferred(inner) => inner,
            Repr::Ready(_) => violation(ContractViolation::RemoteRefAssigned {
                future: type_name::<T>().to_string(),
            }),
        };

        let mut state = inner.state.lock();
        if inner.is_settled() {
            drop(state);
            violation(ContractViolation::RemoteRefAssigned {
                future: inner.describe(),
            });
        }

        let handle = world.slots().insert(inner.clone());
        state.exports.push(Export {
            world: world.downgrade(),
            handle,
        });

        RemoteRef {
            owner: world.rank(),
            handle,
        }
    }

    /// Turns a reference back into a future.
    ///
    /// On the owning process this is the very future the reference was taken
    /// from. Anywhere else it is a proxy whose [`set`](Self::set) sends the
    /// value to the owner.
    ///
    /// # Panics
    ///
    /// A reference owned by this process must still be live and name a future
    /// of type `T`.
    pub fn from_remote(world: &World, target: RemoteRef) -> Self {
        if target.owner != world.rank() {
            let link = RemoteLink {
                target,
                transport: world.transport().clone(),
                encode: encode_value::<T>,
            };

            return Self::deferred(FutureImpl::new(Some(link)));
        }

        let bad_ref = || ContractViolation::BadLoopbackRef {
            owner: target.owner,
            handle: target.handle,
            expected: type_name::<Future<T>>(),
        };

        let Some(slot) = world.slots().take(target.handle) else {
            violation(bad_ref());
        };

        match slot.into_any().downcast::<FutureImpl<T>>() {
            Ok(inner) => Self {
                repr: Repr::Deferred(inner),
            },
            Err(_) => violation(bad_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::core::Config;
    use std::time::Duration;

    fn cluster(size: usize) -> Cluster {
        Cluster::new(size, Config::new().workers(2)).unwrap()
    }

    /// Waits on a future that another process assigns from its dispatcher.
    fn wait_for<T>(future: &Future<T>) -> &T
    where
        T: Clone + Send + Sync + 'static,
    {
        for _ in 0..500 {
            if future.probe() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        future.get()
    }

    #[test]
    fn test_loopback_returns_same_future() {
        let cluster = cluster(1);
        let world = cluster.world(0);

        let local = Future::<u32>::new();
        let rref = local.remote_ref(world);
        assert_eq!(rref.owner, 0);

        let back = Future::<u32>::from_remote(world, rref);
        assert!(back.is_local());
        back.set(9);
        assert_eq!(*local.get(), 9);
        assert_eq!(world.slots().len(), 0);
    }

    #[test]
    fn test_proxy_relays_to_owner() {
        let cluster = cluster(2);
        let owner = cluster.world(0);
        let other = cluster.world(1);

        let local = Future::<String>::new();
        let rref = local.remote_ref(owner);

        let proxy = Future::<String>::from_remote(other, rref);
        assert!(proxy.is_remote());
        assert!(!proxy.probe());
        proxy.set(String::from("hello"));

        assert_eq!(wait_for(&local), "hello");
        assert!(proxy.probe());
    }

    #[test]
    fn test_remote_ref_of_proxy_short_circuits() {
        let cluster = cluster(2);
        let local = Future::<i64>::new();
        let rref = local.remote_ref(cluster.world(0));

        let proxy = Future::<i64>::from_remote(cluster.world(1), rref);
        assert_eq!(proxy.remote_ref(cluster.world(1)), rref);
    }

    #[test]
    fn test_multi_hop_relay() {
        let cluster = cluster(3);
        let (a, b, c) = (cluster.world(0), cluster.world(1), cluster.world(2));

        let origin = Future::<u64>::new();
        let on_b = Future::<u64>::from_remote(b, origin.remote_ref(a));
        let on_c = Future::<u64>::from_remote(c, on_b.export(b));

        on_c.set(77);
        assert_eq!(*wait_for(&origin), 77);
        assert_eq!(*wait_for(&on_b), 77);
    }

    #[test]
    fn test_local_set_withdraws_reference() {
        let cluster = cluster(2);
        let world = cluster.world(0);

        let local = Future::<u8>::new();
        let first = local.remote_ref(world);
        let second = local.export(world);
        assert_ne!(first, second);
        assert_eq!(world.slots().len(), 2);

        local.set(3);
        assert_eq!(world.slots().len(), 0);
    }

    #[test]
    fn test_failure_reaches_owner() {
        let cluster = cluster(2);
        let local = Future::<u32>::new();
        let proxy = Future::<u32>::from_remote(cluster.world(1), local.remote_ref(cluster.world(0)));

        proxy.fail(Arc::from("lost on the way"));
        for _ in 0..500 {
            if local.is_failed() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        assert!(local.is_failed());
        assert_eq!(cluster.world(0).slots().len(), 0);
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn test_get_on_proxy() {
        let cluster = cluster(2);
        let local = Future::<u8>::new();
        let proxy = Future::<u8>::from_remote(cluster.world(1), local.remote_ref(cluster.world(0)));
        proxy.get();
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn test_remote_ref_of_assigned() {
        let cluster = cluster(1);
        let future = Future::new();
        future.set(1u8);
        future.remote_ref(cluster.world(0));
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn test_loopback_type_mismatch() {
        let cluster = cluster(1);
        let world = cluster.world(0);
        let rref = Future::<u8>::new().remote_ref(world);
        Future::<String>::from_remote(world, rref);
    }
}
