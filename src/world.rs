//! The per-process runtime context.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::core::{Config, ProcessId, TaskAttributes};
use crate::engine::{SpawnMessage, TaskFn, TaskQueue, panic_message};
use crate::error::WorldError;
use crate::future::{FailMessage, Future, RemoteRef, SetMessage, SlotTable};
use crate::transport::{Envelope, HandlerId, Transport};

/// Process-independent name of a registered task function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Derived from the BLAKE3 hash of the task name, so every process that
    /// registers a name arrives at the same id.
    pub fn of(name: &str) -> Self {
        let hash = blake3::hash(name.as_bytes());
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash.as_bytes()[..8]);
        Self(u64::from_le_bytes(id))
    }
}

/// Type-erased entry of the task registry.
trait Handler: Send + Sync {
    fn spawn(
        &self,
        world: &World,
        attr: TaskAttributes,
        args: &ciborium::Value,
        reply: RemoteRef,
    ) -> Result<(), WorldError>;
}

impl<V, R> Handler for TaskFn<V, R>
where
    V: DeserializeOwned + Send + 'static,
    R: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn spawn(
        &self,
        world: &World,
        attr: TaskAttributes,
        args: &ciborium::Value,
        reply: RemoteRef,
    ) -> Result<(), WorldError> {
        let values: V = codec::from_value(args)?;
        let result = Future::<R>::from_remote(world, reply);
        let failed = result.clone();
        let func = self.func.clone();

        world.taskq().spawn(
            attr,
            (),
            move |()| result.set(func(values)),
            move |failure| failed.fail(failure),
        );
        Ok(())
    }
}

/// Called with the rank and the error when a process receives a message it
/// cannot serve.
pub(crate) type DispatchErrorHook = Arc<dyn Fn(ProcessId, &WorldError) + Send + Sync>;

fn abort_on_dispatch_error(rank: ProcessId, err: &WorldError) {
    tracing::error!(rank, %err, "couldn't serve message, aborting");
    std::process::abort();
}

pub(crate) struct WorldInner {
    rank: ProcessId,
    size: usize,
    config: Config,
    transport: Arc<dyn Transport>,
    taskq: TaskQueue,
    slots: SlotTable,
    registry: RwLock<HashMap<TaskId, Arc<dyn Handler>>>,
    on_dispatch_error: RwLock<DispatchErrorHook>,
    /// Dropped with the world, which stops the dispatcher.
    _shutdown: Sender<()>,
}

/// One process of the runtime: its rank, worker pool, task queue, and the
/// dispatcher that serves incoming messages.
///
/// Cloning is cheap. The dispatcher stops once the last clone is dropped.
#[derive(Clone)]
pub struct World {
    inner: Arc<WorldInner>,
}

impl World {
    /// Starts a process on top of `transport`, serving the messages that
    /// arrive in `inbox`.
    pub fn new<T>(config: Config, transport: T, inbox: Receiver<Envelope>) -> Result<Self, WorldError>
    where
        T: Transport,
    {
        let rank = transport.rank();
        let size = transport.size();
        let pool = config.build_pool(rank)?;
        let (shutdown, stopped) = crossbeam_channel::bounded::<()>(0);

        let inner = Arc::new_cyclic(|weak| WorldInner {
            rank,
            size,
            config: config.clone(),
            transport: Arc::new(transport),
            taskq: TaskQueue::new(rank, pool, weak.clone()),
            slots: SlotTable::default(),
            registry: RwLock::new(HashMap::new()),
            on_dispatch_error: RwLock::new(Arc::new(abort_on_dispatch_error)),
            _shutdown: shutdown,
        });

        let weak = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name(format!("{}-{rank}-dispatch", config.thread_name))
            .spawn(move || dispatch_loop(weak, inbox, stopped))?;

        tracing::debug!(rank, size, "world started");
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<WorldInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<WorldInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn rank(&self) -> ProcessId {
        self.inner.rank
    }

    /// Number of processes in the world.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn taskq(&self) -> &TaskQueue {
        &self.inner.taskq
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn slots(&self) -> &SlotTable {
        &self.inner.slots
    }

    /// Makes `func` callable on this process through
    /// [`TaskQueue::add_on`] under `name`.
    ///
    /// Every process must register the same names with the same argument and
    /// result types. A task sent to a process that lacks the name is a fatal
    /// error there.
    pub fn register_task<V, R, F>(&self, name: &str, func: F) -> Result<TaskFn<V, R>, WorldError>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        R: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
        F: Fn(V) -> R + Send + Sync + 'static,
    {
        let task = TaskFn::new(name, Arc::new(func));
        self.register(&task)?;
        Ok(task)
    }

    /// Replaces what happens when a message cannot be served: a malformed
    /// payload, an unknown task or reference, or a panic in its handler. By
    /// default the error is logged and the process aborts, since the sender
    /// would otherwise wait forever. If `hook` returns, this process stops
    /// serving messages.
    pub fn on_dispatch_error<F>(&self, hook: F)
    where
        F: Fn(ProcessId, &WorldError) + Send + Sync + 'static,
    {
        self.set_dispatch_error_hook(Arc::new(hook));
    }

    pub(crate) fn set_dispatch_error_hook(&self, hook: DispatchErrorHook) {
        *self.inner.on_dispatch_error.write() = hook;
    }

    pub(crate) fn register<V, R>(&self, task: &TaskFn<V, R>) -> Result<(), WorldError>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        R: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        let mut registry = self.inner.registry.write();
        if registry.contains_key(&task.id) {
            return Err(WorldError::DuplicateTask(task.name().to_string()));
        }

        registry.insert(task.id, Arc::new(task.clone()));
        tracing::debug!(rank = self.rank(), name = task.name(), "registered task");
        Ok(())
    }

    fn dispatch(&self, envelope: Envelope) -> Result<(), WorldError> {
        tracing::trace!(
            rank = self.rank(),
            source = envelope.source,
            handler = envelope.handler.0,
            "dispatching message"
        );

        match envelope.handler {
            HandlerId::SET_FUTURE => {
                let message: SetMessage = codec::decode(&envelope.payload)?;
                let slot = self
                    .slots()
                    .take(message.target)
                    .ok_or(WorldError::UnknownSlot(message.target))?;
                slot.deliver(&message.value)?;
            }
            HandlerId::FAIL_FUTURE => {
                let message: FailMessage = codec::decode(&envelope.payload)?;
                let slot = self
                    .slots()
                    .take(message.target)
                    .ok_or(WorldError::UnknownSlot(message.target))?;
                slot.deliver_failure(message.failure.into());
            }
            HandlerId::SPAWN_TASK => {
                let message: SpawnMessage = codec::decode(&envelope.payload)?;
                let handler = self
                    .inner
                    .registry
                    .read()
                    .get(&message.task)
                    .cloned()
                    .ok_or(WorldError::UnknownTask(message.task))?;
                handler.spawn(self, message.attr, &message.args, message.reply)?;
            }
            other => return Err(WorldError::UnknownHandler(other)),
        }

        Ok(())
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("rank", &self.inner.rank)
            .field("size", &self.inner.size)
            .finish()
    }
}

fn dispatch_loop(world: Weak<WorldInner>, inbox: Receiver<Envelope>, stopped: Receiver<()>) {
    loop {
        let envelope = crossbeam_channel::select! {
            recv(inbox) -> envelope => envelope.ok(),
            recv(stopped) -> _ => None,
        };

        let Some(envelope) = envelope else { break };
        let Some(inner) = world.upgrade() else { break };
        let current = World::from_inner(inner);
        let outcome = catch_unwind(AssertUnwindSafe(|| current.dispatch(envelope)))
            .unwrap_or_else(|panic| Err(WorldError::HandlerPanicked(panic_message(&*panic))));

        if let Err(err) = outcome {
            let hook = current.inner.on_dispatch_error.read().clone();
            hook(current.rank(), &err);
            break;
        }
    }

    tracing::trace!("dispatcher stopped");
}
