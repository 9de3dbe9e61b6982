use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::{Arc, Weak};

use ciborium::Value;
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::atomic::AtomicCounter;
use crate::codec;
use crate::core::{ProcessId, TaskAttributes};
use crate::engine::node::TaskNode;
use crate::engine::tracking::{CallbackRef, callback};
use crate::engine::{TaskArgs, panic_message, wait};
use crate::error::{ContractViolation, fatal, violation};
use crate::future::{Future, RemoteRef};
use crate::transport::HandlerId;
use crate::world::{TaskId, World, WorldInner};

/// Body of a [`HandlerId::SPAWN_TASK`] message.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SpawnMessage {
    pub task: TaskId,
    pub attr: TaskAttributes,
    pub args: Value,
    pub reply: RemoteRef,
}

/// A task function registered under a name, callable on any process that
/// registered the same name.
///
/// Obtained from [`World::register_task`] or
/// [`Cluster::register_task`](crate::Cluster::register_task).
pub struct TaskFn<V, R> {
    pub(crate) id: TaskId,
    name: Arc<str>,
    pub(crate) func: Arc<dyn Fn(V) -> R + Send + Sync>,
}

impl<V, R> TaskFn<V, R> {
    pub(crate) fn new(name: &str, func: Arc<dyn Fn(V) -> R + Send + Sync>) -> Self {
        Self {
            id: TaskId::of(name),
            name: name.into(),
            func,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<V, R> Clone for TaskFn<V, R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            func: self.func.clone(),
        }
    }
}

impl<V, R> std::fmt::Debug for TaskFn<V, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFn")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

struct QueueShared {
    rank: ProcessId,
    pool: rayon::ThreadPool,
    /// Tasks added on this process and not yet finished, ready or not.
    pending: AtomicCounter,
    idle: Mutex<()>,
    drained: Condvar,
    /// First panic raised by a task since the last fence.
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl QueueShared {
    fn submit(self: &Arc<Self>, node: Arc<TaskNode>) {
        let high = node.attr.is_high_priority();
        tracing::trace!(rank = self.rank, high, "submitting task");

        let shared = self.clone();
        let job = move || shared.run(&node);
        if high {
            self.pool.spawn(job);
        } else {
            self.pool.spawn_fifo(job);
        }
    }

    fn run(&self, node: &TaskNode) {
        let _span = tracing::trace_span!("task", rank = self.rank).entered();

        let failed = node.take_job().and_then(|(job, poison)| {
            catch_unwind(AssertUnwindSafe(job))
                .err()
                .map(|panic| (panic, poison))
        });

        let Some((panic, poison)) = failed else {
            if self.pending.dec_and_test() {
                self.wake();
            }
            return;
        };

        let message = panic_message(&*panic);
        tracing::error!(rank = self.rank, "task panicked: {message}");
        let failure: Arc<str> = Arc::from(message);
        if let Err(err) = catch_unwind(AssertUnwindSafe(move || poison(failure))) {
            tracing::error!(rank = self.rank, "couldn't fail the task's result: {}", panic_message(&*err));
        }

        {
            // A fence that sees the panic also sees this task gone.
            let mut slot = self.panic.lock();
            if slot.is_none() {
                *slot = Some(panic);
            }
            self.pending.dec();
        }
        self.wake();
    }

    fn wake(&self) {
        let _guard = self.idle.lock();
        self.drained.notify_all();
    }

    fn settled(&self) -> bool {
        let panic = self.panic.lock();
        panic.is_some() || self.pending.load() == 0
    }
}

/// Per-process queue of tasks waiting for their arguments or for a worker.
///
/// Cloning is cheap, every clone submits to the same pool and counts towards
/// the same [`fence`](Self::fence).
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<QueueShared>,
    world: Weak<WorldInner>,
}

impl TaskQueue {
    pub(crate) fn new(rank: ProcessId, pool: rayon::ThreadPool, world: Weak<WorldInner>) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                rank,
                pool,
                pending: AtomicCounter::new(0),
                idle: Mutex::new(()),
                drained: Condvar::new(),
                panic: Mutex::new(None),
            }),
            world,
        }
    }

    fn world(&self) -> World {
        match self.world.upgrade() {
            Some(inner) => World::from_inner(inner),
            None => violation(ContractViolation::WorldGone),
        }
    }

    /// Number of tasks added on this process that have not finished yet.
    pub fn size(&self) -> usize {
        usize::try_from(self.shared.pending.load()).unwrap_or(0)
    }

    /// Runs `func` on a worker of this process once every future in `args`
    /// is assigned, and returns a future for its result.
    ///
    /// ```rust
    /// use mikomi::{Cluster, Config, Future};
    ///
    /// let cluster = Cluster::new(1, Config::new().workers(2)).unwrap();
    /// let taskq = cluster.world(0).taskq();
    ///
    /// let a = Future::<i32>::new();
    /// let sum = taskq.add((a.clone(), Future::ready(2)), |(a, b)| a + b);
    /// a.set(40);
    /// assert_eq!(*sum.get(), 42);
    /// ```
    pub fn add<Args, R, F>(&self, args: Args, func: F) -> Future<R>
    where
        Args: TaskArgs,
        R: Clone + Send + Sync + 'static,
        F: FnOnce(Args::Values) -> R + Send + 'static,
    {
        self.add_with(TaskAttributes::default(), args, func)
    }

    pub fn add_with<Args, R, F>(&self, attr: TaskAttributes, args: Args, func: F) -> Future<R>
    where
        Args: TaskArgs,
        R: Clone + Send + Sync + 'static,
        F: FnOnce(Args::Values) -> R + Send + 'static,
    {
        let result = Future::new();
        let target = result.clone();
        self.spawn(attr, args, move |values| target.set(func(values)), poisons(&result));
        result
    }

    /// Like [`add`](Self::add), for a body that itself returns a future. The
    /// returned future resolves when that one does.
    pub fn add_linked<Args, R, F>(&self, args: Args, func: F) -> Future<R>
    where
        Args: TaskArgs,
        R: Clone + Send + Sync + 'static,
        F: FnOnce(Args::Values) -> Future<R> + Send + 'static,
    {
        let result = Future::new();
        let target = result.clone();
        self.spawn(
            TaskAttributes::default(),
            args,
            move |values| target.link(&func(values)),
            poisons(&result),
        );
        result
    }

    /// Queues `body` behind `args`. Should `body` panic, `poison` is handed
    /// the message so whatever the task was to produce can be failed.
    pub(crate) fn spawn<Args, F, P>(&self, attr: TaskAttributes, args: Args, body: F, poison: P)
    where
        Args: TaskArgs,
        F: FnOnce(Args::Values) + Send + 'static,
        P: FnOnce(Arc<str>) + Send + 'static,
    {
        self.shared.pending.inc();

        let node = TaskNode::new(attr);
        let as_callback: CallbackRef = node.clone();
        args.register(&as_callback, &node.deps);
        node.install(Box::new(move || body(args.resolve())), Box::new(poison));

        if node.deps.probe() {
            self.shared.submit(node);
            return;
        }

        let shared = self.shared.clone();
        let ready = node.clone();
        node.deps
            .register_callback(callback(move || shared.submit(ready)));
    }

    /// Runs a registered task on process `dest`.
    ///
    /// When `dest` is this process this is the same as [`add`](Self::add).
    /// Otherwise the arguments are sent along with the task and the result
    /// comes back through the returned future.
    ///
    /// # Panics
    ///
    /// Every future in `args` must already be assigned when `dest` is another
    /// process. Transport failures are fatal.
    pub fn add_on<Args, V, R>(&self, dest: ProcessId, task: &TaskFn<V, R>, args: Args) -> Future<R>
    where
        Args: TaskArgs<Values = V>,
        V: Serialize + DeserializeOwned + Send + 'static,
        R: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        self.add_on_with(dest, TaskAttributes::default(), task, args)
    }

    pub fn add_on_with<Args, V, R>(
        &self,
        dest: ProcessId,
        attr: TaskAttributes,
        task: &TaskFn<V, R>,
        args: Args,
    ) -> Future<R>
    where
        Args: TaskArgs<Values = V>,
        V: Serialize + DeserializeOwned + Send + 'static,
        R: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        let world = self.world();
        if dest == world.rank() {
            let func = task.func.clone();
            return self.add_with(attr, args, move |values| func(values));
        }

        if let Some(index) = args.first_unready() {
            violation(ContractViolation::UnreadyRemoteArgument { dest, index });
        }

        let args = match codec::to_value(&args.resolve()) {
            Ok(args) => args,
            Err(err) => fatal("couldn't encode task arguments", err),
        };

        let result = Future::new();
        let message = SpawnMessage {
            task: task.id,
            attr,
            args,
            reply: result.remote_ref(&world),
        };

        let payload = match codec::encode(&message) {
            Ok(payload) => payload,
            Err(err) => fatal("couldn't encode task message", err),
        };

        tracing::debug!(rank = world.rank(), dest, task = task.name(), "spawning remote task");
        if let Err(err) = world
            .transport()
            .send(dest, HandlerId::SPAWN_TASK, payload)
        {
            fatal("couldn't send task", err);
        }

        result
    }

    /// Blocks until every task added on this process has finished, running
    /// ready tasks in the meantime when called from a worker.
    ///
    /// # Panics
    ///
    /// Resumes the first panic raised by a task since the previous fence.
    pub fn fence(&self) {
        let shared = &self.shared;
        wait::cooperate(
            || shared.settled(),
            |timeout| {
                let mut guard = shared.idle.lock();
                if !shared.settled() {
                    shared.drained.wait_for(&mut guard, timeout);
                }
            },
        );

        let panic = shared.panic.lock().take();
        if let Some(panic) = panic {
            tracing::error!(
                rank = shared.rank,
                "fence interrupted with {} pending task(s)",
                self.size()
            );
            resume_unwind(panic);
        }
    }
}

fn poisons<R>(result: &Future<R>) -> impl FnOnce(Arc<str>) + Send + 'static
where
    R: Clone + Send + Sync + 'static,
{
    let result = result.clone();
    move |failure| result.fail(failure)
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("rank", &self.shared.rank)
            .field("pending", &self.shared.pending.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::core::Config;
    use std::io::Write;
    use std::time::Duration;
    use tracing_subscriber::fmt::MakeWriter;

    fn single() -> Cluster {
        Cluster::new(1, Config::new().workers(4)).unwrap()
    }

    /// Collects formatted log output in memory.
    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl Logs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl Write for Logs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Logs {
        type Writer = Logs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_ready_task_runs() {
        let cluster = single();
        let taskq = cluster.world(0).taskq();

        let result = taskq.add((), |()| 5);
        taskq.fence();
        assert!(result.probe());
        assert_eq!(*result.get(), 5);
        assert_eq!(taskq.size(), 0);
    }

    #[test]
    fn test_ready_arguments_skip_callbacks() {
        let cluster = single();
        let taskq = cluster.world(0).taskq();

        let input = Future::new();
        input.set(4u32);
        let result = taskq.add((input.clone(), Future::ready(1)), |(a, b)| a + b);
        assert_eq!(*result.get(), 5);
        assert_eq!(input.callbacks_registered(), 0);

        let late = Future::<u32>::new();
        let result = taskq.add(late.clone(), |x| x);
        assert_eq!(late.callbacks_registered(), 1);
        late.set(6);
        assert_eq!(*result.get(), 6);
    }

    #[test]
    fn test_unready_task_is_counted() {
        let cluster = single();
        let taskq = cluster.world(0).taskq();

        let input = Future::<u32>::new();
        let result = taskq.add(input.clone(), |x| x * 2);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(taskq.size(), 1);
        assert!(!result.probe());

        input.set(21);
        taskq.fence();
        assert_eq!(*result.get(), 42);
    }

    #[test]
    fn test_high_priority() {
        let cluster = single();
        let taskq = cluster.world(0).taskq();

        let results: Vec<_> = (0..16)
            .map(|i| taskq.add_with(TaskAttributes::hipri(), Future::ready(i), |i| i + 1))
            .collect();
        taskq.fence();
        let values: Vec<_> = results.iter().map(|f| *f.get()).collect();
        assert_eq!(values, (1..17).collect::<Vec<_>>());
    }

    #[test]
    fn test_add_linked() {
        let cluster = single();
        let taskq = cluster.world(0).taskq().clone();

        let inner = taskq.clone();
        let result = taskq.add_linked(Future::ready(3), move |x| inner.add((), move |()| x * x));
        assert_eq!(*result.get(), 9);
    }

    #[test]
    fn test_get_inside_task_makes_progress() {
        let cluster = Cluster::new(1, Config::new().workers(1)).unwrap();
        let taskq = cluster.world(0).taskq().clone();

        let inner = taskq.clone();
        let outer = taskq.add((), move |()| {
            let nested = inner.add((), |()| 10);
            *nested.get() + 1
        });

        assert_eq!(*outer.get(), 11);
    }

    #[test]
    fn test_fence_resumes_task_panic() {
        let cluster = single();
        let taskq = cluster.world(0).taskq();

        let never = Future::<u8>::new();
        let blocked = taskq.add(never.clone(), |x| x);
        let failed = taskq.add((), |()| -> u8 { panic!("task failed") });

        let err = catch_unwind(AssertUnwindSafe(|| taskq.fence())).unwrap_err();
        assert_eq!(panic_message(&*err), "task failed");
        assert!(!blocked.probe());

        never.set(1);
        taskq.fence();
        assert_eq!(*blocked.get(), 1);
        assert!(!failed.probe());
        assert!(failed.is_failed());
        assert_eq!(taskq.size(), 0);
    }

    #[test]
    fn test_get_reraises_task_panic() {
        let cluster = single();
        let taskq = cluster.world(0).taskq();

        let doomed = Future::new();
        doomed.set(1u8);
        let writer = doomed.clone();
        let result = taskq.add((), move |()| {
            writer.set(2);
            0u8
        });
        let downstream = taskq.add(result.clone(), |x| x + 1);

        let reader = result.clone();
        let waiter = std::thread::spawn(move || {
            catch_unwind(AssertUnwindSafe(|| *reader.get())).map_err(|err| panic_message(&*err))
        });
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.contains("assigned twice"), "{err}");

        let err = catch_unwind(AssertUnwindSafe(|| *downstream.get())).unwrap_err();
        assert!(panic_message(&*err).contains("assigned twice"));
        assert_eq!(*doomed.get(), 1);
    }

    #[test]
    fn test_fence_reports_pending_count() {
        let cluster = single();
        let taskq = cluster.world(0).taskq();

        let never = Future::<u8>::new();
        let _blocked = taskq.add(never.clone(), |x| x);
        let _failed = taskq.add((), |()| -> u8 { panic!("task failed") });

        let logs = Logs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let fenced = tracing::subscriber::with_default(subscriber, || {
            catch_unwind(AssertUnwindSafe(|| taskq.fence()))
        });

        assert!(fenced.is_err());
        assert!(logs.text().contains("fence interrupted with 1 pending task(s)"), "{}", logs.text());

        never.set(0);
        taskq.fence();
    }
}
