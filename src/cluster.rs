use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::{Config, ProcessId};
use crate::engine::TaskFn;
use crate::error::WorldError;
use crate::transport::mesh;
use crate::world::{DispatchErrorHook, World};

/// Several worlds in one address space, connected by channels.
///
/// Each world has its own worker pool and dispatcher, so a cluster behaves
/// like a set of processes that only talk through messages.
///
/// ```rust
/// use mikomi::{Cluster, Config};
///
/// let cluster = Cluster::new(2, Config::new().workers(2)).unwrap();
/// let square = cluster.register_task("square", |x: i64| x * x).unwrap();
///
/// let taskq = cluster.world(0).taskq();
/// let result = taskq.add_on(1, &square, mikomi::Future::ready(7));
/// assert_eq!(*result.get(), 49);
/// ```
#[derive(Debug)]
pub struct Cluster {
    worlds: Vec<World>,
}

impl Cluster {
    pub fn new(size: usize, config: Config) -> Result<Self, WorldError> {
        let worlds = mesh(size)
            .into_iter()
            .map(|(transport, inbox)| World::new(config.clone(), transport, inbox))
            .collect::<Result<_, _>>()?;

        Ok(Self { worlds })
    }

    /// # Panics
    ///
    /// Panics if `rank` is not below [`size`](Self::size).
    pub fn world(&self, rank: usize) -> &World {
        &self.worlds[rank]
    }

    pub fn worlds(&self) -> &[World] {
        &self.worlds
    }

    pub fn size(&self) -> usize {
        self.worlds.len()
    }

    /// Registers `func` under `name` on every world.
    pub fn register_task<V, R, F>(&self, name: &str, func: F) -> Result<TaskFn<V, R>, WorldError>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        R: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
        F: Fn(V) -> R + Send + Sync + 'static,
    {
        let task = TaskFn::new(name, Arc::new(func));
        for world in &self.worlds {
            world.register(&task)?;
        }

        Ok(task)
    }

    /// Installs `hook` on every world, see [`World::on_dispatch_error`].
    pub fn on_dispatch_error<F>(&self, hook: F)
    where
        F: Fn(ProcessId, &WorldError) + Send + Sync + 'static,
    {
        let hook: DispatchErrorHook = Arc::new(hook);
        for world in &self.worlds {
            world.set_dispatch_error_hook(hook.clone());
        }
    }

    /// Fences every world in rank order.
    pub fn fence(&self) {
        for world in &self.worlds {
            world.taskq().fence();
        }
    }
}
