use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::TaskAttributes;
use crate::engine::tracking::{Callback, DependencyTracker};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Told the panic message when the job unwinds instead of finishing.
pub(crate) type Poison = Box<dyn FnOnce(Arc<str>) + Send>;

/// A unit of deferred work gated on the futures it was given.
///
/// The node is the callback registered on each unready argument, so every
/// argument that resolves decrements [`deps`](Self::deps). The job is taken
/// out when the node runs and is never run twice.
pub(crate) struct TaskNode {
    pub attr: TaskAttributes,
    pub deps: DependencyTracker,
    job: Mutex<Option<(Job, Poison)>>,
}

impl TaskNode {
    pub(crate) fn new(attr: TaskAttributes) -> Arc<Self> {
        Arc::new(Self {
            attr,
            deps: DependencyTracker::new(0),
            job: Mutex::new(None),
        })
    }

    pub(crate) fn install(&self, job: Job, poison: Poison) {
        *self.job.lock() = Some((job, poison));
    }

    pub(crate) fn take_job(&self) -> Option<(Job, Poison)> {
        self.job.lock().take()
    }
}

impl Callback for TaskNode {
    fn notify(&self) {
        self.deps.dec();
    }
}
