use serde::{Deserialize, Serialize};

use crate::error::WorldError;

/// Rank of a process participating in a world.
pub type ProcessId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Normal,
    /// Pushed onto the submitting worker's own deque rather than the back of
    /// the shared queue.
    High,
}

/// Where a task may be moved to. Tasks never migrate between processes
/// here, so both variants schedule alike. The hint travels with remote tasks
/// for transports or runtimes that do move work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Locality {
    /// May run on any worker of the owning process.
    #[default]
    Any,
    /// Must stay on the process it was submitted to.
    Pinned,
}

/// Scheduling hints attached to every task, local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskAttributes {
    pub priority: Priority,
    pub locality: Locality,
}

impl TaskAttributes {
    pub fn hipri() -> Self {
        Self {
            priority: Priority::High,
            ..Self::default()
        }
    }

    pub fn pinned(mut self) -> Self {
        self.locality = Locality::Pinned;
        self
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority == Priority::High
    }
}

/// Per-process runtime settings.
///
/// Every field has a default, so a configuration file only needs to name what
/// it changes:
///
/// ```rust
/// let config = mikomi::Config::from_json(r#"{ "workers": 4 }"#).unwrap();
/// assert_eq!(config.workers, 4);
/// assert_eq!(config.thread_name, "mikomi");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of worker threads, `0` lets rayon pick one per core.
    pub workers: usize,
    /// Prefix for worker and dispatcher thread names.
    pub thread_name: String,
    /// Stack size of each worker thread in bytes.
    pub stack_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 0,
            thread_name: String::from("mikomi"),
            stack_size: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self, WorldError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub(crate) fn build_pool(&self, rank: ProcessId) -> Result<rayon::ThreadPool, WorldError> {
        let prefix = self.thread_name.clone();
        let mut builder = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(move |i| format!("{prefix}-{rank}-{i}"))
            .panic_handler(|panic| {
                let msg = crate::engine::panic_message(&*panic);
                tracing::error!("worker panicked outside a task: {msg}");
            });

        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }

        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config = Config::from_json(r#"{ "stack_size": 1048576 }"#).unwrap();
        assert_eq!(config.workers, 0);
        assert_eq!(config.stack_size, Some(1048576));
        assert_eq!(config.thread_name, "mikomi");
    }

    #[test]
    fn test_config_rejects_bad_json() {
        assert!(matches!(
            Config::from_json(r#"{ "workers": "many" }"#),
            Err(WorldError::Config(_))
        ));
    }

    #[test]
    fn test_attributes() {
        let attr = TaskAttributes::hipri().pinned();
        assert!(attr.is_high_priority());
        assert_eq!(attr.locality, Locality::Pinned);
        assert!(!TaskAttributes::default().is_high_priority());
    }
}
