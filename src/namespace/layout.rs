use crate::config::DEFAULT_ROOT;
use crate::error::Result;
use crate::namespace::{ignore_exists, CreateMode, Namespace};

/// Prefix of worker registration nodes; the namespace appends the sequence number.
pub const WORKER_PREFIX: &str = "worker-";
/// Prefix of producer-submitted task nodes.
pub const TASK_PREFIX: &str = "task-";

/// Paths the pool uses under its root:
///
/// ```text
/// <root>/manager                  ephemeral, leadership marker
/// <root>/tasks/<task-id>          persistent, pending task payload
/// <root>/workers/<worker-id>      persistent-sequential, worker identity
/// <root>/workers/<worker-id>/state ephemeral, "idle" | "busy"
/// <root>/workers/<worker-id>/task persistent, assignment slot
/// <root>/results/<task-id>        persistent, task result
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl Layout {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        let root = match root.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };
        Self { root }
    }

    fn join(&self, rest: &str) -> String {
        if self.root == "/" {
            format!("/{}", rest)
        } else {
            format!("{}/{}", self.root, rest)
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn manager(&self) -> String {
        self.join("manager")
    }

    pub fn tasks(&self) -> String {
        self.join("tasks")
    }

    pub fn task(&self, task_id: &str) -> String {
        format!("{}/{}", self.tasks(), task_id)
    }

    pub fn workers(&self) -> String {
        self.join("workers")
    }

    pub fn worker(&self, worker_id: &str) -> String {
        format!("{}/{}", self.workers(), worker_id)
    }

    pub fn worker_state(&self, worker_id: &str) -> String {
        format!("{}/state", self.worker(worker_id))
    }

    pub fn worker_slot(&self, worker_id: &str) -> String {
        format!("{}/task", self.worker(worker_id))
    }

    pub fn results(&self) -> String {
        self.join("results")
    }

    pub fn result(&self, task_id: &str) -> String {
        format!("{}/{}", self.results(), task_id)
    }

    /// Worker id owning `path` when it is a worker's liveness marker.
    pub fn worker_of_state_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(&self.workers())?.strip_prefix('/')?;
        let (id, leaf) = rest.split_once('/')?;
        (leaf == "state").then_some(id)
    }

    /// Create the persistent directories; already-present ones are left alone.
    pub async fn ensure(&self, ns: &dyn Namespace) -> Result<()> {
        let mut prefix = String::new();
        for component in self.root.split('/').filter(|c| !c.is_empty()) {
            prefix.push('/');
            prefix.push_str(component);
            ignore_exists(ns.create(&prefix, &[], CreateMode::Persistent).await)?;
        }
        for dir in [self.tasks(), self.workers(), self.results()] {
            ignore_exists(ns.create(&dir, &[], CreateMode::Persistent).await)?;
        }
        Ok(())
    }
}
