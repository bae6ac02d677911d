//! Client-side view of the hierarchical coordination namespace.
//!
//! The pool never talks to the coordination service directly; everything goes
//! through [`Namespace`], a session-scoped handle offering node CRUD plus
//! one-shot watches. Fired watches arrive as [`WatchedEvent`]s on the
//! session's [`EventStream`], in the order the changes committed.
//!
//! # Components
//!
//! - [`Namespace`]: operations available to one session
//! - [`Connector`]: opens sessions
//! - [`memory::MemoryNamespace`]: in-process implementation
//! - `zookeeper::ZkConnector`: sessions on a ZooKeeper ensemble (`zookeeper` feature)
//! - [`layout::Layout`]: the paths the pool uses

pub mod layout;
pub mod memory;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{DistError, Result};

pub use layout::Layout;
pub use memory::{MemoryNamespace, MemorySession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    /// Removed automatically when the creating session ends
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// The session is gone; all of its ephemeral nodes have been removed
    SessionExpired,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::NodeCreated => write!(f, "node_created"),
            EventKind::NodeDeleted => write!(f, "node_deleted"),
            EventKind::NodeDataChanged => write!(f, "node_data_changed"),
            EventKind::NodeChildrenChanged => write!(f, "node_children_changed"),
            EventKind::SessionExpired => write!(f, "session_expired"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: EventKind,
    /// Path the watch was set on; empty for session events
    pub path: String,
}

impl WatchedEvent {
    pub fn new(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    pub fn session_expired() -> Self {
        Self::new(EventKind::SessionExpired, "")
    }
}

/// Receiving end of a session's notification queue.
pub type EventStream = mpsc::UnboundedReceiver<WatchedEvent>;

/// Operations of one coordination session.
///
/// A `watch` flag on a read registers a one-shot watch atomically with the
/// read: any change committed after the read fires it exactly once.
#[async_trait]
pub trait Namespace: Send + Sync {
    /// Create a node and return its actual path (with sequence suffix, if any).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    async fn get_data(&self, path: &str, watch: bool) -> Result<Vec<u8>>;

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Delete a node without children.
    async fn delete(&self, path: &str) -> Result<()>;

    /// With `watch`, fires `NodeCreated` if absent, otherwise `NodeDeleted`/`NodeDataChanged`.
    async fn exists(&self, path: &str, watch: bool) -> Result<bool>;

    /// Child names (not full paths), sorted.
    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>>;

    fn session_id(&self) -> u64;

    /// End the session; its ephemeral nodes vanish.
    async fn close(&self) -> Result<()>;
}

/// Opens coordination sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(Arc<dyn Namespace>, EventStream)>;
}

/// Treat `NodeExists` as success.
pub fn ignore_exists<T>(result: Result<T>) -> Result<()> {
    match result {
        Ok(_) | Err(DistError::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Treat `NoNode` as success.
pub fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) | Err(DistError::NoNode(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Last path component.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub(crate) fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

pub(crate) fn validate_path(path: &str) -> Result<()> {
    let valid = path == "/"
        || (path.starts_with('/')
            && !path.ends_with('/')
            && !path.contains("//")
            && path.split('/').skip(1).all(|c| c != "." && c != ".."));
    if valid {
        Ok(())
    } else {
        Err(DistError::InvalidPath(path.to_string()))
    }
}
