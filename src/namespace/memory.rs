//! In-process coordination namespace.
//!
//! A single tree guarded by one lock, so every operation is linearizable and
//! watch registration is atomic with the read that requests it. Node, session
//! and watch semantics follow ZooKeeper closely enough for the pool's needs:
//! ephemeral ownership, per-parent sequence counters, one-shot watches, and
//! expiry that removes ephemerals and notifies other sessions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{DistError, Result};
use crate::namespace::{
    parent_path, validate_path, Connector, CreateMode, EventKind, EventStream, Namespace,
    WatchedEvent,
};

#[derive(Debug)]
struct Znode {
    data: Vec<u8>,
    /// Owning session for ephemeral nodes
    owner: Option<u64>,
    next_seq: u64,
}

impl Znode {
    fn new(data: Vec<u8>, owner: Option<u64>) -> Self {
        Self {
            data,
            owner,
            next_seq: 0,
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    events: mpsc::UnboundedSender<WatchedEvent>,
    ephemerals: HashSet<String>,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Znode>,
    sessions: HashMap<u64, SessionEntry>,
    data_watches: HashMap<String, HashSet<u64>>,
    child_watches: HashMap<String, HashSet<u64>>,
    next_session: u64,
    injected_failures: u32,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Znode::new(Vec::new(), None));
        Self {
            nodes,
            sessions: HashMap::new(),
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            next_session: 1,
            injected_failures: 0,
        }
    }

    /// Common preamble of every client operation.
    fn begin(&mut self, session: u64, path: &str) -> Result<()> {
        if !self.sessions.contains_key(&session) {
            return Err(DistError::SessionExpired);
        }
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(DistError::ConnectionLoss);
        }
        validate_path(path)
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire_data(&mut self, path: &str, kind: EventKind) {
        if let Some(watchers) = self.data_watches.remove(path) {
            self.notify(watchers, kind, path);
        }
    }

    fn fire_child(&mut self, path: &str, kind: EventKind) {
        if let Some(watchers) = self.child_watches.remove(path) {
            self.notify(watchers, kind, path);
        }
    }

    fn notify(&self, watchers: HashSet<u64>, kind: EventKind, path: &str) {
        for session in watchers {
            if let Some(entry) = self.sessions.get(&session) {
                // A dropped receiver means the client stopped listening; nothing to do.
                let _ = entry.events.send(WatchedEvent::new(kind, path));
            }
        }
    }

    fn create(&mut self, session: u64, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.begin(session, path)?;
        let parent = parent_path(path).ok_or_else(|| DistError::NodeExists(path.to_string()))?;
        let parent_node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| DistError::NoNode(parent.to_string()))?;
        if parent_node.owner.is_some() {
            return Err(DistError::NoChildrenForEphemerals(parent.to_string()));
        }

        let actual = if mode.is_sequential() {
            let seq = parent_node.next_seq;
            parent_node.next_seq += 1;
            format!("{}{:010}", path, seq)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(DistError::NodeExists(actual));
        }

        let owner = mode.is_ephemeral().then_some(session);
        self.nodes
            .insert(actual.clone(), Znode::new(data.to_vec(), owner));
        if owner.is_some() {
            if let Some(entry) = self.sessions.get_mut(&session) {
                entry.ephemerals.insert(actual.clone());
            }
        }

        self.fire_data(&actual, EventKind::NodeCreated);
        self.fire_child(parent, EventKind::NodeChildrenChanged);
        Ok(actual)
    }

    fn delete(&mut self, session: u64, path: &str) -> Result<()> {
        self.begin(session, path)?;
        if path == "/" {
            return Err(DistError::InvalidPath(path.to_string()));
        }
        if !self.nodes.contains_key(path) {
            return Err(DistError::NoNode(path.to_string()));
        }
        if !self.children_of(path).is_empty() {
            return Err(DistError::NotEmpty(path.to_string()));
        }
        self.remove_node(path);
        Ok(())
    }

    fn remove_node(&mut self, path: &str) {
        let Some(node) = self.nodes.remove(path) else {
            return;
        };
        if let Some(owner) = node.owner {
            if let Some(entry) = self.sessions.get_mut(&owner) {
                entry.ephemerals.remove(path);
            }
        }
        self.fire_data(path, EventKind::NodeDeleted);
        self.fire_child(path, EventKind::NodeDeleted);
        if let Some(parent) = parent_path(path) {
            self.fire_child(parent, EventKind::NodeChildrenChanged);
        }
    }

    fn set_data(&mut self, session: u64, path: &str, data: &[u8]) -> Result<()> {
        self.begin(session, path)?;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| DistError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        self.fire_data(path, EventKind::NodeDataChanged);
        Ok(())
    }

    fn get_data(&mut self, session: u64, path: &str, watch: bool) -> Result<Vec<u8>> {
        self.begin(session, path)?;
        let data = self
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| DistError::NoNode(path.to_string()))?;
        if watch {
            self.data_watches
                .entry(path.to_string())
                .or_default()
                .insert(session);
        }
        Ok(data)
    }

    fn exists(&mut self, session: u64, path: &str, watch: bool) -> Result<bool> {
        self.begin(session, path)?;
        if watch {
            self.data_watches
                .entry(path.to_string())
                .or_default()
                .insert(session);
        }
        Ok(self.nodes.contains_key(path))
    }

    fn get_children(&mut self, session: u64, path: &str, watch: bool) -> Result<Vec<String>> {
        self.begin(session, path)?;
        if !self.nodes.contains_key(path) {
            return Err(DistError::NoNode(path.to_string()));
        }
        if watch {
            self.child_watches
                .entry(path.to_string())
                .or_default()
                .insert(session);
        }
        Ok(self.children_of(path))
    }

    /// Tear a session down. Returns its event sender so the caller can decide
    /// whether to announce the expiry.
    fn end_session(&mut self, session: u64) -> Option<mpsc::UnboundedSender<WatchedEvent>> {
        let entry = self.sessions.remove(&session)?;
        for watchers in self
            .data_watches
            .values_mut()
            .chain(self.child_watches.values_mut())
        {
            watchers.remove(&session);
        }
        let mut ephemerals: Vec<String> = entry.ephemerals.into_iter().collect();
        ephemerals.sort();
        for path in ephemerals.iter().rev() {
            self.remove_node(path);
        }
        Some(entry.events)
    }
}

/// Shared in-process namespace. Cloning yields another handle to the same tree.
#[derive(Clone)]
pub struct MemoryNamespace {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNamespace {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// Open a session and return its concrete handle.
    pub async fn open_session(&self) -> (MemorySession, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tree = self.tree.lock().await;
        let id = tree.next_session;
        tree.next_session += 1;
        tree.sessions.insert(
            id,
            SessionEntry {
                events: tx,
                ephemerals: HashSet::new(),
            },
        );
        tracing::debug!(session_id = id, "Session opened");
        (
            MemorySession {
                id,
                tree: self.tree.clone(),
            },
            rx,
        )
    }

    /// Expire a session as the service would after losing contact with its
    /// client: ephemerals vanish, watchers are notified, and the session's own
    /// queue receives `SessionExpired`. Returns false for unknown sessions.
    pub async fn expire_session(&self, session_id: u64) -> bool {
        let mut tree = self.tree.lock().await;
        match tree.end_session(session_id) {
            Some(events) => {
                let _ = events.send(WatchedEvent::session_expired());
                tracing::debug!(session_id, "Session expired");
                true
            }
            None => false,
        }
    }

    /// The next `count` client operations fail with `ConnectionLoss` and have no effect.
    pub async fn inject_failures(&self, count: u32) {
        self.tree.lock().await.injected_failures = count;
    }

    pub async fn live_sessions(&self) -> usize {
        self.tree.lock().await.sessions.len()
    }

    /// Every node and its data, for inspection.
    pub async fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.tree
            .lock()
            .await
            .nodes
            .iter()
            .map(|(k, v)| (k.clone(), v.data.clone()))
            .collect()
    }
}

#[async_trait]
impl Connector for MemoryNamespace {
    async fn connect(&self) -> Result<(Arc<dyn Namespace>, EventStream)> {
        let (session, events) = self.open_session().await;
        Ok((Arc::new(session), events))
    }
}

/// One session on a [`MemoryNamespace`].
pub struct MemorySession {
    id: u64,
    tree: Arc<Mutex<Tree>>,
}

#[async_trait]
impl Namespace for MemorySession {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.tree.lock().await.create(self.id, path, data, mode)
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<Vec<u8>> {
        self.tree.lock().await.get_data(self.id, path, watch)
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        self.tree.lock().await.set_data(self.id, path, data)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.tree.lock().await.delete(self.id, path)
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<bool> {
        self.tree.lock().await.exists(self.id, path, watch)
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        self.tree.lock().await.get_children(self.id, path, watch)
    }

    fn session_id(&self) -> u64 {
        self.id
    }

    async fn close(&self) -> Result<()> {
        self.tree.lock().await.end_session(self.id);
        tracing::debug!(session_id = self.id, "Session closed");
        Ok(())
    }
}
