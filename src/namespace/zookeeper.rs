//! [`Namespace`] sessions on a ZooKeeper ensemble.
//!
//! Each one-shot watcher handed out by the client is driven by its own tokio
//! task and forwarded to the session's [`EventStream`]. Notifications from
//! different watchers may interleave out of commit order; every handler in
//! the pool re-reads the node it was told about.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use zookeeper_client as zk;

use crate::config::NamespaceConfig;
use crate::error::{DistError, Result};
use crate::namespace::{Connector, CreateMode, EventKind, EventStream, Namespace, WatchedEvent};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Opens sessions against the ensemble at `endpoint` (`host:port[,host:port...]`).
#[derive(Debug, Clone)]
pub struct ZkConnector {
    endpoint: String,
}

impl ZkConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn from_config(config: &NamespaceConfig) -> Self {
        Self::new(config.endpoint.clone())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for ZkConnector {
    async fn connect(&self) -> Result<(Arc<dyn Namespace>, EventStream)> {
        let client = zk::Client::connect(&self.endpoint).await.map_err(|e| {
            tracing::warn!(endpoint = %self.endpoint, error = %e, "Could not connect to coordination service");
            DistError::ConnectionLoss
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        let session = ZkSession::new(client, tx);
        tracing::info!(endpoint = %self.endpoint, session_id = session.id, "Connected to coordination service");
        Ok((Arc::new(session), rx))
    }
}

/// One ZooKeeper session.
pub struct ZkSession {
    id: u64,
    client: Mutex<Option<zk::Client>>,
    events: mpsc::UnboundedSender<WatchedEvent>,
}

impl ZkSession {
    fn new(client: zk::Client, events: mpsc::UnboundedSender<WatchedEvent>) -> Self {
        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);

        let mut states = client.state_watcher();
        let expired = events.clone();
        tokio::spawn(async move {
            loop {
                match states.changed().await {
                    zk::SessionState::Expired | zk::SessionState::Closed | zk::SessionState::AuthFailed => {
                        tracing::warn!(session_id = id, "Coordination session ended");
                        let _ = expired.send(WatchedEvent::session_expired());
                        return;
                    }
                    state => tracing::debug!(session_id = id, state = ?state, "Session state changed"),
                }
            }
        });

        Self {
            id,
            client: Mutex::new(Some(client)),
            events,
        }
    }

    fn client(&self) -> Result<zk::Client> {
        self.client
            .lock()
            .map_err(|_| DistError::Internal("session lock poisoned".to_string()))?
            .clone()
            .ok_or(DistError::SessionExpired)
    }

    fn forward(&self, watcher: zk::OneshotWatcher) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = watcher.changed().await;
            if let Some(event) = translate_event(&event) {
                let _ = events.send(event);
            }
        });
    }
}

#[async_trait]
impl Namespace for ZkSession {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let options = create_mode(mode).with_acls(zk::Acls::anyone_all());
        let (_, sequence) = self
            .client()?
            .create(path, data, &options)
            .await
            .map_err(|e| map_error(path, e))?;
        if mode.is_sequential() {
            Ok(format!("{}{}", path, sequence))
        } else {
            Ok(path.to_string())
        }
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<Vec<u8>> {
        let client = self.client()?;
        if watch {
            let (data, _, watcher) = client
                .get_and_watch_data(path)
                .await
                .map_err(|e| map_error(path, e))?;
            self.forward(watcher);
            Ok(data)
        } else {
            let (data, _) = client.get_data(path).await.map_err(|e| map_error(path, e))?;
            Ok(data)
        }
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        self.client()?
            .set_data(path, data, None)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client()?
            .delete(path, None)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<bool> {
        let client = self.client()?;
        if watch {
            let (stat, watcher) = client
                .check_and_watch_stat(path)
                .await
                .map_err(|e| map_error(path, e))?;
            self.forward(watcher);
            Ok(stat.is_some())
        } else {
            let stat = client.check_stat(path).await.map_err(|e| map_error(path, e))?;
            Ok(stat.is_some())
        }
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        let client = self.client()?;
        let mut children = if watch {
            let (children, _, watcher) = client
                .get_and_watch_children(path)
                .await
                .map_err(|e| map_error(path, e))?;
            self.forward(watcher);
            children
        } else {
            client.list_children(path).await.map_err(|e| map_error(path, e))?
        };
        children.sort();
        Ok(children)
    }

    fn session_id(&self) -> u64 {
        self.id
    }

    async fn close(&self) -> Result<()> {
        let client = self
            .client
            .lock()
            .map_err(|_| DistError::Internal("session lock poisoned".to_string()))?
            .take();
        // The session closes once the last handle is dropped.
        drop(client);
        tracing::debug!(session_id = self.id, "Session closed");
        Ok(())
    }
}

fn create_mode(mode: CreateMode) -> zk::CreateMode {
    match mode {
        CreateMode::Persistent => zk::CreateMode::Persistent,
        CreateMode::PersistentSequential => zk::CreateMode::PersistentSequential,
        CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        CreateMode::EphemeralSequential => zk::CreateMode::EphemeralSequential,
    }
}

fn map_error(path: &str, error: zk::Error) -> DistError {
    match error {
        zk::Error::NodeExists => DistError::NodeExists(path.to_string()),
        zk::Error::NoNode => DistError::NoNode(path.to_string()),
        zk::Error::NotEmpty => DistError::NotEmpty(path.to_string()),
        zk::Error::NoChildrenForEphemerals => DistError::NoChildrenForEphemerals(path.to_string()),
        zk::Error::ConnectionLoss => DistError::ConnectionLoss,
        zk::Error::SessionExpired => DistError::SessionExpired,
        other => DistError::Internal(other.to_string()),
    }
}

fn translate_event(event: &zk::WatchedEvent) -> Option<WatchedEvent> {
    let kind = match event.event_type {
        zk::EventType::NodeCreated => EventKind::NodeCreated,
        zk::EventType::NodeDeleted => EventKind::NodeDeleted,
        zk::EventType::NodeDataChanged => EventKind::NodeDataChanged,
        zk::EventType::NodeChildrenChanged => EventKind::NodeChildrenChanged,
        _ => {
            // Watchers of an ended session fire with a session event.
            return matches!(
                event.session_state,
                zk::SessionState::Expired | zk::SessionState::Closed
            )
            .then(WatchedEvent::session_expired);
        }
    };
    Some(WatchedEvent::new(kind, event.path.clone()))
}
