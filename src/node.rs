use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::election::{try_become_leader, Role};
use crate::error::{DistError, Result};
use crate::manager::Manager;
use crate::namespace::{Connector, EventStream, Layout, Namespace};
use crate::retry::with_retry;
use crate::worker::{AgentExit, Compute, WorkerAgent};

/// Where a node is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Connecting,
    Manager,
    Worker,
    /// Session lost; waiting before election runs again
    Restarting,
    Stopped,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodePhase::Connecting => write!(f, "connecting"),
            NodePhase::Manager => write!(f, "manager"),
            NodePhase::Worker => write!(f, "worker"),
            NodePhase::Restarting => write!(f, "restarting"),
            NodePhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Published on every phase change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub identity: String,
    pub phase: NodePhase,
    pub role: Option<Role>,
    pub worker_id: Option<String>,
    pub session_id: Option<u64>,
}

/// One peer of the pool: elects, then runs whichever role it got, and starts
/// over whenever its session is lost.
pub struct Node {
    config: NodeConfig,
    layout: Layout,
    connector: Arc<dyn Connector>,
    compute: Arc<dyn Compute>,
    status: watch::Sender<NodeStatus>,
}

impl Node {
    pub fn new(config: NodeConfig, connector: Arc<dyn Connector>, compute: Arc<dyn Compute>) -> Self {
        let (status, _) = watch::channel(NodeStatus {
            identity: config.identity.clone(),
            phase: NodePhase::Connecting,
            role: None,
            worker_id: None,
            session_id: None,
        });
        Self {
            layout: Layout::new(config.namespace.root.clone()),
            config,
            connector,
            compute,
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Run until `shutdown` fires, the worker leaves the pool, or a
    /// non-recoverable error occurs.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let restart_delay = Duration::from_millis(self.config.restart_delay_ms);
        loop {
            self.publish(NodePhase::Connecting, None, None, None);
            match self.run_session(&shutdown).await {
                Ok(()) => {
                    self.publish(NodePhase::Stopped, None, None, None);
                    return Ok(());
                }
                Err(e) if is_restartable(&e) => {
                    tracing::warn!(
                        identity = %self.config.identity,
                        error = %e,
                        delay_ms = restart_delay.as_millis() as u64,
                        "Session lost, restarting election"
                    );
                    self.publish(NodePhase::Restarting, None, None, None);
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            self.publish(NodePhase::Stopped, None, None, None);
                            return Ok(());
                        }
                        _ = tokio::time::sleep(restart_delay) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(identity = %self.config.identity, error = %e, "Node failed");
                    self.publish(NodePhase::Stopped, None, None, None);
                    return Err(e);
                }
            }
        }
    }

    /// One session: connect, elect, run the role, and close the session on the way out.
    async fn run_session(&self, shutdown: &CancellationToken) -> Result<()> {
        let (ns, mut events) = self.connector.connect().await?;
        let outcome = self.serve(ns.clone(), &mut events, shutdown).await;
        if let Err(e) = ns.close().await {
            tracing::debug!(error = %e, "Session close failed");
        }
        outcome
    }

    async fn serve(&self, ns: Arc<dyn Namespace>, events: &mut EventStream, shutdown: &CancellationToken) -> Result<()> {
        let session_id = ns.session_id();
        with_retry(&self.config.retry, "ensure_layout", || self.layout.ensure(ns.as_ref())).await?;

        let role = try_become_leader(ns.as_ref(), &self.layout, &self.config.identity).await?;
        tracing::info!(identity = %self.config.identity, role = %role, session_id, "Role decided");

        if role == Role::Worker {
            let mut agent = WorkerAgent::new(ns.clone(), self.layout.clone(), &self.config, self.compute.clone());
            let worker_id = agent.register().await?;
            self.publish(NodePhase::Worker, Some(Role::Worker), Some(worker_id.clone()), Some(session_id));

            match agent.run(events, shutdown.clone()).await? {
                AgentExit::Shutdown => return Ok(()),
                AgentExit::Deregistered => {
                    tracing::warn!(worker_id = %worker_id, "Worker left the pool");
                    return Ok(());
                }
                AgentExit::Promoted => {
                    tracing::info!(identity = %self.config.identity, role = %Role::Manager, session_id, "Role changed");
                }
            }
        }

        self.publish(NodePhase::Manager, Some(Role::Manager), None, Some(session_id));
        let mut manager = Manager::new(ns, self.layout.clone(), &self.config);
        manager.run(events, shutdown.clone()).await
    }

    fn publish(&self, phase: NodePhase, role: Option<Role>, worker_id: Option<String>, session_id: Option<u64>) {
        self.status.send_modify(|status| {
            status.phase = phase;
            status.role = role;
            status.worker_id = worker_id;
            status.session_id = session_id;
        });
    }
}

/// Errors after which a [`Node`] reconnects and runs election again.
pub fn is_restartable(error: &DistError) -> bool {
    error.is_session_fatal() || error.is_transient()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::MemoryNamespace;
    use crate::retry::RetryPolicy;
    use crate::worker::FnCompute;

    fn node(ns: &MemoryNamespace, name: &str) -> Node {
        let config = NodeConfig::new(name).with_retry(RetryPolicy::immediate(3));
        let compute: Arc<dyn Compute> = Arc::new(FnCompute::new(|task: crate::task::Task| async move { Ok::<_, crate::worker::ComputeError>(task.payload) }));
        Node::new(config, Arc::new(ns.clone()), compute)
    }

    async fn wait_phase(rx: &mut watch::Receiver<NodeStatus>, phase: NodePhase) -> NodeStatus {
        let status = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.phase == phase))
            .await
            .expect("phase not reached")
            .unwrap();
        status.clone()
    }

    #[tokio::test]
    async fn first_node_manages_second_works() {
        let ns = MemoryNamespace::new();
        let a = Arc::new(node(&ns, "a"));
        let b = Arc::new(node(&ns, "b"));
        let shutdown = CancellationToken::new();

        let mut rx_a = a.subscribe();
        let runner = a.clone();
        let stop = shutdown.clone();
        let ha = tokio::spawn(async move { runner.run(stop).await });
        wait_phase(&mut rx_a, NodePhase::Manager).await;

        let mut rx_b = b.subscribe();
        let runner = b.clone();
        let stop = shutdown.clone();
        let hb = tokio::spawn(async move { runner.run(stop).await });
        let status = wait_phase(&mut rx_b, NodePhase::Worker).await;
        assert_eq!(status.role, Some(Role::Worker));
        assert!(status.worker_id.is_some());

        shutdown.cancel();
        ha.await.unwrap().unwrap();
        hb.await.unwrap().unwrap();
        assert_eq!(a.status().phase, NodePhase::Stopped);
        assert_eq!(ns.live_sessions().await, 0);
    }

    #[tokio::test]
    async fn expired_session_restarts_election() {
        let ns = MemoryNamespace::new();
        let mut config = NodeConfig::new("a").with_retry(RetryPolicy::immediate(3));
        config.restart_delay_ms = 10;
        let compute: Arc<dyn Compute> = Arc::new(FnCompute::new(|task: crate::task::Task| async move { Ok::<_, crate::worker::ComputeError>(task.payload) }));
        let a = Arc::new(Node::new(config, Arc::new(ns.clone()), compute));
        let shutdown = CancellationToken::new();

        let mut rx = a.subscribe();
        let runner = a.clone();
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move { runner.run(stop).await });

        let first = wait_phase(&mut rx, NodePhase::Manager).await;
        assert!(ns.expire_session(first.session_id.unwrap()).await);
        let second = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.phase == NodePhase::Manager && s.session_id != first.session_id),
        )
        .await
        .expect("no second election")
        .unwrap()
        .clone();
        assert_eq!(second.role, Some(Role::Manager));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn restartable_errors() {
        assert!(is_restartable(&DistError::SessionExpired));
        assert!(is_restartable(&DistError::ConnectionLoss));
        assert!(!is_restartable(&DistError::InvalidPath("x".into())));
    }
}
