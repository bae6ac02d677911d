use crate::retry::RetryPolicy;

/// Root under which the manager marker, task queue, workers and results live.
pub const DEFAULT_ROOT: &str = "/app";

/// Where the coordination namespace lives and which subtree this pool owns.
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    /// Address of the coordination service endpoint (host:port list).
    pub endpoint: String,
    /// Root path of the pool's subtree.
    pub root: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:2181".to_string(),
            root: DEFAULT_ROOT.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Written as payload of the leadership marker and worker nodes, for diagnostics.
    pub identity: String,
    pub namespace: NamespaceConfig,
    pub retry: RetryPolicy,
    /// How often the manager re-reads views whose refresh failed.
    pub resync_interval_ms: u64,
    /// How long a worker node may stay without a liveness marker before the
    /// manager removes it.
    pub registration_grace_ms: u64,
    /// Pause before re-running election after the session was lost.
    pub restart_delay_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            namespace: NamespaceConfig::default(),
            retry: RetryPolicy::default(),
            resync_interval_ms: 500,
            registration_grace_ms: 5000,
            restart_delay_ms: 1000,
        }
    }
}

impl NodeConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.namespace.endpoint = endpoint.into();
        self
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.namespace.root = root.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// `<pid>@<hostname>`, the usual process identity for nodes in the pool.
pub fn default_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", std::process::id(), host)
}

/// Identity for a peer sharing its process with other peers (local mode, tests).
pub fn peer_identity(index: usize) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}#{}-{}", default_identity(), index, &suffix[..8])
}
