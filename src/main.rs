use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use distpool::config::{peer_identity, NodeConfig, DEFAULT_ROOT};
use distpool::dashboard::{run_dashboard, DashboardState};
use distpool::namespace::{Layout, MemoryNamespace};
use distpool::node::{Node, NodePhase};
use distpool::producer::{submit_task, wait_for_results};
use distpool::shutdown::install_shutdown_handler;
use distpool::task::{ResultStatus, TaskResult};
use distpool::worker::{Compute, ShellCompute};

#[derive(Parser, Debug)]
#[command(name = "distpool")]
#[command(version)]
#[command(about = "A leader-elected worker pool on a hierarchical coordination namespace")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a whole pool in this process on an in-memory namespace
    Local(LocalArgs),
    /// Run one peer of a pool against a ZooKeeper ensemble
    #[cfg(feature = "zookeeper")]
    Node(NodeArgs),
    /// Submit shell commands to a pool and wait for their results
    #[cfg(feature = "zookeeper")]
    Submit(SubmitArgs),
}

#[cfg(feature = "zookeeper")]
#[derive(Parser, Debug)]
struct EndpointArgs {
    /// Coordination service address; falls back to $ZKSERVER
    #[arg(long)]
    endpoint: Option<String>,

    /// Root path of the pool's subtree
    #[arg(long, default_value = DEFAULT_ROOT)]
    root: String,
}

#[cfg(feature = "zookeeper")]
impl EndpointArgs {
    fn namespace(&self) -> distpool::config::NamespaceConfig {
        let mut config = distpool::config::NamespaceConfig {
            root: self.root.clone(),
            ..Default::default()
        };
        if let Some(endpoint) = self
            .endpoint
            .clone()
            .or_else(|| std::env::var("ZKSERVER").ok().filter(|e| !e.is_empty()))
        {
            config.endpoint = endpoint;
        }
        config
    }
}

#[cfg(feature = "zookeeper")]
#[derive(Parser, Debug)]
struct NodeArgs {
    #[command(flatten)]
    endpoint: EndpointArgs,

    /// Identity written into the nodes this peer creates (default: pid@host)
    #[arg(long)]
    identity: Option<String>,

    /// Per-task execution limit in milliseconds
    #[arg(long, default_value = "10000")]
    task_timeout_ms: u64,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

#[cfg(feature = "zookeeper")]
#[derive(Parser, Debug)]
struct SubmitArgs {
    #[command(flatten)]
    endpoint: EndpointArgs,

    /// Shell commands, one task each
    #[arg(required = true)]
    commands: Vec<String>,

    /// Give up waiting for results after this many seconds
    #[arg(long, default_value = "30")]
    wait_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct LocalArgs {
    /// Number of peers racing for leadership; all but one become workers
    #[arg(long, default_value = "3")]
    peers: usize,

    /// Number of tasks to submit
    #[arg(long, default_value = "5")]
    tasks: usize,

    /// Shell command run by each task; `{i}` is replaced by the task number
    #[arg(long, default_value = "echo task {i} on $(hostname)")]
    command: String,

    /// Root path of the pool's subtree
    #[arg(long, default_value = DEFAULT_ROOT)]
    root: String,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Expire the manager's session after this many milliseconds
    #[arg(long)]
    kill_manager_after: Option<u64>,

    /// Per-task execution limit in milliseconds
    #[arg(long, default_value = "10000")]
    task_timeout_ms: u64,

    /// Give up waiting for results after this many seconds
    #[arg(long, default_value = "30")]
    wait_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct ResultOutput {
    task_id: String,
    worker_id: String,
    status: String,
    output: String,
    error: Option<String>,
}

impl From<&TaskResult> for ResultOutput {
    fn from(result: &TaskResult) -> Self {
        Self {
            task_id: result.task_id.clone(),
            worker_id: result.worker_id.clone(),
            status: result.status.to_string(),
            output: result.output_lossy().trim_end().to_string(),
            error: result.error.clone(),
        }
    }
}

async fn run_local(args: LocalArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.peers == 0 {
        return Err("--peers must be at least 1".into());
    }

    let shutdown = install_shutdown_handler()?;
    let ns = MemoryNamespace::new();
    let layout = Layout::new(args.root.clone());
    let compute: Arc<dyn Compute> =
        Arc::new(ShellCompute::new().with_timeout(Duration::from_millis(args.task_timeout_ms)));

    tracing::info!(
        peers = args.peers,
        tasks = args.tasks,
        root = %layout.root(),
        "Starting local pool"
    );

    let mut nodes = Vec::with_capacity(args.peers);
    let mut handles = Vec::with_capacity(args.peers);
    for index in 0..args.peers {
        let config = NodeConfig::new(peer_identity(index)).with_root(args.root.clone());
        let node = Arc::new(Node::new(config, Arc::new(ns.clone()), compute.clone()));
        let runner = node.clone();
        let token = shutdown.child_token();
        handles.push(tokio::spawn(async move {
            if let Err(e) = runner.run(token).await {
                tracing::error!(identity = %runner.identity(), error = %e, "Node stopped with error");
            }
        }));
        nodes.push(node);
    }

    if let Some(port) = args.dashboard_port {
        let dashboard_addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let (session, _events) = ns.open_session().await;
        let state = DashboardState {
            ns: Arc::new(session),
            layout: layout.clone(),
        };
        tokio::spawn(async move {
            run_dashboard(dashboard_addr, state).await;
        });
    }

    if let Some(delay_ms) = args.kill_manager_after {
        let ns = ns.clone();
        let nodes = nodes.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let manager = nodes
                .iter()
                .map(|n| n.status())
                .find(|s| s.phase == NodePhase::Manager);
            match manager.and_then(|s| s.session_id.map(|id| (s.identity, id))) {
                Some((identity, session_id)) => {
                    tracing::warn!(identity = %identity, session_id, "Expiring manager session");
                    ns.expire_session(session_id).await;
                }
                None => tracing::warn!("No manager to kill"),
            }
        });
    }

    let (producer, _events) = ns.open_session().await;
    layout.ensure(&producer).await?;
    let mut ids = Vec::with_capacity(args.tasks);
    for i in 0..args.tasks {
        let command = args.command.replace("{i}", &i.to_string());
        ids.push(submit_task(&producer, &layout, command.as_bytes()).await?);
    }

    let waited = tokio::select! {
        _ = shutdown.cancelled() => None,
        results = wait_for_results(
            &producer,
            &layout,
            &ids,
            Duration::from_millis(50),
            Duration::from_secs(args.wait_secs),
        ) => Some(results),
    };

    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    let results = match waited {
        Some(results) => results?,
        None => return Ok(()),
    };
    print_results(&results, &args.output)?;

    let failed = results
        .iter()
        .filter(|r| r.status == ResultStatus::Failed)
        .count();
    if failed > 0 {
        return Err(format!("{} of {} tasks failed", failed, results.len()).into());
    }
    Ok(())
}

#[cfg(feature = "zookeeper")]
async fn run_node(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    use distpool::namespace::zookeeper::ZkConnector;
    use distpool::namespace::Connector;

    let namespace = args.endpoint.namespace();
    let config = NodeConfig::new(args.identity.unwrap_or_else(distpool::config::default_identity))
        .with_endpoint(namespace.endpoint)
        .with_root(namespace.root);

    let shutdown = install_shutdown_handler()?;
    let connector = Arc::new(ZkConnector::from_config(&config.namespace));
    let compute: Arc<dyn Compute> =
        Arc::new(ShellCompute::new().with_timeout(Duration::from_millis(args.task_timeout_ms)));

    if let Some(port) = args.dashboard_port {
        let dashboard_addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let (session, _events) = connector.connect().await?;
        let state = DashboardState {
            ns: session,
            layout: Layout::new(config.namespace.root.clone()),
        };
        tokio::spawn(async move {
            run_dashboard(dashboard_addr, state).await;
        });
    }

    tracing::info!(
        identity = %config.identity,
        endpoint = %config.namespace.endpoint,
        root = %config.namespace.root,
        "Starting node"
    );
    let node = Node::new(config, connector, compute);
    node.run(shutdown).await?;
    Ok(())
}

#[cfg(feature = "zookeeper")]
async fn run_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    use distpool::namespace::zookeeper::ZkConnector;
    use distpool::namespace::Connector;

    let namespace = args.endpoint.namespace();
    let (session, _events) = ZkConnector::from_config(&namespace).connect().await?;
    let layout = Layout::new(namespace.root.clone());
    layout.ensure(session.as_ref()).await?;

    let mut ids = Vec::with_capacity(args.commands.len());
    for command in &args.commands {
        ids.push(submit_task(session.as_ref(), &layout, command.as_bytes()).await?);
    }
    let results = wait_for_results(
        session.as_ref(),
        &layout,
        &ids,
        Duration::from_millis(200),
        Duration::from_secs(args.wait_secs),
    )
    .await;
    session.close().await?;

    let results = results?;
    print_results(&results, &args.output)?;
    let failed = results
        .iter()
        .filter(|r| r.status == ResultStatus::Failed)
        .count();
    if failed > 0 {
        return Err(format!("{} of {} tasks failed", failed, results.len()).into());
    }
    Ok(())
}

fn print_results(results: &[TaskResult], output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let rows: Vec<ResultOutput> = results.iter().map(ResultOutput::from).collect();
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            println!("{:<18} {:<20} {:<10} OUTPUT", "TASK ID", "WORKER", "STATUS");
            println!("{}", "-".repeat(78));
            for row in &rows {
                let text = row.error.as_deref().unwrap_or(&row.output);
                // Truncate output if too long
                let display = if text.chars().count() > 40 {
                    format!("{}...", text.chars().take(37).collect::<String>())
                } else {
                    text.to_string()
                };
                println!(
                    "{:<18} {:<20} {:<10} {}",
                    row.task_id, row.worker_id, row.status, display
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Local(local_args) => {
            run_local(local_args).await?;
        }
        #[cfg(feature = "zookeeper")]
        Commands::Node(node_args) => {
            run_node(node_args).await?;
        }
        #[cfg(feature = "zookeeper")]
        Commands::Submit(submit_args) => {
            run_submit(submit_args).await?;
        }
    }

    Ok(())
}
