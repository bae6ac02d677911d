//! Worker role: registration, assignment consumption and task execution.
//!
//! The agent's event loop only reacts to notifications. Each task runs on its
//! own tokio task, which reports back solely through the namespace: it writes
//! the result, clears the assignment slot and finally flips the liveness
//! marker back to `idle`. The manager frees the worker only once it sees
//! `idle` together with an empty slot.
//!
//! # Components
//!
//! - [`WorkerAgent`]: registers and runs the worker role on one session
//! - [`executor`]: the [`Compute`] capability and its shell implementation

pub mod executor;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::election::{try_become_leader, Role};
use crate::error::{DistError, Result};
use crate::manager::WorkerState;
use crate::namespace::layout::WORKER_PREFIX;
use crate::namespace::{ignore_missing, node_name, CreateMode, EventKind, EventStream, Layout, Namespace};
use crate::retry::{with_retry, RetryPolicy};
use crate::task::{Assignment, TaskResult};

pub use executor::{Compute, ComputeError, FnCompute, ShellCompute};

/// Why the worker role ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    Shutdown,
    /// Won the leadership marker; the session continues as manager.
    Promoted,
    /// Liveness marker removed (unhealthy compute or external deletion).
    Deregistered,
}

struct Running {
    task_id: String,
    handle: JoinHandle<()>,
}

pub struct WorkerAgent {
    ns: Arc<dyn Namespace>,
    layout: Layout,
    identity: String,
    retry: RetryPolicy,
    compute: Arc<dyn Compute>,
    worker_id: Option<String>,
    current: Option<Running>,
}

impl WorkerAgent {
    pub fn new(ns: Arc<dyn Namespace>, layout: Layout, config: &NodeConfig, compute: Arc<dyn Compute>) -> Self {
        Self {
            ns,
            layout,
            identity: config.identity.clone(),
            retry: config.retry.clone(),
            compute,
            worker_id: None,
            current: None,
        }
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    /// Id of the task being executed, if any.
    pub fn current_task(&self) -> Option<&str> {
        self.current.as_ref().map(|r| r.task_id.as_str())
    }

    /// Create the worker node and its `idle` liveness marker.
    pub async fn register(&mut self) -> Result<String> {
        let ns = self.ns.as_ref();
        let prefix = self.layout.worker(WORKER_PREFIX);
        let identity = self.identity.as_bytes();
        let path = with_retry(&self.retry, "register_worker", || {
            ns.create(&prefix, identity, CreateMode::PersistentSequential)
        })
        .await?;
        let worker_id = node_name(&path).to_string();

        let state = self.layout.worker_state(&worker_id);
        with_retry(&self.retry, "create_state", || {
            ns.create(&state, WorkerState::Idle.as_bytes(), CreateMode::Ephemeral)
        })
        .await?;

        tracing::info!(worker_id = %worker_id, identity = %self.identity, "Worker registered");
        self.worker_id = Some(worker_id.clone());
        Ok(worker_id)
    }

    /// Serve assignments until shutdown, promotion or loss of the session.
    ///
    /// A role that ends with an error never leaves its task running.
    pub async fn run(&mut self, events: &mut EventStream, shutdown: CancellationToken) -> Result<AgentExit> {
        let outcome = self.serve(events, shutdown).await;
        if outcome.is_err() {
            self.abort_current();
        }
        outcome
    }

    async fn serve(&mut self, events: &mut EventStream, shutdown: CancellationToken) -> Result<AgentExit> {
        let worker_id = match &self.worker_id {
            Some(id) => id.clone(),
            None => self.register().await?,
        };
        let slot = self.layout.worker_slot(&worker_id);
        let state = self.layout.worker_state(&worker_id);
        let marker = self.layout.manager();

        if self.ns.exists(&state, true).await? {
            tracing::debug!(worker_id = %worker_id, "Watching own liveness marker");
        } else {
            return Ok(AgentExit::Deregistered);
        }
        if self.watch_slot(&slot).await? {
            self.consume(&worker_id, &slot).await?;
        }
        if !self.ns.exists(&marker, true).await? && self.contest().await? {
            self.step_down(&worker_id).await?;
            return Ok(AgentExit::Promoted);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(worker_id = %worker_id, "Worker shutting down");
                    self.abort_current();
                    return Ok(AgentExit::Shutdown);
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(DistError::SessionExpired);
                    };
                    tracing::debug!(kind = %event.kind, path = %event.path, "Worker event");

                    if event.kind == EventKind::SessionExpired {
                        tracing::warn!(worker_id = %worker_id, "Worker session expired");
                        return Err(DistError::SessionExpired);
                    }

                    if event.path == slot {
                        if self.watch_slot(&slot).await? {
                            self.consume(&worker_id, &slot).await?;
                        }
                    } else if event.path == marker {
                        let vacated = event.kind == EventKind::NodeDeleted
                            || !self.ns.exists(&marker, true).await?;
                        if vacated && self.contest().await? {
                            self.step_down(&worker_id).await?;
                            return Ok(AgentExit::Promoted);
                        }
                    } else if event.path == state {
                        // Our own busy/idle writes fire this watch too; only removal matters.
                        let removed = event.kind == EventKind::NodeDeleted
                            || !self.ns.exists(&state, true).await?;
                        if removed {
                            tracing::warn!(worker_id = %worker_id, "Liveness marker removed, leaving the pool");
                            self.abort_current();
                            return Ok(AgentExit::Deregistered);
                        }
                    }
                }
            }
        }
    }

    /// Re-arm the slot watch; true when the slot is occupied.
    async fn watch_slot(&self, slot: &str) -> Result<bool> {
        let ns = self.ns.as_ref();
        with_retry(&self.retry, "watch_slot", || ns.exists(slot, true)).await
    }

    /// Pick up the assignment in the slot and start executing it.
    async fn consume(&mut self, worker_id: &str, slot: &str) -> Result<()> {
        let ns = self.ns.as_ref();
        let data = match with_retry(&self.retry, "read_slot", || ns.get_data(slot, false)).await {
            Ok(data) => data,
            // Cleared between the notification and the read; the watch is armed.
            Err(DistError::NoNode(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let assignment = match Assignment::decode(&data) {
            Ok(assignment) => assignment,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Undecodable assignment, discarding");
                return ignore_missing(ns.delete(slot).await);
            }
        };

        if let Some(running) = &self.current {
            if running.task_id == assignment.task_id {
                return Ok(());
            }
            if !running.handle.is_finished() {
                // Only reachable once the previous run has reported idle.
                tracing::debug!(worker_id, task_id = %running.task_id, "Previous run still winding down");
            }
        }

        let state = self.layout.worker_state(worker_id);
        with_retry(&self.retry, "report_busy", || ns.set_data(&state, WorkerState::Busy.as_bytes())).await?;
        tracing::info!(worker_id, task_id = %assignment.task_id, "Task received");

        let task_id = assignment.task_id.clone();
        let execution = Execution {
            ns: self.ns.clone(),
            layout: self.layout.clone(),
            worker_id: worker_id.to_string(),
            retry: self.retry.clone(),
            compute: self.compute.clone(),
        };
        let handle = tokio::spawn(async move {
            if let Err(e) = execution.run(assignment).await {
                tracing::error!(error = %e, "Could not report task outcome");
            }
        });
        self.current = Some(Running { task_id, handle });
        Ok(())
    }

    /// Race for the vacated marker. Loops until either this session holds it or
    /// a watch is armed on someone else's.
    async fn contest(&self) -> Result<bool> {
        let marker = self.layout.manager();
        loop {
            match try_become_leader(self.ns.as_ref(), &self.layout, &self.identity).await? {
                Role::Manager => return Ok(true),
                Role::Worker => {
                    if self.ns.exists(&marker, true).await? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Leave the worker role after winning the marker. The slot is kept so the
    /// task in flight is recovered like any other orphan.
    async fn step_down(&mut self, worker_id: &str) -> Result<()> {
        tracing::info!(worker_id, "Promoted to manager, leaving the worker pool");
        self.abort_current();
        let ns = self.ns.as_ref();
        ignore_missing(ns.delete(&self.layout.worker_state(worker_id)).await)?;
        if !ns.exists(&self.layout.worker_slot(worker_id), false).await? {
            match ns.delete(&self.layout.worker(worker_id)).await {
                Ok(()) | Err(DistError::NoNode(_)) | Err(DistError::NotEmpty(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.worker_id = None;
        Ok(())
    }

    fn abort_current(&mut self) {
        if let Some(running) = self.current.take() {
            if !running.handle.is_finished() {
                tracing::info!(task_id = %running.task_id, "Aborting task in flight");
            }
            running.handle.abort();
        }
    }
}

/// Everything a spawned task run needs; detached from the agent's state.
struct Execution {
    ns: Arc<dyn Namespace>,
    layout: Layout,
    worker_id: String,
    retry: RetryPolicy,
    compute: Arc<dyn Compute>,
}

impl Execution {
    /// Compute, then write the result, clear the slot and report idle.
    async fn run(self, assignment: Assignment) -> Result<()> {
        let task = assignment.into_task();
        let task_id = task.id.clone();
        let (result, unhealthy) = match self.compute.compute(&task).await {
            Ok(output) => (TaskResult::completed(&task_id, &self.worker_id, output), false),
            Err(ComputeError::Failed(reason)) => (TaskResult::failed(&task_id, &self.worker_id, reason), false),
            Err(ComputeError::Unhealthy(reason)) => {
                tracing::error!(task_id = %task_id, worker_id = %self.worker_id, reason = %reason, "Worker unhealthy");
                (TaskResult::failed(&task_id, &self.worker_id, reason), true)
            }
        };

        let ns = self.ns.as_ref();
        let encoded = result.encode()?;
        let result_path = self.layout.result(&task_id);
        match with_retry(&self.retry, "write_result", || {
            ns.create(&result_path, &encoded, CreateMode::Persistent)
        })
        .await
        {
            Ok(_) => {}
            // Re-executed after a recovery; the latest run wins.
            Err(DistError::NodeExists(_)) => {
                with_retry(&self.retry, "write_result", || ns.set_data(&result_path, &encoded)).await?;
            }
            Err(e) => return Err(e),
        }
        tracing::info!(
            task_id = %task_id,
            worker_id = %self.worker_id,
            status = %result.status,
            "Result written"
        );

        let slot = self.layout.worker_slot(&self.worker_id);
        ignore_missing(with_retry(&self.retry, "clear_slot", || ns.delete(&slot)).await)?;

        let state = self.layout.worker_state(&self.worker_id);
        if unhealthy {
            ignore_missing(with_retry(&self.retry, "deregister", || ns.delete(&state)).await)
        } else {
            with_retry(&self.retry, "report_idle", || ns.set_data(&state, WorkerState::Idle.as_bytes())).await
        }
    }
}
