//! Manager role: worker registry, task watcher and assignment scheduler
//! driven by one event loop.
//!
//! Every refresh re-reads the full view and re-arms its watch in the same
//! read, and every handled event ends with a dispatch pass. The loop owns all
//! manager state, so passes can never overlap.

pub mod assigner;
pub mod registry;
pub mod tasks;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{DistError, Result};
use crate::namespace::{EventKind, EventStream, Layout, Namespace, WatchedEvent};
use crate::retry::{with_retry, RetryPolicy};

pub use assigner::{Assigner, DispatchReport, HandOff};
pub use registry::{Observation, Transition, WorkerEntry, WorkerRegistry, WorkerState};
pub use tasks::TaskWatcher;

/// Views whose last refresh failed and must be re-read on the next resync tick.
#[derive(Debug, Default)]
struct Dirty {
    tasks: bool,
    workers: bool,
    states: BTreeSet<String>,
}

impl Dirty {
    fn any(&self) -> bool {
        self.tasks || self.workers || !self.states.is_empty()
    }
}

pub struct Manager {
    ns: Arc<dyn Namespace>,
    layout: Layout,
    retry: RetryPolicy,
    registry: WorkerRegistry,
    tasks: TaskWatcher,
    assigner: Assigner,
    dirty: Dirty,
    resync_interval: Duration,
    registration_grace: Duration,
}

impl Manager {
    pub fn new(ns: Arc<dyn Namespace>, layout: Layout, config: &NodeConfig) -> Self {
        Self {
            ns,
            layout,
            retry: config.retry.clone(),
            registry: WorkerRegistry::new(),
            tasks: TaskWatcher::new(),
            assigner: Assigner::new(config.identity.clone(), config.retry.clone()),
            dirty: Dirty::default(),
            resync_interval: Duration::from_millis(config.resync_interval_ms),
            registration_grace: Duration::from_millis(config.registration_grace_ms),
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Listed tasks not yet handed to a worker, in dispatch order.
    pub fn pending_tasks(&self) -> Vec<String> {
        self.assigner.unclaimed(self.tasks.listing()).cloned().collect()
    }

    /// task id -> worker id for every hand-off not yet released.
    pub fn claimed(&self) -> &BTreeMap<String, String> {
        self.assigner.claimed()
    }

    /// Rebuild state from the namespace, as a newly elected manager must.
    pub async fn bootstrap(&mut self) -> Result<()> {
        let workers = self.refresh_workers().await;
        self.absorb(workers, |d| d.workers = true)?;
        let tasks = self.refresh_tasks().await;
        self.absorb(tasks, |d| d.tasks = true)?;
        tracing::info!(
            workers = self.registry.len(),
            pending = self.tasks.len(),
            claimed = self.assigner.claimed().len(),
            "Manager state rebuilt"
        );
        self.dispatch().await
    }

    /// Consume the session's events until shutdown or until the session is lost.
    pub async fn run(&mut self, events: &mut EventStream, shutdown: CancellationToken) -> Result<()> {
        self.bootstrap().await?;

        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Manager shutting down");
                    return Ok(());
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await?,
                        // The session dropped its sender without an expiry notice.
                        None => return Err(DistError::SessionExpired),
                    }
                }
                _ = resync.tick(), if self.dirty.any() => {
                    self.resync().await?;
                }
            }
        }
    }

    /// Route one notification to the view it concerns, then dispatch.
    pub async fn handle_event(&mut self, event: WatchedEvent) -> Result<()> {
        tracing::debug!(kind = %event.kind, path = %event.path, "Manager event");

        if event.kind == EventKind::SessionExpired {
            tracing::warn!("Manager session expired");
            return Err(DistError::SessionExpired);
        }

        if event.path == self.layout.tasks() {
            let refreshed = self.refresh_tasks().await;
            self.absorb(refreshed, |d| d.tasks = true)?;
        } else if event.path == self.layout.workers() {
            let refreshed = self.refresh_workers().await;
            self.absorb(refreshed, |d| d.workers = true)?;
        } else if let Some(id) = self.layout.worker_of_state_path(&event.path) {
            let id = id.to_string();
            let observed = self.observe_worker(&id).await;
            self.absorb(observed, |d| {
                d.states.insert(id.clone());
            })?;
        } else {
            return Ok(());
        }

        self.dispatch().await
    }

    async fn resync(&mut self) -> Result<()> {
        tracing::debug!(
            tasks = self.dirty.tasks,
            workers = self.dirty.workers,
            states = self.dirty.states.len(),
            "Resyncing dirty views"
        );
        if std::mem::take(&mut self.dirty.workers) {
            let refreshed = self.refresh_workers().await;
            self.absorb(refreshed, |d| d.workers = true)?;
        }
        for id in std::mem::take(&mut self.dirty.states) {
            let observed = self.observe_worker(&id).await;
            self.absorb(observed, |d| {
                d.states.insert(id.clone());
            })?;
        }
        if std::mem::take(&mut self.dirty.tasks) {
            let refreshed = self.refresh_tasks().await;
            self.absorb(refreshed, |d| d.tasks = true)?;
        }
        self.dispatch().await
    }

    async fn refresh_tasks(&mut self) -> Result<()> {
        let ns = self.ns.as_ref();
        let layout = &self.layout;
        let listing = with_retry(&self.retry, "list_tasks", || tasks::list_tasks(ns, layout)).await?;
        let appeared = self.tasks.apply_listing(listing);
        if !appeared.is_empty() {
            tracing::info!(count = appeared.len(), "New tasks submitted");
        }
        Ok(())
    }

    async fn refresh_workers(&mut self) -> Result<()> {
        let path = self.layout.workers();
        let ns = self.ns.as_ref();
        let listing = with_retry(&self.retry, "list_workers", || ns.get_children(&path, true)).await?;
        let delta = self.registry.apply_listing(&listing);

        for entry in delta.removed {
            if entry.state == Some(WorkerState::Dead) {
                continue;
            }
            tracing::warn!(worker_id = %entry.id, "Worker node removed");
            if entry.current.is_some() {
                self.assigner
                    .recover_orphan(self.ns.as_ref(), &self.layout, &entry.id, entry.current)
                    .await?;
            }
        }

        for id in delta.added {
            tracing::info!(worker_id = %id, "Worker registered");
            let observed = self.observe_worker(&id).await;
            self.absorb(observed, |d| {
                d.states.insert(id.clone());
            })?;
        }

        // Dead workers whose cleanup did not complete earlier.
        for id in self.registry.dead_workers() {
            self.assigner
                .clear_worker(self.ns.as_ref(), &self.layout, &id)
                .await?;
        }
        Ok(())
    }

    /// Read a worker's marker and slot and fold the result into the registry.
    async fn observe_worker(&mut self, id: &str) -> Result<()> {
        let ns = self.ns.as_ref();
        let layout = &self.layout;
        let mut observation = with_retry(&self.retry, "observe_worker", || registry::observe(ns, layout, id)).await?;
        let mut transition = self.registry.apply_observation(id, observation.clone());

        if transition == Transition::Registering {
            // The marker may have appeared between the read and arming the watch.
            let state = layout.worker_state(id);
            if with_retry(&self.retry, "watch_state", || ns.exists(&state, true)).await? {
                observation = with_retry(&self.retry, "observe_worker", || registry::observe(ns, layout, id)).await?;
                transition = self.registry.apply_observation(id, observation.clone());
            } else if self
                .registry
                .registering_for(id)
                .map_or(false, |age| age >= self.registration_grace)
            {
                // Left behind by a session that ended while no manager was watching.
                tracing::warn!(worker_id = id, "Worker never finished registering, removing it");
                self.registry.abandon(id);
                self.assigner.clear_worker(ns, layout, id).await?;
                return Ok(());
            } else {
                tracing::debug!(worker_id = id, "Worker still registering");
                // Polled on the resync tick until the marker shows up or the grace runs out.
                self.dirty.states.insert(id.to_string());
                return Ok(());
            }
        }

        if let Observation::Alive {
            slot: Some(assignment),
            ..
        } = &observation
        {
            self.assigner.adopt(id, assignment);
        }

        match transition {
            Transition::Freed(assignment) => {
                tracing::info!(task_id = %assignment.task_id, worker_id = id, "Worker finished task");
                self.assigner.release(&assignment.task_id);
            }
            Transition::Dead(orphan) => {
                tracing::warn!(
                    worker_id = id,
                    task_id = ?orphan.as_ref().map(|a| &a.task_id),
                    "Worker lost"
                );
                self.assigner
                    .recover_orphan(self.ns.as_ref(), &self.layout, id, orphan)
                    .await?;
            }
            Transition::Updated => {
                if let Some(entry) = self.registry.get(id) {
                    tracing::debug!(
                        worker_id = id,
                        state = %entry.state.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into()),
                        "Worker state changed"
                    );
                }
            }
            Transition::Unchanged | Transition::Registering => {}
        }
        Ok(())
    }

    async fn dispatch(&mut self) -> Result<()> {
        let report = self
            .assigner
            .dispatch_pending(
                self.ns.as_ref(),
                &self.layout,
                self.tasks.listing(),
                &mut self.registry,
            )
            .await;
        match report {
            Ok(report) => {
                if !report.assigned.is_empty() {
                    tracing::debug!(assigned = report.assigned.len(), "Dispatch pass complete");
                }
                if !self.assigner.uncertain().is_empty() {
                    // Settled by the next pass, which the resync tick guarantees.
                    self.dirty.tasks = true;
                }
                Ok(())
            }
            Err(e) => self.absorb(Err(e), |d| d.tasks = true),
        }
    }

    /// Session loss ends the role; any other failure marks the view for resync.
    fn absorb(&mut self, result: Result<()>, mark: impl FnOnce(&mut Dirty)) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_session_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Manager view refresh failed, will resync");
                mark(&mut self.dirty);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{CreateMode, MemoryNamespace};
    use crate::retry::RetryPolicy;
    use crate::task::Assignment;

    async fn manager_on(ns: &MemoryNamespace) -> (Manager, EventStream, Layout) {
        let config = NodeConfig::new("mgr").with_retry(RetryPolicy::immediate(3));
        manager_with(ns, config).await
    }

    async fn manager_with(ns: &MemoryNamespace, config: NodeConfig) -> (Manager, EventStream, Layout) {
        let (session, events) = ns.open_session().await;
        let layout = Layout::default();
        layout.ensure(&session).await.unwrap();
        let manager = Manager::new(Arc::new(session), layout.clone(), &config);
        (manager, events, layout)
    }

    async fn drain(manager: &mut Manager, events: &mut EventStream) {
        while let Ok(event) = events.try_recv() {
            manager.handle_event(event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn takeover_adopts_slots_and_finishes_half_done_hand_off() {
        let ns = MemoryNamespace::new();
        let (other, _o) = ns.open_session().await;
        let (mut manager, mut events, layout) = manager_on(&ns).await;

        // Previous manager wrote w1's slot but died before deleting the pending entry.
        other
            .create(&layout.worker("w1"), b"", CreateMode::Persistent)
            .await
            .unwrap();
        other
            .create(&layout.worker_state("w1"), b"idle", CreateMode::Ephemeral)
            .await
            .unwrap();
        let assignment = Assignment::new("t1", b"job".to_vec(), "old");
        other
            .create(&layout.worker_slot("w1"), &assignment.encode().unwrap(), CreateMode::Persistent)
            .await
            .unwrap();
        other
            .create(&layout.task("t1"), b"job", CreateMode::Persistent)
            .await
            .unwrap();

        manager.bootstrap().await.unwrap();
        drain(&mut manager, &mut events).await;

        assert_eq!(manager.claimed().get("t1").map(String::as_str), Some("w1"));
        assert!(manager.pending_tasks().is_empty());
        assert!(!other.exists(&layout.task("t1"), false).await.unwrap());
        assert_eq!(manager.registry().get("w1").unwrap().state, Some(WorkerState::Busy));
    }

    #[tokio::test]
    async fn refresh_failures_are_resynced() {
        let ns = MemoryNamespace::new();
        let (producer, _p) = ns.open_session().await;
        let (mut manager, mut events, layout) = manager_on(&ns).await;
        manager.bootstrap().await.unwrap();

        producer
            .create(&layout.task("t1"), b"job", CreateMode::Persistent)
            .await
            .unwrap();
        // More failures than the retry policy absorbs.
        ns.inject_failures(5).await;
        drain(&mut manager, &mut events).await;
        assert!(manager.dirty.any());

        manager.resync().await.unwrap();
        assert!(!manager.dirty.any());
        assert_eq!(manager.pending_tasks(), vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn session_expiry_ends_the_role() {
        let ns = MemoryNamespace::new();
        let (mut manager, mut events, _layout) = manager_on(&ns).await;
        manager.bootstrap().await.unwrap();
        let id = manager.ns.session_id();
        assert!(ns.expire_session(id).await);

        let err = manager
            .run(&mut events, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DistError::SessionExpired));
    }

    #[tokio::test]
    async fn worker_node_without_marker_is_removed_after_grace() {
        let ns = MemoryNamespace::new();
        let (other, _o) = ns.open_session().await;
        let mut config = NodeConfig::new("mgr").with_retry(RetryPolicy::immediate(3));
        config.registration_grace_ms = 30;
        let (mut manager, mut events, layout) = manager_with(&ns, config).await;

        // A worker whose session ended between its two registration writes.
        other
            .create(&layout.worker("w1"), b"gone", CreateMode::Persistent)
            .await
            .unwrap();
        manager.bootstrap().await.unwrap();
        drain(&mut manager, &mut events).await;
        assert!(manager.registry().get("w1").is_some());
        assert!(manager.dirty.states.contains("w1"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        manager.resync().await.unwrap();
        drain(&mut manager, &mut events).await;

        assert!(!other.exists(&layout.worker("w1"), false).await.unwrap());
        assert!(manager.registry().get("w1").is_none());
        assert!(!manager.dirty.any());
    }

    #[tokio::test]
    async fn registering_worker_within_grace_is_kept() {
        let ns = MemoryNamespace::new();
        let (other, _o) = ns.open_session().await;
        let (mut manager, mut events, layout) = manager_on(&ns).await;
        manager.bootstrap().await.unwrap();

        other
            .create(&layout.worker("w1"), b"slow", CreateMode::Persistent)
            .await
            .unwrap();
        drain(&mut manager, &mut events).await;
        manager.resync().await.unwrap();
        assert!(other.exists(&layout.worker("w1"), false).await.unwrap());

        other
            .create(&layout.worker_state("w1"), b"idle", CreateMode::Ephemeral)
            .await
            .unwrap();
        drain(&mut manager, &mut events).await;
        assert_eq!(manager.registry().get("w1").unwrap().state, Some(WorkerState::Idle));
    }
}
