use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::{DistError, Result};
use crate::namespace::{Layout, Namespace};
use crate::task::Assignment;

/// Worker liveness/activity as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Dead,
}

impl WorkerState {
    /// Parse the payload of a worker's liveness marker.
    pub fn parse(data: &[u8]) -> Option<Self> {
        match data {
            b"idle" => Some(WorkerState::Idle),
            b"busy" => Some(WorkerState::Busy),
            _ => None,
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            WorkerState::Idle => b"idle",
            WorkerState::Busy => b"busy",
            WorkerState::Dead => b"dead",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Busy => write!(f, "busy"),
            WorkerState::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEntry {
    pub id: String,
    /// `None` until the liveness marker has been inspected, or while the
    /// worker is between two reports
    pub state: Option<WorkerState>,
    /// Set exactly when `state == Some(Busy)`
    pub current: Option<Assignment>,
    /// A liveness marker has been read at least once
    pub seen_alive: bool,
    /// First observation without marker or slot, while still unseen
    pub registering_since: Option<Instant>,
}

impl WorkerEntry {
    fn new(id: String) -> Self {
        Self {
            id,
            state: None,
            current: None,
            seen_alive: false,
            registering_since: None,
        }
    }

    pub fn is_assignable(&self) -> bool {
        self.state == Some(WorkerState::Idle) && self.current.is_none()
    }
}

/// What one read of a worker's nodes found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Liveness marker present; `state` is `None` for an unreadable payload
    Alive {
        state: Option<WorkerState>,
        slot: Option<Assignment>,
    },
    /// Liveness marker absent
    Vanished { slot: Option<Assignment> },
}

/// How an observation changed the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Updated,
    /// The worker finished this assignment and can take another one
    Freed(Assignment),
    /// Marker absent and nothing suggests the worker ever ran; keep waiting
    Registering,
    /// Liveness lost; carries the task it held, if any
    Dead(Option<Assignment>),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistryDelta {
    pub added: Vec<String>,
    pub removed: Vec<WorkerEntry>,
}

/// Manager-side view of registered workers, keyed (and therefore ordered) by
/// their sequential id.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, WorkerEntry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile with a full child listing of the workers directory.
    pub fn apply_listing(&mut self, ids: &[String]) -> RegistryDelta {
        let mut delta = RegistryDelta::default();

        let gone: Vec<String> = self
            .workers
            .keys()
            .filter(|id| !ids.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(entry) = self.workers.remove(&id) {
                delta.removed.push(entry);
            }
        }

        for id in ids {
            if !self.workers.contains_key(id) {
                self.workers.insert(id.clone(), WorkerEntry::new(id.clone()));
                delta.added.push(id.clone());
            }
        }
        delta
    }

    /// Fold a fresh observation of worker `id` into its entry.
    pub fn apply_observation(&mut self, id: &str, observation: Observation) -> Transition {
        let Some(entry) = self.workers.get_mut(id) else {
            return Transition::Unchanged;
        };
        if entry.state == Some(WorkerState::Dead) {
            return Transition::Unchanged;
        }
        let before = entry.clone();

        match observation {
            Observation::Vanished { slot } => {
                if !entry.seen_alive && entry.current.is_none() && slot.is_none() {
                    entry.registering_since.get_or_insert_with(Instant::now);
                    return Transition::Registering;
                }
                let orphan = slot.or_else(|| entry.current.take());
                entry.state = Some(WorkerState::Dead);
                entry.current = None;
                Transition::Dead(orphan)
            }
            Observation::Alive { state, slot } => {
                entry.seen_alive = true;
                entry.registering_since = None;
                let finished = match (state, slot) {
                    (Some(_), Some(assignment)) => {
                        // Reported idle with a full slot: handed off but not yet consumed.
                        entry.state = Some(WorkerState::Busy);
                        let previous = entry.current.replace(assignment.clone());
                        previous.filter(|p| p.task_id != assignment.task_id)
                    }
                    (Some(WorkerState::Idle), None) => {
                        entry.state = Some(WorkerState::Idle);
                        entry.current.take()
                    }
                    (_, None) => {
                        // Busy with an empty slot: result written, idle report pending.
                        entry.state = None;
                        entry.current.take()
                    }
                    (None, Some(assignment)) => {
                        entry.state = Some(WorkerState::Busy);
                        entry.current = Some(assignment);
                        None
                    }
                };
                match finished {
                    Some(assignment) => Transition::Freed(assignment),
                    None if *entry == before => Transition::Unchanged,
                    None => Transition::Updated,
                }
            }
        }
    }

    /// Record a hand-off made by the scheduler.
    pub fn mark_assigned(&mut self, id: &str, assignment: Assignment) {
        if let Some(entry) = self.workers.get_mut(id) {
            entry.state = Some(WorkerState::Busy);
            entry.current = Some(assignment);
            entry.seen_alive = true;
        }
    }

    /// The worker's slot turned out to be occupied or its node missing; stop
    /// offering it until its next report.
    pub fn mark_unavailable(&mut self, id: &str) {
        if let Some(entry) = self.workers.get_mut(id) {
            if entry.current.is_none() {
                entry.state = None;
            }
        }
    }

    /// How long worker `id` has been listed without ever showing a marker.
    pub fn registering_for(&self, id: &str) -> Option<Duration> {
        self.workers
            .get(id)
            .and_then(|w| w.registering_since)
            .map(|since| since.elapsed())
    }

    /// Give up on a worker that never finished registering. Its node is
    /// cleaned up like a dead worker's.
    pub fn abandon(&mut self, id: &str) {
        if let Some(entry) = self.workers.get_mut(id) {
            entry.state = Some(WorkerState::Dead);
            entry.registering_since = None;
        }
    }

    pub fn get(&self, id: &str) -> Option<&WorkerEntry> {
        self.workers.get(id)
    }

    /// Assignable workers in registration order.
    pub fn idle_workers(&self) -> Vec<String> {
        self.workers
            .values()
            .filter(|w| w.is_assignable())
            .map(|w| w.id.clone())
            .collect()
    }

    /// Workers whose liveness was lost but whose nodes are still listed.
    pub fn dead_workers(&self) -> Vec<String> {
        self.workers
            .values()
            .filter(|w| w.state == Some(WorkerState::Dead))
            .map(|w| w.id.clone())
            .collect()
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Read worker `id`'s liveness marker (re-arming its data watch) and its
/// assignment slot.
pub async fn observe(ns: &dyn Namespace, layout: &Layout, id: &str) -> Result<Observation> {
    let slot = read_slot(ns, layout, id).await?;
    match ns.get_data(&layout.worker_state(id), true).await {
        Ok(data) => {
            let state = WorkerState::parse(&data);
            if state.is_none() {
                tracing::warn!(worker_id = id, "Unrecognised worker state payload");
            }
            Ok(Observation::Alive { state, slot })
        }
        Err(DistError::NoNode(_)) => Ok(Observation::Vanished { slot }),
        Err(e) => Err(e),
    }
}

/// Decode a worker's assignment slot, if occupied.
pub async fn read_slot(ns: &dyn Namespace, layout: &Layout, id: &str) -> Result<Option<Assignment>> {
    match ns.get_data(&layout.worker_slot(id), false).await {
        Ok(data) => match Assignment::decode(&data) {
            Ok(assignment) => Ok(Some(assignment)),
            Err(e) => {
                tracing::warn!(worker_id = id, error = %e, "Undecodable assignment slot");
                Ok(None)
            }
        },
        Err(DistError::NoNode(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn assignment(task: &str) -> Assignment {
        Assignment::new(task, b"payload".to_vec(), "mgr")
    }

    fn holds_busy_invariant(registry: &WorkerRegistry) -> bool {
        registry
            .workers()
            .all(|w| w.current.is_some() == (w.state == Some(WorkerState::Busy)))
    }

    #[test]
    fn listing_adds_and_removes() {
        let mut registry = WorkerRegistry::new();
        let delta = registry.apply_listing(&ids(&["w1", "w2"]));
        assert_eq!(delta.added, ids(&["w1", "w2"]));
        assert!(delta.removed.is_empty());
        assert_eq!(registry.get("w1").unwrap().state, None);

        registry.mark_assigned("w2", assignment("t1"));
        let delta = registry.apply_listing(&ids(&["w1", "w3"]));
        assert_eq!(delta.added, ids(&["w3"]));
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].id, "w2");
        assert_eq!(delta.removed[0].current.as_ref().unwrap().task_id, "t1");
    }

    #[test]
    fn idle_report_makes_worker_assignable() {
        let mut registry = WorkerRegistry::new();
        registry.apply_listing(&ids(&["w1"]));
        let t = registry.apply_observation(
            "w1",
            Observation::Alive {
                state: Some(WorkerState::Idle),
                slot: None,
            },
        );
        assert_eq!(t, Transition::Updated);
        assert_eq!(registry.idle_workers(), ids(&["w1"]));
        assert!(holds_busy_invariant(&registry));
    }

    #[test]
    fn stale_idle_with_full_slot_keeps_worker_reserved() {
        let mut registry = WorkerRegistry::new();
        registry.apply_listing(&ids(&["w1"]));
        let handed_off = assignment("t1");
        registry.mark_assigned("w1", handed_off.clone());
        let t = registry.apply_observation(
            "w1",
            Observation::Alive {
                state: Some(WorkerState::Idle),
                slot: Some(handed_off),
            },
        );
        assert_eq!(t, Transition::Unchanged);
        assert!(registry.idle_workers().is_empty());
        assert!(holds_busy_invariant(&registry));
    }

    #[test]
    fn idle_with_empty_slot_frees_the_task() {
        let mut registry = WorkerRegistry::new();
        registry.apply_listing(&ids(&["w1"]));
        registry.mark_assigned("w1", assignment("t1"));
        let t = registry.apply_observation(
            "w1",
            Observation::Alive {
                state: Some(WorkerState::Idle),
                slot: None,
            },
        );
        match t {
            Transition::Freed(a) => assert_eq!(a.task_id, "t1"),
            other => panic!("unexpected transition {:?}", other),
        }
        assert_eq!(registry.idle_workers(), ids(&["w1"]));
    }

    #[test]
    fn busy_with_empty_slot_is_not_assignable() {
        let mut registry = WorkerRegistry::new();
        registry.apply_listing(&ids(&["w1"]));
        registry.mark_assigned("w1", assignment("t1"));
        let t = registry.apply_observation(
            "w1",
            Observation::Alive {
                state: Some(WorkerState::Busy),
                slot: None,
            },
        );
        assert!(matches!(t, Transition::Freed(_)));
        assert!(registry.idle_workers().is_empty());
        assert!(holds_busy_invariant(&registry));
    }

    #[test]
    fn vanished_marker_of_busy_worker_is_death_with_orphan() {
        let mut registry = WorkerRegistry::new();
        registry.apply_listing(&ids(&["w1"]));
        registry.mark_assigned("w1", assignment("t1"));
        let t = registry.apply_observation("w1", Observation::Vanished { slot: None });
        match t {
            Transition::Dead(Some(a)) => assert_eq!(a.task_id, "t1"),
            other => panic!("unexpected transition {:?}", other),
        }
        assert_eq!(registry.dead_workers(), ids(&["w1"]));
        assert!(holds_busy_invariant(&registry));
    }

    #[test]
    fn vanished_marker_of_unseen_worker_is_registration_in_progress() {
        let mut registry = WorkerRegistry::new();
        registry.apply_listing(&ids(&["w1"]));
        let t = registry.apply_observation("w1", Observation::Vanished { slot: None });
        assert_eq!(t, Transition::Registering);
        assert!(registry.dead_workers().is_empty());
    }

    #[test]
    fn vanished_marker_with_slot_is_orphan_even_if_unseen() {
        let mut registry = WorkerRegistry::new();
        registry.apply_listing(&ids(&["w1"]));
        let t = registry.apply_observation(
            "w1",
            Observation::Vanished {
                slot: Some(assignment("t9")),
            },
        );
        assert!(matches!(t, Transition::Dead(Some(a)) if a.task_id == "t9"));
    }

    #[test]
    fn worker_between_reports_is_still_recognised_as_dead() {
        let mut registry = WorkerRegistry::new();
        registry.apply_listing(&ids(&["w1"]));
        registry.mark_assigned("w1", assignment("t1"));
        registry.apply_observation(
            "w1",
            Observation::Alive {
                state: Some(WorkerState::Busy),
                slot: None,
            },
        );
        let t = registry.apply_observation("w1", Observation::Vanished { slot: None });
        assert_eq!(t, Transition::Dead(None));
    }

    #[test]
    fn state_payload_parsing() {
        assert_eq!(WorkerState::parse(b"idle"), Some(WorkerState::Idle));
        assert_eq!(WorkerState::parse(b"busy"), Some(WorkerState::Busy));
        assert_eq!(WorkerState::parse(b"zombie"), None);
        assert_eq!(WorkerState::Busy.as_bytes(), b"busy");
    }

    #[test]
    fn registration_age_is_tracked_until_marker_appears() {
        let mut registry = WorkerRegistry::new();
        registry.apply_listing(&ids(&["w1"]));
        assert!(registry.registering_for("w1").is_none());

        registry.apply_observation("w1", Observation::Vanished { slot: None });
        let first = registry.get("w1").unwrap().registering_since;
        assert!(first.is_some());
        registry.apply_observation("w1", Observation::Vanished { slot: None });
        assert_eq!(registry.get("w1").unwrap().registering_since, first);

        registry.apply_observation(
            "w1",
            Observation::Alive {
                state: Some(WorkerState::Idle),
                slot: None,
            },
        );
        assert!(registry.registering_for("w1").is_none());
    }

    #[test]
    fn abandoned_registration_counts_as_dead() {
        let mut registry = WorkerRegistry::new();
        registry.apply_listing(&ids(&["w1"]));
        registry.apply_observation("w1", Observation::Vanished { slot: None });
        registry.abandon("w1");
        assert_eq!(registry.dead_workers(), ids(&["w1"]));
        assert!(registry.registering_for("w1").is_none());
        assert_eq!(
            registry.apply_observation("w1", Observation::Vanished { slot: None }),
            Transition::Unchanged
        );
    }
}
