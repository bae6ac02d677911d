use std::collections::{BTreeMap, BTreeSet};

use crate::error::{DistError, Result};
use crate::manager::registry::{read_slot, WorkerRegistry, WorkerState};
use crate::manager::tasks::fetch_task;
use crate::namespace::{ignore_exists, ignore_missing, CreateMode, Layout, Namespace};
use crate::retry::{with_retry, RetryPolicy};
use crate::task::Assignment;

/// Outcome of one dispatch pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// `(task_id, worker_id)` in the order the hand-offs happened
    pub assigned: Vec<(String, String)>,
    /// Pending tasks left for lack of an idle worker
    pub stalled: Vec<String>,
}

/// Result of trying to hand one task to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandOff {
    Assigned(Assignment),
    /// Someone else's assignment is already in the slot
    SlotOccupied,
    /// The worker's node no longer exists
    WorkerGone,
    /// The pending entry disappeared before it could be read, or the task
    /// already has a result
    TaskGone,
    /// The slot create was never acknowledged; it may or may not have landed
    Uncertain,
}

/// Matches pending tasks to idle workers.
///
/// The hand-off is two namespace writes: create the worker's assignment slot,
/// then delete the pending entry. Creating the slot is exclusive, so a worker
/// can never receive two tasks, and both writes are safe to repeat. Tasks are
/// tracked in `claimed` from the first write on, so a pending entry whose
/// delete did not land yet is never handed out a second time.
///
/// A slot create whose every attempt lost its acknowledgement leaves the pair
/// in `uncertain`. Neither the task nor the worker is offered again until the
/// slot has been read back at the start of a later pass.
#[derive(Debug)]
pub struct Assigner {
    identity: String,
    retry: RetryPolicy,
    /// task id -> worker id
    claimed: BTreeMap<String, String>,
    /// task id -> worker id, slot create unacknowledged
    uncertain: BTreeMap<String, String>,
}

impl Assigner {
    pub fn new(identity: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            identity: identity.into(),
            retry,
            claimed: BTreeMap::new(),
            uncertain: BTreeMap::new(),
        }
    }

    pub fn claimed(&self) -> &BTreeMap<String, String> {
        &self.claimed
    }

    pub fn uncertain(&self) -> &BTreeMap<String, String> {
        &self.uncertain
    }

    /// Pending tasks: the listing minus claimed and unsettled ones, in order.
    pub fn unclaimed<'a>(&'a self, listing: &'a BTreeSet<String>) -> impl Iterator<Item = &'a String> {
        listing
            .iter()
            .filter(move |id| !self.claimed.contains_key(*id) && !self.uncertain.contains_key(*id))
    }

    /// Adopt an assignment found in a slot (manager takeover).
    pub fn adopt(&mut self, worker_id: &str, assignment: &Assignment) {
        self.claimed
            .insert(assignment.task_id.clone(), worker_id.to_string());
    }

    /// The task's worker is done with it.
    pub fn release(&mut self, task_id: &str) {
        self.claimed.remove(task_id);
    }

    /// One serialized pass over every pending task.
    pub async fn dispatch_pending(
        &mut self,
        ns: &dyn Namespace,
        layout: &Layout,
        listing: &BTreeSet<String>,
        registry: &mut WorkerRegistry,
    ) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        self.settle_uncertain(ns, layout, registry).await?;

        // Claimed but still listed: the pending-entry delete has not landed yet.
        let lingering: Vec<String> = listing
            .iter()
            .filter(|id| self.claimed.contains_key(*id))
            .cloned()
            .collect();
        for task_id in lingering {
            let path = layout.task(&task_id);
            ignore_missing(with_retry(&self.retry, "delete_pending", || ns.delete(&path)).await)?;
        }

        let pending: Vec<String> = self.unclaimed(listing).cloned().collect();
        let idle: Vec<String> = registry
            .idle_workers()
            .into_iter()
            .filter(|id| !self.uncertain.values().any(|held| held == id))
            .collect();
        let mut next = 0;

        'tasks: for (index, task_id) in pending.iter().enumerate() {
            loop {
                let Some(worker_id) = idle.get(next) else {
                    report.stalled.extend(pending[index..].iter().cloned());
                    break 'tasks;
                };
                match self.hand_off(ns, layout, task_id, worker_id).await? {
                    HandOff::Assigned(assignment) => {
                        tracing::info!(task_id = %task_id, worker_id = %worker_id, "Task assigned");
                        registry.mark_assigned(worker_id, assignment);
                        self.claimed.insert(task_id.clone(), worker_id.clone());
                        report.assigned.push((task_id.clone(), worker_id.clone()));
                        next += 1;
                        continue 'tasks;
                    }
                    HandOff::SlotOccupied | HandOff::WorkerGone => {
                        registry.mark_unavailable(worker_id);
                        next += 1;
                    }
                    HandOff::Uncertain => {
                        tracing::warn!(
                            task_id = %task_id,
                            worker_id = %worker_id,
                            "Hand-off unacknowledged, holding task and worker until the slot is read back"
                        );
                        self.uncertain.insert(task_id.clone(), worker_id.clone());
                        next += 1;
                        continue 'tasks;
                    }
                    HandOff::TaskGone => {
                        // The worker was not used; offer it to the next task.
                        tracing::debug!(task_id = %task_id, "Pending task vanished before hand-off");
                        continue 'tasks;
                    }
                }
            }
        }

        if !report.stalled.is_empty() {
            tracing::info!(
                pending = report.stalled.len(),
                "No idle worker available, tasks stay pending"
            );
        }
        Ok(report)
    }

    /// Read back the slot of every unacknowledged hand-off. A slot holding the
    /// task becomes a claim; anything else releases the pair. Pairs whose
    /// slot cannot be read stay held.
    async fn settle_uncertain(
        &mut self,
        ns: &dyn Namespace,
        layout: &Layout,
        registry: &mut WorkerRegistry,
    ) -> Result<()> {
        let held: Vec<(String, String)> = self
            .uncertain
            .iter()
            .map(|(task, worker)| (task.clone(), worker.clone()))
            .collect();
        for (task_id, worker_id) in held {
            let slot = match with_retry(&self.retry, "read_slot", || read_slot(ns, layout, &worker_id)).await {
                Ok(slot) => slot,
                Err(e) if e.is_session_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(task_id = %task_id, worker_id = %worker_id, error = %e, "Hand-off still unsettled");
                    continue;
                }
            };
            self.uncertain.remove(&task_id);
            // A dead worker's slot is recovered as an orphan instead.
            let alive = registry
                .get(&worker_id)
                .map_or(false, |w| w.state != Some(WorkerState::Dead));
            match slot {
                Some(assignment) if alive && assignment.task_id == task_id => {
                    tracing::info!(task_id = %task_id, worker_id = %worker_id, "Unacknowledged hand-off had landed");
                    registry.mark_assigned(&worker_id, assignment);
                    self.claimed.insert(task_id, worker_id);
                }
                _ => {
                    // Not ours. A worker that already finished the task cleared
                    // its slot after writing the result, which the next
                    // hand-off attempt checks first.
                    tracing::info!(task_id = %task_id, worker_id = %worker_id, "Unacknowledged hand-off did not land");
                }
            }
        }
        Ok(())
    }

    /// Write `task_id` into `worker_id`'s slot and retire its pending entry.
    pub async fn hand_off(
        &self,
        ns: &dyn Namespace,
        layout: &Layout,
        task_id: &str,
        worker_id: &str,
    ) -> Result<HandOff> {
        let task = match with_retry(&self.retry, "read_task", || fetch_task(ns, layout, task_id)).await? {
            Some(task) => task,
            None => return Ok(HandOff::TaskGone),
        };

        let pending = layout.task(task_id);
        let result_path = layout.result(task_id);
        if with_retry(&self.retry, "check_result", || ns.exists(&result_path, false)).await? {
            // Released by its worker while the pending entry's delete was still outstanding.
            ignore_missing(with_retry(&self.retry, "delete_pending", || ns.delete(&pending)).await)?;
            return Ok(HandOff::TaskGone);
        }

        let assignment = Assignment::new(task_id, task.payload, self.identity.as_str());
        let encoded = assignment.encode()?;
        let slot = layout.worker_slot(worker_id);

        match with_retry(&self.retry, "create_slot", || {
            ns.create(&slot, &encoded, CreateMode::Persistent)
        })
        .await
        {
            Ok(_) => {}
            Err(DistError::NodeExists(_)) => {
                // Either another task is there, or an earlier attempt of ours
                // landed before its acknowledgement was lost.
                match ns.get_data(&slot, false).await {
                    Ok(data) => match Assignment::decode(&data) {
                        Ok(existing) if existing.task_id == task_id => {}
                        _ => return Ok(HandOff::SlotOccupied),
                    },
                    Err(DistError::NoNode(_)) => return Ok(HandOff::SlotOccupied),
                    Err(e) if e.is_transient() => return Ok(HandOff::Uncertain),
                    Err(e) => return Err(e),
                }
            }
            Err(DistError::NoNode(_)) => return Ok(HandOff::WorkerGone),
            Err(e) if e.is_transient() => return Ok(HandOff::Uncertain),
            Err(e) => return Err(e),
        }

        if let Err(e) = ignore_missing(with_retry(&self.retry, "delete_pending", || ns.delete(&pending)).await) {
            // The claim stands; the delete is re-issued on the next pass.
            tracing::warn!(task_id, error = %e, "Could not retire pending entry");
        }
        Ok(HandOff::Assigned(assignment))
    }

    /// Put the task a dead worker held back into the pending directory and
    /// clear the worker's nodes. Returns the re-queued task id.
    pub async fn recover_orphan(
        &mut self,
        ns: &dyn Namespace,
        layout: &Layout,
        worker_id: &str,
        orphan: Option<Assignment>,
    ) -> Result<Option<String>> {
        let mut requeued = None;
        if let Some(assignment) = orphan {
            let result_path = layout.result(&assignment.task_id);
            let finished = with_retry(&self.retry, "check_result", || ns.exists(&result_path, false)).await?;
            if finished {
                tracing::info!(
                    task_id = %assignment.task_id,
                    worker_id,
                    "Lost worker had already finished its task"
                );
            } else {
                let path = layout.task(&assignment.task_id);
                ignore_exists(
                    with_retry(&self.retry, "requeue_task", || {
                        ns.create(&path, &assignment.payload, CreateMode::Persistent)
                    })
                    .await,
                )?;
                tracing::warn!(
                    task_id = %assignment.task_id,
                    worker_id,
                    "Re-queued task of lost worker"
                );
                requeued = Some(assignment.task_id.clone());
            }
            self.claimed.remove(&assignment.task_id);
        }
        self.clear_worker(ns, layout, worker_id).await?;
        Ok(requeued)
    }

    /// Remove a dead worker's slot and registration node.
    pub async fn clear_worker(&self, ns: &dyn Namespace, layout: &Layout, worker_id: &str) -> Result<()> {
        let slot = layout.worker_slot(worker_id);
        ignore_missing(with_retry(&self.retry, "delete_slot", || ns.delete(&slot)).await)?;
        let node = layout.worker(worker_id);
        match with_retry(&self.retry, "delete_worker", || ns.delete(&node)).await {
            Ok(()) | Err(DistError::NoNode(_)) => Ok(()),
            Err(DistError::NotEmpty(_)) => {
                tracing::warn!(worker_id, "Dead worker node still has children, leaving it");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
