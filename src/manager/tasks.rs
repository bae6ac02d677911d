use std::collections::BTreeSet;

use crate::error::{DistError, Result};
use crate::namespace::{Layout, Namespace};
use crate::task::Task;

/// Last full listing of the task submission directory.
///
/// Notifications only say that the directory changed, so every refresh
/// replaces the listing wholesale; the scheduler derives what is new.
#[derive(Debug, Default)]
pub struct TaskWatcher {
    listing: BTreeSet<String>,
}

impl TaskWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the listing, returning ids not present in the previous one.
    pub fn apply_listing(&mut self, ids: Vec<String>) -> Vec<String> {
        let listing: BTreeSet<String> = ids.into_iter().collect();
        let appeared = listing.difference(&self.listing).cloned().collect();
        self.listing = listing;
        appeared
    }

    /// Task ids in their total (lexicographic) order.
    pub fn listing(&self) -> &BTreeSet<String> {
        &self.listing
    }

    pub fn len(&self) -> usize {
        self.listing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listing.is_empty()
    }
}

/// List pending task ids and re-arm the child watch in the same read.
pub async fn list_tasks(ns: &dyn Namespace, layout: &Layout) -> Result<Vec<String>> {
    ns.get_children(&layout.tasks(), true).await
}

/// Read a pending task; `None` once it has been claimed or withdrawn.
pub async fn fetch_task(ns: &dyn Namespace, layout: &Layout, id: &str) -> Result<Option<Task>> {
    match ns.get_data(&layout.task(id), false).await {
        Ok(payload) => Ok(Some(Task::pending(id, payload))),
        Err(DistError::NoNode(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
