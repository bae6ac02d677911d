//! Leadership race.
//!
//! Exactly one session can hold the ephemeral leadership marker. Creating it
//! makes the process the manager; finding it already present makes the
//! process a worker. There is nothing to retry: the namespace decides the race
//! once per session, and losing the session releases the marker.

use crate::error::{DistError, Result};
use crate::namespace::{CreateMode, Layout, Namespace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Manager,
    Worker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Manager => write!(f, "manager"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// Try to claim the leadership marker, writing `identity` as its payload.
///
/// A conflict is the normal losing outcome, not an error. Any other failure is
/// returned: the caller reconnects and runs the whole election again.
pub async fn try_become_leader(ns: &dyn Namespace, layout: &Layout, identity: &str) -> Result<Role> {
    match ns
        .create(&layout.manager(), identity.as_bytes(), CreateMode::Ephemeral)
        .await
    {
        Ok(_) => {
            tracing::info!(identity, "Claimed leadership marker");
            Ok(Role::Manager)
        }
        Err(DistError::NodeExists(_)) => {
            tracing::debug!(identity, "Leadership marker already held");
            Ok(Role::Worker)
        }
        Err(e) => Err(e),
    }
}

/// Identity stored in the leadership marker, if one is held.
pub async fn current_leader(ns: &dyn Namespace, layout: &Layout) -> Result<Option<String>> {
    match ns.get_data(&layout.manager(), false).await {
        Ok(data) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
        Err(DistError::NoNode(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
