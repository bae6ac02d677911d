//! Task submission and result lookup, for clients of the pool.

use std::time::Duration;

use crate::error::{DistError, Result};
use crate::namespace::layout::TASK_PREFIX;
use crate::namespace::{node_name, CreateMode, Layout, Namespace};
use crate::task::TaskResult;

/// Submit a payload under a generated, submission-ordered id.
pub async fn submit_task(ns: &dyn Namespace, layout: &Layout, payload: &[u8]) -> Result<String> {
    let path = ns
        .create(&layout.task(TASK_PREFIX), payload, CreateMode::PersistentSequential)
        .await?;
    let id = node_name(&path).to_string();
    tracing::info!(task_id = %id, bytes = payload.len(), "Task submitted");
    Ok(id)
}

/// Submit a payload under a caller-chosen id. Fails with `NodeExists` if the
/// id is still pending or already has a result: the manager retires pending
/// entries of finished tasks instead of running them again.
pub async fn submit_named(ns: &dyn Namespace, layout: &Layout, id: &str, payload: &[u8]) -> Result<String> {
    let result = layout.result(id);
    if ns.exists(&result, false).await? {
        return Err(DistError::NodeExists(result));
    }
    ns.create(&layout.task(id), payload, CreateMode::Persistent)
        .await?;
    tracing::info!(task_id = %id, bytes = payload.len(), "Task submitted");
    Ok(id.to_string())
}

/// The result of a task, once a worker has written one.
pub async fn read_result(ns: &dyn Namespace, layout: &Layout, id: &str) -> Result<Option<TaskResult>> {
    match ns.get_data(&layout.result(id), false).await {
        Ok(data) => Ok(Some(TaskResult::decode(&data)?)),
        Err(DistError::NoNode(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Poll until every id has a result, in the order given.
pub async fn wait_for_results(
    ns: &dyn Namespace,
    layout: &Layout,
    ids: &[String],
    poll: Duration,
    timeout: Duration,
) -> Result<Vec<TaskResult>> {
    let wait = async {
        let mut interval = tokio::time::interval(poll);
        loop {
            interval.tick().await;
            let mut results = Vec::with_capacity(ids.len());
            for id in ids {
                match read_result(ns, layout, id).await? {
                    Some(result) => results.push(result),
                    None => break,
                }
            }
            if results.len() == ids.len() {
                return Ok::<_, DistError>(results);
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| DistError::Timeout)?
}
