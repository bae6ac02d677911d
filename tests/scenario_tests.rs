//! End-to-end scheduling scenarios on an in-process pool.


use std::time::Duration;

use distpool::node::NodePhase;
use distpool::task::ResultStatus;
use test_harness::{echo_compute, wait_until, ExecutionLog, Gate, TestCluster};

/// Scenario A: a task waits for capacity, then goes to the first worker that registers
#[tokio::test]
async fn test_task_waits_for_first_worker() {
    let mut cluster = TestCluster::new(1, echo_compute()).await;
    assert_eq!(cluster.nodes[0].phase(), NodePhase::Manager);

    let t1 = cluster.submit_named("t1", "hello").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.pending().await, vec![t1.clone()], "t1 should stay pending");

    let w1 = cluster.start_node(echo_compute()).await;
    assert_eq!(cluster.nodes[w1].phase(), NodePhase::Worker);

    let results = cluster
        .wait_for_results(&[t1.clone()], Duration::from_secs(5))
        .await;
    assert_eq!(results[0].status, ResultStatus::Completed);
    assert_eq!(results[0].output, b"hello");
    assert_eq!(Some(results[0].worker_id.clone()), cluster.nodes[w1].worker_id());
    assert!(cluster.pending().await.is_empty());
}

/// Scenario B: a busy worker dies, its task returns to pending and goes to the next worker
#[tokio::test]
async fn test_task_of_dead_worker_is_reassigned() {
    let gate = Gate::new();
    let mut cluster = TestCluster::new(1, echo_compute()).await;
    let w1 = cluster.start_node(gate.compute()).await;
    let w1_id = cluster.nodes[w1].worker_id().unwrap();

    let t1 = cluster.submit_named("t1", "work").await;
    let busy = wait_until(Duration::from_secs(5), || async {
        cluster.occupied_slots().await == vec![w1_id.clone()]
    })
    .await;
    assert!(busy, "w1 should hold t1");
    assert!(cluster.pending().await.is_empty());

    assert!(cluster.crash_node(w1).await);
    let requeued = wait_until(Duration::from_secs(5), || async {
        cluster.pending().await == vec![t1.clone()]
    })
    .await;
    assert!(requeued, "t1 should return to pending after w1 died");
    assert!(cluster.result(&t1).await.is_none());

    let w2 = cluster.start_node(echo_compute()).await;
    let results = cluster
        .wait_for_results(&[t1.clone()], Duration::from_secs(5))
        .await;
    assert_eq!(Some(results[0].worker_id.clone()), cluster.nodes[w2].worker_id());
    assert_ne!(results[0].worker_id, w1_id);
}

/// Scenario C: two tasks, one idle worker; exactly one is assigned
#[tokio::test]
async fn test_one_worker_takes_one_task_at_a_time() {
    let gate = Gate::new();
    let mut cluster = TestCluster::new(1, echo_compute()).await;
    cluster.start_node(gate.compute()).await;

    let t1 = cluster.submit_named("t1", "a").await;
    let t2 = cluster.submit_named("t2", "b").await;

    let assigned = wait_until(Duration::from_secs(5), || async {
        cluster.occupied_slots().await.len() == 1
    })
    .await;
    assert!(assigned);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.occupied_slots().await.len(), 1);
    assert_eq!(cluster.pending().await.len(), 1, "the other task stays pending");

    // A second worker picks up the remaining task.
    cluster.start_node(gate.compute()).await;
    let both = wait_until(Duration::from_secs(5), || async {
        cluster.occupied_slots().await.len() == 2
    })
    .await;
    assert!(both);
    assert!(cluster.pending().await.is_empty());

    gate.open();
    let results = cluster
        .wait_for_results(&[t1, t2], Duration::from_secs(5))
        .await;
    assert_ne!(results[0].worker_id, results[1].worker_id);
}

/// Pending tasks are dispatched in id order regardless of submission order
#[tokio::test]
async fn test_dispatch_follows_id_order() {
    let mut cluster = TestCluster::new(1, echo_compute()).await;
    let ids = vec![
        cluster.submit_named("t3", "3").await,
        cluster.submit_named("t1", "1").await,
        cluster.submit_named("t2", "2").await,
    ];
    tokio::time::sleep(Duration::from_millis(50)).await;

    cluster.start_node(echo_compute()).await;
    let results = cluster.wait_for_results(&ids, Duration::from_secs(5)).await;

    let mut by_completion = results.clone();
    by_completion.sort_by_key(|r| r.completed_at);
    let order: Vec<&str> = by_completion.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(order, vec!["t1", "t2", "t3"]);
}

/// Every task runs exactly once when nobody fails
#[tokio::test]
async fn test_no_task_runs_twice() {
    let log = ExecutionLog::default();
    let mut cluster = TestCluster::new(1, log.compute()).await;
    for _ in 0..3 {
        cluster.start_node(log.compute()).await;
    }

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(cluster.submit(&format!("job-{}", i)).await);
    }
    let results = cluster.wait_for_results(&ids, Duration::from_secs(10)).await;
    assert_eq!(results.len(), 20);
    assert!(results.iter().all(|r| r.status == ResultStatus::Completed));

    let runs = log.runs();
    assert_eq!(runs.len(), 20);
    assert!(runs.values().all(|&n| n == 1), "runs: {:?}", runs);
    assert!(cluster.pending().await.is_empty());
}

/// Failed compute is reported as a failed result and the worker stays in the pool
#[tokio::test]
async fn test_failed_task_keeps_worker_assignable() {
    use distpool::task::Task;
    use distpool::worker::{ComputeError, FnCompute};
    use std::sync::Arc;

    let flaky: Arc<dyn distpool::worker::Compute> = Arc::new(FnCompute::new(|task: Task| async move {
        if task.payload == b"fail" {
            Err(ComputeError::Failed("boom".to_string()))
        } else {
            Ok(task.payload)
        }
    }));
    let mut cluster = TestCluster::new(1, echo_compute()).await;
    let w1 = cluster.start_node(flaky).await;

    let bad = cluster.submit_named("t1", "fail").await;
    let good = cluster.submit_named("t2", "ok").await;
    let results = cluster
        .wait_for_results(&[bad, good], Duration::from_secs(5))
        .await;

    assert_eq!(results[0].status, ResultStatus::Failed);
    assert_eq!(results[0].error.as_deref(), Some("boom"));
    assert_eq!(results[1].status, ResultStatus::Completed);
    assert_eq!(cluster.nodes[w1].phase(), NodePhase::Worker);
}
