use std::time::Duration;

use distpool::task::Task;
use distpool::worker::{Compute, ComputeError, ShellCompute};

/// Wrap a shell command as a task payload
fn task(command: &str) -> Task {
    Task::pending("t1", command.as_bytes().to_vec())
}

#[tokio::test]
async fn test_execute_simple_command() {
    let compute = ShellCompute::new();

    let output = compute.compute(&task("echo hello")).await.unwrap();

    assert_eq!(output, b"hello\n");
}

#[tokio::test]
async fn test_execute_empty_output() {
    let compute = ShellCompute::new();

    // Command that produces no output
    let output = compute.compute(&task("true")).await.unwrap();

    assert!(output.is_empty());
}

#[tokio::test]
async fn test_execute_large_output() {
    let compute = ShellCompute::new();

    // Generate large output (1000 lines)
    let output = compute.compute(&task("seq 1 1000")).await.unwrap();

    let line_count = String::from_utf8_lossy(&output).lines().count();
    assert_eq!(line_count, 1000);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let compute = ShellCompute::new();

    // Command that exits with non-zero status
    let err = compute.compute(&task("exit 1")).await.unwrap_err();

    assert_eq!(err, ComputeError::Failed("Exit code: Some(1)".to_string()));
}

#[tokio::test]
async fn test_execute_command_with_stderr() {
    let compute = ShellCompute::new();

    // Command that writes to stderr and fails
    let err = compute
        .compute(&task("echo 'error message' >&2 && exit 1"))
        .await
        .unwrap_err();

    match err {
        ComputeError::Failed(reason) => assert!(reason.contains("error message")),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_execute_invalid_command() {
    let compute = ShellCompute::new();

    // The shell starts fine; only the command is missing
    let err = compute
        .compute(&task("nonexistent_command_12345"))
        .await
        .unwrap_err();

    assert!(matches!(err, ComputeError::Failed(_)));
}

#[tokio::test]
async fn test_execute_with_special_characters() {
    let compute = ShellCompute::new();

    let output = compute.compute(&task("echo 'hello $USER'")).await.unwrap();

    // Single quotes prevent variable expansion
    assert_eq!(output, b"hello $USER\n");
}

#[tokio::test]
async fn test_execute_piped_commands() {
    let compute = ShellCompute::new();

    let output = compute
        .compute(&task("echo 'hello world' | wc -w"))
        .await
        .unwrap();

    // Output should be "2" (word count)
    assert_eq!(String::from_utf8_lossy(&output).trim(), "2");
}

#[tokio::test]
async fn test_execute_timeout() {
    let compute = ShellCompute::new().with_timeout(Duration::from_millis(100));

    let err = compute.compute(&task("sleep 5")).await.unwrap_err();

    match err {
        ComputeError::Failed(reason) => assert!(reason.starts_with("Timed out")),
        other => panic!("unexpected error {:?}", other),
    }
}
