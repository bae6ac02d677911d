use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}

/// A unit of work. The id is the name of the submission node; the payload is
/// opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub payload: Vec<u8>,
    pub status: TaskStatus,
}

impl Task {
    pub fn pending(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            payload,
            status: TaskStatus::Pending,
        }
    }
}

/// Contents of a worker's assignment slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: String,
    pub payload: Vec<u8>,
    /// Identity of the manager that made the hand-off
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(task_id: impl Into<String>, payload: Vec<u8>, assigned_by: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            payload,
            assigned_by: assigned_by.into(),
            assigned_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn into_task(self) -> Task {
        Task {
            id: self.task_id,
            payload: self.payload,
            status: TaskStatus::Assigned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStatus::Completed => write!(f, "completed"),
            ResultStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a worker writes once it is done with a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub worker_id: String,
    pub status: ResultStatus,
    pub output: Vec<u8>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn completed(task_id: &str, worker_id: &str, output: Vec<u8>) -> Self {
        Self {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            status: ResultStatus::Completed,
            output,
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(task_id: &str, worker_id: &str, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            status: ResultStatus::Failed,
            output: Vec::new(),
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_task() {
        let task = Task::pending("task-0000000001", b"echo hi".to_vec());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.status.to_string(), "pending");
    }

    #[test]
    fn assignment_keeps_task_id_with_payload() {
        let assignment = Assignment::new("t1", vec![0, 159, 146, 150], "mgr");
        let decoded = Assignment::decode(&assignment.encode().unwrap()).unwrap();
        assert_eq!(decoded, assignment);

        let task = decoded.into_task();
        assert_eq!(task.id, "t1");
        assert_eq!(task.payload, vec![0, 159, 146, 150]);
        assert_eq!(task.status, TaskStatus::Assigned);
    }

    #[test]
    fn failed_result_carries_error() {
        let result = TaskResult::failed("t1", "worker-0000000000", "exit code 2");
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("exit code 2"));
        assert!(result.output.is_empty());
        let json = String::from_utf8(result.encode().unwrap()).unwrap();
        assert!(json.contains("\"status\":\"failed\""));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(Assignment::decode(b"not json").is_err());
    }
}
