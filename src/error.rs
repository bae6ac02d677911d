use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistError {
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Connection to coordination service lost")]
    ConnectionLoss,

    #[error("Coordination operation timed out")]
    Timeout,

    #[error("Session expired")]
    SessionExpired,

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DistError {
    /// Errors that may succeed when the same single operation is re-issued.
    pub fn is_transient(&self) -> bool {
        matches!(self, DistError::ConnectionLoss | DistError::Timeout)
    }

    /// Errors that end the current role; the process must re-run election/registration.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, DistError::SessionExpired)
    }
}

pub type Result<T> = std::result::Result<T, DistError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DistError::ConnectionLoss.is_transient());
        assert!(DistError::Timeout.is_transient());
        assert!(!DistError::SessionExpired.is_transient());
        assert!(!DistError::NodeExists("/a".into()).is_transient());
    }

    #[test]
    fn session_fatal_classification() {
        assert!(DistError::SessionExpired.is_session_fatal());
        assert!(!DistError::ConnectionLoss.is_session_fatal());
    }
}
