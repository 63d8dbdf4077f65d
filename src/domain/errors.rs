//! Replication error taxonomy.

/// Errors surfaced by the replication core and its collaborators.
///
/// Cloneable so a single failure can be stored in node stats, fanned out
/// to quorum counters and still be returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("leader was switched: {0}")]
    LeaderChanged(String),

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("namespace invalidated: {0}")]
    NamespaceInvalidated(String),

    #[error("data hash mismatch: {0}")]
    DataHashMismatch(String),

    #[error("transaction state error: {0}")]
    TxState(String),

    #[error("replication quorum error: {0}")]
    ReplicationQuorum(String),

    /// Target namespace is still being copied by a transaction on the follower.
    #[error("namespace is being copied: {0}")]
    NamespaceCopying(String),

    #[error("replication is not allowed: {0}")]
    NotAllowed(String),

    #[error("updates lost: {0}")]
    UpdatesLost(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("logic error: {0}")]
    Logic(String),

    #[error("replication was terminated")]
    Terminated,
}

impl ReplError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_leader_changed(&self) -> bool {
        matches!(self, Self::LeaderChanged(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NamespaceNotFound(_))
    }

    pub fn is_ns_copying(&self) -> bool {
        matches!(self, Self::NamespaceCopying(_))
    }

    /// Whether the node routine may retry after a plain backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Timeout(_)
                | Self::LeaderChanged(_)
                | Self::NamespaceCopying(_)
                | Self::DataHashMismatch(_)
                | Self::TxState(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReplError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ReplError::Network("refused".into()).is_network());
        assert!(ReplError::Timeout("role switch".into()).is_timeout());
        assert!(ReplError::LeaderChanged("demoted".into()).is_leader_changed());
        assert!(ReplError::NamespaceNotFound("items".into()).is_not_found());
        assert!(ReplError::NamespaceCopying("items".into()).is_ns_copying());
        assert!(!ReplError::Terminated.is_network());
    }

    #[test]
    fn test_retryable() {
        assert!(ReplError::Network("x".into()).is_retryable());
        assert!(ReplError::TxState("x".into()).is_retryable());
        assert!(!ReplError::NotAllowed("x".into()).is_retryable());
        assert!(!ReplError::Terminated.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = ReplError::DataHashMismatch("items".into());
        assert_eq!(err.to_string(), "data hash mismatch: items");
    }
}
