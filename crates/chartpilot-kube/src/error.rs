//! Error types for chartpilot-kube

use chartpilot_core::CoreError;
use chartpilot_engine::EngineError;
use thiserror::Error;

/// Result type for chartpilot-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur during release actions
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("release '{name}' not found in namespace '{namespace}'")]
    ReleaseNotFound { name: String, namespace: String },

    /// A live record exists, or a concurrent creator won the storage race
    #[error("release '{name}' already exists in namespace '{namespace}'")]
    ReleaseAlreadyExists { name: String, namespace: String },

    /// Another action holds the release in a pending state that is not yet stale
    #[error("another operation is in progress for release '{name}': {status}")]
    OperationInProgress { name: String, status: String },

    /// A stale pending release could not be recovered
    #[error("release '{name}' is stuck in state '{status}' (started {elapsed} ago): {message}")]
    StuckRelease {
        name: String,
        status: String,
        elapsed: String,
        message: String,
    },

    #[error("cannot rollback release '{name}': {reason}")]
    RollbackNotPossible { name: String, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("release data too large ({size} bytes, max {max} bytes)")]
    ReleaseTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    /// Values could not be composed or failed schema validation
    #[error(transparent)]
    Values(#[from] CoreError),

    #[error(transparent)]
    Template(#[from] EngineError),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The cluster does not serve a kind the manifest uses
    #[error("unknown resource type {api_version}/{kind}")]
    UnknownKind { api_version: String, kind: String },

    #[error("failed to apply {}", join_failures(.failures))]
    ApplyFailed { failures: Vec<(String, String)> },

    #[error("failed to delete {}", join_failures(.failures))]
    DeleteFailed { failures: Vec<(String, String)> },
}

fn join_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{}: {}", name, err))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 404)
            || matches!(self, KubeError::ReleaseNotFound { .. })
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Errors retrying cannot fix without a change to the input
    pub fn is_permanent(&self) -> bool {
        match self {
            KubeError::Values(_) | KubeError::Template(_) | KubeError::InvalidManifest(_) => true,
            KubeError::Api(kube::Error::Api(resp)) => {
                (400..500).contains(&resp.code) && !matches!(resp.code, 404 | 409 | 429)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> KubeError {
        KubeError::Api(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_status_code_helpers() {
        assert!(api_error(404).is_not_found());
        assert!(api_error(409).is_conflict());
        assert!(!api_error(500).is_conflict());
        assert!(
            KubeError::ReleaseNotFound {
                name: "a".into(),
                namespace: "b".into()
            }
            .is_not_found()
        );
    }

    #[test]
    fn test_permanent_classification() {
        assert!(api_error(422).is_permanent());
        assert!(!api_error(409).is_permanent());
        assert!(!api_error(429).is_permanent());
        assert!(!api_error(503).is_permanent());
        assert!(KubeError::InvalidManifest("x".into()).is_permanent());
        assert!(!KubeError::Storage("x".into()).is_permanent());
    }

    #[test]
    fn test_apply_failed_message() {
        let err = KubeError::ApplyFailed {
            failures: vec![("default/ConfigMap/a".into(), "denied".into())],
        };
        assert_eq!(err.to_string(), "failed to apply default/ConfigMap/a: denied");
    }
}
