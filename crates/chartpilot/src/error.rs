//! Operator errors and their retry classification

use std::path::PathBuf;

use chartpilot_core::CoreError;
use chartpilot_kube::KubeError;
use miette::Diagnostic;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the dispatcher treats a failed reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, API or storage trouble: retried with exponential backoff
    Transient,
    /// Optimistic write lost a race: retried immediately a few times, then transient
    Conflict,
    /// Needs a change to the resource or chart: surfaced on status, not retried
    Permanent,
    /// Aborts startup
    Fatal,
}

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(code(chartpilot::release))]
    Release(#[from] KubeError),

    #[error("Kubernetes API error: {0}")]
    #[diagnostic(code(chartpilot::api))]
    Api(#[from] kube::Error),

    /// Values could not be composed or failed validation
    #[error("invalid values: {0}")]
    #[diagnostic(code(chartpilot::values))]
    Values(#[from] CoreError),

    #[error("release '{release}' in namespace '{namespace}' belongs to {owner}")]
    #[diagnostic(
        code(chartpilot::collision),
        help("rename the custom resource or uninstall the existing release")
    )]
    ReleaseNameCollision {
        release: String,
        namespace: String,
        owner: String,
    },

    #[error("invalid resource: {0}")]
    #[diagnostic(code(chartpilot::resource))]
    InvalidResource(String),

    /// Uninstall of a deleted resource failed; retried until it succeeds
    #[error("uninstall failed: {0}")]
    #[diagnostic(code(chartpilot::uninstall))]
    UninstallFailed(#[source] Box<Error>),

    #[error("reconcile task panicked: {0}")]
    #[diagnostic(code(chartpilot::panic))]
    Panicked(String),

    #[error("failed to load watches file {}", path.display())]
    #[diagnostic(code(chartpilot::watches), help("check the watches file syntax and chart paths"))]
    WatchesFile {
        path: PathBuf,
        #[source]
        source: CoreError,
    },

    #[error("failed to load chart {}", path.display())]
    #[diagnostic(code(chartpilot::chart))]
    ChartLoad {
        path: PathBuf,
        #[source]
        source: CoreError,
    },

    #[error("cannot connect to the cluster")]
    #[diagnostic(code(chartpilot::client), help("check KUBECONFIG or the in-cluster service account"))]
    Client(#[source] kube::Error),

    #[error("invalid configuration: {0}")]
    #[diagnostic(code(chartpilot::config))]
    Config(String),
}

fn api_class(code: u16) -> ErrorClass {
    match code {
        409 => ErrorClass::Conflict,
        404 | 429 => ErrorClass::Transient,
        400..=499 => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    }
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            // a lost create race is left to the periodic reconcile
            Error::Release(KubeError::ReleaseAlreadyExists { .. }) => ErrorClass::Permanent,
            Error::Release(e) if e.is_conflict() => ErrorClass::Conflict,
            Error::Release(e) if e.is_permanent() => ErrorClass::Permanent,
            Error::Release(_) => ErrorClass::Transient,
            Error::Api(kube::Error::Api(resp)) => api_class(resp.code),
            Error::Api(_) => ErrorClass::Transient,
            Error::Values(_) | Error::ReleaseNameCollision { .. } | Error::InvalidResource(_) => {
                ErrorClass::Permanent
            }
            Error::UninstallFailed(_) | Error::Panicked(_) => ErrorClass::Transient,
            Error::WatchesFile { .. }
            | Error::ChartLoad { .. }
            | Error::Client(_)
            | Error::Config(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }

    /// Short machine-readable reason for status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Values(_) => "InvalidValues",
            Error::ReleaseNameCollision { .. } => "ReleaseNameCollision",
            Error::InvalidResource(_) => "InvalidResource",
            Error::Release(KubeError::Template(_)) => "TemplateError",
            Error::Release(KubeError::Values(_)) => "InvalidValues",
            Error::Release(KubeError::InvalidManifest(_)) => "InvalidManifest",
            Error::Release(KubeError::StuckRelease { .. }) => "StuckRelease",
            Error::Release(KubeError::ReleaseAlreadyExists { .. }) => "ReleaseAlreadyExists",
            Error::Release(KubeError::ApplyFailed { .. }) => "ApplyFailed",
            _ => "ReconcileError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_api_classes() {
        assert_eq!(Error::Api(api(409)).class(), ErrorClass::Conflict);
        assert_eq!(Error::Api(api(500)).class(), ErrorClass::Transient);
        assert_eq!(Error::Api(api(429)).class(), ErrorClass::Transient);
        assert_eq!(Error::Api(api(403)).class(), ErrorClass::Permanent);
        assert_eq!(Error::Release(KubeError::Api(api(409))).class(), ErrorClass::Conflict);
    }

    #[test]
    fn test_release_classes() {
        let stuck = KubeError::StuckRelease {
            name: "a".into(),
            status: "pending-install".into(),
            elapsed: "600s".into(),
            message: "boom".into(),
        };
        assert_eq!(Error::Release(stuck).class(), ErrorClass::Transient);
        assert_eq!(
            Error::Release(KubeError::InvalidManifest("x".into())).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_uninstall_failures_always_retry() {
        let inner = Error::Api(api(403));
        assert_eq!(inner.class(), ErrorClass::Permanent);
        assert_eq!(Error::UninstallFailed(Box::new(inner)).class(), ErrorClass::Transient);
    }

    #[test]
    fn test_collision_is_permanent() {
        let err = Error::ReleaseNameCollision {
            release: "app".into(),
            namespace: "ns".into(),
            owner: "TestApp.example.com ns/other".into(),
        };
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(err.reason(), "ReleaseNameCollision");
    }

    #[test]
    fn test_existing_release_is_not_retried() {
        let err = Error::Release(KubeError::ReleaseAlreadyExists {
            name: "app".into(),
            namespace: "ns".into(),
        });
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert!(!err.is_conflict());
        assert_eq!(err.reason(), "ReleaseAlreadyExists");
    }

    #[test]
    fn test_startup_errors_are_fatal() {
        assert_eq!(Error::Config("x".into()).class(), ErrorClass::Fatal);
    }
}
