//! Custom resource identity and reconcile triggers

use std::fmt;

use chartpilot_core::KindIdentifier;
use chartpilot_kube::ReleaseOwner;

/// Identity of one watched custom resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: KindIdentifier,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: KindIdentifier, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Releases are named after the resource that declares them
    pub fn release_name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> ReleaseOwner {
        ReleaseOwner::new(&self.kind, &self.namespace, &self.name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.kind, self.namespace, self.name)
    }
}

/// Why a reconcile was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileReason {
    ResourceChanged,
    ResourceDeleted,
    DependentChanged,
    Periodic,
    Retry,
    Requeue,
}

impl ReconcileReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResourceChanged => "resource-changed",
            Self::ResourceDeleted => "resource-deleted",
            Self::DependentChanged => "dependent-changed",
            Self::Periodic => "periodic",
            Self::Retry => "retry",
            Self::Requeue => "requeue",
        }
    }
}

impl fmt::Display for ReconcileReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for one reconcile, consumed once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub key: ResourceKey,
    pub reason: ReconcileReason,
}
