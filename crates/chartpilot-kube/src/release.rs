//! Release records and their state machine

use chartpilot_core::{ChartMetadata, KindIdentifier, Values};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A pending state older than this is considered stuck
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::minutes(5);

/// Identity of the custom resource a release belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOwner {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ReleaseOwner {
    pub fn new(kind: &KindIdentifier, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Owner kind as written in the `owner-kind` annotation (`Kind.group`)
    pub fn qualified_kind(&self) -> String {
        match self.api_version.rsplit_once('/') {
            Some((group, _)) => format!("{}.{}", self.kind, group),
            None => self.kind.clone(),
        }
    }

    /// Same resource, regardless of the served version
    pub fn same_resource(&self, other: &ReleaseOwner) -> bool {
        self.qualified_kind() == other.qualified_kind()
            && self.namespace == other.namespace
            && self.name == other.name
    }
}

impl fmt::Display for ReleaseOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.qualified_kind(), self.namespace, self.name)
    }
}

/// One revision of a release, as persisted by a storage driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRelease {
    pub name: String,

    pub namespace: String,

    /// Revision number (1-indexed, increments with each upgrade or rollback)
    pub version: u32,

    pub state: ReleaseState,

    /// Chart metadata at deploy time
    pub chart: ChartMetadata,

    /// Composed values this revision was rendered with
    pub values: Values,

    /// Canonical digest of `values`
    pub values_digest: String,

    /// Custom resource that owns the release
    #[serde(default)]
    pub owner: Option<ReleaseOwner>,

    /// Rendered manifest, ownership metadata included
    pub manifest: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl StoredRelease {
    /// First revision of a release, in `pending-install`
    pub fn for_install(
        name: impl Into<String>,
        namespace: impl Into<String>,
        version: u32,
        chart: ChartMetadata,
        values: Values,
        values_digest: String,
        manifest: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            namespace: namespace.into(),
            version,
            state: ReleaseState::PendingInstall {
                started_at: now,
                timeout: DEFAULT_OPERATION_TIMEOUT,
            },
            chart,
            values,
            values_digest,
            owner: None,
            manifest,
            description: None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Next revision after `previous`, in `pending-upgrade`
    pub fn for_upgrade(
        previous: &StoredRelease,
        chart: ChartMetadata,
        values: Values,
        values_digest: String,
        manifest: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: previous.name.clone(),
            namespace: previous.namespace.clone(),
            version: previous.version + 1,
            state: ReleaseState::PendingUpgrade {
                started_at: now,
                timeout: DEFAULT_OPERATION_TIMEOUT,
                previous_version: previous.version,
            },
            chart,
            values,
            values_digest,
            owner: previous.owner.clone(),
            manifest,
            description: None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Next revision after `current`, re-deploying `target`
    pub fn for_rollback(current: &StoredRelease, target: &StoredRelease) -> Self {
        let now = Utc::now();
        Self {
            name: current.name.clone(),
            namespace: current.namespace.clone(),
            version: current.version + 1,
            state: ReleaseState::PendingRollback {
                started_at: now,
                timeout: DEFAULT_OPERATION_TIMEOUT,
                target_version: target.version,
            },
            chart: target.chart.clone(),
            values: target.values.clone(),
            values_digest: target.values_digest.clone(),
            owner: current.owner.clone(),
            manifest: target.manifest.clone(),
            description: Some(format!("Rollback to {}", target.version)),
            notes: target.notes.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_owner(mut self, owner: ReleaseOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Name of the Secret holding this revision
    pub fn storage_key(&self) -> String {
        storage_key(&self.name, self.version)
    }

    pub fn mark_deployed(&mut self) {
        self.set_state(ReleaseState::Deployed);
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.set_state(ReleaseState::Failed {
            reason: reason.into(),
            failed_at: Utc::now(),
        });
    }

    pub fn mark_superseded(&mut self) {
        self.set_state(ReleaseState::Superseded);
    }

    pub fn mark_uninstalled(&mut self) {
        self.set_state(ReleaseState::Uninstalled);
    }

    pub fn mark_pending_uninstall(&mut self) {
        self.set_state(ReleaseState::PendingUninstall {
            started_at: Utc::now(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        });
    }

    fn set_state(&mut self, state: ReleaseState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

pub fn storage_key(name: &str, version: u32) -> String {
    format!("chartpilot.release.v1.{}.v{}", name, version)
}

/// Release state with timing information for pending operations
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ReleaseState {
    #[default]
    Deployed,

    Failed {
        reason: String,
        failed_at: DateTime<Utc>,
    },

    Uninstalled,

    /// Replaced by a newer revision
    Superseded,

    PendingInstall {
        started_at: DateTime<Utc>,
        #[serde(with = "duration_serde")]
        timeout: Duration,
    },

    PendingUpgrade {
        started_at: DateTime<Utc>,
        #[serde(with = "duration_serde")]
        timeout: Duration,
        previous_version: u32,
    },

    PendingRollback {
        started_at: DateTime<Utc>,
        #[serde(with = "duration_serde")]
        timeout: Duration,
        target_version: u32,
    },

    PendingUninstall {
        started_at: DateTime<Utc>,
        #[serde(with = "duration_serde")]
        timeout: Duration,
    },
}

impl ReleaseState {
    pub fn is_pending(&self) -> bool {
        self.pending_since().is_some()
    }

    fn pending_since(&self) -> Option<(DateTime<Utc>, Duration)> {
        match self {
            Self::PendingInstall { started_at, timeout }
            | Self::PendingUpgrade { started_at, timeout, .. }
            | Self::PendingRollback { started_at, timeout, .. }
            | Self::PendingUninstall { started_at, timeout } => Some((*started_at, *timeout)),
            _ => None,
        }
    }

    /// A pending state whose timeout has elapsed
    pub fn is_stale(&self) -> bool {
        self.pending_since()
            .is_some_and(|(started_at, timeout)| Utc::now().signed_duration_since(started_at) > timeout)
    }

    /// Time since a pending operation started
    pub fn elapsed(&self) -> Option<Duration> {
        self.pending_since()
            .map(|(started_at, _)| Utc::now().signed_duration_since(started_at))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// States a rollback may target
    pub fn was_deployed(&self) -> bool {
        matches!(self, Self::Deployed | Self::Superseded)
    }

    pub fn status_name(&self) -> &'static str {
        match self {
            Self::Deployed => "deployed",
            Self::Failed { .. } => "failed",
            Self::Uninstalled => "uninstalled",
            Self::Superseded => "superseded",
            Self::PendingInstall { .. } => "pending-install",
            Self::PendingUpgrade { .. } => "pending-upgrade",
            Self::PendingRollback { .. } => "pending-rollback",
            Self::PendingUninstall { .. } => "pending-uninstall",
        }
    }
}

impl fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason, .. } => write!(f, "failed: {}", reason),
            other => write!(f, "{}", other.status_name()),
        }
    }
}

/// chrono::Duration as whole seconds
mod duration_serde {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.num_seconds().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        i64::deserialize(deserializer).map(Duration::seconds)
    }
}
