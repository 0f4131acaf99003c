//! Status conditions written onto custom resources
//!
//! Every reconcile attempt ends with a [`Report`]. The reporter folds it into
//! the resource's current status and writes the result to the status
//! subresource, skipping the write when nothing changed. Reporting is
//! best-effort: a failed write is logged and never fails the reconcile.

use std::sync::Arc;

use chartpilot_kube::StoredRelease;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, Span, debug, warn};

use crate::client::ResourceClient;
use crate::resource::CustomResource;

pub mod condition_types {
    pub const INITIALIZED: &str = "Initialized";
    pub const DEPLOYED: &str = "Deployed";
    pub const RELEASE_FAILED: &str = "ReleaseFailed";
    pub const IRRECONCILABLE: &str = "Irreconcilable";
}

pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

/// Standard Kubernetes condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// The release currently deployed for a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedRelease {
    pub name: String,
    pub version: u32,
    pub chart_version: String,
    pub values_digest: String,
}

impl DeployedRelease {
    pub fn from_release(release: &StoredRelease) -> Self {
        Self {
            name: release.name.clone(),
            version: release.version,
            chart_version: release.chart.version.to_string(),
            values_digest: release.values_digest.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_release: Option<DeployedRelease>,
}

impl ReleaseStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == condition_status::TRUE)
    }

    /// Already reports `release` as healthy for this generation
    fn settled_on(&self, release: &DeployedRelease, generation: Option<i64>) -> bool {
        self.deployed_release.as_ref() == Some(release)
            && self.is_true(condition_types::DEPLOYED)
            && !self.is_true(condition_types::RELEASE_FAILED)
            && !self.is_true(condition_types::IRRECONCILABLE)
            && self.conditions.iter().all(|c| c.observed_generation == generation)
    }
}

/// Sets conditions, moving `lastTransitionTime` only when a status flips
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self::from_existing(Vec::new(), generation)
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    pub fn set_condition(mut self, type_: &str, status: bool, reason: &str, message: &str) -> Self {
        let status = if status {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Outcome of one reconcile attempt
#[derive(Debug, Clone)]
pub enum Report {
    Deployed {
        reason: &'static str,
        message: String,
        release: DeployedRelease,
    },
    /// Nothing to do; the last action's conditions stand
    UpToDate { release: DeployedRelease },
    Failed {
        reason: &'static str,
        message: String,
        /// Needs a change to the resource before it can succeed
        irreconcilable: bool,
    },
}

impl Report {
    /// Fold this report into the current status
    pub fn apply(&self, current: Option<ReleaseStatus>, generation: Option<i64>) -> ReleaseStatus {
        let current = current.unwrap_or_default();
        if let Report::UpToDate { release } = self
            && current.settled_on(release, generation)
        {
            return current;
        }

        let builder = ConditionBuilder::from_existing(current.conditions, generation).set_condition(
            condition_types::INITIALIZED,
            true,
            "Initialized",
            "",
        );

        match self {
            Report::Deployed {
                reason,
                message,
                release,
            } => deployed_status(builder, reason, message, release),
            Report::UpToDate { release } => {
                let message = format!("release {} at revision {}", release.name, release.version);
                deployed_status(builder, "UpToDate", &message, release)
            }
            Report::Failed {
                reason,
                message,
                irreconcilable,
            } => {
                let mut builder = builder
                    .set_condition(condition_types::RELEASE_FAILED, !irreconcilable, reason, message)
                    .set_condition(condition_types::IRRECONCILABLE, *irreconcilable, reason, message);
                // The previous revision may still be running
                if current.deployed_release.is_none() {
                    builder = builder.set_condition(condition_types::DEPLOYED, false, reason, message);
                }
                ReleaseStatus {
                    conditions: builder.build(),
                    deployed_release: current.deployed_release,
                }
            }
        }
    }
}

fn deployed_status(
    builder: ConditionBuilder,
    reason: &str,
    message: &str,
    release: &DeployedRelease,
) -> ReleaseStatus {
    ReleaseStatus {
        conditions: builder
            .set_condition(condition_types::DEPLOYED, true, reason, message)
            .set_condition(condition_types::RELEASE_FAILED, false, reason, "")
            .set_condition(condition_types::IRRECONCILABLE, false, reason, "")
            .build(),
        deployed_release: Some(release.clone()),
    }
}

pub struct StatusReporter {
    client: Arc<dyn ResourceClient>,
    span: Span,
}

impl StatusReporter {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Write the outcome onto the resource; failures are only logged
    pub async fn report(&self, resource: &CustomResource, report: &Report) {
        let current = resource.status();
        let next = report.apply(current.clone(), resource.generation());
        if current.as_ref() == Some(&next) {
            debug!(parent: &self.span, resource = %resource.key(), "status unchanged");
            return;
        }

        let status = match serde_json::to_value(&next) {
            Ok(status) => status,
            Err(e) => {
                warn!(parent: &self.span, resource = %resource.key(), error = %e, "failed to encode status");
                return;
            }
        };

        let key = resource.key();
        if let Err(e) = self
            .client
            .patch_status(&key.namespace, &key.name, &status)
            .instrument(self.span.clone())
            .await
        {
            warn!(parent: &self.span, resource = %key, error = %e, "failed to update status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockResourceClient;
    use chartpilot_core::KindIdentifier;
    use kube::api::DynamicObject;
    use serde_json::json;

    fn deployed(version: u32) -> Report {
        Report::Deployed {
            reason: "InstallSuccessful",
            message: "release installed".to_string(),
            release: DeployedRelease {
                name: "app".to_string(),
                version,
                chart_version: "0.1.0".to_string(),
                values_digest: "d".repeat(64),
            },
        }
    }

    fn failed(irreconcilable: bool) -> Report {
        Report::Failed {
            reason: "TemplateError",
            message: "boom".to_string(),
            irreconcilable,
        }
    }

    #[test]
    fn test_deployed_conditions() {
        let status = deployed(1).apply(None, Some(1));
        assert!(status.is_true(condition_types::INITIALIZED));
        assert!(status.is_true(condition_types::DEPLOYED));
        assert!(!status.is_true(condition_types::RELEASE_FAILED));
        assert!(!status.is_true(condition_types::IRRECONCILABLE));
        assert_eq!(status.deployed_release.unwrap().version, 1);
    }

    #[test]
    fn test_transition_time_only_moves_on_flip() {
        let first = deployed(1).apply(None, Some(1));
        let mut aged = first.clone();
        for condition in &mut aged.conditions {
            condition.last_transition_time = "2020-01-01T00:00:00+00:00".to_string();
        }

        let second = deployed(2).apply(Some(aged.clone()), Some(2));
        let ts = |s: &ReleaseStatus, t| s.condition(t).unwrap().last_transition_time.clone();
        assert_eq!(ts(&second, condition_types::DEPLOYED), "2020-01-01T00:00:00+00:00");

        let third = failed(false).apply(Some(aged), Some(2));
        assert_ne!(ts(&third, condition_types::RELEASE_FAILED), "2020-01-01T00:00:00+00:00");
        assert_eq!(ts(&third, condition_types::DEPLOYED), "2020-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_failure_keeps_deployed_release() {
        let ok = deployed(1).apply(None, Some(1));
        let status = failed(false).apply(Some(ok), Some(2));
        assert!(status.is_true(condition_types::RELEASE_FAILED));
        assert!(status.is_true(condition_types::DEPLOYED));
        assert_eq!(status.deployed_release.unwrap().version, 1);
    }

    #[test]
    fn test_up_to_date_keeps_last_action() {
        let installed = deployed(1).apply(None, Some(1));
        let Report::Deployed { release, .. } = deployed(1) else {
            unreachable!()
        };

        let report = Report::UpToDate { release };
        assert_eq!(report.apply(Some(installed.clone()), Some(1)), installed);

        // a recovered failure is still rewritten
        let recovered = report.apply(Some(failed(false).apply(Some(installed), Some(1))), Some(1));
        assert!(!recovered.is_true(condition_types::RELEASE_FAILED));
        assert_eq!(recovered.condition(condition_types::DEPLOYED).unwrap().reason, "UpToDate");
    }

    #[test]
    fn test_irreconcilable_without_release() {
        let status = failed(true).apply(None, None);
        assert!(status.is_true(condition_types::IRRECONCILABLE));
        assert!(!status.is_true(condition_types::RELEASE_FAILED));
        assert!(!status.is_true(condition_types::DEPLOYED));
    }

    fn resource(client: &MockResourceClient) -> CustomResource {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "TestApp",
            "metadata": {"name": "app", "namespace": "ns"},
        }))
        .unwrap();
        client.insert(obj);
        let obj = client.object("ns", "app").unwrap();
        CustomResource::new(KindIdentifier::new("example.com", "v1", "TestApp"), obj).unwrap()
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_written() {
        let client = MockResourceClient::new();
        let reporter = StatusReporter::new(Arc::new(client.clone()));

        reporter.report(&resource(&client), &deployed(1)).await;
        assert_eq!(client.status_writes(), 1);

        let fresh = CustomResource::new(
            KindIdentifier::new("example.com", "v1", "TestApp"),
            client.object("ns", "app").unwrap(),
        )
        .unwrap();
        reporter.report(&fresh, &deployed(1)).await;
        assert_eq!(client.status_writes(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_swallowed() {
        let client = MockResourceClient::new();
        client.fail_status_writes(true);
        let reporter = StatusReporter::new(Arc::new(client.clone()));
        reporter.report(&resource(&client), &deployed(1)).await;
        assert_eq!(client.status_writes(), 0);
    }
}
