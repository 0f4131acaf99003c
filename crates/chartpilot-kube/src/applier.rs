//! Apply/delete capability used by release actions
//!
//! [`crate::resources::ResourceManager`] implements it against the cluster;
//! [`MockApplier`] keeps an in-memory view of "live" objects for tests.

use async_trait::async_trait;
use kube::api::DynamicObject;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::annotations::has_keep_policy;
use crate::error::Result;
use crate::manifest::{ObjectRef, sort_for_apply, sort_for_delete};

/// Options for one apply call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Delete and recreate objects whose update the API server rejects
    pub force: bool,
}

/// Summary of apply/delete operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationSummary {
    pub succeeded: Vec<String>,
    /// Failed objects with their error
    pub failed: Vec<(String, String)>,
    /// Skipped objects with the reason (keep policy, already gone)
    pub skipped: Vec<(String, String)>,
}

impl OperationSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    /// Human-readable counts, e.g. `2 succeeded, 1 skipped`
    pub fn summary(&self) -> String {
        let parts: Vec<String> = [
            (self.succeeded.len(), "succeeded"),
            (self.failed.len(), "failed"),
            (self.skipped.len(), "skipped"),
        ]
        .into_iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, what)| format!("{} {}", n, what))
        .collect();

        if parts.is_empty() {
            "no resources processed".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[async_trait]
pub trait ResourceApplier: Send + Sync {
    /// Server-side apply `objects`, dependencies first. Objects without a
    /// namespace land in `namespace` when the kind is namespaced.
    async fn apply(
        &self,
        namespace: &str,
        objects: &[DynamicObject],
        options: &ApplyOptions,
    ) -> Result<OperationSummary>;

    /// Delete `objects` in reverse dependency order, skipping kept and
    /// missing ones
    async fn delete(&self, namespace: &str, objects: &[DynamicObject]) -> Result<OperationSummary>;
}

/// One call recorded by [`MockApplier`]
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedCall {
    Apply { namespace: String, objects: Vec<ObjectRef>, force: bool },
    Delete { namespace: String, objects: Vec<ObjectRef> },
}

#[derive(Default)]
struct MockState {
    live: BTreeMap<ObjectRef, DynamicObject>,
    calls: Vec<AppliedCall>,
    failing_kinds: BTreeSet<String>,
}

/// In-memory applier
#[derive(Clone, Default)]
pub struct MockApplier {
    state: Arc<Mutex<MockState>>,
    delay: Option<Duration>,
}

fn with_namespace(obj: &DynamicObject, namespace: &str) -> Option<ObjectRef> {
    let mut r = ObjectRef::from_object(obj).ok()?;
    if r.namespace.is_none() {
        r.namespace = Some(namespace.to_string());
    }
    Some(r)
}

impl MockApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps first, to widen race windows in tests
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every object of `kind` fail until cleared
    pub fn fail_kind(&self, kind: impl Into<String>) {
        self.state().failing_kinds.insert(kind.into());
    }

    pub fn clear_failures(&self) {
        self.state().failing_kinds.clear();
    }

    pub fn calls(&self) -> Vec<AppliedCall> {
        self.state().calls.clone()
    }

    pub fn live_objects(&self) -> Vec<ObjectRef> {
        self.state().live.keys().cloned().collect()
    }

    pub fn live_object(&self, namespace: &str, kind: &str, name: &str) -> Option<DynamicObject> {
        self.state()
            .live
            .iter()
            .find(|(r, _)| r.namespace.as_deref() == Some(namespace) && r.kind == kind && r.name == name)
            .map(|(_, obj)| obj.clone())
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ResourceApplier for MockApplier {
    async fn apply(
        &self,
        namespace: &str,
        objects: &[DynamicObject],
        options: &ApplyOptions,
    ) -> Result<OperationSummary> {
        self.pause().await;

        let mut sorted = objects.to_vec();
        sort_for_apply(&mut sorted);

        let mut state = self.state();
        let mut summary = OperationSummary::default();
        let mut refs = Vec::with_capacity(sorted.len());

        for obj in sorted {
            let Some(r) = with_namespace(&obj, namespace) else {
                summary.failed.push(("unnamed".to_string(), "invalid object".to_string()));
                continue;
            };
            refs.push(r.clone());

            if state.failing_kinds.contains(&r.kind) {
                summary.failed.push((r.to_string(), "injected failure".to_string()));
                continue;
            }
            summary.succeeded.push(r.to_string());
            state.live.insert(r, obj);
        }

        state.calls.push(AppliedCall::Apply {
            namespace: namespace.to_string(),
            objects: refs,
            force: options.force,
        });
        Ok(summary)
    }

    async fn delete(&self, namespace: &str, objects: &[DynamicObject]) -> Result<OperationSummary> {
        self.pause().await;

        let mut sorted = objects.to_vec();
        sort_for_delete(&mut sorted);

        let mut state = self.state();
        let mut summary = OperationSummary::default();
        let mut refs = Vec::with_capacity(sorted.len());

        for obj in sorted {
            let Some(r) = with_namespace(&obj, namespace) else {
                continue;
            };
            refs.push(r.clone());

            let annotations = obj.metadata.annotations.clone().unwrap_or_default();
            if has_keep_policy(&annotations) {
                summary.skipped.push((r.to_string(), "resource-policy: keep".to_string()));
            } else if state.failing_kinds.contains(&r.kind) {
                summary.failed.push((r.to_string(), "injected failure".to_string()));
            } else if state.live.remove(&r).is_some() {
                summary.succeeded.push(r.to_string());
            } else {
                summary.skipped.push((r.to_string(), "not found".to_string()));
            }
        }

        state.calls.push(AppliedCall::Delete {
            namespace: namespace.to_string(),
            objects: refs,
        });
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_objects;

    const MANIFEST: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
  annotations:
    helm.sh/resource-policy: keep
"#;

    #[test]
    fn test_summary_text() {
        let mut summary = OperationSummary::default();
        assert_eq!(summary.summary(), "no resources processed");
        summary.succeeded.push("a".into());
        summary.skipped.push(("b".into(), "keep".into()));
        assert_eq!(summary.summary(), "1 succeeded, 1 skipped");
        assert_eq!(summary.total(), 2);
        assert!(summary.is_success());
    }

    #[tokio::test]
    async fn test_mock_apply_orders_and_tracks() {
        let applier = MockApplier::new();
        let objects = parse_objects(MANIFEST).unwrap();

        let summary = applier.apply("ns", &objects, &ApplyOptions::default()).await.unwrap();
        assert_eq!(summary.succeeded, vec!["ns/ConfigMap/cfg", "ns/Deployment/web"]);
        assert!(applier.live_object("ns", "Deployment", "web").is_some());
    }

    #[tokio::test]
    async fn test_mock_delete_honours_keep() {
        let applier = MockApplier::new();
        let objects = parse_objects(MANIFEST).unwrap();
        applier.apply("ns", &objects, &ApplyOptions::default()).await.unwrap();

        let summary = applier.delete("ns", &objects).await.unwrap();
        assert_eq!(summary.succeeded, vec!["ns/Deployment/web"]);
        assert_eq!(summary.skipped[0].1, "resource-policy: keep");
        assert_eq!(applier.live_objects().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_injected_failure() {
        let applier = MockApplier::new();
        applier.fail_kind("Deployment");
        let objects = parse_objects(MANIFEST).unwrap();

        let summary = applier.apply("ns", &objects, &ApplyOptions { force: true }).await.unwrap();
        assert!(!summary.is_success());
        assert_eq!(summary.failed[0].0, "ns/Deployment/web");
        assert!(matches!(applier.calls()[0], AppliedCall::Apply { force: true, .. }));
    }
}
