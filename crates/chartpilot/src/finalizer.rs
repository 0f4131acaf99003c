//! Deletion gate on custom resources with a deployed release

use std::sync::Arc;

use kube::api::DynamicObject;
use tracing::{debug, info};

use crate::client::ResourceClient;
use crate::error::Result;
use crate::identity::ResourceKey;

pub const FINALIZER: &str = "chartpilot.io/uninstall-release";

/// Immediate attempts at a finalizer write before a conflict is returned
const CONFLICT_ATTEMPTS: usize = 3;

pub struct FinalizerGuard {
    client: Arc<dyn ResourceClient>,
}

impl FinalizerGuard {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self { client }
    }

    /// Make sure the finalizer is present
    pub async fn ensure(&self, key: &ResourceKey, object: &DynamicObject) -> Result<()> {
        self.update(key, object, |finalizers| {
            if finalizers.iter().any(|f| f == FINALIZER) {
                return false;
            }
            finalizers.push(FINALIZER.to_string());
            true
        })
        .await?;
        Ok(())
    }

    /// Remove the finalizer, letting the API server finish the deletion
    pub async fn release(&self, key: &ResourceKey, object: &DynamicObject) -> Result<()> {
        self.update(key, object, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != FINALIZER);
            finalizers.len() != before
        })
        .await?;
        Ok(())
    }

    /// Apply `change` to the finalizer list under optimistic concurrency,
    /// re-reading the resource after each conflict
    async fn update<F>(&self, key: &ResourceKey, object: &DynamicObject, change: F) -> Result<bool>
    where
        F: Fn(&mut Vec<String>) -> bool,
    {
        let mut current = object.clone();
        let mut attempt = 1;
        loop {
            let mut finalizers = current.metadata.finalizers.clone().unwrap_or_default();
            if !change(&mut finalizers) {
                return Ok(false);
            }

            let result = self
                .client
                .set_finalizers(
                    &key.namespace,
                    &key.name,
                    finalizers,
                    current.metadata.resource_version.as_deref(),
                )
                .await;

            match result {
                Ok(_) => {
                    info!(resource = %key, finalizer = FINALIZER, "finalizers updated");
                    return Ok(true);
                }
                Err(e) if e.is_conflict() && attempt < CONFLICT_ATTEMPTS => {
                    debug!(resource = %key, attempt, "finalizer write conflicted, re-reading");
                    attempt += 1;
                    match self.client.get(&key.namespace, &key.name).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(false),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockResourceClient;
    use crate::error::ErrorClass;
    use chartpilot_core::KindIdentifier;
    use serde_json::json;

    fn setup(finalizers: &[&str]) -> (MockResourceClient, FinalizerGuard, ResourceKey) {
        let client = MockResourceClient::new();
        client.insert(
            serde_json::from_value(json!({
                "apiVersion": "example.com/v1",
                "kind": "TestApp",
                "metadata": {"name": "app", "namespace": "ns", "finalizers": finalizers},
            }))
            .unwrap(),
        );
        let guard = FinalizerGuard::new(Arc::new(client.clone()));
        let key = ResourceKey::new(KindIdentifier::new("example.com", "v1", "TestApp"), "ns", "app");
        (client, guard, key)
    }

    fn finalizers(client: &MockResourceClient) -> Vec<String> {
        client
            .object("ns", "app")
            .and_then(|o| o.metadata.finalizers)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_ensure_adds_once() {
        let (client, guard, key) = setup(&["other"]);
        guard.ensure(&key, &client.object("ns", "app").unwrap()).await.unwrap();
        guard.ensure(&key, &client.object("ns", "app").unwrap()).await.unwrap();
        assert_eq!(finalizers(&client), vec!["other".to_string(), FINALIZER.to_string()]);
    }

    #[tokio::test]
    async fn test_conflict_is_retried_with_fresh_state() {
        let (client, guard, key) = setup(&[]);
        let stale = client.object("ns", "app").unwrap();
        client.set_spec("ns", "app", json!({"replicaCount": 2}));

        guard.ensure(&key, &stale).await.unwrap();
        assert_eq!(finalizers(&client), vec![FINALIZER.to_string()]);
    }

    #[tokio::test]
    async fn test_conflicts_are_bounded() {
        let (client, guard, key) = setup(&[]);
        client.inject_conflicts(3);
        let err = guard
            .ensure(&key, &client.object("ns", "app").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Conflict);
    }

    #[tokio::test]
    async fn test_release_lets_deletion_finish() {
        let (client, guard, key) = setup(&[FINALIZER]);
        client.delete("ns", "app");
        let obj = client.object("ns", "app").unwrap();

        guard.release(&key, &obj).await.unwrap();
        assert!(client.object("ns", "app").is_none());
    }
}
