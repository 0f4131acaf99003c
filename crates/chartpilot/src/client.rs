//! Reads and writes on watched custom resources
//!
//! [`ResourceClient`] is everything the reconciler needs from the API server
//! for its own resources: a fresh read, finalizer updates guarded by
//! `resourceVersion`, annotation merges and status writes.
//! [`KubeResourceClient`] talks to a cluster; [`MockResourceClient`] keeps
//! objects in memory and mimics the server's deletion and conflict behaviour.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::error::ErrorResponse;
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Freshest state of a resource, `None` once it is gone
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>>;

    /// Replace the finalizer list. With a `resource_version` the write fails
    /// with a conflict if the resource changed since it was read.
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<&str>,
    ) -> Result<Option<DynamicObject>>;

    /// Merge annotations into the resource's metadata
    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Replace the status subresource
    async fn patch_status(&self, namespace: &str, name: &str, status: &serde_json::Value) -> Result<()>;
}

/// Client for one watched kind
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    resource: ApiResource,
}

impl KubeResourceClient {
    pub fn new(client: Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<&str>,
    ) -> Result<Option<DynamicObject>> {
        let mut metadata = json!({ "finalizers": finalizers });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = json!(rv);
        }
        let patch = json!({ "metadata": metadata });
        match self
            .api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_status(&self, namespace: &str, name: &str, status: &serde_json::Value) -> Result<()> {
        let patch = json!({ "status": status });
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

type Objects = BTreeMap<(String, String), DynamicObject>;

/// In-memory resource client
///
/// Objects marked deleted keep living until their finalizer list is empty,
/// like on a real API server.
#[derive(Clone, Default)]
pub struct MockResourceClient {
    objects: Arc<Mutex<Objects>>,
    revision: Arc<AtomicU32>,
    injected_conflicts: Arc<AtomicU32>,
    fail_status: Arc<AtomicBool>,
    status_writes: Arc<AtomicUsize>,
    annotation_writes: Arc<AtomicUsize>,
}

fn lock(objects: &Mutex<Objects>) -> MutexGuard<'_, Objects> {
    objects.lock().unwrap_or_else(PoisonError::into_inner)
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Api(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn key_of(obj: &DynamicObject) -> (String, String) {
    (
        obj.metadata.namespace.clone().unwrap_or_default(),
        obj.metadata.name.clone().unwrap_or_default(),
    )
}

impl MockResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Create or replace an object
    pub fn insert(&self, mut obj: DynamicObject) {
        obj.metadata.resource_version = Some(self.next_revision());
        obj.metadata.generation = Some(obj.metadata.generation.unwrap_or(0) + 1);
        lock(&self.objects).insert(key_of(&obj), obj);
    }

    /// Replace the declared values of an existing object
    pub fn set_spec(&self, namespace: &str, name: &str, spec: serde_json::Value) -> bool {
        let revision = self.next_revision();
        let mut objects = lock(&self.objects);
        let Some(obj) = objects.get_mut(&(namespace.to_string(), name.to_string())) else {
            return false;
        };
        obj.data["spec"] = spec;
        obj.metadata.resource_version = Some(revision);
        obj.metadata.generation = Some(obj.metadata.generation.unwrap_or(0) + 1);
        true
    }

    /// Request deletion; the object goes away once no finalizer is left
    pub fn delete(&self, namespace: &str, name: &str) {
        let revision = self.next_revision();
        let mut objects = lock(&self.objects);
        let key = (namespace.to_string(), name.to_string());
        let Some(obj) = objects.get_mut(&key) else {
            return;
        };
        if obj.metadata.finalizers.as_ref().is_none_or(|f| f.is_empty()) {
            objects.remove(&key);
            return;
        }
        obj.metadata.deletion_timestamp.get_or_insert(Time(Utc::now()));
        obj.metadata.resource_version = Some(revision);
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<DynamicObject> {
        lock(&self.objects)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Fail the next `n` finalizer writes with a conflict
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn fail_status_writes(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn annotation_writes(&self) -> usize {
        self.annotation_writes.load(Ordering::SeqCst)
    }

    fn take_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ResourceClient for MockResourceClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.object(namespace, name))
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<&str>,
    ) -> Result<Option<DynamicObject>> {
        if self.take_conflict() {
            return Err(api_error(409, "Conflict", format!("{name} has been modified")));
        }

        let revision = self.next_revision();
        let mut objects = lock(&self.objects);
        let key = (namespace.to_string(), name.to_string());
        let Some(obj) = objects.get_mut(&key) else {
            return Ok(None);
        };
        if let Some(expected) = resource_version
            && obj.metadata.resource_version.as_deref() != Some(expected)
        {
            return Err(api_error(409, "Conflict", format!("{name} has been modified")));
        }

        obj.metadata.finalizers = Some(finalizers);
        obj.metadata.resource_version = Some(revision);

        let released = obj.metadata.deletion_timestamp.is_some()
            && obj.metadata.finalizers.as_ref().is_none_or(|f| f.is_empty());
        if released {
            objects.remove(&key);
            return Ok(None);
        }
        Ok(Some(obj.clone()))
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let revision = self.next_revision();
        let mut objects = lock(&self.objects);
        let obj = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        obj.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        obj.metadata.resource_version = Some(revision);
        self.annotation_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn patch_status(&self, namespace: &str, name: &str, status: &serde_json::Value) -> Result<()> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(api_error(500, "InternalError", "status write rejected".to_string()));
        }
        let revision = self.next_revision();
        let mut objects = lock(&self.objects);
        let obj = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        obj.data["status"] = status.clone();
        obj.metadata.resource_version = Some(revision);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(finalizers: &[&str]) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "TestApp",
            "metadata": {
                "name": "app",
                "namespace": "ns",
                "finalizers": finalizers,
            },
            "spec": {"replicaCount": 1},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let client = MockResourceClient::new();
        client.insert(object(&["keep"]));
        client.delete("ns", "app");

        let obj = client.get("ns", "app").await.unwrap().unwrap();
        assert!(obj.metadata.deletion_timestamp.is_some());

        let rv = obj.metadata.resource_version.clone();
        let after = client
            .set_finalizers("ns", "app", vec![], rv.as_deref())
            .await
            .unwrap();
        assert!(after.is_none());
        assert!(client.get("ns", "app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_without_finalizers_is_immediate() {
        let client = MockResourceClient::new();
        client.insert(object(&[]));
        client.delete("ns", "app");
        assert!(client.object("ns", "app").is_none());
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let client = MockResourceClient::new();
        client.insert(object(&[]));
        let stale = client.object("ns", "app").unwrap().metadata.resource_version;
        client.set_spec("ns", "app", json!({"replicaCount": 2}));

        let err = client
            .set_finalizers("ns", "app", vec!["f".into()], stale.as_deref())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_injected_conflicts() {
        let client = MockResourceClient::new();
        client.insert(object(&[]));
        client.inject_conflicts(1);

        assert!(client.set_finalizers("ns", "app", vec![], None).await.is_err());
        assert!(client.set_finalizers("ns", "app", vec![], None).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_and_annotations() {
        let client = MockResourceClient::new();
        client.insert(object(&[]));

        client
            .patch_annotations("ns", "app", &BTreeMap::from([("a".to_string(), "b".to_string())]))
            .await
            .unwrap();
        client.patch_status("ns", "app", &json!({"conditions": []})).await.unwrap();

        let obj = client.object("ns", "app").unwrap();
        assert_eq!(obj.metadata.annotations.unwrap()["a"], "b");
        assert_eq!(obj.data["status"], json!({"conditions": []}));
        assert_eq!(client.status_writes(), 1);

        client.fail_status_writes(true);
        assert!(client.patch_status("ns", "app", &json!({})).await.is_err());
    }
}
