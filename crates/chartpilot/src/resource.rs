//! Typed view over a watched custom resource

use std::collections::BTreeMap;

use chartpilot_core::{KindIdentifier, Values};
use kube::api::DynamicObject;

use crate::attributes::ReleaseAttributes;
use crate::error::{Error, Result};
use crate::identity::ResourceKey;
use crate::status::ReleaseStatus;

static NO_ANNOTATIONS: BTreeMap<String, String> = BTreeMap::new();

/// A custom resource instance of a watched kind
#[derive(Debug, Clone)]
pub struct CustomResource {
    key: ResourceKey,
    object: DynamicObject,
}

impl CustomResource {
    pub fn new(kind: KindIdentifier, object: DynamicObject) -> Result<Self> {
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::InvalidResource("resource has no name".to_string()))?;
        let namespace = object.metadata.namespace.clone().ok_or_else(|| {
            Error::InvalidResource(format!("resource '{name}' is not namespaced"))
        })?;
        Ok(Self {
            key: ResourceKey::new(kind, namespace, name),
            object,
        })
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn object(&self) -> &DynamicObject {
        &self.object
    }

    /// Values declared under `spec`; a missing or null spec declares nothing
    pub fn declared_values(&self) -> Result<Values> {
        match self.object.data.get("spec") {
            None | Some(serde_json::Value::Null) => Ok(Values::new()),
            Some(spec @ serde_json::Value::Object(_)) => Ok(Values(spec.clone())),
            Some(other) => Err(Error::InvalidResource(format!(
                "spec of '{}' must be a mapping, got {}",
                self.key,
                json_type(other)
            ))),
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.object.metadata.deletion_timestamp.is_some()
    }

    pub fn finalizers(&self) -> &[String] {
        self.object.metadata.finalizers.as_deref().unwrap_or_default()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        self.object.metadata.annotations.as_ref().unwrap_or(&NO_ANNOTATIONS)
    }

    pub fn attributes(&self) -> Option<ReleaseAttributes> {
        ReleaseAttributes::from_annotations(self.annotations())
    }

    /// Current status, if it can be read as a release status
    pub fn status(&self) -> Option<ReleaseStatus> {
        let status = self.object.data.get("status")?;
        serde_json::from_value(status.clone()).ok()
    }

    pub fn generation(&self) -> Option<i64> {
        self.object.metadata.generation
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.object.metadata.resource_version.as_deref()
    }
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "sequence",
        serde_json::Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(data: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "TestApp",
            "metadata": {"name": "app", "namespace": "ns", "finalizers": ["other"]},
        }))
        .map(|mut obj: DynamicObject| {
            obj.data = data;
            obj
        })
        .unwrap()
    }

    fn kind() -> KindIdentifier {
        KindIdentifier::new("example.com", "v1", "TestApp")
    }

    #[test]
    fn test_declared_values() {
        let cr = CustomResource::new(kind(), object(json!({"spec": {"replicaCount": 3}}))).unwrap();
        assert_eq!(cr.declared_values().unwrap(), Values(json!({"replicaCount": 3})));
        assert_eq!(cr.key().to_string(), "TestApp/ns/app");
    }

    #[test]
    fn test_missing_spec_declares_nothing() {
        let cr = CustomResource::new(kind(), object(json!({}))).unwrap();
        assert!(cr.declared_values().unwrap().is_empty());
    }

    #[test]
    fn test_scalar_spec_is_rejected() {
        let cr = CustomResource::new(kind(), object(json!({"spec": [1, 2]}))).unwrap();
        let err = cr.declared_values().unwrap_err();
        assert!(err.to_string().contains("sequence"));
    }

    #[test]
    fn test_metadata_views() {
        let cr = CustomResource::new(kind(), object(json!({}))).unwrap();
        assert!(!cr.is_deleting());
        assert!(cr.has_finalizer("other"));
        assert!(cr.annotations().is_empty());
        assert!(cr.attributes().is_none());
        assert!(cr.status().is_none());
    }

    #[test]
    fn test_cluster_scoped_is_rejected() {
        let mut obj = object(json!({}));
        obj.metadata.namespace = None;
        assert!(CustomResource::new(kind(), obj).is_err());
    }
}
