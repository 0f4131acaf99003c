//! Rendered manifest inspection
//!
//! A release manifest is a multi-document YAML stream. This module splits it
//! into [`DynamicObject`]s, stamps ownership metadata onto every object and
//! derives the object references and kinds the operator tracks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chartpilot_core::KindIdentifier;
use kube::api::DynamicObject;
use kube::core::{GroupVersionKind, TypeMeta};
use serde::{Deserialize, Serialize};

use crate::annotations::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, owner_annotations};
use crate::error::{KubeError, Result};
use crate::release::ReleaseOwner;

/// Identity of one object in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    /// Absent when the manifest leaves it to the release namespace or the
    /// object is cluster-scoped
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        let types = type_meta(obj)?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| KubeError::InvalidManifest(format!("{} without metadata.name", types.kind)))?;

        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }

    pub fn kind_identifier(&self) -> KindIdentifier {
        let gvk = gvk_from_parts(&self.api_version, &self.kind);
        KindIdentifier::new(gvk.group, gvk.version, gvk.kind)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Resource categories in apply order (lower first, reversed for delete)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceCategory {
    Crd = 0,
    Namespace = 1,
    NamespaceConfig = 2,
    ClusterRbac = 10,
    NamespacedRbac = 11,
    Config = 20,
    Storage = 21,
    Network = 30,
    Workload = 40,
    Batch = 50,
    Autoscaling = 60,
    CustomResource = 70,
    Other = 100,
}

const BUILTIN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "autoscaling",
    "policy",
    "networking.k8s.io",
    "rbac.authorization.k8s.io",
    "storage.k8s.io",
    "apiextensions.k8s.io",
    "admissionregistration.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "scheduling.k8s.io",
    "node.k8s.io",
    "certificates.k8s.io",
];

impl ResourceCategory {
    pub fn from_resource(kind: &str, api_version: &str) -> Self {
        match kind {
            "CustomResourceDefinition" => Self::Crd,
            "Namespace" => Self::Namespace,
            "ResourceQuota" | "LimitRange" => Self::NamespaceConfig,
            "ClusterRole" | "ClusterRoleBinding" => Self::ClusterRbac,
            "Role" | "RoleBinding" | "ServiceAccount" => Self::NamespacedRbac,
            "ConfigMap" | "Secret" => Self::Config,
            "PersistentVolume" | "PersistentVolumeClaim" | "StorageClass" => Self::Storage,
            "NetworkPolicy" | "Service" | "Endpoints" | "Ingress" | "IngressClass" => Self::Network,
            "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Pod" => Self::Workload,
            "Job" | "CronJob" => Self::Batch,
            "HorizontalPodAutoscaler" | "PodDisruptionBudget" => Self::Autoscaling,
            _ => {
                let group = api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("");
                if BUILTIN_GROUPS.contains(&group) {
                    Self::Other
                } else {
                    Self::CustomResource
                }
            }
        }
    }

    pub fn of(obj: &DynamicObject) -> Self {
        match &obj.types {
            Some(t) => Self::from_resource(&t.kind, &t.api_version),
            None => Self::Other,
        }
    }
}

/// Sort for creation, dependencies first; stable within a category
pub fn sort_for_apply(objects: &mut [DynamicObject]) {
    objects.sort_by_key(ResourceCategory::of);
}

/// Sort for deletion, reverse of creation order
pub fn sort_for_delete(objects: &mut [DynamicObject]) {
    objects.sort_by_key(|obj| std::cmp::Reverse(ResourceCategory::of(obj)));
}

fn type_meta(obj: &DynamicObject) -> Result<&TypeMeta> {
    obj.types
        .as_ref()
        .ok_or_else(|| KubeError::InvalidManifest("object missing apiVersion or kind".to_string()))
}

/// `apps/v1` splits into group `apps`, version `v1`; `v1` is the core group
pub fn gvk_from_parts(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.rsplit_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    GroupVersionKind {
        group,
        version,
        kind: kind.to_string(),
    }
}

pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = type_meta(obj)?;
    Ok(gvk_from_parts(&types.api_version, &types.kind))
}

/// Split a YAML stream on `---` separator lines, dropping comment-only documents
fn split_documents(manifest: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();

    for line in manifest.lines() {
        if line.trim_end() == "---" || line.starts_with("--- ") {
            docs.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    docs.push(current);

    docs.into_iter()
        .filter(|doc| {
            !doc.lines()
                .all(|l| l.trim().is_empty() || l.trim_start().starts_with('#'))
        })
        .collect()
}

/// Parse every object of a manifest
pub fn parse_objects(manifest: &str) -> Result<Vec<DynamicObject>> {
    split_documents(manifest)
        .iter()
        .enumerate()
        .map(|(index, doc)| {
            let obj: DynamicObject = serde_yaml::from_str(doc).map_err(|e| {
                KubeError::InvalidManifest(format!("document {}: {}", index, e))
            })?;
            // Validates apiVersion, kind and name
            ObjectRef::from_object(&obj)
                .map_err(|e| KubeError::InvalidManifest(format!("document {}: {}", index, e)))?;
            Ok(obj)
        })
        .collect()
}

/// References of every object of a manifest, in manifest order
pub fn object_refs(manifest: &str) -> Result<Vec<ObjectRef>> {
    parse_objects(manifest)?
        .iter()
        .map(ObjectRef::from_object)
        .collect()
}

/// Distinct kinds present in a manifest
pub fn kinds(objects: &[DynamicObject]) -> BTreeSet<KindIdentifier> {
    objects
        .iter()
        .filter_map(|obj| ObjectRef::from_object(obj).ok())
        .map(|r| r.kind_identifier())
        .collect()
}

/// Stamp the managed-by label and owner annotations onto one object
pub fn stamp_ownership(obj: &mut DynamicObject, owner: &ReleaseOwner) {
    obj.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    obj.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .extend(owner_annotations(owner));
}

/// Rebuild the release manifest from rendered templates with ownership
/// metadata on every object, keeping the `# Source:` markers
pub fn inject_ownership(manifests: &BTreeMap<String, String>, owner: &ReleaseOwner) -> Result<String> {
    let mut out = String::new();

    for (source, content) in manifests {
        for mut obj in parse_objects(content)? {
            stamp_ownership(&mut obj, owner);
            let yaml = serde_yaml::to_string(&obj)?;
            out.push_str("---\n# Source: ");
            out.push_str(source);
            out.push('\n');
            out.push_str(yaml.trim_start_matches("---\n").trim_end());
            out.push('\n');
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"---
# Source: deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
---
# only a comment
---
apiVersion: v1
kind: Namespace
metadata:
  name: team
"#;

    fn owner() -> ReleaseOwner {
        ReleaseOwner::new(&KindIdentifier::new("example.com", "v1", "TestApp"), "default", "myapp")
    }

    #[test]
    fn test_parse_objects_skips_comment_documents() {
        let objects = parse_objects(MANIFEST).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].metadata.name.as_deref(), Some("web"));
        assert_eq!(objects[0].data["spec"]["replicas"], 3);
    }

    #[test]
    fn test_missing_name_is_invalid() {
        let err = parse_objects("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err();
        assert!(matches!(err, KubeError::InvalidManifest(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_kinds() {
        let objects = parse_objects(MANIFEST).unwrap();
        let kinds: Vec<_> = kinds(&objects).into_iter().collect();
        assert_eq!(
            kinds,
            vec![
                KindIdentifier::new("", "v1", "Namespace"),
                KindIdentifier::new("apps", "v1", "Deployment"),
            ]
        );
    }

    #[test]
    fn test_apply_order() {
        let mut objects = parse_objects(MANIFEST).unwrap();
        sort_for_apply(&mut objects);
        assert_eq!(objects[0].metadata.name.as_deref(), Some("team"));

        sort_for_delete(&mut objects);
        assert_eq!(objects[0].metadata.name.as_deref(), Some("web"));
    }

    #[test]
    fn test_custom_resource_category() {
        assert_eq!(
            ResourceCategory::from_resource("TestApp", "example.com/v1"),
            ResourceCategory::CustomResource
        );
        assert_eq!(
            ResourceCategory::from_resource("Lease", "coordination.k8s.io/v1"),
            ResourceCategory::Other
        );
        assert!(ResourceCategory::Crd < ResourceCategory::Namespace);
        assert!(ResourceCategory::Workload < ResourceCategory::CustomResource);
    }

    #[test]
    fn test_inject_ownership() {
        let manifests = BTreeMap::from([(
            "cm.yaml".to_string(),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n  labels:\n    tier: web\ndata:\n  a: b\n".to_string(),
        )]);

        let manifest = inject_ownership(&manifests, &owner()).unwrap();
        assert!(manifest.starts_with("---\n# Source: cm.yaml\n"));

        let objects = parse_objects(&manifest).unwrap();
        let meta = &objects[0].metadata;
        let labels = meta.labels.as_ref().unwrap();
        assert_eq!(labels["tier"], "web");
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);

        let annotations = meta.annotations.as_ref().unwrap();
        assert_eq!(annotations["chartpilot.io/owner-kind"], "TestApp.example.com");
        assert_eq!(annotations["chartpilot.io/owner-namespace"], "default");
        assert_eq!(annotations["chartpilot.io/owner-name"], "myapp");
    }

    #[test]
    fn test_object_refs() {
        let refs = object_refs(MANIFEST).unwrap();
        assert_eq!(refs[0].to_string(), "Deployment/web");
        assert_eq!(refs[0].kind_identifier(), KindIdentifier::new("apps", "v1", "Deployment"));
    }
}
