//! Labels and annotations written onto rendered objects
//!
//! Every object of a release carries the managed-by label (used as the
//! dependent watch selector) and three owner annotations pointing back to the
//! custom resource. Both `chartpilot.io/*` and `helm.sh/*` resource policies
//! are honoured on uninstall.

use std::collections::BTreeMap;

use chartpilot_core::{ActionAnnotation, ActionKind};

use crate::release::ReleaseOwner;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "chartpilot";

/// Label selector matching every object rendered by the operator
pub fn managed_by_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)
}

/// Owner annotations
pub mod owner {
    /// `Kind.group` of the owning custom resource
    pub const KIND: &str = "chartpilot.io/owner-kind";
    pub const NAMESPACE: &str = "chartpilot.io/owner-namespace";
    pub const NAME: &str = "chartpilot.io/owner-name";
}

/// Resource policy annotations
pub mod policy {
    pub const RESOURCE_POLICY: &str = "chartpilot.io/resource-policy";
    /// Helm-compatible variant
    pub const HELM_RESOURCE_POLICY: &str = "helm.sh/resource-policy";
    pub const KEEP: &str = "keep";
}

/// Get annotation value, preferring chartpilot over Helm
pub fn get_annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    key: &str,
    helm_key: &str,
) -> Option<&'a str> {
    annotations
        .get(key)
        .or_else(|| annotations.get(helm_key))
        .map(|s| s.as_str())
}

/// Objects annotated `resource-policy: keep` survive uninstall
pub fn has_keep_policy(annotations: &BTreeMap<String, String>) -> bool {
    get_annotation(annotations, policy::RESOURCE_POLICY, policy::HELM_RESOURCE_POLICY)
        .is_some_and(|v| v.trim() == policy::KEEP)
}

/// Owner annotations for one release
pub fn owner_annotations(owner: &ReleaseOwner) -> BTreeMap<String, String> {
    BTreeMap::from([
        (owner::KIND.to_string(), owner.qualified_kind()),
        (owner::NAMESPACE.to_string(), owner.namespace.clone()),
        (owner::NAME.to_string(), owner.name.clone()),
    ])
}

/// Owner parsed back from an object's annotations: `(kind, namespace, name)`
pub fn parse_owner(annotations: &BTreeMap<String, String>) -> Option<(&str, &str, &str)> {
    let kind = annotations.get(owner::KIND)?;
    let namespace = annotations.get(owner::NAMESPACE)?;
    let name = annotations.get(owner::NAME)?;
    if kind.is_empty() || name.is_empty() {
        return None;
    }
    Some((kind, namespace, name))
}

/// Parse a boolean annotation value (`true`, `yes`, `1`)
pub fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

/// Value of an action annotation, if enabled for `action` and present
pub fn action_annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    enabled: &[ActionAnnotation],
    action: ActionKind,
    annotation: ActionAnnotation,
) -> Option<&'a str> {
    if annotation.action() != action || !enabled.contains(&annotation) {
        return None;
    }
    annotations.get(annotation.key()).map(|s| s.as_str())
}
