//! Values handling with strict deep merge and canonical digests

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{CoreError, Result};

/// Values container with deep merge capability
///
/// The root is always a mapping. Empty documents load as an empty mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Load values from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse values from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        Self::from_json_value(value)
    }

    /// Parse values from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Self::from_json_value(value)
    }

    /// Wrap an already parsed document, rejecting non-mapping roots
    pub fn from_json_value(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Null => Ok(Self::new()),
            JsonValue::Object(_) => Ok(Self(value)),
            other => Err(CoreError::ValuesMerge {
                message: format!("values must be a mapping, got a {}", kind_name(&other)),
            }),
        }
    }

    /// Deep merge another Values into this one
    ///
    /// Rules:
    /// - Mappings: recursive merge
    /// - Scalars and sequences: overlay replaces base (sequences are not appended)
    /// - `null` in the overlay removes the key
    /// - A `null` base is replaced by anything
    /// - Mapping, sequence and scalar never replace one another: that is a
    ///   [`CoreError::TypeMismatch`] naming the dotted path
    pub fn merge(&mut self, overlay: &Values) -> Result<()> {
        let mut path = Vec::new();
        deep_merge(&mut self.0, &overlay.0, &mut path)
    }

    /// Set a value by dotted path (e.g., "image.tag")
    pub fn set(&mut self, path: &str, value: JsonValue) -> Result<()> {
        let parts: Vec<&str> = path.split('.').collect();
        set_nested(&mut self.0, &parts, value)
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let parts: Vec<&str> = path.split('.').collect();
        get_nested(&self.0, &parts)
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Convert to JSON value
    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// JSON encoding with every mapping's keys sorted, independent of
    /// insertion order
    pub fn canonical_json(&self) -> String {
        let mut out = String::new();
        write_canonical(&self.0, &mut out);
        out
    }

    /// Hex-encoded SHA-256 of [`Values::canonical_json`]
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_json().as_bytes()))
    }
}

/// Structural kind used for mismatch detection
fn kind_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Object(_) => "mapping",
        JsonValue::Array(_) => "sequence",
        JsonValue::Null => "null",
        _ => "scalar",
    }
}

fn dotted(path: &[String]) -> String {
    if path.is_empty() {
        "(root)".to_string()
    } else {
        path.join(".")
    }
}

/// Deep merge two JSON values
fn deep_merge(base: &mut JsonValue, overlay: &JsonValue, path: &mut Vec<String>) -> Result<()> {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                if overlay_value.is_null() {
                    base_map.remove(key);
                    continue;
                }
                path.push(key.clone());
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value, path)?,
                    None => {
                        base_map.insert(key.clone(), without_nulls(overlay_value));
                    }
                }
                path.pop();
            }
            Ok(())
        }
        (base, overlay) if base.is_null() => {
            *base = without_nulls(overlay);
            Ok(())
        }
        (base, overlay) => {
            let (base_kind, overlay_kind) = (kind_name(base), kind_name(overlay));
            if base_kind != overlay_kind {
                return Err(CoreError::TypeMismatch {
                    path: dotted(path),
                    base: base_kind,
                    overlay: overlay_kind,
                });
            }
            *base = overlay.clone();
            Ok(())
        }
    }
}

/// Copy of a mapping tree with null-valued keys dropped
fn without_nulls(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), without_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Set a nested value by path
fn set_nested(value: &mut JsonValue, path: &[&str], new_value: JsonValue) -> Result<()> {
    let Some((key, remaining)) = path.split_first() else {
        *value = new_value;
        return Ok(());
    };

    if value.is_null() {
        *value = JsonValue::Object(serde_json::Map::new());
    }

    let kind = kind_name(value);
    let JsonValue::Object(map) = value else {
        return Err(CoreError::ValuesMerge {
            message: format!("cannot set '{}' inside a {}", key, kind),
        });
    };

    if remaining.is_empty() {
        map.insert(key.to_string(), new_value);
        Ok(())
    } else {
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
        set_nested(entry, remaining, new_value)
    }
}

/// Get a nested value by path
fn get_nested<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let Some((key, remaining)) = path.split_first() else {
        return Some(value);
    };

    match value {
        JsonValue::Object(map) => map.get(*key).and_then(|v| get_nested(v, remaining)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge() {
        let mut base = Values::from_yaml(
            r#"
image:
  repository: nginx
  tag: "1.0"
replicas: 1
"#,
        )
        .unwrap();

        let overlay = Values::from_yaml(
            r#"
image:
  tag: "2.0"
  pullPolicy: Always
replicas: 3
"#,
        )
        .unwrap();

        base.merge(&overlay).unwrap();

        assert_eq!(base.get("image.repository").unwrap(), "nginx");
        assert_eq!(base.get("image.tag").unwrap(), "2.0");
        assert_eq!(base.get("image.pullPolicy").unwrap(), "Always");
        assert_eq!(base.get("replicas").unwrap(), 3);
    }

    #[test]
    fn test_sequences_are_replaced() {
        let mut base = Values(json!({"args": ["a", "b", "c"]}));
        base.merge(&Values(json!({"args": ["z"]}))).unwrap();
        assert_eq!(base.get("args").unwrap(), &json!(["z"]));
    }

    #[test]
    fn test_scalar_kinds_replace_each_other() {
        let mut base = Values(json!({"port": "8080"}));
        base.merge(&Values(json!({"port": 9090}))).unwrap();
        assert_eq!(base.get("port").unwrap(), 9090);
    }

    #[test]
    fn test_null_overlay_removes_key() {
        let mut base = Values(json!({"resources": {"limits": {"cpu": "1"}}, "keep": true}));
        base.merge(&Values(json!({"resources": null}))).unwrap();
        assert!(base.get("resources").is_none());
        assert_eq!(base.get("keep").unwrap(), true);
    }

    #[test]
    fn test_null_base_is_replaced() {
        let mut base = Values(json!({"affinity": null}));
        base.merge(&Values(json!({"affinity": {"zone": "a"}}))).unwrap();
        assert_eq!(base.get("affinity.zone").unwrap(), "a");
    }

    #[test]
    fn test_type_mismatch_names_path() {
        let mut base = Values(json!({"service": {"ports": {"http": 80}}}));
        let err = base
            .merge(&Values(json!({"service": {"ports": [80, 443]}})))
            .unwrap_err();

        match err {
            CoreError::TypeMismatch {
                path,
                base,
                overlay,
            } => {
                assert_eq!(path, "service.ports");
                assert_eq!(base, "mapping");
                assert_eq!(overlay, "sequence");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_scalar_over_mapping_is_rejected() {
        let mut base = Values(json!({"image": {"tag": "1"}}));
        let result = base.merge(&Values(json!({"image": "nginx:1"})));
        assert!(matches!(result, Err(CoreError::TypeMismatch { .. })));
    }

    #[test]
    fn test_non_mapping_root_rejected() {
        assert!(Values::from_yaml("- a\n- b").is_err());
        assert!(Values::from_yaml("").unwrap().is_empty());
    }

    #[test]
    fn test_set_nested() {
        let mut values = Values::new();
        values.set("image.tag", JsonValue::String("v1".into())).unwrap();
        values.set("replicas", JsonValue::Number(3.into())).unwrap();

        assert_eq!(values.get("image.tag").unwrap(), "v1");
        assert_eq!(values.get("replicas").unwrap(), 3);
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut values = Values(json!({"image": "nginx"}));
        assert!(values.set("image.tag", json!("v1")).is_err());
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a = Values::from_json(r#"{"b": 1, "a": {"y": [1, 2], "x": "s"}}"#).unwrap();
        let b = Values::from_json(r#"{"a": {"x": "s", "y": [1, 2]}, "b": 1}"#).unwrap();

        assert_eq!(a.canonical_json(), r#"{"a":{"x":"s","y":[1,2]},"b":1}"#);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_digest_changes_with_content() {
        let a = Values(json!({"replicaCount": 3}));
        let b = Values(json!({"replicaCount": 5}));
        assert_ne!(a.digest(), b.digest());
    }
}
