//! JSON Schema validation of composed values

use serde_json::Value as JsonValue;
use std::fmt;
use std::path::Path;

use crate::error::{CoreError, Result, ValidationErrorInfo};

/// Schema validator with cached compiled schema
pub struct SchemaValidator {
    /// The schema document as loaded
    schema: JsonValue,

    /// Compiled JSON Schema validator
    compiled: jsonschema::Validator,
}

impl SchemaValidator {
    /// Compile a schema document
    pub fn new(schema: JsonValue) -> Result<Self> {
        let compiled = jsonschema::validator_for(&schema).map_err(|e| CoreError::InvalidSchema {
            message: e.to_string(),
        })?;

        Ok(Self { schema, compiled })
    }

    /// Load `values.schema.json` (or a YAML rendition of a JSON Schema)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let schema: JsonValue = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        Self::new(schema)
    }

    /// Validate values, collecting every violation
    pub fn validate(&self, values: &JsonValue) -> Result<()> {
        if self.compiled.is_valid(values) {
            return Ok(());
        }

        let errors: Vec<ValidationErrorInfo> = self
            .compiled
            .iter_errors(values)
            .map(|e| {
                let path = e.instance_path.to_string();
                ValidationErrorInfo {
                    path: if path.is_empty() {
                        "(root)".to_string()
                    } else {
                        path
                    },
                    message: e.to_string().replace('"', "'"),
                }
            })
            .collect();

        Err(CoreError::SchemaViolation { errors })
    }

    /// Get the schema document
    pub fn schema(&self) -> &JsonValue {
        &self.schema
    }
}

impl fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn replica_schema() -> SchemaValidator {
        SchemaValidator::new(json!({
            "type": "object",
            "properties": {
                "replicaCount": { "type": "integer", "minimum": 0 }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_values() {
        assert!(replica_schema().validate(&json!({"replicaCount": 3})).is_ok());
    }

    #[test]
    fn test_invalid_values_report_path() {
        let err = replica_schema()
            .validate(&json!({"replicaCount": "three"}))
            .unwrap_err();

        match err {
            CoreError::SchemaViolation { errors } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].path, "/replicaCount");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let result = SchemaValidator::new(json!({"type": "string", "pattern": "(unclosed"}));
        assert!(matches!(result, Err(CoreError::InvalidSchema { .. })));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.schema.json");
        std::fs::write(&path, r#"{"type": "object", "required": ["name"]}"#).unwrap();

        let validator = SchemaValidator::from_file(&path).unwrap();
        assert!(validator.validate(&json!({})).is_err());
        assert!(validator.validate(&json!({"name": "x"})).is_ok());
    }
}
