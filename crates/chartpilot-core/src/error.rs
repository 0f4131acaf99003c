//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Chart not found: {path}")]
    ChartNotFound { path: String },

    #[error("Invalid Chart.yaml: {message}")]
    InvalidChart { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    /// A higher-precedence value has a different structural kind than the
    /// value it would override
    #[error("type mismatch at '{path}': cannot merge a {overlay} over a {base}")]
    TypeMismatch {
        path: String,
        base: &'static str,
        overlay: &'static str,
    },

    #[error("Values merge error: {message}")]
    ValuesMerge { message: String },

    #[error("Invalid schema: {message}")]
    InvalidSchema { message: String },

    #[error("values do not match the chart schema: {}", summarize(.errors))]
    SchemaViolation { errors: Vec<ValidationErrorInfo> },

    #[error("invalid watch entry #{index}: {message}")]
    InvalidWatch { index: usize, message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

impl CoreError {
    /// Errors caused by the content of values rather than by the environment
    pub fn is_values_error(&self) -> bool {
        matches!(
            self,
            Self::TypeMismatch { .. } | Self::ValuesMerge { .. } | Self::SchemaViolation { .. }
        )
    }
}

/// A single schema violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrorInfo {
    /// JSON pointer of the offending value, `(root)` for the document itself
    pub path: String,
    pub message: String,
}

fn summarize(errors: &[ValidationErrorInfo]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.path, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, CoreError>;
