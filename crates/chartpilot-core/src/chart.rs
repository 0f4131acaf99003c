//! Chart definition and loading
//!
//! Charts are directories holding `Chart.yaml`, `values.yaml`, an optional
//! `values.schema.json` and a `templates/` tree. The whole bundle is read
//! into memory once so reconciles never touch the filesystem.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::schema::SchemaValidator;
use crate::values::Values;

/// Chart metadata from `Chart.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// Chart API version (v1 or v2)
    #[serde(default)]
    pub api_version: Option<String>,

    /// Chart name (required)
    pub name: String,

    /// Chart version (required, SemVer)
    #[serde(with = "version_serde")]
    pub version: Version,

    /// Description
    #[serde(default)]
    pub description: Option<String>,

    /// Application version
    #[serde(default)]
    pub app_version: Option<String>,

    /// Annotations
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl ChartMetadata {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            api_version: Some("v2".to_string()),
            name: name.into(),
            version,
            description: None,
            app_version: None,
            annotations: HashMap::new(),
        }
    }
}

/// A chart held in memory
#[derive(Debug, Clone)]
pub struct LoadedChart {
    /// Chart metadata
    pub metadata: ChartMetadata,

    /// Directory the chart was loaded from, if any
    pub root: Option<PathBuf>,

    /// Default values from `values.yaml`
    pub values: Values,

    /// Template sources keyed by path relative to `templates/`
    pub templates: BTreeMap<String, String>,

    /// Compiled values schema
    pub schema: Option<Arc<SchemaValidator>>,
}

impl LoadedChart {
    /// Load a chart from a directory
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let root = path.as_ref().to_path_buf();

        if !root.is_dir() {
            return Err(CoreError::ChartNotFound {
                path: root.display().to_string(),
            });
        }

        let chart_file = root.join("Chart.yaml");
        if !chart_file.exists() {
            return Err(CoreError::InvalidChart {
                message: format!("Chart.yaml not found in {}", root.display()),
            });
        }

        let metadata: ChartMetadata = serde_yaml::from_str(&std::fs::read_to_string(&chart_file)?)?;
        if metadata.name.trim().is_empty() {
            return Err(CoreError::InvalidChart {
                message: "chart name must not be empty".to_string(),
            });
        }

        let values_path = root.join("values.yaml");
        let values = if values_path.exists() {
            Values::from_file(&values_path)?
        } else {
            Values::new()
        };

        let schema = Self::find_schema_file(&root)
            .map(SchemaValidator::from_file)
            .transpose()?
            .map(Arc::new);

        let templates = Self::read_templates(&root.join("templates"))?;

        tracing::debug!(
            chart = %metadata.name,
            version = %metadata.version,
            templates = templates.len(),
            "loaded chart"
        );

        Ok(Self {
            metadata,
            root: Some(root),
            values,
            templates,
            schema,
        })
    }

    /// Build a chart from in-memory parts
    pub fn from_parts(
        metadata: ChartMetadata,
        values: Values,
        templates: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            metadata,
            root: None,
            values,
            templates: templates.into_iter().collect(),
            schema: None,
        }
    }

    /// Attach a values schema
    pub fn with_schema(mut self, schema: SchemaValidator) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &Version {
        &self.metadata.version
    }

    /// Find schema file, checking the standard locations
    fn find_schema_file(root: &Path) -> Option<PathBuf> {
        ["values.schema.json", "values.schema.yaml"]
            .into_iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.exists())
    }

    /// Read every template file below `templates_dir`
    fn read_templates(templates_dir: &Path) -> Result<BTreeMap<String, String>> {
        let mut templates = BTreeMap::new();

        if !templates_dir.exists() {
            return Ok(templates);
        }

        for entry in walkdir::WalkDir::new(templates_dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(ext) = path.extension() else {
                continue;
            };
            let ext = ext.to_string_lossy().to_lowercase();
            if !matches!(ext.as_str(), "yaml" | "yml" | "j2" | "tpl" | "txt" | "json") {
                continue;
            }

            let rel_path = path.strip_prefix(templates_dir).unwrap_or(path);
            let name = rel_path.to_string_lossy().replace('\\', "/");
            templates.insert(name, std::fs::read_to_string(path)?);
        }

        Ok(templates)
    }
}

/// Custom serde for semver::Version
mod version_serde {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(version: &Version, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&version.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Version, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_chart(dir: &Path) {
        fs::write(
            dir.join("Chart.yaml"),
            "apiVersion: v2\nname: nginx\nversion: 0.1.0\nappVersion: \"1.25\"\n",
        )
        .unwrap();
        fs::write(dir.join("values.yaml"), "replicaCount: 1\nimage:\n  tag: stable\n").unwrap();
        fs::create_dir_all(dir.join("templates")).unwrap();
        fs::write(
            dir.join("templates/deployment.yaml"),
            "kind: Deployment\nreplicas: {{ values.replicaCount }}\n",
        )
        .unwrap();
        fs::write(dir.join("templates/_helpers.tpl"), "{% macro name() %}x{% endmacro %}").unwrap();
        fs::write(dir.join("templates/README.md"), "ignored").unwrap();
    }

    #[test]
    fn test_load_chart() {
        let dir = tempfile::tempdir().unwrap();
        write_chart(dir.path());

        let chart = LoadedChart::load(dir.path()).unwrap();

        assert_eq!(chart.name(), "nginx");
        assert_eq!(chart.version(), &Version::new(0, 1, 0));
        assert_eq!(chart.metadata.app_version.as_deref(), Some("1.25"));
        assert_eq!(chart.values.get("replicaCount").unwrap(), 1);
        assert_eq!(
            chart.templates.keys().cloned().collect::<Vec<_>>(),
            vec!["_helpers.tpl".to_string(), "deployment.yaml".to_string()]
        );
        assert!(chart.schema.is_none());
    }

    #[test]
    fn test_load_chart_with_schema() {
        let dir = tempfile::tempdir().unwrap();
        write_chart(dir.path());
        fs::write(
            dir.path().join("values.schema.json"),
            r#"{"type": "object", "properties": {"replicaCount": {"type": "integer"}}}"#,
        )
        .unwrap();

        let chart = LoadedChart::load(dir.path()).unwrap();
        assert!(chart.schema.is_some());
    }

    #[test]
    fn test_missing_chart_dir() {
        let result = LoadedChart::load("/nonexistent/chart");
        assert!(matches!(result, Err(CoreError::ChartNotFound { .. })));
    }

    #[test]
    fn test_missing_chart_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let result = LoadedChart::load(dir.path());
        assert!(matches!(result, Err(CoreError::InvalidChart { .. })));
    }

    #[test]
    fn test_invalid_version() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Chart.yaml"), "name: bad\nversion: one\n").unwrap();
        assert!(LoadedChart::load(dir.path()).is_err());
    }

    #[test]
    fn test_from_parts() {
        let chart = LoadedChart::from_parts(
            ChartMetadata::new("demo", Version::new(1, 2, 3)),
            Values::new(),
            [("cm.yaml".to_string(), "kind: ConfigMap".to_string())],
        );
        assert_eq!(chart.name(), "demo");
        assert!(chart.root.is_none());
        assert_eq!(chart.templates.len(), 1);
    }
}
