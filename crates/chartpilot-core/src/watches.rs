//! Watches file: which custom resource kinds map to which charts
//!
//! ```yaml
//! - group: example.com
//!   version: v1
//!   kind: TestApp
//!   chart: ./charts/nginx
//!   overrideValues:
//!     image:
//!       tag: $NGINX_TAG
//!   reconcilePeriod: 30s
//!   maxConcurrentReconciles: 4
//!   watchDependentResources: true
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::annotations::{ActionAnnotation, ActionAnnotations};
use crate::error::{CoreError, Result};
use crate::values::Values;

/// `$VAR` or `${VAR}`
static ENV_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex")
});

/// Group/version/kind of a watched custom resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindIdentifier {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl KindIdentifier {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for KindIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// One raw entry of the watches file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WatchEntry {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub chart: PathBuf,

    #[serde(default)]
    pub override_values: Option<JsonValue>,

    #[serde(default, with = "humantime_serde")]
    pub reconcile_period: Option<Duration>,

    #[serde(default)]
    pub max_concurrent_reconciles: Option<usize>,

    #[serde(default)]
    pub watch_dependent_resources: Option<bool>,

    #[serde(default)]
    pub install_annotations: Option<Vec<ActionAnnotation>>,

    #[serde(default)]
    pub upgrade_annotations: Option<Vec<ActionAnnotation>>,

    #[serde(default)]
    pub uninstall_annotations: Option<Vec<ActionAnnotation>>,
}

/// A validated, immutable watch
#[derive(Debug, Clone)]
pub struct WatchSpec {
    kind: KindIdentifier,
    chart: PathBuf,
    override_values: Values,
    reconcile_period: Option<Duration>,
    max_concurrent_reconciles: Option<usize>,
    watch_dependent_resources: bool,
    annotations: ActionAnnotations,
}

impl WatchSpec {
    pub fn kind(&self) -> &KindIdentifier {
        &self.kind
    }

    pub fn chart(&self) -> &Path {
        &self.chart
    }

    pub fn override_values(&self) -> &Values {
        &self.override_values
    }

    pub fn reconcile_period(&self) -> Option<Duration> {
        self.reconcile_period
    }

    pub fn reconcile_period_or(&self, default: Duration) -> Duration {
        self.reconcile_period.unwrap_or(default)
    }

    pub fn max_concurrent_reconciles_or(&self, default: usize) -> usize {
        self.max_concurrent_reconciles.unwrap_or(default)
    }

    pub fn watch_dependent_resources(&self) -> bool {
        self.watch_dependent_resources
    }

    pub fn annotations(&self) -> &ActionAnnotations {
        &self.annotations
    }
}

impl TryFrom<(usize, WatchEntry)> for WatchSpec {
    type Error = CoreError;

    fn try_from((index, entry): (usize, WatchEntry)) -> Result<Self> {
        let invalid = |message: String| CoreError::InvalidWatch { index, message };

        for (field, value) in [("version", &entry.version), ("kind", &entry.kind)] {
            if value.trim().is_empty() {
                return Err(invalid(format!("'{}' must not be empty", field)));
            }
        }
        if entry.chart.as_os_str().is_empty() {
            return Err(invalid("'chart' must not be empty".to_string()));
        }
        if entry.max_concurrent_reconciles == Some(0) {
            return Err(invalid("'maxConcurrentReconciles' must be at least 1".to_string()));
        }

        let override_values = match entry.override_values {
            Some(raw) => Values::from_json_value(expand_env(raw))
                .map_err(|e| invalid(format!("overrideValues: {}", e)))?,
            None => Values::new(),
        };

        let defaults = ActionAnnotations::default();
        let annotations = ActionAnnotations {
            install: entry.install_annotations.unwrap_or(defaults.install),
            upgrade: entry.upgrade_annotations.unwrap_or(defaults.upgrade),
            uninstall: entry.uninstall_annotations.unwrap_or(defaults.uninstall),
        };
        if let Some((action, annotation)) = annotations.misplaced() {
            return Err(invalid(format!(
                "annotation '{}' cannot be used for {}",
                annotation.key(),
                action
            )));
        }

        Ok(Self {
            kind: KindIdentifier::new(entry.group, entry.version, entry.kind),
            chart: entry.chart,
            override_values,
            reconcile_period: entry.reconcile_period,
            max_concurrent_reconciles: entry.max_concurrent_reconciles,
            watch_dependent_resources: entry.watch_dependent_resources.unwrap_or(true),
            annotations,
        })
    }
}

/// Replace `$VAR` and `${VAR}` in every string of a document.
/// Unset variables expand to the empty string.
pub fn expand_env(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(expand_env_str(&s)),
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(expand_env).collect()),
        JsonValue::Object(map) => {
            JsonValue::Object(map.into_iter().map(|(k, v)| (k, expand_env(v))).collect())
        }
        other => other,
    }
}

fn expand_env_str(s: &str) -> String {
    ENV_REF
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

/// Parse a watches document, validating every entry and kind uniqueness
pub fn parse_watches(yaml: &str) -> Result<Vec<WatchSpec>> {
    let entries: Vec<WatchEntry> = serde_yaml::from_str(yaml)?;

    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let spec = WatchSpec::try_from((index, entry))?;
        if !seen.insert(spec.kind.clone()) {
            return Err(CoreError::InvalidWatch {
                index,
                message: format!("duplicate kind {}", spec.kind),
            });
        }
        specs.push(spec);
    }

    Ok(specs)
}

/// Load the watches file. Relative chart paths resolve against the file's
/// directory and must exist.
pub fn load_watches<P: AsRef<Path>>(path: P) -> Result<Vec<WatchSpec>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut specs = parse_watches(&content)?;
    for (index, spec) in specs.iter_mut().enumerate() {
        if spec.chart.is_relative() {
            spec.chart = base.join(&spec.chart);
        }
        if !spec.chart.exists() {
            return Err(CoreError::InvalidWatch {
                index,
                message: format!("chart path {} does not exist", spec.chart.display()),
            });
        }
    }

    tracing::debug!(path = %path.display(), watches = specs.len(), "loaded watches file");
    Ok(specs)
}
