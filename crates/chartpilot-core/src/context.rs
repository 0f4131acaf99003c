//! Template rendering context

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::chart::ChartMetadata;
use crate::values::Values;

/// Name reported as `release.service` to templates
pub const RELEASE_SERVICE: &str = "chartpilot";

/// Context available to all templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateContext {
    /// Composed values
    pub values: JsonValue,

    /// Release information
    pub release: ReleaseInfo,

    /// Chart metadata
    pub chart: ChartInfo,

    /// Cluster capabilities
    pub capabilities: Capabilities,
}

/// Release information for templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub is_install: bool,
    pub is_upgrade: bool,
    pub service: String,
}

impl ReleaseInfo {
    /// Release info for a first revision
    pub fn for_install(name: &str, namespace: &str, revision: u32) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision,
            is_install: true,
            is_upgrade: false,
            service: RELEASE_SERVICE.to_string(),
        }
    }

    /// Release info for an upgrade or rollback revision
    pub fn for_upgrade(name: &str, namespace: &str, revision: u32) -> Self {
        Self {
            is_install: false,
            is_upgrade: true,
            ..Self::for_install(name, namespace, revision)
        }
    }
}

/// Chart information for templates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartInfo {
    pub name: String,
    pub version: String,
    pub app_version: Option<String>,
}

impl From<&ChartMetadata> for ChartInfo {
    fn from(meta: &ChartMetadata) -> Self {
        Self {
            name: meta.name.clone(),
            version: meta.version.to_string(),
            app_version: meta.app_version.clone(),
        }
    }
}

/// Cluster capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub kube_version: KubeVersion,
}

/// Kubernetes version info
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeVersion {
    pub version: String,
    pub major: String,
    pub minor: String,
}

impl Default for KubeVersion {
    fn default() -> Self {
        Self::new("v1.31.0")
    }
}

impl KubeVersion {
    /// Parse `v1.31.2`, `1.31` or a server-reported `1.31+` style version
    pub fn new(version: &str) -> Self {
        let version = version.trim_start_matches('v');
        let mut parts = version.split('.');
        let major = parts.next().filter(|p| !p.is_empty()).unwrap_or("1");
        let minor = parts.next().unwrap_or("31").trim_end_matches('+');

        Self {
            version: format!("v{}", version),
            major: major.to_string(),
            minor: minor.to_string(),
        }
    }
}

impl TemplateContext {
    pub fn new(values: &Values, release: ReleaseInfo, chart: &ChartMetadata) -> Self {
        Self {
            values: values.inner().clone(),
            release,
            chart: ChartInfo::from(chart),
            capabilities: Capabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Convert to a minijinja-compatible context
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}
