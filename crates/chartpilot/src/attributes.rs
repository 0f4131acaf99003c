//! Release attributes recorded on the custom resource
//!
//! After every successful reconcile the operator writes what it deployed as
//! annotations on the resource. They are only read back as a whole: a
//! missing or malformed attribute makes the whole record absent.

use std::collections::BTreeMap;

use chartpilot_kube::StoredRelease;
use semver::Version;

pub const VALUES_DIGEST: &str = "chartpilot.io/values-digest";
pub const RELEASE_NAME: &str = "chartpilot.io/release-name";
pub const CHART_VERSION: &str = "chartpilot.io/chart-version";
pub const RELEASE_VERSION: &str = "chartpilot.io/release-version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAttributes {
    pub values_digest: String,
    pub release_name: String,
    pub chart_version: Version,
    pub release_version: u32,
}

impl ReleaseAttributes {
    pub fn from_release(release: &StoredRelease) -> Self {
        Self {
            values_digest: release.values_digest.clone(),
            release_name: release.name.clone(),
            chart_version: release.chart.version.clone(),
            release_version: release.version,
        }
    }

    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Option<Self> {
        let values_digest = annotations.get(VALUES_DIGEST)?;
        if values_digest.len() != 64 || !values_digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        let release_name = annotations.get(RELEASE_NAME).filter(|n| !n.is_empty())?;
        let chart_version = Version::parse(annotations.get(CHART_VERSION)?).ok()?;
        let release_version = annotations
            .get(RELEASE_VERSION)?
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)?;

        Some(Self {
            values_digest: values_digest.to_ascii_lowercase(),
            release_name: release_name.clone(),
            chart_version,
            release_version,
        })
    }

    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (VALUES_DIGEST.to_string(), self.values_digest.clone()),
            (RELEASE_NAME.to_string(), self.release_name.clone()),
            (CHART_VERSION.to_string(), self.chart_version.to_string()),
            (RELEASE_VERSION.to_string(), self.release_version.to_string()),
        ])
    }
}
