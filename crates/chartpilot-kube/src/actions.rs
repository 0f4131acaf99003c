//! Options for install, upgrade, uninstall and rollback actions
//!
//! Options are derived from the custom resource's annotations, restricted to
//! the annotations the watch enables for each action.

use std::collections::BTreeMap;

use chartpilot_core::{ActionAnnotation, ActionAnnotations, ActionKind};

use crate::annotations::{action_annotation, parse_bool};
use crate::manifest::ObjectRef;
use crate::release::{ReleaseOwner, StoredRelease};

/// Default number of revisions kept per release
pub const DEFAULT_MAX_HISTORY: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub name: String,
    pub namespace: String,
    pub owner: Option<ReleaseOwner>,
    /// Stored on the release revision
    pub description: Option<String>,
}

impl InstallOptions {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            owner: None,
            description: None,
        }
    }

    pub fn with_owner(mut self, owner: ReleaseOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn from_annotations(
        mut self,
        annotations: &BTreeMap<String, String>,
        enabled: &ActionAnnotations,
    ) -> Self {
        if let Some(description) = action_annotation(
            annotations,
            &enabled.install,
            ActionKind::Install,
            ActionAnnotation::InstallDescription,
        ) {
            self.description = Some(description.to_string());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeOptions {
    pub name: String,
    pub namespace: String,
    pub owner: Option<ReleaseOwner>,
    /// Recreate objects whose update is rejected
    pub force: bool,
    pub description: Option<String>,
    pub max_history: u32,
}

impl UpgradeOptions {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            owner: None,
            force: false,
            description: None,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    pub fn with_owner(mut self, owner: ReleaseOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_max_history(mut self, max_history: u32) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn from_annotations(
        mut self,
        annotations: &BTreeMap<String, String>,
        enabled: &ActionAnnotations,
    ) -> Self {
        if let Some(force) = action_annotation(
            annotations,
            &enabled.upgrade,
            ActionKind::Upgrade,
            ActionAnnotation::UpgradeForce,
        ) {
            self.force = parse_bool(force);
        }
        if let Some(description) = action_annotation(
            annotations,
            &enabled.upgrade,
            ActionKind::Upgrade,
            ActionAnnotation::UpgradeDescription,
        ) {
            self.description = Some(description.to_string());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallOptions {
    pub name: String,
    pub namespace: String,
    /// Keep the history, marking the last revision `uninstalled`
    pub keep_history: bool,
    pub description: Option<String>,
}

impl UninstallOptions {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            keep_history: false,
            description: None,
        }
    }

    pub fn keep_history(mut self) -> Self {
        self.keep_history = true;
        self
    }

    pub fn from_annotations(
        mut self,
        annotations: &BTreeMap<String, String>,
        enabled: &ActionAnnotations,
    ) -> Self {
        if let Some(keep) = action_annotation(
            annotations,
            &enabled.uninstall,
            ActionKind::Uninstall,
            ActionAnnotation::UninstallKeepHistory,
        ) {
            self.keep_history = parse_bool(keep);
        }
        if let Some(description) = action_annotation(
            annotations,
            &enabled.uninstall,
            ActionKind::Uninstall,
            ActionAnnotation::UninstallDescription,
        ) {
            self.description = Some(description.to_string());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOptions {
    pub name: String,
    pub namespace: String,
    /// Target revision (0 = previous deployed revision)
    pub revision: u32,
    pub max_history: u32,
}

impl RollbackOptions {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            revision: 0,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    pub fn to_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }
}

/// Result of a successful action
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// Release record after the action. For an uninstall that dropped the
    /// history this is the last revision as it was removed.
    pub release: StoredRelease,

    /// Objects of the rendered manifest
    pub objects: Vec<ObjectRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_upgrade_from_annotations() {
        let cr = annotations(&[
            ("chartpilot.io/upgrade-force", "true"),
            ("chartpilot.io/upgrade-description", "bump"),
        ]);
        let opts = UpgradeOptions::new("app", "ns").from_annotations(&cr, &ActionAnnotations::default());
        assert!(opts.force);
        assert_eq!(opts.description.as_deref(), Some("bump"));
        assert_eq!(opts.max_history, 10);
    }

    #[test]
    fn test_disabled_annotation_is_ignored() {
        let cr = annotations(&[("chartpilot.io/upgrade-force", "true")]);
        let enabled = ActionAnnotations {
            upgrade: vec![ActionAnnotation::UpgradeDescription],
            ..Default::default()
        };
        let opts = UpgradeOptions::new("app", "ns").from_annotations(&cr, &enabled);
        assert!(!opts.force);
    }

    #[test]
    fn test_uninstall_keep_history() {
        let cr = annotations(&[("chartpilot.io/uninstall-keep-history", "yes")]);
        let opts = UninstallOptions::new("app", "ns").from_annotations(&cr, &ActionAnnotations::default());
        assert!(opts.keep_history);
    }

    #[test]
    fn test_install_description() {
        let cr = annotations(&[("chartpilot.io/install-description", "first")]);
        let opts = InstallOptions::new("app", "ns").from_annotations(&cr, &ActionAnnotations::default());
        assert_eq!(opts.description.as_deref(), Some("first"));
    }
}
