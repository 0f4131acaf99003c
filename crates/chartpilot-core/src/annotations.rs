//! Action annotations recognized on custom resources
//!
//! Each watch carries, per release action, the list of annotations that may
//! adjust that action's options. The keys live under `chartpilot.io/`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Release action an annotation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Install,
    Upgrade,
    Uninstall,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Upgrade => write!(f, "upgrade"),
            Self::Uninstall => write!(f, "uninstall"),
        }
    }
}

/// An annotation that tweaks a release action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActionAnnotation {
    /// Free-form description stored on the install revision
    InstallDescription,
    /// `"true"` recreates objects whose update is rejected
    UpgradeForce,
    /// Free-form description stored on the upgrade revision
    UpgradeDescription,
    /// Free-form description logged on uninstall
    UninstallDescription,
    /// `"true"` keeps the release history as `uninstalled`
    UninstallKeepHistory,
}

impl ActionAnnotation {
    pub const ALL: [ActionAnnotation; 5] = [
        Self::InstallDescription,
        Self::UpgradeForce,
        Self::UpgradeDescription,
        Self::UninstallDescription,
        Self::UninstallKeepHistory,
    ];

    /// Annotation key on the custom resource
    pub const fn key(self) -> &'static str {
        match self {
            Self::InstallDescription => "chartpilot.io/install-description",
            Self::UpgradeForce => "chartpilot.io/upgrade-force",
            Self::UpgradeDescription => "chartpilot.io/upgrade-description",
            Self::UninstallDescription => "chartpilot.io/uninstall-description",
            Self::UninstallKeepHistory => "chartpilot.io/uninstall-keep-history",
        }
    }

    pub const fn action(self) -> ActionKind {
        match self {
            Self::InstallDescription => ActionKind::Install,
            Self::UpgradeForce | Self::UpgradeDescription => ActionKind::Upgrade,
            Self::UninstallDescription | Self::UninstallKeepHistory => ActionKind::Uninstall,
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.key() == key)
    }
}

impl TryFrom<String> for ActionAnnotation {
    type Error = String;

    fn try_from(key: String) -> Result<Self, Self::Error> {
        Self::from_key(&key).ok_or_else(|| format!("unknown action annotation '{}'", key))
    }
}

impl From<ActionAnnotation> for String {
    fn from(annotation: ActionAnnotation) -> Self {
        annotation.key().to_string()
    }
}

/// Annotations enabled for each action of one watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionAnnotations {
    pub install: Vec<ActionAnnotation>,
    pub upgrade: Vec<ActionAnnotation>,
    pub uninstall: Vec<ActionAnnotation>,
}

impl Default for ActionAnnotations {
    fn default() -> Self {
        Self {
            install: vec![ActionAnnotation::InstallDescription],
            upgrade: vec![
                ActionAnnotation::UpgradeForce,
                ActionAnnotation::UpgradeDescription,
            ],
            uninstall: vec![
                ActionAnnotation::UninstallDescription,
                ActionAnnotation::UninstallKeepHistory,
            ],
        }
    }
}

impl ActionAnnotations {
    pub fn for_action(&self, action: ActionKind) -> &[ActionAnnotation] {
        match action {
            ActionKind::Install => &self.install,
            ActionKind::Upgrade => &self.upgrade,
            ActionKind::Uninstall => &self.uninstall,
        }
    }

    /// First annotation listed under the wrong action, if any
    pub fn misplaced(&self) -> Option<(ActionKind, ActionAnnotation)> {
        [ActionKind::Install, ActionKind::Upgrade, ActionKind::Uninstall]
            .into_iter()
            .flat_map(|action| {
                self.for_action(action)
                    .iter()
                    .filter(move |a| a.action() != action)
                    .map(move |a| (action, *a))
            })
            .next()
    }
}
