//! Decides which release action a resource needs

use chartpilot_kube::{ReleaseOwner, ReleaseState, StoredRelease};
use semver::Version;

/// What the resource declares
#[derive(Debug, Clone, Copy)]
pub enum Desired<'a> {
    /// The resource is marked for deletion
    Deleted,
    /// The resource is live with these composed values
    Present {
        digest: &'a str,
        chart_version: &'a Version,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NoOp,
    Install,
    Upgrade,
    Uninstall,
    /// The release belongs to another resource
    Irreconcilable { owner: String },
}

/// Compare what a resource declares with the latest release revision
pub fn decide(owner: &ReleaseOwner, latest: Option<&StoredRelease>, desired: &Desired<'_>) -> Decision {
    let live = latest.filter(|r| r.state != ReleaseState::Uninstalled);

    let Some(release) = live else {
        return match desired {
            Desired::Deleted => Decision::NoOp,
            Desired::Present { .. } => Decision::Install,
        };
    };

    let owned = release.owner.as_ref().is_some_and(|o| o.same_resource(owner));
    if !owned {
        let holder = release
            .owner
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "an unknown owner".to_string());
        return match desired {
            // Never uninstall somebody else's release
            Desired::Deleted => Decision::NoOp,
            Desired::Present { .. } => Decision::Irreconcilable { owner: holder },
        };
    }

    match desired {
        Desired::Deleted => Decision::Uninstall,
        Desired::Present { .. } if release.state.is_failed() || release.state.is_pending() => {
            Decision::Upgrade
        }
        Desired::Present {
            digest,
            chart_version,
        } => {
            if release.values_digest != *digest || release.chart.version != **chart_version {
                Decision::Upgrade
            } else {
                Decision::NoOp
            }
        }
    }
}
