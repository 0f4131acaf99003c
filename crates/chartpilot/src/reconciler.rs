//! Reconcile loop for one watched kind
//!
//! Every reconcile reads the freshest state of the resource, composes its
//! values, asks the tracker what the release needs and lets the executor do
//! it. A successful live reconcile then:
//! 1. makes sure the finalizer is present
//! 2. records the deployed release on the resource's annotations
//! 3. extends the dependent watches to every rendered kind
//! 4. reports `Deployed` on the status
//!
//! A resource marked for deletion is uninstalled first; the finalizer is
//! only removed once the uninstall succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use chartpilot_core::{ComposedValues, LoadedChart, ValuesComposer, WatchSpec};
use chartpilot_kube::{
    ActionExecutor, InstallOptions, KubeError, StoredRelease, UninstallOptions, UpgradeOptions,
    manifest,
};
use tracing::{debug, info};

use crate::attributes::ReleaseAttributes;
use crate::client::ResourceClient;
use crate::dependents::DependentWatchRegistry;
use crate::dispatcher::{Action, Reconcile};
use crate::error::{Error, Result};
use crate::finalizer::{FINALIZER, FinalizerGuard};
use crate::identity::{ReconcileReason, ResourceKey};
use crate::resource::CustomResource;
use crate::status::{DeployedRelease, Report, StatusReporter};
use crate::tracker::{Decision, Desired, decide};

/// Everything a reconciler needs, shared by all workers of a watch
pub struct Reconciler {
    watch: Arc<WatchSpec>,
    chart: Arc<LoadedChart>,
    composer: ValuesComposer,
    executor: ActionExecutor,
    client: Arc<dyn ResourceClient>,
    finalizer: FinalizerGuard,
    status: StatusReporter,
    dependents: Arc<DependentWatchRegistry>,
}

/// What a successful live reconcile did
enum Applied {
    Installed,
    Upgraded,
    UpToDate,
}

impl Applied {
    fn reason(&self) -> &'static str {
        match self {
            Applied::Installed => "InstallSuccessful",
            Applied::Upgraded => "UpgradeSuccessful",
            Applied::UpToDate => "UpToDate",
        }
    }
}

impl Reconciler {
    pub fn new(
        watch: Arc<WatchSpec>,
        chart: Arc<LoadedChart>,
        executor: ActionExecutor,
        client: Arc<dyn ResourceClient>,
        dependents: Arc<DependentWatchRegistry>,
    ) -> Self {
        let composer = ValuesComposer::for_chart(&chart, watch.override_values().clone());
        Self {
            composer,
            finalizer: FinalizerGuard::new(client.clone()),
            status: StatusReporter::new(client.clone()),
            watch,
            chart,
            executor,
            client,
            dependents,
        }
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.status = self.status.with_span(span);
        self
    }

    async fn reconcile_live(&self, resource: &CustomResource) -> Result<Action> {
        let key = resource.key();
        let owner = key.owner();

        let composed = match resource.declared_values().and_then(|declared| {
            self.composer.compose(&declared).map_err(Error::from)
        }) {
            Ok(composed) => composed,
            Err(e) => {
                self.report_failure(resource, &e).await;
                return Err(e);
            }
        };

        let latest = self.executor.latest_release(&key.namespace, key.release_name()).await?;
        let decision = decide(
            &owner,
            latest.as_ref(),
            &Desired::Present {
                digest: &composed.digest,
                chart_version: self.chart.version(),
            },
        );
        debug!(resource = %key, ?decision, "release decision");

        let result = match (decision, latest) {
            (Decision::Install, _) => self
                .install(resource, &composed)
                .await
                .map(|release| (release, Applied::Installed)),
            (Decision::Upgrade, _) => self
                .upgrade(resource, &composed)
                .await
                .map(|release| (release, Applied::Upgraded)),
            (Decision::NoOp, Some(release)) => Ok((release, Applied::UpToDate)),
            (Decision::Irreconcilable { owner }, _) => Err(Error::ReleaseNameCollision {
                release: key.release_name().to_string(),
                namespace: key.namespace.clone(),
                owner,
            }),
            (decision, _) => Err(Error::InvalidResource(format!(
                "unexpected decision {decision:?} for a live resource"
            ))),
        };

        let (release, applied) = match result {
            Ok(done) => done,
            Err(e) => {
                self.report_failure(resource, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.after_success(resource, &release).await {
            self.report_failure(resource, &e).await;
            return Err(e);
        }

        let deployed = DeployedRelease::from_release(&release);
        let report = match applied {
            Applied::UpToDate => Report::UpToDate { release: deployed },
            _ => {
                info!(
                    resource = %key,
                    version = release.version,
                    action = applied.reason(),
                    "release reconciled"
                );
                Report::Deployed {
                    reason: applied.reason(),
                    message: format!("release {} deployed at revision {}", release.name, release.version),
                    release: deployed,
                }
            }
        };
        self.status.report(resource, &report).await;

        Ok(Action::await_change())
    }

    async fn install(&self, resource: &CustomResource, composed: &ComposedValues) -> Result<StoredRelease> {
        let key = resource.key();
        let options = InstallOptions::new(key.release_name(), &key.namespace)
            .with_owner(key.owner())
            .from_annotations(resource.annotations(), self.watch.annotations());
        let outcome = self.executor.install(&self.chart, composed, &options).await?;
        Ok(outcome.release)
    }

    async fn upgrade(&self, resource: &CustomResource, composed: &ComposedValues) -> Result<StoredRelease> {
        let key = resource.key();
        let options = UpgradeOptions::new(key.release_name(), &key.namespace)
            .with_owner(key.owner())
            .from_annotations(resource.annotations(), self.watch.annotations());
        let outcome = self.executor.upgrade(&self.chart, composed, &options).await?;
        Ok(outcome.release)
    }

    /// Finalizer, release attributes and dependent watches after a live success
    ///
    /// The finalizer goes first: once a release exists nothing may let the
    /// resource be deleted without an uninstall.
    async fn after_success(&self, resource: &CustomResource, release: &StoredRelease) -> Result<()> {
        let key = resource.key();

        self.finalizer.ensure(key, resource.object()).await?;

        let attributes = ReleaseAttributes::from_release(release);
        if resource.attributes().as_ref() != Some(&attributes) {
            self.client
                .patch_annotations(&key.namespace, &key.name, &attributes.to_annotations())
                .await?;
        }

        if self.watch.watch_dependent_resources() {
            let objects = manifest::parse_objects(&release.manifest)?;
            self.dependents
                .ensure(self.watch.kind(), &manifest::kinds(&objects))
                .await?;
        }
        Ok(())
    }

    async fn reconcile_deletion(&self, resource: &CustomResource) -> Result<Action> {
        let key = resource.key();
        let latest = self.executor.latest_release(&key.namespace, key.release_name()).await?;

        if decide(&key.owner(), latest.as_ref(), &Desired::Deleted) == Decision::Uninstall {
            let options = UninstallOptions::new(key.release_name(), &key.namespace)
                .from_annotations(resource.annotations(), self.watch.annotations());
            match self.executor.uninstall(&options).await {
                Ok(outcome) => {
                    info!(resource = %key, version = outcome.release.version, "release uninstalled");
                }
                Err(KubeError::ReleaseNotFound { .. }) => {}
                Err(e) => {
                    let e = Error::from(e);
                    self.report_failure(resource, &e).await;
                    return Err(Error::UninstallFailed(Box::new(e)));
                }
            }
        }

        if resource.has_finalizer(FINALIZER) {
            self.finalizer
                .release(key, resource.object())
                .await
                .map_err(|e| Error::UninstallFailed(Box::new(e)))?;
        }
        Ok(Action::await_change())
    }

    async fn report_failure(&self, resource: &CustomResource, error: &Error) {
        let irreconcilable = matches!(
            error,
            Error::Values(_) | Error::ReleaseNameCollision { .. } | Error::InvalidResource(_)
        ) || matches!(error, Error::Release(KubeError::Values(_)));
        let report = Report::Failed {
            reason: error.reason(),
            message: error.to_string(),
            irreconcilable,
        };
        self.status.report(resource, &report).await;
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &ResourceKey, reason: ReconcileReason) -> Result<Action> {
        let Some(object) = self.client.get(&key.namespace, &key.name).await? else {
            debug!(resource = %key, %reason, "resource is gone");
            return Ok(Action::forget());
        };
        let resource = CustomResource::new(key.kind.clone(), object)?;

        if resource.is_deleting() {
            return self.reconcile_deletion(&resource).await;
        }
        self.reconcile_live(&resource).await
    }
}
