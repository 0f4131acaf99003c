//! Release actions with per-release mutual exclusion
//!
//! [`ActionExecutor`] drives install, upgrade, uninstall and rollback against
//! a [`StorageDriver`], a [`ResourceApplier`] and a [`Renderer`]. Every action
//! holds the release's lock for its whole duration; the guard is dropped on
//! every exit path.
//!
//! Revision lifecycle:
//! - install: `pending-install` -> `deployed` | `failed`
//! - upgrade: previous `deployed` -> `superseded`, new `pending-upgrade` ->
//!   `deployed` | `failed`; objects dropped from the manifest are deleted
//! - uninstall: `pending-uninstall`, objects deleted, then the history is
//!   dropped (or kept as `uninstalled`)
//! - rollback: a new `pending-rollback` revision re-deploying an older one
//!
//! A pending revision older than its timeout is considered stuck. The next
//! upgrade marks it `failed` and makes one corrective attempt; if that attempt
//! fails the error is reported as [`KubeError::StuckRelease`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chartpilot_core::{Capabilities, ComposedValues, LoadedChart, ReleaseInfo, TemplateContext};
use chartpilot_engine::Renderer;
use kube::api::DynamicObject;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::actions::{
    ActionOutcome, InstallOptions, RollbackOptions, UninstallOptions, UpgradeOptions,
};
use crate::applier::{ApplyOptions, ResourceApplier};
use crate::error::{KubeError, Result};
use crate::manifest::{ObjectRef, inject_ownership, parse_objects};
use crate::release::{ReleaseOwner, ReleaseState, StoredRelease};
use crate::storage::StorageDriver;

type ReleaseKey = (String, String);

/// Per-release async locks, pruned when idle
#[derive(Default)]
struct ReleaseLocks {
    locks: Mutex<HashMap<ReleaseKey, Arc<AsyncMutex<()>>>>,
}

/// Exclusive access to one release until dropped
pub struct ReleaseGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ReleaseLocks {
    async fn acquire(&self, namespace: &str, name: &str) -> ReleaseGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Only the map holds an idle lock
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry((namespace.to_string(), name.to_string()))
                .or_default()
                .clone()
        };
        ReleaseGuard {
            _guard: lock.lock_owned().await,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Rendered, ownership-stamped manifest of one revision
struct Rendered {
    manifest: String,
    notes: Option<String>,
    objects: Vec<DynamicObject>,
}

#[derive(Clone)]
pub struct ActionExecutor {
    storage: Arc<dyn StorageDriver>,
    applier: Arc<dyn ResourceApplier>,
    renderer: Arc<dyn Renderer>,
    capabilities: Capabilities,
    locks: Arc<ReleaseLocks>,
    span: Span,
}

impl ActionExecutor {
    pub fn new(
        storage: Arc<dyn StorageDriver>,
        applier: Arc<dyn ResourceApplier>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            storage,
            applier,
            renderer,
            capabilities: Capabilities::default(),
            locks: Arc::new(ReleaseLocks::default()),
            span: Span::none(),
        }
    }

    /// Cluster capabilities exposed to templates
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Parent span of every action
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Exclusive access to a release, for callers that must read and act atomically
    pub async fn lock(&self, namespace: &str, name: &str) -> ReleaseGuard {
        self.locks.acquire(namespace, name).await
    }

    /// Latest revision of a release, if any
    pub async fn latest_release(&self, namespace: &str, name: &str) -> Result<Option<StoredRelease>> {
        self.storage.find_latest(namespace, name).await
    }

    fn action_span(&self, action: &'static str, namespace: &str, name: &str) -> Span {
        info_span!(parent: &self.span, "release_action", action, namespace, release = name)
    }

    fn render(
        &self,
        chart: &LoadedChart,
        values: &ComposedValues,
        release: ReleaseInfo,
        owner: Option<&ReleaseOwner>,
    ) -> Result<Rendered> {
        let context = TemplateContext::new(&values.values, release, &chart.metadata)
            .with_capabilities(self.capabilities.clone());
        let result = self.renderer.render(chart, &context)?;

        let manifest = match owner {
            Some(owner) => inject_ownership(&result.manifests, owner)?,
            None => result.combined(),
        };
        let objects = parse_objects(&manifest)?;

        Ok(Rendered {
            manifest,
            notes: result.notes,
            objects,
        })
    }

    /// Apply objects; on failure the revision is recorded as `failed`
    async fn apply_or_fail(
        &self,
        release: &mut StoredRelease,
        objects: &[DynamicObject],
        options: &ApplyOptions,
    ) -> Result<()> {
        let failure = match self.applier.apply(&release.namespace, objects, options).await {
            Ok(summary) if summary.is_success() => {
                debug!(result = %summary.summary(), "manifest applied");
                return Ok(());
            }
            Ok(summary) => KubeError::ApplyFailed {
                failures: summary.failed,
            },
            Err(e) => e,
        };

        release.mark_failed(failure.to_string());
        self.storage.update(release).await?;
        Err(failure)
    }

    /// Delete objects of `previous` no longer present in `current`
    async fn delete_orphans(&self, namespace: &str, previous: &str, current: &[DynamicObject]) {
        let previous = match parse_objects(previous) {
            Ok(objects) => objects,
            Err(e) => {
                warn!(error = %e, "previous manifest unreadable, skipping orphan cleanup");
                return;
            }
        };

        let keep = refs_in(current, namespace);
        let orphans: Vec<DynamicObject> = previous
            .into_iter()
            .filter(|obj| qualified_ref(obj, namespace).is_some_and(|r| !keep.contains(&r)))
            .collect();
        if orphans.is_empty() {
            return;
        }

        match self.applier.delete(namespace, &orphans).await {
            Ok(summary) if summary.is_success() => {
                debug!(result = %summary.summary(), "orphaned objects deleted")
            }
            Ok(summary) => warn!(failed = ?summary.failed, "some orphaned objects were not deleted"),
            Err(e) => warn!(error = %e, "orphan cleanup failed"),
        }
    }

    /// Keep the newest `max_history` revisions (0 keeps everything)
    async fn prune_history(&self, namespace: &str, name: &str, max_history: u32) {
        if max_history == 0 {
            return;
        }
        let history = match self.storage.history(namespace, name).await {
            Ok(history) => history,
            Err(e) => {
                warn!(error = %e, "cannot list history for pruning");
                return;
            }
        };

        for old in history.iter().skip(max_history as usize) {
            if old.state.is_pending() {
                continue;
            }
            if let Err(e) = self.storage.delete(namespace, name, old.version).await {
                warn!(version = old.version, error = %e, "failed to prune revision");
            }
        }
    }

    pub async fn install(
        &self,
        chart: &LoadedChart,
        values: &ComposedValues,
        options: &InstallOptions,
    ) -> Result<ActionOutcome> {
        let span = self.action_span("install", &options.namespace, &options.name);
        self.install_locked(chart, values, options).instrument(span).await
    }

    async fn install_locked(
        &self,
        chart: &LoadedChart,
        values: &ComposedValues,
        options: &InstallOptions,
    ) -> Result<ActionOutcome> {
        let _guard = self.locks.acquire(&options.namespace, &options.name).await;

        let version = match self.storage.find_latest(&options.namespace, &options.name).await? {
            None => 1,
            Some(latest) if latest.state == ReleaseState::Uninstalled => latest.version + 1,
            Some(_) => {
                return Err(KubeError::ReleaseAlreadyExists {
                    name: options.name.clone(),
                    namespace: options.namespace.clone(),
                });
            }
        };

        let rendered = self.render(
            chart,
            values,
            ReleaseInfo::for_install(&options.name, &options.namespace, version),
            options.owner.as_ref(),
        )?;

        let mut release = StoredRelease::for_install(
            &options.name,
            &options.namespace,
            version,
            chart.metadata.clone(),
            values.values.clone(),
            values.digest.clone(),
            rendered.manifest,
        );
        release.owner = options.owner.clone();
        release.description = options.description.clone();
        release.notes = rendered.notes;

        // A concurrent creator of the same revision loses here
        self.storage.create(&release).await?;

        self.apply_or_fail(&mut release, &rendered.objects, &ApplyOptions::default())
            .await?;

        release.mark_deployed();
        self.storage.update(&release).await?;

        info!(version, chart = %chart.name(), "release installed");
        Ok(ActionOutcome {
            objects: refs_of(&rendered.objects),
            release,
        })
    }

    pub async fn upgrade(
        &self,
        chart: &LoadedChart,
        values: &ComposedValues,
        options: &UpgradeOptions,
    ) -> Result<ActionOutcome> {
        let span = self.action_span("upgrade", &options.namespace, &options.name);
        self.upgrade_locked(chart, values, options).instrument(span).await
    }

    async fn upgrade_locked(
        &self,
        chart: &LoadedChart,
        values: &ComposedValues,
        options: &UpgradeOptions,
    ) -> Result<ActionOutcome> {
        let _guard = self.locks.acquire(&options.namespace, &options.name).await;

        let current = self.storage.get_latest(&options.namespace, &options.name).await?;
        if current.state == ReleaseState::Uninstalled {
            return Err(KubeError::ReleaseNotFound {
                name: options.name.clone(),
                namespace: options.namespace.clone(),
            });
        }

        if !current.state.is_pending() {
            return self.upgrade_from(chart, values, options, current).await;
        }

        if !current.state.is_stale() {
            return Err(KubeError::OperationInProgress {
                name: current.name.clone(),
                status: current.state.to_string(),
            });
        }

        let status = current.state.status_name().to_string();
        let elapsed = current
            .state
            .elapsed()
            .map(|d| format!("{}s", d.num_seconds()))
            .unwrap_or_else(|| "unknown".to_string());
        warn!(version = current.version, %status, %elapsed, "recovering stuck release");

        let mut stuck = current;
        stuck.mark_failed(format!("{} timed out after {}", status, elapsed));
        self.storage.update(&stuck).await?;

        match self.upgrade_from(chart, values, options, stuck).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_permanent() => Err(e),
            Err(e) => Err(KubeError::StuckRelease {
                name: options.name.clone(),
                status,
                elapsed,
                message: e.to_string(),
            }),
        }
    }

    async fn upgrade_from(
        &self,
        chart: &LoadedChart,
        values: &ComposedValues,
        options: &UpgradeOptions,
        previous: StoredRelease,
    ) -> Result<ActionOutcome> {
        let owner = options.owner.clone().or_else(|| previous.owner.clone());
        let rendered = self.render(
            chart,
            values,
            ReleaseInfo::for_upgrade(&options.name, &options.namespace, previous.version + 1),
            owner.as_ref(),
        )?;

        let mut release = StoredRelease::for_upgrade(
            &previous,
            chart.metadata.clone(),
            values.values.clone(),
            values.digest.clone(),
            rendered.manifest,
        );
        release.owner = owner;
        release.description = options.description.clone();
        release.notes = rendered.notes;

        self.storage.create(&release).await?;

        if previous.state == ReleaseState::Deployed {
            let mut superseded = previous.clone();
            superseded.mark_superseded();
            self.storage.update(&superseded).await?;
        }

        let apply_options = ApplyOptions {
            force: options.force,
        };
        self.apply_or_fail(&mut release, &rendered.objects, &apply_options)
            .await?;
        self.delete_orphans(&options.namespace, &previous.manifest, &rendered.objects)
            .await;

        release.mark_deployed();
        self.storage.update(&release).await?;
        self.prune_history(&options.namespace, &options.name, options.max_history)
            .await;

        info!(
            version = release.version,
            previous = previous.version,
            chart = %chart.name(),
            "release upgraded"
        );
        Ok(ActionOutcome {
            objects: refs_of(&rendered.objects),
            release,
        })
    }

    pub async fn uninstall(&self, options: &UninstallOptions) -> Result<ActionOutcome> {
        let span = self.action_span("uninstall", &options.namespace, &options.name);
        self.uninstall_locked(options).instrument(span).await
    }

    async fn uninstall_locked(&self, options: &UninstallOptions) -> Result<ActionOutcome> {
        let _guard = self.locks.acquire(&options.namespace, &options.name).await;

        let mut release = self.storage.get_latest(&options.namespace, &options.name).await?;
        if release.state == ReleaseState::Uninstalled {
            debug!("release already uninstalled");
            return Ok(ActionOutcome {
                release,
                objects: Vec::new(),
            });
        }

        release.mark_pending_uninstall();
        if options.description.is_some() {
            release.description = options.description.clone();
        }
        self.storage.update(&release).await?;

        let objects = parse_objects(&release.manifest).unwrap_or_else(|e| {
            warn!(error = %e, "stored manifest unreadable, no objects to delete");
            Vec::new()
        });

        let summary = self.applier.delete(&options.namespace, &objects).await?;
        if !summary.is_success() {
            return Err(KubeError::DeleteFailed {
                failures: summary.failed,
            });
        }

        if options.keep_history {
            release.mark_uninstalled();
            self.storage.update(&release).await?;
        } else {
            self.storage
                .delete_all(&options.namespace, &options.name)
                .await?;
            release.mark_uninstalled();
        }

        info!(
            version = release.version,
            keep_history = options.keep_history,
            result = %summary.summary(),
            "release uninstalled"
        );
        Ok(ActionOutcome {
            objects: refs_of(&objects),
            release,
        })
    }

    pub async fn rollback(&self, options: &RollbackOptions) -> Result<ActionOutcome> {
        let span = self.action_span("rollback", &options.namespace, &options.name);
        self.rollback_locked(options).instrument(span).await
    }

    async fn rollback_locked(&self, options: &RollbackOptions) -> Result<ActionOutcome> {
        let _guard = self.locks.acquire(&options.namespace, &options.name).await;

        let history = self.storage.history(&options.namespace, &options.name).await?;
        let current = history.first().cloned().ok_or_else(|| KubeError::ReleaseNotFound {
            name: options.name.clone(),
            namespace: options.namespace.clone(),
        })?;

        if current.state.is_pending() && !current.state.is_stale() {
            return Err(KubeError::OperationInProgress {
                name: current.name.clone(),
                status: current.state.to_string(),
            });
        }

        let not_possible = |reason: String| KubeError::RollbackNotPossible {
            name: options.name.clone(),
            reason,
        };
        let target = if options.revision == 0 {
            history
                .iter()
                .skip(1)
                .find(|r| r.state.was_deployed())
                .ok_or_else(|| not_possible("no previous deployed revision".to_string()))?
        } else {
            history
                .iter()
                .find(|r| r.version == options.revision)
                .filter(|r| r.version != current.version)
                .ok_or_else(|| not_possible(format!("revision {} not available", options.revision)))?
        };

        let objects = parse_objects(&target.manifest)?;
        let mut release = StoredRelease::for_rollback(&current, target);
        self.storage.create(&release).await?;

        if current.state == ReleaseState::Deployed {
            let mut superseded = current.clone();
            superseded.mark_superseded();
            self.storage.update(&superseded).await?;
        }

        self.apply_or_fail(&mut release, &objects, &ApplyOptions::default())
            .await?;
        self.delete_orphans(&options.namespace, &current.manifest, &objects)
            .await;

        release.mark_deployed();
        self.storage.update(&release).await?;
        self.prune_history(&options.namespace, &options.name, options.max_history)
            .await;

        info!(version = release.version, target = target.version, "release rolled back");
        Ok(ActionOutcome {
            objects: refs_of(&objects),
            release,
        })
    }
}

fn refs_of(objects: &[DynamicObject]) -> Vec<ObjectRef> {
    objects
        .iter()
        .filter_map(|obj| ObjectRef::from_object(obj).ok())
        .collect()
}

/// Object reference with the release namespace filled in
fn qualified_ref(obj: &DynamicObject, namespace: &str) -> Option<ObjectRef> {
    let mut r = ObjectRef::from_object(obj).ok()?;
    r.namespace.get_or_insert_with(|| namespace.to_string());
    Some(r)
}

fn refs_in(objects: &[DynamicObject], namespace: &str) -> BTreeSet<ObjectRef> {
    objects
        .iter()
        .filter_map(|obj| qualified_ref(obj, namespace))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::MockApplier;
    use crate::storage::MockStorageDriver;
    use chartpilot_core::{ChartMetadata, KindIdentifier, Values, ValuesComposer};
    use chartpilot_engine::Engine;
    use chrono::{Duration, Utc};
    use semver::Version;
    use serde_json::json;

    const CONFIGMAP: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ release.name }}-cfg
data:
  replicas: "{{ values.replicaCount }}"
"#;

    const SECRET: &str = r#"{% if values.withSecret %}apiVersion: v1
kind: Secret
metadata:
  name: {{ release.name }}-secret
{% endif %}"#;

    fn chart() -> LoadedChart {
        LoadedChart::from_parts(
            ChartMetadata::new("nginx", Version::new(0, 1, 0)),
            Values(json!({"replicaCount": 1, "withSecret": true})),
            [
                ("configmap.yaml".to_string(), CONFIGMAP.to_string()),
                ("secret.yaml".to_string(), SECRET.to_string()),
            ],
        )
    }

    fn values(declared: serde_json::Value) -> ComposedValues {
        ValuesComposer::for_chart(&chart(), Values::new())
            .compose(&Values(declared))
            .unwrap()
    }

    fn owner() -> ReleaseOwner {
        ReleaseOwner::new(&KindIdentifier::new("example.com", "v1", "TestApp"), "default", "app")
    }

    struct Fixture {
        storage: MockStorageDriver,
        applier: MockApplier,
        executor: ActionExecutor,
    }

    fn fixture_with(storage: MockStorageDriver, applier: MockApplier) -> Fixture {
        let executor = ActionExecutor::new(
            Arc::new(storage.clone()),
            Arc::new(applier.clone()),
            Arc::new(Engine::default()),
        );
        Fixture {
            storage,
            applier,
            executor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockStorageDriver::new(), MockApplier::new())
    }

    fn install_opts() -> InstallOptions {
        InstallOptions::new("app", "default").with_owner(owner())
    }

    #[tokio::test]
    async fn test_install() {
        let f = fixture();
        let outcome = f
            .executor
            .install(&chart(), &values(json!({"replicaCount": 3})), &install_opts())
            .await
            .unwrap();

        assert_eq!(outcome.release.version, 1);
        assert_eq!(outcome.release.state, ReleaseState::Deployed);
        assert_eq!(outcome.objects.len(), 2);

        let cm = f.applier.live_object("default", "ConfigMap", "app-cfg").unwrap();
        assert_eq!(cm.data["data"]["replicas"], "3");
        let annotations = cm.metadata.annotations.unwrap();
        assert_eq!(annotations["chartpilot.io/owner-name"], "app");

        let stored = f.storage.get_latest("default", "app").await.unwrap();
        assert_eq!(stored.state, ReleaseState::Deployed);
        assert_eq!(stored.values_digest, values(json!({"replicaCount": 3})).digest);
    }

    #[tokio::test]
    async fn test_install_twice_is_rejected() {
        let f = fixture();
        let v = values(json!({}));
        f.executor.install(&chart(), &v, &install_opts()).await.unwrap();

        let err = f.executor.install(&chart(), &v, &install_opts()).await.unwrap_err();
        assert!(matches!(err, KubeError::ReleaseAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_installs() {
        let f = fixture_with(
            MockStorageDriver::new(),
            MockApplier::new().with_delay(std::time::Duration::from_millis(20)),
        );
        let chart = chart();
        let v = values(json!({}));
        let opts = install_opts();

        let (a, b) = tokio::join!(
            f.executor.install(&chart, &v, &opts),
            f.executor.install(&chart, &v, &opts)
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(KubeError::ReleaseAlreadyExists { .. }))));
        assert_eq!(f.storage.release_count(), 1);
    }

    #[tokio::test]
    async fn test_apply_failure_marks_failed() {
        let f = fixture();
        f.applier.fail_kind("Secret");

        let err = f
            .executor
            .install(&chart(), &values(json!({})), &install_opts())
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::ApplyFailed { .. }));

        let stored = f.storage.get_latest("default", "app").await.unwrap();
        assert!(stored.state.is_failed());
    }

    #[tokio::test]
    async fn test_upgrade_supersedes_and_deletes_orphans() {
        let f = fixture();
        f.executor
            .install(&chart(), &values(json!({})), &install_opts())
            .await
            .unwrap();
        assert!(f.applier.live_object("default", "Secret", "app-secret").is_some());

        let outcome = f
            .executor
            .upgrade(
                &chart(),
                &values(json!({"replicaCount": 5, "withSecret": false})),
                &UpgradeOptions::new("app", "default"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.release.version, 2);
        assert_eq!(outcome.release.owner, Some(owner()));
        assert!(f.applier.live_object("default", "Secret", "app-secret").is_none());

        let first = f.storage.get("default", "app", 1).await.unwrap();
        assert_eq!(first.state, ReleaseState::Superseded);
    }

    #[tokio::test]
    async fn test_upgrade_blocked_by_fresh_pending() {
        let mut pending = StoredRelease::for_install(
            "app",
            "default",
            1,
            chart().metadata,
            Values::new(),
            String::new(),
            String::new(),
        );
        pending.state = ReleaseState::PendingUpgrade {
            started_at: Utc::now(),
            timeout: Duration::minutes(5),
            previous_version: 0,
        };
        let f = fixture_with(MockStorageDriver::with_releases([pending]), MockApplier::new());

        let err = f
            .executor
            .upgrade(&chart(), &values(json!({})), &UpgradeOptions::new("app", "default"))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::OperationInProgress { .. }));
    }

    #[tokio::test]
    async fn test_upgrade_recovers_stale_pending() {
        let mut stuck = StoredRelease::for_install(
            "app",
            "default",
            1,
            chart().metadata,
            Values::new(),
            String::new(),
            String::new(),
        );
        stuck.state = ReleaseState::PendingInstall {
            started_at: Utc::now() - Duration::minutes(30),
            timeout: Duration::minutes(5),
        };
        let f = fixture_with(MockStorageDriver::with_releases([stuck]), MockApplier::new());

        let outcome = f
            .executor
            .upgrade(&chart(), &values(json!({})), &UpgradeOptions::new("app", "default"))
            .await
            .unwrap();
        assert_eq!(outcome.release.version, 2);
        assert!(f.storage.get("default", "app", 1).await.unwrap().state.is_failed());
    }

    #[tokio::test]
    async fn test_stale_pending_with_failing_retry_is_stuck() {
        let mut stuck = StoredRelease::for_install(
            "app",
            "default",
            1,
            chart().metadata,
            Values::new(),
            String::new(),
            String::new(),
        );
        stuck.state = ReleaseState::PendingInstall {
            started_at: Utc::now() - Duration::minutes(30),
            timeout: Duration::minutes(5),
        };
        let applier = MockApplier::new();
        applier.fail_kind("ConfigMap");
        let f = fixture_with(MockStorageDriver::with_releases([stuck]), applier);

        let err = f
            .executor
            .upgrade(&chart(), &values(json!({})), &UpgradeOptions::new("app", "default"))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::StuckRelease { ref status, .. } if status == "pending-install"));
    }

    #[tokio::test]
    async fn test_uninstall_drops_history() {
        let f = fixture();
        f.executor
            .install(&chart(), &values(json!({})), &install_opts())
            .await
            .unwrap();

        let outcome = f
            .executor
            .uninstall(&UninstallOptions::new("app", "default"))
            .await
            .unwrap();
        assert_eq!(outcome.release.state, ReleaseState::Uninstalled);
        assert!(f.applier.live_objects().is_empty());
        assert!(f.executor.latest_release("default", "app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uninstall_keep_history_then_reinstall() {
        let f = fixture();
        let v = values(json!({}));
        f.executor.install(&chart(), &v, &install_opts()).await.unwrap();
        f.executor
            .uninstall(&UninstallOptions::new("app", "default").keep_history())
            .await
            .unwrap();

        let latest = f.executor.latest_release("default", "app").await.unwrap().unwrap();
        assert_eq!(latest.state, ReleaseState::Uninstalled);

        let outcome = f.executor.install(&chart(), &v, &install_opts()).await.unwrap();
        assert_eq!(outcome.release.version, 2);
    }

    #[tokio::test]
    async fn test_uninstall_missing_release() {
        let f = fixture();
        let err = f
            .executor
            .uninstall(&UninstallOptions::new("app", "default"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rollback_to_previous() {
        let f = fixture();
        f.executor
            .install(&chart(), &values(json!({"replicaCount": 2})), &install_opts())
            .await
            .unwrap();
        f.executor
            .upgrade(&chart(), &values(json!({"replicaCount": 4})), &UpgradeOptions::new("app", "default"))
            .await
            .unwrap();

        let outcome = f
            .executor
            .rollback(&RollbackOptions::new("app", "default"))
            .await
            .unwrap();
        assert_eq!(outcome.release.version, 3);
        assert_eq!(outcome.release.values_digest, values(json!({"replicaCount": 2})).digest);

        let cm = f.applier.live_object("default", "ConfigMap", "app-cfg").unwrap();
        assert_eq!(cm.data["data"]["replicas"], "2");
    }

    #[tokio::test]
    async fn test_rollback_without_previous() {
        let f = fixture();
        f.executor
            .install(&chart(), &values(json!({})), &install_opts())
            .await
            .unwrap();
        let err = f
            .executor
            .rollback(&RollbackOptions::new("app", "default"))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::RollbackNotPossible { .. }));
    }

    #[tokio::test]
    async fn test_history_is_pruned() {
        let f = fixture();
        f.executor
            .install(&chart(), &values(json!({})), &install_opts())
            .await
            .unwrap();
        for replicas in 2..6 {
            f.executor
                .upgrade(
                    &chart(),
                    &values(json!({"replicaCount": replicas})),
                    &UpgradeOptions::new("app", "default").with_max_history(2),
                )
                .await
                .unwrap();
        }

        let versions: Vec<u32> = f
            .storage
            .history("default", "app")
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![5, 4]);
    }

    #[tokio::test]
    async fn test_idle_locks_are_pruned() {
        let f = fixture();
        drop(f.executor.lock("default", "a").await);
        drop(f.executor.lock("default", "b").await);
        assert_eq!(f.executor.locks.len(), 1);
    }
}
