//! One controller per watched kind
//!
//! A controller owns the dispatcher of its kind and feeds it from two event
//! sources: the watch on the custom resources themselves and the dependent
//! watches registered as releases render new kinds.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chartpilot_core::{Capabilities, KindIdentifier, KubeVersion, LoadedChart, WatchSpec};
use chartpilot_engine::Engine;
use chartpilot_kube::{ActionExecutor, ResourceManager, SecretsDriver, StorageConfig};
use futures::StreamExt;
use futures::future::join_all;
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::discovery;
use kube::runtime::{WatchStreamExt, watcher};
use kube::Client;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::client::KubeResourceClient;
use crate::config::OperatorConfig;
use crate::dependents::{DependentWatchRegistry, KubeWatchRegistrar};
use crate::dispatcher::{Backoff, Dispatcher, DispatcherConfig};
use crate::error::{Error, Result};
use crate::identity::{ReconcileReason, ResourceKey};
use crate::reconciler::Reconciler;

/// A watch together with its chart, loaded once at startup
#[derive(Debug, Clone)]
pub struct LoadedWatch {
    pub spec: Arc<WatchSpec>,
    pub chart: Arc<LoadedChart>,
}

/// Load the watches file and every chart it references
pub fn load_watches(path: &Path) -> Result<Vec<LoadedWatch>> {
    let specs = chartpilot_core::load_watches(path).map_err(|source| Error::WatchesFile {
        path: path.to_path_buf(),
        source,
    })?;

    specs
        .into_iter()
        .map(|spec| {
            let chart = LoadedChart::load(spec.chart()).map_err(|source| Error::ChartLoad {
                path: spec.chart().to_path_buf(),
                source,
            })?;
            info!(kind = %spec.kind(), chart = %chart.name(), version = %chart.version(), "watch loaded");
            Ok(LoadedWatch {
                spec: Arc::new(spec),
                chart: Arc::new(chart),
            })
        })
        .collect()
}

pub struct Controller {
    kind: KindIdentifier,
    dispatcher: Dispatcher,
    registrar: Arc<KubeWatchRegistrar>,
    events: JoinHandle<()>,
}

impl Controller {
    pub async fn start(
        client: Client,
        watch: LoadedWatch,
        config: &OperatorConfig,
        capabilities: Capabilities,
    ) -> Result<Self> {
        let kind = watch.spec.kind().clone();
        let span = info_span!("controller", kind = %kind);

        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let (resource, _) = discovery::pinned_kind(&client, &gvk)
            .await
            .map_err(|e| Error::Config(format!("kind {kind} is not served by the cluster: {e}")))?;

        let storage = Arc::new(SecretsDriver::new(client.clone(), StorageConfig::default()));
        let applier = Arc::new(ResourceManager::new(client.clone()).await?);
        let executor = ActionExecutor::new(storage, applier, Arc::new(Engine::default()))
            .with_capabilities(capabilities)
            .with_span(span.clone());

        let (owners_tx, owners_rx) = unbounded_channel();
        let registrar = Arc::new(KubeWatchRegistrar::new(
            client.clone(),
            config.namespace.clone(),
            owners_tx,
            span.clone(),
        ));
        let reconciler = Reconciler::new(
            watch.spec.clone(),
            watch.chart.clone(),
            executor,
            Arc::new(KubeResourceClient::new(client.clone(), resource.clone())),
            Arc::new(DependentWatchRegistry::new(registrar.clone())),
        )
        .with_span(span.clone());

        let dispatcher = Dispatcher::start(
            Arc::new(reconciler),
            DispatcherConfig {
                workers: watch.spec.max_concurrent_reconciles_or(config.max_concurrent_reconciles),
                backoff: Backoff::default(),
                reconcile_period: watch.spec.reconcile_period_or(config.reconcile_period),
            },
            span.clone(),
        );

        let api: Api<DynamicObject> = match &config.namespace {
            Some(ns) => Api::namespaced_with(client, ns, &resource),
            None => Api::all_with(client, &resource),
        };
        let events = tokio::spawn(
            route_events(api, kind.clone(), owners_rx, dispatcher.clone()).instrument(span.clone()),
        );

        info!(
            parent: &span,
            chart = %watch.chart.name(),
            scope = config.namespace.as_deref().unwrap_or("cluster-wide"),
            "controller started"
        );
        Ok(Self {
            kind,
            dispatcher,
            registrar,
            events,
        })
    }

    pub fn kind(&self) -> &KindIdentifier {
        &self.kind
    }

    /// Stop the event sources, then drain the dispatcher
    pub async fn shutdown(self, grace: Duration) {
        self.events.abort();
        self.registrar.shutdown();
        self.dispatcher.shutdown(grace).await;
    }
}

fn resource_key(kind: &KindIdentifier, obj: &DynamicObject) -> Option<ResourceKey> {
    let name = obj.metadata.name.as_ref()?;
    let namespace = obj.metadata.namespace.as_ref()?;
    Some(ResourceKey::new(kind.clone(), namespace, name))
}

/// Multiplex resource and dependent events into the dispatcher
async fn route_events(
    api: Api<DynamicObject>,
    kind: KindIdentifier,
    mut owners: UnboundedReceiver<ResourceKey>,
    dispatcher: Dispatcher,
) {
    let mut resources = std::pin::pin!(watcher(api, watcher::Config::default()).default_backoff());
    loop {
        tokio::select! {
            event = resources.next() => match event {
                Some(Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj))) => {
                    if let Some(key) = resource_key(&kind, &obj) {
                        dispatcher.enqueue(key, ReconcileReason::ResourceChanged);
                    }
                }
                Some(Ok(watcher::Event::Delete(obj))) => {
                    if let Some(key) = resource_key(&kind, &obj) {
                        dispatcher.enqueue(key, ReconcileReason::ResourceDeleted);
                    }
                }
                Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => {}
                Some(Err(e)) => warn!(error = %e, "resource watch error"),
                None => {
                    warn!("resource watch ended");
                    break;
                }
            },
            Some(key) = owners.recv() => {
                debug!(resource = %key, "dependent changed");
                dispatcher.enqueue(key, ReconcileReason::DependentChanged);
            }
        }
    }
}

/// All controllers of the process
pub struct Operator {
    controllers: Vec<Controller>,
}

impl Operator {
    pub async fn start(client: Client, config: &OperatorConfig, watches: Vec<LoadedWatch>) -> Result<Self> {
        let capabilities = match client.apiserver_version().await {
            Ok(info) => Capabilities {
                kube_version: KubeVersion::new(&info.git_version),
            },
            Err(e) => {
                warn!(error = %e, "cannot read the server version, using defaults");
                Capabilities::default()
            }
        };

        let mut controllers = Vec::with_capacity(watches.len());
        for watch in watches {
            let controller = Controller::start(client.clone(), watch, config, capabilities.clone()).await;
            match controller {
                Ok(controller) => controllers.push(controller),
                Err(e) => {
                    join_all(controllers.into_iter().map(|c| c.shutdown(Duration::ZERO))).await;
                    return Err(e);
                }
            }
        }
        Ok(Self { controllers })
    }

    pub fn kinds(&self) -> impl Iterator<Item = &KindIdentifier> {
        self.controllers.iter().map(Controller::kind)
    }

    /// Drain every controller in parallel, each within `grace`
    pub async fn shutdown(self, grace: Duration) {
        join_all(self.controllers.into_iter().map(|c| c.shutdown(grace))).await;
        info!("all controllers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn chart(dir: &Path) {
        fs::create_dir_all(dir.join("templates")).unwrap();
        fs::write(dir.join("Chart.yaml"), "name: nginx\nversion: 0.1.0\n").unwrap();
        fs::write(dir.join("values.yaml"), "replicaCount: 1\n").unwrap();
        fs::write(
            dir.join("templates/configmap.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ release.name }}\n",
        )
        .unwrap();
    }

    #[test]
    fn test_load_watches_with_charts() {
        let temp = TempDir::new().unwrap();
        chart(&temp.path().join("nginx"));
        let watches = temp.path().join("watches.yaml");
        fs::write(
            &watches,
            format!(
                "- group: example.com\n  version: v1\n  kind: TestApp\n  chart: {}\n",
                temp.path().join("nginx").display()
            ),
        )
        .unwrap();

        let loaded = load_watches(&watches).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].chart.name(), "nginx");
        assert_eq!(loaded[0].spec.kind().kind, "TestApp");
    }

    #[test]
    fn test_missing_watches_file_is_fatal() {
        let temp = TempDir::new().unwrap();
        let err = load_watches(&temp.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, Error::WatchesFile { .. }));
        assert_eq!(err.class(), crate::error::ErrorClass::Fatal);
    }

    #[test]
    fn test_resource_key_requires_namespace() {
        let kind = KindIdentifier::new("example.com", "v1", "TestApp");
        let mut obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "example.com/v1",
            "kind": "TestApp",
            "metadata": {"name": "app", "namespace": "ns"},
        }))
        .unwrap();
        assert_eq!(resource_key(&kind, &obj), Some(ResourceKey::new(kind.clone(), "ns", "app")));

        obj.metadata.namespace = None;
        assert!(resource_key(&kind, &obj).is_none());
    }
}
