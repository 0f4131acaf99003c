//! Watches on the objects a release renders
//!
//! After a successful install or upgrade, every kind found in the rendered
//! manifest gets a watch filtered by the managed-by label. Changes to those
//! objects are mapped back to the owning custom resource through the owner
//! annotations stamped at render time. The set of watched kinds per owner
//! only grows.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chartpilot_core::KindIdentifier;
use chartpilot_kube::annotations::{managed_by_selector, parse_owner};
use futures::StreamExt;
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::discovery::{self, Scope};
use kube::runtime::{WatchStreamExt, watcher};
use kube::Client;
use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::error::Result;
use crate::identity::ResourceKey;

/// Starts the watch for one dependent kind
#[async_trait]
pub trait WatchRegistrar: Send + Sync {
    async fn register(&self, owner: &KindIdentifier, dependent: &KindIdentifier) -> Result<()>;
}

/// Dependent kinds already watched, per owning kind
pub struct DependentWatchRegistry {
    registered: RwLock<HashMap<KindIdentifier, BTreeSet<KindIdentifier>>>,
    registrar: Arc<dyn WatchRegistrar>,
}

impl DependentWatchRegistry {
    pub fn new(registrar: Arc<dyn WatchRegistrar>) -> Self {
        Self {
            registered: RwLock::new(HashMap::new()),
            registrar,
        }
    }

    /// Register a watch for every kind not watched yet; returns the new ones
    pub async fn ensure(
        &self,
        owner: &KindIdentifier,
        kinds: &BTreeSet<KindIdentifier>,
    ) -> Result<Vec<KindIdentifier>> {
        let missing: Vec<KindIdentifier> = {
            let registered = self.registered.read().await;
            let known = registered.get(owner);
            kinds
                .iter()
                .filter(|k| !known.is_some_and(|set| set.contains(*k)))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let mut registered = self.registered.write().await;
        let mut added = Vec::new();
        for kind in missing {
            let set = registered.entry(owner.clone()).or_default();
            if set.contains(&kind) {
                continue;
            }
            self.registrar.register(owner, &kind).await?;
            info!(owner = %owner, dependent = %kind, "watching dependent resources");
            set.insert(kind.clone());
            added.push(kind);
        }
        Ok(added)
    }

    pub async fn watched(&self, owner: &KindIdentifier) -> BTreeSet<KindIdentifier> {
        self.registered
            .read()
            .await
            .get(owner)
            .cloned()
            .unwrap_or_default()
    }
}

/// `Kind.group`, as written in the owner-kind annotation
pub fn qualified_kind(kind: &KindIdentifier) -> String {
    if kind.group.is_empty() {
        kind.kind.clone()
    } else {
        format!("{}.{}", kind.kind, kind.group)
    }
}

/// Owning resource of a rendered object, if it belongs to `owner`
pub fn owner_key(annotations: &BTreeMap<String, String>, owner: &KindIdentifier) -> Option<ResourceKey> {
    let (kind, namespace, name) = parse_owner(annotations)?;
    if kind != qualified_kind(owner) || namespace.is_empty() {
        return None;
    }
    Some(ResourceKey::new(owner.clone(), namespace, name))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registrar backed by `kube::runtime::watcher` streams
///
/// Owners of changed objects are sent to `owners`, which feeds the
/// dispatcher of the owning kind.
pub struct KubeWatchRegistrar {
    client: Client,
    namespace: Option<String>,
    owners: UnboundedSender<ResourceKey>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl KubeWatchRegistrar {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        owners: UnboundedSender<ResourceKey>,
        span: Span,
    ) -> Self {
        Self {
            client,
            namespace,
            owners,
            tasks: Mutex::new(Vec::new()),
            span,
        }
    }

    /// Stop every watch started so far
    pub fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl WatchRegistrar for KubeWatchRegistrar {
    async fn register(&self, owner: &KindIdentifier, dependent: &KindIdentifier) -> Result<()> {
        let gvk = GroupVersionKind::gvk(&dependent.group, &dependent.version, &dependent.kind);
        let (resource, capabilities) = discovery::pinned_kind(&self.client, &gvk).await?;
        let api: Api<DynamicObject> = match (&self.namespace, capabilities.scope) {
            (Some(ns), Scope::Namespaced) => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        };

        let config = watcher::Config::default().labels(&managed_by_selector());
        let span = info_span!(parent: &self.span, "dependent_watch", dependent = %dependent);
        let task = tokio::spawn(
            watch_dependents(api, config, owner.clone(), self.owners.clone()).instrument(span),
        );
        lock(&self.tasks).push(task);
        Ok(())
    }
}

async fn watch_dependents(
    api: Api<DynamicObject>,
    config: watcher::Config,
    owner: KindIdentifier,
    owners: UnboundedSender<ResourceKey>,
) {
    let mut events = std::pin::pin!(watcher(api, config).default_backoff());
    while let Some(event) = events.next().await {
        match event {
            Ok(
                watcher::Event::Apply(obj)
                | watcher::Event::InitApply(obj)
                | watcher::Event::Delete(obj),
            ) => {
                let Some(annotations) = obj.metadata.annotations.as_ref() else {
                    continue;
                };
                if let Some(key) = owner_key(annotations, &owner) {
                    debug!(resource = %key, "dependent object changed");
                    if owners.send(key).is_err() {
                        break;
                    }
                }
            }
            Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
            Err(e) => warn!(error = %e, "dependent watch error"),
        }
    }
}

/// Registrar that only records what it was asked to watch
#[derive(Clone, Default)]
pub struct RecordingWatchRegistrar {
    registrations: Arc<Mutex<Vec<(KindIdentifier, KindIdentifier)>>>,
}

impl RecordingWatchRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registrations(&self) -> Vec<(KindIdentifier, KindIdentifier)> {
        lock(&self.registrations).clone()
    }
}

#[async_trait]
impl WatchRegistrar for RecordingWatchRegistrar {
    async fn register(&self, owner: &KindIdentifier, dependent: &KindIdentifier) -> Result<()> {
        lock(&self.registrations).push((owner.clone(), dependent.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> KindIdentifier {
        KindIdentifier::new("example.com", "v1", "TestApp")
    }

    fn kinds(list: &[(&str, &str, &str)]) -> BTreeSet<KindIdentifier> {
        list.iter()
            .map(|(g, v, k)| KindIdentifier::new(*g, *v, *k))
            .collect()
    }

    #[tokio::test]
    async fn test_only_new_kinds_are_registered() {
        let recorder = RecordingWatchRegistrar::new();
        let registry = DependentWatchRegistry::new(Arc::new(recorder.clone()));

        let first = kinds(&[("", "v1", "ConfigMap"), ("apps", "v1", "Deployment")]);
        assert_eq!(registry.ensure(&owner(), &first).await.unwrap().len(), 2);
        assert!(registry.ensure(&owner(), &first).await.unwrap().is_empty());

        let second = kinds(&[("", "v1", "ConfigMap"), ("", "v1", "Service")]);
        let added = registry.ensure(&owner(), &second).await.unwrap();
        assert_eq!(added, vec![KindIdentifier::new("", "v1", "Service")]);

        assert_eq!(recorder.registrations().len(), 3);
        assert_eq!(registry.watched(&owner()).await.len(), 3);
    }

    #[tokio::test]
    async fn test_watch_set_never_shrinks() {
        let registry = DependentWatchRegistry::new(Arc::new(RecordingWatchRegistrar::new()));
        registry
            .ensure(&owner(), &kinds(&[("", "v1", "ConfigMap"), ("", "v1", "Secret")]))
            .await
            .unwrap();
        registry
            .ensure(&owner(), &kinds(&[("", "v1", "ConfigMap")]))
            .await
            .unwrap();
        assert_eq!(registry.watched(&owner()).await.len(), 2);
    }

    #[test]
    fn test_owner_key_from_annotations() {
        let annotations = BTreeMap::from([
            ("chartpilot.io/owner-kind".to_string(), "TestApp.example.com".to_string()),
            ("chartpilot.io/owner-namespace".to_string(), "ns".to_string()),
            ("chartpilot.io/owner-name".to_string(), "app".to_string()),
        ]);
        let key = owner_key(&annotations, &owner()).unwrap();
        assert_eq!(key, ResourceKey::new(owner(), "ns", "app"));

        let other = KindIdentifier::new("example.com", "v1", "OtherApp");
        assert!(owner_key(&annotations, &other).is_none());
    }

    #[test]
    fn test_qualified_kind() {
        assert_eq!(qualified_kind(&owner()), "TestApp.example.com");
        assert_eq!(qualified_kind(&KindIdentifier::new("", "v1", "ConfigMap")), "ConfigMap");
    }
}
