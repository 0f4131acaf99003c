//! Cluster-backed [`ResourceApplier`]
//!
//! - Server-Side Apply for idempotent resource management
//! - Dynamic resource handling via discovery, re-run once when a kind is
//!   unknown (a CRD applied by the same release)
//! - Ordering for creation (dependencies first) and deletion (reverse)
//! - `resource-policy: keep` honoured on delete
//! - With `force`, an update rejected as invalid is retried as delete + create

use async_trait::async_trait;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PropagationPolicy},
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::annotations::has_keep_policy;
use crate::applier::{ApplyOptions, OperationSummary, ResourceApplier};
use crate::error::{KubeError, Result};
use crate::manifest::{ObjectRef, gvk_of, sort_for_apply, sort_for_delete};

/// Field manager name for Server-Side Apply
pub const FIELD_MANAGER: &str = "chartpilot";

/// Object resolved against discovery
struct ResolvedObject {
    obj: DynamicObject,
    api_resource: ApiResource,
    capabilities: ApiCapabilities,
}

impl ResolvedObject {
    fn display_name(&self) -> String {
        let name = self.obj.metadata.name.as_deref().unwrap_or("unnamed");
        match &self.obj.metadata.namespace {
            Some(ns) => format!("{}/{}/{}", ns, self.api_resource.kind, name),
            None => format!("{}/{}", self.api_resource.kind, name),
        }
    }
}

pub struct ResourceManager {
    client: Client,
    discovery: RwLock<Discovery>,
}

impl ResourceManager {
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self {
            client,
            discovery: RwLock::new(discovery),
        })
    }

    async fn refresh_discovery(&self) -> Result<()> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        *self.discovery.write().await = discovery;
        Ok(())
    }

    /// Resolve an object's kind, defaulting the namespace of namespaced kinds
    async fn resolve(&self, obj: &DynamicObject, namespace: &str) -> Result<ResolvedObject> {
        let gvk = gvk_of(obj)?;

        let mut found = self.discovery.read().await.resolve_gvk(&gvk);
        if found.is_none() {
            debug!(group = %gvk.group, kind = %gvk.kind, "unknown kind, refreshing discovery");
            self.refresh_discovery().await?;
            found = self.discovery.read().await.resolve_gvk(&gvk);
        }

        let (api_resource, capabilities) = found.ok_or_else(|| KubeError::UnknownKind {
            api_version: if gvk.group.is_empty() {
                gvk.version.clone()
            } else {
                format!("{}/{}", gvk.group, gvk.version)
            },
            kind: gvk.kind.clone(),
        })?;

        let mut obj = obj.clone();
        if capabilities.scope == Scope::Namespaced {
            if obj.metadata.namespace.is_none() {
                obj.metadata.namespace = Some(namespace.to_string());
            }
        } else {
            obj.metadata.namespace = None;
        }

        Ok(ResolvedObject {
            obj,
            api_resource,
            capabilities,
        })
    }

    fn api_for(&self, resolved: &ResolvedObject) -> Api<DynamicObject> {
        match (&resolved.capabilities.scope, &resolved.obj.metadata.namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resolved.api_resource)
            }
            _ => Api::all_with(self.client.clone(), &resolved.api_resource),
        }
    }

    async fn apply_one(&self, resolved: &ResolvedObject, options: &ApplyOptions) -> Result<()> {
        let name = object_name(&resolved.obj)?;
        let api = self.api_for(resolved);
        let params = PatchParams::apply(FIELD_MANAGER).force();

        match api.patch(name, &params, &Patch::Apply(&resolved.obj)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if options.force && e.code == 422 => {
                warn!(
                    object = %resolved.display_name(),
                    reason = %e.message,
                    "update rejected, recreating"
                );
                delete_if_present(&api, name).await?;
                api.patch(name, &params, &Patch::Apply(&resolved.obj)).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn object_name(obj: &DynamicObject) -> Result<&str> {
    obj.metadata
        .name
        .as_deref()
        .ok_or_else(|| KubeError::InvalidManifest("resource missing metadata.name".to_string()))
}

/// Delete with background propagation; `false` if the object was already gone
async fn delete_if_present(api: &Api<DynamicObject>, name: &str) -> Result<bool> {
    let params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    };
    match api.delete(name, &params).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn display_unresolved(obj: &DynamicObject) -> String {
    ObjectRef::from_object(obj)
        .map(|r| r.to_string())
        .unwrap_or_else(|_| "unnamed".to_string())
}

#[async_trait]
impl ResourceApplier for ResourceManager {
    async fn apply(
        &self,
        namespace: &str,
        objects: &[DynamicObject],
        options: &ApplyOptions,
    ) -> Result<OperationSummary> {
        let mut sorted = objects.to_vec();
        sort_for_apply(&mut sorted);

        let mut summary = OperationSummary::default();
        for obj in &sorted {
            let resolved = match self.resolve(obj, namespace).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    summary.failed.push((display_unresolved(obj), e.to_string()));
                    continue;
                }
            };

            let name = resolved.display_name();
            match self.apply_one(&resolved, options).await {
                Ok(()) => summary.succeeded.push(name),
                Err(e) => summary.failed.push((name, e.to_string())),
            }
        }

        debug!(namespace, result = %summary.summary(), "applied objects");
        Ok(summary)
    }

    async fn delete(&self, namespace: &str, objects: &[DynamicObject]) -> Result<OperationSummary> {
        let mut sorted = objects.to_vec();
        sort_for_delete(&mut sorted);

        let mut summary = OperationSummary::default();
        for obj in &sorted {
            let kept = obj
                .metadata
                .annotations
                .as_ref()
                .is_some_and(has_keep_policy);
            if kept {
                summary
                    .skipped
                    .push((display_unresolved(obj), "resource-policy: keep".to_string()));
                continue;
            }

            let resolved = match self.resolve(obj, namespace).await {
                Ok(resolved) => resolved,
                // A kind that is no longer served leaves nothing to delete
                Err(KubeError::UnknownKind { .. }) => {
                    summary
                        .skipped
                        .push((display_unresolved(obj), "kind not served".to_string()));
                    continue;
                }
                Err(e) => {
                    summary.failed.push((display_unresolved(obj), e.to_string()));
                    continue;
                }
            };

            let name = resolved.display_name();
            let api = self.api_for(&resolved);
            let result = match object_name(&resolved.obj) {
                Ok(object) => delete_if_present(&api, object).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => summary.succeeded.push(name),
                Ok(false) => summary.skipped.push((name, "not found".to_string())),
                Err(e) => summary.failed.push((name, e.to_string())),
            }
        }

        debug!(namespace, result = %summary.summary(), "deleted objects");
        Ok(summary)
    }
}
