//! Kubernetes Secrets storage driver
//!
//! One Secret of type `chartpilot.io/release.v1` per revision, named after
//! [`StoredRelease::storage_key`]. Creation goes through a plain POST so two
//! racing creators of the same revision resolve to exactly one winner.

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use std::collections::BTreeMap;

use super::{
    CompressionMethod, StorageConfig, StorageDriver, decode_from_storage, encode_for_storage,
    history_selector, labels, storage_labels,
};
use crate::error::{KubeError, Result};
use crate::release::{StoredRelease, storage_key};

pub const SECRET_TYPE: &str = "chartpilot.io/release.v1";

const RELEASE_KEY: &str = "release";

pub struct SecretsDriver {
    client: Client,
    config: StorageConfig,
}

impl SecretsDriver {
    pub fn new(client: Client, config: StorageConfig) -> Self {
        Self { client, config }
    }

    fn secrets_api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn build_secret(&self, release: &StoredRelease) -> Result<Secret> {
        let encoded = encode_for_storage(release, self.config.compression)?;
        Ok(build_secret(release, encoded, self.config.compression))
    }
}

fn build_secret(release: &StoredRelease, encoded: String, compression: CompressionMethod) -> Secret {
    let mut labels = storage_labels(release);
    labels.insert(labels::COMPRESSION.to_string(), compression.label().to_string());

    Secret {
        metadata: ObjectMeta {
            name: Some(release.storage_key()),
            namespace: Some(release.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some(SECRET_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            RELEASE_KEY.to_string(),
            ByteString(encoded.into_bytes()),
        )])),
        ..Default::default()
    }
}

fn parse_secret(secret: &Secret, fallback: CompressionMethod) -> Result<StoredRelease> {
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(RELEASE_KEY))
        .ok_or_else(|| KubeError::Storage("secret missing 'release' data".to_string()))?;

    let encoded = std::str::from_utf8(&data.0)
        .map_err(|e| KubeError::Storage(format!("invalid UTF-8 in secret: {}", e)))?;

    let compression = secret
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::COMPRESSION))
        .and_then(|c| CompressionMethod::from_label(c))
        .unwrap_or(fallback);

    decode_from_storage(encoded, compression)
}

fn not_found(namespace: &str, name: &str) -> KubeError {
    KubeError::ReleaseNotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

#[async_trait]
impl StorageDriver for SecretsDriver {
    async fn get(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        match self.secrets_api(namespace).get(&storage_key(name, version)).await {
            Ok(secret) => parse_secret(&secret, self.config.compression),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(not_found(namespace, name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_latest(&self, namespace: &str, name: &str) -> Result<StoredRelease> {
        let history = self.history(namespace, name).await?;
        history
            .into_iter()
            .next()
            .ok_or_else(|| not_found(namespace, name))
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        let lp = ListParams::default().labels(&history_selector(name));
        let secrets = self.secrets_api(namespace).list(&lp).await?;

        let mut releases = Vec::with_capacity(secrets.items.len());
        for secret in &secrets.items {
            match parse_secret(secret, self.config.compression) {
                Ok(release) => releases.push(release),
                Err(e) => tracing::warn!(
                    secret = secret.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "skipping unreadable release secret"
                ),
            }
        }

        releases.sort_by(|a, b| b.version.cmp(&a.version));

        if releases.is_empty() {
            return Err(not_found(namespace, name));
        }
        Ok(releases)
    }

    async fn create(&self, release: &StoredRelease) -> Result<()> {
        let secret = self.build_secret(release)?;

        match self
            .secrets_api(&release.namespace)
            .create(&PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(KubeError::ReleaseAlreadyExists {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, release: &StoredRelease) -> Result<()> {
        let secret = self.build_secret(release)?;

        match self
            .secrets_api(&release.namespace)
            .replace(&release.storage_key(), &PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(not_found(&release.namespace, &release.name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        let release = self.get(namespace, name, version).await?;

        match self
            .secrets_api(namespace)
            .delete(&release.storage_key(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(release),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(release),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        let releases = self.history(namespace, name).await?;
        let api = self.secrets_api(namespace);

        for release in &releases {
            match api.delete(&release.storage_key(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(releases)
    }
}
