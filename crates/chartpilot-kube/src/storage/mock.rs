//! In-memory storage driver
//!
//! Behaves like the Secrets driver (including `ReleaseAlreadyExists` on a
//! taken revision) without a cluster. Used by tests and by the operator's
//! scenario suites.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::StorageDriver;
use crate::error::{KubeError, Result};
use crate::release::StoredRelease;

/// (namespace, name) -> version -> release
type Store = HashMap<(String, String), BTreeMap<u32, StoredRelease>>;

#[derive(Clone, Default)]
pub struct MockStorageDriver {
    store: Arc<RwLock<Store>>,
    operations: Arc<RwLock<OperationCounts>>,
}

/// Counts of operations performed, for assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub lists: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

fn not_found(namespace: &str, name: &str) -> KubeError {
    KubeError::ReleaseNotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

impl MockStorageDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver pre-populated with releases, stored as-is
    pub fn with_releases(releases: impl IntoIterator<Item = StoredRelease>) -> Self {
        let driver = Self::new();
        {
            let mut store = write(&driver.store);
            for release in releases {
                store
                    .entry(key(&release.namespace, &release.name))
                    .or_default()
                    .insert(release.version, release);
            }
        }
        driver
    }

    pub fn operation_counts(&self) -> OperationCounts {
        read(&self.operations).clone()
    }

    pub fn reset_counts(&self) {
        *write(&self.operations) = OperationCounts::default();
    }

    pub fn all_releases(&self) -> Vec<StoredRelease> {
        read(&self.store)
            .values()
            .flat_map(|versions| versions.values())
            .cloned()
            .collect()
    }

    pub fn release_count(&self) -> usize {
        read(&self.store).values().map(BTreeMap::len).sum()
    }

    fn count(&self, f: impl FnOnce(&mut OperationCounts)) {
        f(&mut write(&self.operations));
    }
}

#[async_trait]
impl StorageDriver for MockStorageDriver {
    async fn get(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        self.count(|ops| ops.gets += 1);

        read(&self.store)
            .get(&key(namespace, name))
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| not_found(namespace, name))
    }

    async fn get_latest(&self, namespace: &str, name: &str) -> Result<StoredRelease> {
        self.count(|ops| ops.gets += 1);

        read(&self.store)
            .get(&key(namespace, name))
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| not_found(namespace, name))
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        self.count(|ops| ops.lists += 1);

        let releases: Vec<StoredRelease> = read(&self.store)
            .get(&key(namespace, name))
            .map(|versions| versions.values().rev().cloned().collect())
            .unwrap_or_default();

        if releases.is_empty() {
            return Err(not_found(namespace, name));
        }
        Ok(releases)
    }

    async fn create(&self, release: &StoredRelease) -> Result<()> {
        self.count(|ops| ops.creates += 1);

        let mut store = write(&self.store);
        let versions = store
            .entry(key(&release.namespace, &release.name))
            .or_default();

        if versions.contains_key(&release.version) {
            return Err(KubeError::ReleaseAlreadyExists {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
            });
        }
        versions.insert(release.version, release.clone());
        Ok(())
    }

    async fn update(&self, release: &StoredRelease) -> Result<()> {
        self.count(|ops| ops.updates += 1);

        let mut store = write(&self.store);
        let slot = store
            .get_mut(&key(&release.namespace, &release.name))
            .and_then(|versions| versions.get_mut(&release.version))
            .ok_or_else(|| not_found(&release.namespace, &release.name))?;
        *slot = release.clone();
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        self.count(|ops| ops.deletes += 1);

        let mut store = write(&self.store);
        let k = key(namespace, name);
        let versions = store.get_mut(&k).ok_or_else(|| not_found(namespace, name))?;
        let release = versions
            .remove(&version)
            .ok_or_else(|| not_found(namespace, name))?;
        if versions.is_empty() {
            store.remove(&k);
        }
        Ok(release)
    }

    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        self.count(|ops| ops.deletes += 1);

        write(&self.store)
            .remove(&key(namespace, name))
            .map(|versions| versions.into_values().rev().collect())
            .ok_or_else(|| not_found(namespace, name))
    }
}
