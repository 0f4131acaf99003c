//! Storage drivers for persisting release records
//!
//! - **Secrets** (default): one Kubernetes Secret per revision
//! - **Mock**: in-memory, for tests and local runs
//!
//! Records are JSON, compressed (zstd by default, gzip readable) and base64
//! encoded.

mod mock;
mod secrets;

pub use mock::{MockStorageDriver, OperationCounts};
pub use secrets::SecretsDriver;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;

use crate::error::{KubeError, Result};
use crate::release::StoredRelease;

/// Maximum size for a single Kubernetes Secret (1MB - some overhead)
pub const MAX_RESOURCE_SIZE: usize = 1_000_000;

/// Value of the `owner` label on storage Secrets
pub const STORAGE_OWNER: &str = "chartpilot";

pub mod labels {
    pub const OWNER: &str = "owner";
    pub const RELEASE_NAME: &str = "chartpilot.io/release-name";
    pub const RELEASE_VERSION: &str = "chartpilot.io/release-version";
    pub const STATUS: &str = "chartpilot.io/status";
    pub const COMPRESSION: &str = "chartpilot.io/compression";
}

/// Storage driver trait for release persistence
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Get a specific release revision
    async fn get(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease>;

    /// Get the highest revision of a release
    async fn get_latest(&self, namespace: &str, name: &str) -> Result<StoredRelease>;

    /// All revisions of a release, newest first. Empty history is `ReleaseNotFound`.
    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>>;

    /// Create a new revision; `ReleaseAlreadyExists` if the revision is taken
    async fn create(&self, release: &StoredRelease) -> Result<()>;

    /// Update an existing revision
    async fn update(&self, release: &StoredRelease) -> Result<()>;

    /// Delete a specific revision
    async fn delete(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease>;

    /// Delete all revisions of a release
    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>>;

    /// Latest revision, `None` when the release has no history
    async fn find_latest(&self, namespace: &str, name: &str) -> Result<Option<StoredRelease>> {
        match self.get_latest(namespace, name).await {
            Ok(release) => Ok(Some(release)),
            Err(KubeError::ReleaseNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.find_latest(namespace, name).await?.is_some())
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub compression: CompressionMethod,

    /// Maximum number of revisions to keep per release
    pub max_history: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::default(),
            max_history: 10,
        }
    }
}

/// Compression method for release data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None,

    /// Helm-compatible
    Gzip { level: u32 },

    Zstd { level: i32 },
}

impl Default for CompressionMethod {
    fn default() -> Self {
        Self::Zstd { level: 3 }
    }
}

impl CompressionMethod {
    /// Value of the compression label
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip { .. } => "gzip",
            Self::Zstd { .. } => "zstd",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "none" => Some(Self::None),
            "gzip" => Some(Self::Gzip { level: 6 }),
            "zstd" => Some(Self::Zstd { level: 3 }),
            _ => None,
        }
    }
}

pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { level } => {
            use std::io::Write;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder
                .write_all(data)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| KubeError::Compression(e.to_string()))
        }
        CompressionMethod::Zstd { level } => zstd::encode_all(std::io::Cursor::new(data), level)
            .map_err(|e| KubeError::Compression(e.to_string())),
    }
}

pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { .. } => {
            use std::io::Read;
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            Ok(out)
        }
        CompressionMethod::Zstd { .. } => zstd::decode_all(std::io::Cursor::new(data))
            .map_err(|e| KubeError::Compression(e.to_string())),
    }
}

/// Serialize, compress and base64 encode a release
pub fn encode_for_storage(release: &StoredRelease, compression: CompressionMethod) -> Result<String> {
    let json = serde_json::to_vec(release)?;
    let compressed = compress(&json, compression)?;
    let encoded = STANDARD.encode(&compressed);

    if encoded.len() > MAX_RESOURCE_SIZE {
        return Err(KubeError::ReleaseTooLarge {
            size: encoded.len(),
            max: MAX_RESOURCE_SIZE,
        });
    }
    Ok(encoded)
}

pub fn decode_from_storage(data: &str, compression: CompressionMethod) -> Result<StoredRelease> {
    let decoded = STANDARD
        .decode(data.trim())
        .map_err(|e| KubeError::Serialization(format!("base64 decode error: {}", e)))?;
    let decompressed = decompress(&decoded, compression)?;
    Ok(serde_json::from_slice(&decompressed)?)
}

/// Labels applied to storage Secrets
///
/// Deliberately not the managed-by label, so storage never shows up among
/// watched dependents.
pub fn storage_labels(release: &StoredRelease) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::OWNER.to_string(), STORAGE_OWNER.to_string()),
        (labels::RELEASE_NAME.to_string(), release.name.clone()),
        (labels::RELEASE_VERSION.to_string(), release.version.to_string()),
        (labels::STATUS.to_string(), release.state.status_name().to_string()),
    ])
}

/// Selector matching every revision of one release
pub fn history_selector(name: &str) -> String {
    format!("{}={},{}={}", labels::OWNER, STORAGE_OWNER, labels::RELEASE_NAME, name)
}
