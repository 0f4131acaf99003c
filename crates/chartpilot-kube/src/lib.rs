//! chartpilot kube - release lifecycle against a Kubernetes cluster
//!
//! - [`ActionExecutor`]: install, upgrade, uninstall and rollback with
//!   per-release mutual exclusion and stuck-release recovery
//! - [`StorageDriver`]: release records in Secrets ([`SecretsDriver`]) or in
//!   memory ([`MockStorageDriver`])
//! - [`ResourceApplier`]: server-side apply and ordered deletion
//!   ([`ResourceManager`]), with an in-memory [`MockApplier`]
//! - [`manifest`]: parsing rendered manifests and stamping ownership metadata

pub mod actions;
pub mod annotations;
pub mod applier;
pub mod error;
pub mod executor;
pub mod manifest;
pub mod release;
pub mod resources;
pub mod storage;

pub use actions::{
    ActionOutcome, DEFAULT_MAX_HISTORY, InstallOptions, RollbackOptions, UninstallOptions,
    UpgradeOptions,
};
pub use applier::{AppliedCall, ApplyOptions, MockApplier, OperationSummary, ResourceApplier};
pub use error::{KubeError, Result};
pub use executor::{ActionExecutor, ReleaseGuard};
pub use manifest::{ObjectRef, ResourceCategory};
pub use release::{DEFAULT_OPERATION_TIMEOUT, ReleaseOwner, ReleaseState, StoredRelease};
pub use resources::ResourceManager;
pub use storage::{
    CompressionMethod, MockStorageDriver, OperationCounts, SecretsDriver, StorageConfig,
    StorageDriver,
};
