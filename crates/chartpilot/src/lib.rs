//! chartpilot - a Kubernetes operator that turns custom resources into chart releases
//!
//! Each entry of the watches file maps a custom resource kind to a chart.
//! For every resource of that kind the operator keeps one release installed,
//! upgraded when the resource's values change and uninstalled when the
//! resource is deleted.
//!
//! - [`dispatcher`]: per-identity serialized, cross-identity parallel reconciles
//! - [`reconciler`]: the reconcile flow of one resource
//! - [`tracker`]: which release action a resource needs
//! - [`finalizer`], [`status`], [`dependents`]: what a reconcile leaves behind
//! - [`manager`]: one controller per watched kind

pub mod attributes;
pub mod client;
pub mod config;
pub mod dependents;
pub mod dispatcher;
pub mod error;
pub mod finalizer;
pub mod identity;
pub mod logging;
pub mod manager;
pub mod reconciler;
pub mod resource;
pub mod status;
pub mod tracker;

pub use attributes::ReleaseAttributes;
pub use client::{KubeResourceClient, MockResourceClient, ResourceClient};
pub use config::{Cli, LogFormat, OperatorConfig};
pub use dependents::{
    DependentWatchRegistry, KubeWatchRegistrar, RecordingWatchRegistrar, WatchRegistrar,
};
pub use dispatcher::{Action, Backoff, Dispatcher, DispatcherConfig, Reconcile};
pub use error::{Error, ErrorClass, Result};
pub use finalizer::{FINALIZER, FinalizerGuard};
pub use identity::{ReconcileReason, ReconcileRequest, ResourceKey};
pub use manager::{Controller, LoadedWatch, Operator, load_watches};
pub use reconciler::Reconciler;
pub use resource::CustomResource;
pub use status::{Condition, DeployedRelease, ReleaseStatus, Report, StatusReporter};
pub use tracker::{Decision, Desired, decide};
