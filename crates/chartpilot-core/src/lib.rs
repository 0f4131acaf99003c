//! chartpilot core - shared types for the chart operator
//!
//! This crate provides the foundational types used throughout chartpilot:
//! - `Values`: Configuration values with strict deep merge and canonical digests
//! - `ValuesComposer`: Chart defaults < watch overrides < declared values
//! - `LoadedChart`: A chart bundle loaded into memory once at startup
//! - `WatchSpec`: One immutable entry of the watches file
//! - `TemplateContext`: Everything a chart template can see

pub mod annotations;
pub mod chart;
pub mod compose;
pub mod context;
pub mod error;
pub mod schema;
pub mod values;
pub mod watches;

pub use annotations::{ActionAnnotation, ActionAnnotations, ActionKind};
pub use chart::{ChartMetadata, LoadedChart};
pub use compose::{ComposedValues, ValuesComposer};
pub use context::{Capabilities, ChartInfo, KubeVersion, ReleaseInfo, TemplateContext};
pub use error::{CoreError, Result, ValidationErrorInfo};
pub use schema::SchemaValidator;
pub use values::Values;
pub use watches::{KindIdentifier, WatchEntry, WatchSpec, load_watches, parse_watches};
