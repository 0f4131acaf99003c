//! chartpilot engine - Jinja2 chart rendering
//!
//! A MiniJinja-based implementation of the [`Renderer`] capability the
//! operator consumes. Templates are rendered from the in-memory chart, with
//! Helm-flavoured filters (`toyaml`, `b64encode`, `nindent`, ...) and
//! source-annotated errors.

pub mod engine;
pub mod error;
pub mod filters;
pub mod functions;

pub use engine::{Engine, RenderResult, Renderer};
pub use error::{EngineError, Result, TemplateError, TemplateErrorKind};
