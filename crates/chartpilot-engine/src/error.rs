//! Engine error types

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

/// Main engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Template error in {}: {}", .0.template, .0.message)]
    Template(#[from] TemplateError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error kind for categorizing template errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplateErrorKind {
    UndefinedVariable,
    UnknownFilter,
    UnknownFunction,
    SyntaxError,
    TypeError,
    InvalidOperation,
    Other,
}

impl TemplateErrorKind {
    fn from_minijinja(kind: minijinja::ErrorKind) -> Self {
        use minijinja::ErrorKind;

        match kind {
            ErrorKind::UndefinedError => Self::UndefinedVariable,
            ErrorKind::UnknownFilter => Self::UnknownFilter,
            ErrorKind::UnknownFunction => Self::UnknownFunction,
            ErrorKind::SyntaxError => Self::SyntaxError,
            ErrorKind::InvalidOperation => Self::InvalidOperation,
            ErrorKind::NonPrimitive | ErrorKind::NonKey | ErrorKind::CannotUnpack => {
                Self::TypeError
            }
            _ => Self::Other,
        }
    }

    fn hint(self) -> Option<&'static str> {
        match self {
            Self::UndefinedVariable => Some(
                "the key is missing from the composed values; add a default to values.yaml \
                 or guard it with `is defined`",
            ),
            Self::UnknownFilter => Some(
                "available filters: toyaml, tojson, b64encode, b64decode, quote, squote, \
                 indent, nindent, required, empty, sha256, trunc, trimprefix, trimsuffix",
            ),
            Self::SyntaxError => Some("check for unbalanced `{{ }}` or `{% %}` delimiters"),
            _ => None,
        }
    }
}

/// Template error with source information
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("{message}")]
#[diagnostic(code(chartpilot::template::render))]
pub struct TemplateError {
    pub message: String,

    pub kind: TemplateErrorKind,

    /// Template name relative to `templates/`
    pub template: String,

    #[source_code]
    pub src: NamedSource<String>,

    #[label("error occurred here")]
    pub span: Option<SourceSpan>,

    #[help]
    pub suggestion: Option<String>,
}

impl TemplateError {
    pub fn from_minijinja(err: minijinja::Error, template_name: &str, template_source: &str) -> Self {
        let kind = TemplateErrorKind::from_minijinja(err.kind());
        let span = err
            .line()
            .and_then(|line| line_span(template_source, line));
        let message = match err.detail() {
            Some(detail) => format!("{}: {}", err.kind(), detail),
            None => err.to_string(),
        };

        Self {
            message,
            kind,
            template: template_name.to_string(),
            src: NamedSource::new(template_name, template_source.to_string()),
            span,
            suggestion: kind.hint().map(str::to_string),
        }
    }

    pub fn kind(&self) -> TemplateErrorKind {
        self.kind
    }
}

/// Byte span covering a 1-based line of `source`
fn line_span(source: &str, line_num: usize) -> Option<SourceSpan> {
    let mut offset = 0;
    for (idx, line) in source.split('\n').enumerate() {
        if idx + 1 == line_num {
            return Some(SourceSpan::new(offset.into(), line.len()));
        }
        offset += line.len() + 1;
    }
    None
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_span() {
        let src = "a: 1\nbb: 2\nccc: 3";
        let span = line_span(src, 2).unwrap();
        assert_eq!(span.offset(), 5);
        assert_eq!(span.len(), 5);
        assert!(line_span(src, 9).is_none());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            TemplateErrorKind::from_minijinja(minijinja::ErrorKind::UndefinedError),
            TemplateErrorKind::UndefinedVariable
        );
        assert!(TemplateErrorKind::UndefinedVariable.hint().is_some());
        assert!(TemplateErrorKind::Other.hint().is_none());
    }
}
