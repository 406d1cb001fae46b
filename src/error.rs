//! Error types for semql.
//!
//! Load-time problems (`CompileError`, `RegistryLoadError`) are isolated per
//! operator and collected into the snapshot's load report. Rewrite-time clause
//! violations are returned as [`Diagnostic`] values next to the rewritten SQL.
//! Only [`SemqlError`] is ever returned as an `Err` from a public entry point.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::clause::Clause;

/// Byte range inside a query or a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// What went wrong while compiling a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompileErrorKind {
    /// Two captures with no keyword between them.
    AmbiguousCapture,
    /// A `{{` without its `}}` (or the reverse).
    UnbalancedBraces,
    /// The template has no literal keyword to anchor on.
    EmptyKeyword,
    /// Placeholder name is empty or not an identifier.
    InvalidCaptureName,
    /// The same binding name appears twice.
    DuplicateCapture,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AmbiguousCapture => "ambiguous capture (two captures without a keyword between them)",
            Self::UnbalancedBraces => "unbalanced braces",
            Self::EmptyKeyword => "empty keyword",
            Self::InvalidCaptureName => "invalid capture name",
            Self::DuplicateCapture => "duplicate capture name",
        };
        f.write_str(s)
    }
}

/// A template failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind} at position {position} in template '{template}'")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    /// Byte offset inside `template`.
    pub position: usize,
    pub template: String,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, position: usize, template: impl Into<String>) -> Self {
        Self {
            kind,
            position,
            template: template.into(),
        }
    }
}

/// A clause-restricted operator was written in a clause that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("operator '{operator}' cannot be used in {clause} (at {span})")]
pub struct ClauseContextError {
    pub operator: String,
    pub clause: Clause,
    pub span: Span,
}

/// One operator (or one whole source) could not be loaded.
///
/// Every variant except `Source` affects a single operator; the registry skips
/// that operator and keeps loading the rest.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum RegistryLoadError {
    #[error("source '{source_id}' could not be read: {message}")]
    Source { source_id: String, message: String },

    #[error("operator '{operator}' in '{source_id}' is malformed: {message}")]
    Malformed {
        operator: String,
        source_id: String,
        message: String,
    },

    #[error("operator '{operator}': {error}")]
    Compile {
        operator: String,
        #[source]
        error: CompileError,
    },

    #[error("operator '{operator}' has shape {shape} but no context_arg bound by every pattern")]
    MissingContextArg { operator: String, shape: String },

    #[error("operator '{operator}' references unknown binding '{binding}'")]
    UnknownBinding { operator: String, binding: String },

    #[error("output of operator '{operator}' would re-trigger '{trigger}' of operator '{other}'")]
    ReentrantOutput {
        operator: String,
        trigger: String,
        other: String,
    },

    #[error("block operator '{operator}' is invalid: {message}")]
    InvalidBlock { operator: String, message: String },
}

impl RegistryLoadError {
    /// Name of the affected operator, if the error is scoped to one.
    pub fn operator(&self) -> Option<&str> {
        match self {
            Self::Source { .. } => None,
            Self::Malformed { operator, .. }
            | Self::Compile { operator, .. }
            | Self::MissingContextArg { operator, .. }
            | Self::UnknownBinding { operator, .. }
            | Self::ReentrantOutput { operator, .. }
            | Self::InvalidBlock { operator, .. } => Some(operator),
        }
    }
}

/// Structured, position-carrying report produced during a rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    ClauseContext(ClauseContextError),
}

impl Diagnostic {
    pub fn span(&self) -> Span {
        match self {
            Self::ClauseContext(e) => e.span,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::ClauseContext(e) => e.to_string(),
        }
    }
}

/// The main error type for semql entry points.
#[derive(Debug, Error)]
pub enum SemqlError {
    /// Query exceeds the configured size limit.
    #[error("Query is {size} bytes, limit is {limit} bytes")]
    QueryTooLarge { size: usize, limit: usize },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SemqlError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for semql operations.
pub type SemqlResult<T> = Result<T, SemqlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let err = CompileError::new(CompileErrorKind::UnbalancedBraces, 4, "{{a MEANS {{b}}");
        assert_eq!(
            err.to_string(),
            "unbalanced braces at position 4 in template '{{a MEANS {{b}}'"
        );
    }

    #[test]
    fn test_clause_context_display() {
        let err = ClauseContextError {
            operator: "semantic_summarize".to_string(),
            clause: Clause::Where,
            span: Span::new(30, 47),
        };
        assert_eq!(
            err.to_string(),
            "operator 'semantic_summarize' cannot be used in WHERE (at 30..47)"
        );
    }

    #[test]
    fn test_load_error_operator() {
        let err = RegistryLoadError::Source {
            source_id: "ops.yaml".to_string(),
            message: "missing".to_string(),
        };
        assert_eq!(err.operator(), None);

        let err = RegistryLoadError::UnknownBinding {
            operator: "semantic_matches".to_string(),
            binding: "c".to_string(),
        };
        assert_eq!(err.operator(), Some("semantic_matches"));
    }

    #[test]
    fn test_span_len() {
        assert_eq!(Span::new(2, 9).len(), 7);
        assert!(Span::new(4, 4).is_empty());
    }
}
