//! Error types shared across the compilation pipeline and the VM

use crate::span::Span;
use thiserror::Error;

/// Top-level error for everything the runtime can fail with
#[derive(Debug, Clone, Error)]
pub enum SableError {
    /// Lexing or parsing failure
    #[error("{message}")]
    Parse {
        /// Human-readable description
        message: String,
        /// Offending source range
        span: Option<Span>,
        /// Related locations, each with its own note text
        related: Vec<(String, Span)>,
    },
    /// Semantic failure while lowering the AST
    #[error("{message}")]
    Compile {
        /// Human-readable description
        message: String,
        /// Offending source range
        span: Option<Span>,
        /// Related locations, each with its own note text
        related: Vec<(String, Span)>,
    },
    /// Failure raised while the VM was executing
    #[error("{message}")]
    Runtime {
        /// Human-readable description
        message: String,
        /// Source range recovered from the code object's token map
        span: Option<Span>,
    },
    /// Filesystem-level failure in the driver
    #[error("{0}")]
    Io(String),
}

impl SableError {
    /// Parse error pinned to a source range
    pub fn parse(message: impl Into<String>, span: Span) -> Self {
        SableError::Parse {
            message: message.into(),
            span: Some(span),
            related: Vec::new(),
        }
    }

    /// Compile error pinned to a source range
    pub fn compile(message: impl Into<String>, span: Span) -> Self {
        SableError::Compile {
            message: message.into(),
            span: Some(span),
            related: Vec::new(),
        }
    }

    /// Runtime error with no recovered source location
    pub fn runtime(message: impl Into<String>) -> Self {
        SableError::Runtime {
            message: message.into(),
            span: None,
        }
    }

    /// Runtime error pinned to a source range
    pub fn runtime_at(message: impl Into<String>, span: Span) -> Self {
        SableError::Runtime {
            message: message.into(),
            span: Some(span),
        }
    }

    /// Attach a related location ("first defined here...")
    pub fn with_related(mut self, note: impl Into<String>, at: Span) -> Self {
        if let SableError::Parse { related, .. } | SableError::Compile { related, .. } = &mut self {
            related.push((note.into(), at));
        }
        self
    }

    /// The primary source range, if one was recorded
    pub fn span(&self) -> Option<Span> {
        match self {
            SableError::Parse { span, .. } | SableError::Compile { span, .. } => *span,
            SableError::Runtime { span, .. } => *span,
            SableError::Io(_) => None,
        }
    }

    /// Fill in a span on a runtime error that has none
    pub fn or_span(mut self, at: Option<Span>) -> Self {
        if let SableError::Runtime { span, .. } = &mut self {
            if span.is_none() {
                *span = at;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_related_chain() {
        let err = SableError::compile("redefinition of 'x'", Span::new(10, 11))
            .with_related("first defined here...", Span::new(2, 3));
        match err {
            SableError::Compile { related, .. } => assert_eq!(related.len(), 1),
            _ => panic!("expected compile error"),
        }
    }

    #[test]
    fn test_or_span_only_fills_empty() {
        let err = SableError::runtime("invalid operands").or_span(Some(Span::new(5, 6)));
        assert_eq!(err.span(), Some(Span::new(5, 6)));

        let err = SableError::runtime_at("invalid operands", Span::new(1, 2))
            .or_span(Some(Span::new(5, 6)));
        assert_eq!(err.span(), Some(Span::new(1, 2)));
    }
}
