//! Diagnostic rendering for errors and warnings
//!
//! Every user-visible failure flows through [`Diagnostic`] so that the
//! compiler, the VM and the driver all print the same shape:
//!
//! ```text
//! script.sbl:3:9: error: unknown identifier 'frobnicate'
//!     3 | print frobnicate(1)
//!       |       ^^^^^^^^^^
//! ```

use crate::error::SableError;
use crate::span::Span;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Fatal problem; the pipeline stops
    Error,
    /// Non-fatal observation
    Warning,
    /// Supplementary location in a chain
    Note,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Note => "note",
        }
    }

    fn color(self) -> Color {
        match self {
            Level::Error => Color::Red,
            Level::Warning => Color::Yellow,
            Level::Note => Color::Cyan,
        }
    }
}

/// A source file held for the lifetime of one interpretation
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Display name (usually the path given to the driver)
    pub name: String,
    /// Full UTF-8 text
    pub text: String,
}

impl SourceFile {
    /// Wrap a name and source text
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            text: text.into(),
        })
    }

    /// 1-based line and column of a byte offset
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let offset = offset.min(self.text.len());
        let mut line = 1;
        let mut col = 1;
        for ch in self.text[..offset].chars() {
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }

    /// The full text of a 1-based line, without its terminator
    pub fn line_text(&self, line: usize) -> &str {
        self.text.lines().nth(line.saturating_sub(1)).unwrap_or("")
    }
}

/// One renderable diagnostic message
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// Severity
    pub level: Level,
    /// Main message text
    pub message: String,
    /// Primary source range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    /// Chained locations rendered as `note:` lines
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<(String, Span)>,
}

impl Diagnostic {
    /// Build an error diagnostic
    pub fn error(message: impl Into<String>, span: Option<Span>) -> Self {
        Self {
            level: Level::Error,
            message: message.into(),
            span,
            related: Vec::new(),
        }
    }

    /// Lift a runtime/compile error into a renderable diagnostic
    pub fn from_error(err: &SableError) -> Self {
        let related = match err {
            SableError::Parse { related, .. } | SableError::Compile { related, .. } => {
                related.clone()
            }
            _ => Vec::new(),
        };
        Self {
            level: Level::Error,
            message: err.to_string(),
            span: err.span(),
            related,
        }
    }

    /// Render to a plain string (no color), mainly for tests
    pub fn render(&self, source: &SourceFile) -> String {
        let mut out = String::new();
        self.render_one(source, self.level, &self.message, self.span, &mut out);
        for (note, span) in &self.related {
            self.render_one(source, Level::Note, note, Some(*span), &mut out);
        }
        out
    }

    fn render_one(
        &self,
        source: &SourceFile,
        level: Level,
        message: &str,
        span: Option<Span>,
        out: &mut String,
    ) {
        match span {
            Some(span) => {
                let (line, col) = source.line_col(span.start);
                let _ = writeln!(
                    out,
                    "{}:{}:{}: {}: {}",
                    source.name,
                    line,
                    col,
                    level.tag(),
                    message
                );
                let text = source.line_text(line);
                let _ = writeln!(out, "{:>5} | {}", line, text);
                let caret_len = span.len().max(1).min(text.len().saturating_sub(col - 1).max(1));
                let _ = writeln!(out, "      | {}{}", " ".repeat(col - 1), "^".repeat(caret_len));
            }
            None => {
                let _ = writeln!(out, "{}: {}: {}", source.name, level.tag(), message);
            }
        }
    }

    /// Render to stderr with a bold, colored severity tag
    pub fn emit(&self, source: &SourceFile) {
        let mut stream = StandardStream::stderr(ColorChoice::Auto);
        let _ = self.emit_to(source, &mut stream);
    }

    fn emit_to(&self, source: &SourceFile, stream: &mut impl WriteColor) -> std::io::Result<()> {
        self.emit_one(source, self.level, &self.message, self.span, stream)?;
        for (note, span) in &self.related {
            self.emit_one(source, Level::Note, note, Some(*span), stream)?;
        }
        Ok(())
    }

    fn emit_one(
        &self,
        source: &SourceFile,
        level: Level,
        message: &str,
        span: Option<Span>,
        stream: &mut impl WriteColor,
    ) -> std::io::Result<()> {
        let mut bold = ColorSpec::new();
        bold.set_bold(true).set_fg(Some(level.color()));

        match span {
            Some(span) => {
                let (line, col) = source.line_col(span.start);
                write!(stream, "{}:{}:{}: ", source.name, line, col)?;
                stream.set_color(&bold)?;
                write!(stream, "{}:", level.tag())?;
                stream.reset()?;
                writeln!(stream, " {}", message)?;

                let text = source.line_text(line);
                writeln!(stream, "{:>5} | {}", line, text)?;
                let caret_len = span.len().max(1).min(text.len().saturating_sub(col - 1).max(1));
                writeln!(stream, "      | {}{}", " ".repeat(col - 1), "^".repeat(caret_len))?;
            }
            None => {
                write!(stream, "{}: ", source.name)?;
                stream.set_color(&bold)?;
                write!(stream, "{}:", level.tag())?;
                stream.reset()?;
                writeln!(stream, " {}", message)?;
            }
        }
        Ok(())
    }

    /// Compact JSON form for tooling
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
