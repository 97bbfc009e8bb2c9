/*
 * Copyright (c) 2026 the Vibe Engine developers.
 *
 * This file is part of the Vibe Script Engine.
 *
 * Licensed under the MIT License. See LICENSE for details.
 */

//! Source positions, spans, compile diagnostics, and decorated runtime
//! failures.
//!
//! Spans are attached to instructions through a sparse map kept in the
//! program; the VM looks the failing instruction up in that map and adds a
//! call-stack capture before surfacing an error to the host.

use crate::symbols::SymbolId;
use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Positions & Spans ───────────────────────────────────────────────────────

/// A point in the source text. `line` and `column` are 1-based, `offset` is
/// a 0-based UTF-8 byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
    pub offset: u32,
}

impl Position {
    pub fn new(line: u32, column: u32, offset: u32) -> Self {
        Position { line, column, offset }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A half-open source range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Self {
        Span { start, end }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Converts byte offsets into line/column positions. Built once per source
/// text; the parser works in byte offsets and the compiler converts when it
/// records spans.
#[derive(Debug)]
pub struct LineIndex {
    /// Byte offset at which each line starts. `line_starts[0]` is always 0.
    line_starts: Vec<u32>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0u32];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        LineIndex { line_starts }
    }

    /// Resolve a byte offset to a position. Offsets past the end clamp to
    /// the last line.
    pub fn position(&self, offset: u32) -> Position {
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = self.line_starts[line_idx];
        Position {
            line: line_idx as u32 + 1,
            column: offset - line_start + 1,
            offset,
        }
    }

    pub fn span(&self, start: u32, end: u32) -> Span {
        Span::new(self.position(start), self.position(end))
    }
}

// ─── Compile diagnostics ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A single compile-time finding. Compilation failures produce a null
/// program plus a list of these; warnings ride along with a successful
/// program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Option<Span>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Option<Span>) -> Self {
        Diagnostic { severity: Severity::Error, message: message.into(), span }
    }

    pub fn warning(message: impl Into<String>, span: Option<Span>) -> Self {
        Diagnostic { severity: Severity::Warning, message: message.into(), span }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span {
            Some(span) => write!(f, "{} at {}: {}", self.severity, span.start, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

// ─── Runtime failures ────────────────────────────────────────────────────────

/// One frame of a captured stack trace: the function that was active and
/// the span of the call that entered it (absent for the entry function).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackTraceFrame {
    pub function_name: String,
    pub call_site: Option<Span>,
}

/// A runtime error decorated with everything the VM knew at the point of
/// failure. The raw `VmError` message is preserved in `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeFailure {
    pub message: String,
    pub symbol: Option<SymbolId>,
    pub instruction_index: Option<usize>,
    pub span: Option<Span>,
    pub call_stack: Vec<StackTraceFrame>,
}

impl fmt::Display for RuntimeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(span) = self.span {
            write!(f, " at {}", span.start)?;
        }
        for frame in &self.call_stack {
            write!(f, "\n  in {}", frame.function_name)?;
            if let Some(site) = frame.call_site {
                write!(f, " (called at {})", site.start)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_index_positions() {
        let idx = LineIndex::new("let x = 1\nlet y = 2\n");
        assert_eq!(idx.position(0), Position::new(1, 1, 0));
        assert_eq!(idx.position(4), Position::new(1, 5, 4));
        // First char of line 2 sits right after the newline at offset 9.
        assert_eq!(idx.position(10), Position::new(2, 1, 10));
        assert_eq!(idx.position(14), Position::new(2, 5, 14));
    }

    #[test]
    fn test_line_index_clamps_past_end() {
        let idx = LineIndex::new("ab");
        let pos = idx.position(10);
        assert_eq!(pos.line, 1);
        assert_eq!(pos.offset, 10);
    }

    #[test]
    fn test_span_ordering_holds() {
        let idx = LineIndex::new("a = 1\nb = 2");
        let span = idx.span(2, 9);
        assert!(span.end.offset >= span.start.offset);
        assert!(span.end.line >= span.start.line);
    }

    #[test]
    fn test_diagnostic_display() {
        let idx = LineIndex::new("return !");
        let d = Diagnostic::error("unsupported expression", Some(idx.span(7, 8)));
        let rendered = d.to_string();
        assert!(rendered.contains("error"));
        assert!(rendered.contains("1:8"));
    }

    #[test]
    fn test_runtime_failure_display_includes_stack() {
        let failure = RuntimeFailure {
            message: "missing field".to_string(),
            symbol: None,
            instruction_index: Some(3),
            span: None,
            call_stack: vec![StackTraceFrame {
                function_name: "main".to_string(),
                call_site: None,
            }],
        };
        assert!(failure.to_string().contains("in main"));
    }
}
