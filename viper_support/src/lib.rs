//! Shared diagnostics and source-location primitives used across the
//! Viper IL toolchain (parser, verifier, optimizer, VM).

use std::fmt;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A position in a source file: file id plus 1-based line and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SourceLoc {
    pub file: u32,
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub const UNKNOWN: SourceLoc = SourceLoc { file: 0, line: 0, column: 0 };

    pub fn new(file: u32, line: u32, column: u32) -> Self {
        Self { file, line, column }
    }

    pub fn is_known(&self) -> bool {
        *self != Self::UNKNOWN
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Registry mapping file ids to paths and lazily-loaded contents, used by
/// the VM's source-level tracer (§4.H) to print `file:line:col` without
/// re-reading the file on every instruction.
#[derive(Debug, Default)]
pub struct SourceManager {
    paths: Vec<String>,
    contents: Vec<Option<String>>,
}

impl SourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: impl Into<String>) -> u32 {
        self.paths.push(path.into());
        self.contents.push(None);
        (self.paths.len() - 1) as u32
    }

    pub fn path(&self, file: u32) -> Option<&str> {
        self.paths.get(file as usize).map(|s| s.as_str())
    }

    /// Lazily reads the file's contents and returns the requested line
    /// (1-based). Returns `None` if the file id is unknown or unreadable.
    pub fn line(&mut self, file: u32, line: u32) -> Option<&str> {
        let idx = file as usize;
        if idx >= self.paths.len() {
            return None;
        }
        if self.contents[idx].is_none() {
            self.contents[idx] = std::fs::read_to_string(&self.paths[idx]).ok();
        }
        self.contents[idx]
            .as_ref()
            .and_then(|text| text.lines().nth(line.saturating_sub(1) as usize))
    }
}

/// Severity of a diagnostic emitted by the parser or verifier (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Note => write!(f, "note"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A single static diagnostic: a severity, a message, and an optional
/// source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub loc: Option<SourceLoc>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self { severity: Severity::Error, message: message.into(), loc: None }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self { severity: Severity::Warning, message: message.into(), loc: None }
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self { severity: Severity::Note, message: message.into(), loc: None }
    }

    pub fn at(mut self, loc: SourceLoc) -> Self {
        self.loc = Some(loc);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.loc {
            Some(loc) if loc.is_known() => write!(f, "{}: {} ({})", self.severity, self.message, loc),
            _ => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// Accumulates diagnostics across a pipeline run rather than
/// short-circuiting on the first error (§4.D, §7): callers see every
/// problem discovered in one pass.
#[derive(Debug, Default, Clone)]
pub struct DiagnosticEngine {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.diagnostics.push(diag);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(Diagnostic::error(message));
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    pub fn merge(&mut self, other: DiagnosticEngine) {
        self.diagnostics.extend(other.diagnostics);
    }
}

impl fmt::Display for DiagnosticEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for diag in &self.diagnostics {
            writeln!(f, "{}", diag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn source_loc_unknown_default() {
        let loc = SourceLoc::default();
        assert!(!loc.is_known());
        assert_eq!(loc, SourceLoc::UNKNOWN);
    }

    #[test]
    fn diagnostic_engine_accumulates_without_short_circuit() {
        let mut engine = DiagnosticEngine::new();
        engine.error("first problem");
        engine.push(Diagnostic::warning("a warning").at(SourceLoc::new(1, 3, 4)));
        engine.error("second problem");

        assert_eq!(engine.diagnostics().len(), 3);
        assert!(engine.has_errors());
    }

    #[test]
    fn diagnostic_display_includes_location_when_known() {
        let diag = Diagnostic::error("bad opcode").at(SourceLoc::new(1, 5, 2));
        assert_eq!(diag.to_string(), "error: bad opcode (5:2)");

        let diag = Diagnostic::error("bad opcode");
        assert_eq!(diag.to_string(), "error: bad opcode");
    }
}
