use std::collections::HashSet;

use crate::errors::{DiagCode, Diagnostic, Severity};

/// Destination for diagnostic records as the preprocessor produces them.
///
/// The engine reports through `&mut dyn DiagnosticSink`, so the caller
/// decides what becomes of a record: batch it for rendering, tally it, or
/// swallow it while probing input speculatively.
pub trait DiagnosticSink {
    fn emit(&mut self, diagnostic: Diagnostic);
}

/// Discards every record. Used where diagnostics must not escape, such as
/// probing whether a token run would expand cleanly.
impl DiagnosticSink for () {
    fn emit(&mut self, _: Diagnostic) {}
}

impl DiagnosticSink for Vec<Diagnostic> {
    fn emit(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

/// Forwards to an inner sink while tallying errors and warnings, so a
/// driver can decide its exit status without re-scanning the collected
/// records.
pub struct CountingSink<S> {
    pub inner: S,
    pub num_errors: usize,
    pub num_warnings: usize,
}

impl<S> CountingSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            num_errors: 0,
            num_warnings: 0,
        }
    }
}

impl<S: DiagnosticSink> DiagnosticSink for CountingSink<S> {
    fn emit(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Bug | Severity::Error => self.num_errors += 1,
            Severity::Warning => self.num_warnings += 1,
            _ => (),
        }
        self.inner.emit(diagnostic);
    }
}

/// Swallows records whose code is in the ignore set and forwards the rest.
/// This is the hook a pragma-driven suppression layer plugs into; ignoring
/// `IgnoredMacroPaste`, for example, silences the warning for pastes that
/// border whitespace without touching their trivia salvage.
pub struct FilteringSink<S> {
    pub inner: S,
    ignored: HashSet<DiagCode>,
}

impl<S> FilteringSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            ignored: HashSet::new(),
        }
    }

    pub fn ignore(&mut self, code: DiagCode) {
        self.ignored.insert(code);
    }
}

impl<S: DiagnosticSink> DiagnosticSink for FilteringSink<S> {
    fn emit(&mut self, diagnostic: Diagnostic) {
        if !self.ignored.contains(&diagnostic.code) {
            self.inner.emit(diagnostic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceLocation;

    fn diag(code: DiagCode) -> Diagnostic {
        Diagnostic::new(code, SourceLocation::NONE)
    }

    #[test]
    fn counting_sink_tallies_by_severity() {
        let mut sink = CountingSink::new(Vec::new());
        sink.emit(diag(DiagCode::RecursiveMacro));
        sink.emit(diag(DiagCode::IgnoredMacroPaste));
        sink.emit(diag(DiagCode::RedefinedMacro));

        assert_eq!(sink.num_errors, 1);
        assert_eq!(sink.num_warnings, 2);
        assert_eq!(sink.inner.len(), 3);
    }

    #[test]
    fn filtering_sink_drops_ignored_codes() {
        let mut sink = FilteringSink::new(Vec::new());
        sink.ignore(DiagCode::IgnoredMacroPaste);
        sink.emit(diag(DiagCode::IgnoredMacroPaste));
        sink.emit(diag(DiagCode::UnknownDirective));

        assert_eq!(sink.inner.len(), 1);
        assert_eq!(sink.inner[0].code, DiagCode::UnknownDirective);
    }
}
