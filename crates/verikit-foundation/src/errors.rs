pub mod sink;

use std::fmt;

pub use codespan_reporting::diagnostic::Severity;
use codespan_reporting::term;
use codespan_reporting::term::termcolor::{ColorChoice, StandardStream};

use crate::source::{BufferId, SourceLocation, SourceManager, SourceRange};

/// Stable identifier of a diagnostic the core can produce. Message text is
/// free to change; the codes are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagCode {
    UnknownDirective,
    UndefineBuiltinDirective,
    ExpectedIdentifier,
    ExpectedMacroArgs,
    ExpectedMacroStringifyEnd,
    IgnoredMacroPaste,
    MisplacedDirectiveChar,
    NotEnoughMacroArgs,
    TooManyActualMacroArgs,
    RecursiveMacro,
    UnbalancedMacroArgDims,
    RedefinedMacro,
    ExpectedToken,
    CouldNotOpenIncludeFile,
    ExpectedIncludeFileName,
    ExceededMaxIncludeDepth,
    UnexpectedConditionalDirective,
    MissingEndIfDirective,
    ExpectedIntegerLiteral,
    ExpectedStringLiteral,
    InvalidLineDirectiveLevel,
    UnrecognizedKeywordVersion,
    MismatchedEndKeywordsDirective,
}

impl DiagCode {
    pub fn severity(self) -> Severity {
        match self {
            DiagCode::IgnoredMacroPaste | DiagCode::RedefinedMacro => Severity::Warning,
            _ => Severity::Error,
        }
    }

    fn message(self) -> &'static str {
        match self {
            DiagCode::UnknownDirective => "unknown macro or compiler directive",
            DiagCode::UndefineBuiltinDirective => "cannot undefine built-in directive",
            DiagCode::ExpectedIdentifier => "expected identifier",
            DiagCode::ExpectedMacroArgs => "expected macro argument list",
            DiagCode::ExpectedMacroStringifyEnd => "expected closing `\" to end stringification",
            DiagCode::IgnoredMacroPaste => "paste token is pointless because it is adjacent to whitespace",
            DiagCode::MisplacedDirectiveChar => "misplaced directive character",
            DiagCode::NotEnoughMacroArgs => "not enough arguments provided to macro",
            DiagCode::TooManyActualMacroArgs => "too many arguments provided to macro",
            DiagCode::RecursiveMacro => "expansion of macro is recursive",
            DiagCode::UnbalancedMacroArgDims => "unbalanced delimiters in macro argument",
            DiagCode::RedefinedMacro => "macro redefined with a different body",
            DiagCode::ExpectedToken => "expected token",
            DiagCode::CouldNotOpenIncludeFile => "could not open include file",
            DiagCode::ExpectedIncludeFileName => "expected an include file name",
            DiagCode::ExceededMaxIncludeDepth => "exceeded maximum include depth",
            DiagCode::UnexpectedConditionalDirective => "unexpected conditional directive",
            DiagCode::MissingEndIfDirective => "missing `endif to close conditional directive",
            DiagCode::ExpectedIntegerLiteral => "expected integer literal",
            DiagCode::ExpectedStringLiteral => "expected string literal",
            DiagCode::InvalidLineDirectiveLevel => "`line directive level must be 0, 1, or 2",
            DiagCode::UnrecognizedKeywordVersion => "unrecognized keyword version",
            DiagCode::MismatchedEndKeywordsDirective => "no opening `begin_keywords for this `end_keywords",
        }
    }
}

/// A diagnostic record: everything the renderer consumes. The location may
/// point into an expansion buffer; [`Diagnostic::expansion_stack`] resolves
/// it into a user-facing caret chain.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: DiagCode,
    pub severity: Severity,
    pub location: SourceLocation,
    /// Additional ranges the message refers to, e.g. the operands of a
    /// binary expression.
    pub ranges: Vec<SourceRange>,
    arg: Option<String>,
}

impl Diagnostic {
    pub fn new(code: DiagCode, location: SourceLocation) -> Self {
        Self {
            code,
            severity: code.severity(),
            location,
            ranges: vec![],
            arg: None,
        }
    }

    /// Attaches the offending text, e.g. the name of an unknown macro.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.arg = Some(arg.into());
        self
    }

    pub fn with_range(mut self, range: SourceRange) -> Self {
        self.ranges.push(range);
        self
    }

    pub fn message(&self) -> String {
        match &self.arg {
            Some(arg) => format!("{}: {}", self.code.message(), arg),
            None => self.code.message().to_string(),
        }
    }

    /// Resolves this diagnostic's location into the chain a renderer prints:
    /// the fully expanded report location plus one note per macro expansion,
    /// outermost first.
    pub fn expansion_stack(&self, sm: &SourceManager) -> ReportedLocation {
        expansion_stack(sm, self.location)
    }

    pub fn emit_to_stderr(&self, sm: &SourceManager) -> Result<(), codespan_reporting::files::Error> {
        let config = term::Config::default();
        let mut stream = StandardStream::stderr(ColorChoice::Auto);
        for rendered in self.to_codespan(sm) {
            term::emit(&mut stream, &config, sm, &rendered)?;
        }
        Ok(())
    }

    /// Converts into codespan diagnostics: the main message at the fully
    /// expanded location, followed by one note per macro expansion.
    pub fn to_codespan(
        &self,
        sm: &SourceManager,
    ) -> Vec<codespan_reporting::diagnostic::Diagnostic<BufferId>> {
        use codespan_reporting::diagnostic::{Diagnostic as Rendered, Label};

        let reported = self.expansion_stack(sm);
        let primary = |loc: SourceLocation| {
            let offset = loc.offset() as usize;
            Label::primary(loc.buffer(), offset..offset + 1)
        };

        let mut out = vec![Rendered::new(self.severity)
            .with_message(self.message())
            .with_labels(
                std::iter::once(primary(reported.location))
                    .chain(self.ranges.iter().map(|range| {
                        let start = sm.fully_original_loc(range.start);
                        let end = sm.fully_original_loc(range.end);
                        let range = if start.buffer() == end.buffer() && start.offset() <= end.offset()
                        {
                            start.offset() as usize..end.offset() as usize
                        } else {
                            start.offset() as usize..start.offset() as usize + 1
                        };
                        Label::secondary(start.buffer(), range)
                    }))
                    .collect(),
            )];
        for note in &reported.notes {
            let spelling = sm.fully_original_loc(note.spelling);
            let message = match &note.macro_name {
                Some(name) => format!("expanded from macro '{name}'"),
                None => "expanded from here".to_string(),
            };
            out.push(
                Rendered::note()
                    .with_message(message)
                    .with_labels(vec![primary(spelling)]),
            );
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message())
    }
}

/// One "expanded from macro" note in a caret chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionNote {
    /// Where the diagnosed location was spelled inside the macro body.
    pub spelling: SourceLocation,
    /// The usage range of that expansion.
    pub usage: SourceRange,
    pub macro_name: Option<String>,
}

/// The data a diagnostics renderer consumes for one location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedLocation {
    /// The fully expanded, user-facing location; always in a file buffer.
    pub location: SourceLocation,
    /// Macro expansion notes, outermost first.
    pub notes: Vec<ExpansionNote>,
}

/// Walks the provenance chain of `loc`. Macro-argument expansions are looked
/// through to the argument's own spelling so carets land in the text the
/// user wrote; every named macro-body expansion contributes one note.
pub fn expansion_stack(sm: &SourceManager, mut loc: SourceLocation) -> ReportedLocation {
    let mut notes = vec![];
    while sm.is_macro_loc(loc) {
        if sm.is_macro_arg_loc(loc) {
            loc = sm.spelling_loc(loc);
        } else {
            let usage = sm
                .expansion_range(loc)
                .expect("macro location must have a usage range");
            notes.push(ExpansionNote {
                spelling: sm.spelling_loc(loc),
                usage,
                macro_name: sm.macro_name(loc).map(String::from),
            });
            loc = usage.start;
        }
    }
    notes.reverse();
    ReportedLocation { location: loc, notes }
}
