//! Token-level SystemVerilog preprocessor.
//!
//! Sits between the lexer and the parser: pulls raw tokens one at a time,
//! executes the `` ` `` directive layer (definitions, conditionals,
//! includes, `line`, keyword versions), and expands macro usages into the
//! outbound stream with full provenance attached through the source
//! manager's expansion buffers. The macro engine itself lives in
//! [`macros`]; this module owns the pull loop and directive dispatch.

mod expansion;
mod macros;

use std::{
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use tracing::trace;
use verikit_foundation::{
    errors::{sink::DiagnosticSink, DiagCode, Diagnostic},
    source::{BufferId, SourceLocation, SourceManager},
};
use verikit_lexer::{
    keywords::KeywordVersion,
    token::{DirectiveKind, Token, TokenKind, Trivia, TriviaKind},
    Lexer,
};

#[derive(Debug, Clone)]
pub struct PreprocessorOptions {
    pub max_include_depth: usize,
    /// Allow `` /`` `` `` ``* `` pastes to form a block comment. Other tools
    /// support this and real code depends on it, so it defaults to on.
    pub legacy_comment_paste: bool,
    /// Tool-injected object-like macros, installed as built-ins.
    pub predefines: Vec<(String, i64)>,
}

impl Default for PreprocessorOptions {
    fn default() -> Self {
        Self {
            max_include_depth: 64,
            legacy_comment_paste: true,
            predefines: vec![],
        }
    }
}

/// A parsed `` `define `` directive, shared by the macro table and the
/// expansion engine. The `Rc` identity of this record is what the
/// engine's already-expanded set tracks.
#[derive(Debug)]
pub struct DefineDirective {
    pub directive: Token,
    pub name: Token,
    pub formal_args: Option<Vec<FormalArg>>,
    pub body: Vec<Token>,
}

#[derive(Debug)]
pub struct FormalArg {
    pub name: Token,
    /// Present when the formal carries `= tokens`; the token list may be
    /// empty.
    pub default_value: Option<Vec<Token>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroIntrinsic {
    None,
    File,
    Line,
}

/// An entry in the macro table. Valid entries have either syntax or a
/// non-`None` intrinsic.
#[derive(Debug, Clone)]
pub struct MacroDef {
    pub syntax: Option<Rc<DefineDirective>>,
    pub builtin: bool,
    pub intrinsic: MacroIntrinsic,
}

impl MacroDef {
    pub fn is_intrinsic(&self) -> bool {
        self.intrinsic != MacroIntrinsic::None
    }

    pub fn needs_args(&self) -> bool {
        self.syntax
            .as_ref()
            .is_some_and(|syntax| syntax.formal_args.is_some())
    }

    /// Identity used by the recursion detector.
    fn id(&self) -> Option<usize> {
        self.syntax.as_ref().map(|syntax| Rc::as_ptr(syntax) as usize)
    }
}

/// A parsed actual-argument list of a function-like macro usage.
pub(crate) struct ActualArgList {
    pub open_paren: Token,
    pub args: Vec<Vec<Token>>,
    pub close_paren: Token,
}

struct Branch {
    any_taken: bool,
    has_else: bool,
}

pub struct Preprocessor<'a> {
    source_manager: &'a mut SourceManager,
    diagnostics: &'a mut dyn DiagnosticSink,
    options: PreprocessorOptions,
    macros: HashMap<String, MacroDef>,
    lexers: Vec<Lexer>,
    pushback: Vec<Token>,
    expanded_tokens: VecDeque<Token>,
    pending_trivia: Vec<Trivia>,
    keyword_stack: Vec<KeywordVersion>,
    branch_stack: Vec<Branch>,
}

impl<'a> Preprocessor<'a> {
    pub fn new(
        source_manager: &'a mut SourceManager,
        diagnostics: &'a mut dyn DiagnosticSink,
        options: PreprocessorOptions,
    ) -> Self {
        let mut preprocessor = Self {
            source_manager,
            diagnostics,
            options,
            macros: HashMap::new(),
            lexers: vec![],
            pushback: vec![],
            expanded_tokens: VecDeque::new(),
            pending_trivia: vec![],
            keyword_stack: vec![],
            branch_stack: vec![],
        };
        preprocessor.install_builtins();
        preprocessor
    }

    /// Starts pulling from the given buffer. Usually called once per
    /// translation unit; `include` pushes further buffers internally.
    pub fn push_source(&mut self, buffer: BufferId) {
        let mut lexer = Lexer::new(buffer, self.source_manager.source_rc(buffer));
        lexer.set_keyword_version(self.keyword_version());
        self.lexers.push(lexer);
    }

    /// Pulls the next fully preprocessed token. At the end of input this
    /// returns `EndOfFile` tokens indefinitely.
    pub fn next(&mut self) -> Token {
        loop {
            let token = self.next_raw();
            match token.kind() {
                TokenKind::Directive => {
                    self.pending_trivia.extend(token.trivia().iter().cloned());
                    let kind = token
                        .directive_kind()
                        .expect("directive tokens always carry a directive kind");
                    self.handle_directive(kind, token);
                }
                TokenKind::LineContinuation => {
                    // A stray continuation outside a directive turns into
                    // line-ending trivia on the next token.
                    self.pending_trivia.extend(token.trivia().iter().cloned());
                    self.pending_trivia.push(Trivia::new(
                        TriviaKind::LineContinuation,
                        token.raw_text().to_string(),
                    ));
                }
                TokenKind::EmptyMacroArgument => {
                    self.pending_trivia.extend(token.trivia().iter().cloned());
                }
                TokenKind::EndOfFile => {
                    if !self.branch_stack.is_empty() {
                        self.diagnostics.emit(Diagnostic::new(
                            DiagCode::MissingEndIfDirective,
                            token.location(),
                        ));
                        self.branch_stack.clear();
                    }
                    return self.with_pending_trivia(token);
                }
                _ => return self.with_pending_trivia(token),
            }
        }
    }

    /// Runs the whole input through [`Preprocessor::next`], returning every
    /// token up to and including the final `EndOfFile`.
    pub fn preprocess(&mut self) -> Vec<Token> {
        let mut out = vec![];
        loop {
            let token = self.next();
            let done = token.kind() == TokenKind::EndOfFile;
            out.push(token);
            if done {
                return out;
            }
        }
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    pub(crate) fn keyword_version(&self) -> KeywordVersion {
        self.keyword_stack
            .last()
            .copied()
            .unwrap_or(KeywordVersion::LATEST)
    }

    fn install_builtins(&mut self) {
        self.macros.insert(
            "__LINE__".to_string(),
            MacroDef {
                syntax: None,
                builtin: true,
                intrinsic: MacroIntrinsic::Line,
            },
        );
        self.macros.insert(
            "__FILE__".to_string(),
            MacroDef {
                syntax: None,
                builtin: true,
                intrinsic: MacroIntrinsic::File,
            },
        );
        let predefines = std::mem::take(&mut self.options.predefines);
        for (name, value) in &predefines {
            self.create_builtin_macro(name, *value);
        }
        self.options.predefines = predefines;
    }

    fn create_builtin_macro(&mut self, name: &str, value: i64) {
        let none = SourceLocation::NONE;
        let directive = Token::new(TokenKind::Directive, "`define", vec![], none);
        let name_token = Token::new(TokenKind::Identifier, name.to_string(), vec![], none);
        let body = vec![Token::new(
            TokenKind::IntegerLiteral,
            value.to_string(),
            vec![],
            none,
        )];
        self.macros.insert(
            name.to_string(),
            MacroDef {
                syntax: Some(Rc::new(DefineDirective {
                    directive,
                    name: name_token,
                    formal_args: None,
                    body,
                })),
                builtin: true,
                intrinsic: MacroIntrinsic::None,
            },
        );
    }

    /// Next token of the raw stream: pushback first, then pending expansion
    /// output, then the include stack.
    pub(crate) fn next_raw(&mut self) -> Token {
        if let Some(token) = self.pushback.pop() {
            return token;
        }
        if let Some(token) = self.expanded_tokens.pop_front() {
            return token;
        }
        loop {
            let Some(lexer) = self.lexers.last_mut() else {
                return Token::new(TokenKind::EndOfFile, "", vec![], SourceLocation::NONE);
            };
            let token = lexer.next_token();
            if token.kind() == TokenKind::EndOfFile && self.lexers.len() > 1 {
                // Leaving an include file; its trailing trivia carries over.
                self.pending_trivia.extend(token.trivia().iter().cloned());
                self.lexers.pop();
                continue;
            }
            return token;
        }
    }

    pub(crate) fn peek_raw(&mut self) -> Token {
        let token = self.next_raw();
        self.pushback.push(token.clone());
        token
    }

    fn with_pending_trivia(&mut self, token: Token) -> Token {
        if self.pending_trivia.is_empty() {
            return token;
        }
        let mut trivia = std::mem::take(&mut self.pending_trivia);
        trivia.extend(token.trivia().iter().cloned());
        token.with_trivia(trivia)
    }

    fn skip_to_end_of_line(&mut self) {
        loop {
            let token = self.peek_raw();
            if token.kind() == TokenKind::EndOfFile || !token.is_on_same_line() {
                return;
            }
            self.next_raw();
        }
    }

    fn handle_directive(&mut self, kind: DirectiveKind, directive: Token) {
        match kind {
            DirectiveKind::MacroUsage => self.handle_top_level_macro(directive),
            DirectiveKind::Define => self.handle_define(directive),
            DirectiveKind::Undef => self.handle_undef(directive),
            DirectiveKind::UndefineAll => {
                self.macros.retain(|_, def| def.builtin);
            }
            DirectiveKind::IfDef => self.handle_ifdef(directive, false),
            DirectiveKind::IfNDef => self.handle_ifdef(directive, true),
            DirectiveKind::ElsIf => self.handle_elsif(directive),
            DirectiveKind::Else => self.handle_else(directive),
            DirectiveKind::EndIf => self.handle_endif(directive),
            DirectiveKind::Include => self.handle_include(directive),
            DirectiveKind::Line => self.handle_line(directive),
            DirectiveKind::Pragma => self.skip_to_end_of_line(),
            DirectiveKind::BeginKeywords => self.handle_begin_keywords(directive),
            DirectiveKind::EndKeywords => self.handle_end_keywords(directive),
        }
    }

    fn handle_define(&mut self, directive: Token) {
        let name_token = self.peek_raw();
        if !is_identifier_like(name_token.kind()) || !name_token.is_on_same_line() {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::ExpectedIdentifier,
                directive.end_location(),
            ));
            self.skip_to_end_of_line();
            return;
        }
        let name_token = self.next_raw();

        // A formal argument list only exists when the parenthesis hugs the
        // macro name.
        let next = self.peek_raw();
        let formal_args = if next.kind() == TokenKind::OpenParen && next.trivia().is_empty() {
            Some(self.parse_formal_argument_list())
        } else {
            None
        };

        let mut body = vec![];
        loop {
            let token = self.peek_raw();
            if token.kind() == TokenKind::EndOfFile {
                break;
            }
            // A line continuation keeps the body going even though it
            // carries the line ending itself.
            if !token.is_on_same_line() && token.kind() != TokenKind::LineContinuation {
                break;
            }
            body.push(self.next_raw());
        }

        let name = name_token.raw_text().to_string();
        let def = DefineDirective {
            directive,
            name: name_token,
            formal_args,
            body,
        };

        if let Some(existing) = self.macros.get(&name) {
            if existing.builtin {
                self.diagnostics.emit(
                    Diagnostic::new(DiagCode::RedefinedMacro, def.name.location())
                        .with_arg(name.clone()),
                );
                return;
            }
            // A redefinition with an identical body and formals is accepted
            // silently.
            if let Some(existing_syntax) = &existing.syntax {
                if !macros::is_same_macro(existing_syntax, &def) {
                    self.diagnostics.emit(
                        Diagnostic::new(DiagCode::RedefinedMacro, def.name.location())
                            .with_arg(name.clone()),
                    );
                }
            }
        }

        trace!(name = %name, "defined macro");
        self.macros.insert(
            name,
            MacroDef {
                syntax: Some(Rc::new(def)),
                builtin: false,
                intrinsic: MacroIntrinsic::None,
            },
        );
    }

    fn handle_undef(&mut self, directive: Token) {
        let token = self.peek_raw();
        if !is_identifier_like(token.kind()) || !token.is_on_same_line() {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::ExpectedIdentifier,
                directive.end_location(),
            ));
            return;
        }
        let token = self.next_raw();
        match self.macros.get(token.raw_text()) {
            Some(def) if def.builtin => {
                self.diagnostics.emit(
                    Diagnostic::new(DiagCode::UndefineBuiltinDirective, token.location())
                        .with_arg(token.raw_text()),
                );
            }
            Some(_) => {
                self.macros.remove(token.raw_text());
            }
            None => (),
        }
    }

    /// Consumes the name operand of a conditional directive.
    fn conditional_operand(&mut self, directive: &Token) -> Option<String> {
        let token = self.peek_raw();
        if !is_identifier_like(token.kind()) || !token.is_on_same_line() {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::ExpectedIdentifier,
                directive.end_location(),
            ));
            return None;
        }
        let token = self.next_raw();
        Some(token.raw_text().to_string())
    }

    fn handle_ifdef(&mut self, directive: Token, negated: bool) {
        let defined = self
            .conditional_operand(&directive)
            .is_some_and(|name| self.macros.contains_key(&name));
        let taken = defined != negated;
        self.branch_stack.push(Branch {
            any_taken: taken,
            has_else: false,
        });
        if !taken {
            self.skip_conditional_section();
        }
    }

    fn handle_elsif(&mut self, directive: Token) {
        let _ = self.conditional_operand(&directive);
        if self.branch_stack.is_empty() {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::UnexpectedConditionalDirective,
                directive.location(),
            ));
            return;
        }
        // We just finished an active section, so every later branch of this
        // conditional is dead.
        self.skip_conditional_section();
    }

    fn handle_else(&mut self, directive: Token) {
        let Some(branch) = self.branch_stack.last_mut() else {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::UnexpectedConditionalDirective,
                directive.location(),
            ));
            return;
        };
        if branch.has_else {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::UnexpectedConditionalDirective,
                directive.location(),
            ));
        }
        branch.has_else = true;
        self.skip_conditional_section();
    }

    fn handle_endif(&mut self, directive: Token) {
        if self.branch_stack.pop().is_none() {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::UnexpectedConditionalDirective,
                directive.location(),
            ));
        }
    }

    /// Consumes raw tokens of an inactive conditional section until this
    /// conditional either activates a later branch or pops. Nested
    /// conditionals inside the dead region are tracked without evaluation.
    fn skip_conditional_section(&mut self) {
        let mut nesting = 0usize;
        loop {
            let token = self.next_raw();
            let kind = match token.kind() {
                TokenKind::EndOfFile => return,
                TokenKind::Directive => token
                    .directive_kind()
                    .expect("directive tokens always carry a directive kind"),
                _ => continue,
            };
            match kind {
                DirectiveKind::IfDef | DirectiveKind::IfNDef => nesting += 1,
                DirectiveKind::EndIf if nesting > 0 => nesting -= 1,
                DirectiveKind::EndIf => {
                    self.branch_stack.pop();
                    return;
                }
                DirectiveKind::ElsIf if nesting == 0 => {
                    let defined = self
                        .conditional_operand(&token)
                        .is_some_and(|name| self.macros.contains_key(&name));
                    let branch = self
                        .branch_stack
                        .last_mut()
                        .expect("skipping requires an open conditional");
                    if !branch.any_taken && defined {
                        branch.any_taken = true;
                        return;
                    }
                }
                DirectiveKind::Else if nesting == 0 => {
                    let branch = self
                        .branch_stack
                        .last_mut()
                        .expect("skipping requires an open conditional");
                    branch.has_else = true;
                    if !branch.any_taken {
                        branch.any_taken = true;
                        return;
                    }
                }
                _ => (),
            }
        }
    }

    fn handle_include(&mut self, directive: Token) {
        let token = self.peek_raw();
        if token.kind() != TokenKind::StringLiteral || !token.is_on_same_line() {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::ExpectedIncludeFileName,
                directive.end_location(),
            ));
            self.skip_to_end_of_line();
            return;
        }
        let token = self.next_raw();
        let name = token.string_value().unwrap_or_default().to_string();

        if self.lexers.len() >= self.options.max_include_depth {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::ExceededMaxIncludeDepth,
                token.location(),
            ));
            return;
        }
        match self.source_manager.buffer_for_name(&name) {
            Some(buffer) => {
                trace!(name = %name, "entering include file");
                self.push_source(buffer);
            }
            None => {
                self.diagnostics.emit(
                    Diagnostic::new(DiagCode::CouldNotOpenIncludeFile, token.location())
                        .with_arg(name),
                );
            }
        }
    }

    fn handle_line(&mut self, directive: Token) {
        let Some(line_token) = self.expect_on_line(TokenKind::IntegerLiteral, &directive, DiagCode::ExpectedIntegerLiteral) else {
            return;
        };
        let Some(name_token) = self.expect_on_line(TokenKind::StringLiteral, &directive, DiagCode::ExpectedStringLiteral) else {
            return;
        };
        let Some(level_token) = self.expect_on_line(TokenKind::IntegerLiteral, &directive, DiagCode::ExpectedIntegerLiteral) else {
            return;
        };

        let level = level_token.int_value().unwrap_or(-1);
        if !(0..=2).contains(&level) {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::InvalidLineDirectiveLevel,
                level_token.location(),
            ));
            return;
        }

        let line = line_token.int_value().unwrap_or(1).max(1) as usize;
        let name = name_token.string_value().unwrap_or_default().to_string();
        self.source_manager
            .add_line_directive(directive.location(), line, Some(name));
    }

    fn handle_begin_keywords(&mut self, directive: Token) {
        let Some(version_token) = self.expect_on_line(TokenKind::StringLiteral, &directive, DiagCode::ExpectedStringLiteral) else {
            return;
        };
        let text = version_token.string_value().unwrap_or_default();
        match KeywordVersion::from_version_text(text) {
            Some(version) => {
                self.keyword_stack.push(version);
                self.apply_keyword_version(version);
            }
            None => {
                self.diagnostics.emit(
                    Diagnostic::new(DiagCode::UnrecognizedKeywordVersion, version_token.location())
                        .with_arg(text),
                );
            }
        }
    }

    fn handle_end_keywords(&mut self, directive: Token) {
        if self.keyword_stack.pop().is_none() {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::MismatchedEndKeywordsDirective,
                directive.location(),
            ));
            return;
        }
        let version = self.keyword_version();
        self.apply_keyword_version(version);
    }

    fn apply_keyword_version(&mut self, version: KeywordVersion) {
        for lexer in &mut self.lexers {
            lexer.set_keyword_version(version);
        }
    }

    fn expect_on_line(
        &mut self,
        kind: TokenKind,
        directive: &Token,
        code: DiagCode,
    ) -> Option<Token> {
        let token = self.peek_raw();
        if token.kind() != kind || !token.is_on_same_line() {
            self.diagnostics
                .emit(Diagnostic::new(code, directive.end_location()));
            self.skip_to_end_of_line();
            return None;
        }
        Some(self.next_raw())
    }
}

fn is_identifier_like(kind: TokenKind) -> bool {
    kind == TokenKind::Identifier || kind.is_keyword()
}

/// Reconstructs source text from a preprocessed token stream, trivia
/// included.
pub fn to_source_text(tokens: &[Token]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for token in tokens {
        let _ = write!(out, "{token}");
    }
    out
}
