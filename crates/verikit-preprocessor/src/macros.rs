//! The macro table and expansion engine: top-level expansion with the
//! paste/stringify fixpoint, body emission with argument substitution and
//! pre-expansion, nested expansion with recursion detection, and the
//! rewrite pass that consumes `` `" `` and `` `` `` tokens.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;
use verikit_foundation::{
    errors::{DiagCode, Diagnostic},
    source::{SourceLocation, SourceRange},
};
use verikit_lexer::{
    token::{DirectiveKind, Token, TokenKind, Trivia, TriviaKind},
    Lexer,
};

use crate::{
    expansion::MacroExpansion, is_identifier_like, ActualArgList, DefineDirective, FormalArg,
    MacroDef, MacroIntrinsic, Preprocessor,
};

/// Failure modes of an expansion. Both abort the current directive; the
/// distinction matters only at the top level, where a recursive usage is
/// re-emitted verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MacroError {
    Recursive,
    Fatal,
}

/// Identities of the macro definitions on the current expansion stack.
#[derive(Default)]
pub(crate) struct AlreadyExpanded(HashSet<usize>);

impl AlreadyExpanded {
    fn insert(&mut self, id: usize) {
        self.0.insert(id);
    }

    fn contains(&self, id: usize) -> bool {
        self.0.contains(&id)
    }
}

/// Runs `f` with `id` marked as being expanded; the mark is removed on every
/// return path so an aborted expansion cannot leak it.
fn with_already_expanded<R>(
    set: &mut AlreadyExpanded,
    id: usize,
    f: impl FnOnce(&mut AlreadyExpanded) -> R,
) -> R {
    set.0.insert(id);
    let result = f(set);
    set.0.remove(&id);
    result
}

/// Parses macro argument lists, pulling first from an in-memory token buffer
/// (during nested expansion) and falling back to the preprocessor's raw
/// stream once the buffer runs dry.
pub(crate) struct MacroParser<'p, 'a> {
    pp: &'p mut Preprocessor<'a>,
    buffer: VecDeque<Token>,
}

impl<'p, 'a> MacroParser<'p, 'a> {
    pub fn new(pp: &'p mut Preprocessor<'a>) -> Self {
        Self {
            pp,
            buffer: VecDeque::new(),
        }
    }

    pub fn with_buffer(pp: &'p mut Preprocessor<'a>, tokens: VecDeque<Token>) -> Self {
        Self { pp, buffer: tokens }
    }

    /// Next token from the buffer only; `None` once it is exhausted. Used by
    /// the replacement-list walk, which must never consume source tokens.
    fn next_buffered(&mut self) -> Option<Token> {
        self.buffer.pop_front()
    }

    fn peek(&mut self) -> Token {
        match self.buffer.front() {
            Some(token) => token.clone(),
            None => self.pp.peek_raw(),
        }
    }

    fn consume(&mut self) -> Token {
        self.buffer
            .pop_front()
            .unwrap_or_else(|| self.pp.next_raw())
    }

    pub fn parse_actual_argument_list(
        &mut self,
        prev_token: &Token,
    ) -> Result<ActualArgList, MacroError> {
        // The macro takes arguments, so we expect to see them here.
        if self.peek().kind() != TokenKind::OpenParen {
            self.pp.diagnostics.emit(Diagnostic::new(
                DiagCode::ExpectedMacroArgs,
                prev_token.end_location(),
            ));
            return Err(MacroError::Fatal);
        }
        let open_paren = self.consume();

        let mut args = vec![];
        loop {
            args.push(self.parse_token_list(true));
            if self.peek().kind() == TokenKind::Comma {
                self.consume();
            } else {
                break;
            }
        }

        let close = self.peek();
        if close.kind() != TokenKind::CloseParen {
            self.pp
                .diagnostics
                .emit(Diagnostic::new(DiagCode::ExpectedToken, close.location()));
            return Err(MacroError::Fatal);
        }
        let close_paren = self.consume();
        Ok(ActualArgList {
            open_paren,
            args,
            close_paren,
        })
    }

    pub fn parse_formal_argument_list(&mut self) -> Vec<FormalArg> {
        let _open_paren = self.consume();
        let mut formals = vec![];
        loop {
            formals.push(self.parse_formal_argument());
            if self.peek().kind() == TokenKind::Comma {
                self.consume();
            } else {
                break;
            }
        }
        if self.peek().kind() == TokenKind::CloseParen {
            self.consume();
        } else {
            let peeked = self.peek();
            self.pp
                .diagnostics
                .emit(Diagnostic::new(DiagCode::ExpectedToken, peeked.location()));
        }
        formals
    }

    fn parse_formal_argument(&mut self) -> FormalArg {
        while self.peek().kind() == TokenKind::LineContinuation {
            self.consume();
        }
        let token = self.peek();
        let name = if is_identifier_like(token.kind()) {
            self.consume()
        } else {
            self.pp.diagnostics.emit(Diagnostic::new(
                DiagCode::ExpectedIdentifier,
                token.location(),
            ));
            Token::new(TokenKind::Identifier, "", vec![], token.location())
        };
        let default_value = if self.peek().kind() == TokenKind::Equals {
            self.consume();
            Some(self.parse_token_list(false))
        } else {
            None
        };
        FormalArg {
            name,
            default_value,
        }
    }

    /// Collects a token run delimited by a top-level `,` or `)`, honoring
    /// nesting of `()`, `[]`, and `{}`.
    fn parse_token_list(&mut self, allow_newlines: bool) -> Vec<Token> {
        let mut tokens: Vec<Token> = vec![];
        let mut delim_pair_stack: Vec<TokenKind> = vec![];
        loop {
            let peeked = self.peek();
            let kind = peeked.kind();
            if kind == TokenKind::EndOfFile || (!allow_newlines && !peeked.is_on_same_line()) {
                if !delim_pair_stack.is_empty() {
                    let location = tokens
                        .last()
                        .map(|token| token.location())
                        .unwrap_or_else(|| peeked.location());
                    self.pp.diagnostics.emit(Diagnostic::new(
                        DiagCode::UnbalancedMacroArgDims,
                        location,
                    ));
                }
                break;
            }

            if delim_pair_stack.is_empty() {
                if kind == TokenKind::Comma || kind == TokenKind::CloseParen {
                    break;
                }
            } else if *delim_pair_stack.last().expect("stack checked non-empty") == kind {
                delim_pair_stack.pop();
            }

            tokens.push(self.consume());

            if let Some(close_kind) = kind.closed_by() {
                delim_pair_stack.push(close_kind);
            }
        }
        tokens
    }
}

struct ArgTokens {
    tokens: Vec<Token>,
    expanded: bool,
}

/// State threaded through the emission of one macro body.
struct BodyContext<'e> {
    expansion: &'e mut MacroExpansion,
    argument_map: HashMap<String, ArgTokens>,
    expansion_loc: SourceLocation,
    first_loc: SourceLocation,
    expansion_range: SourceRange,
    in_define_directive: bool,
}

impl<'a> Preprocessor<'a> {
    pub(crate) fn find_macro(&self, directive: &Token) -> Option<MacroDef> {
        let mut name = directive
            .raw_text()
            .strip_prefix('`')
            .unwrap_or_else(|| directive.raw_text());
        name = name.strip_prefix('\\').unwrap_or(name);
        self.macros.get(name).cloned()
    }

    pub(crate) fn parse_formal_argument_list(&mut self) -> Vec<FormalArg> {
        MacroParser::new(self).parse_formal_argument_list()
    }

    /// Entry point for a `` ` ``-prefixed identifier that is not a reserved
    /// directive.
    pub(crate) fn handle_top_level_macro(&mut self, directive: Token) {
        let Some(macro_def) = self.find_macro(&directive) else {
            self.diagnostics.emit(
                Diagnostic::new(DiagCode::UnknownDirective, directive.location())
                    .with_arg(directive.raw_text()),
            );
            // If we see a parenthesis next, assume they tried to invoke a
            // function-like macro and skip over the tokens.
            if self.peek_raw().kind() == TokenKind::OpenParen {
                let _ = MacroParser::new(self).parse_actual_argument_list(&directive);
            }
            return;
        };

        let actual_args = if macro_def.needs_args() {
            match MacroParser::new(self).parse_actual_argument_list(&directive) {
                Ok(args) => Some(args),
                Err(_) => return,
            }
        } else {
            None
        };

        trace!(name = %directive.raw_text(), "expanding macro");

        let mut expansion = MacroExpansion::new(directive.clone(), true);
        if self
            .expand_macro(&macro_def, &mut expansion, actual_args.as_ref())
            .is_err()
        {
            return;
        }

        // The macro is now expanded out into tokens, but some of those
        // tokens might be more macros that need to be expanded, or paste and
        // stringify operators. A paste can form a new valid macro name, so
        // we loop until neither pass makes progress.
        let mut already_expanded = AlreadyExpanded::default();
        if !macro_def.is_intrinsic() {
            if let Some(id) = macro_def.id() {
                already_expanded.insert(id);
            }
        }

        let mut tokens = expansion.into_tokens();
        loop {
            let expanded = match self.expand_replacement_list(&mut tokens, &mut already_expanded) {
                Ok(expanded) => expanded,
                Err(MacroError::Recursive) => {
                    // The whole expansion is abandoned; the usage token goes
                    // out unchanged.
                    self.expanded_tokens
                        .push_front(directive.with_trivia(Vec::<Trivia>::new()));
                    return;
                }
                Err(MacroError::Fatal) => return,
            };

            let mut rewritten = vec![];
            let new_macros = self.apply_macro_ops(&tokens, &mut rewritten);
            tokens = rewritten;
            if !new_macros && !expanded {
                break;
            }
        }

        for token in tokens.into_iter().rev() {
            self.expanded_tokens.push_front(token);
        }
    }

    /// Expands one macro into `expansion`, substituting arguments.
    pub(crate) fn expand_macro(
        &mut self,
        macro_def: &MacroDef,
        expansion: &mut MacroExpansion,
        actual_args: Option<&ActualArgList>,
    ) -> Result<(), MacroError> {
        if macro_def.is_intrinsic() {
            return self.expand_intrinsic(macro_def.intrinsic, expansion);
        }

        let directive = macro_def
            .syntax
            .as_ref()
            .expect("non-intrinsic macros always have syntax");
        let body = &directive.body;
        if body.is_empty() {
            return Ok(());
        }
        let macro_name = directive.name.raw_text();

        let Some(formal_list) = &directive.formal_args else {
            // Simple macro; just relocate the body tokens. Each expansion
            // gets its own buffer.
            let start = body[0].location();
            let range = expansion.get_range();
            let mut expansion_loc =
                self.source_manager
                    .create_macro_expansion_loc(start, range, macro_name);
            let mut first_loc = start;
            for token in body {
                expansion.append_in_run(
                    self.source_manager,
                    token.clone(),
                    &mut expansion_loc,
                    &mut first_loc,
                    range,
                    false,
                );
            }
            return Ok(());
        };

        // Match up actual arguments with formal parameters.
        let actual_args = actual_args.expect("argument list is parsed before expansion");
        if actual_args.args.len() > formal_list.len() {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::TooManyActualMacroArgs,
                actual_args.open_paren.location(),
            ));
            return Err(MacroError::Fatal);
        }

        let mut argument_map = HashMap::new();
        for (index, formal) in formal_list.iter().enumerate() {
            let tokens = match actual_args.args.get(index) {
                // If the actual argument is empty and we have a default,
                // take that instead.
                Some(actual) if actual.is_empty() && formal.default_value.is_some() => formal
                    .default_value
                    .clone()
                    .expect("checked just above"),
                Some(actual) => actual.clone(),
                None => match &formal.default_value {
                    Some(default) => default.clone(),
                    None => {
                        self.diagnostics.emit(Diagnostic::new(
                            DiagCode::NotEnoughMacroArgs,
                            actual_args.close_paren.location(),
                        ));
                        return Err(MacroError::Fatal);
                    }
                },
            };
            let name = formal.name.raw_text();
            if !name.is_empty() {
                argument_map.insert(
                    name.to_string(),
                    ArgTokens {
                        tokens,
                        expanded: false,
                    },
                );
            }
        }

        let expansion_range = SourceRange::new(
            expansion.get_range().start,
            actual_args.close_paren.end_location(),
        );
        let start = body[0].location();
        let expansion_loc =
            self.source_manager
                .create_macro_expansion_loc(start, expansion_range, macro_name);

        let mut cx = BodyContext {
            expansion,
            argument_map,
            expansion_loc,
            first_loc: start,
            expansion_range,
            in_define_directive: false,
        };

        for token in body {
            // Escaped identifiers can carry an embedded paste marker; such a
            // token is split apart and each piece substituted individually.
            if token.kind() == TokenKind::Identifier && token.raw_text().starts_with('\\') {
                if let Some(index) = token.raw_text().find("``") {
                    let first = token.with_raw_text(token.raw_text()[..index].to_string());
                    self.expand_body_token(&mut cx, first)?;

                    let splits = Lexer::split_tokens(token, index, self.keyword_version());
                    for piece in &splits {
                        self.expand_body_token(&mut cx, piece.clone())?;
                    }

                    // Add an empty argument in here so we can make sure a
                    // space ends the escaped identifier once it gets
                    // concatenated again.
                    if let Some(last) = splits.last() {
                        let empty = Token::new(
                            TokenKind::EmptyMacroArgument,
                            "",
                            vec![Trivia::new(TriviaKind::Whitespace, " ")],
                            last.end_location(),
                        );
                        self.expand_body_token(&mut cx, empty)?;
                    }
                    continue;
                }
            }

            self.expand_body_token(&mut cx, token.clone())?;
        }

        Ok(())
    }

    fn expand_body_token(
        &mut self,
        cx: &mut BodyContext<'_>,
        token: Token,
    ) -> Result<(), MacroError> {
        if cx.in_define_directive && !token.is_on_same_line() {
            cx.in_define_directive = false;
        }

        let ident_like = token.kind() == TokenKind::Identifier
            || token.kind().is_keyword()
            || token.kind() == TokenKind::Directive;
        if !ident_like {
            // Non-identifier, can't be argument substituted.
            cx.expansion.append_in_run(
                self.source_manager,
                token,
                &mut cx.expansion_loc,
                &mut cx.first_loc,
                cx.expansion_range,
                false,
            );
            return Ok(());
        }

        let mut text = token.raw_text();
        if token.kind() == TokenKind::Directive {
            match token.directive_kind() {
                // Other tools allow arguments to replace matching directive
                // names, e.g.:
                //   `define FOO(bar) `bar
                //   `define ONE 1
                //   `FOO(ONE)   // expands to 1
                Some(DirectiveKind::MacroUsage) => text = &text[1..],
                Some(DirectiveKind::Define) => {
                    // Inside a nested `define we will need to insert line
                    // continuations for multi-line arguments.
                    cx.in_define_directive = true;
                    cx.expansion.append_in_run(
                        self.source_manager,
                        token,
                        &mut cx.expansion_loc,
                        &mut cx.first_loc,
                        cx.expansion_range,
                        false,
                    );
                    return Ok(());
                }
                _ => {
                    cx.expansion.append_in_run(
                        self.source_manager,
                        token,
                        &mut cx.expansion_loc,
                        &mut cx.first_loc,
                        cx.expansion_range,
                        false,
                    );
                    return Ok(());
                }
            }
        }

        if !cx.argument_map.contains_key(text) {
            cx.expansion.append_in_run(
                self.source_manager,
                token.clone(),
                &mut cx.expansion_loc,
                &mut cx.first_loc,
                cx.expansion_range,
                false,
            );
            return Ok(());
        }

        // Fully expand out arguments before substitution to make sure we can
        // detect whether a usage of a macro in a replacement list is valid or
        // an illegal recursion.
        let text = text.to_string();
        let arg = cx
            .argument_map
            .get_mut(&text)
            .expect("presence checked above");
        if !arg.expanded {
            let mut tokens = std::mem::take(&mut arg.tokens);
            let mut fresh = AlreadyExpanded::default();
            self.expand_replacement_list(&mut tokens, &mut fresh)?;
            arg.tokens = tokens;
            arg.expanded = true;
        }
        let arg_tokens = arg.tokens.clone();

        if arg_tokens.is_empty() {
            // The macro argument contained no tokens. We still need to
            // supply an empty token here to ensure that the trivia of the
            // formal parameter is passed on.
            let empty = Token::new(
                TokenKind::EmptyMacroArgument,
                "",
                token.trivia().to_vec(),
                token.location(),
            );
            cx.expansion.append_in_run(
                self.source_manager,
                empty,
                &mut cx.expansion_loc,
                &mut cx.first_loc,
                cx.expansion_range,
                false,
            );
            return Ok(());
        }

        // The leading token's spacing needs to come from the formal
        // parameter used in the macro body, not from the argument itself.
        let mut first = arg_tokens[0].with_trivia(token.trivia().to_vec());
        let first_spelling = first.location();

        // Arguments need their own expansion location; the original location
        // comes from the argument text and the usage range points at the
        // formal's slot inside the macro body.
        let token_loc = cx.expansion.adjust_loc(
            self.source_manager,
            &token,
            &mut cx.expansion_loc,
            &mut cx.first_loc,
            cx.expansion_range,
        );
        let arg_range = SourceRange::new(token_loc, token_loc.advanced(token.raw_text().len() as u32));
        let mut arg_loc = self
            .source_manager
            .create_expansion_loc(first_spelling, arg_range, true);

        // A directive being argument-replaced needs the correct directive
        // token fabricated from the substituted text.
        if token.kind() == TokenKind::Directive {
            let grave = Token::new(
                TokenKind::Unknown,
                "`",
                first.trivia().to_vec(),
                first_spelling,
            );
            match Lexer::concatenate_tokens(&grave, &first) {
                Some(combined) => first = combined,
                None => {
                    self.diagnostics.emit(Diagnostic::new(
                        DiagCode::MisplacedDirectiveChar,
                        first_spelling,
                    ));
                }
            }
        }

        let mut arg_first_loc = first_spelling;
        let rest = arg_tokens[1..].iter().cloned();
        if cx.in_define_directive {
            // Inside a define directive we need to insert line continuations
            // any time an expanded token will end up on a new line, so the
            // enclosed define stays one logical line.
            for mut piece in std::iter::once(first).chain(rest) {
                if !piece.is_on_same_line() {
                    let continuation = Token::new(
                        TokenKind::LineContinuation,
                        "\\",
                        piece.trivia().to_vec(),
                        piece.location(),
                    );
                    cx.expansion.append_in_run(
                        self.source_manager,
                        continuation,
                        &mut arg_loc,
                        &mut arg_first_loc,
                        arg_range,
                        true,
                    );
                    piece = piece.with_trivia(Vec::<Trivia>::new());
                }
                cx.expansion.append_in_run(
                    self.source_manager,
                    piece,
                    &mut arg_loc,
                    &mut arg_first_loc,
                    arg_range,
                    false,
                );
            }
        } else {
            for piece in std::iter::once(first).chain(rest) {
                cx.expansion.append_in_run(
                    self.source_manager,
                    piece,
                    &mut arg_loc,
                    &mut arg_first_loc,
                    arg_range,
                    false,
                );
            }
        }

        Ok(())
    }

    fn expand_intrinsic(
        &mut self,
        intrinsic: MacroIntrinsic,
        expansion: &mut MacroExpansion,
    ) -> Result<(), MacroError> {
        let usage_loc = expansion.get_range().start;
        let original = self.source_manager.fully_expanded_loc(usage_loc);
        match intrinsic {
            MacroIntrinsic::File => {
                let file_name = self.source_manager.file_name(original).to_string();
                let raw = format!("\"{file_name}\"");
                let token = Token::new(TokenKind::StringLiteral, raw, vec![], usage_loc);
                expansion.append(token, usage_loc, false);
            }
            MacroIntrinsic::Line => {
                let line = self.source_manager.line_number(original);
                let token =
                    Token::new(TokenKind::IntegerLiteral, line.to_string(), vec![], usage_loc);
                expansion.append(token, usage_loc, false);
            }
            MacroIntrinsic::None => unreachable!("intrinsic expansion requires an intrinsic kind"),
        }
        Ok(())
    }

    /// Recursively expands every known macro usage in `tokens`, in place.
    /// Returns whether anything was expanded so the caller can drive the
    /// fixpoint. Unknown usages are kept as-is; they may become valid after
    /// a later paste.
    pub(crate) fn expand_replacement_list(
        &mut self,
        tokens: &mut Vec<Token>,
        already_expanded: &mut AlreadyExpanded,
    ) -> Result<bool, MacroError> {
        let buffer: VecDeque<Token> = tokens.drain(..).collect();
        let mut parser = MacroParser::with_buffer(self, buffer);
        let mut out: Vec<Token> = vec![];
        let mut expanded_something = false;

        while let Some(token) = parser.next_buffered() {
            if token.kind() != TokenKind::Directive
                || token.directive_kind() != Some(DirectiveKind::MacroUsage)
            {
                out.push(token);
                continue;
            }

            let Some(macro_def) = parser.pp.find_macro(&token) else {
                out.push(token);
                continue;
            };

            if !macro_def.is_intrinsic() {
                if let Some(id) = macro_def.id() {
                    if already_expanded.contains(id) {
                        parser.pp.diagnostics.emit(
                            Diagnostic::new(DiagCode::RecursiveMacro, token.location())
                                .with_arg(token.raw_text()),
                        );
                        return Err(MacroError::Recursive);
                    }
                }
            }

            let actual_args = if macro_def.needs_args() {
                Some(parser.parse_actual_argument_list(&token)?)
            } else {
                None
            };

            let mut expansion = MacroExpansion::new(token.clone(), false);
            parser
                .pp
                .expand_macro(&macro_def, &mut expansion, actual_args.as_ref())?;

            let mut expanded = expansion.into_tokens();
            match macro_def.id() {
                Some(id) => {
                    with_already_expanded(already_expanded, id, |already_expanded| {
                        parser.pp.expand_replacement_list(&mut expanded, already_expanded)
                    })?;
                }
                None => {
                    parser
                        .pp
                        .expand_replacement_list(&mut expanded, already_expanded)?;
                }
            }

            out.extend(expanded);
            expanded_something = true;
        }

        *tokens = out;
        Ok(expanded_something)
    }

    /// Linear rewrite pass over an expansion buffer: handles token pasting
    /// and stringification. Returns true iff it synthesized a new macro
    /// usage token, in which case the caller must loop.
    pub(crate) fn apply_macro_ops(&mut self, tokens: &[Token], dest: &mut Vec<Token>) -> bool {
        let mut empty_arg_trivia: Vec<Trivia> = vec![];
        let mut stringify_buffer: Vec<Token> = vec![];
        let mut comment_buffer: Vec<Token> = vec![];
        let mut stringify: Option<Token> = None;
        let mut synthetic_comment: Option<Token> = None;
        let mut any_new_macros = false;
        let mut did_concat = false;

        let mut i = 0;
        while i < tokens.len() {
            let token = tokens[i].clone();
            let mut new_token: Option<Token> = None;
            let mut next_did_concat = false;

            match token.kind() {
                // Once we see a `" token, we start collecting tokens into
                // their own buffer for stringification.
                TokenKind::MacroQuote => {
                    if stringify.is_none() {
                        stringify = Some(token.clone());
                        stringify_buffer.clear();
                    } else {
                        // All done stringifying; convert saved tokens to a
                        // string literal.
                        let open = stringify.take().expect("checked just above");
                        new_token = Some(Lexer::stringify(&open, &stringify_buffer));
                    }
                }
                TokenKind::MacroPaste => {
                    // A paste on either end of the buffer, or one that
                    // borders whitespace, is ignored. This isn't specified
                    // in the standard; the behavior is pinned by tests.
                    if i == 0
                        || i == tokens.len() - 1
                        || !token.trivia().is_empty()
                        || !tokens[i + 1].trivia().is_empty()
                        || !empty_arg_trivia.is_empty()
                    {
                        self.diagnostics.emit(Diagnostic::new(
                            DiagCode::IgnoredMacroPaste,
                            token.location(),
                        ));
                        // We're ignoring this token, but don't lose its
                        // trivia or our spacing can get messed up.
                        empty_arg_trivia.extend(token.trivia().iter().cloned());
                    } else if stringify.is_some() {
                        // Right after the opening quote or right before the
                        // closing quote we'd be pasting against nothing.
                        if stringify_buffer.is_empty()
                            || tokens[i + 1].kind() == TokenKind::MacroQuote
                        {
                            self.diagnostics.emit(Diagnostic::new(
                                DiagCode::IgnoredMacroPaste,
                                token.location(),
                            ));
                        } else if let Some(combined) = Lexer::concatenate_tokens(
                            stringify_buffer.last().expect("buffer checked non-empty"),
                            &tokens[i + 1],
                        ) {
                            stringify_buffer.pop();
                            i += 1;
                            new_token = Some(combined);
                        }
                    } else if synthetic_comment.is_some() {
                        // Only a *``/ paste can close the synthetic comment;
                        // any other paste in there is already comment text.
                        if comment_buffer.last().map(Token::kind) == Some(TokenKind::Star)
                            && tokens[i + 1].kind() == TokenKind::Slash
                        {
                            comment_buffer.push(tokens[i + 1].clone());
                            i += 1;

                            let comment = synthetic_comment.take().expect("checked just above");
                            empty_arg_trivia.extend(comment.trivia().iter().cloned());
                            empty_arg_trivia.push(Lexer::commentify(&comment_buffer));
                        }
                    } else if let Some(left) = dest.last().cloned() {
                        let right = &tokens[i + 1];

                        // Other tools allow concatenating a '/' with a '*'
                        // to form a block comment, and real world code
                        // depends on it.
                        if self.options.legacy_comment_paste
                            && left.kind() == TokenKind::Slash
                            && right.kind() == TokenKind::Star
                        {
                            comment_buffer.clear();
                            dest.pop();
                            i += 1;

                            comment_buffer.push(left.with_trivia(Vec::<Trivia>::new()));
                            synthetic_comment = Some(left);
                            new_token = Some(right.clone());
                        } else if let Some(combined) = Lexer::concatenate_tokens(&left, right) {
                            dest.pop();
                            i += 1;

                            next_did_concat = true;
                            any_new_macros |= combined.kind() == TokenKind::Directive
                                && combined.directive_kind() == Some(DirectiveKind::MacroUsage);
                            new_token = Some(combined);
                        }
                    } else {
                        // The left neighbor was an empty macro argument;
                        // there is nothing to paste to.
                        self.diagnostics.emit(Diagnostic::new(
                            DiagCode::IgnoredMacroPaste,
                            token.location(),
                        ));
                        empty_arg_trivia.extend(token.trivia().iter().cloned());
                    }
                }
                _ => {
                    // If the last iteration did a concatenation and this
                    // token hugs it, keep the paste going.
                    let mut continued = false;
                    if did_concat && token.trivia().is_empty() && empty_arg_trivia.is_empty() {
                        if let Some(combined) = Lexer::concatenate_tokens(
                            dest.last().expect("a concatenation leaves its result behind"),
                            &token,
                        ) {
                            dest.pop();
                            next_did_concat = true;
                            new_token = Some(combined);
                            continued = true;
                        }
                    }
                    if !continued {
                        new_token = Some(token.clone());
                    }
                }
            }

            did_concat = next_did_concat;
            let Some(mut new_token) = new_token else {
                i += 1;
                continue;
            };

            // An empty macro argument just donates its trivia to the next
            // token we find.
            if new_token.kind() == TokenKind::EmptyMacroArgument {
                empty_arg_trivia.extend(new_token.trivia().iter().cloned());
                i += 1;
                continue;
            }

            if !empty_arg_trivia.is_empty() {
                let mut merged = std::mem::take(&mut empty_arg_trivia);
                merged.extend(new_token.trivia().iter().cloned());
                new_token = new_token.with_trivia(merged);
            }

            if stringify.is_none() {
                if synthetic_comment.is_some() {
                    comment_buffer.push(new_token);
                } else {
                    dest.push(new_token);
                }
                i += 1;
                continue;
            }

            // An escaped identifier that includes a `" within it gets split
            // up to match the behavior of other simulators.
            if new_token.kind() == TokenKind::Identifier && new_token.raw_text().starts_with('\\') {
                if let Some(offset) = new_token.raw_text().find("`\"") {
                    // Split the token and finish the stringification with
                    // the left piece.
                    let split = Token::new(
                        TokenKind::Identifier,
                        new_token.raw_text()[..offset].to_string(),
                        new_token.trivia().to_vec(),
                        new_token.location(),
                    );
                    stringify_buffer.push(split);

                    let open = stringify.take().expect("stringify mode checked above");
                    dest.push(Lexer::stringify(&open, &stringify_buffer));

                    // Now re-lex the remainder after the split and run it
                    // through the rewrite as well.
                    let splits =
                        Lexer::split_tokens(&new_token, offset + 2, self.keyword_version());
                    any_new_macros |= self.apply_macro_ops(&splits, dest);
                    i += 1;
                    continue;
                }
            }

            stringify_buffer.push(new_token);
            i += 1;
        }

        if let Some(open) = stringify {
            self.diagnostics.emit(Diagnostic::new(
                DiagCode::ExpectedMacroStringifyEnd,
                open.location(),
            ));
            // Recover by flushing the buffered tokens as plain output.
            dest.append(&mut stringify_buffer);
        }

        any_new_macros
    }
}

fn is_same_token_list(left: &[Token], right: &[Token]) -> bool {
    left.len() == right.len()
        && left
            .iter()
            .zip(right.iter())
            .all(|(left, right)| left.is_same(right))
}

/// Whether two definitions are identical per the token-sameness rule, in
/// which case a redefinition is silently accepted.
pub(crate) fn is_same_macro(left: &DefineDirective, right: &DefineDirective) -> bool {
    match (&left.formal_args, &right.formal_args) {
        (None, None) => (),
        (Some(left_args), Some(right_args)) => {
            if left_args.len() != right_args.len() {
                return false;
            }
            for (left_arg, right_arg) in left_args.iter().zip(right_args.iter()) {
                if !left_arg.name.is_same(&right_arg.name) {
                    return false;
                }
                match (&left_arg.default_value, &right_arg.default_value) {
                    (None, None) => (),
                    (Some(left_default), Some(right_default)) => {
                        if !is_same_token_list(left_default, right_default) {
                            return false;
                        }
                    }
                    _ => return false,
                }
            }
        }
        _ => return false,
    }
    is_same_token_list(&left.body, &right.body)
}
