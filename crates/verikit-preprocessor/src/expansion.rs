//! Tracks where expanded tokens land and what they spell back to.

use verikit_foundation::source::{SourceLocation, SourceManager, SourceRange};
use verikit_lexer::token::{Token, TokenKind, Trivia, TriviaKind};

/// One macro expansion in progress: collects output tokens and relocates
/// each into an expansion buffer chained to the usage site.
pub(crate) struct MacroExpansion {
    dest: Vec<Token>,
    usage_site: Token,
    is_top_level: bool,
    any: bool,
}

impl MacroExpansion {
    pub fn new(usage_site: Token, is_top_level: bool) -> Self {
        Self {
            dest: vec![],
            usage_site,
            is_top_level,
            any: false,
        }
    }

    pub fn get_range(&self) -> SourceRange {
        self.usage_site.range()
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.dest
    }

    /// Maps a spelled token into the current expansion buffer. If the token
    /// lives in a different buffer than the run so far (the body contains
    /// previously expanded tokens), a fresh expansion buffer is minted so the
    /// new run of spellings maps linearly.
    pub fn adjust_loc(
        &self,
        source_manager: &mut SourceManager,
        token: &Token,
        macro_loc: &mut SourceLocation,
        first_loc: &mut SourceLocation,
        expansion_range: SourceRange,
    ) -> SourceLocation {
        if token.location().buffer() != first_loc.buffer() {
            *first_loc = token.location();
            *macro_loc = source_manager.create_expansion_loc(*first_loc, expansion_range, true);
        }
        macro_loc.advanced(token.location().delta(*first_loc))
    }

    /// Appends a token that belongs to the spelling run described by
    /// `macro_loc`/`first_loc`.
    #[allow(clippy::too_many_arguments)]
    pub fn append_in_run(
        &mut self,
        source_manager: &mut SourceManager,
        token: Token,
        macro_loc: &mut SourceLocation,
        first_loc: &mut SourceLocation,
        expansion_range: SourceRange,
        allow_line_continuation: bool,
    ) {
        let location = self.adjust_loc(source_manager, &token, macro_loc, first_loc, expansion_range);
        self.append(token, location, allow_line_continuation);
    }

    pub fn append(&mut self, token: Token, location: SourceLocation, allow_line_continuation: bool) {
        let mut token = token;
        if !self.any {
            // The first emitted token takes its spacing from the usage site,
            // not from wherever the body happened to be spelled.
            token = if self.is_top_level {
                token.with_trivia(Vec::<Trivia>::new())
            } else {
                token.with_trivia(self.usage_site.trivia().to_vec())
            };
            self.any = true;
        }

        // Line continuations get stripped out when we expand macros and
        // become newline trivia instead.
        if token.kind() == TokenKind::LineContinuation && !allow_line_continuation {
            let mut trivia: Vec<Trivia> = token.trivia().to_vec();
            trivia.push(Trivia::new(
                TriviaKind::EndOfLine,
                token.raw_text()[1..].to_string(),
            ));
            self.dest.push(Token::new(
                TokenKind::EmptyMacroArgument,
                "",
                trivia,
                location,
            ));
        } else {
            self.dest.push(token.with_location(location));
        }
    }
}
