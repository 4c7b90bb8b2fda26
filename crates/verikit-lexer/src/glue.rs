//! Token glue helpers the macro engine calls back into: turning token runs
//! into string literals and comments, pasting two tokens into one, and
//! re-lexing composite tokens that had to be split.

use std::rc::Rc;

use crate::{
    keywords::KeywordVersion,
    token::{Token, TokenKind, Trivia, TriviaKind},
};

use super::Lexer;

impl Lexer {
    /// Builds the string literal produced by a `` `"..."`` stringification.
    /// The result takes the opening quote's trivia and location; trivia
    /// between the stringified tokens is preserved as spacing.
    pub fn stringify(open_quote: &Token, tokens: &[Token]) -> Token {
        let mut text = String::from("\"");
        for (i, token) in tokens.iter().enumerate() {
            if i > 0 {
                for trivia in token.trivia() {
                    text.push_str(trivia.raw_text());
                }
            }
            for char in token.raw_text().chars() {
                match char {
                    '"' => text.push_str("\\\""),
                    '\\' => text.push_str("\\\\"),
                    _ => text.push(char),
                }
            }
        }
        text.push('"');
        Token::new(
            TokenKind::StringLiteral,
            text,
            open_quote.trivia().to_vec(),
            open_quote.location(),
        )
    }

    /// Pastes two tokens together. Returns the combined token if the joined
    /// text lexes cleanly as exactly one token, or `None` if it does not.
    /// The result carries the left token's trivia and location.
    pub fn concatenate_tokens(left: &Token, right: &Token) -> Option<Token> {
        let combined = format!("{}{}", left.raw_text(), right.raw_text());
        let mut lexer = Lexer::new(left.location().buffer(), Rc::from(combined.as_str()));

        let token = lexer.next_token();
        if !token.trivia().is_empty()
            || matches!(token.kind(), TokenKind::Unknown | TokenKind::EndOfFile)
        {
            return None;
        }
        let rest = lexer.next_token();
        if rest.kind() != TokenKind::EndOfFile || !rest.trivia().is_empty() {
            return None;
        }

        Some(
            token
                .with_location(left.location())
                .with_trivia(left.trivia().to_vec()),
        )
    }

    /// Re-lexes the tail of a composite token, starting at `offset` bytes
    /// into its raw text. Used for escaped identifiers that contain an
    /// embedded paste or stringification marker.
    pub fn split_tokens(token: &Token, offset: usize, keyword_version: KeywordVersion) -> Vec<Token> {
        let tail = &token.raw_text()[offset..];
        let mut lexer = Lexer::new(token.location().buffer(), Rc::from(tail));
        lexer.set_keyword_version(keyword_version);

        let base = token.location().advanced(offset as u32);
        let mut out = vec![];
        loop {
            let piece = lexer.next_token();
            if piece.kind() == TokenKind::EndOfFile {
                break;
            }
            let offset_in_tail = piece.location().offset();
            out.push(piece.with_location(base.advanced(offset_in_tail)));
        }
        out
    }

    /// Joins a run of tokens into a single block-comment trivia.
    pub fn commentify(tokens: &[Token]) -> Trivia {
        let mut text = String::new();
        for (i, token) in tokens.iter().enumerate() {
            if i > 0 {
                for trivia in token.trivia() {
                    text.push_str(trivia.raw_text());
                }
            }
            text.push_str(token.raw_text());
        }
        Trivia::new(TriviaKind::BlockComment, text)
    }
}
