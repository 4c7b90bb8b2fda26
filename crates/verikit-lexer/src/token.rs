use std::{fmt, rc::Rc};

use verikit_foundation::source::{SourceLocation, SourceRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenKind {
    Identifier,

    IntegerLiteral,
    RealLiteral,
    StringLiteral,

    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]
    OpenBrace,    // {
    CloseBrace,   // }
    Comma,        // ,
    Semicolon,    // ;
    Colon,        // :
    Dot,          // .
    Question,     // ?
    Hash,         // #
    Dollar,       // $
    At,           // @
    Apostrophe,   // '

    Plus,          // +
    DoublePlus,    // ++
    Minus,         // -
    DoubleMinus,   // --
    Star,          // *
    DoubleStar,    // **
    Slash,         // /
    Percent,       // %
    Equals,        // =
    DoubleEquals,  // ==
    Exclaim,       // !
    ExclaimEquals, // !=
    Less,          // <
    LessEquals,    // <=
    LeftShift,     // <<
    Greater,       // >
    GreaterEquals, // >=
    RightShift,    // >>
    And,           // &
    DoubleAnd,     // &&
    Or,            // |
    DoubleOr,      // ||
    Xor,           // ^
    Tilde,         // ~

    // Keywords from the 1364 base set.
    ModuleKeyword,
    EndModuleKeyword,
    BeginKeyword,
    EndKeyword,
    WireKeyword,
    RegKeyword,
    IntegerKeyword,
    AssignKeyword,
    InitialKeyword,
    AlwaysKeyword,
    ParameterKeyword,
    GenerateKeyword,
    EndGenerateKeyword,
    FunctionKeyword,
    EndFunctionKeyword,
    // Keywords added by 1800.
    LogicKeyword,
    BitKeyword,
    IntKeyword,
    StructKeyword,
    TypedefKeyword,
    EnumKeyword,
    PackedKeyword,

    /// A `` ` ``-prefixed name; carries a [`DirectiveKind`] value.
    Directive,
    /// `` `" `` - stringification delimiter.
    MacroQuote,
    /// `` `` `` - token paste operator.
    MacroPaste,
    /// Placeholder emitted when a formal substitutes to nothing; consumed by
    /// the rewrite pass, which donates its trivia to the next real token.
    EmptyMacroArgument,
    /// `\` followed by a newline.
    LineContinuation,
    Unknown,
    EndOfFile,
}

impl TokenKind {
    pub fn is_keyword(&self) -> bool {
        *self >= TokenKind::ModuleKeyword && *self <= TokenKind::PackedKeyword
    }

    /// For an opening delimiter, the kind that closes it.
    pub fn closed_by(&self) -> Option<TokenKind> {
        match self {
            TokenKind::OpenParen => Some(TokenKind::CloseParen),
            TokenKind::OpenBracket => Some(TokenKind::CloseBracket),
            TokenKind::OpenBrace => Some(TokenKind::CloseBrace),
            _ => None,
        }
    }
}

/// The directive layer's classification of a `` ` ``-prefixed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    Define,
    Undef,
    UndefineAll,
    IfDef,
    IfNDef,
    ElsIf,
    Else,
    EndIf,
    Include,
    Line,
    Pragma,
    BeginKeywords,
    EndKeywords,
    /// Anything that is not a reserved directive; resolved against the macro
    /// table at expansion time.
    MacroUsage,
}

impl DirectiveKind {
    pub fn from_name(name: &str) -> DirectiveKind {
        match name {
            "define" => DirectiveKind::Define,
            "undef" => DirectiveKind::Undef,
            "undefineall" => DirectiveKind::UndefineAll,
            "ifdef" => DirectiveKind::IfDef,
            "ifndef" => DirectiveKind::IfNDef,
            "elsif" => DirectiveKind::ElsIf,
            "else" => DirectiveKind::Else,
            "endif" => DirectiveKind::EndIf,
            "include" => DirectiveKind::Include,
            "line" => DirectiveKind::Line,
            "pragma" => DirectiveKind::Pragma,
            "begin_keywords" => DirectiveKind::BeginKeywords,
            "end_keywords" => DirectiveKind::EndKeywords,
            _ => DirectiveKind::MacroUsage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriviaKind {
    Whitespace,
    EndOfLine,
    LineContinuation,
    LineComment,
    BlockComment,
}

/// A piece of non-token text preceding a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trivia {
    pub kind: TriviaKind,
    raw_text: Rc<str>,
}

impl Trivia {
    pub fn new(kind: TriviaKind, raw_text: impl Into<Rc<str>>) -> Self {
        Self {
            kind,
            raw_text: raw_text.into(),
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }
}

/// Pre-parsed payload of a token, when its kind has one.
#[derive(Debug, Clone)]
pub enum TokenValue {
    Integer(i64),
    Real(f64),
    Str(Rc<str>),
    Directive(DirectiveKind),
}

/// An immutable token. The `with_*` constructors produce a new token
/// differing in exactly one field; the original is never touched. Raw text
/// and trivia are reference-counted, so copies are cheap.
#[derive(Debug, Clone)]
pub struct Token {
    kind: TokenKind,
    raw_text: Rc<str>,
    trivia: Rc<[Trivia]>,
    location: SourceLocation,
    value: Option<TokenValue>,
}

impl Token {
    pub fn new(
        kind: TokenKind,
        raw_text: impl Into<Rc<str>>,
        trivia: impl Into<Rc<[Trivia]>>,
        location: SourceLocation,
    ) -> Self {
        let raw_text = raw_text.into();
        let value = parse_value(kind, &raw_text);
        Self {
            kind,
            raw_text,
            trivia: trivia.into(),
            location,
            value,
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn trivia(&self) -> &[Trivia] {
        &self.trivia
    }

    pub fn location(&self) -> SourceLocation {
        self.location
    }

    pub fn end_location(&self) -> SourceLocation {
        self.location.advanced(self.raw_text.len() as u32)
    }

    pub fn range(&self) -> SourceRange {
        SourceRange::new(self.location, self.end_location())
    }

    pub fn directive_kind(&self) -> Option<DirectiveKind> {
        match self.value {
            Some(TokenValue::Directive(kind)) => Some(kind),
            _ => None,
        }
    }

    pub fn int_value(&self) -> Option<i64> {
        match self.value {
            Some(TokenValue::Integer(value)) => Some(value),
            _ => None,
        }
    }

    /// For string literals, the unescaped contents.
    pub fn string_value(&self) -> Option<&str> {
        match &self.value {
            Some(TokenValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    pub fn with_trivia(&self, trivia: impl Into<Rc<[Trivia]>>) -> Token {
        Token {
            trivia: trivia.into(),
            ..self.clone()
        }
    }

    pub fn with_location(&self, location: SourceLocation) -> Token {
        Token {
            location,
            ..self.clone()
        }
    }

    pub fn with_raw_text(&self, raw_text: impl Into<Rc<str>>) -> Token {
        Token::new(
            self.kind,
            raw_text,
            Rc::clone(&self.trivia),
            self.location,
        )
    }

    /// True iff no line ending appears in this token's leading trivia, i.e.
    /// the token continues the line of the token before it.
    pub fn is_on_same_line(&self) -> bool {
        !self.trivia.iter().any(|trivia| {
            matches!(
                trivia.kind,
                TriviaKind::EndOfLine | TriviaKind::LineContinuation
            )
        })
    }

    /// Sameness as used by the `` `define `` duplicate check: equal kind,
    /// raw text, and element-wise equal trivia.
    pub fn is_same(&self, other: &Token) -> bool {
        self.kind == other.kind
            && self.raw_text == other.raw_text
            && self.trivia.len() == other.trivia.len()
            && self
                .trivia
                .iter()
                .zip(other.trivia.iter())
                .all(|(left, right)| left == right)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for trivia in self.trivia.iter() {
            f.write_str(trivia.raw_text())?;
        }
        f.write_str(&self.raw_text)
    }
}

fn parse_value(kind: TokenKind, raw_text: &str) -> Option<TokenValue> {
    match kind {
        TokenKind::IntegerLiteral => {
            let digits: String = raw_text.chars().filter(|c| *c != '_').collect();
            digits.parse().ok().map(TokenValue::Integer)
        }
        TokenKind::RealLiteral => {
            let digits: String = raw_text.chars().filter(|c| *c != '_').collect();
            digits.parse().ok().map(TokenValue::Real)
        }
        TokenKind::StringLiteral => Some(TokenValue::Str(unescape_string(raw_text).into())),
        TokenKind::Directive => {
            let mut name = raw_text.strip_prefix('`').unwrap_or(raw_text);
            name = name.strip_prefix('\\').unwrap_or(name);
            Some(TokenValue::Directive(DirectiveKind::from_name(name)))
        }
        _ => None,
    }
}

fn unescape_string(raw_text: &str) -> String {
    let inner = raw_text
        .strip_prefix('"')
        .unwrap_or(raw_text)
        .strip_suffix('"')
        .unwrap_or(raw_text);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> SourceLocation {
        SourceLocation::NONE
    }

    #[test]
    fn with_constructors_do_not_mutate() {
        let token = Token::new(TokenKind::Identifier, "abc", vec![], loc());
        let relocated = token.with_raw_text("defg");
        assert_eq!(token.raw_text(), "abc");
        assert_eq!(relocated.raw_text(), "defg");
        assert_eq!(relocated.kind(), TokenKind::Identifier);
    }

    #[test]
    fn with_raw_text_reparses_values() {
        let token = Token::new(TokenKind::IntegerLiteral, "42", vec![], loc());
        assert_eq!(token.int_value(), Some(42));
        assert_eq!(token.with_raw_text("137").int_value(), Some(137));
    }

    #[test]
    fn sameness_includes_trivia() {
        let space = vec![Trivia::new(TriviaKind::Whitespace, " ")];
        let a = Token::new(TokenKind::Identifier, "x", space.clone(), loc());
        let b = Token::new(TokenKind::Identifier, "x", space, loc());
        let c = Token::new(TokenKind::Identifier, "x", vec![], loc());
        assert!(a.is_same(&b));
        assert!(!a.is_same(&c));
    }

    #[test]
    fn directive_classification() {
        let define = Token::new(TokenKind::Directive, "`define", vec![], loc());
        assert_eq!(define.directive_kind(), Some(DirectiveKind::Define));
        let usage = Token::new(TokenKind::Directive, "`FOO", vec![], loc());
        assert_eq!(usage.directive_kind(), Some(DirectiveKind::MacroUsage));
    }

    #[test]
    fn line_endings_break_is_on_same_line() {
        let token = Token::new(
            TokenKind::Identifier,
            "x",
            vec![Trivia::new(TriviaKind::EndOfLine, "\n")],
            loc(),
        );
        assert!(!token.is_on_same_line());
        let token = Token::new(
            TokenKind::Identifier,
            "x",
            vec![Trivia::new(TriviaKind::Whitespace, "  ")],
            loc(),
        );
        assert!(token.is_on_same_line());
    }
}
