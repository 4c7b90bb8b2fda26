use verikit_foundation::{errors::Diagnostic, source::SourceManager};
use verikit_lexer::token::{Token, TokenKind};
use verikit_preprocessor::{Preprocessor, PreprocessorOptions};

pub struct Preprocessed {
    pub sm: SourceManager,
    pub tokens: Vec<Token>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Preprocessed {
    /// The output stream without the trailing `EndOfFile` token.
    pub fn significant(&self) -> &[Token] {
        &self.tokens[..self.tokens.len() - 1]
    }

    pub fn kinds(&self) -> Vec<TokenKind> {
        self.significant().iter().map(Token::kind).collect()
    }

    pub fn raw_texts(&self) -> Vec<&str> {
        self.significant().iter().map(Token::raw_text).collect()
    }

    pub fn find(&self, kind: TokenKind) -> &Token {
        self.tokens
            .iter()
            .find(|token| token.kind() == kind)
            .unwrap_or_else(|| panic!("no {kind:?} token in the output stream"))
    }

    pub fn codes(&self) -> Vec<verikit_foundation::errors::DiagCode> {
        self.diagnostics.iter().map(|d| d.code).collect()
    }
}

pub fn preprocess(text: &str) -> Preprocessed {
    preprocess_with(&[], text, PreprocessorOptions::default())
}

pub fn preprocess_with(
    extra_files: &[(&str, &str)],
    text: &str,
    options: PreprocessorOptions,
) -> Preprocessed {
    let mut sm = SourceManager::new();
    for (name, source) in extra_files {
        sm.add_file(*name, *source);
    }
    let main = sm.add_file("source.sv", text);

    let mut diagnostics = vec![];
    let tokens = {
        let mut preprocessor = Preprocessor::new(&mut sm, &mut diagnostics, options);
        preprocessor.push_source(main);
        preprocessor.preprocess()
    };

    Preprocessed {
        sm,
        tokens,
        diagnostics,
    }
}
