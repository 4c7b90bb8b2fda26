//! End-to-end tests for macro definition, expansion, pasting, and
//! stringification.

mod support;

use support::{preprocess, preprocess_with};
use verikit_foundation::errors::DiagCode;
use verikit_lexer::token::TokenKind;
use verikit_preprocessor::{to_source_text, PreprocessorOptions};

#[test]
fn object_like_macro() {
    let p = preprocess("`define FOO 1 + 2\nint x = `FOO;\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(to_source_text(&p.tokens), "\nint x = 1 + 2;\n");
}

#[test]
fn function_like_macro_with_defaults() {
    let p = preprocess("`define SUM(a, b = 5) a + b\nx = `SUM(1);\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(to_source_text(&p.tokens), "\nx = 1 + 5;\n");

    let p = preprocess("`define SUM(a, b = 5) a + b\nx = `SUM(1, 2);\n");
    assert_eq!(to_source_text(&p.tokens), "\nx = 1 + 2;\n");
}

#[test]
fn empty_actual_takes_the_default() {
    let p = preprocess("`define PICK(a, b = 9) a b\nx = `PICK(1, );\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["x", "=", "1", "9", ";"]);
}

#[test]
fn not_enough_args() {
    let p = preprocess("`define M(a, b) a b\n`M(1)\n");
    assert_eq!(p.codes(), vec![DiagCode::NotEnoughMacroArgs]);
    assert!(p.significant().is_empty());
}

#[test]
fn too_many_args() {
    let p = preprocess("`define M(a, b) a b\n`M(1, 2, 3)\n");
    assert_eq!(p.codes(), vec![DiagCode::TooManyActualMacroArgs]);
    assert!(p.significant().is_empty());
}

#[test]
fn missing_argument_list() {
    let p = preprocess("`define M(a) a\n`M x\n");
    assert_eq!(p.codes(), vec![DiagCode::ExpectedMacroArgs]);
    assert_eq!(p.raw_texts(), vec!["x"]);
}

#[test]
fn unknown_directive_skips_call_syntax() {
    let p = preprocess("`NOPE(1, 2)\nx\n");
    assert_eq!(p.codes(), vec![DiagCode::UnknownDirective]);
    assert_eq!(p.raw_texts(), vec!["x"]);
}

#[test]
fn empty_macro_expands_to_nothing() {
    let p = preprocess("`define NOTHING\n`NOTHING\nx\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["x"]);
}

#[test]
fn stringification() {
    let p = preprocess("`define STR(x) `\"x`\"\ny = `STR(hello);\n");
    assert!(p.diagnostics.is_empty());

    let literal = p.find(TokenKind::StringLiteral);
    assert_eq!(literal.raw_text(), "\"hello\"");
    assert_eq!(literal.string_value(), Some("hello"));
}

#[test]
fn stringification_preserves_inner_spacing() {
    let p = preprocess("`define STR(x) `\"a x`\"\ny = `STR(b);\n");
    let literal = p.find(TokenKind::StringLiteral);
    assert_eq!(literal.raw_text(), "\"a b\"");
}

#[test]
fn unterminated_stringification() {
    let p = preprocess("`define S `\"abc\n`S\n");
    assert_eq!(p.codes(), vec![DiagCode::ExpectedMacroStringifyEnd]);
    // The buffered tokens are flushed as plain output.
    assert_eq!(p.raw_texts(), vec!["abc"]);
}

#[test]
fn token_pasting() {
    let p = preprocess("`define CAT(a, b) a``b\nx = `CAT(foo, bar);\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["x", "=", "foobar", ";"]);
    assert_eq!(p.significant()[2].kind(), TokenKind::Identifier);
}

#[test]
fn chained_pastes() {
    let p = preprocess("`define J(a, b, c) a``b``c\n`J(x, y, z)\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["xyz"]);
}

#[test]
fn paste_can_form_a_new_macro_usage() {
    let p = preprocess("`define ONE 1\n`define GLUE `ON``E\nx = `GLUE;\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["x", "=", "1", ";"]);
}

#[test]
fn paste_bordering_whitespace_is_ignored() {
    let p = preprocess("`define P a `` b\n`P\n");
    assert_eq!(p.codes(), vec![DiagCode::IgnoredMacroPaste]);
    // The paste drops out but its spacing is preserved: the output re-lexes
    // the same as if the `` had never been written.
    assert_eq!(p.raw_texts(), vec!["a", "b"]);
    assert_eq!(to_source_text(&p.tokens), "\na  b\n");
}

#[test]
fn paste_at_buffer_edge_is_ignored() {
    let p = preprocess("`define P ``x\n`P\n");
    assert_eq!(p.codes(), vec![DiagCode::IgnoredMacroPaste]);
    assert_eq!(p.raw_texts(), vec!["x"]);
}

#[test]
fn empty_argument_donates_trivia() {
    let p = preprocess("`define E(a) [a]\n`E()\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.kinds(), vec![TokenKind::OpenBracket, TokenKind::CloseBracket]);
}

#[test]
fn no_macro_operators_survive_expansion() {
    let inputs = [
        "`define STR(x) `\"x`\"\n`STR(a)\n",
        "`define CAT(a, b) a``b\n`CAT(x, y)\n",
        "`define E(a) [a]\n`E()\n",
        "`define P a `` b\n`P\n",
    ];
    for input in inputs {
        let p = preprocess(input);
        for token in &p.tokens {
            assert!(
                !matches!(
                    token.kind(),
                    TokenKind::MacroQuote | TokenKind::MacroPaste | TokenKind::EmptyMacroArgument
                ),
                "{:?} leaked into the output of {input:?}",
                token.kind(),
            );
        }
    }
}

#[test]
fn recursive_macro() {
    let p = preprocess("`define A 1 + `A\n`A\nx\n");
    assert_eq!(p.codes(), vec![DiagCode::RecursiveMacro]);
    // The usage token goes out unchanged and nothing is emitted past the
    // point of detection.
    assert_eq!(p.raw_texts(), vec!["`A", "x"]);
    assert_eq!(p.significant()[0].kind(), TokenKind::Directive);
}

#[test]
fn mutually_recursive_macros() {
    let p = preprocess("`define M1 `M2\n`define M2 `M1\n`M1\n");
    assert_eq!(p.codes(), vec![DiagCode::RecursiveMacro]);
    assert_eq!(p.raw_texts(), vec!["`M1"]);
}

#[test]
fn arguments_are_pre_expanded_once() {
    let p = preprocess(
        "`define ID(x) x\n`define A `ID(b)\n`define TWICE(p) p p\n`TWICE(`A)\n",
    );
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["b", "b"]);
}

#[test]
fn nested_usage_of_the_same_macro_in_arguments_is_not_recursion() {
    let p = preprocess("`define ID(x) x\ny = `ID(`ID(1));\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["y", "=", "1", ";"]);
}

#[test]
fn argument_replaces_directive_name() {
    let p = preprocess("`define FOO(bar) `bar\n`define ONE 1\nx = `FOO(ONE);\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["x", "=", "1", ";"]);
}

#[test]
fn macro_can_define_another_macro() {
    let p = preprocess("`define WRAP(n, v) `define n v\n`WRAP(X, 3)\nm = `X;\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["m", "=", "3", ";"]);
}

#[test]
fn multiline_argument_in_nested_define_gets_line_continuations() {
    let p = preprocess("`define WRAP(v) `define M v\n`WRAP(1\n2)\nm = `M;\n");
    assert!(p.diagnostics.is_empty());
    // Both lines of the argument made it into M's body.
    assert_eq!(p.raw_texts(), vec!["m", "=", "1", "2", ";"]);
}

#[test]
fn escaped_identifier_with_embedded_paste() {
    let p = preprocess("`define MAKE(a) \\prefix``a\n`MAKE(tail) x\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["\\prefixtail", "x"]);
    // The reconstituted identifier must end on whitespace.
    assert!(to_source_text(&p.tokens).contains("\\prefixtail x"));
}

#[test]
fn slash_star_paste_forms_a_comment() {
    let p = preprocess("`define C(x) a /``*x*``/ b\ny = `C(hi);\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["y", "=", "a", "b", ";"]);
    assert!(to_source_text(&p.tokens).contains("a /*hi*/ b"));
}

#[test]
fn slash_star_paste_can_be_disabled() {
    let options = PreprocessorOptions {
        legacy_comment_paste: false,
        ..Default::default()
    };
    let p = preprocess_with(&[], "`define C(x) a /``*x*``/ b\ny = `C(hi);\n", options);
    // Without the compatibility hack the pastes fail to lex and drop out,
    // leaving the raw tokens behind.
    assert_eq!(
        p.raw_texts(),
        vec!["y", "=", "a", "/", "*", "hi", "*", "/", "b", ";"]
    );
}

#[test]
fn line_intrinsic() {
    let p = preprocess("\n\nx = `__LINE__;\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["x", "=", "3", ";"]);
}

#[test]
fn file_intrinsic() {
    let p = preprocess("s = `__FILE__;\n");
    let literal = p.find(TokenKind::StringLiteral);
    assert_eq!(literal.string_value(), Some("source.sv"));
}

#[test]
fn undef_without_operand() {
    let p = preprocess("`undef\n");
    assert_eq!(p.codes(), vec![DiagCode::ExpectedIdentifier]);
    assert!(p.significant().is_empty());
}

#[test]
fn undef_builtin() {
    let p = preprocess("`undef __LINE__\n");
    assert_eq!(p.codes(), vec![DiagCode::UndefineBuiltinDirective]);
    assert!(p.significant().is_empty());
}

#[test]
fn undef_makes_a_macro_unknown() {
    let p = preprocess("`define FOO 1\n`undef FOO\n`FOO\n");
    assert_eq!(p.codes(), vec![DiagCode::UnknownDirective]);
}

#[test]
fn undefineall_keeps_builtins() {
    let p = preprocess("`define FOO 1\n`undefineall\nx = `__LINE__;\n`FOO\n");
    assert_eq!(p.codes(), vec![DiagCode::UnknownDirective]);
    assert_eq!(p.raw_texts(), vec!["x", "=", "3", ";"]);
}

#[test]
fn redefinition_with_identical_body_is_silent() {
    let p = preprocess("`define A x + y\n`define A x + y\nz = `A;\n");
    assert!(p.diagnostics.is_empty());
}

#[test]
fn redefinition_with_different_body_warns() {
    let p = preprocess("`define A x\n`define A y\nz = `A;\n");
    assert_eq!(p.codes(), vec![DiagCode::RedefinedMacro]);
    // The newer definition wins.
    assert_eq!(p.raw_texts(), vec!["z", "=", "y", ";"]);
}

#[test]
fn conditional_directives() {
    let p = preprocess("`define FOO\n`ifdef FOO\na\n`else\nb\n`endif\nc\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["a", "c"]);

    let p = preprocess("`ifdef NOPE\na\n`else\nb\n`endif\nc\n");
    assert_eq!(p.raw_texts(), vec!["b", "c"]);

    let p = preprocess("`ifndef NOPE\na\n`endif\n");
    assert_eq!(p.raw_texts(), vec!["a"]);
}

#[test]
fn elsif_chains() {
    let p = preprocess("`define BAR\n`ifdef FOO\na\n`elsif BAR\nb\n`else\nc\n`endif\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["b"]);

    let p = preprocess("`ifdef FOO\na\n`elsif BAR\nb\n`else\nc\n`endif\n");
    assert_eq!(p.raw_texts(), vec!["c"]);
}

#[test]
fn nested_conditionals_in_dead_regions() {
    let p = preprocess("`ifdef NOPE\n`ifdef ALSO_NOPE\na\n`endif\nb\n`endif\nc\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["c"]);
}

#[test]
fn macros_in_dead_regions_are_not_expanded() {
    let p = preprocess("`ifdef NOPE\n`UNDEFINED_MACRO\n`endif\nx\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["x"]);
}

#[test]
fn unterminated_conditional() {
    let p = preprocess("`ifdef NOPE\na\n");
    assert_eq!(p.codes(), vec![DiagCode::MissingEndIfDirective]);
}

#[test]
fn stray_conditional_directives() {
    let p = preprocess("`endif\n");
    assert_eq!(p.codes(), vec![DiagCode::UnexpectedConditionalDirective]);

    let p = preprocess("`else\n");
    assert_eq!(p.codes(), vec![DiagCode::UnexpectedConditionalDirective]);
}

#[test]
fn include_files() {
    let p = preprocess_with(
        &[("inc.svh", "b\n")],
        "a\n`include \"inc.svh\"\nc\n",
        PreprocessorOptions::default(),
    );
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["a", "b", "c"]);
}

#[test]
fn included_files_can_define_macros() {
    let p = preprocess_with(
        &[("defs.svh", "`define WIDTH 8\n")],
        "`include \"defs.svh\"\nw = `WIDTH;\n",
        PreprocessorOptions::default(),
    );
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["w", "=", "8", ";"]);
}

#[test]
fn include_missing_operand() {
    let p = preprocess("`include\nx\n");
    assert_eq!(p.codes(), vec![DiagCode::ExpectedIncludeFileName]);
    assert_eq!(p.raw_texts(), vec!["x"]);
}

#[test]
fn keyword_versions() {
    let p = preprocess(
        "logic a;\n`begin_keywords \"1364-2005\"\nlogic b;\n`end_keywords\nlogic c;\n",
    );
    assert!(p.diagnostics.is_empty());
    let kinds = p.kinds();
    assert_eq!(kinds[0], TokenKind::LogicKeyword);
    // Inside the 1364 region `logic` is an ordinary identifier.
    assert_eq!(kinds[3], TokenKind::Identifier);
    assert_eq!(kinds[6], TokenKind::LogicKeyword);
}

#[test]
fn unknown_keyword_version() {
    let p = preprocess("`begin_keywords \"not-a-version\"\n");
    assert_eq!(p.codes(), vec![DiagCode::UnrecognizedKeywordVersion]);
}

#[test]
fn mismatched_end_keywords() {
    let p = preprocess("`end_keywords\n");
    assert_eq!(p.codes(), vec![DiagCode::MismatchedEndKeywordsDirective]);
}

#[test]
fn macro_arguments_can_span_lines() {
    let p = preprocess("`define M(a) [a]\nx = `M(1\n+ 2);\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["x", "=", "[", "1", "+", "2", "]", ";"]);
}

#[test]
fn unbalanced_delimiters_in_argument() {
    let p = preprocess("`define M(a) a\n`M([1)\n");
    assert!(p.codes().contains(&DiagCode::UnbalancedMacroArgDims));
}

#[test]
fn nested_delimiters_hide_commas() {
    let p = preprocess("`define M(a, b) a | b\nx = `M({1, 2}, 3);\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(
        p.raw_texts(),
        vec!["x", "=", "{", "1", ",", "2", "}", "|", "3", ";"]
    );
}

#[test]
fn pragma_is_consumed() {
    let p = preprocess("`pragma protect begin\nx\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["x"]);
}

#[test]
fn multiline_define_bodies() {
    let p = preprocess("`define M a \\\nb\nx = `M;\n");
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["x", "=", "a", "b", ";"]);
}

#[test]
fn predefined_macros() {
    let options = PreprocessorOptions {
        predefines: vec![("VERSION".to_string(), 4)],
        ..Default::default()
    };
    let p = preprocess_with(&[], "v = `VERSION;\n", options);
    assert!(p.diagnostics.is_empty());
    assert_eq!(p.raw_texts(), vec!["v", "=", "4", ";"]);

    // Tool-injected macros are built-ins and cannot be undefined.
    let options = PreprocessorOptions {
        predefines: vec![("VERSION".to_string(), 4)],
        ..Default::default()
    };
    let p = preprocess_with(&[], "`undef VERSION\n", options);
    assert_eq!(p.codes(), vec![DiagCode::UndefineBuiltinDirective]);
}
