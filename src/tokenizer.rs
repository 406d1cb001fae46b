//! Query tokenizer using nom.
//!
//! Lexes raw query text into a position-tracked token stream. Spans cover the
//! input exactly (concatenating every token's text gives back the input), so
//! unmatched regions can be copied through verbatim.
//!
//! ```text
//! SELECT x MEANS 'a -- b' -- note
//! ──┬─── ┬ ──┬── ───┬──── ───┬───
//!   │    │   │      │        └── Comment
//!   │    │   │      └── StringLiteral (comment marker inside is literal text)
//!   │    │   └── Word
//!   │    └── Word
//!   └── Word
//! ```

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{anychar, char, digit0, digit1, multispace1, not_line_ending, one_of, satisfy},
    combinator::{map, opt, recognize, rest, value},
    multi::many0_count,
    sequence::{pair, tuple},
};
use serde::Serialize;

use crate::error::Span;

/// Lexical category of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TokenKind {
    /// Bare identifier or keyword candidate.
    Word,
    /// `[name]` or `` `name` ``.
    QuotedIdent,
    /// `'..'`, `".."` or `$tag$..$tag$`.
    StringLiteral,
    Number,
    /// `$1`, `?`, `:name`.
    Parameter,
    /// Maximal run of operator characters.
    Symbol,
    /// `( ) , ; . [ ] { }`
    Punct,
    Whitespace,
    Comment,
}

impl TokenKind {
    /// Whitespace and comments: skipped when matching keywords.
    pub const fn is_trivia(self) -> bool {
        matches!(self, Self::Whitespace | Self::Comment)
    }
}

/// A single token borrowed from the query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub span: Span,
}

impl Token<'_> {
    pub const fn is_trivia(&self) -> bool {
        self.kind.is_trivia()
    }

    /// Case-insensitive comparison against a bare word.
    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text.len() == 1 && self.text.starts_with(c)
    }

    /// `(` or `[` as punctuation.
    pub fn opens_group(&self) -> bool {
        self.is_punct('(') || self.is_punct('[')
    }

    /// `)` or `]` as punctuation.
    pub fn closes_group(&self) -> bool {
        self.is_punct(')') || self.is_punct(']')
    }

    /// Whether a `[` directly after this token indexes into it.
    fn takes_subscript(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent) || self.closes_group()
    }

    /// Whether this token can stand for one element of a keyword phrase.
    ///
    /// Words compare case-insensitively, everything else exactly.
    pub fn matches_keyword_word(&self, word: &str) -> bool {
        match self.kind {
            TokenKind::Word => self.text.eq_ignore_ascii_case(word),
            TokenKind::Whitespace | TokenKind::Comment => false,
            _ => self.text == word,
        }
    }
}

/// Tokenize a complete query string.
pub fn tokenize(input: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut remaining = input;

    while !remaining.is_empty() {
        let start = input.len() - remaining.len();
        let subscript = remaining.starts_with('[') && tokens.last().is_some_and(Token::takes_subscript);
        let (rest_input, kind, len) = if subscript {
            // `arr[i]` indexes; it is not a bracket identifier.
            (&remaining[1..], TokenKind::Punct, 1)
        } else {
            match next_token(remaining) {
                Ok((rest_input, (kind, text))) if !text.is_empty() => (rest_input, kind, text.len()),
                _ => {
                    // Never loop on an empty token.
                    let len = remaining.chars().next().map_or(1, char::len_utf8);
                    (&remaining[len..], TokenKind::Symbol, len)
                }
            }
        };
        tokens.push(Token {
            kind,
            text: &input[start..start + len],
            span: Span::new(start, start + len),
        });
        remaining = rest_input;
    }

    tokens
}

/// Collapse every whitespace run to one space and drop comments.
///
/// Used to compare captured expressions that differ only in layout.
pub fn normalize(tokens: &[Token<'_>]) -> String {
    let mut out = String::new();
    let mut pending_space = false;
    for token in tokens {
        if token.is_trivia() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push_str(token.text);
    }
    out
}

fn next_token(input: &str) -> IResult<&str, (TokenKind, &str)> {
    alt((
        map(multispace1, |s| (TokenKind::Whitespace, s)),
        map(line_comment, |s| (TokenKind::Comment, s)),
        map(block_comment, |s| (TokenKind::Comment, s)),
        map(quoted('\''), |s| (TokenKind::StringLiteral, s)),
        map(quoted('"'), |s| (TokenKind::StringLiteral, s)),
        map(dollar_quoted, |s| (TokenKind::StringLiteral, s)),
        map(bracket_ident, |s| (TokenKind::QuotedIdent, s)),
        map(backtick_ident, |s| (TokenKind::QuotedIdent, s)),
        map(number, |s| (TokenKind::Number, s)),
        map(parameter, |s| (TokenKind::Parameter, s)),
        map(word, |s| (TokenKind::Word, s)),
        map(recognize(one_of("(),;.[]{}")), |s| (TokenKind::Punct, s)),
        map(symbol, |s| (TokenKind::Symbol, s)),
        map(recognize(anychar), |s| (TokenKind::Symbol, s)),
    ))(input)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_symbol_char(c: char) -> bool {
    "+-*/<>=!~%^&|@#:?".contains(c)
}

/// `-- ...` up to (not including) the line ending.
fn line_comment(input: &str) -> IResult<&str, &str> {
    recognize(pair(tag("--"), not_line_ending))(input)
}

/// `/* ... */`, running to end of input when unterminated.
fn block_comment(input: &str) -> IResult<&str, &str> {
    recognize(tuple((tag("/*"), alt((take_until("*/"), rest)), opt(tag("*/")))))(input)
}

/// A quoted run honoring doubled quotes and backslash escapes.
fn quoted(q: char) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input: &str| {
        let escaped = recognize(pair(char('\\'), anychar));
        let doubled = recognize(pair(char(q), char(q)));
        let plain = value((), satisfy(move |c| c != q && c != '\\'));
        recognize(tuple((
            char(q),
            many0_count(alt((value((), doubled), value((), escaped), plain))),
            opt(char(q)),
        )))(input)
    }
}

/// `$$ ... $$` or `$tag$ ... $tag$`.
fn dollar_quoted(input: &str) -> IResult<&str, &str> {
    let (body, delimiter) = recognize(tuple((
        char('$'),
        opt(pair(satisfy(is_ident_start), take_while(is_ident_char))),
        char('$'),
    )))(input)?;
    let (after_body, _) = alt((take_until(delimiter), rest))(body)?;
    let (after, _) = opt(tag(delimiter))(after_body)?;
    let consumed = input.len() - after.len();
    Ok((after, &input[..consumed]))
}

/// `[name]` where the content looks like an identifier, not a list literal.
fn bracket_ident(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        char('['),
        satisfy(is_ident_start),
        take_while(|c: char| !matches!(c, ']' | '[' | ',' | '\'' | '"' | '\n')),
        char(']'),
    )))(input)
}

fn backtick_ident(input: &str) -> IResult<&str, &str> {
    recognize(tuple((char('`'), take_while(|c| c != '`'), opt(char('`')))))(input)
}

fn number(input: &str) -> IResult<&str, &str> {
    let exponent = tuple((one_of("eE"), opt(one_of("+-")), digit1));
    alt((
        recognize(tuple((digit1, opt(pair(char('.'), digit0)), opt(exponent)))),
        recognize(pair(char('.'), digit1)),
    ))(input)
}

fn parameter(input: &str) -> IResult<&str, &str> {
    alt((
        recognize(pair(char('$'), digit1)),
        recognize(pair(char('?'), digit0)),
        recognize(tuple((char(':'), satisfy(is_ident_start), take_while(is_ident_char)))),
    ))(input)
}

fn word(input: &str) -> IResult<&str, &str> {
    recognize(pair(satisfy(is_ident_start), take_while(is_ident_char)))(input)
}

/// Maximal run of operator characters, stopping before a comment opener.
fn symbol(input: &str) -> IResult<&str, &str> {
    let (_, run) = take_while1(is_symbol_char)(input)?;
    let mut end = run.len();
    for (i, _) in run.char_indices().skip(1) {
        let tail = &run[i..];
        if tail.starts_with("--") || tail.starts_with("/*") {
            end = i;
            break;
        }
    }
    Ok((&input[end..], &input[..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<(TokenKind, &str)> {
        tokenize(input).into_iter().map(|t| (t.kind, t.text)).collect()
    }

    fn significant(input: &str) -> Vec<(TokenKind, &str)> {
        tokenize(input)
            .into_iter()
            .filter(|t| !t.is_trivia())
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn test_simple_select() {
        assert_eq!(
            significant("SELECT * FROM t WHERE col MEANS 'urgent'"),
            vec![
                (TokenKind::Word, "SELECT"),
                (TokenKind::Symbol, "*"),
                (TokenKind::Word, "FROM"),
                (TokenKind::Word, "t"),
                (TokenKind::Word, "WHERE"),
                (TokenKind::Word, "col"),
                (TokenKind::Word, "MEANS"),
                (TokenKind::StringLiteral, "'urgent'"),
            ]
        );
    }

    #[test]
    fn test_spans_cover_input() {
        let input = "SELECT a.b, \"x\"\n  FROM [my table] /* c */ WHERE y <= $1 -- end";
        let tokens = tokenize(input);
        let rebuilt: String = tokens.iter().map(|t| t.text).collect();
        assert_eq!(rebuilt, input);
        for t in &tokens {
            assert_eq!(&input[t.span.start..t.span.end], t.text);
        }
    }

    #[test]
    fn test_string_with_doubled_quote_and_escape() {
        assert_eq!(
            significant(r"'it''s' 'a\'b' x"),
            vec![
                (TokenKind::StringLiteral, "'it''s'"),
                (TokenKind::StringLiteral, r"'a\'b'"),
                (TokenKind::Word, "x"),
            ]
        );
    }

    #[test]
    fn test_keywords_inside_string_stay_literal() {
        assert_eq!(
            significant("SELECT 'a MEANS b'"),
            vec![
                (TokenKind::Word, "SELECT"),
                (TokenKind::StringLiteral, "'a MEANS b'"),
            ]
        );
    }

    #[test]
    fn test_unterminated_string_runs_to_end() {
        assert_eq!(
            significant("x = 'abc MEANS"),
            vec![
                (TokenKind::Word, "x"),
                (TokenKind::Symbol, "="),
                (TokenKind::StringLiteral, "'abc MEANS"),
            ]
        );
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            kinds("a -- MEANS b\n/* MEANS */c"),
            vec![
                (TokenKind::Word, "a"),
                (TokenKind::Whitespace, " "),
                (TokenKind::Comment, "-- MEANS b"),
                (TokenKind::Whitespace, "\n"),
                (TokenKind::Comment, "/* MEANS */"),
                (TokenKind::Word, "c"),
            ]
        );
        assert!(significant("/* open").is_empty());
    }

    #[test]
    fn test_dollar_quoted_and_params() {
        assert_eq!(
            significant("$$a 'b' c$$ $body$x$body$ $1 ? :name"),
            vec![
                (TokenKind::StringLiteral, "$$a 'b' c$$"),
                (TokenKind::StringLiteral, "$body$x$body$"),
                (TokenKind::Parameter, "$1"),
                (TokenKind::Parameter, "?"),
                (TokenKind::Parameter, ":name"),
            ]
        );
    }

    #[test]
    fn test_symbols_and_casts() {
        assert_eq!(
            significant("a<~>b x::text c<=d"),
            vec![
                (TokenKind::Word, "a"),
                (TokenKind::Symbol, "<~>"),
                (TokenKind::Word, "b"),
                (TokenKind::Word, "x"),
                (TokenKind::Symbol, "::"),
                (TokenKind::Word, "text"),
                (TokenKind::Word, "c"),
                (TokenKind::Symbol, "<="),
                (TokenKind::Word, "d"),
            ]
        );
    }

    #[test]
    fn test_symbol_stops_before_comment() {
        assert_eq!(
            kinds("=--x"),
            vec![(TokenKind::Symbol, "="), (TokenKind::Comment, "--x")]
        );
    }

    #[test]
    fn test_bracket_ident_vs_list() {
        assert_eq!(
            significant("[my col] [1, 2]"),
            vec![
                (TokenKind::QuotedIdent, "[my col]"),
                (TokenKind::Punct, "["),
                (TokenKind::Number, "1"),
                (TokenKind::Punct, ","),
                (TokenKind::Number, "2"),
                (TokenKind::Punct, "]"),
            ]
        );
    }

    #[test]
    fn test_subscript_is_punctuation() {
        assert_eq!(
            significant("arr[i] (f(x))[n] [col]"),
            vec![
                (TokenKind::Word, "arr"),
                (TokenKind::Punct, "["),
                (TokenKind::Word, "i"),
                (TokenKind::Punct, "]"),
                (TokenKind::Punct, "("),
                (TokenKind::Word, "f"),
                (TokenKind::Punct, "("),
                (TokenKind::Word, "x"),
                (TokenKind::Punct, ")"),
                (TokenKind::Punct, ")"),
                (TokenKind::Punct, "["),
                (TokenKind::Word, "n"),
                (TokenKind::Punct, "]"),
                (TokenKind::QuotedIdent, "[col]"),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            significant("1 2.5 .5 1e-3"),
            vec![
                (TokenKind::Number, "1"),
                (TokenKind::Number, "2.5"),
                (TokenKind::Number, ".5"),
                (TokenKind::Number, "1e-3"),
            ]
        );
    }

    #[test]
    fn test_normalize() {
        let tokens = tokenize("lower( name\n\t)  /* c */ ");
        assert_eq!(normalize(&tokens), "lower( name )");
    }
}
