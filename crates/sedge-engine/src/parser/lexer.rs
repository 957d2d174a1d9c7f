//! Lexer for Sedge source text.
//!
//! The token table is a logos-derived lexer; literal scanning (strings,
//! character literals, numeric bases) runs in callbacks so the byte-exact
//! rules hold: single-quoted strings only escape `\'`, double-quoted strings
//! take C-style escapes plus `\xHH`, backticks wrap a single UTF-8 codepoint
//! yielding a numeric literal, and `0o` literals read digits through the
//! hex-nibble table with a `< 8` range check. Keyword-versus-identifier ties
//! resolve by longest match, keywords winning at equal length (`or` is a
//! keyword, `orchid` an identifier).
//!
//! Two context rules run as post-passes over the token list: adjacent string
//! literals concatenate, and a `-` or `~` directly following a binary
//! operator rewrites to unary negation / bitwise complement (what makes
//! `a * -2` parse).

use super::token::{Tok, Token};
use super::ParseFault;
use logos::{Lexer, Logos};

/// Lexer-level failure kinds. The default is what an unmatched byte maps to.
#[derive(Debug, Clone, Default, PartialEq)]
enum LexFault {
    #[default]
    IllegalChar,
    UnterminatedString,
    BadHexConstant,
    BadCharConstant,
}

impl LexFault {
    fn message(&self) -> &'static str {
        match self {
            LexFault::IllegalChar => "illegal character",
            LexFault::UnterminatedString => "unterminated string",
            LexFault::BadHexConstant => "bad hex constant",
            LexFault::BadCharConstant => "invalid utf8 character constant",
        }
    }
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = LexFault)]
#[logos(skip r"[ \t\r\n\x0b\x0c]+")]
#[logos(skip r"#[^\n]*")]
enum RawTok {
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("!")]
    Not,
    #[token("&")]
    BitAnd,
    #[token("|")]
    BitOr,
    #[token("^")]
    BitXor,
    #[token("(")]
    LPar,
    #[token(")")]
    RPar,
    #[token("[")]
    LBra,
    #[token("]")]
    RBra,
    #[token("{")]
    LCurl,
    #[token("}")]
    RCurl,
    #[token("*")]
    Mul,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("/")]
    Div,
    #[token("~")]
    Cat,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token("=")]
    Assign,
    #[token("<")]
    Lt,
    #[token("<=")]
    Lte,
    #[token("==")]
    Eq,
    #[token("!=")]
    Neq,
    #[token(">")]
    Gt,
    #[token(">=")]
    Gte,
    #[token("nil")]
    Nil,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("if")]
    If,
    #[token("elsif")]
    Elsif,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("foreach")]
    Foreach,
    #[token("forindex")]
    Forindex,
    #[token("while")]
    While,
    #[token("return")]
    Return,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("func")]
    Func,
    #[token("var")]
    Var,
    #[token("...")]
    Ellipsis,
    #[token("?")]
    Question,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    MulEq,
    #[token("/=")]
    DivEq,
    #[token("~=")]
    CatEq,
    #[token("&=")]
    BitAndEq,
    #[token("|=")]
    BitOrEq,
    #[token("^=")]
    BitXorEq,
    #[token("??")]
    NullChain,
    #[token("?.")]
    NullAccess,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Symbol,

    #[regex(r"[0-9]", lex_number)]
    #[regex(r"\.[0-9]", lex_number)]
    Num(f64),

    #[token("'", lex_sq_string)]
    #[token("\"", lex_dq_string)]
    Str(Vec<u8>),

    #[token("`", lex_char_literal)]
    Char(f64),
}

fn hex(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

/// Integer literal scan: accumulate hex nibbles below `base`. The `0o` form
/// reads digits through this same table with the `< 8` check, so `0o19`
/// lexes as 1 followed by a separate literal 9.
fn int_literal(src: &[u8], start: usize, base: u32) -> (f64, usize) {
    let mut d = 0.0f64;
    let mut i = start;
    while i < src.len() {
        match hex(src[i]) {
            Some(n) if (n as u32) < base => {
                d = d * base as f64 + n as f64;
                i += 1;
            }
            _ => break,
        }
    }
    (d, i)
}

fn lex_number(lex: &mut Lexer<'_, RawTok>) -> Result<f64, LexFault> {
    let src = lex.source().as_bytes();
    let start = lex.span().start;
    let len = src.len();

    if src[start] == b'0' && start + 2 < len {
        if src[start + 1] == b'x' && hex(src[start + 2]).is_some() {
            let (d, end) = int_literal(src, start + 2, 16);
            lex.bump(end - lex.span().end);
            return Ok(d);
        }
        if src[start + 1] == b'o' && src[start + 2].is_ascii_digit() {
            let (d, end) = int_literal(src, start + 2, 8);
            lex.bump(end - lex.span().end);
            return Ok(d);
        }
    }

    // Decimal form: digits, optional fraction, optional exponent when the
    // `e` is actually followed by a number.
    let mut i = start;
    while i < len && src[i].is_ascii_digit() {
        i += 1;
    }
    if i < len && src[i] == b'.' {
        i += 1;
        while i < len && src[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i + 1 < len
        && (src[i] == b'e' || src[i] == b'E')
        && (src[i + 1].is_ascii_digit() || src[i + 1] == b'+' || src[i + 1] == b'-')
    {
        i += 1;
        if src[i] == b'+' || src[i] == b'-' {
            i += 1;
        }
        while i < len && src[i].is_ascii_digit() {
            i += 1;
        }
    }
    let text = std::str::from_utf8(&src[start..i]).map_err(|_| LexFault::IllegalChar)?;
    let d = text.parse::<f64>().map_err(|_| LexFault::IllegalChar)?;
    lex.bump(i - lex.span().end);
    Ok(d)
}

/// Single-quoted string: only `\'` escapes, everything else is literal.
fn lex_sq_string(lex: &mut Lexer<'_, RawTok>) -> Result<Vec<u8>, LexFault> {
    let rem = lex.remainder().as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < rem.len() {
        let c = rem[i];
        if c == b'\'' {
            lex.bump(i + 1);
            return Ok(out);
        }
        if c == b'\\' {
            if i + 1 >= rem.len() {
                return Err(LexFault::UnterminatedString);
            }
            if rem[i + 1] == b'\'' {
                out.push(b'\'');
                i += 2;
            } else {
                out.push(b'\\');
                i += 1;
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    Err(LexFault::UnterminatedString)
}

/// Scan a double-quote-style body up to `quote`, applying C-style escapes
/// and `\xHH`. Returns the bytes and the input length consumed including the
/// closing quote.
fn dq_scan(rem: &[u8], quote: u8) -> Result<(Vec<u8>, usize), LexFault> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < rem.len() {
        let c = rem[i];
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == b'\\' {
            if i + 1 >= rem.len() {
                return Err(LexFault::UnterminatedString);
            }
            match rem[i + 1] {
                b'"' => {
                    out.push(b'"');
                    i += 2;
                }
                b'r' => {
                    out.push(b'\r');
                    i += 2;
                }
                b'n' => {
                    out.push(b'\n');
                    i += 2;
                }
                b't' => {
                    out.push(b'\t');
                    i += 2;
                }
                b'\\' => {
                    out.push(b'\\');
                    i += 2;
                }
                b'`' => {
                    out.push(b'`');
                    i += 2;
                }
                b'x' => {
                    if i + 3 >= rem.len() {
                        return Err(LexFault::UnterminatedString);
                    }
                    let hi = hex(rem[i + 2]).ok_or(LexFault::BadHexConstant)?;
                    let lo = hex(rem[i + 3]).ok_or(LexFault::BadHexConstant)?;
                    out.push((hi << 4) | lo);
                    i += 4;
                }
                _ => {
                    // Unhandled escape, keep the backslash.
                    out.push(b'\\');
                    i += 1;
                }
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    Err(LexFault::UnterminatedString)
}

fn lex_dq_string(lex: &mut Lexer<'_, RawTok>) -> Result<Vec<u8>, LexFault> {
    let (out, used) = dq_scan(lex.remainder().as_bytes(), b'"')?;
    lex.bump(used);
    Ok(out)
}

/// Backtick character literal: escaped like a double-quoted string, then
/// required to decode as exactly one UTF-8 codepoint, yielding its value.
fn lex_char_literal(lex: &mut Lexer<'_, RawTok>) -> Result<f64, LexFault> {
    let (out, used) = dq_scan(lex.remainder().as_bytes(), b'`')?;
    lex.bump(used);
    let s = std::str::from_utf8(&out).map_err(|_| LexFault::BadCharConstant)?;
    let mut chars = s.chars();
    let c = chars.next().ok_or(LexFault::BadCharConstant)?;
    if chars.next().is_some() {
        return Err(LexFault::BadCharConstant);
    }
    Ok(c as u32 as f64)
}

/// Byte offsets of line endings, `\r\n` counted once.
pub(crate) struct LineIndex {
    ends: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(src: &str) -> LineIndex {
        let b = src.as_bytes();
        let mut ends = Vec::new();
        for i in 0..b.len() {
            if b[i] == b'\n' || (b[i] == b'\r' && b.get(i + 1) != Some(&b'\n')) {
                ends.push(i);
            }
        }
        LineIndex { ends }
    }

    /// 1-based line containing the byte offset.
    pub(crate) fn line(&self, offset: usize) -> u32 {
        (self.ends.partition_point(|&e| e < offset) + 1) as u32
    }
}

/// Binary operators after which `-` and `~` must be unary.
fn rewrites_unary(t: Tok) -> bool {
    matches!(
        t,
        Tok::Plus
            | Tok::Minus
            | Tok::Cat
            | Tok::Mul
            | Tok::Div
            | Tok::BitAnd
            | Tok::BitOr
            | Tok::BitXor
    )
}

fn push_token(out: &mut Vec<Token>, mut t: Token) {
    // Adjacent string literals concatenate into one token.
    if t.tok == Tok::Literal && t.str_.is_some() {
        if let Some(last) = out.last_mut() {
            if last.tok == Tok::Literal {
                if let (Some(prev), Some(cur)) = (last.str_.as_mut(), t.str_.as_ref()) {
                    prev.extend_from_slice(cur);
                    return;
                }
            }
        }
    }

    if t.tok == Tok::Minus || t.tok == Tok::Cat {
        if let Some(prev) = out.last() {
            if rewrites_unary(prev.tok) {
                t.tok = if t.tok == Tok::Minus {
                    Tok::Neg
                } else {
                    Tok::BitNeg
                };
            }
        }
    }

    out.push(t);
}

/// Lex a source buffer into a flat token list.
pub fn lex(src: &str) -> Result<Vec<Token>, ParseFault> {
    let lines = LineIndex::new(src);
    let mut out = Vec::new();
    let mut lexer = RawTok::lexer(src);
    while let Some(res) = lexer.next() {
        let span = lexer.span();
        let line = lines.line(span.start);
        let raw = match res {
            Ok(raw) => raw,
            Err(f) => return Err(ParseFault::new(f.message(), line)),
        };
        let t = match raw {
            RawTok::Symbol => Token {
                tok: Tok::Symbol,
                line,
                str_: Some(lexer.slice().as_bytes().to_vec()),
                num: 0.0,
            },
            RawTok::Num(n) | RawTok::Char(n) => Token {
                tok: Tok::Literal,
                line,
                str_: None,
                num: n,
            },
            RawTok::Str(bytes) => Token {
                tok: Tok::Literal,
                line,
                str_: Some(bytes),
                num: 0.0,
            },
            // Boolean constants are numeric literals.
            RawTok::True => Token {
                tok: Tok::Literal,
                line,
                str_: None,
                num: 1.0,
            },
            RawTok::False => Token {
                tok: Tok::Literal,
                line,
                str_: None,
                num: 0.0,
            },
            other => Token::bare(plain_tok(&other), line),
        };
        push_token(&mut out, t);
    }
    Ok(out)
}

fn plain_tok(raw: &RawTok) -> Tok {
    match raw {
        RawTok::And => Tok::And,
        RawTok::Or => Tok::Or,
        RawTok::Not => Tok::Not,
        RawTok::BitAnd => Tok::BitAnd,
        RawTok::BitOr => Tok::BitOr,
        RawTok::BitXor => Tok::BitXor,
        RawTok::LPar => Tok::LPar,
        RawTok::RPar => Tok::RPar,
        RawTok::LBra => Tok::LBra,
        RawTok::RBra => Tok::RBra,
        RawTok::LCurl => Tok::LCurl,
        RawTok::RCurl => Tok::RCurl,
        RawTok::Mul => Tok::Mul,
        RawTok::Plus => Tok::Plus,
        RawTok::Minus => Tok::Minus,
        RawTok::Div => Tok::Div,
        RawTok::Cat => Tok::Cat,
        RawTok::Colon => Tok::Colon,
        RawTok::Dot => Tok::Dot,
        RawTok::Comma => Tok::Comma,
        RawTok::Semi => Tok::Semi,
        RawTok::Assign => Tok::Assign,
        RawTok::Lt => Tok::Lt,
        RawTok::Lte => Tok::Lte,
        RawTok::Eq => Tok::Eq,
        RawTok::Neq => Tok::Neq,
        RawTok::Gt => Tok::Gt,
        RawTok::Gte => Tok::Gte,
        RawTok::Nil => Tok::Nil,
        RawTok::If => Tok::If,
        RawTok::Elsif => Tok::Elsif,
        RawTok::Else => Tok::Else,
        RawTok::For => Tok::For,
        RawTok::Foreach => Tok::Foreach,
        RawTok::Forindex => Tok::Forindex,
        RawTok::While => Tok::While,
        RawTok::Return => Tok::Return,
        RawTok::Break => Tok::Break,
        RawTok::Continue => Tok::Continue,
        RawTok::Func => Tok::Func,
        RawTok::Var => Tok::Var,
        RawTok::Ellipsis => Tok::Ellipsis,
        RawTok::Question => Tok::Question,
        RawTok::PlusEq => Tok::PlusEq,
        RawTok::MinusEq => Tok::MinusEq,
        RawTok::MulEq => Tok::MulEq,
        RawTok::DivEq => Tok::DivEq,
        RawTok::CatEq => Tok::CatEq,
        RawTok::BitAndEq => Tok::BitAndEq,
        RawTok::BitOrEq => Tok::BitOrEq,
        RawTok::BitXorEq => Tok::BitXorEq,
        RawTok::NullChain => Tok::NullChain,
        RawTok::NullAccess => Tok::NullAccess,
        RawTok::Symbol
        | RawTok::Num(_)
        | RawTok::Char(_)
        | RawTok::Str(_)
        | RawTok::True
        | RawTok::False => unreachable!("handled by the caller"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        lex(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    fn nums(src: &str) -> Vec<f64> {
        lex(src)
            .unwrap()
            .into_iter()
            .filter(|t| t.tok == Tok::Literal && t.str_.is_none())
            .map(|t| t.num)
            .collect()
    }

    #[test]
    fn keywords_beat_identifier_at_equal_length() {
        assert_eq!(toks("or"), vec![Tok::Or]);
        assert_eq!(toks("orchid"), vec![Tok::Symbol]);
        assert_eq!(toks("forindex"), vec![Tok::Forindex]);
        assert_eq!(toks("fort"), vec![Tok::Symbol]);
    }

    #[test]
    fn unary_rewrite_after_binary_operator() {
        assert_eq!(
            toks("a * -2"),
            vec![Tok::Symbol, Tok::Mul, Tok::Neg, Tok::Literal]
        );
        assert_eq!(
            toks("a + ~b"),
            vec![Tok::Symbol, Tok::Plus, Tok::BitNeg, Tok::Symbol]
        );
        // Leading minus stays a minus for the parser's prefix rule.
        assert_eq!(toks("-2"), vec![Tok::Minus, Tok::Literal]);
        // After a closing paren it's a binary minus.
        assert_eq!(
            toks("(a) - 2"),
            vec![Tok::LPar, Tok::Symbol, Tok::RPar, Tok::Minus, Tok::Literal]
        );
    }

    #[test]
    fn adjacent_string_literals_merge() {
        let ts = lex("\"a\" \"b\"").unwrap();
        assert_eq!(ts.len(), 1);
        assert_eq!(ts[0].str_.as_deref(), Some(&b"ab"[..]));
    }

    #[test]
    fn string_number_literals_do_not_merge() {
        let ts = lex("\"a\" 2").unwrap();
        assert_eq!(ts.len(), 2);
    }

    #[test]
    fn numeric_forms() {
        assert_eq!(nums("0x1F"), vec![31.0]);
        assert_eq!(nums("0o17"), vec![15.0]);
        assert_eq!(nums("1.5e3"), vec![1500.0]);
        assert_eq!(nums(".5"), vec![0.5]);
        assert_eq!(nums("2E-2"), vec![0.02]);
        // Octal digits stop at 8: `0o19` is 1 then 9.
        assert_eq!(nums("0o19"), vec![1.0, 9.0]);
    }

    #[test]
    fn exponent_requires_a_number() {
        // `1e` is the number 1 followed by the symbol `e`.
        let ts = lex("1e").unwrap();
        assert_eq!(ts.len(), 2);
        assert_eq!(ts[0].num, 1.0);
        assert_eq!(ts[1].tok, Tok::Symbol);
    }

    #[test]
    fn string_escapes() {
        let ts = lex(r#""a\tb\x41\q""#).unwrap();
        assert_eq!(ts[0].str_.as_deref(), Some(&b"a\tbA\\q"[..]));
        let ts = lex(r"'it\'s \n'").unwrap();
        assert_eq!(ts[0].str_.as_deref(), Some(&b"it's \\n"[..]));
    }

    #[test]
    fn backtick_char_literal() {
        assert_eq!(nums("`A`"), vec![65.0]);
        assert_eq!(nums("`\u{20ac}`"), vec![0x20AC as f64]);
    }

    #[test]
    fn booleans_become_numbers() {
        assert_eq!(nums("true false"), vec![1.0, 0.0]);
    }

    #[test]
    fn comments_and_whitespace_skip() {
        assert_eq!(toks("a # comment\nb"), vec![Tok::Symbol, Tok::Symbol]);
    }

    #[test]
    fn lex_errors_carry_lines() {
        let err = lex("a;\n\"unterminated").unwrap_err();
        assert_eq!(err.message, "unterminated string");
        assert_eq!(err.line, 2);

        let err = lex("\"\\xZZ\"").unwrap_err();
        assert_eq!(err.message, "bad hex constant");

        let err = lex("@").unwrap_err();
        assert_eq!(err.message, "illegal character");
    }

    #[test]
    fn line_index_handles_crlf() {
        let idx = LineIndex::new("a\r\nb\nc\rd");
        assert_eq!(idx.line(0), 1); // a
        assert_eq!(idx.line(3), 2); // b
        assert_eq!(idx.line(5), 3); // c
        assert_eq!(idx.line(7), 4); // d
    }

    #[test]
    fn punctuation_longest_match() {
        assert_eq!(toks("?."), vec![Tok::NullAccess]);
        assert_eq!(toks("??"), vec![Tok::NullChain]);
        assert_eq!(toks("? :"), vec![Tok::Question, Tok::Colon]);
        assert_eq!(toks("..."), vec![Tok::Ellipsis]);
        assert_eq!(toks(".."), vec![Tok::Dot, Tok::Dot]);
    }
}
