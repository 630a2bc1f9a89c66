//! Tokenizer for the text format.
//!
//! Produces a lazy sequence of tokens with byte offsets into the
//! source. Unknown character sequences become `None` tokens; the
//! parser turns those into errors with positions attached.

use fxhash::FxHashMap;
use lazy_static::lazy_static;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Error state: an unrecognizable character sequence.
    None,
    Open,
    Close,
    Module,
    Import,
    Type,
    Start,
    Func,
    Global,
    Table,
    Memory,
    Export,
    Data,
    Elem,
    Offset,
    Align,
    Local,
    Result,
    Param,
    I32,
    I64,
    F32,
    F64,
    Funcref,
    Mut,
    Block,
    Loop,
    If,
    Then,
    Else,
    End,
    // Script extension tokens; recognised here, consumed by an
    // external harness.
    Binary,
    Quote,
    Register,
    Invoke,
    Get,
    AssertReturn,
    AssertReturnCanonicalNan,
    AssertReturnArithmeticNan,
    AssertTrap,
    AssertMalformed,
    AssertInvalid,
    AssertUnlinkable,
    AssertExhaustion,
    Script,
    Input,
    Output,
    // General tokens.
    Integer,
    Float,
    String,
    /// `$`-prefixed identifier.
    Name,
    /// Any instruction mnemonic not covered by a keyword above.
    Operator,
    Comment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub offset: usize,
}

lazy_static! {
    static ref KEYWORDS: FxHashMap<&'static str, TokenKind> = {
        let mut m = FxHashMap::default();
        m.insert("module", TokenKind::Module);
        m.insert("import", TokenKind::Import);
        m.insert("type", TokenKind::Type);
        m.insert("start", TokenKind::Start);
        m.insert("func", TokenKind::Func);
        m.insert("global", TokenKind::Global);
        m.insert("table", TokenKind::Table);
        m.insert("memory", TokenKind::Memory);
        m.insert("export", TokenKind::Export);
        m.insert("data", TokenKind::Data);
        m.insert("elem", TokenKind::Elem);
        m.insert("offset", TokenKind::Offset);
        m.insert("align", TokenKind::Align);
        m.insert("local", TokenKind::Local);
        m.insert("result", TokenKind::Result);
        m.insert("param", TokenKind::Param);
        m.insert("i32", TokenKind::I32);
        m.insert("i64", TokenKind::I64);
        m.insert("f32", TokenKind::F32);
        m.insert("f64", TokenKind::F64);
        m.insert("funcref", TokenKind::Funcref);
        m.insert("anyfunc", TokenKind::Funcref); // legacy spelling
        m.insert("mut", TokenKind::Mut);
        m.insert("block", TokenKind::Block);
        m.insert("loop", TokenKind::Loop);
        m.insert("if", TokenKind::If);
        m.insert("then", TokenKind::Then);
        m.insert("else", TokenKind::Else);
        m.insert("end", TokenKind::End);
        m.insert("binary", TokenKind::Binary);
        m.insert("quote", TokenKind::Quote);
        m.insert("register", TokenKind::Register);
        m.insert("invoke", TokenKind::Invoke);
        m.insert("get", TokenKind::Get);
        m.insert("assert_return", TokenKind::AssertReturn);
        m.insert(
            "assert_return_canonical_nan",
            TokenKind::AssertReturnCanonicalNan,
        );
        m.insert(
            "assert_return_arithmetic_nan",
            TokenKind::AssertReturnArithmeticNan,
        );
        m.insert("assert_trap", TokenKind::AssertTrap);
        m.insert("assert_malformed", TokenKind::AssertMalformed);
        m.insert("assert_invalid", TokenKind::AssertInvalid);
        m.insert("assert_unlinkable", TokenKind::AssertUnlinkable);
        m.insert("assert_exhaustion", TokenKind::AssertExhaustion);
        m.insert("script", TokenKind::Script);
        m.insert("input", TokenKind::Input);
        m.insert("output", TokenKind::Output);
        m
    };
}

/// Characters legal in a `$`-name, besides alphanumerics.
fn is_idchar(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'/'
                | b':'
                | b'<'
                | b'='
                | b'>'
                | b'?'
                | b'@'
                | b'\\'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Lexer<'a> {
        Lexer { src, pos: 0 }
    }

    fn bytes(&self) -> &'a [u8] {
        self.src.as_bytes()
    }

    fn token(&self, kind: TokenKind, start: usize) -> Token<'a> {
        Token {
            kind,
            text: &self.src[start..self.pos],
            offset: start,
        }
    }

    fn line_comment(&mut self, start: usize) -> Token<'a> {
        while self.pos < self.src.len() && self.bytes()[self.pos] != b'\n' {
            self.pos += 1;
        }
        self.token(TokenKind::Comment, start)
    }

    fn block_comment(&mut self, start: usize) -> Token<'a> {
        // `(;` already consumed; block comments nest.
        let mut depth = 1;
        while self.pos < self.src.len() {
            let b = self.bytes();
            if b[self.pos] == b'(' && self.pos + 1 < b.len() && b[self.pos + 1] == b';' {
                depth += 1;
                self.pos += 2;
            } else if b[self.pos] == b';' && self.pos + 1 < b.len() && b[self.pos + 1] == b')' {
                depth -= 1;
                self.pos += 2;
                if depth == 0 {
                    return self.token(TokenKind::Comment, start);
                }
            } else {
                self.pos += 1;
            }
        }
        // Unterminated: error state.
        self.token(TokenKind::None, start)
    }

    fn string(&mut self, start: usize) -> Token<'a> {
        // Opening quote already consumed. Escape handling here only
        // finds the closing quote; the parser decodes escapes.
        while self.pos < self.src.len() {
            match self.bytes()[self.pos] {
                b'"' => {
                    self.pos += 1;
                    return self.token(TokenKind::String, start);
                }
                b'\\' => {
                    self.pos += 2.min(self.src.len() - self.pos);
                }
                b'\n' => break,
                _ => self.pos += 1,
            }
        }
        self.token(TokenKind::None, start)
    }

    fn word(&mut self, start: usize) -> Token<'a> {
        while self.pos < self.src.len() && is_idchar(self.bytes()[self.pos]) {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];
        if let Some(&kind) = KEYWORDS.get(text) {
            return self.token(kind, start);
        }
        // Memory-argument immediates lex as single keyword tokens.
        if text.starts_with("offset=") {
            return self.token(TokenKind::Offset, start);
        }
        if text.starts_with("align=") {
            return self.token(TokenKind::Align, start);
        }
        if let Some(kind) = classify_number(text) {
            return self.token(kind, start);
        }
        // Everything mnemonic-shaped is an operator; the parser
        // rejects ones it does not know.
        if text
            .bytes()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'.' || c == b'_')
            && text.bytes().next().map_or(false, |c| c.is_ascii_lowercase())
        {
            return self.token(TokenKind::Operator, start);
        }
        self.token(TokenKind::None, start)
    }
}

/// Classify a bare word as a numeric literal, if it is one.
fn classify_number(text: &str) -> Option<TokenKind> {
    let unsigned = text.strip_prefix('-').or_else(|| text.strip_prefix('+')).unwrap_or(text);
    if unsigned.is_empty() {
        return None;
    }
    if unsigned == "inf" || unsigned == "nan" || unsigned.starts_with("nan:") {
        return Some(TokenKind::Float);
    }
    if !unsigned.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    if let Some(hex) = unsigned.strip_prefix("0x").or_else(|| unsigned.strip_prefix("0X")) {
        if hex.is_empty() {
            return Some(TokenKind::None);
        }
        let ok = hex
            .bytes()
            .all(|c| c.is_ascii_hexdigit() || matches!(c, b'_' | b'.' | b'p' | b'P' | b'+' | b'-'));
        if !ok {
            return Some(TokenKind::None);
        }
        if hex.bytes().any(|c| matches!(c, b'.' | b'p' | b'P')) {
            return Some(TokenKind::Float);
        }
        return Some(TokenKind::Integer);
    }
    let ok = unsigned
        .bytes()
        .all(|c| c.is_ascii_digit() || matches!(c, b'_' | b'.' | b'e' | b'E' | b'+' | b'-'));
    if !ok {
        return Some(TokenKind::None);
    }
    if unsigned.bytes().any(|c| matches!(c, b'.' | b'e' | b'E')) {
        return Some(TokenKind::Float);
    }
    Some(TokenKind::Integer)
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let b = self.bytes();
        while self.pos < b.len() && matches!(b[self.pos], b' ' | b'\t' | b'\r' | b'\n') {
            self.pos += 1;
        }
        if self.pos >= b.len() {
            return None;
        }
        let start = self.pos;
        match b[start] {
            b'(' => {
                if start + 1 < b.len() && b[start + 1] == b';' {
                    self.pos += 2;
                    Some(self.block_comment(start))
                } else {
                    self.pos += 1;
                    Some(self.token(TokenKind::Open, start))
                }
            }
            b')' => {
                self.pos += 1;
                Some(self.token(TokenKind::Close, start))
            }
            b';' => {
                if start + 1 < b.len() && b[start + 1] == b';' {
                    self.pos += 2;
                    Some(self.line_comment(start))
                } else {
                    self.pos += 1;
                    Some(self.token(TokenKind::None, start))
                }
            }
            b'"' => {
                self.pos += 1;
                Some(self.string(start))
            }
            b'$' => {
                self.pos += 1;
                while self.pos < b.len() && is_idchar(b[self.pos]) {
                    self.pos += 1;
                }
                if self.pos == start + 1 {
                    Some(self.token(TokenKind::None, start))
                } else {
                    Some(self.token(TokenKind::Name, start))
                }
            }
            c if is_idchar(c) || c == b'+' || c == b'-' => {
                self.pos += 1;
                Some(self.word(start))
            }
            _ => {
                self.pos += 1;
                Some(self.token(TokenKind::None, start))
            }
        }
    }
}

/// Tokenize with comments stripped, as the parser consumes it.
pub fn tokenize(src: &str) -> Vec<Token> {
    Lexer::new(src)
        .filter(|t| t.kind != TokenKind::Comment)
        .collect()
}

/// 1-based line and column of a byte offset, for diagnostics.
pub fn line_col(src: &str, offset: usize) -> (u32, u32) {
    let mut line = 1;
    let mut col = 1;
    for (i, c) in src.char_indices() {
        if i >= offset {
            break;
        }
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Decode the escape sequences of a string token (quotes included).
pub fn unescape(text: &str) -> Result<Vec<u8>, String> {
    let inner = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| "unterminated string".to_owned())?;
    let bytes = inner.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += 1;
        if i >= bytes.len() {
            return Err("truncated escape sequence".to_owned());
        }
        match bytes[i] {
            b't' => out.push(b'\t'),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b'"' => out.push(b'"'),
            b'\'' => out.push(b'\''),
            b'\\' => out.push(b'\\'),
            b'u' => {
                // \u{hex}
                if bytes.get(i + 1) != Some(&b'{') {
                    return Err("expected '{' in unicode escape".to_owned());
                }
                let close = inner[i..]
                    .find('}')
                    .ok_or_else(|| "unterminated unicode escape".to_owned())?;
                let digits = &inner[i + 2..i + close];
                let cp = u32::from_str_radix(&digits.replace('_', ""), 16)
                    .map_err(|_| format!("bad unicode escape {:?}", digits))?;
                let c = char::from_u32(cp).ok_or_else(|| format!("bad code point {:#x}", cp))?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                i += close;
            }
            c if c.is_ascii_hexdigit() => {
                let d2 = *bytes
                    .get(i + 1)
                    .filter(|c| c.is_ascii_hexdigit())
                    .ok_or_else(|| "truncated hex escape".to_owned())?;
                let hi = (c as char).to_digit(16).unwrap() as u8;
                let lo = (d2 as char).to_digit(16).unwrap() as u8;
                out.push(hi << 4 | lo);
                i += 1;
            }
            c => return Err(format!("unknown escape '\\{}'", c as char)),
        }
        i += 1;
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).map(|t| t.kind).collect()
    }

    #[test]
    fn basic_module_tokens() {
        assert_eq!(
            kinds("(module (func $f (param i32)))"),
            vec![
                TokenKind::Open,
                TokenKind::Module,
                TokenKind::Open,
                TokenKind::Func,
                TokenKind::Name,
                TokenKind::Open,
                TokenKind::Param,
                TokenKind::I32,
                TokenKind::Close,
                TokenKind::Close,
                TokenKind::Close,
            ]
        );
    }

    #[test]
    fn comments() {
        assert_eq!(
            kinds(";; line\n(module (; inner (; nested ;) ;) )"),
            vec![
                TokenKind::Comment,
                TokenKind::Open,
                TokenKind::Module,
                TokenKind::Comment,
                TokenKind::Close,
            ]
        );
        // Unterminated block comment is an error token.
        assert_eq!(kinds("(; oops"), vec![TokenKind::None]);
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("0 -12 0xFF 1_000"), vec![TokenKind::Integer; 4]);
        assert_eq!(
            kinds("1.5 -2e10 inf -inf nan nan:0x7f 0x1.8p3"),
            vec![TokenKind::Float; 7]
        );
    }

    #[test]
    fn operators_and_names() {
        assert_eq!(
            kinds("i32.add local.get $x br_table"),
            vec![
                TokenKind::Operator,
                TokenKind::Operator,
                TokenKind::Name,
                TokenKind::Operator,
            ]
        );
        // A lone `$` is not a name.
        assert_eq!(kinds("$"), vec![TokenKind::None]);
    }

    #[test]
    fn keywords_vs_operators() {
        assert_eq!(
            kinds("block loop if else end assert_return"),
            vec![
                TokenKind::Block,
                TokenKind::Loop,
                TokenKind::If,
                TokenKind::Else,
                TokenKind::End,
                TokenKind::AssertReturn,
            ]
        );
    }

    #[test]
    fn strings() {
        let toks: Vec<_> = Lexer::new(r#""abc" "a\"b" "bad"#).collect();
        assert_eq!(toks[0].kind, TokenKind::String);
        assert_eq!(toks[0].text, r#""abc""#);
        assert_eq!(toks[1].kind, TokenKind::String);
        assert_eq!(toks[2].kind, TokenKind::None);
    }

    #[test]
    fn unescape_sequences() {
        assert_eq!(unescape(r#""a\tb""#).unwrap(), b"a\tb");
        assert_eq!(unescape(r#""\41\42""#).unwrap(), b"AB");
        assert_eq!(unescape(r#""\u{263a}""#).unwrap(), "\u{263a}".as_bytes());
        assert!(unescape(r#""\q""#).is_err());
    }

    #[test]
    fn offsets_and_positions() {
        let toks: Vec<_> = Lexer::new("(module\n  $x)").collect();
        let name = toks.iter().find(|t| t.kind == TokenKind::Name).unwrap();
        assert_eq!(line_col("(module\n  $x)", name.offset), (2, 3));
    }
}
