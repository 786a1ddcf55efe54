// Purpose: Tokenize Go source with automatic semicolon insertion.
// Inputs/Outputs: Consumes a source string; produces tokens carrying byte spans.
// Invariants: Spans index the original bytes exactly; splice edits depend on it.
// Gotchas: Semicolons are inserted at newlines after closers and literals, as gofmt expects.

use super::ast::Span;

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Keyword(Keyword),
    IntLit(String),
    FloatLit(String),
    ImagLit(String),
    RuneLit(String),
    StringLit(String),
    Symbol(Symbol),
    Unknown(char),
    Eof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keyword {
    Break,
    Case,
    Chan,
    Const,
    Continue,
    Default,
    Defer,
    Else,
    Fallthrough,
    For,
    Func,
    Go,
    Goto,
    If,
    Import,
    Interface,
    Map,
    Package,
    Range,
    Return,
    Select,
    Struct,
    Switch,
    Type,
    Var,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Symbol {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Colon,
    Dot,
    Ellipsis,
    Assign,
    Define,
    Arrow,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Shl,
    Shr,
    AmpCaret,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
    AmpCaretAssign,
    AndAnd,
    OrOr,
    Inc,
    Dec,
    EqEq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Bang,
    Tilde,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

pub struct Lexer<'a> {
    bytes: &'a [u8],
    idx: usize,
    line: usize,
    col: usize,
    prev_can_insert_semi: bool,
    pending_semi: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            bytes: src.as_bytes(),
            idx: 0,
            line: 1,
            col: 1,
            prev_can_insert_semi: false,
            pending_semi: false,
        }
    }

    pub fn lex_all(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token();
            let is_eof = matches!(tok.kind, TokenKind::Eof);
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        tokens
    }

    fn span_here(&self) -> Span {
        Span {
            start: self.idx,
            end: self.idx,
            line: self.line,
            column: self.col,
        }
    }

    fn next_token(&mut self) -> Token {
        if self.pending_semi {
            self.pending_semi = false;
            self.prev_can_insert_semi = false;
            return Token {
                kind: TokenKind::Symbol(Symbol::Semi),
                span: self.span_here(),
            };
        }
        self.skip_whitespace_and_comments();
        if self.pending_semi {
            self.pending_semi = false;
            self.prev_can_insert_semi = false;
            return Token {
                kind: TokenKind::Symbol(Symbol::Semi),
                span: self.span_here(),
            };
        }

        let start = self.idx;
        let line = self.line;
        let column = self.col;
        let make = |kind: TokenKind, end: usize| Token {
            kind,
            span: Span {
                start,
                end,
                line,
                column,
            },
        };

        let Some(&c) = self.bytes.get(self.idx) else {
            if self.prev_can_insert_semi {
                self.prev_can_insert_semi = false;
                return Token {
                    kind: TokenKind::Symbol(Symbol::Semi),
                    span: self.span_here(),
                };
            }
            return make(TokenKind::Eof, start);
        };

        if c.is_ascii_alphabetic() || c == b'_' || c >= 0x80 {
            while self
                .bytes
                .get(self.idx)
                .is_some_and(|&b| b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80)
            {
                self.advance();
            }
            let text = std::str::from_utf8(&self.bytes[start..self.idx])
                .unwrap_or_default()
                .to_string();
            let kind = match keyword_of(&text) {
                Some(kw) => {
                    self.prev_can_insert_semi = matches!(
                        kw,
                        Keyword::Break | Keyword::Continue | Keyword::Fallthrough | Keyword::Return
                    );
                    TokenKind::Keyword(kw)
                }
                None => {
                    self.prev_can_insert_semi = true;
                    TokenKind::Ident(text)
                }
            };
            return make(kind, self.idx);
        }

        if c.is_ascii_digit() || (c == b'.' && self.peek_at(1).is_ascii_digit()) {
            return self.lex_number(start, line, column);
        }

        match c {
            b'"' => self.lex_interpreted_string(start, line, column),
            b'`' => self.lex_raw_string(start, line, column),
            b'\'' => self.lex_rune(start, line, column),
            _ => self.lex_symbol(start, line, column),
        }
    }

    fn lex_number(&mut self, start: usize, line: usize, column: usize) -> Token {
        let mut is_float = false;
        let mut is_imag = false;

        let prefixed = self.bytes[self.idx] == b'0'
            && matches!(
                self.peek_at(1),
                b'x' | b'X' | b'o' | b'O' | b'b' | b'B'
            );
        if prefixed {
            let hex = matches!(self.peek_at(1), b'x' | b'X');
            self.advance();
            self.advance();
            while self.bytes.get(self.idx).is_some_and(|&b| {
                b.is_ascii_digit() || b == b'_' || (hex && b.is_ascii_hexdigit())
            }) {
                self.advance();
            }
            if hex && matches!(self.bytes.get(self.idx), Some(&b'p') | Some(&b'P')) {
                is_float = true;
                self.advance();
                if matches!(self.bytes.get(self.idx), Some(&b'+') | Some(&b'-')) {
                    self.advance();
                }
                while self.bytes.get(self.idx).is_some_and(|b| b.is_ascii_digit()) {
                    self.advance();
                }
            }
        } else {
            while self
                .bytes
                .get(self.idx)
                .is_some_and(|&b| b.is_ascii_digit() || b == b'_')
            {
                self.advance();
            }
            if self.bytes.get(self.idx) == Some(&b'.') && self.peek_at(1) != b'.' {
                is_float = true;
                self.advance();
                while self
                    .bytes
                    .get(self.idx)
                    .is_some_and(|&b| b.is_ascii_digit() || b == b'_')
                {
                    self.advance();
                }
            }
            if matches!(self.bytes.get(self.idx), Some(&b'e') | Some(&b'E')) {
                is_float = true;
                self.advance();
                if matches!(self.bytes.get(self.idx), Some(&b'+') | Some(&b'-')) {
                    self.advance();
                }
                while self.bytes.get(self.idx).is_some_and(|b| b.is_ascii_digit()) {
                    self.advance();
                }
            }
        }
        if self.bytes.get(self.idx) == Some(&b'i') {
            is_imag = true;
            self.advance();
        }
        let text = std::str::from_utf8(&self.bytes[start..self.idx])
            .unwrap_or_default()
            .to_string();
        self.prev_can_insert_semi = true;
        let kind = if is_imag {
            TokenKind::ImagLit(text)
        } else if is_float {
            TokenKind::FloatLit(text)
        } else {
            TokenKind::IntLit(text)
        };
        Token {
            kind,
            span: Span {
                start,
                end: self.idx,
                line,
                column,
            },
        }
    }

    fn lex_interpreted_string(&mut self, start: usize, line: usize, column: usize) -> Token {
        self.advance();
        while let Some(&b) = self.bytes.get(self.idx) {
            match b {
                b'\\' => {
                    self.advance();
                    self.advance();
                }
                b'"' => {
                    self.advance();
                    break;
                }
                b'\n' => break,
                _ => self.advance(),
            }
        }
        self.prev_can_insert_semi = true;
        let text = std::str::from_utf8(&self.bytes[start..self.idx])
            .unwrap_or_default()
            .to_string();
        Token {
            kind: TokenKind::StringLit(text),
            span: Span {
                start,
                end: self.idx,
                line,
                column,
            },
        }
    }

    fn lex_raw_string(&mut self, start: usize, line: usize, column: usize) -> Token {
        self.advance();
        while let Some(&b) = self.bytes.get(self.idx) {
            self.advance();
            if b == b'`' {
                break;
            }
        }
        self.prev_can_insert_semi = true;
        let text = std::str::from_utf8(&self.bytes[start..self.idx])
            .unwrap_or_default()
            .to_string();
        Token {
            kind: TokenKind::StringLit(text),
            span: Span {
                start,
                end: self.idx,
                line,
                column,
            },
        }
    }

    fn lex_rune(&mut self, start: usize, line: usize, column: usize) -> Token {
        self.advance();
        while let Some(&b) = self.bytes.get(self.idx) {
            match b {
                b'\\' => {
                    self.advance();
                    self.advance();
                }
                b'\'' => {
                    self.advance();
                    break;
                }
                b'\n' => break,
                _ => self.advance(),
            }
        }
        self.prev_can_insert_semi = true;
        let text = std::str::from_utf8(&self.bytes[start..self.idx])
            .unwrap_or_default()
            .to_string();
        Token {
            kind: TokenKind::RuneLit(text),
            span: Span {
                start,
                end: self.idx,
                line,
                column,
            },
        }
    }

    fn lex_symbol(&mut self, start: usize, line: usize, column: usize) -> Token {
        use Symbol::*;
        let rest = &self.bytes[self.idx..];
        let take = |n: usize, sym: Symbol| (n, TokenKind::Symbol(sym));
        let (len, kind) = if rest.starts_with(b"...") {
            take(3, Ellipsis)
        } else if rest.starts_with(b"<<=") {
            take(3, ShlAssign)
        } else if rest.starts_with(b">>=") {
            take(3, ShrAssign)
        } else if rest.starts_with(b"&^=") {
            take(3, AmpCaretAssign)
        } else if rest.starts_with(b"<-") {
            take(2, Arrow)
        } else if rest.starts_with(b":=") {
            take(2, Define)
        } else if rest.starts_with(b"==") {
            take(2, EqEq)
        } else if rest.starts_with(b"!=") {
            take(2, NotEq)
        } else if rest.starts_with(b"<=") {
            take(2, Lte)
        } else if rest.starts_with(b">=") {
            take(2, Gte)
        } else if rest.starts_with(b"<<") {
            take(2, Shl)
        } else if rest.starts_with(b">>") {
            take(2, Shr)
        } else if rest.starts_with(b"&&") {
            take(2, AndAnd)
        } else if rest.starts_with(b"||") {
            take(2, OrOr)
        } else if rest.starts_with(b"++") {
            take(2, Inc)
        } else if rest.starts_with(b"--") {
            take(2, Dec)
        } else if rest.starts_with(b"&^") {
            take(2, AmpCaret)
        } else if rest.starts_with(b"+=") {
            take(2, PlusAssign)
        } else if rest.starts_with(b"-=") {
            take(2, MinusAssign)
        } else if rest.starts_with(b"*=") {
            take(2, StarAssign)
        } else if rest.starts_with(b"/=") {
            take(2, SlashAssign)
        } else if rest.starts_with(b"%=") {
            take(2, PercentAssign)
        } else if rest.starts_with(b"&=") {
            take(2, AmpAssign)
        } else if rest.starts_with(b"|=") {
            take(2, PipeAssign)
        } else if rest.starts_with(b"^=") {
            take(2, CaretAssign)
        } else {
            let sym = match rest[0] {
                b'(' => Some(LParen),
                b')' => Some(RParen),
                b'{' => Some(LBrace),
                b'}' => Some(RBrace),
                b'[' => Some(LBracket),
                b']' => Some(RBracket),
                b',' => Some(Comma),
                b';' => Some(Semi),
                b':' => Some(Colon),
                b'.' => Some(Dot),
                b'=' => Some(Assign),
                b'+' => Some(Plus),
                b'-' => Some(Minus),
                b'*' => Some(Star),
                b'/' => Some(Slash),
                b'%' => Some(Percent),
                b'&' => Some(Amp),
                b'|' => Some(Pipe),
                b'^' => Some(Caret),
                b'<' => Some(Lt),
                b'>' => Some(Gt),
                b'!' => Some(Bang),
                b'~' => Some(Tilde),
                _ => None,
            };
            match sym {
                Some(sym) => take(1, sym),
                None => {
                    let c = rest[0] as char;
                    self.advance();
                    self.prev_can_insert_semi = false;
                    return Token {
                        kind: TokenKind::Unknown(c),
                        span: Span {
                            start,
                            end: self.idx,
                            line,
                            column,
                        },
                    };
                }
            }
        };
        for _ in 0..len {
            self.advance();
        }
        self.prev_can_insert_semi = matches!(
            kind,
            TokenKind::Symbol(RParen)
                | TokenKind::Symbol(RBracket)
                | TokenKind::Symbol(RBrace)
                | TokenKind::Symbol(Inc)
                | TokenKind::Symbol(Dec)
        );
        Token {
            kind,
            span: Span {
                start,
                end: self.idx,
                line,
                column,
            },
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.bytes.get(self.idx).copied() {
                Some(b'\n') => {
                    if self.prev_can_insert_semi {
                        self.pending_semi = true;
                        return;
                    }
                    self.advance();
                }
                Some(b' ') | Some(b'\t') | Some(b'\r') => self.advance(),
                Some(b'/') if self.peek_at(1) == b'/' => {
                    while self.bytes.get(self.idx).is_some_and(|&b| b != b'\n') {
                        self.advance();
                    }
                }
                Some(b'/') if self.peek_at(1) == b'*' => {
                    self.advance();
                    self.advance();
                    let mut crossed_newline = false;
                    while let Some(&b) = self.bytes.get(self.idx) {
                        if b == b'\n' {
                            crossed_newline = true;
                        }
                        if b == b'*' && self.peek_at(1) == b'/' {
                            self.advance();
                            self.advance();
                            break;
                        }
                        self.advance();
                    }
                    // A general comment containing newlines acts like one.
                    if crossed_newline && self.prev_can_insert_semi {
                        self.pending_semi = true;
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn peek_at(&self, offset: usize) -> u8 {
        self.bytes.get(self.idx + offset).copied().unwrap_or(0)
    }

    fn advance(&mut self) {
        if let Some(&b) = self.bytes.get(self.idx) {
            self.idx += 1;
            if b == b'\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
    }
}

fn keyword_of(text: &str) -> Option<Keyword> {
    use Keyword::*;
    let kw = match text {
        "break" => Break,
        "case" => Case,
        "chan" => Chan,
        "const" => Const,
        "continue" => Continue,
        "default" => Default,
        "defer" => Defer,
        "else" => Else,
        "fallthrough" => Fallthrough,
        "for" => For,
        "func" => Func,
        "go" => Go,
        "goto" => Goto,
        "if" => If,
        "import" => Import,
        "interface" => Interface,
        "map" => Map,
        "package" => Package,
        "range" => Range,
        "return" => Return,
        "select" => Select,
        "struct" => Struct,
        "switch" => Switch,
        "type" => Type,
        "var" => Var,
        _ => return None,
    };
    Some(kw)
}

#[cfg(test)]
mod tests {
    use super::{Lexer, Symbol, TokenKind};

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).lex_all().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn inserts_semicolon_after_identifier_at_newline() {
        let toks = kinds("package p\nvar x int\n");
        let semis = toks
            .iter()
            .filter(|k| matches!(k, TokenKind::Symbol(Symbol::Semi)))
            .count();
        assert_eq!(semis, 2);
    }

    #[test]
    fn no_semicolon_after_open_brace() {
        let toks = kinds("func f() {\n}\n");
        // The newline after `{` must not produce a semicolon; the one after
        // `}` must.
        let mut iter = toks.iter();
        iter.find(|k| matches!(k, TokenKind::Symbol(Symbol::LBrace)))
            .expect("brace");
        assert!(matches!(
            iter.next().expect("next"),
            TokenKind::Symbol(Symbol::RBrace)
        ));
    }

    #[test]
    fn lexes_strings_and_runes() {
        let toks = kinds(r#"var s = "a\"b"; var r = 'x'; var raw = `multi`"#);
        assert!(toks.iter().any(|k| matches!(k, TokenKind::StringLit(s) if s == "\"a\\\"b\"")));
        assert!(toks.iter().any(|k| matches!(k, TokenKind::RuneLit(r) if r == "'x'")));
        assert!(toks.iter().any(|k| matches!(k, TokenKind::StringLit(s) if s == "`multi`")));
    }

    #[test]
    fn lexes_arrow_and_ellipsis() {
        let toks = kinds("chan<- int; f(xs...)");
        assert!(toks.iter().any(|k| matches!(k, TokenKind::Symbol(Symbol::Arrow))));
        assert!(
            toks.iter()
                .any(|k| matches!(k, TokenKind::Symbol(Symbol::Ellipsis)))
        );
    }

    #[test]
    fn spans_index_source_bytes() {
        let src = "var x = 12";
        let toks = Lexer::new(src).lex_all();
        let int = toks
            .iter()
            .find(|t| matches!(t.kind, TokenKind::IntLit(_)))
            .expect("int literal");
        assert_eq!(&src[int.span.start..int.span.end], "12");
    }
}
