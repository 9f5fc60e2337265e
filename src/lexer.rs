//! Tokenizer. Grounded on `examples/original_source/token.go`: a hand
//! rolled scanner (rather than Go's `text/scanner`) recognizing
//! identifiers, numbers, char/string literals, and a fixed punctuation set
//! with greedy up-to-3-character matching against the parser's symbol
//! table.

use crate::error::LexError;
use crate::token::{Position, Token};

/// The maximal multi-character punctuation symbols the parser's symbol
/// table recognizes. Single characters from `PUNCT_CHARS` are tried first
/// greedily against 3-, then 2-character combinations.
const PUNCT_CHARS: &str = "`~!.#$%^&*()-=+[{]}\\|;:,<>/?";

pub struct Lexer<'a> {
    src: &'a str,
    chars: Vec<char>,
    pos: usize,
    line: u16,
    col: u16,
    file: u16,
    func: u16,
    known_symbols: &'a dyn Fn(&str) -> bool,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str, file: u16, known_symbols: &'a dyn Fn(&str) -> bool) -> Lexer<'a> {
        Lexer {
            src,
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            file,
            func: 0,
            known_symbols,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn position(&self) -> Position {
        Position::new(self.file, self.func, self.line, self.col)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.bump();
                    self.bump();
                    while !(self.peek().is_none()
                        || (self.peek() == Some('*') && self.peek_at(1) == Some('/')))
                    {
                        self.bump();
                    }
                    self.bump();
                    self.bump();
                }
                _ => break,
            }
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut out = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            let pos = self.position();
            let Some(c) = self.peek() else { break };

            if c.is_ascii_digit() {
                out.push(self.scan_number(pos));
                continue;
            }
            if c == '_' || c.is_alphabetic() {
                out.push(self.scan_ident(pos));
                continue;
            }
            if c == '"' {
                out.push(self.scan_string(pos, '"')?);
                continue;
            }
            if c == '`' {
                out.push(self.scan_raw_string(pos)?);
                continue;
            }
            if c == '\'' {
                out.push(self.scan_char(pos)?);
                continue;
            }
            if PUNCT_CHARS.contains(c) {
                out.push(self.scan_punct(pos));
                continue;
            }
            return Err(LexError::Scan {
                pos,
                message: format!("unexpected character {c:?}"),
            });
        }
        out.push(Token::new(self.position(), "(eof)", "(eof)"));
        Ok(out)
    }

    fn scan_number(&mut self, pos: Position) -> Token {
        let start = self.pos;
        let mut is_float = false;
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.bump();
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.bump();
            }
        } else {
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
            if self.peek() == Some('.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit())
            {
                is_float = true;
                self.bump();
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.bump();
                }
            }
            if matches!(self.peek(), Some('e') | Some('E')) {
                is_float = true;
                self.bump();
                if matches!(self.peek(), Some('+') | Some('-')) {
                    self.bump();
                }
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.bump();
                }
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let symbol = if is_float { "(float)" } else { "(int)" };
        Token::new(pos, symbol, text)
    }

    fn scan_ident(&mut self, pos: Position) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.bump();
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let symbol = if (self.known_symbols)(&text) {
            text.clone()
        } else {
            "(name)".to_string()
        };
        Token::new(pos, symbol, text)
    }

    fn scan_string(&mut self, pos: Position, quote: char) -> Result<Token, LexError> {
        let start = self.pos;
        self.bump();
        loop {
            match self.peek() {
                None => {
                    return Err(LexError::UnterminatedLiteral {
                        pos,
                        kind: "string literal",
                    })
                }
                Some('\\') => {
                    self.bump();
                    self.bump();
                }
                Some(c) if c == quote => {
                    self.bump();
                    break;
                }
                _ => {
                    self.bump();
                }
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        Ok(Token::new(pos, "(string)", text))
    }

    fn scan_raw_string(&mut self, pos: Position) -> Result<Token, LexError> {
        let start = self.pos;
        self.bump();
        loop {
            match self.peek() {
                None => {
                    return Err(LexError::UnterminatedLiteral {
                        pos,
                        kind: "raw string literal",
                    })
                }
                Some('`') => {
                    self.bump();
                    break;
                }
                _ => {
                    self.bump();
                }
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        Ok(Token::new(pos, "(string)", text))
    }

    fn scan_char(&mut self, pos: Position) -> Result<Token, LexError> {
        let start = self.pos;
        self.bump();
        if self.peek() == Some('\\') {
            self.bump();
            self.bump();
        } else {
            self.bump();
        }
        if self.peek() != Some('\'') {
            return Err(LexError::UnterminatedLiteral {
                pos,
                kind: "char literal",
            });
        }
        self.bump();
        let text: String = self.chars[start..self.pos].iter().collect();
        Ok(Token::new(pos, "(char)", text))
    }

    fn scan_punct(&mut self, pos: Position) -> Token {
        let c1 = self.bump().unwrap();
        let mut sym = c1.to_string();

        if let Some(c2) = self.peek() {
            let sym2 = format!("{sym}{c2}");
            if (self.known_symbols)(&sym2) || sym2 == ".." {
                sym = sym2;
                self.bump();
                if let Some(c3) = self.peek() {
                    let sym3 = format!("{sym}{c3}");
                    if (self.known_symbols)(&sym3) {
                        sym = sym3;
                        self.bump();
                    }
                }
            }
        }
        Token::new(pos, sym.clone(), sym)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(s: &str) -> bool {
        matches!(
            s,
            "+" | "-" | "*" | "/" | "==" | "!=" | "<=" | ">=" | "&&" | "||" | "..." | ":="
        )
    }

    fn toks(src: &str) -> Vec<Token> {
        Lexer::new(src, 0, &known).tokenize().unwrap()
    }

    #[test]
    fn tokenizes_arithmetic() {
        let t = toks("1 + 2 * 3");
        let syms: Vec<&str> = t.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(syms, ["(int)", "+", "(int)", "*", "(int)", "(eof)"]);
    }

    #[test]
    fn greedy_multichar_punct() {
        let t = toks("a := b == c");
        assert_eq!(t[1].symbol, ":=");
        assert_eq!(t[3].symbol, "==");
    }

    #[test]
    fn positions_track_line_and_col() {
        let t = toks("a\nb");
        assert_eq!(t[0].pos.line(), 1);
        assert_eq!(t[1].pos.line(), 2);
    }

    #[test]
    fn ellipsis_recognized_even_when_unregistered() {
        let t = toks("a...b");
        assert_eq!(t[1].symbol, "...");
    }
}
