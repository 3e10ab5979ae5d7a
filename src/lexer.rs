use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Number(String),

    Plus,
    Minus,
    Asterisk,
    Slash,
    Bang,

    Assign,
    DeclareAssign,
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessThanOrEqual,
    GreaterThanOrEqual,
    And,
    Or,

    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Semicolon,
    Ellipsis,

    Newline,
    EndOfFile,

    If,
    Else,
    Return,
    For,
    Continue,
    Break,
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub pos: usize,
    pub kind: TokenKind,
}

fn lookup_identifier(identifier: &str) -> Option<TokenKind> {
    let kind = match identifier {
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "return" => TokenKind::Return,
        "for" => TokenKind::For,
        "continue" => TokenKind::Continue,
        "break" => TokenKind::Break,
        "fn" => TokenKind::Function,
        _ => return None,
    };
    Some(kind)
}

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while self.pos < self.chars.len() {
            let pos = self.pos;
            let c = self.chars[pos];
            let kind = match c {
                ' ' | '\t' | '\r' => {
                    self.pos += 1;
                    continue;
                }
                '\n' => self.single(TokenKind::Newline),
                '+' => self.single(TokenKind::Plus),
                '-' => self.single(TokenKind::Minus),
                '*' => self.single(TokenKind::Asterisk),
                '/' => self.single(TokenKind::Slash),
                '(' => self.single(TokenKind::LeftParen),
                ')' => self.single(TokenKind::RightParen),
                '{' => self.single(TokenKind::LeftBrace),
                '}' => self.single(TokenKind::RightBrace),
                '[' => self.single(TokenKind::LeftBracket),
                ']' => self.single(TokenKind::RightBracket),
                ',' => self.single(TokenKind::Comma),
                ';' => self.single(TokenKind::Semicolon),
                '=' => self.pair('=', TokenKind::Equal, TokenKind::Assign),
                ':' => {
                    if self.peek(1) == Some('=') {
                        self.pos += 2;
                        TokenKind::DeclareAssign
                    } else {
                        bail!("unexpected character ':' at offset {}", pos);
                    }
                }
                '!' => self.pair('=', TokenKind::NotEqual, TokenKind::Bang),
                '<' => self.pair(
                    '=',
                    TokenKind::LessThanOrEqual,
                    TokenKind::LessThan,
                ),
                '>' => self.pair(
                    '=',
                    TokenKind::GreaterThanOrEqual,
                    TokenKind::GreaterThan,
                ),
                '&' => {
                    if self.peek(1) == Some('&') {
                        self.pos += 2;
                        TokenKind::And
                    } else {
                        bail!("unexpected character '&' at offset {}", pos);
                    }
                }
                '|' => {
                    if self.peek(1) == Some('|') {
                        self.pos += 2;
                        TokenKind::Or
                    } else {
                        bail!("unexpected character '|' at offset {}", pos);
                    }
                }
                '.' => {
                    if self.peek(1) == Some('.') && self.peek(2) == Some('.') {
                        self.pos += 3;
                        TokenKind::Ellipsis
                    } else {
                        bail!("unexpected character '.' at offset {}", pos);
                    }
                }
                c if c.is_ascii_digit() => self.number(),
                c if Self::is_letter(c) => self.identifier(),
                other => {
                    bail!("unexpected character '{}' at offset {}", other, pos)
                }
            };
            tokens.push(Token { pos, kind });
        }
        tokens.push(Token {
            pos: self.pos,
            kind: TokenKind::EndOfFile,
        });
        Ok(tokens)
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 1;
        kind
    }

    /// Two-character operator when `next` follows, otherwise the fallback.
    fn pair(
        &mut self,
        next: char,
        double: TokenKind,
        single: TokenKind,
    ) -> TokenKind {
        if self.peek(1) == Some(next) {
            self.pos += 2;
            double
        } else {
            self.pos += 1;
            single
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn number(&mut self) -> TokenKind {
        let start = self.pos;
        while self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek(0) == Some('.')
            && self.peek(1).is_some_and(|c| c.is_ascii_digit())
        {
            self.pos += 1;
            while self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        TokenKind::Number(self.chars[start..self.pos].iter().collect())
    }

    fn identifier(&mut self) -> TokenKind {
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| Self::is_letter(c) || c.is_ascii_digit())
        {
            self.pos += 1;
        }
        let identifier: String = self.chars[start..self.pos].iter().collect();
        lookup_identifier(&identifier)
            .unwrap_or(TokenKind::Identifier(identifier))
    }

    fn is_letter(c: char) -> bool {
        c.is_alphabetic() || c == '_'
    }
}
