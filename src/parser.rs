use crate::lexer::{Token, TokenKind};
use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Negate,
    Positive,
    Not,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
}

impl Operator {
    pub fn from_token(kind: &TokenKind, is_prefix: bool) -> Result<Self> {
        Ok(match kind {
            TokenKind::Plus if is_prefix => Self::Positive,
            TokenKind::Plus => Self::Add,
            TokenKind::Minus if is_prefix => Self::Negate,
            TokenKind::Minus => Self::Subtract,
            TokenKind::Asterisk => Self::Multiply,
            TokenKind::Slash => Self::Divide,
            TokenKind::Bang => Self::Not,
            TokenKind::Equal => Self::Equal,
            TokenKind::NotEqual => Self::NotEqual,
            TokenKind::LessThan => Self::LessThan,
            TokenKind::LessThanOrEqual => Self::LessThanOrEqual,
            TokenKind::GreaterThan => Self::GreaterThan,
            TokenKind::GreaterThanOrEqual => Self::GreaterThanOrEqual,
            TokenKind::And => Self::And,
            TokenKind::Or => Self::Or,
            other => bail!("token is not an operator: {:?}", other),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub pos: usize,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Identifier(String),
    Number(String),
    Unary(Operator, Box<Expr>),
    Binary(Operator, Box<Expr>, Box<Expr>),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Subscript {
        array: Box<Expr>,
        index: Box<Expr>,
    },
    Array(Vec<Expr>),
    Function {
        params: Vec<String>,
        variadic: bool,
        body: Box<Stmt>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub pos: usize,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Declare(String, Expr),
    /// An assignment without a target is a bare expression statement; the
    /// compiler drops its value.
    Assign(Option<String>, Expr),
    ArrayAssign {
        target: Expr,
        index: Expr,
        value: Expr,
    },
    Block(Vec<Stmt>),
    Conditional {
        cond: Expr,
        then: Box<Stmt>,
        alt: Option<Box<Stmt>>,
    },
    Return(Vec<Expr>),
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        update: Option<Box<Stmt>>,
        body: Box<Stmt>,
    },
    Break,
    Continue,
}

fn precedence(kind: &TokenKind) -> u8 {
    match kind {
        TokenKind::Or => 1,
        TokenKind::And => 2,
        TokenKind::Equal | TokenKind::NotEqual => 3,
        TokenKind::LessThan
        | TokenKind::LessThanOrEqual
        | TokenKind::GreaterThan
        | TokenKind::GreaterThanOrEqual => 4,
        TokenKind::Plus | TokenKind::Minus => 5,
        TokenKind::Asterisk | TokenKind::Slash => 6,
        _ => 0,
    }
}

pub struct Parser<'a> {
    tokens: &'a [Token],
    position: usize,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    pub fn parse(&mut self) -> Result<Vec<Stmt>> {
        let mut statements = Vec::new();
        self.skip_separators();
        while !self.check(&TokenKind::EndOfFile) {
            statements.push(self.statement()?);
            self.expect_terminator()?;
        }
        Ok(statements)
    }

    fn statement(&mut self) -> Result<Stmt> {
        match self.kind() {
            TokenKind::LeftBrace => self.block_statement(),
            TokenKind::If => self.if_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Break => {
                let pos = self.advance().pos;
                Ok(Stmt {
                    pos,
                    kind: StmtKind::Break,
                })
            }
            TokenKind::Continue => {
                let pos = self.advance().pos;
                Ok(Stmt {
                    pos,
                    kind: StmtKind::Continue,
                })
            }
            _ => self.simple_statement(),
        }
    }

    /// Declarations, assignments, indexed assignments, and bare expression
    /// statements; also used for `for` init/update clauses.
    fn simple_statement(&mut self) -> Result<Stmt> {
        let pos = self.current().pos;
        if let TokenKind::Identifier(name) = self.kind() {
            let name = name.clone();
            match self.peek_kind(1) {
                Some(TokenKind::DeclareAssign) => {
                    self.position += 2;
                    let expr = self.expression(0)?;
                    return Ok(Stmt {
                        pos,
                        kind: StmtKind::Declare(name, expr),
                    });
                }
                Some(TokenKind::Assign) => {
                    self.position += 2;
                    let expr = self.expression(0)?;
                    return Ok(Stmt {
                        pos,
                        kind: StmtKind::Assign(Some(name), expr),
                    });
                }
                _ => {}
            }
        }
        let expr = self.expression(0)?;
        if self.check(&TokenKind::Assign) {
            let ExprKind::Subscript { array, index } = expr.kind else {
                bail!("invalid assignment target at offset {}", expr.pos);
            };
            self.advance();
            let value = self.expression(0)?;
            return Ok(Stmt {
                pos,
                kind: StmtKind::ArrayAssign {
                    target: *array,
                    index: *index,
                    value,
                },
            });
        }
        Ok(Stmt {
            pos,
            kind: StmtKind::Assign(None, expr),
        })
    }

    fn block_statement(&mut self) -> Result<Stmt> {
        let pos = self.expect(&TokenKind::LeftBrace)?;
        let mut statements = Vec::new();
        self.skip_separators();
        while !self.check(&TokenKind::RightBrace) {
            if self.check(&TokenKind::EndOfFile) {
                bail!("unterminated block at offset {}", pos);
            }
            statements.push(self.statement()?);
            self.expect_terminator()?;
        }
        self.advance();
        Ok(Stmt {
            pos,
            kind: StmtKind::Block(statements),
        })
    }

    fn if_statement(&mut self) -> Result<Stmt> {
        let pos = self.expect(&TokenKind::If)?;
        let cond = self.expression(0)?;
        let then = Box::new(self.block_statement()?);
        let alt = if self.check(&TokenKind::Else) {
            self.advance();
            let stmt = if self.check(&TokenKind::If) {
                self.if_statement()?
            } else {
                self.block_statement()?
            };
            Some(Box::new(stmt))
        } else {
            None
        };
        Ok(Stmt {
            pos,
            kind: StmtKind::Conditional { cond, then, alt },
        })
    }

    fn return_statement(&mut self) -> Result<Stmt> {
        let pos = self.expect(&TokenKind::Return)?;
        let mut exprs = Vec::new();
        if !self.at_terminator() {
            exprs.push(self.expression(0)?);
            while self.check(&TokenKind::Comma) {
                self.advance();
                exprs.push(self.expression(0)?);
            }
        }
        Ok(Stmt {
            pos,
            kind: StmtKind::Return(exprs),
        })
    }

    fn for_statement(&mut self) -> Result<Stmt> {
        let pos = self.expect(&TokenKind::For)?;
        let mut init = None;
        let mut cond = None;
        let mut update = None;
        if !self.check(&TokenKind::LeftBrace) {
            let first = self.simple_statement()?;
            if self.check(&TokenKind::Semicolon) {
                self.advance();
                init = Some(Box::new(first));
                if !self.check(&TokenKind::Semicolon) {
                    cond = Some(self.expression(0)?);
                }
                self.expect(&TokenKind::Semicolon)?;
                if !self.check(&TokenKind::LeftBrace) {
                    update = Some(Box::new(self.simple_statement()?));
                }
            } else {
                // Condition-only form: `for x < 10 { ... }`.
                match first.kind {
                    StmtKind::Assign(None, expr) => cond = Some(expr),
                    _ => bail!(
                        "expected ';' in for statement at offset {}",
                        first.pos
                    ),
                }
            }
        }
        let body = Box::new(self.block_statement()?);
        Ok(Stmt {
            pos,
            kind: StmtKind::For {
                init,
                cond,
                update,
                body,
            },
        })
    }

    fn expression(&mut self, min_precedence: u8) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let prec = precedence(self.kind());
            if prec == 0 || prec <= min_precedence {
                return Ok(left);
            }
            let token = self.advance();
            let op = Operator::from_token(&token.kind, false)?;
            let right = self.expression(prec)?;
            left = Expr {
                pos: left.pos,
                kind: ExprKind::Binary(op, Box::new(left), Box::new(right)),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.kind() {
            TokenKind::Minus | TokenKind::Bang | TokenKind::Plus => {
                let token = self.advance();
                let pos = token.pos;
                let op = Operator::from_token(&token.kind, true)?;
                let operand = self.unary()?;
                Ok(Expr {
                    pos,
                    kind: ExprKind::Unary(op, Box::new(operand)),
                })
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.kind() {
                TokenKind::LeftParen => {
                    self.advance();
                    let args =
                        self.expression_list(&TokenKind::RightParen)?;
                    expr = Expr {
                        pos: expr.pos,
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                    };
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.expression(0)?;
                    self.expect(&TokenKind::RightBracket)?;
                    expr = Expr {
                        pos: expr.pos,
                        kind: ExprKind::Subscript {
                            array: Box::new(expr),
                            index: Box::new(index),
                        },
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let pos = self.current().pos;
        match self.kind().clone() {
            TokenKind::Number(text) => {
                self.advance();
                Ok(Expr {
                    pos,
                    kind: ExprKind::Number(text),
                })
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr {
                    pos,
                    kind: ExprKind::Identifier(name),
                })
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression(0)?;
                self.expect(&TokenKind::RightParen)?;
                Ok(expr)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let elements =
                    self.expression_list(&TokenKind::RightBracket)?;
                Ok(Expr {
                    pos,
                    kind: ExprKind::Array(elements),
                })
            }
            TokenKind::Function => self.function_literal(),
            other => {
                bail!("unexpected token {:?} at offset {}", other, pos)
            }
        }
    }

    fn function_literal(&mut self) -> Result<Expr> {
        let pos = self.expect(&TokenKind::Function)?;
        self.expect(&TokenKind::LeftParen)?;
        let mut params = Vec::new();
        let mut variadic = false;
        while !self.check(&TokenKind::RightParen) {
            if variadic {
                bail!(
                    "variadic parameter must be last at offset {}",
                    self.current().pos
                );
            }
            let TokenKind::Identifier(name) = self.kind().clone() else {
                bail!(
                    "expected parameter name at offset {}",
                    self.current().pos
                );
            };
            self.advance();
            params.push(name);
            if self.check(&TokenKind::Ellipsis) {
                self.advance();
                variadic = true;
            }
            if self.check(&TokenKind::Comma) {
                self.advance();
            }
        }
        self.advance();
        let body = Box::new(self.block_statement()?);
        Ok(Expr {
            pos,
            kind: ExprKind::Function {
                params,
                variadic,
                body,
            },
        })
    }

    /// Comma-separated expressions up to (and consuming) the closing
    /// delimiter; newlines around elements are insignificant.
    fn expression_list(&mut self, close: &TokenKind) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        self.skip_newlines();
        while !self.check(close) {
            items.push(self.expression(0)?);
            self.skip_newlines();
            if self.check(&TokenKind::Comma) {
                self.advance();
                self.skip_newlines();
            } else {
                break;
            }
        }
        self.expect(close)?;
        Ok(items)
    }

    fn current(&self) -> &Token {
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn peek_kind(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.position + offset).map(|t| &t.kind)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.kind() == kind
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<usize> {
        if !self.check(kind) {
            bail!(
                "expected {:?}, found {:?} at offset {}",
                kind,
                self.kind(),
                self.current().pos
            );
        }
        Ok(self.advance().pos)
    }

    fn at_terminator(&self) -> bool {
        matches!(
            self.kind(),
            TokenKind::Newline
                | TokenKind::Semicolon
                | TokenKind::RightBrace
                | TokenKind::EndOfFile
        )
    }

    fn expect_terminator(&mut self) -> Result<()> {
        if !self.at_terminator() {
            bail!(
                "unexpected token {:?} at offset {}",
                self.kind(),
                self.current().pos
            );
        }
        self.skip_separators();
        Ok(())
    }

    fn skip_separators(&mut self) {
        while matches!(
            self.kind(),
            TokenKind::Newline | TokenKind::Semicolon
        ) {
            self.advance();
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }
}
