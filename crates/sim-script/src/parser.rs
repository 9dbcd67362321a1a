use crate::ast::{BinOp, Expr, ExprKind, PathSeg, Spanned, Stmt, UnOp};
use crate::error::{line_col, ScriptError};
use crate::lexer::{lex, Span, Token};

/// Parse a whole behavior-script source into a statement list.
pub fn parse(src: &str) -> Result<Vec<Spanned<Stmt>>, ScriptError> {
    let tokens = lex(src)?;
    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
    };
    let program = parser.block_body(None)?;
    Ok(program)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| s.clone())
            .unwrap_or(self.src.len()..self.src.len())
    }

    fn advance(&mut self) -> Option<(Token, Span)> {
        let item = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        item
    }

    fn error(&self, span: &Span, message: impl Into<String>) -> ScriptError {
        let (line, column) = line_col(self.src, span.start);
        ScriptError::Syntax {
            message: message.into(),
            line,
            column,
        }
    }

    fn unexpected(&self, expected: &str) -> ScriptError {
        let span = self.peek_span();
        let found = match self.peek() {
            Some(token) => format!("{:?}", token),
            None => "end of input".to_string(),
        };
        self.error(&span, format!("expected {}, found {}", expected, found))
    }

    fn expect(&mut self, token: Token, expected: &str) -> Result<Span, ScriptError> {
        match self.peek() {
            Some(t) if *t == token => Ok(self.advance().expect("peeked token").1),
            _ => Err(self.unexpected(expected)),
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<(String, Span), ScriptError> {
        match self.peek() {
            Some(Token::Ident(_)) => {
                let (token, span) = self.advance().expect("peeked token");
                match token {
                    Token::Ident(name) => Ok((name, span)),
                    _ => unreachable!(),
                }
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    /// Parse statements until end of input (`terminator` None) or a closing
    /// brace (`terminator` Some).
    fn block_body(&mut self, terminator: Option<Token>) -> Result<Vec<Spanned<Stmt>>, ScriptError> {
        let mut stmts = Vec::new();
        loop {
            match (self.peek(), &terminator) {
                (None, None) => return Ok(stmts),
                (None, Some(_)) => return Err(self.unexpected("'}'")),
                (Some(t), Some(term)) if t == term => {
                    self.advance();
                    return Ok(stmts);
                }
                _ => stmts.push(self.statement()?),
            }
        }
    }

    fn braced_block(&mut self) -> Result<Vec<Spanned<Stmt>>, ScriptError> {
        self.expect(Token::LBrace, "'{'")?;
        self.block_body(Some(Token::RBrace))
    }

    fn statement(&mut self) -> Result<Spanned<Stmt>, ScriptError> {
        let start = self.peek_span();
        match self.peek() {
            Some(Token::Let) => {
                self.advance();
                let (name, _) = self.expect_ident("identifier after 'let'")?;
                self.expect(Token::Assign, "'=' in let binding")?;
                let value = self.expression()?;
                let end = self.expect(Token::Semi, "';' after let binding")?;
                Ok(Spanned::new(Stmt::Let { name, value }, start.start..end.end))
            }
            Some(Token::If) => self.if_statement(start),
            Some(Token::For) => {
                self.advance();
                let (var, _) = self.expect_ident("loop variable")?;
                self.expect(Token::In, "'in'")?;
                let iter = self.expression()?;
                let body = self.braced_block()?;
                let end = self.prev_span_end();
                Ok(Spanned::new(Stmt::For { var, iter, body }, start.start..end))
            }
            Some(Token::Return) => {
                self.advance();
                let value = if matches!(self.peek(), Some(Token::Semi)) {
                    None
                } else {
                    Some(self.expression()?)
                };
                let end = self.expect(Token::Semi, "';' after return")?;
                Ok(Spanned::new(Stmt::Return(value), start.start..end.end))
            }
            _ => {
                let expr = self.expression()?;
                if matches!(self.peek(), Some(Token::Assign)) {
                    self.advance();
                    let (root, segments) = assignment_target(self, expr)?;
                    let value = self.expression()?;
                    let end = self.expect(Token::Semi, "';' after assignment")?;
                    return Ok(Spanned::new(
                        Stmt::Assign {
                            root,
                            segments,
                            value,
                        },
                        start.start..end.end,
                    ));
                }
                let end = self.expect(Token::Semi, "';' after expression")?;
                Ok(Spanned::new(Stmt::Expr(expr), start.start..end.end))
            }
        }
    }

    fn if_statement(&mut self, start: Span) -> Result<Spanned<Stmt>, ScriptError> {
        self.expect(Token::If, "'if'")?;
        let cond = self.expression()?;
        let then_branch = self.braced_block()?;
        let else_branch = if matches!(self.peek(), Some(Token::Else)) {
            self.advance();
            if matches!(self.peek(), Some(Token::If)) {
                let nested_start = self.peek_span();
                vec![self.if_statement(nested_start)?]
            } else {
                self.braced_block()?
            }
        } else {
            Vec::new()
        };
        let end = self.prev_span_end();
        Ok(Spanned::new(
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            },
            start.start..end,
        ))
    }

    fn prev_span_end(&self) -> usize {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|(_, s)| s.end)
            .unwrap_or(self.src.len())
    }

    // Precedence climbing: or < and < equality < comparison < additive <
    // multiplicative < unary < postfix < primary.

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.and_expr()?;
            lhs = binary(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.equality_expr()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.equality_expr()?;
            lhs = binary(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn equality_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.comparison_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.comparison_expr()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn comparison_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.additive_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.additive_expr()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn additive_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.multiplicative_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.multiplicative_expr()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplicative_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary_expr()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary_expr(&mut self) -> Result<Expr, ScriptError> {
        match self.peek() {
            Some(Token::Minus) => {
                let span = self.peek_span();
                self.advance();
                let expr = self.unary_expr()?;
                let full = span.start..expr.span.end;
                Ok(Expr {
                    kind: ExprKind::Unary {
                        op: UnOp::Neg,
                        expr: Box::new(expr),
                    },
                    span: full,
                })
            }
            Some(Token::Not) => {
                let span = self.peek_span();
                self.advance();
                let expr = self.unary_expr()?;
                let full = span.start..expr.span.end;
                Ok(Expr {
                    kind: ExprKind::Unary {
                        op: UnOp::Not,
                        expr: Box::new(expr),
                    },
                    span: full,
                })
            }
            _ => self.postfix_expr(),
        }
    }

    fn postfix_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.primary_expr()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let (name, name_span) = self.expect_ident("field or method name")?;
                    if matches!(self.peek(), Some(Token::LParen)) {
                        let args = self.call_args()?;
                        let span = expr.span.start..self.prev_span_end();
                        expr = Expr {
                            kind: ExprKind::Call {
                                base: Some(Box::new(expr)),
                                name,
                                args,
                            },
                            span,
                        };
                    } else {
                        let span = expr.span.start..name_span.end;
                        expr = Expr {
                            kind: ExprKind::Field {
                                base: Box::new(expr),
                                name,
                            },
                            span,
                        };
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.expression()?;
                    let end = self.expect(Token::RBracket, "']'")?;
                    let span = expr.span.start..end.end;
                    expr = Expr {
                        kind: ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ScriptError> {
        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            match self.peek() {
                Some(Token::Comma) => {
                    self.advance();
                }
                Some(Token::RParen) => {
                    self.advance();
                    return Ok(args);
                }
                _ => return Err(self.unexpected("',' or ')'")),
            }
        }
    }

    fn primary_expr(&mut self) -> Result<Expr, ScriptError> {
        let span = self.peek_span();
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Number(n),
                    span,
                })
            }
            Some(Token::Str(s)) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Str(s),
                    span,
                })
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Bool(true),
                    span,
                })
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Bool(false),
                    span,
                })
            }
            Some(Token::Null) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Null,
                    span,
                })
            }
            Some(Token::Ident(name)) => {
                self.advance();
                if matches!(self.peek(), Some(Token::LParen)) {
                    let args = self.call_args()?;
                    let full = span.start..self.prev_span_end();
                    return Ok(Expr {
                        kind: ExprKind::Call {
                            base: None,
                            name,
                            args,
                        },
                        span: full,
                    });
                }
                Ok(Expr {
                    kind: ExprKind::Var(name),
                    span,
                })
            }
            Some(Token::LParen) => {
                self.advance();
                let expr = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Some(Token::LBracket) => self.array_literal(span),
            Some(Token::LBrace) => self.object_literal(span),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn array_literal(&mut self, start: Span) -> Result<Expr, ScriptError> {
        self.expect(Token::LBracket, "'['")?;
        let mut items = Vec::new();
        if matches!(self.peek(), Some(Token::RBracket)) {
            let end = self.advance().expect("peeked token").1;
            return Ok(Expr {
                kind: ExprKind::Array(items),
                span: start.start..end.end,
            });
        }
        loop {
            items.push(self.expression()?);
            match self.peek() {
                Some(Token::Comma) => {
                    self.advance();
                }
                Some(Token::RBracket) => {
                    let end = self.advance().expect("peeked token").1;
                    return Ok(Expr {
                        kind: ExprKind::Array(items),
                        span: start.start..end.end,
                    });
                }
                _ => return Err(self.unexpected("',' or ']'")),
            }
        }
    }

    fn object_literal(&mut self, start: Span) -> Result<Expr, ScriptError> {
        self.expect(Token::LBrace, "'{'")?;
        let mut fields = Vec::new();
        if matches!(self.peek(), Some(Token::RBrace)) {
            let end = self.advance().expect("peeked token").1;
            return Ok(Expr {
                kind: ExprKind::Object(fields),
                span: start.start..end.end,
            });
        }
        loop {
            let key = match self.peek().cloned() {
                Some(Token::Str(s)) => {
                    self.advance();
                    s
                }
                Some(Token::Ident(name)) => {
                    self.advance();
                    name
                }
                _ => return Err(self.unexpected("object key")),
            };
            self.expect(Token::Colon, "':'")?;
            fields.push((key, self.expression()?));
            match self.peek() {
                Some(Token::Comma) => {
                    self.advance();
                }
                Some(Token::RBrace) => {
                    let end = self.advance().expect("peeked token").1;
                    return Ok(Expr {
                        kind: ExprKind::Object(fields),
                        span: start.start..end.end,
                    });
                }
                _ => return Err(self.unexpected("',' or '}'")),
            }
        }
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    let span = lhs.span.start..rhs.span.end;
    Expr {
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        span,
    }
}

/// Rewrite an already-parsed expression into an assignment target.
fn assignment_target(
    parser: &Parser<'_>,
    expr: Expr,
) -> Result<(String, Vec<PathSeg>), ScriptError> {
    let mut segments = Vec::new();
    let mut cursor = expr;
    loop {
        match cursor.kind {
            ExprKind::Var(name) => {
                segments.reverse();
                return Ok((name, segments));
            }
            ExprKind::Field { base, name } => {
                segments.push(PathSeg::Field(name));
                cursor = *base;
            }
            ExprKind::Index { base, index } => {
                segments.push(PathSeg::Index(*index));
                cursor = *base;
            }
            _ => {
                return Err(parser.error(&cursor.span, "invalid assignment target"));
            }
        }
    }
}
