/*
 * Copyright (c) 2026 the Vibe Engine developers.
 *
 * This file is part of the Vibe Script Engine.
 *
 * Licensed under the MIT License. See LICENSE for details.
 */

//! Surface parser — recursive descent.
//!
//! Parses script source into the `Item` / `Statement` / `Expression` AST in
//! `ast.rs`. Infix chains are emitted as flat `Sequence` nodes; precedence
//! folding happens later in the compiler so that a fold failure can fall
//! back to the raw ordering instead of failing the whole program.

use crate::ast::{
    Expression, FieldDecl, FunctionDecl, Item, SourceRange, Statement, StructDecl,
};
use thiserror::Error;

// ─── Error Types ─────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("syntax error at {file}:{line}:{col}: {message}")]
    Syntax { message: String, line: u32, col: u32, file: String },
    #[error("expected {expected}, found {found} at {file}:{line}:{col}")]
    UnexpectedToken { expected: String, found: String, line: u32, col: u32, file: String },
    #[error("unexpected end of file in {file}")]
    UnexpectedEof { file: String },
}

impl ParseError {
    fn syntax(msg: impl Into<String>, tok: &Token, file: &str) -> Self {
        ParseError::Syntax {
            message: msg.into(),
            line: tok.line,
            col: tok.col,
            file: file.to_string(),
        }
    }

    fn unexpected(expected: impl Into<String>, tok: &Token, file: &str) -> Self {
        ParseError::UnexpectedToken {
            expected: expected.into(),
            found: format!("{:?}", tok.kind),
            line: tok.line,
            col: tok.col,
            file: file.to_string(),
        }
    }
}

// ─── Token Types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Integer(i64),
    Float(f64),
    StringLit(String),
    Identifier(String),

    // Keywords
    Let,
    Var,
    Func,
    Struct,
    If,
    Else,
    While,
    Return,
    True,
    False,
    Nil,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign, // =
    EqEq,   // ==
    Lt,
    Gt,
    Le, // <=
    Ge, // >=
    AndAnd,
    OrOr,

    // Delimiters
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Semicolon,

    // Special
    Eof,
}

impl TokenKind {
    /// The literal text of a binary operator token, used to build
    /// `OperatorRef` nodes.
    fn operator_text(&self) -> Option<&'static str> {
        Some(match self {
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Assign => "=",
            TokenKind::EqEq => "==",
            TokenKind::Lt => "<",
            TokenKind::Gt => ">",
            TokenKind::Le => "<=",
            TokenKind::Ge => ">=",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub start: u32,
    pub end: u32,
    pub line: u32,
    pub col: u32,
}

impl Token {
    fn range(&self) -> SourceRange {
        SourceRange::new(self.start, self.end)
    }
}

// ─── Lexer ───────────────────────────────────────────────────────────────────

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    byte_pos: u32,
    line: u32,
    col: u32,
    file: String,
}

impl Lexer {
    pub fn new(source: &str, file: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            byte_pos: 0,
            line: 1,
            col: 1,
            file: file.to_string(),
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            if self.pos >= self.source.len() {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    start: self.byte_pos,
                    end: self.byte_pos,
                    line: self.line,
                    col: self.col,
                });
                break;
            }
            let tok = self.next_token()?;
            tokens.push(tok);
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek_ahead(&self, offset: usize) -> Option<char> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        self.byte_pos += ch.len_utf8() as u32;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_ahead(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, ParseError> {
        let start = self.byte_pos;
        let line = self.line;
        let col = self.col;
        let ch = self.advance().ok_or(ParseError::UnexpectedEof { file: self.file.clone() })?;

        let kind = match ch {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '=' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '!' => TokenKind::Bang,
            '&' => {
                if self.peek() == Some('&') {
                    self.advance();
                    TokenKind::AndAnd
                } else {
                    return Err(ParseError::Syntax {
                        message: "stray '&'".to_string(),
                        line,
                        col,
                        file: self.file.clone(),
                    });
                }
            }
            '|' => {
                if self.peek() == Some('|') {
                    self.advance();
                    TokenKind::OrOr
                } else {
                    return Err(ParseError::Syntax {
                        message: "stray '|'".to_string(),
                        line,
                        col,
                        file: self.file.clone(),
                    });
                }
            }
            '"' => {
                let mut text = String::new();
                loop {
                    match self.advance() {
                        Some('"') => break,
                        Some('\\') => {
                            let escaped = self.advance().ok_or(ParseError::UnexpectedEof {
                                file: self.file.clone(),
                            })?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                '"' => '"',
                                '\\' => '\\',
                                other => other,
                            });
                        }
                        Some(c) => text.push(c),
                        None => {
                            return Err(ParseError::Syntax {
                                message: "unterminated string literal".to_string(),
                                line,
                                col,
                                file: self.file.clone(),
                            });
                        }
                    }
                }
                TokenKind::StringLit(text)
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                text.push(c);
                let mut is_float = false;
                loop {
                    match self.peek() {
                        Some(d) if d.is_ascii_digit() => {
                            text.push(d);
                            self.advance();
                        }
                        Some('.') if self.peek_ahead(1).is_some_and(|d| d.is_ascii_digit()) => {
                            is_float = true;
                            text.push('.');
                            self.advance();
                        }
                        _ => break,
                    }
                }
                if is_float {
                    let value = text.parse::<f64>().map_err(|_| ParseError::Syntax {
                        message: format!("invalid float literal '{}'", text),
                        line,
                        col,
                        file: self.file.clone(),
                    })?;
                    TokenKind::Float(value)
                } else {
                    let value = text.parse::<i64>().map_err(|_| ParseError::Syntax {
                        message: format!("invalid integer literal '{}'", text),
                        line,
                        col,
                        file: self.file.clone(),
                    })?;
                    TokenKind::Integer(value)
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut text = String::new();
                text.push(c);
                while let Some(i) = self.peek() {
                    if i.is_alphanumeric() || i == '_' {
                        text.push(i);
                        self.advance();
                    } else {
                        break;
                    }
                }
                match text.as_str() {
                    "let" => TokenKind::Let,
                    "var" => TokenKind::Var,
                    "func" => TokenKind::Func,
                    "struct" => TokenKind::Struct,
                    "if" => TokenKind::If,
                    "else" => TokenKind::Else,
                    "while" => TokenKind::While,
                    "return" => TokenKind::Return,
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "nil" => TokenKind::Nil,
                    _ => TokenKind::Identifier(text),
                }
            }
            other => {
                return Err(ParseError::Syntax {
                    message: format!("unexpected character '{}'", other),
                    line,
                    col,
                    file: self.file.clone(),
                });
            }
        };

        Ok(Token { kind, start, end: self.byte_pos, line, col })
    }
}

// ─── Parser ──────────────────────────────────────────────────────────────────

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: String,
}

/// Parse a whole source text into top-level items.
pub fn parse_source(source: &str, file: &str) -> Result<Vec<Item>, ParseError> {
    let tokens = Lexer::new(source, file).tokenize()?;
    let mut parser = Parser { tokens, pos: 0, file: file.to_string() };
    parser.parse_program()
}

/// Parse a fragment as a single expression. Used by the compiler's textual
/// assignment fallback; ranges are relative to the fragment.
pub fn parse_expression_source(source: &str, file: &str) -> Result<Expression, ParseError> {
    let tokens = Lexer::new(source, file).tokenize()?;
    let mut parser = Parser { tokens, pos: 0, file: file.to_string() };
    let expr = parser.parse_expression()?;
    parser.expect_eof()?;
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ParseError> {
        if self.peek_kind() == &kind {
            Ok(self.advance())
        } else {
            Err(ParseError::unexpected(what, self.peek(), &self.file))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<(String, Token), ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Identifier(name) => {
                let tok = self.advance();
                Ok((name, tok))
            }
            _ => Err(ParseError::unexpected(what, self.peek(), &self.file)),
        }
    }

    fn expect_eof(&mut self) -> Result<(), ParseError> {
        if matches!(self.peek_kind(), TokenKind::Eof) {
            Ok(())
        } else {
            Err(ParseError::unexpected("end of input", self.peek(), &self.file))
        }
    }

    fn parse_program(&mut self) -> Result<Vec<Item>, ParseError> {
        let mut items = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::Eof) {
            if self.eat(&TokenKind::Semicolon) {
                continue;
            }
            items.push(self.parse_item()?);
        }
        Ok(items)
    }

    fn parse_item(&mut self) -> Result<Item, ParseError> {
        match self.peek_kind() {
            TokenKind::Struct => Ok(Item::Struct(self.parse_struct_decl()?)),
            TokenKind::Func => Ok(Item::Function(self.parse_func_decl()?)),
            _ => Ok(Item::Statement(self.parse_statement()?)),
        }
    }

    // ─── Declarations ────────────────────────────────────────────────────────

    fn parse_struct_decl(&mut self) -> Result<StructDecl, ParseError> {
        let start = self.expect(TokenKind::Struct, "'struct'")?;
        let (name, _) = self.expect_identifier("struct name")?;
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut fields = Vec::new();
        loop {
            if self.eat(&TokenKind::Semicolon) {
                continue;
            }
            match self.peek_kind() {
                TokenKind::RBrace => break,
                TokenKind::Var | TokenKind::Let => {
                    let field_start = self.advance();
                    let (field_name, name_tok) = self.expect_identifier("field name")?;
                    let type_hint = if self.eat(&TokenKind::Colon) {
                        let (ty, _) = self.expect_identifier("type name")?;
                        Some(ty)
                    } else {
                        None
                    };
                    fields.push(FieldDecl {
                        name: field_name,
                        type_hint,
                        range: SourceRange::new(field_start.start, name_tok.end),
                    });
                }
                _ => {
                    return Err(ParseError::unexpected(
                        "'var' field declaration or '}'",
                        self.peek(),
                        &self.file,
                    ));
                }
            }
        }
        let end = self.expect(TokenKind::RBrace, "'}'")?;
        Ok(StructDecl { name, fields, range: SourceRange::new(start.start, end.end) })
    }

    fn parse_func_decl(&mut self) -> Result<FunctionDecl, ParseError> {
        let start = self.expect(TokenKind::Func, "'func'")?;
        let (name, _) = self.expect_identifier("function name")?;
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !matches!(self.peek_kind(), TokenKind::RParen) {
            loop {
                let (param, _) = self.expect_identifier("parameter name")?;
                // Optional `name: Type` annotation; the type is discarded.
                if self.eat(&TokenKind::Colon) {
                    self.expect_identifier("type name")?;
                }
                params.push(param);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        let (body, end) = self.parse_block()?;
        Ok(FunctionDecl { name, params, body, range: SourceRange::new(start.start, end) })
    }

    /// `{ statement* }`, returning the body and the closing brace's end.
    fn parse_block(&mut self) -> Result<(Vec<Statement>, u32), ParseError> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut statements = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RBrace | TokenKind::Eof) {
            if self.eat(&TokenKind::Semicolon) {
                continue;
            }
            statements.push(self.parse_statement()?);
        }
        let end = self.expect(TokenKind::RBrace, "'}'")?;
        Ok((statements, end.end))
    }

    // ─── Statements ──────────────────────────────────────────────────────────

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        match self.peek_kind() {
            TokenKind::Let | TokenKind::Var => self.parse_let(),
            TokenKind::Return => self.parse_return(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Func | TokenKind::Struct => Err(ParseError::syntax(
                "declarations are only allowed at the top level",
                self.peek(),
                &self.file,
            )),
            _ => {
                let expr = self.parse_expression()?;
                let range = expr.range();
                self.eat(&TokenKind::Semicolon);
                Ok(Statement::Expression { expr, range })
            }
        }
    }

    fn parse_let(&mut self) -> Result<Statement, ParseError> {
        let intro = self.advance();
        let mutable = intro.kind == TokenKind::Var;
        let (name, _) = self.expect_identifier("binding name")?;
        let type_hint = if self.eat(&TokenKind::Colon) {
            let (ty, _) = self.expect_identifier("type name")?;
            Some(ty)
        } else {
            None
        };
        self.expect(TokenKind::Assign, "'='")?;
        let value = self.parse_expression()?;
        let range = SourceRange::new(intro.start, value.range().end);
        self.eat(&TokenKind::Semicolon);
        Ok(Statement::Let { name, mutable, type_hint, value, range })
    }

    fn parse_return(&mut self) -> Result<Statement, ParseError> {
        let intro = self.expect(TokenKind::Return, "'return'")?;
        let value = if self.statement_boundary() {
            None
        } else {
            Some(self.parse_expression()?)
        };
        let end = value.as_ref().map(|v| v.range().end).unwrap_or(intro.end);
        self.eat(&TokenKind::Semicolon);
        Ok(Statement::Return { value, range: SourceRange::new(intro.start, end) })
    }

    fn statement_boundary(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::RBrace
                | TokenKind::Eof
                | TokenKind::Semicolon
                | TokenKind::Let
                | TokenKind::Var
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Func
                | TokenKind::Struct
        )
    }

    fn parse_if(&mut self) -> Result<Statement, ParseError> {
        let intro = self.expect(TokenKind::If, "'if'")?;
        let condition = self.parse_expression()?;
        let (then_block, mut end) = self.parse_block()?;
        let else_block = if self.eat(&TokenKind::Else) {
            if matches!(self.peek_kind(), TokenKind::If) {
                let nested = self.parse_if()?;
                end = nested.range().end;
                Some(vec![nested])
            } else {
                let (block, block_end) = self.parse_block()?;
                end = block_end;
                Some(block)
            }
        } else {
            None
        };
        Ok(Statement::If {
            condition,
            then_block,
            else_block,
            range: SourceRange::new(intro.start, end),
        })
    }

    fn parse_while(&mut self) -> Result<Statement, ParseError> {
        let intro = self.expect(TokenKind::While, "'while'")?;
        let condition = self.parse_expression()?;
        let (body, end) = self.parse_block()?;
        Ok(Statement::While { condition, body, range: SourceRange::new(intro.start, end) })
    }

    // ─── Expressions ─────────────────────────────────────────────────────────

    /// Operands and operators are collected flat; precedence is applied by
    /// the compiler's folding pass.
    pub fn parse_expression(&mut self) -> Result<Expression, ParseError> {
        let first = self.parse_operand()?;
        if self.peek_kind().operator_text().is_none() {
            return Ok(first);
        }
        let mut elements = vec![first];
        while let Some(text) = self.peek_kind().operator_text() {
            let op_tok = self.advance();
            elements.push(Expression::OperatorRef {
                text: text.to_string(),
                range: op_tok.range(),
            });
            elements.push(self.parse_operand()?);
        }
        let range = elements
            .first()
            .map(|e| e.range())
            .unwrap_or_default()
            .merge(elements.last().map(|e| e.range()).unwrap_or_default());
        Ok(Expression::Sequence { elements, range })
    }

    fn parse_operand(&mut self) -> Result<Expression, ParseError> {
        match self.peek_kind() {
            TokenKind::Minus | TokenKind::Bang => {
                let op_tok = self.advance();
                let op = if op_tok.kind == TokenKind::Minus { "-" } else { "!" };
                let operand = self.parse_operand()?;
                let range = op_tok.range().merge(operand.range());
                Ok(Expression::Prefix {
                    op: op.to_string(),
                    operand: Box::new(operand),
                    range,
                })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::Dot => {
                    self.advance();
                    let (name, name_tok) = self.expect_identifier("member name")?;
                    let range = expr.range().merge(name_tok.range());
                    expr = Expression::Member { base: Box::new(expr), name, range };
                }
                TokenKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek_kind(), TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expression()?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    let close = self.expect(TokenKind::RParen, "')'")?;
                    let range = expr.range().merge(close.range());
                    expr = Expression::Call { callee: Box::new(expr), args, range };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expression, ParseError> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Integer(value) => {
                self.advance();
                Ok(Expression::IntLit { value, range: tok.range() })
            }
            TokenKind::Float(value) => {
                self.advance();
                Ok(Expression::FloatLit { value, range: tok.range() })
            }
            TokenKind::StringLit(ref value) => {
                let value = value.clone();
                self.advance();
                Ok(Expression::StrLit { value, range: tok.range() })
            }
            TokenKind::True => {
                self.advance();
                Ok(Expression::BoolLit { value: true, range: tok.range() })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expression::BoolLit { value: false, range: tok.range() })
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expression::NilLit { range: tok.range() })
            }
            TokenKind::Identifier(ref name) => {
                let name = name.clone();
                self.advance();
                Ok(Expression::Identifier { name, range: tok.range() })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            _ => Err(ParseError::unexpected("an expression", &tok, &self.file)),
        }
    }
}
