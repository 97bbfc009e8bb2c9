/*
 * Copyright (c) 2026 the Vibe Engine developers.
 *
 * This file is part of the Vibe Script Engine.
 *
 * Licensed under the MIT License. See LICENSE for details.
 */

//! The surface syntax tree.
//!
//! Nodes carry byte ranges, not line/column positions; the compiler
//! converts through a `LineIndex` when it stamps spans onto instructions.
//!
//! Infix chains are deliberately kept *flat*: the parser produces a
//! `Sequence` of operands and `OperatorRef`s, and a separate folding pass
//! turns sequences into `Infix` trees by precedence. When folding fails the
//! compiler lowers the raw sequence left to right, so programs still
//! assemble.

use serde::{Deserialize, Serialize};

/// A half-open byte range into the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceRange {
    pub start: u32,
    pub end: u32,
}

impl SourceRange {
    pub fn new(start: u32, end: u32) -> Self {
        SourceRange { start, end }
    }

    pub fn merge(self, other: SourceRange) -> Self {
        SourceRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// One top-level item. Struct and function declarations are hoisted by the
/// compiler; everything else becomes the synthetic entry function's body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    Struct(StructDecl),
    Function(FunctionDecl),
    Statement(Statement),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    /// Optional declared type name. Used as a member-lowering hint only.
    pub type_hint: Option<String>,
    pub range: SourceRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
    pub range: SourceRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    /// Positional parameter names; the surface language has no labels.
    pub params: Vec<String>,
    pub body: Vec<Statement>,
    pub range: SourceRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Let {
        name: String,
        mutable: bool,
        type_hint: Option<String>,
        value: Expression,
        range: SourceRange,
    },
    Return {
        value: Option<Expression>,
        range: SourceRange,
    },
    If {
        condition: Expression,
        then_block: Vec<Statement>,
        /// `else if` parses as an else block holding a single nested `If`.
        else_block: Option<Vec<Statement>>,
        range: SourceRange,
    },
    While {
        condition: Expression,
        body: Vec<Statement>,
        range: SourceRange,
    },
    Expression {
        expr: Expression,
        range: SourceRange,
    },
}

impl Statement {
    pub fn range(&self) -> SourceRange {
        match self {
            Statement::Let { range, .. }
            | Statement::Return { range, .. }
            | Statement::If { range, .. }
            | Statement::While { range, .. }
            | Statement::Expression { range, .. } => *range,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    IntLit {
        value: i64,
        range: SourceRange,
    },
    FloatLit {
        value: f64,
        range: SourceRange,
    },
    BoolLit {
        value: bool,
        range: SourceRange,
    },
    StrLit {
        value: String,
        range: SourceRange,
    },
    NilLit {
        range: SourceRange,
    },
    Identifier {
        name: String,
        range: SourceRange,
    },
    /// An operator appearing inside a flat `Sequence`.
    OperatorRef {
        text: String,
        range: SourceRange,
    },
    /// An unfolded infix chain: operand, operator, operand, operator, ...
    Sequence {
        elements: Vec<Expression>,
        range: SourceRange,
    },
    /// A folded binary application.
    Infix {
        op: String,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
        range: SourceRange,
    },
    /// Prefix `-` or `!`.
    Prefix {
        op: String,
        operand: Box<Expression>,
        range: SourceRange,
    },
    Call {
        callee: Box<Expression>,
        args: Vec<Expression>,
        range: SourceRange,
    },
    Member {
        base: Box<Expression>,
        name: String,
        range: SourceRange,
    },
}

impl Expression {
    pub fn range(&self) -> SourceRange {
        match self {
            Expression::IntLit { range, .. }
            | Expression::FloatLit { range, .. }
            | Expression::BoolLit { range, .. }
            | Expression::StrLit { range, .. }
            | Expression::NilLit { range }
            | Expression::Identifier { range, .. }
            | Expression::OperatorRef { range, .. }
            | Expression::Sequence { range, .. }
            | Expression::Infix { range, .. }
            | Expression::Prefix { range, .. }
            | Expression::Call { range, .. }
            | Expression::Member { range, .. } => *range,
        }
    }

    /// The callee name when this is a plain `name(...)` call.
    pub fn callee_name(&self) -> Option<&str> {
        match self {
            Expression::Call { callee, .. } => match callee.as_ref() {
                Expression::Identifier { name, .. } => Some(name),
                _ => None,
            },
            _ => None,
        }
    }
}
