//! Lowering from the parsed tree to a bytecode `Program`.
//!
//! The pipeline per source text: parse, fold operators (opportunistically),
//! bucket top-level items, register struct layouts and function IDs, compile
//! the synthetic entry function from the leftover statements, compile each
//! user function, merge the per-function instruction blocks while rebasing
//! jump targets, then assemble the byte stream and span map.

use crate::ast::{Expression, FunctionDecl, Item, SourceRange, Statement, StructDecl};
use crate::builder::{BuildError, ConstantPoolBuilder, InstructionBuilder};
use crate::bytecode::{
    Constant, DecodeError, FieldLayout, FunctionMeta, FunctionSignature, OpCode, Program,
    StructLayout,
};
use crate::diagnostic::{Diagnostic, LineIndex, Span};
use crate::parser::{self, ParseError};
use crate::symbols::{FieldId, FunctionId, ProgramSymbolTable, SymbolId};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("unsupported expression: {what}")]
    UnsupportedExpression { what: String, range: SourceRange },
    #[error("unknown identifier '{name}'")]
    UnknownIdentifier { name: String, range: SourceRange },
    #[error("unsupported assignment target")]
    UnsupportedAssignmentTarget { range: SourceRange },
    #[error("unsupported condition form")]
    UnsupportedCondition { range: SourceRange },
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl CompileError {
    fn range(&self) -> Option<SourceRange> {
        match self {
            CompileError::UnsupportedExpression { range, .. }
            | CompileError::UnknownIdentifier { range, .. }
            | CompileError::UnsupportedAssignmentTarget { range }
            | CompileError::UnsupportedCondition { range } => Some(*range),
            CompileError::Build(_) | CompileError::Decode(_) => None,
        }
    }
}

// ─── Operator folding ────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FoldError {
    #[error("operator '{0}' has no precedence entry")]
    UnknownOperator(String),
    #[error("malformed operand/operator sequence")]
    MalformedSequence,
}

/// Binding power and right-associativity for the folding pass. Assignment
/// binds loosest so `x = a + b` folds as `x = (a + b)`.
fn precedence(op: &str) -> Option<(u8, bool)> {
    Some(match op {
        "=" => (1, true),
        "||" => (2, false),
        "&&" => (3, false),
        "==" => (4, false),
        "<" | ">" | "<=" | ">=" => (5, false),
        "+" | "-" => (6, false),
        "*" | "/" | "%" => (7, false),
        _ => return None,
    })
}

/// Fold flat sequences into precedence-respecting `Infix` trees, recursing
/// through every operand position. Fails on malformed sequences; callers
/// fall back to the raw tree so programs still assemble.
pub fn fold_expression(expr: &Expression) -> Result<Expression, FoldError> {
    match expr {
        Expression::Sequence { elements, .. } => fold_sequence(elements),
        Expression::Prefix { op, operand, range } => Ok(Expression::Prefix {
            op: op.clone(),
            operand: Box::new(fold_expression(operand)?),
            range: *range,
        }),
        Expression::Call { callee, args, range } => Ok(Expression::Call {
            callee: Box::new(fold_expression(callee)?),
            args: args.iter().map(fold_expression).collect::<Result<_, _>>()?,
            range: *range,
        }),
        Expression::Member { base, name, range } => Ok(Expression::Member {
            base: Box::new(fold_expression(base)?),
            name: name.clone(),
            range: *range,
        }),
        Expression::Infix { op, lhs, rhs, range } => Ok(Expression::Infix {
            op: op.clone(),
            lhs: Box::new(fold_expression(lhs)?),
            rhs: Box::new(fold_expression(rhs)?),
            range: *range,
        }),
        other => Ok(other.clone()),
    }
}

fn fold_sequence(elements: &[Expression]) -> Result<Expression, FoldError> {
    if elements.is_empty() || elements.len() % 2 == 0 {
        return Err(FoldError::MalformedSequence);
    }
    let mut pos = 0usize;
    let folded = fold_binary(elements, &mut pos, 0)?;
    if pos != elements.len() {
        return Err(FoldError::MalformedSequence);
    }
    Ok(folded)
}

fn fold_binary(
    elements: &[Expression],
    pos: &mut usize,
    min_prec: u8,
) -> Result<Expression, FoldError> {
    let mut lhs = match elements.get(*pos) {
        Some(Expression::OperatorRef { .. }) | None => return Err(FoldError::MalformedSequence),
        Some(operand) => fold_expression(operand)?,
    };
    *pos += 1;
    while let Some(Expression::OperatorRef { text, .. }) = elements.get(*pos) {
        let (prec, right_assoc) =
            precedence(text).ok_or_else(|| FoldError::UnknownOperator(text.clone()))?;
        if prec < min_prec {
            break;
        }
        let op = text.clone();
        *pos += 1;
        let next_min = if right_assoc { prec } else { prec + 1 };
        let rhs = fold_binary(elements, pos, next_min)?;
        let range = lhs.range().merge(rhs.range());
        lhs = Expression::Infix { op, lhs: Box::new(lhs), rhs: Box::new(rhs), range };
    }
    Ok(lhs)
}

// ─── Name tables ─────────────────────────────────────────────────────────────

/// Free-function intrinsics the compiler resolves without the dynamic
/// fallback. `Int`/`Double`/`Bool`/`State` are construction-shaped and are
/// emitted as `call_init`.
fn intrinsic_call(name: &str) -> Option<(&'static str, bool)> {
    Some(match name {
        "print" => ("print", false),
        "Int" => ("Int.init", true),
        "Double" => ("Double.init", true),
        "Bool" => ("Bool.init", true),
        "State" => ("State.init", true),
        "Text" => ("Text", false),
        "Button" => ("Button", false),
        "VStack" => ("VStack", false),
        "HStack" => ("HStack", false),
        "Spacer" => ("Spacer", false),
        "Image" => ("Image", false),
        "TextField" => ("TextField", false),
        "Toggle" => ("Toggle", false),
        _ => return None,
    })
}

/// Method names with a fixed bridge symbol. Anything else dispatches
/// through `dynamic.method.<name>`.
fn method_symbol(name: &str) -> Option<&'static str> {
    Some(match name {
        "uppercased" => "String.uppercased",
        "lowercased" => "String.lowercased",
        "contains" => "String.contains",
        "get" => "State.get",
        "set" => "State.set",
        "padding" => "padding",
        "font" => "font",
        "foregroundStyle" => "foregroundStyle",
        "frame" => "frame",
        "background" => "background",
        "onTap" => "onTap",
        "onAppear" => "onAppear",
        "onChange" => "onChange",
        _ if name.starts_with("bind") => "State.bind",
        _ => return None,
    })
}

/// Static members recognized without a receiver value on the stack.
fn static_member_symbol(base: &str, member: &str) -> Option<&'static str> {
    match (base, member) {
        ("Date", "now") => Some("Date.now"),
        _ => None,
    }
}

// ─── Compiler ────────────────────────────────────────────────────────────────

pub const ENTRY_FUNCTION_NAME: &str = "<entry>";

pub struct Compiler<'a> {
    source: &'a str,
    file_name: &'a str,
    line_index: LineIndex,
    symbols: ProgramSymbolTable,
    pool: ConstantPoolBuilder,
    struct_layouts: Vec<StructLayout>,
    struct_index: HashMap<String, usize>,
    function_ids: HashMap<String, FunctionId>,
    symbol_names: HashMap<SymbolId, String>,
    diagnostics: Vec<Diagnostic>,
}

struct CompiledFunction {
    id: FunctionId,
    name: String,
    parameters: Vec<String>,
    instructions: Vec<crate::bytecode::Instruction>,
    spans: HashMap<usize, Span>,
    local_count: usize,
    is_entry: bool,
}

impl<'a> Compiler<'a> {
    /// Compile one source text. Parse and lowering failures yield a null
    /// program plus diagnostics; warnings ride along with success.
    pub fn compile(source: &'a str, file_name: &'a str) -> (Option<Program>, Vec<Diagnostic>) {
        let items = match parser::parse_source(source, file_name) {
            Ok(items) => items,
            Err(err) => return (None, vec![parse_diagnostic(&err)]),
        };
        let mut compiler = Compiler {
            source,
            file_name,
            line_index: LineIndex::new(source),
            symbols: ProgramSymbolTable::new(),
            pool: ConstantPoolBuilder::new(),
            struct_layouts: Vec::new(),
            struct_index: HashMap::new(),
            function_ids: HashMap::new(),
            symbol_names: HashMap::new(),
            diagnostics: Vec::new(),
        };
        match compiler.lower(items) {
            Ok(program) => (Some(program), compiler.diagnostics),
            Err(err) => {
                let span = err.range().map(|r| compiler.span(r));
                compiler.diagnostics.push(Diagnostic::error(err.to_string(), span));
                (None, compiler.diagnostics)
            }
        }
    }

    fn span(&self, range: SourceRange) -> Span {
        self.line_index.span(range.start, range.end)
    }

    fn lower(&mut self, items: Vec<Item>) -> Result<Program, CompileError> {
        let mut structs: Vec<StructDecl> = Vec::new();
        let mut functions: Vec<FunctionDecl> = Vec::new();
        let mut top_level: Vec<Statement> = Vec::new();
        for item in items {
            match item {
                Item::Struct(decl) => structs.push(decl),
                Item::Function(decl) => functions.push(decl),
                Item::Statement(stmt) => top_level.push(stmt),
            }
        }

        for decl in &structs {
            self.register_struct(decl);
        }
        for decl in &functions {
            let id = self.symbols.function(&decl.name);
            self.function_ids.insert(decl.name.clone(), id);
        }
        debug!(
            structs = structs.len(),
            functions = functions.len(),
            statements = top_level.len(),
            "lowering program"
        );

        let mut compiled = Vec::with_capacity(functions.len() + 1);
        compiled.push(self.compile_function(ENTRY_FUNCTION_NAME, &[], &top_level, true)?);
        for decl in &functions {
            compiled.push(self.compile_function(&decl.name, &decl.params, &decl.body, false)?);
        }

        self.assemble(compiled)
    }

    fn register_struct(&mut self, decl: &StructDecl) {
        let type_id = self.symbols.type_of(&decl.name);
        let fields = decl
            .fields
            .iter()
            .map(|f| FieldLayout {
                id: self.symbols.field(&format!("{}.{}", decl.name, f.name)),
                name: f.name.clone(),
                type_hint: f.type_hint.clone(),
            })
            .collect();
        let layout = StructLayout { type_id, name: decl.name.clone(), fields };
        self.struct_index.insert(decl.name.clone(), self.struct_layouts.len());
        self.struct_layouts.push(layout);
    }

    fn compile_function(
        &mut self,
        name: &str,
        params: &[String],
        body: &[Statement],
        is_entry: bool,
    ) -> Result<CompiledFunction, CompileError> {
        let id = self.symbols.function(name);
        let mut func = FunctionCompiler {
            ctx: self,
            builder: InstructionBuilder::new(),
            scopes: vec![HashMap::new()],
            next_local: 0,
        };
        for param in params {
            func.declare_local(param, None);
        }
        for stmt in body {
            func.compile_statement(stmt)?;
        }
        // Implicit return so every function yields a value.
        func.builder.set_span(None);
        let none_idx = func.ctx.pool.intern(Constant::None);
        func.builder.emit(OpCode::PushConst, vec![none_idx as i64]);
        func.builder.emit(OpCode::ReturnValue, vec![]);

        let local_count = func.next_local;
        let (instructions, spans) = func.builder.finish()?;
        Ok(CompiledFunction {
            id,
            name: name.to_string(),
            parameters: params.to_vec(),
            instructions,
            spans,
            local_count,
            is_entry,
        })
    }

    /// Merge function blocks, rebasing jump targets, then assemble the byte
    /// stream. The decoded form of that stream is what the VM executes.
    fn assemble(&mut self, compiled: Vec<CompiledFunction>) -> Result<Program, CompileError> {
        let mut merged = Vec::new();
        let mut spans = BTreeMap::new();
        let mut functions = Vec::with_capacity(compiled.len());
        let mut signatures = HashMap::new();
        for func in compiled {
            let base = merged.len();
            for mut inst in func.instructions {
                if matches!(
                    inst.opcode,
                    OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue
                ) {
                    inst.operands[0] += base as i64;
                }
                merged.push(inst);
            }
            for (idx, span) in func.spans {
                spans.insert(base + idx, span);
            }
            functions.push(FunctionMeta {
                id: func.id,
                name: func.name.clone(),
                entry: base,
                arity: func.parameters.len(),
                local_count: func.local_count,
                is_entry: func.is_entry,
            });
            signatures.insert(
                func.id,
                FunctionSignature { name: func.name, parameters: func.parameters },
            );
        }

        let code = Program::encode(&merged);
        let instructions = Program::decode(&code)?;
        debug!(
            bytes = code.len(),
            instructions = instructions.len(),
            constants = self.pool.len(),
            "assembled program"
        );
        Ok(Program {
            code,
            instructions,
            constants: std::mem::take(&mut self.pool).into_constants(),
            functions,
            struct_layouts: std::mem::take(&mut self.struct_layouts),
            function_signatures: signatures,
            spans,
            symbol_names: std::mem::take(&mut self.symbol_names),
        })
    }
}

fn parse_diagnostic(err: &ParseError) -> Diagnostic {
    Diagnostic::error(err.to_string(), None)
}

// ─── Per-function lowering ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct LocalBinding {
    slot: usize,
    /// Struct name inferred from the initializer or declaration, feeding
    /// member-access field resolution.
    struct_hint: Option<String>,
}

struct FunctionCompiler<'c, 'a> {
    ctx: &'c mut Compiler<'a>,
    builder: InstructionBuilder,
    /// Innermost scope last. Slot numbering is monotonic per function, so
    /// shadowed names keep distinct slots.
    scopes: Vec<HashMap<String, LocalBinding>>,
    next_local: usize,
}

impl<'c, 'a> FunctionCompiler<'c, 'a> {
    fn declare_local(&mut self, name: &str, struct_hint: Option<String>) -> usize {
        let slot = self.next_local;
        self.next_local += 1;
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name.to_string(), LocalBinding { slot, struct_hint });
        slot
    }

    fn resolve_local(&self, name: &str) -> Option<LocalBinding> {
        for scope in self.scopes.iter().rev() {
            if let Some(binding) = scope.get(name) {
                return Some(binding.clone());
            }
        }
        None
    }

    fn set_local_hint(&mut self, name: &str, hint: Option<String>) {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(binding) = scope.get_mut(name) {
                binding.struct_hint = hint;
                return;
            }
        }
    }

    fn stamp(&mut self, range: SourceRange) {
        let span = self.ctx.span(range);
        self.builder.set_span(Some(span));
    }

    /// Fold with a warning on failure; the raw tree is still lowered.
    fn fold_or_raw(&mut self, expr: &Expression) -> Expression {
        match fold_expression(expr) {
            Ok(folded) => folded,
            Err(err) => {
                let span = self.ctx.span(expr.range());
                self.ctx.diagnostics.push(Diagnostic::warning(
                    format!("operator folding failed ({}), lowering in source order", err),
                    Some(span),
                ));
                expr.clone()
            }
        }
    }

    // ─── Statements ──────────────────────────────────────────────────────────

    fn compile_block(&mut self, statements: &[Statement]) -> Result<(), CompileError> {
        self.scopes.push(HashMap::new());
        let result = statements.iter().try_for_each(|s| self.compile_statement(s));
        self.scopes.pop();
        result
    }

    fn compile_statement(&mut self, stmt: &Statement) -> Result<(), CompileError> {
        self.stamp(stmt.range());
        match stmt {
            Statement::Let { name, type_hint, value, .. } => {
                let value = self.fold_or_raw(value);
                self.compile_expression(&value)?;
                let hint = self.construction_hint(&value).or_else(|| {
                    type_hint
                        .as_ref()
                        .filter(|t| self.ctx.struct_index.contains_key(*t))
                        .cloned()
                });
                let slot = self.declare_local(name, hint);
                self.stamp(stmt.range());
                self.builder.emit(OpCode::StoreLocal, vec![slot as i64]);
                Ok(())
            }
            Statement::Return { value, .. } => {
                match value {
                    Some(expr) => {
                        let expr = self.fold_or_raw(expr);
                        self.compile_expression(&expr)?;
                    }
                    None => {
                        let idx = self.ctx.pool.intern(Constant::None);
                        self.builder.emit(OpCode::PushConst, vec![idx as i64]);
                    }
                }
                self.stamp(stmt.range());
                self.builder.emit(OpCode::ReturnValue, vec![]);
                Ok(())
            }
            Statement::If { condition, then_block, else_block, .. } => {
                self.compile_condition(condition)?;
                let else_label = self.builder.create_label();
                let end_label = self.builder.create_label();
                self.builder.emit_jump_if_false(else_label);
                self.compile_block(then_block)?;
                self.builder.emit_jump(end_label);
                self.builder.mark(else_label);
                if let Some(else_block) = else_block {
                    self.compile_block(else_block)?;
                }
                self.builder.mark(end_label);
                Ok(())
            }
            Statement::While { condition, body, .. } => {
                let loop_start = self.builder.create_label();
                let loop_end = self.builder.create_label();
                self.builder.mark(loop_start);
                self.compile_condition(condition)?;
                self.builder.emit_jump_if_false(loop_end);
                self.compile_block(body)?;
                self.builder.emit_jump(loop_start);
                self.builder.mark(loop_end);
                Ok(())
            }
            Statement::Expression { expr, range } => {
                self.compile_expression_statement(expr, *range)
            }
        }
    }

    /// A struct name when the expression is a construction call for a
    /// registered struct.
    fn construction_hint(&self, expr: &Expression) -> Option<String> {
        let name = expr.callee_name()?;
        self.ctx.struct_index.contains_key(name).then(|| name.to_string())
    }

    fn compile_condition(&mut self, condition: &Expression) -> Result<(), CompileError> {
        let folded = self.fold_or_raw(condition);
        if is_assignment_shape(&folded) {
            return Err(CompileError::UnsupportedCondition { range: condition.range() });
        }
        self.compile_expression(&folded)
    }

    /// Assignment is detected in three shapes so it works regardless of how
    /// the surface tree carries `=`: a folded infix, a flat three-element
    /// sequence, and a textual fallback that re-parses both sides of the
    /// first non-compound `=`.
    fn compile_expression_statement(
        &mut self,
        expr: &Expression,
        range: SourceRange,
    ) -> Result<(), CompileError> {
        let folded = self.fold_or_raw(expr);

        if let Expression::Infix { op, lhs, rhs, .. } = &folded {
            if op == "=" {
                let leaves_value = self.compile_assignment(lhs, rhs, range)?;
                if leaves_value {
                    self.builder.emit(OpCode::Pop, vec![]);
                }
                return Ok(());
            }
        }
        if let Expression::Sequence { elements, .. } = &folded {
            if elements.len() == 3 && is_operator(&elements[1], "=") {
                let leaves_value = self.compile_assignment(&elements[0], &elements[2], range)?;
                if leaves_value {
                    self.builder.emit(OpCode::Pop, vec![]);
                }
                return Ok(());
            }
            if elements.iter().any(|e| is_operator(e, "=")) {
                let leaves_value = self.compile_assignment_textual(range)?;
                if leaves_value {
                    self.builder.emit(OpCode::Pop, vec![]);
                }
                return Ok(());
            }
        }

        self.compile_expression(&folded)?;
        self.builder.emit(OpCode::Pop, vec![]);
        Ok(())
    }

    /// Returns whether the lowering left the assigned value on the stack
    /// (true for local targets, which `dup` before storing).
    fn compile_assignment(
        &mut self,
        target: &Expression,
        rhs: &Expression,
        stmt_range: SourceRange,
    ) -> Result<bool, CompileError> {
        match target {
            Expression::Identifier { name, range } => {
                let binding = self.resolve_local(name).ok_or_else(|| {
                    CompileError::UnknownIdentifier { name: name.clone(), range: *range }
                })?;
                self.compile_expression(rhs)?;
                if let Some(hint) = self.construction_hint(rhs) {
                    self.set_local_hint(name, Some(hint));
                }
                self.stamp(stmt_range);
                self.builder.emit(OpCode::Dup, vec![]);
                self.builder.emit(OpCode::StoreLocal, vec![binding.slot as i64]);
                Ok(true)
            }
            Expression::Member { base, name: field_name, range } => {
                let Expression::Identifier { name: base_name, range: base_range } = base.as_ref()
                else {
                    return Err(CompileError::UnsupportedAssignmentTarget { range: *range });
                };
                let binding = self.resolve_local(base_name).ok_or_else(|| {
                    CompileError::UnknownIdentifier {
                        name: base_name.clone(),
                        range: *base_range,
                    }
                })?;
                let field_id = self.field_id_for(&binding, field_name);
                self.stamp(stmt_range);
                self.builder.emit(OpCode::LoadLocal, vec![binding.slot as i64]);
                self.compile_expression(rhs)?;
                self.stamp(stmt_range);
                self.builder.emit(OpCode::SetField, vec![i64::from(field_id.raw())]);
                self.builder.emit(OpCode::StoreLocal, vec![binding.slot as i64]);
                Ok(false)
            }
            other => Err(CompileError::UnsupportedAssignmentTarget { range: other.range() }),
        }
    }

    /// Shape (c): slice the statement's source, split at the first `=` that
    /// is not part of `==`/`<=`/`>=`/`!=`, and re-parse both sides.
    fn compile_assignment_textual(&mut self, range: SourceRange) -> Result<bool, CompileError> {
        let text = self
            .ctx
            .source
            .get(range.start as usize..range.end as usize)
            .unwrap_or("");
        let eq =
            find_plain_assign(text).ok_or(CompileError::UnsupportedAssignmentTarget { range })?;
        let lhs_text = text[..eq].trim();
        let rhs_text = text[eq + 1..].trim();
        let lhs = parser::parse_expression_source(lhs_text, self.ctx.file_name)
            .map_err(|_| CompileError::UnsupportedAssignmentTarget { range })?;
        let rhs = parser::parse_expression_source(rhs_text, self.ctx.file_name)
            .map_err(|_| CompileError::UnsupportedAssignmentTarget { range })?;
        // Fragment offsets are meaningless against the real source, so the
        // statement range stands in for both sides.
        let lhs = rebase_range(lhs, range);
        let rhs = rebase_range(fold_expression(&rhs).unwrap_or(rhs), range);
        self.compile_assignment(&lhs, &rhs, range)
    }

    fn field_id_for(&mut self, binding: &LocalBinding, field_name: &str) -> FieldId {
        match binding.struct_hint.as_deref() {
            Some(struct_name) if self.ctx.struct_index.contains_key(struct_name) => {
                self.ctx.symbols.field(&format!("{}.{}", struct_name, field_name))
            }
            _ => self.ctx.symbols.field(&format!("*.{}", field_name)),
        }
    }

    // ─── Expressions ─────────────────────────────────────────────────────────

    fn compile_expression(&mut self, expr: &Expression) -> Result<(), CompileError> {
        self.stamp(expr.range());
        match expr {
            Expression::IntLit { value, .. } => {
                let idx = self.ctx.pool.intern(Constant::Int(*value));
                self.builder.emit(OpCode::PushConst, vec![idx as i64]);
                Ok(())
            }
            Expression::FloatLit { value, .. } => {
                let idx = self.ctx.pool.intern(Constant::Float(*value));
                self.builder.emit(OpCode::PushConst, vec![idx as i64]);
                Ok(())
            }
            Expression::BoolLit { value, .. } => {
                let idx = self.ctx.pool.intern(Constant::Bool(*value));
                self.builder.emit(OpCode::PushConst, vec![idx as i64]);
                Ok(())
            }
            Expression::StrLit { value, .. } => {
                let idx = self.ctx.pool.intern(Constant::Str(value.clone()));
                self.builder.emit(OpCode::PushConst, vec![idx as i64]);
                Ok(())
            }
            Expression::NilLit { .. } => {
                let idx = self.ctx.pool.intern(Constant::None);
                self.builder.emit(OpCode::PushConst, vec![idx as i64]);
                Ok(())
            }
            Expression::Identifier { name, range } => {
                let binding = self.resolve_local(name).ok_or_else(|| {
                    CompileError::UnknownIdentifier { name: name.clone(), range: *range }
                })?;
                self.builder.emit(OpCode::LoadLocal, vec![binding.slot as i64]);
                Ok(())
            }
            Expression::OperatorRef { text, range } => Err(CompileError::UnsupportedExpression {
                what: format!("stray operator '{}'", text),
                range: *range,
            }),
            Expression::Sequence { elements, range } => {
                match fold_sequence(elements) {
                    Ok(folded) => self.compile_expression(&folded),
                    // Fold already failed once at the statement level; keep
                    // source order, applying each operator pairwise.
                    Err(_) => self.compile_raw_sequence(elements, *range),
                }
            }
            Expression::Infix { op, lhs, rhs, range } => {
                if op == "=" {
                    return Err(CompileError::UnsupportedExpression {
                        what: "assignment in expression position".to_string(),
                        range: *range,
                    });
                }
                self.compile_expression(lhs)?;
                self.compile_expression(rhs)?;
                self.stamp(*range);
                self.emit_operator(op, 2);
                Ok(())
            }
            Expression::Prefix { op, operand, range } => {
                self.compile_expression(operand)?;
                self.stamp(*range);
                self.emit_operator(op, 1);
                Ok(())
            }
            Expression::Call { .. } => self.compile_call(expr),
            Expression::Member { .. } => self.compile_member(expr),
        }
    }

    fn compile_raw_sequence(
        &mut self,
        elements: &[Expression],
        range: SourceRange,
    ) -> Result<(), CompileError> {
        let mut iter = elements.iter();
        let first = iter.next().ok_or(CompileError::UnsupportedExpression {
            what: "empty expression sequence".to_string(),
            range,
        })?;
        self.compile_expression(first)?;
        while let Some(op_el) = iter.next() {
            let Expression::OperatorRef { text, range: op_range } = op_el else {
                return Err(CompileError::UnsupportedExpression {
                    what: "operand where an operator was expected".to_string(),
                    range: op_el.range(),
                });
            };
            if text == "=" {
                return Err(CompileError::UnsupportedAssignmentTarget { range: *op_range });
            }
            let rhs = iter.next().ok_or(CompileError::UnsupportedExpression {
                what: "trailing operator".to_string(),
                range: *op_range,
            })?;
            self.compile_expression(rhs)?;
            self.stamp(range);
            self.emit_operator(text, 2);
        }
        Ok(())
    }

    fn emit_operator(&mut self, text: &str, argc: usize) {
        let symbol = self.ctx.symbols.operator(text);
        self.ctx.symbol_names.insert(symbol, text.to_string());
        self.builder
            .emit(OpCode::CallBridge, vec![i64::from(symbol.raw()), argc as i64, 0]);
    }

    fn emit_bridge_call(&mut self, name: &str, argc: usize, has_receiver: bool, init: bool) {
        let symbol = self.ctx.symbols.bridge(name);
        self.ctx.symbol_names.insert(symbol, name.to_string());
        let opcode = if init { OpCode::CallInit } else { OpCode::CallBridge };
        self.builder.emit(
            opcode,
            vec![i64::from(symbol.raw()), argc as i64, i64::from(has_receiver)],
        );
    }

    /// Free calls dispatch in priority order: user function, struct
    /// construction, fixed intrinsic table, then the dynamic bridge
    /// namespace. Method calls always go to the bridge with a receiver.
    fn compile_call(&mut self, expr: &Expression) -> Result<(), CompileError> {
        let Expression::Call { callee, args, range } = expr else { unreachable!() };
        match callee.as_ref() {
            Expression::Identifier { name, .. } => {
                if let Some(function_id) = self.ctx.function_ids.get(name).copied() {
                    for arg in args {
                        self.compile_expression(arg)?;
                    }
                    self.stamp(*range);
                    self.builder.emit(
                        OpCode::CallUser,
                        vec![i64::from(function_id.raw()), args.len() as i64],
                    );
                    return Ok(());
                }
                if let Some(struct_pos) = self.ctx.struct_index.get(name).copied() {
                    return self.compile_construction(struct_pos, args, *range);
                }
                let (bridge_name, is_init) = match intrinsic_call(name) {
                    Some((bridge_name, is_init)) => (bridge_name.to_string(), is_init),
                    None => (format!("dynamic.{}", name), false),
                };
                for arg in args {
                    self.compile_expression(arg)?;
                }
                self.stamp(*range);
                self.emit_bridge_call(&bridge_name, args.len(), false, is_init);
                Ok(())
            }
            Expression::Member { base, name: method, .. } => {
                let bridge_name = match method_symbol(method) {
                    Some(fixed) => fixed.to_string(),
                    None => format!("dynamic.method.{}", method),
                };
                self.compile_expression(base)?;
                for arg in args {
                    self.compile_expression(arg)?;
                }
                self.stamp(*range);
                self.emit_bridge_call(&bridge_name, args.len(), true, false);
                Ok(())
            }
            other => Err(CompileError::UnsupportedExpression {
                what: "call of a non-name expression".to_string(),
                range: other.range(),
            }),
        }
    }

    /// Positional construction: the first `min(args, fields)` arguments are
    /// used, extra arguments are ignored, and missing fields stay unset.
    fn compile_construction(
        &mut self,
        struct_pos: usize,
        args: &[Expression],
        range: SourceRange,
    ) -> Result<(), CompileError> {
        let (type_id, field_ids): (_, Vec<FieldId>) = {
            let layout = &self.ctx.struct_layouts[struct_pos];
            (layout.type_id, layout.fields.iter().map(|f| f.id).collect())
        };
        let used = args.len().min(field_ids.len());
        for arg in &args[..used] {
            self.compile_expression(arg)?;
        }
        self.stamp(range);
        let mut operands = vec![i64::from(type_id.raw()), used as i64];
        operands.extend(field_ids[..used].iter().map(|f| i64::from(f.raw())));
        self.builder.emit(OpCode::MakeStruct, operands);
        Ok(())
    }

    /// Bare member access: struct field load when the base is a local,
    /// a recognized static member, or a receiver-carrying dynamic lookup.
    fn compile_member(&mut self, expr: &Expression) -> Result<(), CompileError> {
        let Expression::Member { base, name, range } = expr else { unreachable!() };
        if let Expression::Identifier { name: base_name, range: base_range } = base.as_ref() {
            if let Some(binding) = self.resolve_local(base_name) {
                let field_id = self.field_id_for(&binding, name);
                self.builder.emit(OpCode::LoadLocal, vec![binding.slot as i64]);
                self.stamp(*range);
                self.builder.emit(OpCode::GetField, vec![i64::from(field_id.raw())]);
                return Ok(());
            }
            if let Some(symbol_name) = static_member_symbol(base_name, name) {
                self.stamp(*range);
                self.emit_bridge_call(symbol_name, 0, false, false);
                return Ok(());
            }
            return Err(CompileError::UnknownIdentifier {
                name: base_name.clone(),
                range: *base_range,
            });
        }
        self.compile_expression(base)?;
        self.stamp(*range);
        self.emit_bridge_call(&format!("dynamic.member.{}", name), 0, true, false);
        Ok(())
    }
}

fn is_operator(expr: &Expression, text: &str) -> bool {
    matches!(expr, Expression::OperatorRef { text: t, .. } if t == text)
}

fn is_assignment_shape(expr: &Expression) -> bool {
    match expr {
        Expression::Infix { op, .. } => op == "=",
        Expression::Sequence { elements, .. } => elements.iter().any(|e| is_operator(e, "=")),
        _ => false,
    }
}

/// Find the byte index of the first `=` that is not part of a compound
/// operator, skipping string literals.
fn find_plain_assign(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut in_string = false;
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            match b {
                b'\\' => i += 1,
                b'"' => in_string = false,
                _ => {}
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'=' => {
                    let prev = i.checked_sub(1).map(|p| bytes[p]);
                    let next = bytes.get(i + 1).copied();
                    let compound = matches!(prev, Some(b'=') | Some(b'<') | Some(b'>') | Some(b'!'))
                        || next == Some(b'=');
                    if !compound {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Replace every range in a re-parsed fragment with the enclosing
/// statement's range so diagnostics still point at real source.
fn rebase_range(expr: Expression, range: SourceRange) -> Expression {
    match expr {
        Expression::IntLit { value, .. } => Expression::IntLit { value, range },
        Expression::FloatLit { value, .. } => Expression::FloatLit { value, range },
        Expression::BoolLit { value, .. } => Expression::BoolLit { value, range },
        Expression::StrLit { value, .. } => Expression::StrLit { value, range },
        Expression::NilLit { .. } => Expression::NilLit { range },
        Expression::Identifier { name, .. } => Expression::Identifier { name, range },
        Expression::OperatorRef { text, .. } => Expression::OperatorRef { text, range },
        Expression::Sequence { elements, .. } => Expression::Sequence {
            elements: elements.into_iter().map(|e| rebase_range(e, range)).collect(),
            range,
        },
        Expression::Infix { op, lhs, rhs, .. } => Expression::Infix {
            op,
            lhs: Box::new(rebase_range(*lhs, range)),
            rhs: Box::new(rebase_range(*rhs, range)),
            range,
        },
        Expression::Prefix { op, operand, .. } => Expression::Prefix {
            op,
            operand: Box::new(rebase_range(*operand, range)),
            range,
        },
        Expression::Call { callee, args, .. } => Expression::Call {
            callee: Box::new(rebase_range(*callee, range)),
            args: args.into_iter().map(|a| rebase_range(a, range)).collect(),
            range,
        },
        Expression::Member { base, name, .. } => Expression::Member {
            base: Box::new(rebase_range(*base, range)),
            name,
            range,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression_source;
    use crate::symbols::TypeId;

    fn compile_ok(source: &str) -> Program {
        let (program, diagnostics) = Compiler::compile(source, "test.vibe");
        let errors: Vec<_> = diagnostics.iter().filter(|d| d.is_error()).collect();
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        program.expect("program should compile")
    }

    fn compile_err(source: &str) -> Vec<Diagnostic> {
        let (program, diagnostics) = Compiler::compile(source, "test.vibe");
        assert!(program.is_none(), "expected compilation to fail");
        diagnostics
    }

    fn opcodes(program: &Program) -> Vec<OpCode> {
        program.instructions.iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn test_fold_respects_precedence() {
        let expr = parse_expression_source("2 + 3 * 4", "t").unwrap();
        let folded = fold_expression(&expr).unwrap();
        let Expression::Infix { op, rhs, .. } = folded else { panic!("expected infix") };
        assert_eq!(op, "+");
        assert!(matches!(rhs.as_ref(), Expression::Infix { op, .. } if op == "*"));
    }

    #[test]
    fn test_fold_assignment_binds_loosest() {
        let expr = parse_expression_source("x = a + b", "t").unwrap();
        let folded = fold_expression(&expr).unwrap();
        let Expression::Infix { op, rhs, .. } = folded else { panic!("expected infix") };
        assert_eq!(op, "=");
        assert!(matches!(rhs.as_ref(), Expression::Infix { op, .. } if op == "+"));
    }

    #[test]
    fn test_fold_logical_precedence() {
        let expr = parse_expression_source("a && b || c", "t").unwrap();
        let folded = fold_expression(&expr).unwrap();
        // `||` binds looser than `&&`, so the top is `||`.
        assert!(matches!(folded, Expression::Infix { ref op, .. } if op == "||"));
    }

    #[test]
    fn test_empty_source_compiles_to_implicit_return() {
        let program = compile_ok("");
        assert_eq!(opcodes(&program), vec![OpCode::PushConst, OpCode::ReturnValue]);
        let entry = program.entry_function().unwrap();
        assert!(entry.is_entry);
        assert_eq!(entry.arity, 0);
    }

    #[test]
    fn test_let_allocates_locals_in_order() {
        let program = compile_ok("let x = 2\nlet y = 3");
        let stores: Vec<_> = program
            .instructions
            .iter()
            .filter(|i| i.opcode == OpCode::StoreLocal)
            .map(|i| i.operands[0])
            .collect();
        assert_eq!(stores, vec![0, 1]);
        assert_eq!(program.entry_function().unwrap().local_count, 2);
    }

    #[test]
    fn test_operator_lowering_emits_bridge_call() {
        let program = compile_ok("let x = 1\nlet y = 2\nlet z = x + y");
        let plus = SymbolId::operator("+");
        assert!(program
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::CallBridge && i.operands[0] == i64::from(plus.raw())));
        assert_eq!(program.symbol_name(plus), "+");
    }

    #[test]
    fn test_unknown_identifier_fails_with_span() {
        let diagnostics = compile_err("let x = missing");
        assert!(diagnostics[0].message.contains("missing"));
        assert!(diagnostics[0].span.is_some());
    }

    #[test]
    fn test_user_function_call_dispatch() {
        let program = compile_ok("func add(a, b) { return a + b }\nreturn add(4, 9)");
        let add_id = FunctionId::of("add");
        assert!(program
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::CallUser && i.operands[0] == i64::from(add_id.raw())));
        assert_eq!(program.functions.len(), 2);
        let add_meta = program.function_by_id(add_id).unwrap();
        assert_eq!(add_meta.arity, 2);
        assert!(!add_meta.is_entry);
    }

    #[test]
    fn test_struct_construction_dispatch() {
        let program = compile_ok("struct Point { var x; var y }\nvar p = Point(2, 3)");
        let make = program
            .instructions
            .iter()
            .find(|i| i.opcode == OpCode::MakeStruct)
            .expect("expected make_struct");
        assert_eq!(make.operands[0], i64::from(TypeId::of("Point").raw()));
        assert_eq!(make.operands[1], 2);
        assert_eq!(make.operands[2], i64::from(FieldId::of("Point.x").raw()));
        assert_eq!(make.operands[3], i64::from(FieldId::of("Point.y").raw()));
    }

    #[test]
    fn test_construction_ignores_extra_args() {
        let program = compile_ok("struct P { var x }\nvar p = P(1, 2, 3)");
        let make = program
            .instructions
            .iter()
            .find(|i| i.opcode == OpCode::MakeStruct)
            .unwrap();
        assert_eq!(make.operands[1], 1);
        // The ignored arguments are never compiled: one push for the used
        // argument plus the implicit return's none.
        let pushes = program
            .instructions
            .iter()
            .filter(|i| i.opcode == OpCode::PushConst)
            .count();
        assert_eq!(pushes, 2);
    }

    #[test]
    fn test_member_access_uses_type_hint() {
        let program =
            compile_ok("struct Point { var x; var y }\nvar p = Point(2, 3)\nreturn p.x");
        let get = program
            .instructions
            .iter()
            .find(|i| i.opcode == OpCode::GetField)
            .unwrap();
        assert_eq!(get.operands[0], i64::from(FieldId::of("Point.x").raw()));
    }

    #[test]
    fn test_member_access_without_hint_uses_wildcard() {
        let program = compile_ok("func f(p) { return p.x }");
        let get = program
            .instructions
            .iter()
            .find(|i| i.opcode == OpCode::GetField)
            .unwrap();
        assert_eq!(get.operands[0], i64::from(FieldId::of("*.x").raw()));
    }

    #[test]
    fn test_member_assignment_lowering() {
        let program =
            compile_ok("struct Point { var x; var y }\nvar p = Point(2, 3)\np.x = 9");
        let set_idx = program
            .instructions
            .iter()
            .position(|i| i.opcode == OpCode::SetField)
            .expect("expected set_field");
        // load_local base ... set_field ... store_local base.
        assert_eq!(program.instructions[set_idx + 1].opcode, OpCode::StoreLocal);
        let set = &program.instructions[set_idx];
        assert_eq!(set.operands[0], i64::from(FieldId::of("Point.x").raw()));
    }

    #[test]
    fn test_local_assignment_dups_before_store() {
        let program = compile_ok("var i = 0\ni = 4");
        let dup_idx = program
            .instructions
            .iter()
            .position(|i| i.opcode == OpCode::Dup)
            .expect("expected dup");
        assert_eq!(program.instructions[dup_idx + 1].opcode, OpCode::StoreLocal);
        assert_eq!(program.instructions[dup_idx + 2].opcode, OpCode::Pop);
    }

    #[test]
    fn test_assignment_to_unknown_local_fails() {
        let diagnostics = compile_err("q = 3");
        assert!(diagnostics.iter().any(|d| d.message.contains("q")));
    }

    #[test]
    fn test_assignment_in_condition_rejected() {
        let diagnostics = compile_err("var x = 1\nif x = 2 { }");
        assert!(diagnostics.iter().any(|d| d.message.contains("condition")));
    }

    #[test]
    fn test_if_else_jump_structure() {
        let program = compile_ok("var x = 1\nif x > 0 { x = 2 } else { x = 3 }");
        let ops = opcodes(&program);
        assert!(ops.contains(&OpCode::JumpIfFalse));
        assert!(ops.contains(&OpCode::Jump));
        // Every jump target lands inside the instruction list.
        for inst in &program.instructions {
            if matches!(inst.opcode, OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue) {
                let target = inst.operands[0];
                assert!(target >= 0 && (target as usize) <= program.instructions.len());
            }
        }
    }

    #[test]
    fn test_while_jumps_back() {
        let program = compile_ok("var i = 0\nwhile i < 3 { i = i + 1 }");
        let (back_idx, back_jump) = program
            .instructions
            .iter()
            .enumerate()
            .filter(|(_, i)| i.opcode == OpCode::Jump)
            .next_back()
            .unwrap();
        let target = back_jump.operands[0] as usize;
        assert!(target < back_idx);
    }

    #[test]
    fn test_method_call_carries_receiver() {
        let program = compile_ok("let name = \"vibe\"\nprint(name.uppercased())");
        let upper = SymbolId::of("String.uppercased");
        let call = program
            .instructions
            .iter()
            .find(|i| i.opcode == OpCode::CallBridge && i.operands[0] == i64::from(upper.raw()))
            .expect("expected uppercased call");
        assert_eq!(call.operands[1], 0);
        assert_eq!(call.operands[2], 1);
    }

    #[test]
    fn test_unknown_free_call_goes_dynamic() {
        let program = compile_ok("launch(1)");
        let dynamic = SymbolId::of("dynamic.launch");
        assert!(program
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::CallBridge && i.operands[0] == i64::from(dynamic.raw())));
        assert_eq!(program.symbol_name(dynamic), "dynamic.launch");
    }

    #[test]
    fn test_unknown_method_goes_dynamic_namespace() {
        let program = compile_ok("let s = \"x\"\ns.reverse()");
        let dynamic = SymbolId::of("dynamic.method.reverse");
        let call = program
            .instructions
            .iter()
            .find(|i| i.opcode == OpCode::CallBridge && i.operands[0] == i64::from(dynamic.raw()))
            .expect("expected dynamic method call");
        assert_eq!(call.operands[2], 1);
    }

    #[test]
    fn test_int_init_emits_call_init() {
        let program = compile_ok("return Int(\"5\")");
        let sym = SymbolId::of("Int.init");
        assert!(program
            .instructions
            .iter()
            .any(|i| i.opcode == OpCode::CallInit && i.operands[0] == i64::from(sym.raw())));
    }

    #[test]
    fn test_date_now_static_member() {
        let program = compile_ok("return Date.now");
        let sym = SymbolId::of("Date.now");
        let call = program
            .instructions
            .iter()
            .find(|i| i.opcode == OpCode::CallBridge && i.operands[0] == i64::from(sym.raw()))
            .expect("expected Date.now call");
        assert_eq!(call.operands[1], 0);
        assert_eq!(call.operands[2], 0);
    }

    #[test]
    fn test_shadowed_local_resolves_innermost() {
        let program = compile_ok("var x = 1\nif x > 0 { var x = 2\nx = 3 }");
        // Slot 0 is the outer x, slot 1 the inner; the assignment must hit
        // slot 1.
        let stores: Vec<_> = program
            .instructions
            .iter()
            .filter(|i| i.opcode == OpCode::StoreLocal)
            .map(|i| i.operands[0])
            .collect();
        assert_eq!(stores, vec![0, 1, 1]);
        assert_eq!(program.entry_function().unwrap().local_count, 2);
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let source = "struct Point { var x; var y }\nfunc add(a, b) { return a + b }\nvar p = Point(1, 2)\nreturn add(p.x, p.y)";
        let (a, _) = Compiler::compile(source, "test.vibe");
        let (b, _) = Compiler::compile(source, "test.vibe");
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.code, b.code);
        assert_eq!(a.instructions, b.instructions);
        assert_eq!(
            a.functions.iter().map(|f| f.entry).collect::<Vec<_>>(),
            b.functions.iter().map(|f| f.entry).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_span_coverage_is_ordered() {
        let program = compile_ok("let x = 2\nlet y = 3\nreturn x + y");
        assert!(!program.spans.is_empty());
        for span in program.spans.values() {
            assert!(span.end.offset >= span.start.offset);
            assert!(span.end.line >= span.start.line);
        }
    }

    #[test]
    fn test_find_plain_assign_skips_compounds() {
        assert_eq!(find_plain_assign("a == b"), None);
        assert_eq!(find_plain_assign("a <= b"), None);
        assert_eq!(find_plain_assign("a = b == c"), Some(2));
        assert_eq!(find_plain_assign("s = \"x = y\""), Some(2));
        assert_eq!(find_plain_assign("\"a = b\""), None);
    }

    #[test]
    fn test_raw_sequence_lowers_in_source_order() {
        // A sequence the folder rejects (no precedence entry for `?`)
        // still assembles, applying operators left to right.
        let source = "1 + 2 ? 3";
        let mut compiler = Compiler {
            source,
            file_name: "test.vibe",
            line_index: LineIndex::new(source),
            symbols: ProgramSymbolTable::new(),
            pool: ConstantPoolBuilder::new(),
            struct_layouts: Vec::new(),
            struct_index: HashMap::new(),
            function_ids: HashMap::new(),
            symbol_names: HashMap::new(),
            diagnostics: Vec::new(),
        };
        let mut func = FunctionCompiler {
            ctx: &mut compiler,
            builder: InstructionBuilder::new(),
            scopes: vec![HashMap::new()],
            next_local: 0,
        };
        let int = |value: i64, at: u32| Expression::IntLit {
            value,
            range: SourceRange::new(at, at + 1),
        };
        let op = |text: &str, at: u32| Expression::OperatorRef {
            text: text.to_string(),
            range: SourceRange::new(at, at + 1),
        };
        let sequence = Expression::Sequence {
            elements: vec![int(1, 0), op("+", 2), int(2, 4), op("?", 6), int(3, 8)],
            range: SourceRange::new(0, 9),
        };
        assert!(fold_expression(&sequence).is_err());
        func.compile_expression(&sequence).unwrap();
        let (instructions, _) = func.builder.finish().unwrap();
        let ops: Vec<OpCode> = instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(
            ops,
            vec![
                OpCode::PushConst,
                OpCode::PushConst,
                OpCode::CallBridge,
                OpCode::PushConst,
                OpCode::CallBridge,
            ]
        );
        // First the `+`, then the unknown `?`, exactly as written.
        assert_eq!(instructions[2].operands[0], i64::from(SymbolId::operator("+").raw()));
        assert_eq!(instructions[4].operands[0], i64::from(SymbolId::operator("?").raw()));
    }

    #[test]
    fn test_entry_always_ends_with_return_none() {
        let program = compile_ok("print(1)");
        let len = program.instructions.len();
        assert_eq!(program.instructions[len - 1].opcode, OpCode::ReturnValue);
        assert_eq!(program.instructions[len - 2].opcode, OpCode::PushConst);
    }
}
