/*
 * Copyright (c) 2026 the Vibe Engine developers.
 *
 * This file is part of the Vibe Script Engine.
 *
 * Licensed under the MIT License. See LICENSE for details.
 */

//! Runtime values, the runtime error taxonomy, and the scope-threaded
//! script context.
//!
//! Values are by-value: `set_field` and friends produce new instances
//! rather than mutating shared state. `Native` wraps a host-owned handle
//! behind `Rc<dyn Any>`; the VM never looks inside it.

use crate::symbols::{FieldId, FunctionId, SymbolId, TypeId};
use indexmap::IndexMap;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Reserved dictionary key marking a state handle in the dynamic value
/// space: `{"$state": "<path>"}`.
pub const STATE_TAG: &str = "$state";
/// Reserved dictionary key marking a binding: `{"$binding": "<path>"}`.
pub const BINDING_TAG: &str = "$binding";

// ─── Values ──────────────────────────────────────────────────────────────────

/// An opaque host-owned reference. Equality is handle identity; the `kind`
/// tag exists only for display and cache keys.
#[derive(Clone)]
pub struct NativeValue {
    pub kind: &'static str,
    pub handle: Rc<dyn Any>,
}

impl NativeValue {
    pub fn new(kind: &'static str, handle: Rc<dyn Any>) -> Self {
        NativeValue { kind, handle }
    }

    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }
}

impl fmt::Debug for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Native({})", self.kind)
    }
}

impl PartialEq for NativeValue {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.handle, &other.handle)
    }
}

/// A struct value: a type ID plus field values keyed by field ID. Every
/// field ID present must appear in the layout registered for `type_id`;
/// constructed-but-unset fields are simply absent.
#[derive(Debug, Clone, PartialEq)]
pub struct StructInstance {
    pub type_id: TypeId,
    pub fields: IndexMap<FieldId, Value>,
}

/// The closed runtime value sum.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Array(Vec<Value>),
    Dict(IndexMap<String, Value>),
    Native(NativeValue),
    Struct(StructInstance),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Dict(entries) => !entries.is_empty(),
            Value::Native(_) | Value::Struct(_) => true,
        }
    }

    /// Kind name used in error messages and inline-cache keys.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::Native(_) => "native",
            Value::Struct(_) => "struct",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "none"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Value::Native(native) => write!(f, "<native {}>", native.kind),
            Value::Struct(instance) => write!(f, "<struct {} fields>", instance.fields.len()),
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Everything that can go wrong while executing a program: runtime faults,
/// policy denials, and resource breaches. The VM decorates these with span
/// and stack-trace data before handing them to the host.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    #[error("value stack underflow")]
    StackUnderflow,
    #[error("instruction is missing operand {0}")]
    MissingOperand(usize),
    #[error("invalid local slot {0}")]
    InvalidLocal(usize),
    #[error("invalid constant index {0}")]
    InvalidConstant(usize),
    #[error("unknown function {0}")]
    UnknownFunction(FunctionId),
    #[error("{op} on {type_name}, expected a struct")]
    NotAStruct { op: &'static str, type_name: &'static str },
    #[error("field {0} is not set on this instance")]
    MissingField(FieldId),
    #[error("return with an empty call stack")]
    ReturnWithoutFrame,
    #[error("program has no entry function")]
    NoEntryFunction,
    #[error("make_struct operand list is malformed")]
    MalformedStructOperands,
    #[error("jump target {0} is out of range")]
    InvalidJumpTarget(i64),

    // Bridge and policy failures.
    #[error("bridge symbol {name} is not allowed by the current capabilities")]
    BridgeDenied { symbol: SymbolId, name: String },
    #[error("unknown bridge symbol {name}")]
    UnknownBridge { symbol: SymbolId, name: String },
    #[error("{symbol} expects {expected} argument(s), got {got}")]
    WrongArity { symbol: String, expected: usize, got: usize },
    #[error("{symbol} expected {expected}, got {got}")]
    TypeMismatch { symbol: String, expected: &'static str, got: &'static str },
    #[error("operator {operator} is not supported over {type_name}")]
    UnsupportedOperand { operator: String, type_name: &'static str },
    #[error("division by zero")]
    DivisionByZero,

    // Resource guard breaches.
    #[error("instruction budget of {0} exceeded")]
    InstructionBudgetExceeded(u64),
    #[error("call depth limit of {0} exceeded")]
    CallDepthExceeded(usize),
    #[error("value stack limit of {0} exceeded")]
    ValueStackExceeded(usize),
    #[error("wall clock limit of {0} ms exceeded")]
    TimeLimitExceeded(u128),
}

impl VmError {
    /// The bridge symbol involved in the failure, when there is one.
    pub fn symbol(&self) -> Option<SymbolId> {
        match self {
            VmError::BridgeDenied { symbol, .. } | VmError::UnknownBridge { symbol, .. } => {
                Some(*symbol)
            }
            _ => None,
        }
    }
}

/// Signature of the sink bridge routines print through. Lines arrive in
/// invocation order.
pub type PrintSink<'a> = &'a mut dyn FnMut(String);

// ─── Script context ──────────────────────────────────────────────────────────

/// The scoped state triple a host threads around one `run()`. Bridge
/// routines only ever see the top of the stack.
pub struct ScriptContext {
    pub state_get: Box<dyn Fn(&str) -> Option<Value>>,
    pub state_set: Box<dyn Fn(&str, Value)>,
    pub state_bind: Box<dyn Fn(&str) -> Option<Value>>,
}

impl ScriptContext {
    /// A context that ignores sets and answers every get/bind with `None`.
    pub fn inert() -> Self {
        ScriptContext {
            state_get: Box::new(|_| None),
            state_set: Box::new(|_, _| {}),
            state_bind: Box::new(|_| None),
        }
    }
}

thread_local! {
    static SCRIPT_CONTEXTS: RefCell<Vec<ScriptContext>> = const { RefCell::new(Vec::new()) };
}

/// RAII handle returned by [`push_script_context`]; pops on drop so every
/// exit path releases the context.
pub struct ScriptContextGuard {
    _private: (),
}

impl Drop for ScriptContextGuard {
    fn drop(&mut self) {
        SCRIPT_CONTEXTS.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

pub fn push_script_context(context: ScriptContext) -> ScriptContextGuard {
    SCRIPT_CONTEXTS.with(|stack| stack.borrow_mut().push(context));
    ScriptContextGuard { _private: () }
}

/// Run `f` with the innermost script context, or `None` when the host
/// pushed nothing around this run.
pub fn with_current_script_context<R>(f: impl FnOnce(Option<&ScriptContext>) -> R) -> R {
    SCRIPT_CONTEXTS.with(|stack| {
        let stack = stack.borrow();
        f(stack.last())
    })
}
