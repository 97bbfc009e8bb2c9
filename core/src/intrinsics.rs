/*
 * Copyright (c) 2026 the Vibe Engine developers.
 *
 * This file is part of the Vibe Script Engine.
 *
 * Licensed under the MIT License. See LICENSE for details.
 */

//! Per-symbol bridge implementations: printing, string methods, numeric
//! initializers, `Date.now`, the operator set, the UI node builders with
//! their modifiers and event hooks, and the state handles.
//!
//! Everything here dispatches on the runtime value sum explicitly. UI
//! routines build plain dictionary values shaped like view-tree nodes; the
//! reserved `$state`/`$binding` keys mark host-state references inside that
//! dynamic space.

use crate::runtime::{
    with_current_script_context, NativeValue, PrintSink, Value, VmError, BINDING_TAG, STATE_TAG,
};
use indexmap::IndexMap;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Resolve a catalog name to its implementation and run it. Returns `None`
/// for names without an implementation so the bridge can report an unknown
/// symbol.
pub fn dispatch(
    name: &str,
    receiver: Option<Value>,
    args: Vec<Value>,
    sink: PrintSink,
) -> Option<Result<Value, VmError>> {
    let result = match name {
        "print" => print(args, sink),
        "String.uppercased" => string_uppercased(receiver),
        "String.lowercased" => string_lowercased(receiver),
        "String.contains" => string_contains(receiver, args),
        "Int.init" => int_init(args),
        "Double.init" => double_init(args),
        "Bool.init" => bool_init(args),
        "Date.now" => date_now(args),
        "+" | "-" | "*" | "/" | "%" | "==" | "<" | ">" | "<=" | ">=" | "&&" | "||" | "!" => {
            operator(name, args)
        }
        "Text" => ui_leaf("Text", "text", args),
        "Button" => ui_button(args),
        "VStack" => ui_stack("VStack", args),
        "HStack" => ui_stack("HStack", args),
        "Spacer" => Ok(Value::Dict(ui_node("Spacer"))),
        "Image" => ui_leaf("Image", "name", args),
        "TextField" => ui_text_field(args),
        "Toggle" => ui_toggle(args),
        "padding" => ui_modifier(receiver, "padding", &["value"], args),
        "font" => ui_modifier(receiver, "font", &["style"], args),
        "foregroundStyle" => ui_modifier(receiver, "foregroundStyle", &["style"], args),
        "frame" => ui_modifier(receiver, "frame", &["width", "height"], args),
        "background" => ui_modifier(receiver, "background", &["color"], args),
        "onTap" => ui_event(receiver, "tap", args),
        "onAppear" => ui_event(receiver, "appear", args),
        "onChange" => ui_event(receiver, "change", args),
        "State.init" => state_init(args),
        "State.get" => state_get(receiver),
        "State.set" => state_set(receiver, args),
        "State.bind" => state_bind(receiver),
        _ => return None,
    };
    Some(result)
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn wrong_arity(symbol: &str, expected: usize, got: usize) -> VmError {
    VmError::WrongArity { symbol: symbol.to_string(), expected, got }
}

fn mismatch(symbol: &str, expected: &'static str, got: &Value) -> VmError {
    VmError::TypeMismatch { symbol: symbol.to_string(), expected, got: got.type_name() }
}

fn receiver_string(symbol: &str, receiver: Option<Value>) -> Result<String, VmError> {
    match receiver {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(mismatch(symbol, "string", &other)),
        None => Err(wrong_arity(symbol, 1, 0)),
    }
}

// ─── Foundation ──────────────────────────────────────────────────────────────

fn print(args: Vec<Value>, sink: PrintSink) -> Result<Value, VmError> {
    let line = args.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
    sink(line);
    Ok(Value::None)
}

fn string_uppercased(receiver: Option<Value>) -> Result<Value, VmError> {
    let s = receiver_string("String.uppercased", receiver)?;
    Ok(Value::Str(s.to_uppercase()))
}

fn string_lowercased(receiver: Option<Value>) -> Result<Value, VmError> {
    let s = receiver_string("String.lowercased", receiver)?;
    Ok(Value::Str(s.to_lowercase()))
}

fn string_contains(receiver: Option<Value>, args: Vec<Value>) -> Result<Value, VmError> {
    let s = receiver_string("String.contains", receiver)?;
    if args.len() != 1 {
        return Err(wrong_arity("String.contains", 1, args.len()));
    }
    match &args[0] {
        Value::Str(needle) => Ok(Value::Bool(s.contains(needle.as_str()))),
        other => Err(mismatch("String.contains", "string", other)),
    }
}

/// Coercions follow a fixed per-kind table; strings that fail to parse
/// yield `none` rather than an error, so scripts can probe.
fn int_init(args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() != 1 {
        return Err(wrong_arity("Int.init", 1, args.len()));
    }
    Ok(match &args[0] {
        Value::Int(i) => Value::Int(*i),
        Value::Float(f) => Value::Int(*f as i64),
        Value::Bool(b) => Value::Int(i64::from(*b)),
        Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).unwrap_or(Value::None),
        Value::None => Value::None,
        other => return Err(mismatch("Int.init", "int, float, bool, or string", other)),
    })
}

fn double_init(args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() != 1 {
        return Err(wrong_arity("Double.init", 1, args.len()));
    }
    Ok(match &args[0] {
        Value::Int(i) => Value::Float(*i as f64),
        Value::Float(f) => Value::Float(*f),
        Value::Bool(b) => Value::Float(if *b { 1.0 } else { 0.0 }),
        Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).unwrap_or(Value::None),
        Value::None => Value::None,
        other => return Err(mismatch("Double.init", "int, float, bool, or string", other)),
    })
}

fn bool_init(args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() != 1 {
        return Err(wrong_arity("Bool.init", 1, args.len()));
    }
    Ok(match &args[0] {
        Value::Bool(b) => Value::Bool(*b),
        Value::Int(i) => Value::Bool(*i != 0),
        Value::Float(f) => Value::Bool(*f != 0.0),
        Value::Str(s) => match s.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::None,
        },
        Value::None => Value::None,
        other => return Err(mismatch("Bool.init", "int, float, bool, or string", other)),
    })
}

fn date_now(args: Vec<Value>) -> Result<Value, VmError> {
    if !args.is_empty() {
        return Err(wrong_arity("Date.now", 0, args.len()));
    }
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(Value::Native(NativeValue::new("timestamp", Rc::new(millis))))
}

// ─── Operators ───────────────────────────────────────────────────────────────

/// The full operator set: binary arithmetic with int/float promotion,
/// string concatenation on `+`, comparisons, truthiness logic, and the
/// unary `-`/`!` forms. `native` operands always raise.
fn operator(op: &str, args: Vec<Value>) -> Result<Value, VmError> {
    for arg in &args {
        if matches!(arg, Value::Native(_)) {
            return Err(VmError::UnsupportedOperand { operator: op.to_string(), type_name: "native" });
        }
    }
    match (op, args.len()) {
        ("-", 1) => {
            return match &args[0] {
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(VmError::UnsupportedOperand {
                    operator: "-".to_string(),
                    type_name: other.type_name(),
                }),
            };
        }
        ("!", 1) => return Ok(Value::Bool(!args[0].is_truthy())),
        (_, 2) => {}
        (_, n) => return Err(wrong_arity(op, 2, n)),
    }
    let mut args = args;
    let rhs = args.pop().ok_or(VmError::StackUnderflow)?;
    let lhs = args.pop().ok_or(VmError::StackUnderflow)?;
    match op {
        "+" => add(lhs, rhs),
        "-" | "*" | "/" | "%" => arithmetic(op, lhs, rhs),
        "==" => Ok(Value::Bool(lhs == rhs)),
        "<" | ">" | "<=" | ">=" => compare(op, lhs, rhs),
        "&&" => Ok(Value::Bool(lhs.is_truthy() && rhs.is_truthy())),
        "||" => Ok(Value::Bool(lhs.is_truthy() || rhs.is_truthy())),
        _ => Err(VmError::UnsupportedOperand { operator: op.to_string(), type_name: lhs.type_name() }),
    }
}

fn add(lhs: Value, rhs: Value) -> Result<Value, VmError> {
    Ok(match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(b)),
        (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
        (Value::Int(a), Value::Float(b)) => Value::Float(a as f64 + b),
        (Value::Float(a), Value::Int(b)) => Value::Float(a + b as f64),
        (Value::Str(a), Value::Str(b)) => Value::Str(format!("{}{}", a, b)),
        (Value::Str(a), b) => Value::Str(format!("{}{}", a, b)),
        (a, Value::Str(b)) => Value::Str(format!("{}{}", a, b)),
        (a, _) => {
            return Err(VmError::UnsupportedOperand {
                operator: "+".to_string(),
                type_name: a.type_name(),
            });
        }
    })
}

fn arithmetic(op: &str, lhs: Value, rhs: Value) -> Result<Value, VmError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => {
            if b == 0 && matches!(op, "/" | "%") {
                return Err(VmError::DivisionByZero);
            }
            Ok(Value::Int(match op {
                "-" => a.wrapping_sub(b),
                "*" => a.wrapping_mul(b),
                "/" => a / b,
                _ => a % b,
            }))
        }
        (lhs @ (Value::Int(_) | Value::Float(_)), rhs @ (Value::Int(_) | Value::Float(_))) => {
            let a = as_f64(&lhs);
            let b = as_f64(&rhs);
            Ok(Value::Float(match op {
                "-" => a - b,
                "*" => a * b,
                "/" => a / b,
                _ => a % b,
            }))
        }
        (a, _) => Err(VmError::UnsupportedOperand {
            operator: op.to_string(),
            type_name: a.type_name(),
        }),
    }
}

fn compare(op: &str, lhs: Value, rhs: Value) -> Result<Value, VmError> {
    let ordering = match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            as_f64(&lhs).partial_cmp(&as_f64(&rhs))
        }
        _ => None,
    };
    let Some(ordering) = ordering else {
        return Err(VmError::UnsupportedOperand {
            operator: op.to_string(),
            type_name: lhs.type_name(),
        });
    };
    Ok(Value::Bool(match op {
        "<" => ordering.is_lt(),
        ">" => ordering.is_gt(),
        "<=" => ordering.is_le(),
        _ => ordering.is_ge(),
    }))
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => f64::NAN,
    }
}

// ─── UI nodes ────────────────────────────────────────────────────────────────

fn ui_node(kind: &str) -> IndexMap<String, Value> {
    let mut node = IndexMap::new();
    node.insert("type".to_string(), Value::Str(kind.to_string()));
    node.insert("props".to_string(), Value::Dict(IndexMap::new()));
    node.insert("children".to_string(), Value::Array(Vec::new()));
    node.insert("modifiers".to_string(), Value::Array(Vec::new()));
    node.insert("events".to_string(), Value::Array(Vec::new()));
    node
}

fn node_prop(node: &mut IndexMap<String, Value>, key: &str, value: Value) {
    if let Some(Value::Dict(props)) = node.get_mut("props") {
        props.insert(key.to_string(), value);
    }
}

/// Single-prop leaf nodes: `Text("hi")`, `Image("icon")`.
fn ui_leaf(kind: &str, prop: &str, args: Vec<Value>) -> Result<Value, VmError> {
    let mut node = ui_node(kind);
    if let Some(value) = args.into_iter().next() {
        node_prop(&mut node, prop, value);
    }
    Ok(Value::Dict(node))
}

/// `Button(label)` or `Button(childNode)`.
fn ui_button(args: Vec<Value>) -> Result<Value, VmError> {
    let mut node = ui_node("Button");
    for arg in args {
        match arg {
            Value::Dict(_) => {
                if let Some(Value::Array(children)) = node.get_mut("children") {
                    children.push(arg);
                }
            }
            other => node_prop(&mut node, "label", other),
        }
    }
    Ok(Value::Dict(node))
}

/// Container nodes collect dictionary-shaped arguments as children.
fn ui_stack(kind: &str, args: Vec<Value>) -> Result<Value, VmError> {
    let mut node = ui_node(kind);
    if let Some(Value::Array(children)) = node.get_mut("children") {
        for arg in args {
            if matches!(arg, Value::Dict(_)) {
                children.push(arg);
            }
        }
    }
    Ok(Value::Dict(node))
}

fn ui_text_field(args: Vec<Value>) -> Result<Value, VmError> {
    let mut node = ui_node("TextField");
    let mut args = args.into_iter();
    if let Some(placeholder) = args.next() {
        node_prop(&mut node, "placeholder", placeholder);
    }
    if let Some(binding) = args.next() {
        node_prop(&mut node, "binding", binding);
    }
    Ok(Value::Dict(node))
}

fn ui_toggle(args: Vec<Value>) -> Result<Value, VmError> {
    let mut node = ui_node("Toggle");
    let mut args = args.into_iter();
    if let Some(label) = args.next() {
        node_prop(&mut node, "label", label);
    }
    if let Some(binding) = args.next() {
        node_prop(&mut node, "binding", binding);
    }
    Ok(Value::Dict(node))
}

/// Append a modifier record to the receiver node, pairing positional
/// arguments with the modifier's parameter names.
fn ui_modifier(
    receiver: Option<Value>,
    kind: &str,
    params: &[&str],
    args: Vec<Value>,
) -> Result<Value, VmError> {
    let mut node = match receiver {
        Some(Value::Dict(node)) => node,
        Some(other) => return Err(mismatch(kind, "view node", &other)),
        None => return Err(wrong_arity(kind, 1, 0)),
    };
    let mut record = IndexMap::new();
    record.insert("type".to_string(), Value::Str(kind.to_string()));
    let mut values = IndexMap::new();
    for (name, value) in params.iter().zip(args) {
        values.insert((*name).to_string(), value);
    }
    record.insert("params".to_string(), Value::Dict(values));
    let slot = node
        .entry("modifiers".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    match slot {
        Value::Array(modifiers) => modifiers.push(Value::Dict(record)),
        other => *other = Value::Array(vec![Value::Dict(record)]),
    }
    Ok(Value::Dict(node))
}

/// Append an event hook. The first argument names the host action; for
/// `onChange` a two-argument form carries the watched path first.
fn ui_event(receiver: Option<Value>, event: &str, args: Vec<Value>) -> Result<Value, VmError> {
    let mut node = match receiver {
        Some(Value::Dict(node)) => node,
        Some(other) => return Err(mismatch(event, "view node", &other)),
        None => return Err(wrong_arity(event, 1, 0)),
    };
    let mut record = IndexMap::new();
    record.insert("event".to_string(), Value::Str(event.to_string()));
    let mut args = args.into_iter();
    if event == "change" && args.len() > 1 {
        if let Some(path) = args.next() {
            record.insert("path".to_string(), path);
        }
    }
    let action = args.next().map(|v| v.to_string()).unwrap_or_default();
    record.insert("action_id".to_string(), Value::Str(action));
    let slot = node
        .entry("events".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    match slot {
        Value::Array(events) => events.push(Value::Dict(record)),
        other => *other = Value::Array(vec![Value::Dict(record)]),
    }
    Ok(Value::Dict(node))
}

// ─── State handles ───────────────────────────────────────────────────────────

/// `State(path, initial?)`: seeds the host state when the path is still
/// unset, then returns the `$state` handle.
fn state_init(args: Vec<Value>) -> Result<Value, VmError> {
    let mut args = args.into_iter();
    let path = match args.next() {
        Some(Value::Str(path)) => path,
        Some(other) => return Err(mismatch("State.init", "string", &other)),
        None => return Err(wrong_arity("State.init", 1, 0)),
    };
    if let Some(initial) = args.next() {
        with_current_script_context(|ctx| {
            if let Some(ctx) = ctx {
                if (ctx.state_get)(&path).is_none() {
                    (ctx.state_set)(&path, initial);
                }
            }
        });
    }
    let mut handle = IndexMap::new();
    handle.insert(STATE_TAG.to_string(), Value::Str(path));
    Ok(Value::Dict(handle))
}

/// The path inside a `$state`/`$binding` handle, or a bare string path.
fn state_path(value: &Value) -> Option<String> {
    match value {
        Value::Str(path) => Some(path.clone()),
        Value::Dict(entries) => match entries.get(STATE_TAG).or_else(|| entries.get(BINDING_TAG)) {
            Some(Value::Str(path)) => Some(path.clone()),
            _ => None,
        },
        _ => None,
    }
}

fn state_get(receiver: Option<Value>) -> Result<Value, VmError> {
    let receiver = receiver.ok_or_else(|| wrong_arity("State.get", 1, 0))?;
    let Some(path) = state_path(&receiver) else {
        return Err(mismatch("State.get", "state handle", &receiver));
    };
    Ok(with_current_script_context(|ctx| {
        ctx.and_then(|ctx| (ctx.state_get)(&path)).unwrap_or(Value::None)
    }))
}

fn state_set(receiver: Option<Value>, args: Vec<Value>) -> Result<Value, VmError> {
    let receiver = receiver.ok_or_else(|| wrong_arity("State.set", 1, 0))?;
    let Some(path) = state_path(&receiver) else {
        return Err(mismatch("State.set", "state handle", &receiver));
    };
    let mut args = args.into_iter();
    let value = args.next().ok_or_else(|| wrong_arity("State.set", 1, 0))?;
    with_current_script_context(|ctx| {
        if let Some(ctx) = ctx {
            (ctx.state_set)(&path, value);
        }
    });
    Ok(Value::None)
}

fn state_bind(receiver: Option<Value>) -> Result<Value, VmError> {
    let receiver = receiver.ok_or_else(|| wrong_arity("State.bind", 1, 0))?;
    let Some(path) = state_path(&receiver) else {
        return Err(mismatch("State.bind", "state handle", &receiver));
    };
    Ok(with_current_script_context(|ctx| {
        ctx.and_then(|ctx| (ctx.state_bind)(&path)).unwrap_or(Value::None)
    }))
}
