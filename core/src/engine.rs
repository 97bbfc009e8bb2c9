/*
 * Copyright (c) 2026 the Vibe Engine developers.
 *
 * This file is part of the Vibe Script Engine.
 *
 * Licensed under the MIT License. See LICENSE for details.
 */

//! The stable engine surface: `compile`, `compile_and_run`, and
//! `build_preview`.
//!
//! Each run re-parses and re-compiles the source; compiled programs never
//! outlive the request that produced them. `build_preview` stops before
//! execution and reports which bridge symbols the program would use and
//! which the configured capabilities would block — it never fails.

use crate::bytecode::{OpCode, Program};
use crate::compiler::Compiler;
use crate::diagnostic::{Diagnostic, RuntimeFailure};
use crate::guard::ExecutionLimits;
use crate::policy::{Capability, CapabilitySet, SymbolPolicy};
use crate::runtime::Value;
use crate::symbols::SymbolId;
use crate::vm::VirtualMachine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// One execution request. Defaults to the foundation capability only and
/// the standard limits.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: String,
    pub file_name: String,
    pub capabilities: CapabilitySet,
    pub limits: ExecutionLimits,
}

impl RunRequest {
    pub fn new(source: impl Into<String>) -> Self {
        RunRequest {
            source: source.into(),
            file_name: "script.vibe".to_string(),
            capabilities: CapabilitySet::empty().with(Capability::FoundationBasic),
            limits: ExecutionLimits::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Debug)]
pub struct CompileOutcome {
    pub program: Option<Program>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub value: Value,
    pub output: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("compilation failed")]
    Compile { diagnostics: Vec<Diagnostic> },
    #[error("{failure}")]
    Runtime { failure: RuntimeFailure, output: Vec<String> },
}

/// Everything a host needs to vet a script before running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewReport {
    pub compilation_diagnostics: Vec<Diagnostic>,
    pub used_symbols: Vec<String>,
    pub blocked_symbols: Vec<String>,
    pub vm_compilation_succeeded: bool,
    pub bytecode_size: usize,
    pub instruction_count: usize,
    pub constant_count: usize,
    pub function_count: usize,
}

/// Compile one source text. Symbols the given capabilities would block at
/// run time are reported as warnings so editors can flag them early.
pub fn compile(source: &str, file_name: &str, capabilities: &CapabilitySet) -> CompileOutcome {
    let (program, mut diagnostics) = Compiler::compile(source, file_name);
    if let Some(program) = &program {
        for name in blocked_symbols(program, *capabilities) {
            diagnostics.push(Diagnostic::warning(
                format!("'{}' is not allowed by the configured capabilities", name),
                None,
            ));
        }
    }
    CompileOutcome { program, diagnostics }
}

/// Compile and execute, returning the program value plus everything the
/// run printed. Output accumulated before a runtime failure rides along
/// with the error.
pub fn compile_and_run(request: &RunRequest) -> Result<RunOutcome, EngineError> {
    let (program, diagnostics) = Compiler::compile(&request.source, &request.file_name);
    let Some(program) = program else {
        return Err(EngineError::Compile { diagnostics });
    };
    debug!(file = %request.file_name, instructions = program.instructions.len(), "running");
    let vm = VirtualMachine::new(&program, request.capabilities, request.limits);
    let run = vm.run();
    match run.result {
        Ok(value) => Ok(RunOutcome { value, output: run.output, diagnostics }),
        Err(failure) => Err(EngineError::Runtime { failure, output: run.output }),
    }
}

/// Compile only, then report the assembled program's bridge surface
/// against the request's capabilities. Never fails: compilation problems
/// surface through the diagnostics and the `vm_compilation_succeeded`
/// flag.
pub fn build_preview(request: &RunRequest) -> PreviewReport {
    let (program, diagnostics) = Compiler::compile(&request.source, &request.file_name);
    let Some(program) = program else {
        return PreviewReport {
            compilation_diagnostics: diagnostics,
            used_symbols: Vec::new(),
            blocked_symbols: Vec::new(),
            vm_compilation_succeeded: false,
            bytecode_size: 0,
            instruction_count: 0,
            constant_count: 0,
            function_count: 0,
        };
    };
    let used: Vec<(SymbolId, String)> = used_symbols(&program);
    let blocked: Vec<String> = used
        .iter()
        .filter(|(symbol, _)| !SymbolPolicy::is_allowed(*symbol, request.capabilities))
        .map(|(_, name)| name.clone())
        .collect();
    PreviewReport {
        compilation_diagnostics: diagnostics,
        used_symbols: used.into_iter().map(|(_, name)| name).collect(),
        blocked_symbols: blocked,
        vm_compilation_succeeded: true,
        bytecode_size: program.code.len(),
        instruction_count: program.instructions.len(),
        constant_count: program.constants.len(),
        function_count: program.functions.len(),
    }
}

/// Every distinct bridge symbol referenced by assembled
/// `call_bridge`/`call_init` instructions, in first-use order.
fn used_symbols(program: &Program) -> Vec<(SymbolId, String)> {
    let mut seen = Vec::new();
    for instruction in &program.instructions {
        if !matches!(instruction.opcode, OpCode::CallBridge | OpCode::CallInit) {
            continue;
        }
        let Some(raw) = instruction.operand(0) else { continue };
        let symbol = SymbolId(raw as u32);
        if seen.iter().any(|(existing, _)| *existing == symbol) {
            continue;
        }
        seen.push((symbol, program.symbol_name(symbol)));
    }
    seen
}

fn blocked_symbols(program: &Program, capabilities: CapabilitySet) -> Vec<String> {
    used_symbols(program)
        .into_iter()
        .filter(|(symbol, _)| !SymbolPolicy::is_allowed(*symbol, capabilities))
        .map(|(_, name)| name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{push_script_context, ScriptContext, Value};
    use crate::viewtree::{IrValue, ViewTree, IR_VERSION};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn foundation() -> CapabilitySet {
        CapabilitySet::empty().with(Capability::FoundationBasic)
    }

    fn run(source: &str) -> RunOutcome {
        compile_and_run(&RunRequest::new(source)).unwrap_or_else(|e| panic!("run failed: {}", e))
    }

    #[test]
    fn test_scenario_print_and_add() {
        let outcome = run("let x = 2\nlet y = 3\nprint(x + y)\nreturn x + y");
        assert_eq!(outcome.value, Value::Int(5));
        assert_eq!(outcome.output, vec!["5"]);
    }

    #[test]
    fn test_scenario_user_function() {
        let outcome = run("func add(a,b){ return a + b }\nreturn add(4, 9)");
        assert_eq!(outcome.value, Value::Int(13));
    }

    #[test]
    fn test_scenario_loop_and_branch() {
        let source = "var i = 0\nvar sum = 0\nwhile i < 5 { sum = sum + i; i = i + 1 }\nif sum > 5 { return sum } else { return 0 }";
        assert_eq!(run(source).value, Value::Int(10));
    }

    #[test]
    fn test_scenario_struct_mutation() {
        let source = "struct Point { var x; var y }\nvar p = Point(2, 3)\np.x = 9\nreturn p.x + p.y";
        assert_eq!(run(source).value, Value::Int(12));
    }

    #[test]
    fn test_scenario_blocked_date() {
        let request = RunRequest::new("return Date.now")
            .with_capabilities(foundation().with(Capability::Diagnostics));
        let err = compile_and_run(&request).unwrap_err();
        let EngineError::Runtime { failure, .. } = err else { panic!("expected runtime error") };
        assert!(failure.message.contains("not allowed"));

        let preview = build_preview(&request);
        assert!(preview.vm_compilation_succeeded);
        assert_eq!(preview.blocked_symbols, vec!["Date.now"]);
    }

    #[test]
    fn test_scenario_string_methods_and_preview() {
        let source = "let name = \"vibe\"\nprint(name.uppercased())\nreturn name";
        let outcome = run(source);
        assert_eq!(outcome.value, Value::Str("vibe".to_string()));
        assert_eq!(outcome.output, vec!["VIBE"]);

        let preview = build_preview(&RunRequest::new(source));
        assert!(preview.used_symbols.contains(&"print".to_string()));
        assert!(preview.used_symbols.contains(&"String.uppercased".to_string()));
        assert!(preview.blocked_symbols.is_empty());
    }

    #[test]
    fn test_empty_source_returns_none() {
        assert_eq!(run("").value, Value::None);
    }

    #[test]
    fn test_compile_error_propagates_diagnostics() {
        let err = compile_and_run(&RunRequest::new("let x = missing")).unwrap_err();
        let EngineError::Compile { diagnostics } = err else { panic!("expected compile error") };
        assert!(diagnostics.iter().any(|d| d.message.contains("missing")));
    }

    #[test]
    fn test_runtime_error_keeps_output() {
        let err = compile_and_run(&RunRequest::new("print(\"one\")\nreturn 1 / 0")).unwrap_err();
        let EngineError::Runtime { failure, output } = err else { panic!("expected runtime") };
        assert!(failure.message.contains("division"));
        assert_eq!(output, vec!["one"]);
    }

    #[test]
    fn test_compile_surface_flags_blocked_symbols() {
        let outcome = compile("return Date.now", "script.vibe", &foundation());
        assert!(outcome.program.is_some());
        assert!(outcome
            .diagnostics
            .iter()
            .any(|d| !d.is_error() && d.message.contains("Date.now")));
    }

    #[test]
    fn test_preview_never_fails_on_bad_source() {
        let preview = build_preview(&RunRequest::new("let = broken ("));
        assert!(!preview.vm_compilation_succeeded);
        assert!(!preview.compilation_diagnostics.is_empty());
        assert_eq!(preview.bytecode_size, 0);
        assert_eq!(preview.function_count, 0);
    }

    #[test]
    fn test_preview_counts_program_shape() {
        let preview = build_preview(&RunRequest::new(
            "func add(a,b){ return a + b }\nreturn add(1, 2)",
        ));
        assert!(preview.vm_compilation_succeeded);
        assert_eq!(preview.function_count, 2);
        assert!(preview.instruction_count > 0);
        assert!(preview.bytecode_size > 0);
        assert!(preview.constant_count > 0);
        // The operator call inside `add` is a bridge use.
        assert!(preview.used_symbols.contains(&"+".to_string()));
    }

    #[test]
    fn test_dynamic_symbols_show_as_blocked() {
        let preview = build_preview(&RunRequest::new("frobnicate(1)"));
        assert!(preview.used_symbols.contains(&"dynamic.frobnicate".to_string()));
        assert!(preview.blocked_symbols.contains(&"dynamic.frobnicate".to_string()));
    }

    #[test]
    fn test_ui_script_produces_view_tree() {
        let source = "var counter = State(\"counter\", 0)\nreturn VStack(Text(\"Count\").padding(8), Button(\"Up\").onTap(\"increment\"))";
        let request = RunRequest::new(source)
            .with_capabilities(foundation().with(Capability::UiBasic));
        let outcome = compile_and_run(&request).unwrap();
        let tree = ViewTree::from(&outcome.value, IR_VERSION, &[]).expect("tree builds");
        assert_eq!(tree.root.node_type, "VStack");
        assert_eq!(tree.root.children.len(), 2);
        assert_eq!(tree.root.children[0].node_type, "Text");
        assert_eq!(tree.root.children[0].modifiers[0].modifier_type, "padding");
        assert_eq!(tree.root.children[1].events[0].action_id, "increment");
    }

    #[test]
    fn test_script_context_threads_state() {
        let store: Rc<RefCell<HashMap<String, Value>>> = Rc::new(RefCell::new(HashMap::new()));
        let get_store = store.clone();
        let set_store = store.clone();
        let _guard = push_script_context(ScriptContext {
            state_get: Box::new(move |path| get_store.borrow().get(path).cloned()),
            state_set: Box::new(move |path, value| {
                set_store.borrow_mut().insert(path.to_string(), value);
            }),
            state_bind: Box::new(|path| {
                let mut handle = indexmap::IndexMap::new();
                handle.insert(
                    crate::runtime::BINDING_TAG.to_string(),
                    Value::Str(path.to_string()),
                );
                Some(Value::Dict(handle))
            }),
        });

        let source = "var counter = State(\"counter\", 10)\ncounter.set(counter.get() + 1)\nreturn counter.get()";
        let request = RunRequest::new(source)
            .with_capabilities(foundation().with(Capability::UiBasic));
        let outcome = compile_and_run(&request).unwrap();
        assert_eq!(outcome.value, Value::Int(11));
        assert_eq!(store.borrow().get("counter"), Some(&Value::Int(11)));

        // bind() resolves through the host and survives the IR mapping.
        let source = "var counter = State(\"counter\")\nreturn counter.bind()";
        let request = RunRequest::new(source)
            .with_capabilities(foundation().with(Capability::UiBasic));
        let outcome = compile_and_run(&request).unwrap();
        let ir = IrValue::from_runtime(&outcome.value).unwrap();
        assert_eq!(ir, IrValue::BindingRef { binding_ref: "counter".to_string() });
    }

    #[test]
    fn test_runs_are_isolated() {
        // Two runs of the same request share nothing; the second sees a
        // fresh VM and output buffer.
        let request = RunRequest::new("print(\"x\")\nreturn 1");
        let first = compile_and_run(&request).unwrap();
        let second = compile_and_run(&request).unwrap();
        assert_eq!(first.output, second.output);
        assert_eq!(first.value, second.value);
    }
}
