//! The stack virtual machine.
//!
//! A VM instance is single-use: it owns its value and call stacks from
//! construction through `run()`, then is discarded. Errors raised during
//! execution are decorated with the failing instruction's span and a stack
//! trace assembled from the live frames before they reach the host.

use crate::bridge::{self, BridgeInvocation};
use crate::bytecode::{Constant, Instruction, OpCode, Program};
use crate::diagnostic::{RuntimeFailure, StackTraceFrame};
use crate::guard::{ExecutionLimits, ResourceGuard};
use crate::policy::CapabilitySet;
use crate::runtime::{StructInstance, Value, VmError};
use crate::symbols::{FieldId, FunctionId, SymbolId, TypeId};
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::trace;

/// One activation record. The entry frame has no return or call site.
#[derive(Debug)]
pub struct Frame {
    pub function: FunctionId,
    pub function_name: String,
    pub return_pc: Option<usize>,
    pub call_site_pc: Option<usize>,
    pub locals: Vec<Value>,
}

/// Last-resolved bridge target for one call site. Informative at this
/// revision: maintained, never consulted for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeCacheEntry {
    pub symbol: SymbolId,
    pub receiver_type: Option<&'static str>,
}

/// Last-resolved field access for one `get_field`/`set_field`/`make_struct`
/// site.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCacheEntry {
    pub type_id: TypeId,
    pub field: FieldId,
}

/// Everything a finished (or failed) run produced. Output accumulated
/// before a failure is preserved.
#[derive(Debug)]
pub struct RunResult {
    pub result: Result<Value, RuntimeFailure>,
    pub output: Vec<String>,
}

pub struct VirtualMachine<'p> {
    program: &'p Program,
    capabilities: CapabilitySet,
    guard: ResourceGuard,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    pc: usize,
    halted: bool,
    output: Vec<String>,
    bridge_cache: HashMap<(usize, Option<&'static str>), BridgeCacheEntry>,
    field_cache: HashMap<usize, FieldCacheEntry>,
}

impl<'p> VirtualMachine<'p> {
    pub fn new(program: &'p Program, capabilities: CapabilitySet, limits: ExecutionLimits) -> Self {
        VirtualMachine {
            program,
            capabilities,
            guard: ResourceGuard::new(limits),
            stack: Vec::new(),
            frames: Vec::new(),
            pc: 0,
            halted: false,
            output: Vec::new(),
            bridge_cache: HashMap::new(),
            field_cache: HashMap::new(),
        }
    }

    pub fn bridge_cache(&self) -> &HashMap<(usize, Option<&'static str>), BridgeCacheEntry> {
        &self.bridge_cache
    }

    pub fn field_cache(&self) -> &HashMap<usize, FieldCacheEntry> {
        &self.field_cache
    }

    /// Execute the program to completion or failure.
    pub fn run(mut self) -> RunResult {
        match self.execute() {
            Ok(value) => RunResult { result: Ok(value), output: self.output },
            Err((error, at)) => {
                let failure = self.decorate(error, at);
                RunResult { result: Err(failure), output: self.output }
            }
        }
    }

    fn execute(&mut self) -> Result<Value, (VmError, Option<usize>)> {
        let entry = match self.program.entry_function() {
            Some(entry) => entry.clone(),
            None => return Err((VmError::NoEntryFunction, None)),
        };
        self.frames.push(Frame {
            function: entry.id,
            function_name: entry.name.clone(),
            return_pc: None,
            call_site_pc: None,
            locals: vec![Value::None; entry.local_count],
        });
        self.pc = entry.entry;

        while !self.halted && self.pc < self.program.instructions.len() {
            self.guard.on_instruction().map_err(|e| (e, Some(self.pc)))?;
            let cur = self.pc;
            self.pc += 1;
            let instruction = &self.program.instructions[cur];
            trace!(
                pc = cur,
                op = instruction.opcode.name(),
                stack = self.stack.len(),
                frames = self.frames.len(),
                "step"
            );
            self.step(instruction.clone(), cur).map_err(|e| (e, Some(cur)))?;
        }

        Ok(self.stack.last().cloned().unwrap_or(Value::None))
    }

    fn decorate(&self, error: VmError, at: Option<usize>) -> RuntimeFailure {
        let call_stack = self
            .frames
            .iter()
            .rev()
            .map(|frame| StackTraceFrame {
                function_name: frame.function_name.clone(),
                call_site: frame.call_site_pc.and_then(|pc| self.program.span_of(pc)),
            })
            .collect();
        RuntimeFailure {
            message: error.to_string(),
            symbol: error.symbol(),
            instruction_index: at,
            span: at.and_then(|pc| self.program.span_of(pc)),
            call_stack,
        }
    }

    // ─── Stack & operand helpers ─────────────────────────────────────────────

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        self.stack.push(value);
        self.guard.ensure_value_stack_depth(self.stack.len())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Pop `count` values, restoring the order they were pushed in.
    fn pop_args(&mut self, count: usize) -> Result<Vec<Value>, VmError> {
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            args.push(self.pop()?);
        }
        args.reverse();
        Ok(args)
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, VmError> {
        self.frames.last_mut().ok_or(VmError::ReturnWithoutFrame)
    }

    fn operand(instruction: &Instruction, index: usize) -> Result<i64, VmError> {
        instruction.operand(index).ok_or(VmError::MissingOperand(index))
    }

    fn jump_target(&self, raw: i64) -> Result<usize, VmError> {
        if raw < 0 || raw as usize > self.program.instructions.len() {
            return Err(VmError::InvalidJumpTarget(raw));
        }
        Ok(raw as usize)
    }

    fn constant_value(&self, index: i64) -> Result<Value, VmError> {
        let constant = self
            .program
            .constant(index as usize)
            .ok_or(VmError::InvalidConstant(index.max(0) as usize))?;
        // ID-carrying constants flow as plain integers so they can ride
        // the value stack into bridge calls.
        Ok(match constant {
            Constant::None => Value::None,
            Constant::Int(v) => Value::Int(*v),
            Constant::Float(v) => Value::Float(*v),
            Constant::Bool(v) => Value::Bool(*v),
            Constant::Str(v) => Value::Str(v.clone()),
            Constant::Symbol(id) => Value::Int(i64::from(id.raw())),
            Constant::Type(id) => Value::Int(i64::from(id.raw())),
            Constant::Field(id) => Value::Int(i64::from(id.raw())),
            Constant::Function(id) => Value::Int(i64::from(id.raw())),
        })
    }

    /// Map a possibly-wildcard field ID onto the canonical ID from the
    /// struct's layout.
    fn resolve_field(&self, type_id: TypeId, field: FieldId) -> FieldId {
        let Some(layout) = self.program.struct_by_id(type_id) else { return field };
        if layout.field_by_id(field).is_some() {
            return field;
        }
        layout
            .fields
            .iter()
            .find(|f| FieldId::wildcard(&f.name) == field)
            .map(|f| f.id)
            .unwrap_or(field)
    }

    // ─── Instruction execution ───────────────────────────────────────────────

    fn step(&mut self, instruction: Instruction, cur: usize) -> Result<(), VmError> {
        match instruction.opcode {
            OpCode::Nop => Ok(()),
            OpCode::Halt => {
                self.halted = true;
                Ok(())
            }
            OpCode::PushConst => {
                let index = Self::operand(&instruction, 0)?;
                let value = self.constant_value(index)?;
                self.push(value)
            }
            OpCode::Pop => {
                self.pop()?;
                Ok(())
            }
            OpCode::Dup => {
                let top = self.stack.last().cloned().ok_or(VmError::StackUnderflow)?;
                self.push(top)
            }
            OpCode::LoadLocal => {
                let slot = Self::operand(&instruction, 0)? as usize;
                let frame = self.frames.last().ok_or(VmError::ReturnWithoutFrame)?;
                let value = frame
                    .locals
                    .get(slot)
                    .cloned()
                    .ok_or(VmError::InvalidLocal(slot))?;
                self.push(value)
            }
            OpCode::StoreLocal => {
                let slot = Self::operand(&instruction, 0)? as usize;
                let value = self.pop()?;
                let frame = self.frame_mut()?;
                match frame.locals.get_mut(slot) {
                    Some(local) => {
                        *local = value;
                        Ok(())
                    }
                    None => Err(VmError::InvalidLocal(slot)),
                }
            }
            OpCode::Jump => {
                self.pc = self.jump_target(Self::operand(&instruction, 0)?)?;
                Ok(())
            }
            OpCode::JumpIfFalse => {
                let target = self.jump_target(Self::operand(&instruction, 0)?)?;
                if !self.pop()?.is_truthy() {
                    self.pc = target;
                }
                Ok(())
            }
            OpCode::JumpIfTrue => {
                let target = self.jump_target(Self::operand(&instruction, 0)?)?;
                if self.pop()?.is_truthy() {
                    self.pc = target;
                }
                Ok(())
            }
            OpCode::ReturnValue => {
                let result = self.pop()?;
                let frame = self.frames.pop().ok_or(VmError::ReturnWithoutFrame)?;
                match frame.return_pc {
                    Some(return_pc) => {
                        self.pc = return_pc;
                        self.push(result)
                    }
                    None => {
                        // Entry-function return: the result is the program
                        // result and the run ends.
                        self.stack.clear();
                        self.push(result)?;
                        self.halted = true;
                        Ok(())
                    }
                }
            }
            OpCode::CallUser => self.call_user(&instruction, cur),
            OpCode::CallBridge | OpCode::CallInit => self.call_bridge(&instruction, cur),
            OpCode::MakeStruct => self.make_struct(&instruction, cur),
            OpCode::GetField => self.get_field(&instruction, cur),
            OpCode::SetField => self.set_field(&instruction, cur),
        }
    }

    fn call_user(&mut self, instruction: &Instruction, cur: usize) -> Result<(), VmError> {
        let function = FunctionId(Self::operand(instruction, 0)? as u32);
        let argc = Self::operand(instruction, 1)? as usize;
        let meta = self
            .program
            .function_by_id(function)
            .ok_or(VmError::UnknownFunction(function))?
            .clone();
        if argc != meta.arity {
            return Err(VmError::WrongArity {
                symbol: meta.name.clone(),
                expected: meta.arity,
                got: argc,
            });
        }
        let args = self.pop_args(argc)?;
        let mut locals = vec![Value::None; meta.local_count];
        for (slot, arg) in args.into_iter().enumerate() {
            if slot >= locals.len() {
                return Err(VmError::InvalidLocal(slot));
            }
            locals[slot] = arg;
        }
        self.frames.push(Frame {
            function,
            function_name: meta.name,
            return_pc: Some(self.pc),
            call_site_pc: Some(cur),
            locals,
        });
        self.pc = meta.entry;
        self.guard.ensure_call_depth(self.frames.len())
    }

    fn call_bridge(&mut self, instruction: &Instruction, cur: usize) -> Result<(), VmError> {
        let symbol = SymbolId(Self::operand(instruction, 0)? as u32);
        let argc = Self::operand(instruction, 1)? as usize;
        let has_receiver = Self::operand(instruction, 2)? != 0;
        let args = self.pop_args(argc)?;
        let receiver = if has_receiver { Some(self.pop()?) } else { None };

        let receiver_type = receiver.as_ref().map(|r| r.type_name());
        self.bridge_cache
            .insert((cur, receiver_type), BridgeCacheEntry { symbol, receiver_type });

        let name = self.program.symbol_name(symbol);
        let output = &mut self.output;
        let mut sink = |line: String| output.push(line);
        let result = bridge::invoke(
            symbol,
            &name,
            BridgeInvocation { receiver, args },
            self.capabilities,
            &mut sink,
        )?;
        self.push(result)
    }

    fn make_struct(&mut self, instruction: &Instruction, cur: usize) -> Result<(), VmError> {
        let type_id = TypeId(Self::operand(instruction, 0)? as u32);
        let field_count = Self::operand(instruction, 1)? as usize;
        if instruction.operands.len() != 2 + field_count {
            return Err(VmError::MalformedStructOperands);
        }
        let field_ids: Vec<FieldId> = instruction.operands[2..]
            .iter()
            .map(|raw| FieldId(*raw as u32))
            .collect();
        let values = self.pop_args(field_count)?;
        let mut fields = IndexMap::with_capacity(field_count);
        for (field, value) in field_ids.iter().zip(values) {
            fields.insert(*field, value);
            self.field_cache.insert(cur, FieldCacheEntry { type_id, field: *field });
        }
        self.push(Value::Struct(StructInstance { type_id, fields }))
    }

    fn get_field(&mut self, instruction: &Instruction, cur: usize) -> Result<(), VmError> {
        let field = FieldId(Self::operand(instruction, 0)? as u32);
        let base = self.pop()?;
        let Value::Struct(instance) = base else {
            return Err(VmError::NotAStruct { op: "get_field", type_name: base.type_name() });
        };
        let canonical = self.resolve_field(instance.type_id, field);
        self.field_cache
            .insert(cur, FieldCacheEntry { type_id: instance.type_id, field: canonical });
        let value = instance
            .fields
            .get(&canonical)
            .cloned()
            .ok_or(VmError::MissingField(canonical))?;
        self.push(value)
    }

    /// Copy-on-write at the value level: the popped instance is already
    /// this frame's own copy, so inserting into it never aliases.
    fn set_field(&mut self, instruction: &Instruction, cur: usize) -> Result<(), VmError> {
        let field = FieldId(Self::operand(instruction, 0)? as u32);
        let value = self.pop()?;
        let base = self.pop()?;
        let Value::Struct(mut instance) = base else {
            return Err(VmError::NotAStruct { op: "set_field", type_name: base.type_name() });
        };
        let canonical = self.resolve_field(instance.type_id, field);
        if self
            .program
            .struct_by_id(instance.type_id)
            .is_some_and(|layout| layout.field_by_id(canonical).is_none())
        {
            return Err(VmError::MissingField(canonical));
        }
        self.field_cache
            .insert(cur, FieldCacheEntry { type_id: instance.type_id, field: canonical });
        instance.fields.insert(canonical, value);
        self.push(Value::Struct(instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::policy::Capability;
    use std::time::Duration;

    fn compile(source: &str) -> Program {
        let (program, diagnostics) = Compiler::compile(source, "test.vibe");
        program.unwrap_or_else(|| panic!("compile failed: {:?}", diagnostics))
    }

    fn caps() -> CapabilitySet {
        CapabilitySet::empty().with(Capability::FoundationBasic)
    }

    fn run(source: &str) -> RunResult {
        let program = compile(source);
        VirtualMachine::new(&program, caps(), ExecutionLimits::default()).run()
    }

    fn run_value(source: &str) -> Value {
        let result = run(source);
        result.result.unwrap_or_else(|e| panic!("run failed: {}", e))
    }

    #[test]
    fn test_empty_program_returns_none() {
        assert_eq!(run_value(""), Value::None);
    }

    #[test]
    fn test_arithmetic_program() {
        assert_eq!(run_value("let x = 2\nlet y = 3\nreturn x + y"), Value::Int(5));
    }

    #[test]
    fn test_print_and_output_order() {
        let result = run("print(1)\nprint(2)\nprint(3)");
        assert!(result.result.is_ok());
        assert_eq!(result.output, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_user_function_call() {
        assert_eq!(run_value("func add(a, b) { return a + b }\nreturn add(4, 9)"), Value::Int(13));
    }

    #[test]
    fn test_while_loop_and_branch() {
        let source = "var i = 0\nvar sum = 0\nwhile i < 5 { sum = sum + i; i = i + 1 }\nif sum > 5 { return sum } else { return 0 }";
        assert_eq!(run_value(source), Value::Int(10));
    }

    #[test]
    fn test_while_zero_iterations() {
        assert_eq!(run_value("var i = 9\nwhile i < 5 { i = i + 1 }\nreturn i"), Value::Int(9));
    }

    #[test]
    fn test_if_without_else() {
        assert_eq!(run_value("var x = 1\nif x > 0 { x = 5 }\nreturn x"), Value::Int(5));
        assert_eq!(run_value("var x = 1\nif x > 9 { x = 5 }\nreturn x"), Value::Int(1));
    }

    #[test]
    fn test_else_if_chain_three_arms() {
        let source =
            "var x = 2\nif x == 1 { return 10 } else if x == 2 { return 20 } else { return 30 }";
        assert_eq!(run_value(source), Value::Int(20));
    }

    #[test]
    fn test_struct_field_mutation() {
        let source =
            "struct Point { var x; var y }\nvar p = Point(2, 3)\np.x = 9\nreturn p.x + p.y";
        assert_eq!(run_value(source), Value::Int(12));
    }

    #[test]
    fn test_struct_missing_field_read_fails() {
        let source = "struct Point { var x; var y }\nvar p = Point(2)\nreturn p.y";
        let result = run(source);
        let failure = result.result.unwrap_err();
        assert!(failure.message.contains("not set"));
        assert!(failure.instruction_index.is_some());
    }

    #[test]
    fn test_zero_field_struct() {
        let source = "struct Unit { }\nvar u = Unit()\nreturn u";
        let Value::Struct(instance) = run_value(source) else { panic!("expected struct") };
        assert!(instance.fields.is_empty());
    }

    #[test]
    fn test_wildcard_field_resolves_through_layout() {
        // `p` flows through an untyped parameter, so the member access
        // compiles with a wildcard field ID.
        let source = "struct Point { var x; var y }\nfunc getx(p) { return p.x }\nvar p = Point(7, 1)\nreturn getx(p)";
        assert_eq!(run_value(source), Value::Int(7));
    }

    #[test]
    fn test_shadowing_resolves_innermost() {
        let source = "var x = 1\nif true { var x = 2\nx = 30 }\nreturn x";
        assert_eq!(run_value(source), Value::Int(1));
    }

    #[test]
    fn test_string_method_chain() {
        let result = run("let name = \"vibe\"\nprint(name.uppercased())\nreturn name");
        assert_eq!(result.result.unwrap(), Value::Str("vibe".to_string()));
        assert_eq!(result.output, vec!["VIBE"]);
    }

    #[test]
    fn test_entry_return_leaves_single_value() {
        let program = compile("return 1 + 1");
        let vm = VirtualMachine::new(&program, caps(), ExecutionLimits::default());
        let result = vm.run();
        assert_eq!(result.result.unwrap(), Value::Int(2));
    }

    #[test]
    fn test_capability_gate_blocks_date() {
        let program = compile("return Date.now");
        let result = VirtualMachine::new(&program, caps(), ExecutionLimits::default()).run();
        let failure = result.result.unwrap_err();
        assert!(failure.message.contains("not allowed"));
        assert_eq!(failure.symbol, Some(SymbolId::of("Date.now")));
    }

    #[test]
    fn test_date_allowed_with_capability() {
        let program = compile("return Date.now");
        let capabilities = caps().with(Capability::DateFormatting);
        let result = VirtualMachine::new(&program, capabilities, ExecutionLimits::default()).run();
        let Value::Native(native) = result.result.unwrap() else { panic!("expected native") };
        assert_eq!(native.kind, "timestamp");
    }

    #[test]
    fn test_instruction_budget_trips() {
        let program = compile("var i = 0\nwhile i < 100000 { i = i + 1 }");
        let limits = ExecutionLimits { instruction_budget: 500, ..Default::default() };
        let result = VirtualMachine::new(&program, caps(), limits).run();
        let failure = result.result.unwrap_err();
        assert!(failure.message.contains("budget"));
    }

    #[test]
    fn test_call_depth_limit_trips() {
        let program = compile("func spin(n) { return spin(n + 1) }\nreturn spin(0)");
        let limits = ExecutionLimits {
            max_call_depth: 16,
            instruction_budget: 1_000_000,
            wall_clock_limit: Duration::from_secs(10),
            ..Default::default()
        };
        let result = VirtualMachine::new(&program, caps(), limits).run();
        let failure = result.result.unwrap_err();
        assert!(failure.message.contains("call depth"));
        // The trace records the recursive frames.
        assert!(failure.call_stack.len() > 10);
        assert_eq!(failure.call_stack[0].function_name, "spin");
    }

    #[test]
    fn test_runtime_error_carries_span_and_stack() {
        let source =
            "func third() { return 1 / 0 }\nfunc second() { return third() }\nreturn second()";
        let result = run(source);
        let failure = result.result.unwrap_err();
        assert!(failure.message.contains("division"));
        assert!(failure.span.is_some());
        let names: Vec<_> =
            failure.call_stack.iter().map(|f| f.function_name.as_str()).collect();
        assert_eq!(names, vec!["third", "second", "<entry>"]);
        // Inner frames carry the spans of their call sites.
        assert!(failure.call_stack[0].call_site.is_some());
        assert!(failure.call_stack[2].call_site.is_none());
    }

    #[test]
    fn test_output_preserved_on_failure() {
        let result = run("print(\"before\")\nreturn 1 / 0");
        assert!(result.result.is_err());
        assert_eq!(result.output, vec!["before"]);
    }

    #[test]
    fn test_bridge_inline_cache_recorded() {
        let program = compile("let s = \"a\"\nlet t = s.uppercased()\nreturn t");
        let mut vm = VirtualMachine::new(&program, caps(), ExecutionLimits::default());
        let value = vm.execute().expect("run succeeds");
        assert_eq!(value, Value::Str("A".to_string()));
        let upper = SymbolId::of("String.uppercased");
        assert!(vm
            .bridge_cache
            .iter()
            .any(|((_, recv), entry)| entry.symbol == upper && *recv == Some("string")));
    }

    #[test]
    fn test_field_inline_cache_recorded() {
        let program = compile("struct P { var x }\nvar p = P(3)\nreturn p.x");
        let mut vm = VirtualMachine::new(&program, caps(), ExecutionLimits::default());
        vm.execute().expect("run succeeds");
        assert!(vm
            .field_cache
            .values()
            .any(|entry| entry.type_id == TypeId::of("P") && entry.field == FieldId::of("P.x")));
    }

    #[test]
    fn test_arity_mismatch_fails() {
        let program = compile("func one(a) { return a }\nreturn one(1, 2)");
        let result = VirtualMachine::new(&program, caps(), ExecutionLimits::default()).run();
        let failure = result.result.unwrap_err();
        assert!(failure.message.contains("expects 1 argument"));
    }
}
