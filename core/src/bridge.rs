/*
 * Copyright (c) 2026 the Vibe Engine developers.
 *
 * This file is part of the Vibe Script Engine.
 *
 * Licensed under the MIT License. See LICENSE for details.
 */

//! Bridge runtime: the gate between bytecode and host routines.
//!
//! Every `call_bridge`/`call_init` lands here. The policy check runs first,
//! then the call dispatches into the per-symbol implementations in
//! `intrinsics`. The display name passed in comes from the program's symbol
//! name table so denials and unknown-symbol errors stay readable.

use crate::intrinsics;
use crate::policy::{CapabilitySet, SymbolPolicy};
use crate::runtime::{PrintSink, Value, VmError};
use crate::symbols::SymbolId;

/// One bridge invocation as the VM assembled it from the stack.
#[derive(Debug)]
pub struct BridgeInvocation {
    pub receiver: Option<Value>,
    pub args: Vec<Value>,
}

/// Check policy, then dispatch. `name` is the compiler-recorded symbol
/// name; it falls back to the hash form when the program carries no entry.
pub fn invoke(
    symbol: SymbolId,
    name: &str,
    invocation: BridgeInvocation,
    capabilities: CapabilitySet,
    sink: PrintSink,
) -> Result<Value, VmError> {
    if !SymbolPolicy::is_allowed(symbol, capabilities) {
        return Err(VmError::BridgeDenied { symbol, name: name.to_string() });
    }
    let entry = SymbolPolicy::lookup(symbol)
        .ok_or_else(|| VmError::UnknownBridge { symbol, name: name.to_string() })?;
    match intrinsics::dispatch(entry.name, invocation.receiver, invocation.args, sink) {
        Some(result) => result,
        None => Err(VmError::UnknownBridge { symbol, name: name.to_string() }),
    }
}
