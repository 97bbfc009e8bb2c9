/*
 * Copyright (c) 2026 the Vibe Engine developers.
 *
 * This file is part of the Vibe Script Engine.
 *
 * Licensed under the MIT License. See LICENSE for details.
 */

//! Stable 32-bit identifiers for functions, types, fields, bridge symbols
//! and operators.
//!
//! Every name the compiler or catalog cares about is reduced to an FNV-1a
//! hash of `"<namespace>::<name>"`. The IDs are deterministic across runs
//! and platforms, and small enough to ride in bytecode operands. FNV-1a is
//! not cryptographically secure; the bridge catalog is static, so a clash
//! there is a programming error fixed by renaming.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 32-bit FNV-1a offset basis.
pub const FNV1A_OFFSET_BASIS_32: u32 = 0x811c_9dc5;
/// 32-bit FNV-1a prime.
pub const FNV1A_PRIME_32: u32 = 0x0100_0193;

/// Mix bytes into an existing FNV-1a 32-bit hash state.
#[inline]
pub const fn fnv1a32_mix(mut hash: u32, bytes: &[u8]) -> u32 {
    let mut i = 0usize;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV1A_PRIME_32);
        i += 1;
    }
    hash
}

/// Hash an arbitrary byte slice with FNV-1a 32-bit.
#[inline]
pub const fn fnv1a32(bytes: &[u8]) -> u32 {
    fnv1a32_mix(FNV1A_OFFSET_BASIS_32, bytes)
}

// ─── Namespaces ──────────────────────────────────────────────────────────────

/// The five ID namespaces. Hashing the same name under two namespaces
/// yields unrelated IDs, so a struct `Point` and a function `Point` never
/// collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Namespace {
    Function,
    Type,
    Field,
    Bridge,
    Operator,
}

impl Namespace {
    pub const fn prefix(self) -> &'static str {
        match self {
            Namespace::Function => "fn",
            Namespace::Type => "type",
            Namespace::Field => "field",
            Namespace::Bridge => "bridge",
            Namespace::Operator => "op",
        }
    }
}

/// Hash a name in a namespace: `fnv1a32("<ns>::<name>")`.
pub fn hash_name(ns: Namespace, name: &str) -> u32 {
    let h = fnv1a32_mix(FNV1A_OFFSET_BASIS_32, ns.prefix().as_bytes());
    let h = fnv1a32_mix(h, b"::");
    fnv1a32_mix(h, name.as_bytes())
}

// ─── Typed IDs ───────────────────────────────────────────────────────────────

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $ns:expr) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            pub fn of(name: &str) -> Self {
                $name(hash_name($ns, name))
            }

            pub fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }
    };
}

define_id!(
    /// Identifies a compiled user function.
    FunctionId,
    Namespace::Function
);
define_id!(
    /// Identifies a registered struct type.
    TypeId,
    Namespace::Type
);
define_id!(
    /// Identifies a struct field. Field names are qualified as
    /// `"<Struct>.<field>"`, or `"*.<field>"` when the receiver type is
    /// unknown at compile time.
    FieldId,
    Namespace::Field
);
define_id!(
    /// Identifies a bridge routine or an operator symbol.
    SymbolId,
    Namespace::Bridge
);

impl SymbolId {
    /// Operator symbols live in the `op` namespace and hash the operator's
    /// literal text (`+`, `==`, `&&`, ...).
    pub fn operator(text: &str) -> Self {
        SymbolId(hash_name(Namespace::Operator, text))
    }
}

impl FieldId {
    /// Field ID for a field whose owning struct is known.
    pub fn qualified(struct_name: &str, field_name: &str) -> Self {
        FieldId::of(&format!("{}.{}", struct_name, field_name))
    }

    /// Wildcard field ID used when member lowering cannot infer the
    /// receiver's struct type.
    pub fn wildcard(field_name: &str) -> Self {
        FieldId::of(&format!("*.{}", field_name))
    }
}

// ─── Per-compilation symbol table ────────────────────────────────────────────

/// Caches name → ID lookups per namespace for the duration of a single
/// compilation, so the compiler hashes each name once.
#[derive(Debug, Default)]
pub struct ProgramSymbolTable {
    cache: HashMap<(Namespace, String), u32>,
}

impl ProgramSymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, ns: Namespace, name: &str) -> u32 {
        if let Some(id) = self.cache.get(&(ns, name.to_string())) {
            return *id;
        }
        let id = hash_name(ns, name);
        self.cache.insert((ns, name.to_string()), id);
        id
    }

    pub fn function(&mut self, name: &str) -> FunctionId {
        FunctionId(self.intern(Namespace::Function, name))
    }

    pub fn type_of(&mut self, name: &str) -> TypeId {
        TypeId(self.intern(Namespace::Type, name))
    }

    pub fn field(&mut self, qualified: &str) -> FieldId {
        FieldId(self.intern(Namespace::Field, qualified))
    }

    pub fn bridge(&mut self, name: &str) -> SymbolId {
        SymbolId(self.intern(Namespace::Bridge, name))
    }

    pub fn operator(&mut self, text: &str) -> SymbolId {
        SymbolId(self.intern(Namespace::Operator, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a32_known_vectors() {
        // Published FNV-1a test vectors.
        assert_eq!(fnv1a32(b""), 0x811c9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_name(Namespace::Bridge, "print"), hash_name(Namespace::Bridge, "print"));
        assert_eq!(SymbolId::of("print"), SymbolId::of("print"));
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let as_fn = hash_name(Namespace::Function, "Point");
        let as_type = hash_name(Namespace::Type, "Point");
        assert_ne!(as_fn, as_type);
    }

    #[test]
    fn test_operator_symbols_use_op_namespace() {
        assert_ne!(SymbolId::operator("+"), SymbolId::of("+"));
        assert_eq!(SymbolId::operator("+").raw(), hash_name(Namespace::Operator, "+"));
    }

    #[test]
    fn test_field_qualification() {
        assert_eq!(FieldId::qualified("Point", "x"), FieldId::of("Point.x"));
        assert_eq!(FieldId::wildcard("x"), FieldId::of("*.x"));
        assert_ne!(FieldId::qualified("Point", "x"), FieldId::wildcard("x"));
    }

    #[test]
    fn test_symbol_table_caches() {
        let mut table = ProgramSymbolTable::new();
        let a = table.bridge("Text");
        let b = table.bridge("Text");
        assert_eq!(a, b);
        assert_eq!(a, SymbolId::of("Text"));
    }
}
