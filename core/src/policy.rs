/*
 * Copyright (c) 2026 the Vibe Engine developers.
 *
 * This file is part of the Vibe Script Engine.
 *
 * Licensed under the MIT License. See LICENSE for details.
 */

//! Capability policy: the static bridge symbol catalog and the admission
//! rule gating every bridge call.
//!
//! A symbol is allowed iff it has a catalog entry and the entry's
//! capability is in the run's capability set. Everything else — including
//! the `dynamic.*` symbols the compiler falls back to for unknown names —
//! is denied.

use crate::symbols::SymbolId;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Capabilities ────────────────────────────────────────────────────────────

/// Coarse permission tags. Each bridge symbol carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    FoundationBasic,
    DateFormatting,
    UiBasic,
    Diagnostics,
}

impl Capability {
    const ALL: [Capability; 4] = [
        Capability::FoundationBasic,
        Capability::DateFormatting,
        Capability::UiBasic,
        Capability::Diagnostics,
    ];

    const fn bit(self) -> u32 {
        match self {
            Capability::FoundationBasic => 1 << 0,
            Capability::DateFormatting => 1 << 1,
            Capability::UiBasic => 1 << 2,
            Capability::Diagnostics => 1 << 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Capability::FoundationBasic => "foundation_basic",
            Capability::DateFormatting => "date_formatting",
            Capability::UiBasic => "ui_basic",
            Capability::Diagnostics => "diagnostics",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Bitset over capability tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    pub const fn empty() -> Self {
        CapabilitySet(0)
    }

    pub fn all() -> Self {
        let mut set = CapabilitySet::empty();
        for cap in Capability::ALL {
            set.insert(cap);
        }
        set
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.insert(cap);
        self
    }

    pub fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn names(self) -> Vec<String> {
        Capability::ALL
            .iter()
            .filter(|c| self.contains(**c))
            .map(|c| c.name().to_string())
            .collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

// ─── Bridge catalog ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub symbol: SymbolId,
    pub name: &'static str,
    pub capability: Capability,
}

/// The eleven binary operators plus the unary `-` and `!` forms, all in
/// the operator namespace.
pub const OPERATOR_TEXTS: [&str; 13] =
    ["+", "-", "*", "/", "%", "==", "<", ">", "<=", ">=", "&&", "||", "!"];

const FOUNDATION_SYMBOLS: [&str; 7] = [
    "print",
    "String.uppercased",
    "String.lowercased",
    "String.contains",
    "Int.init",
    "Double.init",
    "Bool.init",
];

const UI_SYMBOLS: [&str; 20] = [
    "Text",
    "Button",
    "VStack",
    "HStack",
    "Spacer",
    "Image",
    "TextField",
    "Toggle",
    "padding",
    "font",
    "foregroundStyle",
    "frame",
    "background",
    "onTap",
    "onAppear",
    "onChange",
    "State.init",
    "State.get",
    "State.set",
    "State.bind",
];

lazy_static! {
    /// The full bridge catalog, keyed by symbol ID. Insertion order is the
    /// declaration order above, which keeps preview listings stable.
    pub static ref BRIDGE_CATALOG: IndexMap<SymbolId, CatalogEntry> = {
        let mut catalog = IndexMap::new();
        let mut add = |symbol: SymbolId, name: &'static str, capability: Capability| {
            let prev = catalog.insert(symbol, CatalogEntry { symbol, name, capability });
            // A clash here means two catalog names hash identically and one
            // must be renamed.
            assert!(prev.is_none(), "bridge catalog symbol collision on {}", name);
        };
        for name in FOUNDATION_SYMBOLS {
            add(SymbolId::of(name), name, Capability::FoundationBasic);
        }
        for text in OPERATOR_TEXTS {
            add(SymbolId::operator(text), text, Capability::FoundationBasic);
        }
        add(SymbolId::of("Date.now"), "Date.now", Capability::DateFormatting);
        for name in UI_SYMBOLS {
            add(SymbolId::of(name), name, Capability::UiBasic);
        }
        catalog
    };
}

/// The admission rule.
pub struct SymbolPolicy;

impl SymbolPolicy {
    pub fn lookup(symbol: SymbolId) -> Option<&'static CatalogEntry> {
        BRIDGE_CATALOG.get(&symbol)
    }

    pub fn is_allowed(symbol: SymbolId, capabilities: CapabilitySet) -> bool {
        match BRIDGE_CATALOG.get(&symbol) {
            Some(entry) => capabilities.contains(entry.capability),
            None => false,
        }
    }
}
