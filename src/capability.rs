//! Sub-compiler capability introspection.
//!
//! This module defines the types that describe what a sub-compiler can do:
//! which opcodes it recognizes and which of those it lowers natively. The
//! fallback resolver walks a [`CapabilityTable`] instead of asking live
//! sub-compilers, so routing never needs a round-trip to a backend task.
//!
//! Opcode names are lowercase, following OpenQASM naming for gates
//! (`h`, `cx`, `ry`) and short mnemonics for classical operations
//! (`add`, `const`, `barrier`).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::kind::BackendKind;

/// Set of opcodes recognized by a backend.
///
/// The `native` list identifies opcodes that lower to a single native
/// operation. If `native` is empty, all supported opcodes are considered
/// native (typical for the classical evaluator).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionSet {
    /// All opcodes the backend accepts.
    pub opcodes: BTreeSet<String>,
    /// Opcodes lowered without decomposition.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub native: BTreeSet<String>,
}

impl InstructionSet {
    /// Build a set from opcode names, all native.
    pub fn from_opcodes<I, S>(opcodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            opcodes: opcodes.into_iter().map(Into::into).collect(),
            native: BTreeSet::new(),
        }
    }

    /// Mark a subset of opcodes as native.
    pub fn with_native<I, S>(mut self, native: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.native = native.into_iter().map(Into::into).collect();
        self
    }

    /// Classical evaluator instruction set.
    pub fn classical() -> Self {
        Self::from_opcodes([
            "const", "mov", "add", "sub", "mul", "div", "eq", "ne", "lt", "le", "not", "and",
            "or", "xor", "barrier", "cast",
        ])
    }

    /// State-vector simulator instruction set.
    ///
    /// `init`, `redim` and `sync` decompose into gates; the rest are native.
    /// `barrier` is a classical-kind opcode the simulator embeds directly.
    pub fn statevector() -> Self {
        Self::from_opcodes([
            "init", "redim", "sync", "x", "z", "h", "cx", "cz", "swap", "ry", "x_if", "measure",
            "barrier",
        ])
        .with_native([
            "x", "z", "h", "cx", "cz", "swap", "ry", "x_if", "measure", "barrier",
        ])
    }

    /// Check if an opcode is supported.
    pub fn contains(&self, opcode: &str) -> bool {
        self.opcodes.contains(opcode)
    }

    /// Check if an opcode is native (lowers without decomposition).
    ///
    /// If the `native` list is empty, all supported opcodes are native.
    pub fn is_native(&self, opcode: &str) -> bool {
        if self.native.is_empty() {
            self.contains(opcode)
        } else {
            self.native.contains(opcode)
        }
    }

    /// Keep only the opcodes also present in `other`.
    pub fn intersect(&self, other: &InstructionSet) -> InstructionSet {
        InstructionSet {
            opcodes: self.opcodes.intersection(&other.opcodes).cloned().collect(),
            native: self.native.intersection(&other.opcodes).cloned().collect(),
        }
    }
}

/// Capabilities of one sub-compiler.
///
/// Cached at construction. `SubCompiler::capabilities()` returns a
/// reference and never performs I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Kind this sub-compiler is registered for.
    pub kind: BackendKind,
    /// Opcodes it recognizes.
    pub instructions: InstructionSet,
    /// Whether execution is simulated rather than run on a device.
    pub is_simulator: bool,
}

impl Capabilities {
    pub fn new(kind: BackendKind, instructions: InstructionSet) -> Self {
        Self {
            kind,
            instructions,
            is_simulator: false,
        }
    }

    pub fn simulated(mut self) -> Self {
        self.is_simulator = true;
        self
    }

    pub fn supports(&self, opcode: &str) -> bool {
        self.instructions.contains(opcode)
    }
}

/// Capabilities of every spawned sub-compiler, in hierarchy order.
///
/// The universal classical evaluator is kept apart because it is always
/// the last resort, whatever the instruction's kind.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    entries: Vec<Capabilities>,
    universal: Capabilities,
}

impl CapabilityTable {
    /// Build a table. Entries are sorted by kind order.
    pub fn new(mut entries: Vec<Capabilities>, universal: Capabilities) -> Self {
        entries.sort_by(|a, b| a.kind.cmp(&b.kind));
        entries.dedup_by(|a, b| a.kind == b.kind);
        Self { entries, universal }
    }

    /// Capabilities of a specific kind. The classical kind resolves to the
    /// universal evaluator.
    pub fn get(&self, kind: &BackendKind) -> Option<&Capabilities> {
        if kind == &self.universal.kind {
            return Some(&self.universal);
        }
        self.entries.iter().find(|c| &c.kind == kind)
    }

    /// Kinds strictly above `kind`, lowest level first.
    pub fn above<'a>(&'a self, kind: &'a BackendKind) -> impl Iterator<Item = &'a Capabilities> {
        self.entries.iter().filter(move |c| c.kind.is_above(kind))
    }

    pub fn universal(&self) -> &Capabilities {
        &self.universal
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capabilities> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_set_classical() {
        let set = InstructionSet::classical();
        assert!(set.contains("add"));
        assert!(set.is_native("add"));
        assert!(!set.contains("h"));
    }

    #[test]
    fn test_instruction_set_is_native() {
        let set = InstructionSet::statevector();
        assert!(set.contains("redim"));
        assert!(!set.is_native("redim"));
        assert!(set.is_native("cx"));
    }

    #[test]
    fn test_intersect_keeps_common_opcodes() {
        let declared = InstructionSet::from_opcodes(["h", "cx", "qft"]);
        let module = InstructionSet::statevector();
        let both = declared.intersect(&module);
        assert!(both.contains("h"));
        assert!(!both.contains("qft"));
    }

    #[test]
    fn test_capability_table_above() {
        let table = CapabilityTable::new(
            vec![
                Capabilities::new(BackendKind::new("annealer", 2), InstructionSet::default()),
                Capabilities::new(BackendKind::quantum(), InstructionSet::statevector()),
            ],
            Capabilities::new(BackendKind::classical(), InstructionSet::classical()),
        );
        let above: Vec<_> = table
            .above(&BackendKind::classical())
            .map(|c| c.kind.name().to_string())
            .collect();
        assert_eq!(above, vec!["quantum", "annealer"]);
        assert!(table.get(&BackendKind::classical()).is_some());
        assert_eq!(table.above(&BackendKind::new("annealer", 2)).count(), 0);
    }
}
