//! Type names and layouts.
//!
//! The core does not type-check programs. It only needs to know, for each
//! type name, which backend kind owns it and how wide it is, so that lazy
//! values can be given qubits and measured samples can be projected onto a
//! value or one of its members.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CastError, CastResult};
use crate::kind::BackendKind;

/// Name of a type, e.g. `u32`, `@u3`, `sample`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeName(String);

impl TypeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quantum type names carry the `@` prefix.
    pub fn is_quantum(&self) -> bool {
        self.0.starts_with('@')
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TypeName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TypeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A named member of a composite type, with its slice of the parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDef {
    pub name: String,
    pub ty: TypeName,
    /// First bit (or qubit) of the member inside the parent.
    pub offset: u32,
    pub width: u32,
}

/// Storage layout of a type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeLayout {
    /// Single value of `width` bits (classical) or qubits (quantum).
    Scalar { width: u32 },
    /// Ordered members, laid out back to back.
    Composite { members: Vec<MemberDef> },
}

/// Definition of a type known to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: TypeName,
    pub kind: BackendKind,
    pub layout: TypeLayout,
}

impl TypeDef {
    pub fn scalar(name: impl Into<TypeName>, kind: BackendKind, width: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            layout: TypeLayout::Scalar { width },
        }
    }

    /// Total width in bits or qubits.
    pub fn width(&self) -> u32 {
        match &self.layout {
            TypeLayout::Scalar { width } => *width,
            TypeLayout::Composite { members } => members.iter().map(|m| m.width).sum(),
        }
    }

    pub fn member(&self, name: &str) -> Option<&MemberDef> {
        match &self.layout {
            TypeLayout::Scalar { .. } => None,
            TypeLayout::Composite { members } => members.iter().find(|m| m.name == name),
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.layout, TypeLayout::Composite { .. })
    }
}

/// Table of every type the core can cast from or to.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    types: FxHashMap<TypeName, TypeDef>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in classical scalars and the quantum unsigned types.
    pub fn builtin() -> Self {
        let classical = BackendKind::classical();
        let quantum = BackendKind::quantum();
        let mut table = Self::new();
        for (name, width) in [
            ("bool", 1),
            ("int", 64),
            ("float", 64),
            ("u32", 32),
            ("u64", 64),
            ("i32", 32),
            ("i64", 64),
            ("f32", 32),
            ("f64", 64),
            ("sample", 0),
        ] {
            table.insert(TypeDef::scalar(name, classical.clone(), width));
        }
        for (name, width) in [("@bool", 1), ("@u2", 2), ("@u3", 3), ("@u4", 4)] {
            table.insert(TypeDef::scalar(name, quantum.clone(), width));
        }
        table
    }

    /// Register or replace a type.
    pub fn insert(&mut self, def: TypeDef) {
        self.types.insert(def.name.clone(), def);
    }

    /// Define a composite type from `(member, type)` pairs.
    ///
    /// The composite takes the highest kind among its members.
    pub fn define_composite(
        &mut self,
        name: impl Into<TypeName>,
        members: &[(&str, &str)],
    ) -> CastResult<&TypeDef> {
        let name = name.into();
        let mut kind = BackendKind::classical();
        let mut offset = 0;
        let mut defs = Vec::with_capacity(members.len());

        for (member, ty) in members {
            let ty = TypeName::from(*ty);
            let def = self.require(&ty)?;
            kind = kind.join(&def.kind);
            let width = def.width();
            defs.push(MemberDef {
                name: (*member).to_string(),
                ty,
                offset,
                width,
            });
            offset += width;
        }

        self.insert(TypeDef {
            name: name.clone(),
            kind,
            layout: TypeLayout::Composite { members: defs },
        });
        self.require(&name)
    }

    pub fn get(&self, name: &TypeName) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// Look up a type, failing with `UnknownType`.
    pub fn require(&self, name: &TypeName) -> CastResult<&TypeDef> {
        self.get(name)
            .ok_or_else(|| CastError::UnknownType(name.clone()))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types() {
        let table = TypeTable::builtin();
        let qu3 = table.get(&"@u3".into()).unwrap();
        assert_eq!(qu3.kind, BackendKind::quantum());
        assert_eq!(qu3.width(), 3);
        assert!(qu3.name.is_quantum());
        assert!(!table.get(&"u32".into()).unwrap().name.is_quantum());
    }

    #[test]
    fn test_composite_takes_highest_kind() {
        let mut table = TypeTable::builtin();
        let pair = table
            .define_composite("pair_t", &[("flag", "bool"), ("q", "@u2")])
            .unwrap();
        assert_eq!(pair.kind, BackendKind::quantum());
        assert_eq!(pair.width(), 3);
        let q = pair.member("q").unwrap();
        assert_eq!((q.offset, q.width), (1, 2));
    }

    #[test]
    fn test_composite_unknown_member_type() {
        let mut table = TypeTable::builtin();
        let err = table
            .define_composite("bad_t", &[("x", "@u9")])
            .unwrap_err();
        assert!(matches!(err, CastError::UnknownType(t) if t.as_str() == "@u9"));
    }
}
