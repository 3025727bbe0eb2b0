//! Backend kinds and their hierarchy.
//!
//! A [`BackendKind`] is an extensible tag with a `level`. Kinds are totally
//! ordered by `(level, name)`. A higher level subsumes a lower one, so a
//! composite type mixing classical and quantum members is quantum-kind.
//! Two kinds on the same level with different names are unrelated: fallback
//! never moves sideways between them.
//!
//! ```text
//!   level 1   quantum ─────────┐
//!                              │ subsumes
//!   level 0   classical ◄──────┘   (also the universal fallback)
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the built-in classical kind.
pub const CLASSICAL: &str = "classical";
/// Name of the built-in quantum kind.
pub const QUANTUM: &str = "quantum";

/// A class of execution target with its own instruction set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendKind {
    name: String,
    level: u32,
}

impl BackendKind {
    /// Create a kind with an explicit hierarchy level.
    pub fn new(name: impl Into<String>, level: u32) -> Self {
        Self {
            name: name.into(),
            level,
        }
    }

    /// The classical kind, bottom of the hierarchy.
    pub fn classical() -> Self {
        Self::new(CLASSICAL, 0)
    }

    /// The quantum kind.
    pub fn quantum() -> Self {
        Self::new(QUANTUM, 1)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_classical(&self) -> bool {
        self.level == 0 && self.name == CLASSICAL
    }

    /// `true` if `self` sits strictly above `other` in the hierarchy.
    pub fn is_above(&self, other: &BackendKind) -> bool {
        self.level > other.level
    }

    /// `true` if `self` may hold instructions of `other`: itself or any
    /// strictly lower level.
    pub fn subsumes(&self, other: &BackendKind) -> bool {
        self == other || self.is_above(other)
    }

    /// The higher of two kinds. Ties on level keep `self`.
    pub fn join(&self, other: &BackendKind) -> BackendKind {
        if other.is_above(self) {
            other.clone()
        } else {
            self.clone()
        }
    }
}

impl Ord for BackendKind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.level
            .cmp(&other.level)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for BackendKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
