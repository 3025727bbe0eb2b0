//! Lazy value lifecycle.
//!
//! The ledger state machine:
//!
//! ```text
//!   create ──→ Accumulating ──→ Triggered ──→ Resolved
//!                  │    ▲           ▲
//!                  ▼    │ merge     │ root cast
//!                  Merged ──────────┘
//!                  (self-loop)
//! ```
//!
//! **Invariants:**
//! - A ledger starts `Accumulating`.
//! - `Merged` may recur any number of times; it only pools instructions.
//! - `Triggered` is entered exactly once, by the root cast. No append or
//!   merge is legal afterwards.
//! - `Resolved` follows once the cast protocol completes and the ledger is
//!   freed. Every handle into a resolved ledger keeps reporting `Resolved`.

use serde::{Deserialize, Serialize};

/// State of an instruction ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerState {
    /// Created, collecting instructions.
    Accumulating,
    /// Pooled with at least one other ledger.
    Merged,
    /// Drained by a root cast; owned by the orchestrator.
    Triggered,
    /// Executed and freed.
    Resolved,
}

impl LedgerState {
    /// Check if instructions may still be appended or merged in.
    pub fn is_open(&self) -> bool {
        matches!(self, LedgerState::Accumulating | LedgerState::Merged)
    }

    /// Check if the ledger is frozen (triggered or resolved).
    pub fn is_frozen(&self) -> bool {
        !self.is_open()
    }

    /// Check if this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LedgerState::Resolved)
    }
}

impl std::fmt::Display for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerState::Accumulating => write!(f, "Accumulating"),
            LedgerState::Merged => write!(f, "Merged"),
            LedgerState::Triggered => write!(f, "Triggered"),
            LedgerState::Resolved => write!(f, "Resolved"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_state_open() {
        assert!(LedgerState::Accumulating.is_open());
        assert!(LedgerState::Merged.is_open());
        assert!(LedgerState::Triggered.is_frozen());
        assert!(LedgerState::Resolved.is_frozen());
    }

    #[test]
    fn test_ledger_state_terminal() {
        assert!(!LedgerState::Triggered.is_terminal());
        assert!(LedgerState::Resolved.is_terminal());
    }

    #[test]
    fn test_ledger_state_display() {
        assert_eq!(LedgerState::Merged.to_string(), "Merged");
        assert_eq!(LedgerState::Resolved.to_string(), "Resolved");
    }
}
