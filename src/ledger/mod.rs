//! Instruction ledgers for lazy (quantum-kind) values.
//!
//! - [`instruction`]: backend-tagged instructions and operands
//! - [`state`]: the lazy value state machine
//! - [`arena`]: generational arena owning every ledger
//! - [`merge`]: pooling of ledgers whose values interact

pub mod arena;
pub mod instruction;
pub mod merge;
pub mod state;

pub use arena::{FrozenLedger, Ledger, LedgerArena, LedgerHandle, ValueId};
pub use instruction::{Instruction, Operand};
pub use merge::Interaction;
pub use state::LedgerState;
