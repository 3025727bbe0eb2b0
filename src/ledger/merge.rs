//! Ledger merge engine.
//!
//! Lazy values that interact through a call, a branch test or a pattern
//! match become evaluation-dependent: they must be measured together. The
//! merge engine pools their ledgers into one, in discovery order, so that a
//! single cast later triggers all of them.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CastResult;
use crate::ledger::arena::{LedgerArena, LedgerHandle};

/// How lazy values came to depend on each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interaction {
    /// Passed together as arguments of one call.
    Call,
    /// Tested together in a branch condition.
    Branch,
    /// Scrutinized together by a pattern match.
    Match,
}

impl LedgerArena {
    /// Pool the ledgers of interacting lazy values.
    ///
    /// Ledgers are folded left to right, so the merged ledger lists the
    /// first value's instructions first. Returns the surviving handle, or
    /// `None` if nothing was merged (fewer than two values, or the caller
    /// proved them independent).
    pub fn interact(
        &mut self,
        interaction: Interaction,
        values: &[LedgerHandle],
        provably_independent: bool,
    ) -> CastResult<Option<LedgerHandle>> {
        if provably_independent || values.len() < 2 {
            return Ok(None);
        }

        let mut root = values[0];
        for &next in &values[1..] {
            root = self.merge(root, next)?;
        }
        debug!(?interaction, values = values.len(), ledger = root.id(), "interaction merged ledgers");
        Ok(Some(root))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::ledger::arena::ValueId;
    use crate::ledger::instruction::{Instruction, Operand};
    use crate::ledger::state::LedgerState;

    fn tagged(tag: i64) -> Instruction {
        Instruction::classical("const", [Operand::reg("t"), Operand::Int(tag)])
    }

    fn tags(arena: &LedgerArena, handle: LedgerHandle) -> Vec<i64> {
        arena
            .get(handle)
            .unwrap()
            .instructions()
            .iter()
            .map(|i| match i.operands[1] {
                Operand::Int(v) => v,
                _ => -1,
            })
            .collect()
    }

    #[test]
    fn test_branch_interaction_merges() {
        let mut arena = LedgerArena::new();
        let a = arena.create(ValueId(1));
        let b = arena.create(ValueId(2));
        arena.append(a, tagged(1)).unwrap();
        arena.append(b, tagged(2)).unwrap();

        let merged = arena.interact(Interaction::Branch, &[a, b], false).unwrap();
        assert!(merged.is_some());
        assert!(arena.same_ledger(a, b));
        assert_eq!(arena.state(b), LedgerState::Merged);
    }

    #[test]
    fn test_independent_values_stay_apart() {
        let mut arena = LedgerArena::new();
        let a = arena.create(ValueId(1));
        let b = arena.create(ValueId(2));

        let merged = arena.interact(Interaction::Call, &[a, b], true).unwrap();
        assert!(merged.is_none());
        assert!(!arena.same_ledger(a, b));
    }

    #[test]
    fn test_interaction_with_three_values() {
        let mut arena = LedgerArena::new();
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let h = arena.create(ValueId(i));
                arena.append(h, tagged(i64::from(i))).unwrap();
                h
            })
            .collect();

        let root = arena.interact(Interaction::Match, &handles, false).unwrap().unwrap();
        assert_eq!(tags(&arena, root), vec![0, 1, 2]);
    }

    proptest! {
        #[test]
        fn prop_merge_concatenates_in_order(a_len in 0usize..12, b_len in 0usize..12) {
            let mut arena = LedgerArena::new();
            let a = arena.create(ValueId(1));
            let b = arena.create(ValueId(2));
            for i in 0..a_len {
                arena.append(a, tagged(i as i64)).unwrap();
            }
            for i in 0..b_len {
                arena.append(b, tagged(100 + i as i64)).unwrap();
            }

            let merged = arena.merge(a, b).unwrap();
            let got = tags(&arena, merged);
            let expected: Vec<i64> = (0..a_len as i64)
                .chain((0..b_len as i64).map(|i| 100 + i))
                .collect();

            prop_assert_eq!(got.len(), a_len + b_len);
            prop_assert_eq!(got, expected);
            let seqs: Vec<u64> = arena.get(merged).unwrap().instructions().iter().map(|i| i.seq).collect();
            prop_assert_eq!(seqs, (0..(a_len + b_len) as u64).collect::<Vec<_>>());
        }

        #[test]
        fn prop_trigger_twice_is_double_cast(n in 0usize..6) {
            let mut arena = LedgerArena::new();
            let a = arena.create(ValueId(1));
            for i in 0..n {
                arena.append(a, tagged(i as i64)).unwrap();
            }
            prop_assert!(arena.trigger(a).is_ok());
            arena.release(a);
            prop_assert_eq!(arena.state(a), LedgerState::Resolved);
            prop_assert!(arena.trigger(a).is_err());
            prop_assert_eq!(arena.state(a), LedgerState::Resolved);
        }
    }
}
