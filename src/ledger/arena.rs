//! Arena of instruction ledgers.
//!
//! Ledgers are addressed by [`LedgerHandle`] (slot index plus generation).
//! Merging two ledgers turns the absorbed slot into a forwarding pointer to
//! the surviving root, union-find style, so values that become mutually
//! dependent share one ledger without reference cycles. Freeing a ledger
//! bumps the generation of every slot in its merged set: old handles are
//! then recognized as resolved instead of aliasing whatever reuses the slot.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CastError, CastResult, Diagnostic};
use crate::kind::BackendKind;
use crate::ledger::instruction::Instruction;
use crate::ledger::state::LedgerState;

/// Identity of a value in the evaluated program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Handle to a ledger slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LedgerHandle {
    index: u32,
    generation: u32,
}

impl LedgerHandle {
    /// Slot index, used as the ledger id in errors and logs.
    pub fn id(&self) -> u32 {
        self.index
    }
}

/// An open ledger: ordered instructions plus bookkeeping.
#[derive(Debug, Clone)]
pub struct Ledger {
    instructions: Vec<Instruction>,
    kinds: BTreeSet<BackendKind>,
    owners: BTreeSet<ValueId>,
    /// Slots merged into this ledger, itself included.
    members: Vec<u32>,
    state: LedgerState,
}

impl Ledger {
    fn new(owner: ValueId, slot: u32) -> Self {
        Self {
            instructions: Vec::new(),
            kinds: BTreeSet::new(),
            owners: BTreeSet::from([owner]),
            members: vec![slot],
            state: LedgerState::Accumulating,
        }
    }

    fn push(&mut self, mut instr: Instruction) -> u64 {
        let seq = self.instructions.len() as u64;
        instr.seq = seq;
        self.kinds.insert(instr.kind.clone());
        self.instructions.push(instr);
        seq
    }

    /// Append every instruction of `other` after ours, renumbering them.
    fn absorb(&mut self, other: Ledger) {
        for instr in other.instructions {
            self.push(instr);
        }
        self.owners.extend(other.owners);
        self.members.extend(other.members);
        self.state = LedgerState::Merged;
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn kinds(&self) -> &BTreeSet<BackendKind> {
        &self.kinds
    }

    pub fn owners(&self) -> &BTreeSet<ValueId> {
        &self.owners
    }

    pub fn state(&self) -> LedgerState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// A ledger drained by a root cast. Owned by the orchestrator until the
/// cast completes.
#[derive(Debug, Clone)]
pub struct FrozenLedger {
    pub id: u32,
    pub instructions: Vec<Instruction>,
    pub kinds: BTreeSet<BackendKind>,
    pub owners: Vec<ValueId>,
}

impl FrozenLedger {
    /// Highest kind referenced by the ledger, the host whose sample the
    /// cast reads.
    ///
    /// Kinds order by `(level, name)`, so among unrelated kinds sharing the
    /// top level the one with the greatest name hosts. The other kinds at
    /// that level still run their own instructions, since fallback only
    /// moves to strictly higher levels.
    pub fn dominant_kind(&self) -> BackendKind {
        self.kinds
            .iter()
            .max()
            .cloned()
            .unwrap_or_else(BackendKind::classical)
    }
}

#[derive(Debug)]
enum Entry {
    Open(Ledger),
    Forward(u32),
    Triggered { members: Vec<u32> },
    Vacant,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Entry,
}

enum Lookup {
    Open(u32),
    Triggered(u32),
    Gone,
}

/// Owner of every ledger in a compilation unit.
#[derive(Debug, Default)]
pub struct LedgerArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl LedgerArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty ledger owned by `owner`.
    pub fn create(&mut self, owner: ValueId) -> LedgerHandle {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Entry::Open(Ledger::new(owner, index));
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Entry::Open(Ledger::new(owner, index)),
                });
                index
            }
        };
        debug!(ledger = index, owner = owner.0, "created ledger");
        self.handle_of(index)
    }

    /// Append an instruction at the tail, returning its sequence number.
    pub fn append(&mut self, handle: LedgerHandle, instr: Instruction) -> CastResult<u64> {
        let root = self.open_root(handle)?;
        let ledger = self
            .open_mut(root)
            .ok_or(CastError::FrozenLedger(handle.index))?;
        Ok(ledger.push(instr))
    }

    /// Merge `b` into `a`. The result holds A's instructions, then B's.
    pub fn merge(&mut self, a: LedgerHandle, b: LedgerHandle) -> CastResult<LedgerHandle> {
        let ra = self.open_root(a)?;
        let rb = self.open_root(b)?;
        if ra == rb {
            return Ok(self.handle_of(ra));
        }

        let absorbed = match std::mem::replace(&mut self.slots[rb as usize].entry, Entry::Forward(ra))
        {
            Entry::Open(ledger) => ledger,
            other => {
                self.slots[rb as usize].entry = other;
                return Err(CastError::FrozenLedger(b.index));
            }
        };
        let added = absorbed.len();
        let target = self
            .open_mut(ra)
            .ok_or(CastError::FrozenLedger(a.index))?;
        target.absorb(absorbed);
        debug!(
            into = ra,
            from = rb,
            added,
            total = target.len(),
            "merged ledgers"
        );
        Ok(self.handle_of(ra))
    }

    /// Register an additional owner of the ledger behind `handle`.
    pub fn add_owner(&mut self, handle: LedgerHandle, owner: ValueId) -> CastResult<()> {
        let root = self.open_root(handle)?;
        let ledger = self
            .open_mut(root)
            .ok_or(CastError::FrozenLedger(handle.index))?;
        ledger.owners.insert(owner);
        Ok(())
    }

    /// Current state. Handles into freed ledgers report `Resolved`.
    pub fn state(&self, handle: LedgerHandle) -> LedgerState {
        match self.lookup(handle) {
            Lookup::Open(root) => match &self.slots[root as usize].entry {
                Entry::Open(ledger) => ledger.state,
                _ => LedgerState::Resolved,
            },
            Lookup::Triggered(_) => LedgerState::Triggered,
            Lookup::Gone => LedgerState::Resolved,
        }
    }

    /// The open ledger behind `handle`, if any.
    pub fn get(&self, handle: LedgerHandle) -> Option<&Ledger> {
        match self.lookup(handle) {
            Lookup::Open(root) => match &self.slots[root as usize].entry {
                Entry::Open(ledger) => Some(ledger),
                _ => None,
            },
            _ => None,
        }
    }

    /// `true` when both handles resolve to the same ledger.
    pub fn same_ledger(&self, a: LedgerHandle, b: LedgerHandle) -> bool {
        match (self.lookup(a), self.lookup(b)) {
            (Lookup::Open(x), Lookup::Open(y)) | (Lookup::Triggered(x), Lookup::Triggered(y)) => {
                x == y
            }
            _ => false,
        }
    }

    /// Freeze and drain the ledger for execution.
    ///
    /// Fails with `DoubleCast` if the ledger was already triggered or freed.
    pub fn trigger(&mut self, handle: LedgerHandle) -> CastResult<FrozenLedger> {
        let root = match self.lookup(handle) {
            Lookup::Open(root) => root,
            Lookup::Triggered(_) | Lookup::Gone => {
                return Err(CastError::DoubleCast(handle.index));
            }
        };
        let slot = &mut self.slots[root as usize];
        let ledger = match std::mem::replace(&mut slot.entry, Entry::Vacant) {
            Entry::Open(ledger) => ledger,
            other => {
                slot.entry = other;
                return Err(CastError::DoubleCast(handle.index));
            }
        };
        slot.entry = Entry::Triggered {
            members: ledger.members,
        };
        debug!(
            ledger = root,
            instructions = ledger.instructions.len(),
            "triggered ledger"
        );
        Ok(FrozenLedger {
            id: root,
            instructions: ledger.instructions,
            kinds: ledger.kinds,
            owners: ledger.owners.into_iter().collect(),
        })
    }

    /// Free a triggered ledger and every slot merged into it.
    ///
    /// Returns the number of slots freed; open ledgers are left untouched.
    pub fn release(&mut self, handle: LedgerHandle) -> usize {
        let Lookup::Triggered(root) = self.lookup(handle) else {
            return 0;
        };
        let members = match std::mem::replace(&mut self.slots[root as usize].entry, Entry::Vacant)
        {
            Entry::Triggered { members } => members,
            other => {
                self.slots[root as usize].entry = other;
                return 0;
            }
        };
        self.free_slots(&members);
        debug!(ledger = root, slots = members.len(), "released ledger");
        members.len()
    }

    /// Drop `owner`'s claim on the ledger. When the last owner of a ledger
    /// that was never triggered goes away, the ledger is freed and an
    /// unused-lazy-value diagnostic is returned.
    pub fn drop_owner(&mut self, handle: LedgerHandle, owner: ValueId) -> Option<Diagnostic> {
        let Lookup::Open(root) = self.lookup(handle) else {
            return None;
        };
        let ledger = self.open_mut(root)?;
        ledger.owners.remove(&owner);
        if !ledger.owners.is_empty() {
            return None;
        }
        self.discard(root, &[owner])
    }

    /// Free every ledger that was never triggered, reporting each one.
    pub fn sweep(&mut self) -> Vec<Diagnostic> {
        let roots: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot.entry, Entry::Open(_)))
            .map(|(i, _)| i as u32)
            .collect();
        let mut diagnostics = Vec::new();
        for root in roots {
            let owners: Vec<u32> = match &self.slots[root as usize].entry {
                Entry::Open(ledger) => ledger.owners.iter().map(|o| o.0).collect(),
                _ => continue,
            };
            let owners: Vec<ValueId> = owners.into_iter().map(ValueId).collect();
            diagnostics.extend(self.discard(root, &owners));
        }
        diagnostics
    }

    /// Number of open ledgers.
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.entry, Entry::Open(_)))
            .count()
    }

    fn discard(&mut self, root: u32, owners: &[ValueId]) -> Option<Diagnostic> {
        let ledger = match std::mem::replace(&mut self.slots[root as usize].entry, Entry::Vacant) {
            Entry::Open(ledger) => ledger,
            other => {
                self.slots[root as usize].entry = other;
                return None;
            }
        };
        let ids: Vec<u32> = owners.iter().map(|o| o.0).collect();
        warn!(
            ledger = root,
            owners = ?ids,
            instructions = ledger.len(),
            "lazy value dropped without a cast"
        );
        self.free_slots(&ledger.members);
        Some(Diagnostic::unused_lazy_value(&ids, ledger.len()))
    }

    fn free_slots(&mut self, members: &[u32]) {
        for &index in members {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.entry = Entry::Vacant;
            self.free.push(index);
        }
    }

    fn handle_of(&self, index: u32) -> LedgerHandle {
        LedgerHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn lookup(&self, handle: LedgerHandle) -> Lookup {
        match self.slots.get(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation => {}
            _ => return Lookup::Gone,
        }
        let mut index = handle.index;
        loop {
            match &self.slots[index as usize].entry {
                Entry::Forward(parent) => index = *parent,
                Entry::Open(_) => return Lookup::Open(index),
                Entry::Triggered { .. } => return Lookup::Triggered(index),
                Entry::Vacant => return Lookup::Gone,
            }
        }
    }

    /// Resolve an open root and compress the forwarding path to it.
    fn open_root(&mut self, handle: LedgerHandle) -> CastResult<u32> {
        let Lookup::Open(root) = self.lookup(handle) else {
            return Err(CastError::FrozenLedger(handle.index));
        };
        let mut index = handle.index;
        while index != root {
            match self.slots[index as usize].entry {
                Entry::Forward(parent) => {
                    self.slots[index as usize].entry = Entry::Forward(root);
                    index = parent;
                }
                _ => break,
            }
        }
        Ok(root)
    }

    fn open_mut(&mut self, root: u32) -> Option<&mut Ledger> {
        match &mut self.slots.get_mut(root as usize)?.entry {
            Entry::Open(ledger) => Some(ledger),
            _ => None,
        }
    }
}
