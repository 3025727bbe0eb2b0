//! Fallback resolver.
//!
//! Decides which sub-compiler executes each instruction of a ledger. The
//! host is the ledger's dominant kind. For one instruction, in order:
//!
//! 1. **Embedded**: the instruction's kind is subordinate to the host and
//!    the host supports the opcode.
//! 2. **Native**: the instruction's own kind supports it.
//! 3. **Escalated**: the first strictly higher kind that supports it,
//!    lowest level first. Kinds on the same level are never tried.
//! 4. **Universal**: the classical evaluator supports it.
//!
//! Otherwise lowering fails with `UnsupportedInstruction`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::CapabilityTable;
use crate::error::{CastError, CastResult};
use crate::kind::BackendKind;
use crate::ledger::Instruction;

/// How an instruction found its executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    Embedded,
    Native,
    Escalated,
    Universal,
}

/// Executor chosen for one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub seq: u64,
    pub opcode: String,
    pub declared: BackendKind,
    pub executor: BackendKind,
    pub route: Route,
}

/// Executor of every instruction of a ledger, in sequence order.
#[derive(Debug, Clone)]
pub struct RoutingPlan {
    pub host: BackendKind,
    pub assignments: Vec<Assignment>,
}

impl RoutingPlan {
    /// Split instructions by executor. Each group keeps sequence order.
    pub fn partition(&self, instructions: &[Instruction]) -> BTreeMap<BackendKind, Vec<Instruction>> {
        let mut groups: BTreeMap<BackendKind, Vec<Instruction>> = BTreeMap::new();
        for (instr, assignment) in instructions.iter().zip(&self.assignments) {
            groups
                .entry(assignment.executor.clone())
                .or_default()
                .push(instr.clone());
        }
        groups
    }

    /// Number of instructions that left their declared kind.
    pub fn fallbacks(&self) -> usize {
        self.assignments
            .iter()
            .filter(|a| a.executor != a.declared)
            .count()
    }
}

/// Resolver over the capabilities of the spawned sub-compilers.
#[derive(Debug, Clone, Copy)]
pub struct FallbackResolver<'a> {
    table: &'a CapabilityTable,
}

impl<'a> FallbackResolver<'a> {
    pub fn new(table: &'a CapabilityTable) -> Self {
        Self { table }
    }

    /// Pick the executor of one instruction in a ledger hosted by `host`.
    pub fn resolve(&self, instr: &Instruction, host: &BackendKind) -> CastResult<(BackendKind, Route)> {
        let opcode = instr.opcode.as_str();
        let declared = &instr.kind;

        if host.is_above(declared)
            && self.table.get(host).is_some_and(|c| c.supports(opcode))
        {
            return Ok((host.clone(), Route::Embedded));
        }
        if self.table.get(declared).is_some_and(|c| c.supports(opcode)) {
            return Ok((declared.clone(), Route::Native));
        }
        if let Some(higher) = self.table.above(declared).find(|c| c.supports(opcode)) {
            return Ok((higher.kind.clone(), Route::Escalated));
        }
        let universal = self.table.universal();
        if universal.supports(opcode) {
            return Ok((universal.kind.clone(), Route::Universal));
        }
        Err(CastError::UnsupportedInstruction {
            opcode: opcode.to_string(),
            kind: declared.clone(),
        })
    }

    /// Route every instruction of a ledger.
    pub fn plan(&self, instructions: &[Instruction], host: &BackendKind) -> CastResult<RoutingPlan> {
        let assignments = instructions
            .iter()
            .map(|instr| {
                let (executor, route) = self.resolve(instr, host)?;
                if route != Route::Native && route != Route::Embedded {
                    debug!(
                        seq = instr.seq,
                        opcode = %instr.opcode,
                        declared = %instr.kind,
                        executor = %executor,
                        ?route,
                        "instruction delegated"
                    );
                }
                Ok(Assignment {
                    seq: instr.seq,
                    opcode: instr.opcode.clone(),
                    declared: instr.kind.clone(),
                    executor,
                    route,
                })
            })
            .collect::<CastResult<Vec<_>>>()?;
        Ok(RoutingPlan {
            host: host.clone(),
            assignments,
        })
    }
}
