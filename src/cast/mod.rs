//! Cast dispatcher.
//!
//! Every cast expression goes through [`CastDispatcher::dispatch`]:
//!
//! ```text
//!   CastRequest ──┬─ Strict source ──→ cast function ───────────────────────→ Value
//!                 ├─ Lazy source ────→ trigger ─→ Lower ─→ Execute ─→ Interpret ─→ Cast ─→ Value
//!                 │                    (ledger freed right after, members settled)
//!                 ├─ Member source ──→ append `cast` to the root ledger ──────→ MemberTicket
//!                 └─ Encode plan ────→ new lazy value starting with `init` ─→ LazyValue
//! ```
//!
//! Plans are compiled before anything runs: a missing cast function, an
//! unknown type or a quantum-to-quantum cast is reported at the cast site,
//! never during execution.

pub mod builtin;
pub mod table;

use std::fmt;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::error::{CastError, CastResult};
use crate::interpret::ResultInterpreter;
use crate::kind::BackendKind;
use crate::ledger::{FrozenLedger, Instruction, LedgerArena, LedgerState, Operand, ValueId};
use crate::orchestrator::{Orchestrator, RunOutput};
use crate::sample::ExecutionSample;
use crate::session::{LazyValue, ValueAllocator};
use crate::types::{TypeName, TypeTable};
use crate::value::Value;

pub use table::{CastChain, CastFunction, CastTable, TransitivityPolicy};

/// Compiled form of one cast site.
#[derive(Debug, Clone)]
pub enum CastPlan {
    /// Run cast functions on a strict value or an interpreted sample.
    Convert {
        from_type: TypeName,
        to_type: TypeName,
        chain: CastChain,
    },
    /// Encode a classical value as a new lazy value.
    Encode {
        from_type: TypeName,
        to_type: TypeName,
        kind: BackendKind,
        width: u32,
    },
}

impl CastPlan {
    pub fn from_type(&self) -> &TypeName {
        match self {
            CastPlan::Convert { from_type, .. } | CastPlan::Encode { from_type, .. } => from_type,
        }
    }

    pub fn to_type(&self) -> &TypeName {
        match self {
            CastPlan::Convert { to_type, .. } | CastPlan::Encode { to_type, .. } => to_type,
        }
    }
}

/// Identity of a cast expression in the evaluated program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub id: u32,
    pub location: Option<String>,
}

impl CallSite {
    pub fn new(id: u32) -> Self {
        Self { id, location: None }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "#{} ({location})", self.id),
            None => write!(f, "#{}", self.id),
        }
    }
}

/// The value being cast.
#[derive(Debug, Clone)]
pub enum SourceValue {
    /// Already evaluated.
    Strict(Value),
    /// Backed by a ledger.
    Lazy(LazyValue),
    /// One member of a composite lazy value.
    Member { root: LazyValue, member: String },
}

impl From<Value> for SourceValue {
    fn from(value: Value) -> Self {
        SourceValue::Strict(value)
    }
}

impl From<LazyValue> for SourceValue {
    fn from(value: LazyValue) -> Self {
        SourceValue::Lazy(value)
    }
}

impl From<&LazyValue> for SourceValue {
    fn from(value: &LazyValue) -> Self {
        SourceValue::Lazy(value.clone())
    }
}

/// Transient context of one cast expression.
#[derive(Debug, Clone)]
pub struct CastRequest {
    pub source: SourceValue,
    pub plan: CastPlan,
    pub site: CallSite,
}

/// Claim on the value of a member cast, settled when the root is cast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberTicket {
    pub ticket: u32,
    pub root: ValueId,
    pub member: String,
    pub to_type: TypeName,
}

/// What a cast expression evaluates to.
#[derive(Debug, Clone)]
pub enum CastOutcome {
    Value(Value),
    Lazy(LazyValue),
    Deferred(MemberTicket),
}

impl CastOutcome {
    pub fn into_value(self) -> Option<Value> {
        match self {
            CastOutcome::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_lazy(self) -> Option<LazyValue> {
        match self {
            CastOutcome::Lazy(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_ticket(self) -> Option<MemberTicket> {
        match self {
            CastOutcome::Deferred(t) => Some(t),
            _ => None,
        }
    }
}

/// Mutable compilation-unit state a dispatch works on.
pub struct DispatchContext<'a> {
    pub arena: &'a mut LedgerArena,
    pub types: &'a TypeTable,
    pub values: &'a mut ValueAllocator,
}

#[derive(Debug)]
struct PendingMember {
    chain: CastChain,
    qubits: Vec<u32>,
}

/// Entry point of every cast expression.
pub struct CastDispatcher {
    table: CastTable,
    interpreter: ResultInterpreter,
    orchestrator: Orchestrator,
    next_ticket: u32,
    pending: FxHashMap<u32, PendingMember>,
    settled: FxHashMap<u32, CastResult<Value>>,
}

impl CastDispatcher {
    pub fn new(table: CastTable, interpreter: ResultInterpreter, orchestrator: Orchestrator) -> Self {
        Self {
            table,
            interpreter,
            orchestrator,
            next_ticket: 0,
            pending: FxHashMap::default(),
            settled: FxHashMap::default(),
        }
    }

    pub fn table(&self) -> &CastTable {
        &self.table
    }

    pub fn interpreter(&self) -> &ResultInterpreter {
        &self.interpreter
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Compile a cast site from `from` to `to`.
    pub fn compile(&self, types: &TypeTable, from: &TypeName, to: &TypeName) -> CastResult<CastPlan> {
        let source = types.require(from)?;
        let target = types.require(to)?;
        for kind in [&source.kind, &target.kind] {
            if !self.orchestrator.plan().contains(kind) {
                return Err(CastError::UnknownBackend(kind.name().to_string()));
            }
        }

        match (source.kind.is_classical(), target.kind.is_classical()) {
            (false, false) => Err(CastError::UnsupportedCast {
                from_type: from.clone(),
                to_type: to.clone(),
            }),
            (true, false) => Ok(CastPlan::Encode {
                from_type: from.clone(),
                to_type: to.clone(),
                kind: target.kind.clone(),
                width: target.width(),
            }),
            _ => Ok(CastPlan::Convert {
                from_type: from.clone(),
                to_type: to.clone(),
                chain: self.table.compile(from, to)?,
            }),
        }
    }

    /// Evaluate a compiled cast.
    pub async fn dispatch(
        &mut self,
        request: CastRequest,
        cx: DispatchContext<'_>,
    ) -> CastResult<CastOutcome> {
        let CastRequest { source, plan, site } = request;
        match plan {
            CastPlan::Encode {
                from_type,
                to_type,
                kind,
                width,
            } => match source {
                SourceValue::Strict(value) => self
                    .encode(value, to_type, kind, width, &site, cx)
                    .map(CastOutcome::Lazy),
                _ => Err(CastError::UnsupportedCast { from_type, to_type }),
            },
            CastPlan::Convert {
                from_type,
                to_type,
                chain,
            } => match source {
                SourceValue::Strict(value) => {
                    if value.type_name() != from_type {
                        return Err(CastError::NoCastFunction {
                            from_type: value.type_name(),
                            to_type,
                        });
                    }
                    debug!(site = %site, from = %from_type, to = %to_type, "strict cast");
                    chain.apply(value).map(CastOutcome::Value)
                }
                SourceValue::Lazy(lazy) => {
                    if lazy.ty != from_type {
                        return Err(CastError::NoCastFunction {
                            from_type: lazy.ty,
                            to_type,
                        });
                    }
                    self.cast_lazy(&lazy, &chain, &site, cx.arena)
                        .await
                        .map(CastOutcome::Value)
                }
                SourceValue::Member { root, member } => self
                    .defer_member(&root, member, &from_type, to_type, chain, cx)
                    .map(CastOutcome::Deferred),
            },
        }
    }

    /// Take the value of a settled member cast. `None` while its root has
    /// not been cast.
    pub fn redeem(&mut self, ticket: &MemberTicket) -> Option<CastResult<Value>> {
        self.settled.remove(&ticket.ticket)
    }

    /// Member casts still waiting for their root.
    pub fn pending_members(&self) -> usize {
        self.pending.len()
    }

    pub async fn shutdown(self) {
        if !self.pending.is_empty() {
            warn!(members = self.pending.len(), "member casts never settled");
        }
        self.orchestrator.shutdown().await;
    }

    async fn cast_lazy(
        &mut self,
        lazy: &LazyValue,
        chain: &CastChain,
        site: &CallSite,
        arena: &mut LedgerArena,
    ) -> CastResult<Value> {
        if matches!(arena.state(lazy.ledger), LedgerState::Triggered | LedgerState::Resolved) {
            return Err(CastError::DoubleCast(lazy.ledger.id()));
        }
        if !lazy.qubits.is_empty() {
            let measure = Instruction::new(lazy.kind.clone(), "measure", qubit_operands(&lazy.qubits));
            arena.append(lazy.ledger, measure)?;
        }

        let frozen = arena.trigger(lazy.ledger)?;
        let tickets = member_tickets(&frozen);
        info!(
            site = %site,
            value = lazy.id.0,
            ledger = frozen.id,
            instructions = frozen.instructions.len(),
            members = tickets.len(),
            to = %chain.path().last().map(TypeName::as_str).unwrap_or_default(),
            "lazy cast triggered"
        );

        let output = self.orchestrator.run(frozen).await;
        arena.release(lazy.ledger);
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                for ticket in tickets {
                    self.pending.remove(&ticket);
                    self.settled.insert(ticket, Err(e.clone()));
                }
                return Err(e);
            }
        };

        self.settle_members(&tickets, &output);
        self.read(&output.sample, &lazy.qubits, chain)
    }

    fn settle_members(&mut self, tickets: &[u32], output: &RunOutput) {
        for &ticket in tickets {
            let Some(pending) = self.pending.remove(&ticket) else {
                continue;
            };
            let result = if output.member_casts.iter().any(|m| m.ticket == ticket) {
                self.read(&output.sample, &pending.qubits, &pending.chain)
            } else {
                Err(CastError::Interpretation {
                    target: pending.chain.first_target().clone(),
                    message: format!("member cast {ticket} did not run"),
                })
            };
            debug!(ticket, ok = result.is_ok(), "settled member cast");
            self.settled.insert(ticket, result);
        }
    }

    /// Interpret the part of `sample` covering `qubits`, then cast it.
    fn read(&self, sample: &ExecutionSample, qubits: &[u32], chain: &CastChain) -> CastResult<Value> {
        let target = chain.first_target();
        let sample = match sample {
            ExecutionSample::Measured(measured) => {
                ExecutionSample::Measured(measured.project(qubits).ok_or_else(|| {
                    CastError::interpretation(target, "sample does not cover the value's qubits")
                })?)
            }
            deterministic => deterministic.clone(),
        };
        let intermediate = self.interpreter.interpret(&sample, target)?;
        chain.apply(intermediate)
    }

    fn defer_member(
        &mut self,
        root: &LazyValue,
        member: String,
        from_type: &TypeName,
        to_type: TypeName,
        chain: CastChain,
        cx: DispatchContext<'_>,
    ) -> CastResult<MemberTicket> {
        let def = cx.types.require(&root.ty)?;
        let slot = def
            .member(&member)
            .ok_or_else(|| CastError::UnknownType(TypeName::from(format!("{}.{member}", root.ty))))?;
        if &slot.ty != from_type {
            return Err(CastError::NoCastFunction {
                from_type: slot.ty.clone(),
                to_type,
            });
        }
        if matches!(cx.arena.state(root.ledger), LedgerState::Triggered | LedgerState::Resolved) {
            return Err(CastError::DoubleCast(root.ledger.id()));
        }

        let start = slot.offset as usize;
        let qubits = root
            .qubits
            .get(start..start + slot.width as usize)
            .ok_or_else(|| CastError::malformed("cast", format!("member {member} lies outside its root")))?
            .to_vec();

        let ticket = self.next_ticket;
        let mut operands = vec![Operand::Int(i64::from(ticket))];
        operands.extend(qubit_operands(&qubits));
        let seq = cx.arena.append(root.ledger, Instruction::classical("cast", operands))?;
        self.next_ticket += 1;
        self.pending.insert(ticket, PendingMember { chain, qubits });
        debug!(ticket, root = root.id.0, member = %member, seq, "member cast deferred");

        Ok(MemberTicket {
            ticket,
            root: root.id,
            member,
            to_type,
        })
    }

    fn encode(
        &mut self,
        value: Value,
        to_type: TypeName,
        kind: BackendKind,
        width: u32,
        site: &CallSite,
        cx: DispatchContext<'_>,
    ) -> CastResult<LazyValue> {
        let overflow = || CastError::Overflow {
            value: value.to_string(),
            target: to_type.clone(),
        };
        let literal = value
            .as_i128()
            .filter(|&v| v >= 0 && (width >= 127 || v < 1i128 << width))
            .and_then(|v| i64::try_from(v).ok())
            .ok_or_else(overflow)?;

        let lazy = cx.values.allocate(cx.arena, to_type.clone(), kind.clone(), width);
        let mut operands = vec![Operand::Int(literal)];
        operands.extend(qubit_operands(&lazy.qubits));
        cx.arena.append(lazy.ledger, Instruction::new(kind, "init", operands))?;
        debug!(site = %site, value = lazy.id.0, to = %to_type, literal, "encoded classical value");
        Ok(lazy)
    }
}

impl fmt::Debug for CastDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CastDispatcher")
            .field("table", &self.table)
            .field("orchestrator", &self.orchestrator)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn qubit_operands(qubits: &[u32]) -> impl Iterator<Item = Operand> + '_ {
    qubits.iter().map(|&q| Operand::Qubit(q))
}

fn member_tickets(ledger: &FrozenLedger) -> Vec<u32> {
    ledger
        .instructions
        .iter()
        .filter(|i| i.opcode == "cast")
        .filter_map(|i| match i.operands.first() {
            Some(Operand::Int(t)) => u32::try_from(*t).ok(),
            _ => None,
        })
        .collect()
}
