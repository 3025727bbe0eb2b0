//! Cast protocol and multi-backend orchestration core.
//!
//! Values of a quantum (or any non-classical) kind are evaluated lazily:
//! operations on them are appended to an instruction ledger instead of
//! running. A cast to a classical type is the only thing that makes a
//! ledger execute:
//!
//! ```text
//!   lazy value ──→ ledger (append, merge) ──→ cast
//!                                              │
//!     Lower ──→ Execute ──→ Interpret ──→ Cast function ──→ Value
//!   (per kind)  (tokio tasks)  (policy)     (table lookup)
//! ```
//!
//! # Overview
//!
//! - [`Session`]: the intermediate-form boundary (lazy values, instructions,
//!   interactions, cast expressions)
//! - [`ledger`]: [`LedgerArena`] with generational handles and merging
//! - [`cast`]: [`CastTable`], compiled [`CastPlan`]s and the [`CastDispatcher`]
//! - [`fallback`]: routing of instructions up the [`BackendKind`] hierarchy
//! - [`orchestrator`]: sub-compiler tasks, scheduling and supervision
//! - [`subcompiler`]: the [`SubCompiler`] contract and the built-in classical
//!   evaluator and state-vector backend
//! - [`interpret`]: per-type interpretation of [`ExecutionSample`]s
//! - [`registry`]: backend descriptors loaded from JSON
//! - [`CastError`] with categorized variants, plus non-fatal [`Diagnostic`]s
//!
//! # Sub-compiler contract
//!
//! ```text
//!   capabilities() ──→ supports() ──→ lower() ──→ execute()
//!    (sync, &ref)        (sync)       (sync)       (async)
//! ```
//!
//! A kind's sub-compiler runs as its own task. The orchestrator talks to
//! it only through request and reply messages.

pub mod capability;
pub mod cast;
pub mod error;
pub mod fallback;
pub mod interpret;
pub mod kind;
pub mod ledger;
pub mod orchestrator;
pub mod registry;
pub mod sample;
pub mod session;
pub mod subcompiler;
pub mod types;
pub mod value;

pub use capability::{Capabilities, CapabilityTable, InstructionSet};
pub use cast::{
    CallSite, CastChain, CastDispatcher, CastOutcome, CastPlan, CastRequest, CastTable,
    MemberTicket, SourceValue, TransitivityPolicy,
};
pub use error::{CastError, CastResult, Diagnostic, DiagnosticKind, Severity};
pub use fallback::{FallbackResolver, Route, RoutingPlan};
pub use interpret::{InterpretPolicy, ResultInterpreter};
pub use kind::BackendKind;
pub use ledger::{
    FrozenLedger, Instruction, Interaction, LedgerArena, LedgerHandle, LedgerState, Operand,
    ValueId,
};
pub use orchestrator::{
    Escalate, Orchestrator, RetryTransient, RunOutput, SpawnPlan, Supervision, SupervisionPolicy,
    Supervisor,
};
pub use registry::{BackendDescriptor, BackendRegistry};
pub use sample::{Counts, ExecutionSample, MeasuredSample};
pub use session::{LazyValue, Session, SessionBuilder};
pub use subcompiler::{ModuleTable, NativeOp, NativeProgram, SubCompiler};
pub use types::{MemberDef, TypeDef, TypeLayout, TypeName, TypeTable};
pub use value::Value;
