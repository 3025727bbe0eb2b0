//! Orchestrator.
//!
//! Owns the sub-compiler tasks and moves every instruction batch and sample
//! between them and the cast dispatcher.
//!
//! ```text
//!                    ┌──────────── Orchestrator ────────────┐
//!   FrozenLedger ──→ │ route ─→ lower ─→ schedule by seq     │
//!                    │   classical ops: in-process evaluator │
//!                    │   other ops: Stage ─→ mpsc ─→ task    │ ──→ ExecutionSample
//!                    │ Execute (supervised) on kind switch   │
//!                    └───────────────────────────────────────┘
//! ```
//!
//! The set of tasks is fixed when the orchestrator starts, from a
//! [`SpawnPlan`] computed at compile time. Classical segments see every
//! register written before them. A quantum segment is bound against the
//! registers at the point where it appears, so a gate conditioned on a
//! classical value folded into the ledger observes exactly that value.
//!
//! Calls across non-classical kinds are serialized in sequence order. A
//! kind's staged segments accumulate while only classical ops come
//! between them, and run when the schedule moves to another non-classical
//! kind or ends. The sample of the host's last run is the ledger's sample.

pub mod message;
pub mod supervisor;
mod worker;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capability::{Capabilities, CapabilityTable};
use crate::error::{CastError, CastResult};
use crate::fallback::FallbackResolver;
use crate::kind::BackendKind;
use crate::ledger::{FrozenLedger, Instruction};
use crate::registry::BackendRegistry;
use crate::sample::ExecutionSample;
use crate::subcompiler::{ClassicalEvaluator, EvalState, MemberCast, ModuleTable, NativeOp, NativeProgram, SubCompiler};

use message::{Envelope, Request, Response, SessionId};
pub use supervisor::{Escalate, RetryTransient, Supervision, SupervisionPolicy, Supervisor};
use worker::Worker;

const CHANNEL_CAPACITY: usize = 32;

/// Kinds to instantiate, in spawn order.
///
/// Holds every referenced kind plus every kind above one of them, since
/// fallback may escalate there. The classical kind is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPlan {
    kinds: Vec<BackendKind>,
}

impl SpawnPlan {
    /// Compute the plan for the kinds a program references.
    ///
    /// Fails with `UnknownBackend` when a kind is not registered.
    pub fn compute(
        registry: &BackendRegistry,
        referenced: impl IntoIterator<Item = BackendKind>,
    ) -> CastResult<Self> {
        let mut kinds = BTreeSet::from([registry.classical().kind()]);
        for kind in referenced {
            registry.require(&kind)?;
            kinds.extend(registry.kinds().into_iter().filter(|k| k.is_above(&kind)));
            kinds.insert(kind);
        }
        let plan = Self {
            kinds: kinds.into_iter().collect(),
        };
        debug!(kinds = ?plan.names(), "computed spawn plan");
        Ok(plan)
    }

    /// Plan covering every registered kind.
    pub fn all(registry: &BackendRegistry) -> Self {
        Self {
            kinds: registry.kinds(),
        }
    }

    pub fn kinds(&self) -> &[BackendKind] {
        &self.kinds
    }

    pub fn contains(&self, kind: &BackendKind) -> bool {
        self.kinds.contains(kind)
    }

    fn names(&self) -> Vec<&str> {
        self.kinds.iter().map(BackendKind::name).collect()
    }
}

/// Result of executing one ledger.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Sample handed to the result interpreter.
    pub sample: ExecutionSample,
    /// Member casts recorded while the ledger ran.
    pub member_casts: Vec<MemberCast>,
}

struct Handle {
    tx: mpsc::Sender<Envelope>,
    task: JoinHandle<()>,
}

/// Owner of the sub-compiler tasks of one compilation unit.
pub struct Orchestrator {
    plan: SpawnPlan,
    classical: ClassicalEvaluator,
    capabilities: CapabilityTable,
    workers: BTreeMap<BackendKind, Handle>,
    supervisor: Supervisor,
    next_session: SessionId,
}

impl Orchestrator {
    /// Instantiate and spawn the sub-compilers named by `plan`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        registry: &BackendRegistry,
        modules: &ModuleTable,
        plan: SpawnPlan,
        supervisor: Supervisor,
    ) -> CastResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CastError::Configuration("the orchestrator must start inside a tokio runtime".into())
        })?;

        let classical = ClassicalEvaluator::from_descriptor(registry.classical());
        let mut capabilities = Vec::new();
        let mut workers = BTreeMap::new();
        for kind in plan.kinds().iter().filter(|k| !k.is_classical()) {
            let descriptor = registry.require(kind)?;
            let compiler: Arc<dyn SubCompiler> = Arc::from(modules.instantiate(descriptor)?);
            capabilities.push(Capabilities {
                kind: kind.clone(),
                ..compiler.capabilities().clone()
            });

            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            let task = runtime.spawn(Worker::new(kind.clone(), compiler, rx).run());
            workers.insert(kind.clone(), Handle { tx, task });
        }

        let capabilities = CapabilityTable::new(capabilities, classical.capabilities().clone());
        info!(kinds = ?plan.names(), policy = ?supervisor.policy(), "orchestrator started");
        Ok(Self {
            plan,
            classical,
            capabilities,
            workers,
            supervisor,
            next_session: 0,
        })
    }

    pub fn plan(&self) -> &SpawnPlan {
        &self.plan
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Lower, schedule and execute a triggered ledger.
    pub async fn run(&mut self, ledger: FrozenLedger) -> CastResult<RunOutput> {
        let host = ledger.dominant_kind();
        if let Some(missing) = ledger.kinds.iter().find(|k| !self.plan.contains(k)) {
            return Err(CastError::UnknownBackend(missing.name().to_string()));
        }

        let routing = FallbackResolver::new(&self.capabilities).plan(&ledger.instructions, &host)?;
        let mut programs = Vec::new();
        for (kind, batch) in routing.partition(&ledger.instructions) {
            programs.push(self.lower(&kind, batch).await?);
        }
        let schedule = schedule(programs);

        let session = self.next_session;
        self.next_session += 1;
        debug!(
            ledger = ledger.id,
            session,
            %host,
            instructions = ledger.instructions.len(),
            ops = schedule.len(),
            fallbacks = routing.fallbacks(),
            "running ledger"
        );

        let mut staged = Vec::new();
        let result = self.drive(session, schedule, &mut staged).await;
        for kind in &staged {
            if let Some(handle) = self.workers.get(kind) {
                // A crashed task has nothing left to close.
                let _ = message::call(&handle.tx, kind, Request::Close { session }).await;
            }
        }
        let (state, mut samples) = result?;

        let chosen = samples
            .iter()
            .rposition(|(kind, _)| *kind == host)
            .or_else(|| samples.len().checked_sub(1));
        let sample = match chosen {
            Some(index) => {
                let (kind, sample) = samples.swap_remove(index);
                if kind != host {
                    debug!(session, %host, executor = %kind, "host ran nothing; using last executed kind");
                }
                sample
            }
            None => ExecutionSample::Deterministic {
                value: state.last,
                registers: state.registers,
            },
        };
        Ok(RunOutput {
            sample,
            member_casts: state.member_casts,
        })
    }

    /// Stop every task and wait for them to finish.
    pub async fn shutdown(self) {
        for (kind, handle) in self.workers {
            if let Err(e) = message::call(&handle.tx, &kind, Request::Shutdown).await {
                debug!(%kind, error = %e, "task already gone at shutdown");
            }
            drop(handle.tx);
            if let Err(e) = handle.task.await {
                warn!(%kind, error = %e, "sub-compiler task ended abnormally");
            }
        }
        info!("orchestrator stopped");
    }

    async fn lower(&self, kind: &BackendKind, batch: Vec<Instruction>) -> CastResult<NativeProgram> {
        if kind.is_classical() {
            return self.classical.lower(&batch);
        }
        let handle = self.handle(kind)?;
        match message::call(&handle.tx, kind, Request::Lower { instructions: batch }).await? {
            Response::Lowered(program) => Ok(program),
            other => Err(message::unexpected(kind, "lower", &other)),
        }
    }

    /// Walk the schedule, evaluating classical ops and staging the rest.
    /// Staged work of a kind runs before the first op of the next
    /// non-classical kind. Samples come back in execution order.
    async fn drive(
        &self,
        session: SessionId,
        schedule: Vec<(BackendKind, NativeOp)>,
        staged: &mut Vec<BackendKind>,
    ) -> CastResult<(EvalState, Vec<(BackendKind, ExecutionSample)>)> {
        let mut state = EvalState::new();
        let mut segment: Option<NativeProgram> = None;
        let mut pending: Option<BackendKind> = None;
        let mut samples = Vec::new();

        for (kind, op) in schedule {
            if kind.is_classical() {
                if let Some(program) = segment.take() {
                    self.stage(session, program, &state, staged).await?;
                }
                self.classical.step(&op, &mut state)?;
                continue;
            }
            if segment.as_ref().is_none_or(|p| p.kind != kind) {
                if let Some(program) = segment.take() {
                    self.stage(session, program, &state, staged).await?;
                }
                if let Some(previous) = pending.take_if(|p| *p != kind) {
                    samples.push(self.execute(session, previous).await?);
                }
                pending = Some(kind.clone());
                segment = Some(NativeProgram::new(kind));
            }
            if let Some(program) = segment.as_mut() {
                program.push(op);
            }
        }
        if let Some(program) = segment.take() {
            self.stage(session, program, &state, staged).await?;
        }
        if let Some(last) = pending.take() {
            samples.push(self.execute(session, last).await?);
        }
        Ok((state, samples))
    }

    /// Run what `kind` has staged for `session`, under supervision.
    async fn execute(
        &self,
        session: SessionId,
        kind: BackendKind,
    ) -> CastResult<(BackendKind, ExecutionSample)> {
        let handle = self.handle(&kind)?;
        let sample = self.supervisor.execute(&handle.tx, &kind, session).await?;
        debug!(%kind, session, measured = sample.is_measured(), "executed segment");
        Ok((kind, sample))
    }

    async fn stage(
        &self,
        session: SessionId,
        program: NativeProgram,
        state: &EvalState,
        staged: &mut Vec<BackendKind>,
    ) -> CastResult<()> {
        let kind = program.kind.clone();
        let bound = program.bind(&state.registers)?;
        let handle = self.handle(&kind)?;
        if !staged.contains(&kind) {
            staged.push(kind.clone());
        }
        match message::call(&handle.tx, &kind, Request::Stage { session, program: bound }).await? {
            Response::Staged { ops } => {
                debug!(%kind, session, ops, "staged segment");
                Ok(())
            }
            other => Err(message::unexpected(&kind, "stage", &other)),
        }
    }

    fn handle(&self, kind: &BackendKind) -> CastResult<&Handle> {
        self.workers
            .get(kind)
            .ok_or_else(|| CastError::UnknownBackend(kind.name().to_string()))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("plan", &self.plan)
            .field("supervisor", &self.supervisor)
            .field("next_session", &self.next_session)
            .finish_non_exhaustive()
    }
}

/// Merge lowered programs into one stream ordered by sequence number.
/// Ops lowered from the same instruction keep their relative order.
fn schedule(programs: Vec<NativeProgram>) -> Vec<(BackendKind, NativeOp)> {
    let mut ops: Vec<(BackendKind, NativeOp)> = programs
        .into_iter()
        .flat_map(|p| {
            let kind = p.kind;
            p.ops.into_iter().map(move |op| (kind.clone(), op))
        })
        .collect();
    ops.sort_by_key(|(_, op)| op.seq);
    ops
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::capability::InstructionSet;
    use crate::ledger::{LedgerArena, Operand, ValueId};
    use crate::registry::BackendDescriptor;
    use crate::sample::{Counts, MeasuredSample};
    use crate::value::Value;

    const RECORDER_MODULE: &str = "test:recorder";

    type RunLog = Arc<Mutex<Vec<(String, Vec<u64>)>>>;

    /// Logs every executed program as its kind and op sequence numbers.
    struct Recorder {
        capabilities: Capabilities,
        log: RunLog,
        deterministic: bool,
    }

    #[async_trait]
    impl SubCompiler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn capabilities(&self) -> &Capabilities {
            &self.capabilities
        }

        fn lower(&self, instructions: &[Instruction]) -> CastResult<NativeProgram> {
            let mut program = NativeProgram::new(self.capabilities.kind.clone());
            for instr in instructions {
                program.push(NativeOp::new(
                    instr.seq,
                    instr.opcode.as_str(),
                    instr.qubits().map(Operand::Qubit),
                ));
            }
            Ok(program)
        }

        async fn execute(&self, program: &NativeProgram) -> CastResult<ExecutionSample> {
            let seqs = program.ops.iter().map(|op| op.seq).collect();
            self.log
                .lock()
                .unwrap()
                .push((self.capabilities.kind.name().to_string(), seqs));
            if self.deterministic {
                return Ok(ExecutionSample::Deterministic {
                    value: Some(Value::Bits { value: 1, width: 1 }),
                    registers: BTreeMap::new(),
                });
            }
            let mut counts = Counts::new();
            counts.insert("1", 8);
            Ok(ExecutionSample::Measured(MeasuredSample::new(counts, 8, vec![0])))
        }
    }

    /// `quantum` runs `a c measure`; `upper` sits one level above and only
    /// knows `b`.
    fn start_recording(deterministic: bool) -> (Orchestrator, RunLog) {
        let recorder = |name: &str, level: u32, opcodes: &[&str]| BackendDescriptor {
            name: name.into(),
            level,
            instructions: InstructionSet::from_opcodes(opcodes.iter().copied()),
            module: RECORDER_MODULE.into(),
            passes: vec![],
            metadata: serde_json::Value::Null,
        };
        let registry = BackendRegistry::new([
            BackendDescriptor::classical(),
            recorder("quantum", 1, &["a", "c", "measure"]),
            recorder("upper", 2, &["b"]),
        ])
        .unwrap();

        let log = RunLog::default();
        let shared = log.clone();
        let mut modules = ModuleTable::builtin();
        modules.register(RECORDER_MODULE, move |d| {
            Ok(Box::new(Recorder {
                capabilities: Capabilities::new(d.kind(), d.instructions.clone()),
                log: shared.clone(),
                deterministic,
            }) as Box<dyn SubCompiler>)
        });
        let plan = SpawnPlan::compute(&registry, [BackendKind::quantum()]).unwrap();
        let orchestrator = Orchestrator::start(&registry, &modules, plan, Supervisor::default()).unwrap();
        (orchestrator, log)
    }

    fn runs(log: &RunLog) -> Vec<(String, Vec<u64>)> {
        log.lock().unwrap().clone()
    }

    fn frozen(instrs: Vec<Instruction>) -> FrozenLedger {
        let mut arena = LedgerArena::new();
        let handle = arena.create(ValueId(0));
        for instr in instrs {
            arena.append(handle, instr).unwrap();
        }
        arena.trigger(handle).unwrap()
    }

    fn start() -> Orchestrator {
        let registry = BackendRegistry::builtin();
        let plan = SpawnPlan::compute(&registry, [BackendKind::quantum()]).unwrap();
        Orchestrator::start(&registry, &ModuleTable::builtin(), plan, Supervisor::default()).unwrap()
    }

    #[test]
    fn test_spawn_plan_includes_higher_kinds() {
        let registry = BackendRegistry::new([
            BackendDescriptor::classical(),
            BackendDescriptor::statevector(),
            BackendDescriptor {
                name: "annealer".into(),
                level: 2,
                ..BackendDescriptor::statevector()
            },
        ])
        .unwrap();
        let plan = SpawnPlan::compute(&registry, [BackendKind::classical()]).unwrap();
        let names: Vec<_> = plan.kinds().iter().map(|k| k.name().to_string()).collect();
        assert_eq!(names, vec!["classical", "quantum", "annealer"]);
    }

    #[test]
    fn test_spawn_plan_unknown_kind() {
        let registry = BackendRegistry::builtin();
        let err = SpawnPlan::compute(&registry, [BackendKind::new("photonic", 1)]).unwrap_err();
        assert!(matches!(err, CastError::UnknownBackend(ref name) if name == "photonic"));
    }

    #[test]
    fn test_schedule_orders_by_sequence() {
        let mut q = NativeProgram::new(BackendKind::quantum());
        q.push(NativeOp::new(0, "x", [Operand::Qubit(0)]));
        q.push(NativeOp::new(0, "x", [Operand::Qubit(1)]));
        q.push(NativeOp::new(2, "h", [Operand::Qubit(0)]));
        let mut c = NativeProgram::new(BackendKind::classical());
        c.push(NativeOp::new(1, "const", [Operand::reg("a"), Operand::Int(1)]));

        let seqs: Vec<_> = schedule(vec![c, q]).iter().map(|(_, op)| op.seq).collect();
        assert_eq!(seqs, vec![0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_run_measures_quantum_ledger() {
        let mut orchestrator = start();
        let ledger = frozen(vec![
            Instruction::quantum("init", [Operand::Int(2), Operand::Qubit(0), Operand::Qubit(1)]),
            Instruction::quantum("measure", [Operand::Qubit(0), Operand::Qubit(1)]),
        ]);
        let output = orchestrator.run(ledger).await.unwrap();
        let measured = output.sample.as_measured().unwrap();
        assert_eq!(measured.counts.get("10"), measured.shots as u64);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_classical_value_folded_into_quantum_segment() {
        let mut orchestrator = start();
        let ledger = frozen(vec![
            Instruction::classical("const", [Operand::reg("a"), Operand::Int(3)]),
            Instruction::classical("lt", [Operand::reg("c"), Operand::Int(1), Operand::reg("a")]),
            Instruction::quantum("x_if", [Operand::reg("c"), Operand::Qubit(0)]),
            Instruction::classical("eq", [Operand::reg("c"), Operand::reg("a"), Operand::Int(0)]),
            Instruction::quantum("x_if", [Operand::reg("c"), Operand::Qubit(1)]),
            Instruction::quantum("measure", [Operand::Qubit(0), Operand::Qubit(1)]),
        ]);
        let output = orchestrator.run(ledger).await.unwrap();
        let measured = output.sample.as_measured().unwrap();
        // q0 flipped (1 < 3), q1 untouched (3 != 0).
        assert_eq!(measured.counts.get("01"), measured.shots as u64);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_classical_only_ledger_is_deterministic() {
        let mut orchestrator = start();
        let ledger = frozen(vec![
            Instruction::classical("const", [Operand::reg("a"), Operand::Int(20)]),
            Instruction::quantum("add", [Operand::reg("b"), Operand::reg("a"), Operand::Int(22)]),
        ]);
        let output = orchestrator.run(ledger).await.unwrap();
        match output.sample {
            ExecutionSample::Deterministic { value, .. } => assert_eq!(value, Some(Value::Int(42))),
            other => panic!("unexpected sample {other:?}"),
        }
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsupported_instruction_fails_before_execution() {
        let mut orchestrator = start();
        let ledger = frozen(vec![Instruction::quantum("teleport", [Operand::Qubit(0)])]);
        let err = orchestrator.run(ledger).await.unwrap_err();
        assert!(err.is_compile_time());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_escalated_op_runs_between_host_segments() {
        let (mut orchestrator, log) = start_recording(false);
        let ledger = frozen(vec![
            Instruction::quantum("a", [Operand::Qubit(0)]),
            Instruction::quantum("b", [Operand::Qubit(0)]),
            Instruction::quantum("c", [Operand::Qubit(0)]),
            Instruction::quantum("measure", [Operand::Qubit(0)]),
        ]);
        let output = orchestrator.run(ledger).await.unwrap();
        assert!(output.sample.is_measured());
        assert_eq!(
            runs(&log),
            vec![
                ("quantum".to_string(), vec![0]),
                ("upper".to_string(), vec![1]),
                ("quantum".to_string(), vec![2, 3]),
            ]
        );
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_classical_ops_do_not_split_a_kind() {
        let (mut orchestrator, log) = start_recording(false);
        let ledger = frozen(vec![
            Instruction::quantum("a", [Operand::Qubit(0)]),
            Instruction::classical("const", [Operand::reg("r"), Operand::Int(1)]),
            Instruction::quantum("c", [Operand::Qubit(0)]),
            Instruction::quantum("measure", [Operand::Qubit(0)]),
        ]);
        orchestrator.run(ledger).await.unwrap();
        assert_eq!(runs(&log), vec![("quantum".to_string(), vec![0, 2, 3])]);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_host_deterministic_sample_is_kept() {
        let (mut orchestrator, _log) = start_recording(true);
        let ledger = frozen(vec![
            Instruction::classical("const", [Operand::reg("r"), Operand::Int(0)]),
            Instruction::quantum("a", [Operand::Qubit(0)]),
            Instruction::quantum("measure", [Operand::Qubit(0)]),
        ]);
        let output = orchestrator.run(ledger).await.unwrap();
        match output.sample {
            ExecutionSample::Deterministic { value, registers } => {
                assert_eq!(value, Some(Value::Bits { value: 1, width: 1 }));
                assert!(registers.is_empty());
            }
            other => panic!("unexpected sample {other:?}"),
        }
        orchestrator.shutdown().await;
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let registry = BackendRegistry::builtin();
        let plan = SpawnPlan::all(&registry);
        let result = Orchestrator::start(&registry, &ModuleTable::builtin(), plan, Supervisor::default());
        assert!(matches!(result, Err(CastError::Configuration(_))));
    }
}
