//! Compilation-unit session.
//!
//! A [`Session`] is the intermediate-form boundary of the core. The
//! enclosing compiler never hands over source text: it creates lazy values
//! from type names, appends backend-tagged instructions to them, reports
//! interactions between values, and evaluates cast expressions. Every cast
//! returns exactly one [`Value`] or one [`CastError`].
//!
//! ```ignore
//! let mut session = Session::builtin()?;
//! let q = session.lazy("@u3")?;
//! session.apply(&q, "h", q.qubit_operands())?;
//! let n = session.cast(&q, "u32").await?;
//! let diagnostics = session.finish().await;
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use crate::cast::{
    CallSite, CastDispatcher, CastOutcome, CastPlan, CastRequest, CastTable, DispatchContext,
    MemberTicket, SourceValue,
};
use crate::error::{CastError, CastResult, Diagnostic};
use crate::interpret::ResultInterpreter;
use crate::kind::BackendKind;
use crate::ledger::{Instruction, Interaction, Ledger, LedgerArena, LedgerHandle, LedgerState, Operand, ValueId};
use crate::orchestrator::{Orchestrator, SpawnPlan, Supervisor};
use crate::registry::BackendRegistry;
use crate::subcompiler::ModuleTable;
use crate::types::{TypeName, TypeTable};
use crate::value::Value;

/// A ledger-backed value of a non-classical kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyValue {
    pub id: ValueId,
    pub ty: TypeName,
    pub kind: BackendKind,
    pub ledger: LedgerHandle,
    /// Session-global qubits, least significant bit first.
    pub qubits: Vec<u32>,
}

impl LazyValue {
    pub fn width(&self) -> u32 {
        self.qubits.len() as u32
    }

    /// Every qubit of the value as operands, in bit order.
    pub fn qubit_operands(&self) -> Vec<Operand> {
        self.qubits.iter().map(|&q| Operand::Qubit(q)).collect()
    }

    pub fn qubit(&self, bit: usize) -> Option<Operand> {
        self.qubits.get(bit).map(|&q| Operand::Qubit(q))
    }
}

/// Hands out value ids and qubits for new lazy values.
#[derive(Debug, Default)]
pub struct ValueAllocator {
    next_value: u32,
    next_qubit: u32,
}

impl ValueAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a lazy value with a fresh ledger and `width` fresh qubits.
    pub fn allocate(&mut self, arena: &mut LedgerArena, ty: TypeName, kind: BackendKind, width: u32) -> LazyValue {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        let qubits = (self.next_qubit..self.next_qubit + width).collect();
        self.next_qubit += width;
        let ledger = arena.create(id);
        LazyValue {
            id,
            ty,
            kind,
            ledger,
            qubits,
        }
    }

    pub fn values(&self) -> u32 {
        self.next_value
    }

    pub fn qubits(&self) -> u32 {
        self.next_qubit
    }
}

/// Configures and starts a [`Session`].
#[derive(Debug)]
pub struct SessionBuilder {
    registry: Arc<BackendRegistry>,
    types: TypeTable,
    casts: CastTable,
    interpreter: ResultInterpreter,
    modules: ModuleTable,
    supervisor: Supervisor,
    kinds: Option<Vec<String>>,
}

impl SessionBuilder {
    pub fn types(mut self, types: TypeTable) -> Self {
        self.types = types;
        self
    }

    pub fn casts(mut self, casts: CastTable) -> Self {
        self.casts = casts;
        self
    }

    pub fn interpreter(mut self, interpreter: ResultInterpreter) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn modules(mut self, modules: ModuleTable) -> Self {
        self.modules = modules;
        self
    }

    pub fn supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Restrict the spawn plan to the kinds the program references (plus
    /// every kind above them). Without this, every registered kind starts.
    pub fn kinds<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Spawn the sub-compilers. Must run inside a tokio runtime.
    pub fn start(self) -> CastResult<Session> {
        let plan = match &self.kinds {
            Some(names) => {
                let referenced = names
                    .iter()
                    .map(|name| self.registry.kind(name))
                    .collect::<CastResult<Vec<_>>>()?;
                SpawnPlan::compute(&self.registry, referenced)?
            }
            None => SpawnPlan::all(&self.registry),
        };
        let orchestrator = Orchestrator::start(&self.registry, &self.modules, plan, self.supervisor)?;
        info!(
            types = self.types.len(),
            casts = self.casts.len(),
            transitivity = ?self.casts.transitivity(),
            "session started"
        );
        Ok(Session {
            registry: self.registry,
            types: self.types,
            arena: LedgerArena::new(),
            values: ValueAllocator::new(),
            dispatcher: CastDispatcher::new(self.casts, self.interpreter, orchestrator),
            next_site: 0,
            diagnostics: Vec::new(),
        })
    }
}

/// One compilation unit: its ledgers, its cast sites and its running
/// sub-compilers.
#[derive(Debug)]
pub struct Session {
    registry: Arc<BackendRegistry>,
    types: TypeTable,
    arena: LedgerArena,
    values: ValueAllocator,
    dispatcher: CastDispatcher,
    next_site: u32,
    diagnostics: Vec<Diagnostic>,
}

impl Session {
    /// Builder with the built-in types, casts, policies and modules.
    pub fn builder(registry: Arc<BackendRegistry>) -> SessionBuilder {
        SessionBuilder {
            registry,
            types: TypeTable::builtin(),
            casts: CastTable::builtin(),
            interpreter: ResultInterpreter::builtin(),
            modules: ModuleTable::builtin(),
            supervisor: Supervisor::default(),
            kinds: None,
        }
    }

    /// Session over the built-in classical and state-vector backends.
    pub fn builtin() -> CastResult<Self> {
        Self::builder(Arc::new(BackendRegistry::builtin())).start()
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn plan(&self) -> &SpawnPlan {
        self.dispatcher.orchestrator().plan()
    }

    /// Define a composite type usable by later lazy values.
    pub fn define_composite(&mut self, name: impl Into<TypeName>, members: &[(&str, &str)]) -> CastResult<()> {
        let def = self.types.define_composite(name, members)?;
        debug!(ty = %def.name, kind = %def.kind, width = def.width(), "defined composite type");
        Ok(())
    }

    /// Create a lazy value of type `ty` with an empty ledger.
    pub fn lazy(&mut self, ty: impl Into<TypeName>) -> CastResult<LazyValue> {
        let ty = ty.into();
        let def = self.types.require(&ty)?;
        if def.kind.is_classical() {
            return Err(CastError::NotLazy(ty));
        }
        if !self.plan().contains(&def.kind) {
            return Err(CastError::UnknownBackend(def.kind.name().to_string()));
        }
        let (kind, width) = (def.kind.clone(), def.width());
        let value = self.values.allocate(&mut self.arena, ty, kind, width);
        debug!(value = value.id.0, ty = %value.ty, qubits = ?value.qubits, "created lazy value");
        Ok(value)
    }

    /// Append an instruction of the value's own kind.
    pub fn apply(
        &mut self,
        value: &LazyValue,
        opcode: &str,
        operands: impl IntoIterator<Item = Operand>,
    ) -> CastResult<u64> {
        self.apply_with(value, value.kind.clone(), opcode, operands)
    }

    /// Append an instruction tagged with `kind`, e.g. classical arithmetic
    /// folded into a quantum value's ledger.
    pub fn apply_with(
        &mut self,
        value: &LazyValue,
        kind: BackendKind,
        opcode: &str,
        operands: impl IntoIterator<Item = Operand>,
    ) -> CastResult<u64> {
        if !self.plan().contains(&kind) {
            return Err(CastError::UnknownBackend(kind.name().to_string()));
        }
        self.arena
            .append(value.ledger, Instruction::new(kind, opcode, operands))
    }

    /// Report that `values` interact. Returns whether ledgers were merged.
    pub fn interact(
        &mut self,
        interaction: Interaction,
        values: &[&LazyValue],
        provably_independent: bool,
    ) -> CastResult<bool> {
        let handles: Vec<LedgerHandle> = values.iter().map(|v| v.ledger).collect();
        Ok(self
            .arena
            .interact(interaction, &handles, provably_independent)?
            .is_some())
    }

    /// Compile a cast site without evaluating it.
    pub fn compile_cast(&self, from: impl Into<TypeName>, to: impl Into<TypeName>) -> CastResult<CastPlan> {
        self.dispatcher.compile(&self.types, &from.into(), &to.into())
    }

    /// Evaluate a compiled cast.
    pub async fn dispatch(&mut self, request: CastRequest) -> CastResult<CastOutcome> {
        let cx = DispatchContext {
            arena: &mut self.arena,
            types: &self.types,
            values: &mut self.values,
        };
        self.dispatcher.dispatch(request, cx).await
    }

    /// Compile and evaluate `source as to` into a classical value.
    ///
    /// Member sources go through [`Session::cast_member`] and quantum
    /// targets through [`Session::encode`]. Both are rejected here before
    /// any ledger is touched.
    pub async fn cast(&mut self, source: impl Into<SourceValue>, to: impl Into<TypeName>) -> CastResult<Value> {
        let source = source.into();
        let to = to.into();
        let from = match &source {
            SourceValue::Strict(value) => value.type_name(),
            SourceValue::Lazy(lazy) => lazy.ty.clone(),
            SourceValue::Member { root, member } => {
                return Err(CastError::UnsupportedCast {
                    from_type: TypeName::from(format!("{}.{member}", root.ty)),
                    to_type: to,
                });
            }
        };
        let plan = self.compile_cast(from.clone(), to.clone())?;
        if matches!(plan, CastPlan::Encode { .. }) {
            return Err(CastError::UnsupportedCast {
                from_type: from,
                to_type: to,
            });
        }
        let request = CastRequest {
            source,
            plan,
            site: self.site(),
        };
        self.dispatch(request)
            .await?
            .into_value()
            .ok_or(CastError::UnsupportedCast {
                from_type: from,
                to_type: to,
            })
    }

    /// Cast one member of a composite lazy value. The value becomes
    /// available through [`Session::redeem`] once `root` is cast.
    pub async fn cast_member(
        &mut self,
        root: &LazyValue,
        member: &str,
        to: impl Into<TypeName>,
    ) -> CastResult<MemberTicket> {
        let from = self.member_type(root, member)?;
        let to = to.into();
        let plan = self.compile_cast(from.clone(), to.clone())?;
        let request = CastRequest {
            source: SourceValue::Member {
                root: root.clone(),
                member: member.to_string(),
            },
            plan,
            site: self.site(),
        };
        self.dispatch(request)
            .await?
            .into_ticket()
            .ok_or(CastError::UnsupportedCast {
                from_type: from,
                to_type: to,
            })
    }

    /// Cast a classical value into a quantum type, yielding a new lazy value.
    pub async fn encode(&mut self, value: Value, to: impl Into<TypeName>) -> CastResult<LazyValue> {
        let from = value.type_name();
        let to = to.into();
        let plan = self.compile_cast(from.clone(), to.clone())?;
        let request = CastRequest {
            source: SourceValue::Strict(value),
            plan,
            site: self.site(),
        };
        self.dispatch(request)
            .await?
            .into_lazy()
            .ok_or(CastError::UnsupportedCast {
                from_type: from,
                to_type: to,
            })
    }

    /// Take the value of a member cast, once its root was cast.
    pub fn redeem(&mut self, ticket: &MemberTicket) -> Option<CastResult<Value>> {
        self.dispatcher.redeem(ticket)
    }

    pub fn state(&self, value: &LazyValue) -> LedgerState {
        self.arena.state(value.ledger)
    }

    /// The open ledger behind `value`.
    pub fn ledger(&self, value: &LazyValue) -> Option<&Ledger> {
        self.arena.get(value.ledger)
    }

    /// `value` went out of scope.
    pub fn drop_value(&mut self, value: LazyValue) {
        if let Some(diagnostic) = self.arena.drop_owner(value.ledger, value.id) {
            self.diagnostics.push(diagnostic);
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// End the compilation unit: report ledgers never cast and stop every
    /// sub-compiler.
    pub async fn finish(mut self) -> Vec<Diagnostic> {
        let swept = self.arena.sweep();
        self.diagnostics.extend(swept);
        info!(
            values = self.values.values(),
            qubits = self.values.qubits(),
            diagnostics = self.diagnostics.len(),
            "session finished"
        );
        self.dispatcher.shutdown().await;
        self.diagnostics
    }

    fn member_type(&self, root: &LazyValue, member: &str) -> CastResult<TypeName> {
        let def = self.types.require(&root.ty)?;
        def.member(member)
            .map(|m| m.ty.clone())
            .ok_or_else(|| CastError::UnknownType(TypeName::from(format!("{}.{member}", root.ty))))
    }

    fn site(&mut self) -> CallSite {
        let site = CallSite::new(self.next_site);
        self.next_site += 1;
        site
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lazy_allocates_disjoint_qubits() {
        let mut session = Session::builtin().unwrap();
        let a = session.lazy("@u3").unwrap();
        let b = session.lazy("@u2").unwrap();
        assert_eq!(a.qubits, vec![0, 1, 2]);
        assert_eq!(b.qubits, vec![3, 4]);
        assert_ne!(a.id, b.id);
        assert_eq!(session.state(&a), LedgerState::Accumulating);
        session.finish().await;
    }

    #[tokio::test]
    async fn test_classical_types_are_not_lazy() {
        let mut session = Session::builtin().unwrap();
        assert!(matches!(session.lazy("u32"), Err(CastError::NotLazy(_))));
        assert!(matches!(session.lazy("@u9"), Err(CastError::UnknownType(_))));
        session.finish().await;
    }

    #[tokio::test]
    async fn test_apply_with_unknown_kind() {
        let mut session = Session::builtin().unwrap();
        let q = session.lazy("@bool").unwrap();
        let err = session
            .apply_with(&q, BackendKind::new("photonic", 1), "h", q.qubit_operands())
            .unwrap_err();
        assert!(matches!(err, CastError::UnknownBackend(_)));
        session.finish().await;
    }

    #[tokio::test]
    async fn test_strict_cast_needs_no_ledger() {
        let mut session = Session::builtin().unwrap();
        let value = session.cast(Value::U32(42), "u64").await.unwrap();
        assert_eq!(value, Value::U64(42));
        assert!(session.finish().await.is_empty());
    }

    #[tokio::test]
    async fn test_cast_resolves_ledger() {
        let mut session = Session::builtin().unwrap();
        let q = session.lazy("@u2").unwrap();
        session.apply(&q, "x", q.qubit(1)).unwrap();
        assert_eq!(session.cast(&q, "u32").await.unwrap(), Value::U32(2));
        assert_eq!(session.state(&q), LedgerState::Resolved);
        assert!(session.ledger(&q).is_none());
        session.finish().await;
    }

    #[tokio::test]
    async fn test_cast_rejects_member_without_touching_ledger() {
        let mut session = Session::builtin().unwrap();
        session
            .define_composite("pair_t", &[("flag", "@bool"), ("n", "@u2")])
            .unwrap();
        let pair = session.lazy("pair_t").unwrap();
        session.apply(&pair, "x", pair.qubit(0)).unwrap();

        let source = SourceValue::Member {
            root: pair.clone(),
            member: "n".into(),
        };
        let err = session.cast(source, "u32").await.unwrap_err();
        assert!(matches!(err, CastError::UnsupportedCast { .. }));
        assert_eq!(session.ledger(&pair).unwrap().len(), 1);
        assert_eq!(session.dispatcher.pending_members(), 0);
        assert_eq!(session.state(&pair), LedgerState::Accumulating);

        let ticket = session.cast_member(&pair, "n", "u32").await.unwrap();
        assert_eq!(session.dispatcher.pending_members(), 1);
        assert!(session.redeem(&ticket).is_none());
        session.finish().await;
    }

    #[tokio::test]
    async fn test_cast_rejects_quantum_target() {
        let mut session = Session::builtin().unwrap();
        let err = session.cast(Value::Int(1), "@u2").await.unwrap_err();
        assert!(matches!(err, CastError::UnsupportedCast { .. }));
        assert!(session.finish().await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_value_reports_diagnostic() {
        let mut session = Session::builtin().unwrap();
        let q = session.lazy("@bool").unwrap();
        session.apply(&q, "h", q.qubit_operands()).unwrap();
        session.drop_value(q);
        assert_eq!(session.diagnostics().len(), 1);
        assert_eq!(session.finish().await.len(), 1);
    }

    #[tokio::test]
    async fn test_kinds_restrict_spawn_plan() {
        let session = Session::builder(Arc::new(BackendRegistry::builtin()))
            .kinds(["classical"])
            .start()
            .unwrap();
        // Every kind above a referenced one is spawned too.
        assert!(session.plan().contains(&BackendKind::quantum()));
        session.finish().await;

        let err = Session::builder(Arc::new(BackendRegistry::builtin()))
            .kinds(["photonic"])
            .start()
            .unwrap_err();
        assert!(matches!(err, CastError::UnknownBackend(_)));
    }
}
