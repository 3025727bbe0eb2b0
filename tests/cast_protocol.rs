//! End-to-end tests of the cast protocol through a session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hhat_cast::subcompiler::StatevectorCompiler;
use hhat_cast::{
    BackendDescriptor, BackendKind, BackendRegistry, CastError, CastResult, CastTable, Capabilities,
    DiagnosticKind, ExecutionSample, Instruction, Interaction, LedgerState, ModuleTable,
    NativeProgram, Operand, RetryTransient, Session, SubCompiler, Supervisor, Value,
};

const SCRIPTED_MODULE: &str = "test:scripted";

/// State-vector backend with scripted faults.
#[derive(Clone, Default)]
struct Script {
    executions: Arc<AtomicU32>,
    fail_first: u32,
    delay: Option<Duration>,
    crash: bool,
    /// Answer with this value instead of measuring.
    deterministic: Option<Value>,
}

struct Scripted {
    inner: StatevectorCompiler,
    script: Script,
}

#[async_trait]
impl SubCompiler for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> &Capabilities {
        self.inner.capabilities()
    }

    fn lower(&self, instructions: &[Instruction]) -> CastResult<NativeProgram> {
        self.inner.lower(instructions)
    }

    async fn execute(&self, program: &NativeProgram) -> CastResult<ExecutionSample> {
        let attempt = self.script.executions.fetch_add(1, Ordering::SeqCst) + 1;
        if self.script.crash {
            panic!("scripted crash");
        }
        if let Some(delay) = self.script.delay {
            tokio::time::sleep(delay).await;
        }
        if attempt <= self.script.fail_first {
            return Err(CastError::BackendExecution {
                kind: BackendKind::quantum(),
                message: "device busy".into(),
                transient: true,
            });
        }
        if let Some(value) = &self.script.deterministic {
            return Ok(ExecutionSample::Deterministic {
                value: Some(value.clone()),
                registers: Default::default(),
            });
        }
        self.inner.execute(program).await
    }
}

fn scripted_session(script: &Script, supervisor: Supervisor) -> Session {
    let registry = BackendRegistry::new([
        BackendDescriptor::classical(),
        BackendDescriptor {
            module: SCRIPTED_MODULE.into(),
            ..BackendDescriptor::statevector()
        },
    ])
    .unwrap();
    let mut modules = ModuleTable::builtin();
    let script = script.clone();
    modules.register(SCRIPTED_MODULE, move |d| {
        Ok(Box::new(Scripted {
            inner: StatevectorCompiler::from_descriptor(d)?,
            script: script.clone(),
        }) as Box<dyn SubCompiler>)
    });
    Session::builder(Arc::new(registry))
        .modules(modules)
        .supervisor(supervisor)
        .start()
        .unwrap()
}

#[tokio::test]
async fn test_strict_cast_bypasses_ledgers() {
    let mut session = Session::builtin().unwrap();
    assert_eq!(session.cast(Value::U32(42), "u64").await.unwrap(), Value::U64(42));
    assert_eq!(session.cast(Value::Int(-1), "f64").await.unwrap(), Value::F64(-1.0));
    assert!(matches!(
        session.cast(Value::Int(-1), "u32").await,
        Err(CastError::Overflow { .. })
    ));
    assert!(session.finish().await.is_empty());
}

#[tokio::test]
async fn test_lazy_cast_resolves_once() {
    let mut session = Session::builtin().unwrap();
    let q = session.lazy("@u3").unwrap();
    let mut init = vec![Operand::Int(5)];
    init.extend(q.qubit_operands());
    session.apply(&q, "init", init).unwrap();
    session.apply(&q, "h", q.qubit(0)).unwrap();
    session.apply(&q, "h", q.qubit(0)).unwrap();
    session.apply(&q, "x", q.qubit(1)).unwrap();

    assert_eq!(session.cast(&q, "u32").await.unwrap(), Value::U32(7));
    assert_eq!(session.state(&q), LedgerState::Resolved);

    let err = session.cast(&q, "u32").await.unwrap_err();
    assert!(matches!(err, CastError::DoubleCast(_)));
    assert!(session.finish().await.is_empty());
}

#[tokio::test]
async fn test_float_casts_strict_and_lazy() {
    let mut session = Session::builtin().unwrap();
    assert_eq!(session.cast(Value::Float(1.5), "bool").await.unwrap(), Value::Bool(true));
    assert_eq!(session.cast(Value::Float(2.9), "int").await.unwrap(), Value::Int(2));
    assert_eq!(session.cast(Value::U32(3), "float").await.unwrap(), Value::Float(3.0));

    let q = session.lazy("@u2").unwrap();
    session.apply(&q, "x", q.qubit(1)).unwrap();
    assert_eq!(session.cast(&q, "float").await.unwrap(), Value::Float(2.0));
    assert!(session.finish().await.is_empty());
}

#[tokio::test]
async fn test_deterministic_host_sample_reaches_cast() {
    let script = Script {
        deterministic: Some(Value::Bits { value: 1, width: 1 }),
        ..Script::default()
    };
    let mut session = scripted_session(&script, Supervisor::default());
    let q = session.lazy("@bool").unwrap();
    session.apply(&q, "h", q.qubit(0)).unwrap();
    assert_eq!(session.cast(&q, "bool").await.unwrap(), Value::Bool(true));
    assert_eq!(script.executions.load(Ordering::SeqCst), 1);
    assert!(session.finish().await.is_empty());
}

#[tokio::test]
async fn test_merged_ledgers_execute_once() {
    let script = Script::default();
    let mut session = scripted_session(&script, Supervisor::default());
    let a = session.lazy("@bool").unwrap();
    let b = session.lazy("@bool").unwrap();
    session.apply(&a, "x", a.qubit(0)).unwrap();

    assert!(session.interact(Interaction::Branch, &[&a, &b], false).unwrap());
    assert_eq!(session.state(&b), LedgerState::Merged);
    session
        .apply(&b, "cx", [a.qubit_operands(), b.qubit_operands()].concat())
        .unwrap();

    assert_eq!(session.cast(&b, "bool").await.unwrap(), Value::Bool(true));
    assert_eq!(session.state(&a), LedgerState::Resolved);
    assert!(matches!(session.cast(&a, "bool").await, Err(CastError::DoubleCast(_))));
    assert_eq!(script.executions.load(Ordering::SeqCst), 1);
    assert!(session.finish().await.is_empty());
}

#[tokio::test]
async fn test_independent_values_keep_their_ledgers() {
    let mut session = Session::builtin().unwrap();
    let a = session.lazy("@bool").unwrap();
    let b = session.lazy("@bool").unwrap();
    assert!(!session.interact(Interaction::Call, &[&a, &b], true).unwrap());
    session.apply(&a, "x", a.qubit(0)).unwrap();

    assert_eq!(session.cast(&a, "bool").await.unwrap(), Value::Bool(true));
    assert_eq!(session.state(&b), LedgerState::Accumulating);
    assert_eq!(session.cast(&b, "bool").await.unwrap(), Value::Bool(false));
    session.finish().await;
}

#[tokio::test]
async fn test_classical_instructions_run_inside_quantum_ledger() {
    let mut session = Session::builtin().unwrap();
    let q = session.lazy("@u2").unwrap();
    let classical = BackendKind::classical();
    session
        .apply_with(&q, classical.clone(), "const", [Operand::reg("a"), Operand::Int(3)])
        .unwrap();
    session
        .apply_with(
            &q,
            classical,
            "lt",
            [Operand::reg("c"), Operand::Int(1), Operand::reg("a")],
        )
        .unwrap();
    session
        .apply(&q, "x_if", [Operand::reg("c"), Operand::Qubit(q.qubits[0])])
        .unwrap();
    // Quantum-tagged arithmetic the state-vector backend cannot run.
    session
        .apply(&q, "add", [Operand::reg("b"), Operand::Int(20), Operand::Int(22)])
        .unwrap();
    session
        .apply(&q, "x_if", [Operand::reg("b"), Operand::Qubit(q.qubits[1])])
        .unwrap();

    assert_eq!(session.cast(&q, "u32").await.unwrap(), Value::U32(3));
    session.finish().await;
}

#[tokio::test]
async fn test_unsupported_instruction_is_compile_time() {
    let mut session = Session::builtin().unwrap();
    let q = session.lazy("@bool").unwrap();
    session.apply(&q, "teleport", q.qubit_operands()).unwrap();

    let err = session.cast(&q, "bool").await.unwrap_err();
    assert!(matches!(
        err,
        CastError::UnsupportedInstruction { ref opcode, .. } if opcode == "teleport"
    ));
    assert!(err.is_compile_time());
    session.finish().await;
}

#[tokio::test]
async fn test_missing_cast_function_fails_before_execution() {
    let mut session = Session::builtin().unwrap();
    let q = session.lazy("@u3").unwrap();
    session.apply(&q, "h", q.qubit(0)).unwrap();

    let err = session.cast(&q, "f32").await.unwrap_err();
    assert!(matches!(err, CastError::NoCastFunction { .. }));
    assert!(err.is_compile_time());
    assert_eq!(session.state(&q), LedgerState::Accumulating);

    assert!(matches!(
        session.compile_cast("@u2", "@u3"),
        Err(CastError::UnsupportedCast { .. })
    ));
    assert!(matches!(
        session.compile_cast("@u2", "widget"),
        Err(CastError::UnknownType(_))
    ));
    session.finish().await;
}

#[tokio::test]
async fn test_member_cast_settles_with_root() {
    let mut casts = CastTable::builtin();
    casts.register("pair_t", "sample", Ok);
    let mut session = Session::builder(Arc::new(BackendRegistry::builtin()))
        .casts(casts)
        .start()
        .unwrap();
    session
        .define_composite("pair_t", &[("flag", "@bool"), ("n", "@u2")])
        .unwrap();

    let pair = session.lazy("pair_t").unwrap();
    assert_eq!(pair.qubits, vec![0, 1, 2]);
    session.apply(&pair, "x", pair.qubit(0)).unwrap();
    session.apply(&pair, "x", pair.qubit(2)).unwrap();

    let n = session.cast_member(&pair, "n", "u32").await.unwrap();
    let flag = session.cast_member(&pair, "flag", "bool").await.unwrap();
    assert!(session.redeem(&n).is_none());
    assert_eq!(session.state(&pair), LedgerState::Accumulating);

    let histogram = match session.cast(&pair, "sample").await.unwrap() {
        Value::Histogram(h) => h,
        other => panic!("unexpected value {other}"),
    };
    assert_eq!(histogram.keys().copied().collect::<Vec<_>>(), vec![0b101]);

    assert_eq!(session.redeem(&n).unwrap().unwrap(), Value::U32(2));
    assert_eq!(session.redeem(&flag).unwrap().unwrap(), Value::Bool(true));
    assert!(session.redeem(&n).is_none());

    let err = session.cast_member(&pair, "n", "u32").await.unwrap_err();
    assert!(matches!(err, CastError::DoubleCast(_)));
    session.finish().await;
}

#[tokio::test]
async fn test_encode_classical_into_quantum() {
    let mut session = Session::builtin().unwrap();
    let q = session.encode(Value::Int(5), "@u3").await.unwrap();
    assert_eq!(q.width(), 3);
    assert_eq!(session.ledger(&q).unwrap().len(), 1);
    assert_eq!(session.cast(&q, "u32").await.unwrap(), Value::U32(5));

    let err = session.encode(Value::Int(9), "@u3").await.unwrap_err();
    assert!(matches!(err, CastError::Overflow { .. }));
    session.finish().await;
}

#[tokio::test]
async fn test_unused_lazy_value_is_a_diagnostic() {
    let mut session = Session::builtin().unwrap();
    let q = session.lazy("@u2").unwrap();
    session.apply(&q, "redim", q.qubit_operands()).unwrap();

    let diagnostics = session.finish().await;
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(
        diagnostics[0].kind,
        DiagnosticKind::UnusedLazyValue { instructions: 1 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let script = Script {
        fail_first: 2,
        ..Script::default()
    };
    let supervisor = Supervisor::new(RetryTransient {
        max_attempts: 3,
        backoff: Duration::from_millis(10),
        timeout: None,
    });
    let mut session = scripted_session(&script, supervisor);
    let q = session.lazy("@bool").unwrap();
    session.apply(&q, "x", q.qubit(0)).unwrap();

    assert_eq!(session.cast(&q, "bool").await.unwrap(), Value::Bool(true));
    assert_eq!(script.executions.load(Ordering::SeqCst), 3);
    session.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_default_supervisor_escalates() {
    let script = Script {
        fail_first: 1,
        ..Script::default()
    };
    let mut session = scripted_session(&script, Supervisor::default());
    let q = session.lazy("@bool").unwrap();
    session.apply(&q, "x", q.qubit(0)).unwrap();

    let err = session.cast(&q, "bool").await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(script.executions.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(&q), LedgerState::Resolved);
    session.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_execution_timeout() {
    let script = Script {
        delay: Some(Duration::from_secs(60)),
        ..Script::default()
    };
    let supervisor = Supervisor::new(RetryTransient {
        max_attempts: 2,
        backoff: Duration::from_millis(10),
        timeout: Some(Duration::from_secs(1)),
    });
    let mut session = scripted_session(&script, supervisor);
    let q = session.lazy("@bool").unwrap();
    session.apply(&q, "h", q.qubit(0)).unwrap();

    let err = session.cast(&q, "bool").await.unwrap_err();
    match err {
        CastError::BackendExecution {
            message, transient, ..
        } => {
            assert!(transient);
            assert!(message.contains("timed out"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(script.executions.load(Ordering::SeqCst), 2);
    session.finish().await;
}

#[tokio::test]
async fn test_crashed_subcompiler_is_fatal() {
    let script = Script {
        crash: true,
        ..Script::default()
    };
    let supervisor = Supervisor::new(RetryTransient::default());
    let mut session = scripted_session(&script, supervisor);
    let q = session.lazy("@bool").unwrap();
    session.apply(&q, "x", q.qubit(0)).unwrap();

    let err = session.cast(&q, "bool").await.unwrap_err();
    assert!(matches!(err, CastError::SubCompilerCrashed(_)));
    assert!(err.is_fatal());
    assert_eq!(script.executions.load(Ordering::SeqCst), 1);
    session.finish().await;
}
