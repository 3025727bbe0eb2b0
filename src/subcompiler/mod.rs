//! Sub-compiler trait and lowered programs.
//!
//! # Sub-compiler contract
//!
//! One [`SubCompiler`] serves each backend kind:
//!
//! ```text
//!   capabilities() ──→ lower() ──→ execute()
//!    (sync, &ref)      (sync)      (async)
//! ```
//!
//! | Method | Kind | Required | Returns |
//! |--------|------|----------|---------|
//! | `name()` | sync | yes | `&str` |
//! | `capabilities()` | sync | yes | `&Capabilities` |
//! | `supports()` | sync | provided | `bool` |
//! | `lower()` | sync | yes | `CastResult<NativeProgram>` |
//! | `execute()` | async | yes | `CastResult<ExecutionSample>` |
//!
//! Only `execute` may wait on a device or external process. A sub-compiler
//! may hold instructions of a subordinate kind when it supports their
//! opcode; it never attempts a higher-kind instruction.
//!
//! Sub-compilers are instantiated through a [`ModuleTable`], which maps the
//! `module` reference of a backend descriptor to a constructor.

pub mod classical;
pub mod passes;
pub mod statevector;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::Capabilities;
use crate::error::{CastError, CastResult};
use crate::kind::BackendKind;
use crate::ledger::{Instruction, Operand};
use crate::registry::{BackendDescriptor, CLASSICAL_MODULE, STATEVECTOR_MODULE};
use crate::sample::ExecutionSample;
use crate::value::Value;

pub use classical::{ClassicalEvaluator, EvalState, MemberCast};
pub use statevector::StatevectorCompiler;

/// Trait for backend sub-compilers.
///
/// # Contract
///
/// - `capabilities()` MUST be synchronous and infallible, cached at
///   construction time.
/// - `lower()` MUST preserve the sequence number of the instruction each
///   native operation comes from, so the orchestrator can interleave
///   programs of different kinds.
/// - `lower()` fails with `UnsupportedInstruction` for opcodes outside the
///   capabilities and `MalformedInstruction` for bad operands.
/// - `execute()` receives a program whose register operands have been
///   bound to literals.
#[async_trait]
pub trait SubCompiler: Send + Sync {
    /// Get the name of this sub-compiler.
    fn name(&self) -> &str;

    /// Get the capabilities of this sub-compiler.
    fn capabilities(&self) -> &Capabilities;

    /// Check whether an opcode is recognized.
    fn supports(&self, opcode: &str) -> bool {
        self.capabilities().supports(opcode)
    }

    /// Translate instructions into this backend's native form.
    fn lower(&self, instructions: &[Instruction]) -> CastResult<NativeProgram>;

    /// Run a lowered program.
    async fn execute(&self, program: &NativeProgram) -> CastResult<ExecutionSample>;
}

/// One backend-native operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeOp {
    /// Sequence number of the ledger instruction this op was lowered from.
    pub seq: u64,
    /// Native operation code.
    pub code: String,
    pub args: Vec<Operand>,
    /// Classical condition; the op only runs when it is truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Operand>,
}

impl NativeOp {
    pub fn new(seq: u64, code: impl Into<String>, args: impl IntoIterator<Item = Operand>) -> Self {
        Self {
            seq,
            code: code.into(),
            args: args.into_iter().collect(),
            guard: None,
        }
    }

    pub fn with_guard(mut self, guard: Operand) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Qubits touched by this op.
    pub fn qubits(&self) -> impl Iterator<Item = u32> + '_ {
        self.args.iter().filter_map(Operand::as_qubit)
    }
}

impl fmt::Display for NativeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(guard) = &self.guard {
            write!(f, "if({guard}) ")?;
        }
        write!(f, "{}", self.code)?;
        for (i, arg) in self.args.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{arg}")?;
        }
        Ok(())
    }
}

/// A lowered program for one backend kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeProgram {
    pub kind: BackendKind,
    pub ops: Vec<NativeOp>,
}

impl NativeProgram {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            ops: Vec::new(),
        }
    }

    pub fn push(&mut self, op: NativeOp) {
        self.ops.push(op);
    }

    /// Append every op of `other`. Used when staging segments.
    pub fn extend(&mut self, other: NativeProgram) {
        self.ops.extend(other.ops);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Substitute register operands with their current values.
    ///
    /// Guarded ops whose condition is false are dropped; the others lose
    /// their guard. Reading a register that was never written is an
    /// execution error.
    pub fn bind(&self, registers: &BTreeMap<String, Value>) -> CastResult<NativeProgram> {
        let read = |operand: &Operand| -> CastResult<Operand> {
            match operand {
                Operand::Reg(name) => registers
                    .get(name)
                    .cloned()
                    .map(Operand::from)
                    .ok_or_else(|| {
                        CastError::execution(&self.kind, format!("register %{name} read before write"))
                    }),
                other => Ok(other.clone()),
            }
        };

        let mut bound = NativeProgram::new(self.kind.clone());
        for op in &self.ops {
            if let Some(guard) = &op.guard {
                let taken = match guard {
                    Operand::Reg(name) => registers.get(name).map(Value::truthy).ok_or_else(|| {
                        CastError::execution(&self.kind, format!("register %{name} read before write"))
                    })?,
                    other => other.literal().is_some_and(|v| v.truthy()),
                };
                if !taken {
                    continue;
                }
            }
            bound.push(NativeOp {
                seq: op.seq,
                code: op.code.clone(),
                args: op.args.iter().map(read).collect::<CastResult<_>>()?,
                guard: None,
            });
        }
        Ok(bound)
    }

    /// Human-readable listing, one op per line.
    pub fn listing(&self) -> String {
        self.ops
            .iter()
            .map(|op| format!("{:>4}  {op}", op.seq))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Constructor of a sub-compiler from its descriptor.
pub type SubCompilerFactory =
    Arc<dyn Fn(&BackendDescriptor) -> CastResult<Box<dyn SubCompiler>> + Send + Sync>;

/// Table resolving descriptor `module` references to constructors.
#[derive(Clone)]
pub struct ModuleTable {
    factories: FxHashMap<String, SubCompilerFactory>,
}

impl ModuleTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    /// Table with the built-in classical evaluator and state-vector simulator.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.register(CLASSICAL_MODULE, |d| {
            Ok(Box::new(ClassicalEvaluator::from_descriptor(d)) as Box<dyn SubCompiler>)
        });
        table.register(STATEVECTOR_MODULE, |d| {
            Ok(Box::new(StatevectorCompiler::from_descriptor(d)?) as Box<dyn SubCompiler>)
        });
        table
    }

    /// Register a constructor for a module reference, replacing any previous one.
    pub fn register<F>(&mut self, module: impl Into<String>, factory: F)
    where
        F: Fn(&BackendDescriptor) -> CastResult<Box<dyn SubCompiler>> + Send + Sync + 'static,
    {
        self.factories.insert(module.into(), Arc::new(factory));
    }

    pub fn contains(&self, module: &str) -> bool {
        self.factories.contains_key(module)
    }

    /// Build the sub-compiler a descriptor points at.
    pub fn instantiate(&self, descriptor: &BackendDescriptor) -> CastResult<Box<dyn SubCompiler>> {
        let factory = self.factories.get(&descriptor.module).ok_or_else(|| {
            CastError::Configuration(format!(
                "backend '{}' references unknown module '{}'",
                descriptor.name, descriptor.module
            ))
        })?;
        let compiler = factory(descriptor)?;
        debug!(
            backend = %descriptor.name,
            module = %descriptor.module,
            opcodes = compiler.capabilities().instructions.opcodes.len(),
            "instantiated sub-compiler"
        );
        Ok(compiler)
    }
}

impl Default for ModuleTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for ModuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modules: Vec<_> = self.factories.keys().collect();
        modules.sort();
        f.debug_struct("ModuleTable").field("modules", &modules).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_substitutes_registers() {
        let mut program = NativeProgram::new(BackendKind::quantum());
        program.push(NativeOp::new(0, "ry", [Operand::reg("theta"), Operand::Qubit(0)]));
        program.push(NativeOp::new(1, "x", [Operand::Qubit(1)]).with_guard(Operand::reg("c")));
        program.push(NativeOp::new(2, "x", [Operand::Qubit(2)]).with_guard(Operand::reg("d")));

        let registers = BTreeMap::from([
            ("theta".to_string(), Value::Float(0.5)),
            ("c".to_string(), Value::Bool(true)),
            ("d".to_string(), Value::Int(0)),
        ]);
        let bound = program.bind(&registers).unwrap();

        assert_eq!(bound.len(), 2);
        assert_eq!(bound.ops[0].args[0], Operand::Float(0.5));
        assert!(bound.ops[1].guard.is_none());
        assert_eq!(bound.ops[1].seq, 1);
    }

    #[test]
    fn test_bind_unwritten_register_fails() {
        let mut program = NativeProgram::new(BackendKind::quantum());
        program.push(NativeOp::new(0, "x", [Operand::Qubit(0)]).with_guard(Operand::reg("c")));
        let err = program.bind(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CastError::BackendExecution { .. }));
    }

    #[test]
    fn test_listing() {
        let mut program = NativeProgram::new(BackendKind::quantum());
        program.push(NativeOp::new(3, "cx", [Operand::Qubit(0), Operand::Qubit(1)]));
        assert_eq!(program.listing(), "   3  cx q[0], q[1]");
    }

    #[test]
    fn test_module_table_instantiates_builtins() {
        let table = ModuleTable::builtin();
        let compiler = table.instantiate(&BackendDescriptor::statevector()).unwrap();
        assert!(compiler.supports("h"));
        assert!(!compiler.supports("add"));

        let mut bad = BackendDescriptor::statevector();
        bad.module = "dylib:missing".into();
        assert!(matches!(
            table.instantiate(&bad),
            Err(CastError::Configuration(_))
        ));
    }
}
