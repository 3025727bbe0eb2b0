//! Classical evaluator.
//!
//! The orchestrating compiler's own instruction set. It runs in-process,
//! interleaved with the other sub-compilers by the orchestrator, and is the
//! universal fallback for opcodes no other kind claims.
//!
//! Register machine: every value-producing op writes its first operand,
//! which must be a register. Arithmetic on two integers stays integral and
//! fails on overflow; anything involving a float is computed in `f64`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capability::{Capabilities, InstructionSet};
use crate::error::{CastError, CastResult};
use crate::ledger::{Instruction, Operand};
use crate::registry::BackendDescriptor;
use crate::sample::ExecutionSample;
use crate::subcompiler::{NativeOp, NativeProgram, SubCompiler};
use crate::value::Value;

/// Deferred member cast recorded by a `cast` instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCast {
    pub ticket: u32,
    /// Qubits of the member, least significant first.
    pub qubits: Vec<u32>,
}

/// Mutable state of one classical evaluation.
#[derive(Debug, Clone, Default)]
pub struct EvalState {
    pub registers: BTreeMap<String, Value>,
    /// Value written by the most recent op.
    pub last: Option<Value>,
    pub member_casts: Vec<MemberCast>,
}

impl EvalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot as a deterministic sample.
    pub fn into_sample(self) -> ExecutionSample {
        ExecutionSample::Deterministic {
            value: self.last,
            registers: self.registers,
        }
    }
}

/// The built-in classical sub-compiler.
#[derive(Debug, Clone)]
pub struct ClassicalEvaluator {
    name: String,
    capabilities: Capabilities,
}

impl ClassicalEvaluator {
    /// Evaluator with the full built-in instruction set.
    pub fn new() -> Self {
        Self::from_descriptor(&BackendDescriptor::classical())
    }

    /// Evaluator restricted to the opcodes a descriptor declares.
    pub fn from_descriptor(descriptor: &BackendDescriptor) -> Self {
        let instructions = descriptor.instructions.intersect(&InstructionSet::classical());
        Self {
            name: descriptor.name.clone(),
            capabilities: Capabilities::new(descriptor.kind(), instructions),
        }
    }

    /// Execute one lowered op against `state`.
    pub fn step(&self, op: &NativeOp, state: &mut EvalState) -> CastResult<()> {
        let fail = |message: String| CastError::execution(&self.capabilities.kind, message);
        let read = |operand: &Operand, registers: &BTreeMap<String, Value>| -> CastResult<Value> {
            match operand {
                Operand::Reg(name) => registers
                    .get(name)
                    .cloned()
                    .ok_or_else(|| fail(format!("register %{name} read before write"))),
                other => other
                    .literal()
                    .ok_or_else(|| fail(format!("operand {other} is not a value"))),
            }
        };

        let arg = |i: usize| {
            op.args
                .get(i)
                .ok_or_else(|| fail(format!("'{}' is missing operand {i}", op.code)))
        };

        let value = match op.code.as_str() {
            "barrier" => return Ok(()),
            "cast" => {
                let ticket = match arg(0)? {
                    Operand::Int(t) => {
                        u32::try_from(*t).map_err(|_| fail(format!("bad ticket {t}")))?
                    }
                    other => return Err(fail(format!("bad ticket {other}"))),
                };
                state.member_casts.push(MemberCast {
                    ticket,
                    qubits: op.qubits().collect(),
                });
                return Ok(());
            }
            "const" | "mov" => read(arg(1)?, &state.registers)?,
            "not" => Value::Bool(!read(arg(1)?, &state.registers)?.truthy()),
            code => {
                let a = read(arg(1)?, &state.registers)?;
                let b = read(arg(2)?, &state.registers)?;
                binary(code, &a, &b).map_err(&fail)?
            }
        };

        let dst = arg(0)?
            .as_reg()
            .ok_or_else(|| fail(format!("'{}' must write a register", op.code)))?
            .to_string();
        trace!(seq = op.seq, code = %op.code, register = %dst, value = %value, "classical step");
        state.registers.insert(dst, value.clone());
        state.last = Some(value);
        Ok(())
    }
}

impl Default for ClassicalEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubCompiler for ClassicalEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn lower(&self, instructions: &[Instruction]) -> CastResult<NativeProgram> {
        let mut program = NativeProgram::new(self.capabilities.kind.clone());
        for instr in instructions {
            if !self.supports(&instr.opcode) {
                return Err(CastError::UnsupportedInstruction {
                    opcode: instr.opcode.clone(),
                    kind: instr.kind.clone(),
                });
            }
            check_operands(instr)?;
            program.push(NativeOp::new(instr.seq, instr.opcode.clone(), instr.operands.clone()));
        }
        Ok(program)
    }

    async fn execute(&self, program: &NativeProgram) -> CastResult<ExecutionSample> {
        let mut state = EvalState::new();
        for op in &program.ops {
            self.step(op, &mut state)?;
        }
        Ok(state.into_sample())
    }
}

fn is_value(operand: &Operand) -> bool {
    operand.as_reg().is_some() || operand.literal().is_some()
}

fn check_operands(instr: &Instruction) -> CastResult<()> {
    let ops = &instr.operands;
    let writes = ops.first().and_then(Operand::as_reg).is_some();
    let (ok, expected) = match instr.opcode.as_str() {
        "const" => (
            ops.len() == 2 && writes && ops[1].literal().is_some(),
            "a destination register and a literal",
        ),
        "mov" | "not" => (
            ops.len() == 2 && writes && is_value(&ops[1]),
            "a destination register and one value",
        ),
        "barrier" => (
            ops.iter().all(|o| o.as_qubit().is_some()),
            "qubit operands only",
        ),
        "cast" => (
            matches!(ops.first(), Some(Operand::Int(t)) if *t >= 0)
                && ops[1..].iter().all(|o| o.as_qubit().is_some()),
            "a ticket followed by qubits",
        ),
        _ => (
            ops.len() == 3 && writes && is_value(&ops[1]) && is_value(&ops[2]),
            "a destination register and two values",
        ),
    };
    if ok {
        Ok(())
    } else {
        Err(CastError::malformed(&instr.opcode, format!("expected {expected}")))
    }
}

fn binary(code: &str, a: &Value, b: &Value) -> Result<Value, String> {
    match code {
        "and" => return Ok(Value::Bool(a.truthy() && b.truthy())),
        "or" => return Ok(Value::Bool(a.truthy() || b.truthy())),
        "xor" => return Ok(Value::Bool(a.truthy() != b.truthy())),
        _ => {}
    }

    if let (Some(x), Some(y)) = (a.as_i128(), b.as_i128()) {
        let result = match code {
            "add" => x.checked_add(y),
            "sub" => x.checked_sub(y),
            "mul" => x.checked_mul(y),
            "div" if y == 0 => return Err("division by zero".into()),
            "div" => x.checked_div(y),
            "eq" => return Ok(Value::Bool(x == y)),
            "ne" => return Ok(Value::Bool(x != y)),
            "lt" => return Ok(Value::Bool(x < y)),
            "le" => return Ok(Value::Bool(x <= y)),
            other => return Err(format!("unknown classical opcode '{other}'")),
        };
        return result
            .and_then(|v| i64::try_from(v).ok())
            .map(Value::Int)
            .ok_or_else(|| format!("integer overflow in {a} {code} {b}"));
    }

    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return Err(format!("operands of '{code}' are not numeric"));
    };
    Ok(match code {
        "add" => Value::Float(x + y),
        "sub" => Value::Float(x - y),
        "mul" => Value::Float(x * y),
        "div" if y == 0.0 => return Err("division by zero".into()),
        "div" => Value::Float(x / y),
        "eq" => Value::Bool(x == y),
        "ne" => Value::Bool(x != y),
        "lt" => Value::Bool(x < y),
        "le" => Value::Bool(x <= y),
        other => return Err(format!("unknown classical opcode '{other}'")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(instrs: Vec<Instruction>) -> CastResult<EvalState> {
        let eval = ClassicalEvaluator::new();
        let program = eval.lower(&instrs)?;
        let mut state = EvalState::new();
        for op in &program.ops {
            eval.step(op, &mut state)?;
        }
        Ok(state)
    }

    fn c(opcode: &str, ops: Vec<Operand>) -> Instruction {
        Instruction::classical(opcode, ops)
    }

    #[test]
    fn test_arithmetic() {
        let state = run(vec![
            c("const", vec![Operand::reg("a"), Operand::Int(6)]),
            c("const", vec![Operand::reg("b"), Operand::Int(7)]),
            c("mul", vec![Operand::reg("p"), Operand::reg("a"), Operand::reg("b")]),
            c("lt", vec![Operand::reg("t"), Operand::reg("a"), Operand::reg("b")]),
        ])
        .unwrap();
        assert_eq!(state.registers["p"], Value::Int(42));
        assert_eq!(state.last, Some(Value::Bool(true)));
    }

    #[test]
    fn test_float_promotion() {
        let state = run(vec![c(
            "add",
            vec![Operand::reg("x"), Operand::Int(1), Operand::Float(0.5)],
        )])
        .unwrap();
        assert_eq!(state.last, Some(Value::Float(1.5)));
    }

    #[test]
    fn test_division_by_zero_is_execution_error() {
        let err = run(vec![c(
            "div",
            vec![Operand::reg("x"), Operand::Int(1), Operand::Int(0)],
        )])
        .unwrap_err();
        assert!(matches!(err, CastError::BackendExecution { transient: false, .. }));
    }

    #[test]
    fn test_overflow_is_reported() {
        let err = run(vec![c(
            "mul",
            vec![Operand::reg("x"), Operand::Int(i64::MAX), Operand::Int(2)],
        )])
        .unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_lower_rejects_bad_operands() {
        let eval = ClassicalEvaluator::new();
        let err = eval
            .lower(&[c("add", vec![Operand::reg("x"), Operand::Int(1)])])
            .unwrap_err();
        assert!(matches!(err, CastError::MalformedInstruction { .. }));

        let err = eval
            .lower(&[Instruction::quantum("h", [Operand::Qubit(0)])])
            .unwrap_err();
        assert!(matches!(err, CastError::UnsupportedInstruction { .. }));
    }

    #[test]
    fn test_member_cast_is_recorded() {
        let state = run(vec![c(
            "cast",
            vec![Operand::Int(3), Operand::Qubit(4), Operand::Qubit(5)],
        )])
        .unwrap();
        assert_eq!(
            state.member_casts,
            vec![MemberCast {
                ticket: 3,
                qubits: vec![4, 5]
            }]
        );
        assert!(state.last.is_none());
    }

    #[tokio::test]
    async fn test_execute_returns_deterministic_sample() {
        let eval = ClassicalEvaluator::new();
        let program = eval
            .lower(&[c("const", vec![Operand::reg("a"), Operand::Int(9)])])
            .unwrap();
        match eval.execute(&program).await.unwrap() {
            ExecutionSample::Deterministic { value, registers } => {
                assert_eq!(value, Some(Value::Int(9)));
                assert_eq!(registers.len(), 1);
            }
            other => panic!("unexpected sample {other:?}"),
        }
    }
}
