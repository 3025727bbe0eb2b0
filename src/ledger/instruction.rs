//! Backend-tagged instructions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::kind::BackendKind;
use crate::value::Value;

/// Operand of an instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Session-global qubit index.
    Qubit(u32),
    /// Classical register, written by classical instructions.
    Reg(String),
    /// Free-form symbol (member names, type names).
    Symbol(String),
}

impl Operand {
    pub fn reg(name: impl Into<String>) -> Self {
        Operand::Reg(name.into())
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Operand::Symbol(name.into())
    }

    pub fn as_qubit(&self) -> Option<u32> {
        match self {
            Operand::Qubit(q) => Some(*q),
            _ => None,
        }
    }

    pub fn as_reg(&self) -> Option<&str> {
        match self {
            Operand::Reg(r) => Some(r),
            _ => None,
        }
    }

    /// Literal operands as classical values.
    pub fn literal(&self) -> Option<Value> {
        match self {
            Operand::Int(v) => Some(Value::Int(*v)),
            Operand::Float(v) => Some(Value::Float(*v)),
            Operand::Bool(v) => Some(Value::Bool(*v)),
            _ => None,
        }
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => Operand::Bool(b),
            Value::Float(v) | Value::F64(v) => Operand::Float(v),
            Value::F32(v) => Operand::Float(f64::from(v)),
            other => match other.as_i128().and_then(|v| i64::try_from(v).ok()) {
                Some(v) => Operand::Int(v),
                None => Operand::Symbol(other.to_string()),
            },
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Int(v) => write!(f, "{v}"),
            Operand::Float(v) => write!(f, "{v}"),
            Operand::Bool(v) => write!(f, "{v}"),
            Operand::Qubit(q) => write!(f, "q[{q}]"),
            Operand::Reg(r) => write!(f, "%{r}"),
            Operand::Symbol(s) => write!(f, "{s}"),
        }
    }
}

/// One deferred operation, tagged with the kind that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Position in the ledger. Assigned on append, renumbered on merge.
    pub seq: u64,
    pub opcode: String,
    pub operands: Vec<Operand>,
    pub kind: BackendKind,
}

impl Instruction {
    pub fn new(
        kind: BackendKind,
        opcode: impl Into<String>,
        operands: impl IntoIterator<Item = Operand>,
    ) -> Self {
        Self {
            seq: 0,
            opcode: opcode.into(),
            operands: operands.into_iter().collect(),
            kind,
        }
    }

    pub fn quantum(opcode: impl Into<String>, operands: impl IntoIterator<Item = Operand>) -> Self {
        Self::new(BackendKind::quantum(), opcode, operands)
    }

    pub fn classical(
        opcode: impl Into<String>,
        operands: impl IntoIterator<Item = Operand>,
    ) -> Self {
        Self::new(BackendKind::classical(), opcode, operands)
    }

    /// Qubits touched by this instruction.
    pub fn qubits(&self) -> impl Iterator<Item = u32> + '_ {
        self.operands.iter().filter_map(Operand::as_qubit)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>4} [{}] {}", self.seq, self.kind, self.opcode)?;
        for op in &self.operands {
            write!(f, " {op}")?;
        }
        Ok(())
    }
}
