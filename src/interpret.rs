//! Result interpreter.
//!
//! Turns a raw [`ExecutionSample`] into a classical-shaped intermediate for
//! a target type. The policy is chosen per target type:
//!
//! | Policy | Measured sample | Built-in targets |
//! |--------|-----------------|------------------|
//! | `MajorityVote` | most frequent outcome as `Bits` | `bool`, `int`, `u32`, `u64`, `i32`, `i64` |
//! | `LeastFrequent` | least frequent outcome as `Bits` | none |
//! | `Histogram` | outcome frequency table | `sample` |
//! | `Expectation` | count-weighted mean outcome as `F64` | `f32`, `f64`, `float` |
//! | `Direct` | the outcome, when every shot agrees | none |
//!
//! Deterministic samples carry their value through unchanged under every
//! policy. The cast function for `(source, target)` then reshapes the
//! intermediate into the final value.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{CastError, CastResult};
use crate::sample::{ExecutionSample, MeasuredSample, bits_to_u64};
use crate::types::TypeName;
use crate::value::Value;

/// Post-processing applied to a sample before the cast function runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterpretPolicy {
    MajorityVote,
    LeastFrequent,
    Histogram,
    Expectation,
    Direct,
}

/// Per-type interpretation policies.
#[derive(Debug, Clone, Default)]
pub struct ResultInterpreter {
    policies: FxHashMap<TypeName, InterpretPolicy>,
}

impl ResultInterpreter {
    /// Interpreter without any policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Policies for the built-in classical types.
    pub fn builtin() -> Self {
        let mut interpreter = Self::new();
        for ty in ["bool", "int", "u32", "u64", "i32", "i64"] {
            interpreter.register(ty, InterpretPolicy::MajorityVote);
        }
        for ty in ["f32", "f64", "float"] {
            interpreter.register(ty, InterpretPolicy::Expectation);
        }
        interpreter.register("sample", InterpretPolicy::Histogram);
        interpreter
    }

    /// Set the policy of a target type.
    pub fn register(&mut self, ty: impl Into<TypeName>, policy: InterpretPolicy) {
        self.policies.insert(ty.into(), policy);
    }

    pub fn policy(&self, ty: &TypeName) -> Option<InterpretPolicy> {
        self.policies.get(ty).copied()
    }

    /// Interpret `sample` for `target`.
    pub fn interpret(&self, sample: &ExecutionSample, target: &TypeName) -> CastResult<Value> {
        let policy = self.policy(target).ok_or_else(|| {
            CastError::interpretation(target, "no interpretation policy registered")
        })?;

        let measured = match sample {
            ExecutionSample::Deterministic { value, .. } => {
                return value.clone().ok_or_else(|| {
                    CastError::interpretation(target, "deterministic sample carries no value")
                });
            }
            ExecutionSample::Measured(measured) => measured,
        };
        validate(measured, target)?;

        let width = measured.qubits.len() as u32;
        let bits = |bitstring: &str| -> CastResult<Value> {
            let value = bits_to_u64(bitstring)
                .ok_or_else(|| CastError::interpretation(target, format!("bad outcome '{bitstring}'")))?;
            Ok(Value::Bits { value, width })
        };

        let value = match policy {
            InterpretPolicy::MajorityVote => {
                let (outcome, _) = measured.counts.most_frequent().ok_or_else(|| empty(target))?;
                bits(outcome)?
            }
            InterpretPolicy::LeastFrequent => {
                let (outcome, _) = measured.counts.least_frequent().ok_or_else(|| empty(target))?;
                bits(outcome)?
            }
            InterpretPolicy::Histogram => Value::Histogram(
                measured
                    .histogram()
                    .ok_or_else(|| CastError::interpretation(target, "unreadable outcomes"))?,
            ),
            InterpretPolicy::Expectation => {
                let histogram = measured
                    .histogram()
                    .ok_or_else(|| CastError::interpretation(target, "unreadable outcomes"))?;
                let total: u64 = histogram.values().sum();
                let weighted: f64 = histogram
                    .iter()
                    .map(|(&outcome, &count)| outcome as f64 * count as f64)
                    .sum();
                Value::F64(weighted / total as f64)
            }
            InterpretPolicy::Direct => {
                if measured.counts.len() != 1 {
                    return Err(CastError::interpretation(
                        target,
                        format!("{} distinct outcomes; direct reading needs one", measured.counts.len()),
                    ));
                }
                let (outcome, _) = measured.counts.most_frequent().ok_or_else(|| empty(target))?;
                bits(outcome)?
            }
        };
        trace!(%target, ?policy, value = %value, "interpreted sample");
        Ok(value)
    }
}

fn empty(target: &TypeName) -> CastError {
    CastError::interpretation(target, "sample has no shots")
}

fn validate(measured: &MeasuredSample, target: &TypeName) -> CastResult<()> {
    if measured.counts.is_empty() || measured.counts.total_shots() == 0 {
        return Err(empty(target));
    }
    let width = measured.qubits.len();
    if width == 0 || width > 64 {
        return Err(CastError::interpretation(
            target,
            format!("sample covers {width} qubits"),
        ));
    }
    for (bitstring, _) in measured.counts.iter() {
        if bitstring.len() != width || !bitstring.bytes().all(|b| b == b'0' || b == b'1') {
            return Err(CastError::interpretation(
                target,
                format!("malformed outcome '{bitstring}' for {width} qubit(s)"),
            ));
        }
    }
    Ok(())
}
