//! State-vector quantum sub-compiler.
//!
//! Lowers quantum-kind instructions into a gate list and runs it on a
//! real-amplitude state-vector simulator with seeded shot sampling.
//!
//! | Opcode | Operands | Lowers to |
//! |--------|----------|-----------|
//! | `init` | literal, qubits | `x` on every qubit whose bit is set |
//! | `redim` | qubits | `h` on each qubit |
//! | `sync` | two or more qubits | `h` on the first, then a `cx` chain |
//! | `x` `z` `h` | qubit | itself |
//! | `cx` `cz` `swap` | two qubits | itself |
//! | `ry` | angle, qubit | itself |
//! | `x_if` | condition, qubit | `x` guarded by the condition |
//! | `measure` | qubits | measurement order |
//! | `barrier` | qubits | itself |
//!
//! Measurement is deferred to the end of the program. When the program has
//! no `measure`, every touched qubit is measured in ascending order.
//!
//! Settings come from the descriptor metadata: `shots` (default 1024),
//! `seed` (default 7) and `max_qubits` (default 16).

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::FRAC_1_SQRT_2;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::capability::{Capabilities, InstructionSet};
use crate::error::{CastError, CastResult};
use crate::ledger::{Instruction, Operand};
use crate::registry::BackendDescriptor;
use crate::sample::{Counts, ExecutionSample, MeasuredSample};
use crate::subcompiler::{NativeOp, NativeProgram, SubCompiler, passes};

const DEFAULT_SHOTS: u64 = 1024;
const DEFAULT_SEED: u64 = 7;
const DEFAULT_MAX_QUBITS: u64 = 16;
/// Hard limit of the simulator, whatever the descriptor asks for.
const SIMULATOR_QUBIT_LIMIT: u64 = 24;

/// The built-in state-vector simulator.
#[derive(Debug)]
pub struct StatevectorCompiler {
    name: String,
    capabilities: Capabilities,
    passes: Vec<String>,
    shots: u32,
    seed: u64,
    max_qubits: usize,
    runs: AtomicU64,
}

impl StatevectorCompiler {
    /// Simulator configured from a descriptor.
    pub fn from_descriptor(descriptor: &BackendDescriptor) -> CastResult<Self> {
        let shots = descriptor.metadata_u64("shots").unwrap_or(DEFAULT_SHOTS);
        let shots = u32::try_from(shots)
            .ok()
            .filter(|&s| s > 0)
            .ok_or_else(|| {
                CastError::Configuration(format!(
                    "backend '{}': shots must be between 1 and {}",
                    descriptor.name,
                    u32::MAX
                ))
            })?;
        let max_qubits = descriptor
            .metadata_u64("max_qubits")
            .unwrap_or(DEFAULT_MAX_QUBITS);
        if max_qubits == 0 || max_qubits > SIMULATOR_QUBIT_LIMIT {
            return Err(CastError::Configuration(format!(
                "backend '{}': max_qubits must be between 1 and {SIMULATOR_QUBIT_LIMIT}",
                descriptor.name
            )));
        }

        let instructions = descriptor
            .instructions
            .intersect(&InstructionSet::statevector());
        Ok(Self {
            name: descriptor.name.clone(),
            capabilities: Capabilities::new(descriptor.kind(), instructions).simulated(),
            passes: descriptor.passes.clone(),
            shots,
            seed: descriptor.metadata_u64("seed").unwrap_or(DEFAULT_SEED),
            max_qubits: max_qubits as usize,
            runs: AtomicU64::new(0),
        })
    }

    pub fn shots(&self) -> u32 {
        self.shots
    }

    fn lower_one(&self, instr: &Instruction, program: &mut NativeProgram) -> CastResult<()> {
        let seq = instr.seq;
        let ops = &instr.operands;
        let gate = |code: &str, qubits: &[u32]| {
            NativeOp::new(seq, code, qubits.iter().map(|&q| Operand::Qubit(q)))
        };

        match instr.opcode.as_str() {
            "init" => {
                let value = match ops.first() {
                    Some(Operand::Int(v)) if *v >= 0 => *v as u64,
                    Some(Operand::Bool(b)) => u64::from(*b),
                    _ => return Err(CastError::malformed("init", "expected a non-negative literal")),
                };
                let qubits = qubit_list(instr, 1, 1)?;
                if qubits.len() < 64 && value >> qubits.len() != 0 {
                    return Err(CastError::malformed(
                        "init",
                        format!("{value} does not fit in {} qubit(s)", qubits.len()),
                    ));
                }
                for (i, &q) in qubits.iter().enumerate() {
                    if value >> i & 1 == 1 {
                        program.push(gate("x", &[q]));
                    }
                }
            }
            "redim" => {
                for q in qubit_list(instr, 0, 1)? {
                    program.push(gate("h", &[q]));
                }
            }
            "sync" => {
                let qubits = qubit_list(instr, 0, 2)?;
                program.push(gate("h", &qubits[..1]));
                for pair in qubits.windows(2) {
                    program.push(gate("cx", pair));
                }
            }
            "x" | "z" | "h" => {
                let qubits = qubit_list(instr, 0, 1)?;
                exact(instr, &qubits, 1)?;
                program.push(gate(&instr.opcode, &qubits));
            }
            "cx" | "cz" | "swap" => {
                let qubits = qubit_list(instr, 0, 2)?;
                exact(instr, &qubits, 2)?;
                program.push(gate(&instr.opcode, &qubits));
            }
            "ry" => {
                let angle = match ops.first() {
                    Some(a @ (Operand::Float(_) | Operand::Int(_) | Operand::Reg(_))) => a.clone(),
                    _ => return Err(CastError::malformed("ry", "expected an angle")),
                };
                let qubits = qubit_list(instr, 1, 1)?;
                exact(instr, &qubits, 1)?;
                program.push(NativeOp::new(seq, "ry", [angle, Operand::Qubit(qubits[0])]));
            }
            "x_if" => {
                let condition = match ops.first() {
                    Some(c @ (Operand::Reg(_) | Operand::Bool(_) | Operand::Int(_))) => c.clone(),
                    _ => return Err(CastError::malformed("x_if", "expected a condition")),
                };
                let qubits = qubit_list(instr, 1, 1)?;
                exact(instr, &qubits, 1)?;
                program.push(gate("x", &qubits).with_guard(condition));
            }
            "measure" => {
                program.push(gate("measure", &qubit_list(instr, 0, 1)?));
            }
            "barrier" => {
                program.push(gate("barrier", &qubit_list(instr, 0, 0)?));
            }
            other => {
                return Err(CastError::UnsupportedInstruction {
                    opcode: other.to_string(),
                    kind: instr.kind.clone(),
                });
            }
        }
        Ok(())
    }

    fn fail(&self, message: impl Into<String>) -> CastError {
        CastError::execution(&self.capabilities.kind, message)
    }
}

#[async_trait]
impl SubCompiler for StatevectorCompiler {
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
            self.lower_one(instr, &mut program)?;
        }
        for pass in &self.passes {
            passes::run(pass, &mut program)?;
        }
        debug!(
            backend = %self.name,
            instructions = instructions.len(),
            ops = program.len(),
            "lowered quantum program"
        );
        Ok(program)
    }

    async fn execute(&self, program: &NativeProgram) -> CastResult<ExecutionSample> {
        let started = Instant::now();
        if program
            .ops
            .iter()
            .any(|op| op.guard.is_some() || op.args.iter().any(|a| a.as_reg().is_some()))
        {
            return Err(self.fail("program has unbound registers"));
        }

        let touched: BTreeSet<u32> = program.ops.iter().flat_map(NativeOp::qubits).collect();
        let mut measured: Vec<u32> = Vec::new();
        for op in program.ops.iter().filter(|op| op.code == "measure") {
            for q in op.qubits() {
                if !measured.contains(&q) {
                    measured.push(q);
                }
            }
        }
        if measured.is_empty() {
            measured = touched.iter().copied().collect();
        }
        if measured.is_empty() {
            return Err(self.fail("program measures no qubits"));
        }
        if touched.len() > self.max_qubits {
            return Err(self.fail(format!(
                "program uses {} qubits, backend allows {}",
                touched.len(),
                self.max_qubits
            )));
        }

        let dense: BTreeMap<u32, usize> = touched.iter().enumerate().map(|(i, &q)| (q, i)).collect();
        let mut state = StateVector::new(dense.len());
        for op in &program.ops {
            let local: Vec<usize> = op.qubits().map(|q| dense[&q]).collect();
            let arity = match op.code.as_str() {
                "x" | "z" | "h" | "ry" => 1,
                "cx" | "cz" | "swap" => 2,
                _ => 0,
            };
            if local.len() < arity {
                return Err(self.fail(format!("'{}' expects {arity} qubit(s)", op.code)));
            }
            match op.code.as_str() {
                "x" => state.x(local[0]),
                "z" => state.z(local[0]),
                "h" => state.h(local[0]),
                "cx" => state.cx(local[0], local[1]),
                "cz" => state.cz(local[0], local[1]),
                "swap" => state.swap(local[0], local[1]),
                "ry" => {
                    let theta = op
                        .args
                        .first()
                        .and_then(Operand::literal)
                        .and_then(|v| v.as_f64())
                        .ok_or_else(|| self.fail("ry angle is not numeric"))?;
                    state.ry(theta, local[0]);
                }
                "measure" | "barrier" => {}
                other => return Err(self.fail(format!("cannot simulate '{other}'"))),
            }
        }

        let run = self.runs.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(run));
        let positions: Vec<usize> = measured.iter().map(|q| dense[q]).collect();
        let mut tally: BTreeMap<usize, u64> = BTreeMap::new();
        for _ in 0..self.shots {
            *tally.entry(state.sample(&mut rng)).or_default() += 1;
        }
        let counts: Counts = tally
            .into_iter()
            .map(|(basis, count)| {
                let bits: String = positions
                    .iter()
                    .rev()
                    .map(|&p| if basis >> p & 1 == 1 { '1' } else { '0' })
                    .collect();
                (bits, count)
            })
            .collect();

        let elapsed = started.elapsed().as_millis() as u64;
        info!(
            backend = %self.name,
            qubits = dense.len(),
            shots = self.shots,
            outcomes = counts.len(),
            elapsed_ms = elapsed,
            "executed quantum program"
        );
        let metadata = serde_json::json!({
            "backend": self.name,
            "seed": self.seed.wrapping_add(run),
            "qasm": to_qasm(program, &dense, &measured),
        });
        Ok(ExecutionSample::Measured(
            MeasuredSample::new(counts, self.shots, measured)
                .with_execution_time(elapsed)
                .with_metadata(metadata),
        ))
    }
}

/// Qubit operands from `start` on, distinct, at least `min` of them.
fn qubit_list(instr: &Instruction, start: usize, min: usize) -> CastResult<Vec<u32>> {
    let rest = instr.operands.get(start..).unwrap_or_default();
    let qubits: Vec<u32> = rest
        .iter()
        .map(|o| {
            o.as_qubit()
                .ok_or_else(|| CastError::malformed(&instr.opcode, format!("{o} is not a qubit")))
        })
        .collect::<CastResult<_>>()?;
    if qubits.len() < min {
        return Err(CastError::malformed(
            &instr.opcode,
            format!("expected at least {min} qubit(s)"),
        ));
    }
    let distinct: BTreeSet<_> = qubits.iter().collect();
    if distinct.len() != qubits.len() {
        return Err(CastError::malformed(&instr.opcode, "repeated qubit"));
    }
    Ok(qubits)
}

fn exact(instr: &Instruction, qubits: &[u32], n: usize) -> CastResult<()> {
    if qubits.len() == n {
        Ok(())
    } else {
        Err(CastError::malformed(
            &instr.opcode,
            format!("expected {n} qubit(s), got {}", qubits.len()),
        ))
    }
}

/// Render a bound program as OpenQASM 2 over dense qubit indices.
pub fn to_qasm(program: &NativeProgram, dense: &BTreeMap<u32, usize>, measured: &[u32]) -> String {
    let mut lines = vec![
        "OPENQASM 2.0;".to_string(),
        "include \"qelib1.inc\";".to_string(),
        format!("qreg q[{}];", dense.len()),
        format!("creg c[{}];", measured.len()),
    ];
    for op in &program.ops {
        let qubits: Vec<String> = op
            .qubits()
            .map(|q| format!("q[{}]", dense.get(&q).copied().unwrap_or_default()))
            .collect();
        match op.code.as_str() {
            "measure" => {}
            "barrier" if qubits.is_empty() => lines.push("barrier q;".into()),
            "ry" => {
                let angle = op.args.first().map(ToString::to_string).unwrap_or_default();
                lines.push(format!("ry({angle}) {};", qubits.join(",")));
            }
            code => lines.push(format!("{code} {};", qubits.join(","))),
        }
    }
    for (bit, q) in measured.iter().enumerate() {
        if let Some(index) = dense.get(q) {
            lines.push(format!("measure q[{index}] -> c[{bit}];"));
        }
    }
    lines.join("\n")
}

/// Real amplitudes over `n` qubits. Local qubit `k` is bit `k` of the basis index.
struct StateVector {
    amplitudes: Vec<f64>,
}

impl StateVector {
    fn new(n: usize) -> Self {
        let mut amplitudes = vec![0.0; 1 << n];
        amplitudes[0] = 1.0;
        Self { amplitudes }
    }

    fn x(&mut self, k: usize) {
        let mask = 1 << k;
        for i in 0..self.amplitudes.len() {
            if i & mask == 0 {
                self.amplitudes.swap(i, i | mask);
            }
        }
    }

    fn z(&mut self, k: usize) {
        let mask = 1 << k;
        for (i, amp) in self.amplitudes.iter_mut().enumerate() {
            if i & mask != 0 {
                *amp = -*amp;
            }
        }
    }

    fn h(&mut self, k: usize) {
        self.rotate(k, FRAC_1_SQRT_2, FRAC_1_SQRT_2, FRAC_1_SQRT_2, -FRAC_1_SQRT_2);
    }

    fn ry(&mut self, theta: f64, k: usize) {
        let (s, c) = (theta / 2.0).sin_cos();
        self.rotate(k, c, -s, s, c);
    }

    /// Apply the real 2x2 matrix `[[a, b], [c, d]]` to qubit `k`.
    fn rotate(&mut self, k: usize, a: f64, b: f64, c: f64, d: f64) {
        let mask = 1 << k;
        for i in 0..self.amplitudes.len() {
            if i & mask == 0 {
                let (lo, hi) = (self.amplitudes[i], self.amplitudes[i | mask]);
                self.amplitudes[i] = a * lo + b * hi;
                self.amplitudes[i | mask] = c * lo + d * hi;
            }
        }
    }

    fn cx(&mut self, control: usize, target: usize) {
        let (cm, tm) = (1 << control, 1 << target);
        for i in 0..self.amplitudes.len() {
            if i & cm != 0 && i & tm == 0 {
                self.amplitudes.swap(i, i | tm);
            }
        }
    }

    fn cz(&mut self, a: usize, b: usize) {
        let both = (1 << a) | (1 << b);
        for (i, amp) in self.amplitudes.iter_mut().enumerate() {
            if i & both == both {
                *amp = -*amp;
            }
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        let (am, bm) = (1 << a, 1 << b);
        for i in 0..self.amplitudes.len() {
            if i & am != 0 && i & bm == 0 {
                self.amplitudes.swap(i, i ^ am ^ bm);
            }
        }
    }

    /// Draw one basis state.
    fn sample(&self, rng: &mut StdRng) -> usize {
        let r: f64 = rng.random::<f64>();
        let mut acc = 0.0;
        let mut last = 0;
        for (i, amp) in self.amplitudes.iter().enumerate() {
            let p = amp * amp;
            if p <= f64::EPSILON {
                continue;
            }
            acc += p;
            last = i;
            if r < acc {
                return i;
            }
        }
        last
    }
}
