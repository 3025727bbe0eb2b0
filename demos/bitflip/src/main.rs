//! Minimal bit-flip sub-compiler plugged into a session.
//!
//! This demo shows how to implement the `SubCompiler` trait for a backend
//! that only understands `init`, `x` and `measure`, register it under a
//! module name, and cast lazy values through it.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use hhat_cast::{
    BackendKind, BackendRegistry, Capabilities, CastError, CastResult, Counts, ExecutionSample,
    Instruction, InstructionSet, MeasuredSample, ModuleTable, NativeOp, NativeProgram, Operand,
    Session, SubCompiler, Value,
};

const BITFLIP_MODULE: &str = "demo:bitflip";

const REGISTRY: &str = r#"{
  "backends": {
    "classical": {
      "level": 0,
      "module": "builtin:classical",
      "instructions": { "opcodes": ["const", "mov", "add", "lt", "not", "barrier", "cast"] }
    },
    "quantum": {
      "level": 1,
      "module": "demo:bitflip",
      "instructions": { "opcodes": ["init", "x", "measure"] },
      "metadata": { "shots": 100 }
    }
  }
}"#;

/// Classical bits standing in for qubits.
struct BitFlip {
    capabilities: Capabilities,
    shots: u32,
}

impl BitFlip {
    fn new(kind: BackendKind, shots: u32) -> Self {
        Self {
            capabilities: Capabilities::new(
                kind,
                InstructionSet::from_opcodes(["init", "x", "measure"]),
            )
            .simulated(),
            shots,
        }
    }
}

#[async_trait]
impl SubCompiler for BitFlip {
    fn name(&self) -> &str {
        "bitflip"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn lower(&self, instructions: &[Instruction]) -> CastResult<NativeProgram> {
        let mut program = NativeProgram::new(self.capabilities.kind.clone());
        for instr in instructions {
            let qubits = instr.qubits().map(Operand::Qubit);
            match instr.opcode.as_str() {
                "init" => {
                    let Some(Operand::Int(value)) = instr.operands.first() else {
                        return Err(CastError::MalformedInstruction {
                            opcode: "init".into(),
                            reason: "expected a literal".into(),
                        });
                    };
                    for (bit, q) in qubits.enumerate() {
                        if *value >> bit & 1 == 1 {
                            program.push(NativeOp::new(instr.seq, "x", [q]));
                        }
                    }
                }
                "x" | "measure" => program.push(NativeOp::new(instr.seq, instr.opcode.as_str(), qubits)),
                other => {
                    return Err(CastError::UnsupportedInstruction {
                        opcode: other.to_string(),
                        kind: self.capabilities.kind.clone(),
                    });
                }
            }
        }
        Ok(program)
    }

    async fn execute(&self, program: &NativeProgram) -> CastResult<ExecutionSample> {
        let mut flipped = BTreeSet::new();
        let mut measured = Vec::new();
        for op in &program.ops {
            for q in op.qubits() {
                match op.code.as_str() {
                    "x" if !flipped.insert(q) => {
                        flipped.remove(&q);
                    }
                    "measure" => measured.push(q),
                    _ => {}
                }
            }
        }

        // Rightmost character is the first measured qubit.
        let bitstring: String = measured
            .iter()
            .rev()
            .map(|q| if flipped.contains(q) { '1' } else { '0' })
            .collect();
        let mut counts = Counts::new();
        counts.insert(bitstring, u64::from(self.shots));

        Ok(ExecutionSample::Measured(
            MeasuredSample::new(counts, self.shots, measured).with_execution_time(0),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = BackendRegistry::from_json(REGISTRY)?;
    let mut modules = ModuleTable::builtin();
    modules.register(BITFLIP_MODULE, |descriptor| {
        let shots = descriptor.metadata_u64("shots").unwrap_or(1) as u32;
        Ok(Box::new(BitFlip::new(descriptor.kind(), shots)) as Box<dyn SubCompiler>)
    });

    let mut session = Session::builder(Arc::new(registry))
        .modules(modules)
        .start()?;
    println!("Spawned: {:?}", session.plan().kinds().iter().map(|k| k.name()).collect::<Vec<_>>());

    // Encode a classical literal, flip one bit, cast it back.
    let q = session.encode(Value::Int(5), "@u3").await?;
    session.apply(&q, "x", q.qubit(1))?;
    let n = session.cast(&q, "u32").await?;
    println!("5 with bit 1 flipped: {n}");
    println!("State after cast: {:?}", session.state(&q));

    // A second cast on the same value is rejected.
    if let Err(e) = session.cast(&q, "u32").await {
        println!("Second cast: {e}");
    }

    // A lazy value nobody casts is reported, not executed.
    let unused = session.lazy("@u2")?;
    session.apply(&unused, "x", unused.qubit(0))?;

    for diagnostic in session.finish().await {
        println!("Diagnostic: {}", diagnostic.message);
    }

    Ok(())
}
