//! Optimization passes run on lowered programs.
//!
//! Passes are named in a backend descriptor's `passes` list and run in that
//! order right after lowering.

use tracing::debug;

use crate::error::{CastError, CastResult};
use crate::subcompiler::{NativeOp, NativeProgram};

/// Drop adjacent pairs of identical self-inverse gates.
pub const CANCEL_INVERSES: &str = "cancel-inverses";
/// Drop ordering fences.
pub const DROP_BARRIERS: &str = "drop-barriers";

const KNOWN: &[&str] = &[CANCEL_INVERSES, DROP_BARRIERS];
const SELF_INVERSE: &[&str] = &["x", "z", "h", "cx", "cz", "swap"];

/// Check whether a pass name is recognized.
pub fn is_known(name: &str) -> bool {
    KNOWN.contains(&name)
}

/// Run one pass over `program` in place.
pub fn run(name: &str, program: &mut NativeProgram) -> CastResult<()> {
    let before = program.len();
    match name {
        CANCEL_INVERSES => cancel_inverses(program),
        DROP_BARRIERS => program.ops.retain(|op| op.code != "barrier"),
        other => {
            return Err(CastError::Configuration(format!(
                "unknown optimization pass '{other}'"
            )));
        }
    }
    debug!(pass = name, before, after = program.len(), "ran optimization pass");
    Ok(())
}

fn cancels(a: &NativeOp, b: &NativeOp) -> bool {
    SELF_INVERSE.contains(&a.code.as_str())
        && a.code == b.code
        && a.args == b.args
        && a.guard.is_none()
        && b.guard.is_none()
}

fn cancel_inverses(program: &mut NativeProgram) {
    let mut kept: Vec<NativeOp> = Vec::with_capacity(program.ops.len());
    for op in program.ops.drain(..) {
        match kept.last() {
            Some(last) if cancels(last, &op) => {
                kept.pop();
            }
            _ => kept.push(op),
        }
    }
    program.ops = kept;
}
