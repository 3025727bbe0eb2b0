//! Messages between the orchestrator and sub-compiler tasks.
//!
//! Every request travels in an [`Envelope`] carrying a oneshot return
//! address. Sub-compilers never talk to each other.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{CastError, CastResult};
use crate::kind::BackendKind;
use crate::ledger::Instruction;
use crate::sample::ExecutionSample;
use crate::subcompiler::NativeProgram;

/// Identity of one ledger execution across the sub-compiler tasks.
pub type SessionId = u64;

/// Work for a sub-compiler task.
#[derive(Debug)]
pub enum Request {
    /// Lower a kind-tagged instruction batch.
    Lower { instructions: Vec<Instruction> },
    /// Append a bound program segment to a session.
    Stage {
        session: SessionId,
        program: NativeProgram,
    },
    /// Run what a session staged since its previous run.
    Execute {
        session: SessionId,
        timeout: Option<Duration>,
    },
    /// Forget a session.
    Close { session: SessionId },
    /// Stop the task.
    Shutdown,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Lower { .. } => "lower",
            Request::Stage { .. } => "stage",
            Request::Execute { .. } => "execute",
            Request::Close { .. } => "close",
            Request::Shutdown => "shutdown",
        }
    }
}

/// Answer of a sub-compiler task.
#[derive(Debug)]
pub enum Response {
    Lowered(NativeProgram),
    Staged { ops: usize },
    Sample(ExecutionSample),
    Closed,
    Stopped,
}

/// A request with its return address.
#[derive(Debug)]
pub struct Envelope {
    pub kind: BackendKind,
    pub request: Request,
    pub reply: oneshot::Sender<CastResult<Response>>,
}

/// Send `request` to a task and wait for the answer.
///
/// A closed channel or a dropped return address means the task is gone.
pub async fn call(
    tx: &mpsc::Sender<Envelope>,
    kind: &BackendKind,
    request: Request,
) -> CastResult<Response> {
    let (reply, answer) = oneshot::channel();
    let envelope = Envelope {
        kind: kind.clone(),
        request,
        reply,
    };
    tx.send(envelope)
        .await
        .map_err(|_| CastError::SubCompilerCrashed(kind.clone()))?;
    answer
        .await
        .map_err(|_| CastError::SubCompilerCrashed(kind.clone()))?
}

/// Wrong response variant for a request.
pub(crate) fn unexpected(kind: &BackendKind, request: &str, response: &Response) -> CastError {
    CastError::execution(kind, format!("unexpected reply to {request}: {response:?}"))
}
