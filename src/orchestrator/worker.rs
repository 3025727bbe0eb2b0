//! Sub-compiler task loop.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{CastError, CastResult};
use crate::kind::BackendKind;
use crate::orchestrator::message::{Envelope, Request, Response, SessionId};
use crate::subcompiler::{NativeProgram, SubCompiler};

/// One sub-compiler behind a channel. Staged programs live here, so no
/// state of this kind is shared with other tasks.
pub(crate) struct Worker {
    kind: BackendKind,
    compiler: Arc<dyn SubCompiler>,
    inbox: mpsc::Receiver<Envelope>,
    staged: FxHashMap<SessionId, NativeProgram>,
}

impl Worker {
    pub(crate) fn new(
        kind: BackendKind,
        compiler: Arc<dyn SubCompiler>,
        inbox: mpsc::Receiver<Envelope>,
    ) -> Self {
        Self {
            kind,
            compiler,
            inbox,
            staged: FxHashMap::default(),
        }
    }

    /// Serve requests until `Shutdown` or until every sender is gone.
    pub(crate) async fn run(mut self) {
        debug!(kind = %self.kind, backend = self.compiler.name(), "sub-compiler task started");
        while let Some(envelope) = self.inbox.recv().await {
            let request = envelope.request.name();
            let stop = matches!(envelope.request, Request::Shutdown);
            let result = self.handle(envelope.request).await;
            if envelope.reply.send(result).is_err() {
                debug!(kind = %self.kind, request, "caller stopped waiting");
            }
            if stop {
                break;
            }
        }
        if !self.staged.is_empty() {
            warn!(kind = %self.kind, sessions = self.staged.len(), "sub-compiler stopped with staged work");
        }
        debug!(kind = %self.kind, "sub-compiler task stopped");
    }

    async fn handle(&mut self, request: Request) -> CastResult<Response> {
        match request {
            Request::Lower { instructions } => {
                self.compiler.lower(&instructions).map(Response::Lowered)
            }
            Request::Stage { session, program } => {
                let slot = self
                    .staged
                    .entry(session)
                    .or_insert_with(|| NativeProgram::new(self.kind.clone()));
                slot.extend(program);
                Ok(Response::Staged { ops: slot.len() })
            }
            Request::Execute { session, timeout } => self.execute(session, timeout).await,
            Request::Close { session } => {
                self.staged.remove(&session);
                Ok(Response::Closed)
            }
            Request::Shutdown => Ok(Response::Stopped),
        }
    }

    /// Run the staged program and drop it once it succeeded, so the next
    /// segment of the session starts empty. A failed run stays staged for a
    /// retry.
    async fn execute(&mut self, session: SessionId, timeout: Option<Duration>) -> CastResult<Response> {
        let program = self
            .staged
            .get(&session)
            .ok_or_else(|| CastError::execution(&self.kind, format!("nothing staged for session {session}")))?;
        let run = self.compiler.execute(program);
        let sample = match timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                CastError::BackendExecution {
                    kind: self.kind.clone(),
                    message: format!("execution timed out after {limit:?}"),
                    transient: true,
                }
            })??,
            None => run.await?,
        };
        self.staged.remove(&session);
        Ok(Response::Sample(sample))
    }
}
