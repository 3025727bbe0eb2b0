//! Cast protocol error types.
//!
//! Errors are categorized by the phase in which they surface:
//!
//! | Category | Variants | Handling |
//! |----------|----------|----------|
//! | **Compile-time** | `NoCastFunction`, `UnsupportedInstruction`, `UnsupportedCast`, `UnknownBackend`, `UnknownType`, `NotLazy`, `MalformedInstruction` | Abort the compilation unit |
//! | **Ledger** | `DoubleCast`, `FrozenLedger` | Fatal for the cast site |
//! | **Execution** | `BackendExecution`, `SubCompilerCrashed` | Supervisor may retry transient failures |
//! | **Interpretation** | `Interpretation`, `Overflow` | Surfaced to the cast call site |
//! | **Config** | `Configuration` | Fix the backend descriptor file |
//!
//! Unused lazy values are not errors. They are reported as [`Diagnostic`]s.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kind::BackendKind;
use crate::types::TypeName;

/// Errors raised by the cast protocol and the orchestration engine.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CastError {
    // ── Compile-time errors ──────────────────────────────────────────
    /// No cast function is registered for the `(from, to)` signature.
    #[error("No cast function from {from_type} to {to_type}")]
    NoCastFunction {
        from_type: TypeName,
        to_type: TypeName,
    },

    /// No sub-compiler in the hierarchy supports the opcode.
    #[error("Unsupported instruction '{opcode}' for backend kind {kind}")]
    UnsupportedInstruction { opcode: String, kind: BackendKind },

    /// The cast direction itself is not supported (e.g. quantum to quantum).
    #[error("Unsupported cast from {from_type} to {to_type}")]
    UnsupportedCast {
        from_type: TypeName,
        to_type: TypeName,
    },

    /// A backend kind is referenced but absent from the configuration.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// A type name is not present in the type table.
    #[error("Unknown type: {0}")]
    UnknownType(TypeName),

    /// A classical-kind type was used where a lazy value is required.
    #[error("Type {0} is classical-kind and evaluates eagerly")]
    NotLazy(TypeName),

    /// An instruction has the wrong operands for its opcode.
    #[error("Malformed instruction '{opcode}': {reason}")]
    MalformedInstruction { opcode: String, reason: String },

    // ── Ledger errors ────────────────────────────────────────────────
    /// The ledger behind this value was already triggered or resolved.
    #[error("Lazy value already cast (ledger {0})")]
    DoubleCast(u32),

    /// An append or merge was attempted on a frozen ledger.
    #[error("Ledger {0} is frozen")]
    FrozenLedger(u32),

    // ── Execution errors ─────────────────────────────────────────────
    /// A sub-compiler failed to execute its program.
    #[error("Backend {kind} execution failed: {message}")]
    BackendExecution {
        kind: BackendKind,
        message: String,
        /// Whether the failure may succeed on retry (device busy, timeout).
        transient: bool,
    },

    /// A sub-compiler task stopped answering. No recovery path exists.
    #[error("Sub-compiler for {0} crashed")]
    SubCompilerCrashed(BackendKind),

    // ── Interpretation errors ────────────────────────────────────────
    /// The execution sample does not fit the target type's policy.
    #[error("Cannot interpret sample as {target}: {message}")]
    Interpretation { target: TypeName, message: String },

    /// A value does not fit into the target type.
    #[error("Value {value} overflows {target}")]
    Overflow { value: String, target: TypeName },

    // ── Config errors ────────────────────────────────────────────────
    /// Backend descriptor configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CastError {
    /// Returns `true` if the error aborts compilation of the unit.
    pub fn is_compile_time(&self) -> bool {
        matches!(
            self,
            Self::NoCastFunction { .. }
                | Self::UnsupportedInstruction { .. }
                | Self::UnsupportedCast { .. }
                | Self::UnknownBackend(_)
                | Self::UnknownType(_)
                | Self::NotLazy(_)
                | Self::MalformedInstruction { .. }
        )
    }

    /// Returns `true` if the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendExecution { transient: true, .. })
    }

    /// Returns `true` if the failure must end the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SubCompilerCrashed(_) | Self::Configuration(_))
    }

    pub(crate) fn execution(kind: &BackendKind, message: impl Into<String>) -> Self {
        Self::BackendExecution {
            kind: kind.clone(),
            message: message.into(),
            transient: false,
        }
    }

    pub(crate) fn malformed(opcode: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedInstruction {
            opcode: opcode.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn interpretation(target: &TypeName, message: impl Into<String>) -> Self {
        Self::Interpretation {
            target: target.clone(),
            message: message.into(),
        }
    }
}

/// Result type for cast protocol operations.
pub type CastResult<T> = Result<T, CastError>;

/// Severity of a non-fatal diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Note,
}

/// Kind of a non-fatal diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// A ledger was dropped without ever being triggered by a cast.
    UnusedLazyValue {
        /// Number of pending instructions that were discarded.
        instructions: usize,
    },
}

/// A non-fatal report attached to the compilation unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    /// Warning for a lazy value that went out of scope unused.
    pub fn unused_lazy_value(owners: &[u32], instructions: usize) -> Self {
        Self {
            severity: Severity::Warning,
            kind: DiagnosticKind::UnusedLazyValue { instructions },
            message: format!(
                "lazy value(s) {owners:?} never cast; {instructions} pending instruction(s) discarded"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_time_errors() {
        let err = CastError::NoCastFunction {
            from_type: "@u3".into(),
            to_type: "f32".into(),
        };
        assert!(err.is_compile_time());
        assert!(!err.is_transient());
        assert!(
            CastError::UnsupportedInstruction {
                opcode: "qft".into(),
                kind: BackendKind::quantum(),
            }
            .is_compile_time()
        );
        assert!(!CastError::DoubleCast(3).is_compile_time());
    }

    #[test]
    fn test_transient_errors() {
        let busy = CastError::BackendExecution {
            kind: BackendKind::quantum(),
            message: "device busy".into(),
            transient: true,
        };
        assert!(busy.is_transient());
        assert!(!CastError::execution(&BackendKind::quantum(), "fault").is_transient());
        assert!(CastError::SubCompilerCrashed(BackendKind::quantum()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = CastError::UnsupportedInstruction {
            opcode: "qft".into(),
            kind: BackendKind::quantum(),
        };
        assert_eq!(
            err.to_string(),
            "Unsupported instruction 'qft' for backend kind quantum"
        );
    }

    #[test]
    fn test_unused_diagnostic() {
        let diag = Diagnostic::unused_lazy_value(&[1, 2], 3);
        assert_eq!(diag.severity, Severity::Warning);
        assert_eq!(
            diag.kind,
            DiagnosticKind::UnusedLazyValue { instructions: 3 }
        );
    }
}
