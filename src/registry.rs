//! Backend descriptor registry.
//!
//! The registry is the process-wide table of backend kinds. It is loaded
//! from a JSON descriptor file before any compilation starts and is never
//! mutated afterwards; components receive it as an `Arc<BackendRegistry>`.
//!
//! ```json
//! {
//!   "backends": {
//!     "classical": {
//!       "level": 0,
//!       "module": "builtin:classical",
//!       "instructions": { "opcodes": ["const", "add", "..."] }
//!     },
//!     "quantum": {
//!       "level": 1,
//!       "module": "builtin:statevector",
//!       "instructions": { "opcodes": ["init", "h", "cx", "..."] },
//!       "passes": ["cancel-inverses"],
//!       "metadata": { "shots": 1024, "seed": 7 }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capability::InstructionSet;
use crate::error::{CastError, CastResult};
use crate::kind::{BackendKind, CLASSICAL, QUANTUM};
use crate::subcompiler::passes;

/// Module reference of the built-in classical evaluator.
pub const CLASSICAL_MODULE: &str = "builtin:classical";
/// Module reference of the built-in state-vector simulator.
pub const STATEVECTOR_MODULE: &str = "builtin:statevector";

/// Description of one backend kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Kind name. Filled from the map key when loading a file.
    #[serde(default)]
    pub name: String,
    /// Hierarchy level. Higher levels subsume lower ones.
    pub level: u32,
    /// Opcodes this backend recognizes.
    pub instructions: InstructionSet,
    /// Reference to the executable module implementing the sub-compiler.
    pub module: String,
    /// Optimization passes run during lowering, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passes: Vec<String>,
    /// Backend-specific settings (shots, seed, device address, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl BackendDescriptor {
    /// Descriptor of the built-in classical evaluator.
    pub fn classical() -> Self {
        Self {
            name: CLASSICAL.into(),
            level: 0,
            instructions: InstructionSet::classical(),
            module: CLASSICAL_MODULE.into(),
            passes: vec![],
            metadata: serde_json::Value::Null,
        }
    }

    /// Descriptor of the built-in state-vector simulator.
    pub fn statevector() -> Self {
        Self {
            name: QUANTUM.into(),
            level: 1,
            instructions: InstructionSet::statevector(),
            module: STATEVECTOR_MODULE.into(),
            passes: vec![passes::CANCEL_INVERSES.into()],
            metadata: serde_json::json!({ "shots": 1024, "seed": 7, "max_qubits": 16 }),
        }
    }

    /// The kind this descriptor registers.
    pub fn kind(&self) -> BackendKind {
        BackendKind::new(self.name.clone(), self.level)
    }

    pub fn supports(&self, opcode: &str) -> bool {
        self.instructions.contains(opcode)
    }

    /// Replace the metadata object.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Read an unsigned integer setting from the metadata.
    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(serde_json::Value::as_u64)
    }

    fn validate(&self) -> CastResult<()> {
        if self.module.trim().is_empty() {
            return Err(CastError::Configuration(format!(
                "backend '{}' has no module",
                self.name
            )));
        }
        if let Some(pass) = self.passes.iter().find(|p| !passes::is_known(p)) {
            return Err(CastError::Configuration(format!(
                "backend '{}' requests unknown pass '{pass}'",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    backends: BTreeMap<String, BackendDescriptor>,
}

/// Immutable table of backend descriptors.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    descriptors: BTreeMap<String, BackendDescriptor>,
}

impl BackendRegistry {
    /// Build a registry from descriptors, validating them.
    pub fn new(descriptors: impl IntoIterator<Item = BackendDescriptor>) -> CastResult<Self> {
        let mut map = BTreeMap::new();
        for descriptor in descriptors {
            descriptor.validate()?;
            if map.insert(descriptor.name.clone(), descriptor).is_some() {
                return Err(CastError::Configuration(
                    "duplicate backend descriptor".into(),
                ));
            }
        }

        match map.get(CLASSICAL) {
            Some(classical) if classical.level == 0 => {}
            Some(_) => {
                return Err(CastError::Configuration(
                    "the classical backend must have level 0".into(),
                ));
            }
            None => {
                return Err(CastError::Configuration(
                    "a 'classical' backend is required as universal fallback".into(),
                ));
            }
        }

        debug!(backends = map.len(), "backend registry validated");
        Ok(Self { descriptors: map })
    }

    /// Registry with the built-in classical evaluator and state-vector simulator.
    pub fn builtin() -> Self {
        let mut descriptors = BTreeMap::new();
        for d in [BackendDescriptor::classical(), BackendDescriptor::statevector()] {
            descriptors.insert(d.name.clone(), d);
        }
        Self { descriptors }
    }

    /// Parse and validate a JSON descriptor document.
    pub fn from_json(json: &str) -> CastResult<Self> {
        let file: RegistryFile = serde_json::from_str(json)
            .map_err(|e| CastError::Configuration(format!("invalid backend config: {e}")))?;
        Self::new(file.backends.into_iter().map(|(name, mut d)| {
            d.name = name;
            d
        }))
    }

    /// Load a JSON descriptor file.
    pub fn from_path(path: impl AsRef<Path>) -> CastResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CastError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let registry = Self::from_json(&text)?;
        info!(path = %path.display(), backends = registry.len(), "loaded backend registry");
        Ok(registry)
    }

    pub fn descriptor(&self, name: &str) -> Option<&BackendDescriptor> {
        self.descriptors.get(name)
    }

    /// Resolve a kind name, failing with `UnknownBackend`.
    pub fn kind(&self, name: &str) -> CastResult<BackendKind> {
        self.descriptor(name)
            .map(BackendDescriptor::kind)
            .ok_or_else(|| CastError::UnknownBackend(name.to_string()))
    }

    /// Descriptor of a kind, failing with `UnknownBackend` when the kind is
    /// absent or registered with a different level.
    pub fn require(&self, kind: &BackendKind) -> CastResult<&BackendDescriptor> {
        self.descriptor(kind.name())
            .filter(|d| d.level == kind.level())
            .ok_or_else(|| CastError::UnknownBackend(kind.name().to_string()))
    }

    pub fn classical(&self) -> &BackendDescriptor {
        // `new` and `builtin` both guarantee the entry.
        &self.descriptors[CLASSICAL]
    }

    /// All kinds, in hierarchy order.
    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.descriptors.values().map(BackendDescriptor::kind).collect();
        kinds.sort();
        kinds
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

static GLOBAL: OnceLock<Arc<BackendRegistry>> = OnceLock::new();

/// Install the process-wide registry. Succeeds exactly once.
pub fn install(registry: BackendRegistry) -> CastResult<Arc<BackendRegistry>> {
    let registry = Arc::new(registry);
    GLOBAL
        .set(Arc::clone(&registry))
        .map_err(|_| CastError::Configuration("backend registry already installed".into()))?;
    info!(backends = registry.len(), "installed global backend registry");
    Ok(registry)
}

/// The process-wide registry, if installed.
pub fn global() -> Option<Arc<BackendRegistry>> {
    GLOBAL.get().cloned()
}
