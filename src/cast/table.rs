//! Cast function table.
//!
//! Maps `(source type, target type)` to a callable body. The table is built
//! by the resolution stage and only read by the dispatcher. Looking a pair
//! up happens when a cast site is compiled, so a missing function is a
//! compile-time error.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CastError, CastResult};
use crate::types::TypeName;
use crate::value::Value;

/// Body of a cast from one type to another.
pub type CastFunction = Arc<dyn Fn(Value) -> CastResult<Value> + Send + Sync>;

/// Whether a missing direct function may be replaced by a chain of casts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitivityPolicy {
    /// Only direct functions.
    #[default]
    Strict,
    /// Shortest chain of at most `max_hops` functions.
    Chained { max_hops: usize },
}

/// Resolved sequence of cast functions from a source to a target type.
#[derive(Clone)]
pub struct CastChain {
    path: Vec<TypeName>,
    functions: Vec<CastFunction>,
}

impl CastChain {
    /// Types visited, source first, target last.
    pub fn path(&self) -> &[TypeName] {
        &self.path
    }

    pub fn hops(&self) -> usize {
        self.functions.len()
    }

    /// Target of the first function, the type the raw sample is read as.
    pub fn first_target(&self) -> &TypeName {
        &self.path[self.path.len().min(2) - 1]
    }

    /// Run every function in order.
    pub fn apply(&self, value: Value) -> CastResult<Value> {
        self.functions.iter().try_fold(value, |v, f| f(v))
    }
}

impl fmt::Debug for CastChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path: Vec<&str> = self.path.iter().map(TypeName::as_str).collect();
        f.debug_struct("CastChain").field("path", &path).finish()
    }
}

/// Table of cast functions keyed by signature.
#[derive(Clone, Default)]
pub struct CastTable {
    functions: FxHashMap<(TypeName, TypeName), CastFunction>,
    transitivity: TransitivityPolicy,
}

impl CastTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in casts between primitive types.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        super::builtin::register(&mut table);
        table
    }

    pub fn with_transitivity(mut self, transitivity: TransitivityPolicy) -> Self {
        self.transitivity = transitivity;
        self
    }

    pub fn transitivity(&self) -> TransitivityPolicy {
        self.transitivity
    }

    /// Register a function, replacing any previous one for the pair.
    pub fn register<F>(&mut self, from: impl Into<TypeName>, to: impl Into<TypeName>, function: F)
    where
        F: Fn(Value) -> CastResult<Value> + Send + Sync + 'static,
    {
        self.functions.insert((from.into(), to.into()), Arc::new(function));
    }

    pub fn contains(&self, from: &TypeName, to: &TypeName) -> bool {
        self.functions.contains_key(&(from.clone(), to.clone()))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Resolve the function(s) for a cast site.
    pub fn compile(&self, from: &TypeName, to: &TypeName) -> CastResult<CastChain> {
        if let Some(function) = self.functions.get(&(from.clone(), to.clone())) {
            return Ok(CastChain {
                path: vec![from.clone(), to.clone()],
                functions: vec![Arc::clone(function)],
            });
        }
        let missing = || CastError::NoCastFunction {
            from_type: from.clone(),
            to_type: to.clone(),
        };
        match self.transitivity {
            TransitivityPolicy::Strict => Err(missing()),
            TransitivityPolicy::Chained { max_hops } => {
                let chain = self.shortest_chain(from, to, max_hops).ok_or_else(missing)?;
                debug!(from = %from, to = %to, hops = chain.hops(), "resolved chained cast");
                Ok(chain)
            }
        }
    }

    /// Breadth-first search over signatures. Neighbours are visited in name
    /// order so the chosen chain is stable.
    fn shortest_chain(&self, from: &TypeName, to: &TypeName, max_hops: usize) -> Option<CastChain> {
        let mut parents: FxHashMap<TypeName, TypeName> = FxHashMap::default();
        let mut seen = BTreeSet::from([from.clone()]);
        let mut queue = VecDeque::from([(from.clone(), 0usize)]);

        while let Some((current, depth)) = queue.pop_front() {
            if &current == to {
                break;
            }
            if depth == max_hops {
                continue;
            }
            let mut next: Vec<&TypeName> = self
                .functions
                .keys()
                .filter(|(src, _)| *src == current)
                .map(|(_, dst)| dst)
                .collect();
            next.sort();
            for dst in next {
                if seen.insert(dst.clone()) {
                    parents.insert(dst.clone(), current.clone());
                    queue.push_back((dst.clone(), depth + 1));
                }
            }
        }

        if !parents.contains_key(to) {
            return None;
        }
        let mut path = vec![to.clone()];
        while let Some(parent) = parents.get(&path[path.len() - 1]) {
            path.push(parent.clone());
        }
        path.reverse();
        let functions = path
            .windows(2)
            .map(|pair| self.functions.get(&(pair[0].clone(), pair[1].clone())).cloned())
            .collect::<Option<Vec<_>>>()?;
        Some(CastChain { path, functions })
    }
}

impl fmt::Debug for CastTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CastTable")
            .field("functions", &self.functions.len())
            .field("transitivity", &self.transitivity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CastTable {
        let mut table = CastTable::new();
        table.register("a", "b", |v| Ok(Value::Int(v.as_i128().unwrap_or(0) as i64 + 1)));
        table.register("b", "c", |v| Ok(Value::Int(v.as_i128().unwrap_or(0) as i64 * 10)));
        table
    }

    #[test]
    fn test_direct_lookup() {
        let chain = table().compile(&"a".into(), &"b".into()).unwrap();
        assert_eq!(chain.hops(), 1);
        assert_eq!(chain.apply(Value::Int(1)).unwrap(), Value::Int(2));
        assert_eq!(chain.first_target().as_str(), "b");
    }

    #[test]
    fn test_strict_rejects_chains() {
        let err = table().compile(&"a".into(), &"c".into()).unwrap_err();
        assert!(matches!(err, CastError::NoCastFunction { .. }));
        assert!(err.is_compile_time());
    }

    #[test]
    fn test_chained_policy_finds_path() {
        let table = table().with_transitivity(TransitivityPolicy::Chained { max_hops: 2 });
        let chain = table.compile(&"a".into(), &"c".into()).unwrap();
        let path: Vec<_> = chain.path().iter().map(TypeName::as_str).collect();
        assert_eq!(path, vec!["a", "b", "c"]);
        assert_eq!(chain.first_target().as_str(), "b");
        assert_eq!(chain.apply(Value::Int(1)).unwrap(), Value::Int(20));
    }

    #[test]
    fn test_chained_policy_respects_hop_limit() {
        let table = table().with_transitivity(TransitivityPolicy::Chained { max_hops: 1 });
        assert!(table.compile(&"a".into(), &"c".into()).is_err());
    }
}
