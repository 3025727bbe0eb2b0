//! Execution samples.
//!
//! Bitstring ordering: the rightmost bit corresponds to the first entry of
//! the sample's `qubits` list (OpenQASM 3 convention). For example, with
//! `qubits = [4, 9]` the string `"01"` means qubit 4 measured `1` and qubit
//! 9 measured `0`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Outcome tally of one measured execution, keyed by bitstring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    outcomes: FxHashMap<String, u64>,
}

impl Counts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tally from `(bitstring, count)` pairs, summing repeats.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (impl Into<String>, u64)>) -> Self {
        pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
    }

    /// Add `count` observations of `bitstring`.
    pub fn insert(&mut self, bitstring: impl Into<String>, count: u64) {
        *self.outcomes.entry(bitstring.into()).or_default() += count;
    }

    /// Observations of `bitstring`, zero if never seen.
    pub fn get(&self, bitstring: &str) -> u64 {
        self.outcomes.get(bitstring).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.outcomes.iter()
    }

    /// Sum of all observations.
    pub fn total_shots(&self) -> u64 {
        self.outcomes.values().sum()
    }

    /// Highest-count outcome. Ties go to the smallest bitstring.
    pub fn most_frequent(&self) -> Option<(&String, &u64)> {
        self.outcomes
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
    }

    /// Lowest-count outcome. Ties go to the smallest bitstring.
    pub fn least_frequent(&self) -> Option<(&String, &u64)> {
        self.outcomes
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
    }

    /// Number of distinct outcomes.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

impl FromIterator<(String, u64)> for Counts {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        let mut tally = Self::new();
        iter.into_iter().for_each(|(bitstring, count)| tally.insert(bitstring, count));
        tally
    }
}

/// Parse a bitstring into an integer (rightmost char = bit 0).
pub fn bits_to_u64(bitstring: &str) -> Option<u64> {
    if bitstring.is_empty() || bitstring.len() > 64 {
        return None;
    }
    u64::from_str_radix(bitstring, 2).ok()
}

/// Result of repeated measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasuredSample {
    pub counts: Counts,
    /// Shots requested from the backend.
    pub shots: u32,
    /// Global qubit index of each bit, least significant first.
    pub qubits: Vec<u32>,
    /// Wall-clock time spent in `execute`, if the backend reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    /// When the execution finished.
    pub executed_at: DateTime<Utc>,
    /// Additional metadata (lowered program listing, backend name, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl MeasuredSample {
    pub fn new(counts: Counts, shots: u32, qubits: Vec<u32>) -> Self {
        Self {
            counts,
            shots,
            qubits,
            execution_time_ms: None,
            executed_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_execution_time(mut self, time_ms: u64) -> Self {
        self.execution_time_ms = Some(time_ms);
        self
    }

    /// Attach backend metadata such as the lowered listing.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Marginalize onto `targets`, in that bit order.
    ///
    /// Returns `None` if a target qubit was not measured or a bitstring has
    /// the wrong length.
    pub fn project(&self, targets: &[u32]) -> Option<MeasuredSample> {
        let width = self.qubits.len();
        let positions: Vec<usize> = targets
            .iter()
            .map(|t| self.qubits.iter().position(|q| q == t))
            .collect::<Option<_>>()?;

        let mut counts = Counts::new();
        for (bitstring, &count) in self.counts.iter() {
            let bytes = bitstring.as_bytes();
            if bytes.len() != width {
                return None;
            }
            let projected: String = positions
                .iter()
                .rev()
                .map(|&i| bytes[width - 1 - i] as char)
                .collect();
            counts.insert(projected, count);
        }

        Some(MeasuredSample {
            counts,
            shots: self.shots,
            qubits: targets.to_vec(),
            execution_time_ms: self.execution_time_ms,
            executed_at: self.executed_at,
            metadata: self.metadata.clone(),
        })
    }

    /// Counts keyed by integer outcome.
    pub fn histogram(&self) -> Option<BTreeMap<u64, u64>> {
        let mut histogram = BTreeMap::new();
        for (bitstring, &count) in self.counts.iter() {
            *histogram.entry(bits_to_u64(bitstring)?).or_default() += count;
        }
        Some(histogram)
    }
}

/// Raw output of one ledger execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionSample {
    /// Repeated measurement outcomes.
    Measured(MeasuredSample),
    /// Deterministic classical result.
    Deterministic {
        /// Last value produced, if any.
        value: Option<Value>,
        /// Final classical register file.
        registers: BTreeMap<String, Value>,
    },
}

impl ExecutionSample {
    pub fn is_measured(&self) -> bool {
        matches!(self, ExecutionSample::Measured(_))
    }

    pub fn as_measured(&self) -> Option<&MeasuredSample> {
        match self {
            ExecutionSample::Measured(m) => Some(m),
            ExecutionSample::Deterministic { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_sum_repeated_outcomes() {
        let mut counts = Counts::from_pairs([("010", 7)]);
        counts.insert("111", 2);
        counts.insert("010", 1);

        assert_eq!(counts.get("010"), 8);
        assert_eq!(counts.get("111"), 2);
        assert_eq!(counts.get("000"), 0);
        assert_eq!(counts.len(), 2);
        assert_eq!(counts.total_shots(), 10);
    }

    #[test]
    fn test_counts_most_and_least_frequent() {
        let counts = Counts::from_pairs([("00", 100), ("11", 900), ("01", 100)]);
        let (most, count) = counts.most_frequent().unwrap();
        assert_eq!((most.as_str(), *count), ("11", 900));
        let (least, _) = counts.least_frequent().unwrap();
        assert_eq!(least, "00");
    }

    #[test]
    fn test_project_reorders_bits() {
        // qubits [4, 9]: "01" means q4 = 1, q9 = 0.
        let sample = MeasuredSample::new(Counts::from_pairs([("01", 10)]), 10, vec![4, 9]);
        let swapped = sample.project(&[9, 4]).unwrap();
        assert_eq!(swapped.counts.get("10"), 10);
        let only_q4 = sample.project(&[4]).unwrap();
        assert_eq!(only_q4.counts.get("1"), 10);
        assert!(sample.project(&[7]).is_none());
    }

    #[test]
    fn test_histogram() {
        let sample = MeasuredSample::new(
            Counts::from_pairs([("101", 3), ("000", 1)]),
            4,
            vec![0, 1, 2],
        );
        let histogram = sample.histogram().unwrap();
        assert_eq!(histogram.get(&5), Some(&3));
        assert_eq!(histogram.get(&0), Some(&1));
    }

    #[test]
    fn test_bits_to_u64() {
        assert_eq!(bits_to_u64("110"), Some(6));
        assert_eq!(bits_to_u64(""), None);
        assert_eq!(bits_to_u64("12"), None);
    }
}
