//! Classical values.
//!
//! Every cast ends in a [`Value`]. Interpretation policies also produce
//! values (`Bits`, `Histogram`), which the cast functions then reshape into
//! the requested target type.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::TypeName;

/// A fully evaluated classical value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    /// Untyped integer literal.
    Int(i64),
    /// Untyped float literal.
    Float(f64),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Raw measured bits, least significant bit = first qubit of the value.
    Bits { value: u64, width: u32 },
    /// Frequency table: measured integer outcome to occurrence count.
    Histogram(BTreeMap<u64, u64>),
    /// Composite value with named fields.
    Struct {
        ty: TypeName,
        fields: Vec<(String, Value)>,
    },
}

impl Value {
    /// Name of the value's own type.
    pub fn type_name(&self) -> TypeName {
        match self {
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::U32(_) => "u32".into(),
            Value::U64(_) => "u64".into(),
            Value::I32(_) => "i32".into(),
            Value::I64(_) => "i64".into(),
            Value::F32(_) => "f32".into(),
            Value::F64(_) => "f64".into(),
            Value::Bits { .. } => "bits".into(),
            Value::Histogram(_) => "sample".into(),
            Value::Struct { ty, .. } => ty.clone(),
        }
    }

    /// Integer view of the value, if it has one.
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::Bool(b) => Some(i128::from(b)),
            Value::Int(v) | Value::I64(v) => Some(i128::from(v)),
            Value::U32(v) => Some(i128::from(v)),
            Value::U64(v) => Some(i128::from(v)),
            Value::I32(v) => Some(i128::from(v)),
            Value::Bits { value, .. } => Some(i128::from(value)),
            _ => None,
        }
    }

    /// Float view of the value, if it has one.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) | Value::F64(v) => Some(v),
            Value::F32(v) => Some(f64::from(v)),
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    /// Truthiness used by classical conditionals (`x_if`, `not`, `and`).
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Histogram(h) => !h.is_empty(),
            Value::Struct { fields, .. } => !fields.is_empty(),
            other => other.as_f64().is_some_and(|v| v != 0.0),
        }
    }

    /// Look up a field of a struct value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct { fields, .. } => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) | Value::I64(v) => write!(f, "{v}"),
            Value::Float(v) | Value::F64(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::Bits { value, width } => {
                write!(f, "{value:0width$b}", width = *width as usize)
            }
            Value::Histogram(h) => {
                write!(f, "{{")?;
                for (i, (k, v)) in h.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Struct { ty, fields } => {
                write!(f, "{ty}(")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(Value::U32(4).type_name().as_str(), "u32");
        assert_eq!(Value::Histogram(BTreeMap::new()).type_name().as_str(), "sample");
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(Value::Bits { value: 5, width: 3 }.as_i128(), Some(5));
        assert_eq!(Value::Bool(true).as_f64(), Some(1.0));
        assert_eq!(Value::Histogram(BTreeMap::new()).as_i128(), None);
    }

    #[test]
    fn test_display_bits_padded() {
        assert_eq!(Value::Bits { value: 1, width: 3 }.to_string(), "001");
        assert_eq!(Value::U64(42).to_string(), "42");
    }

    #[test]
    fn test_truthy() {
        assert!(Value::Int(2).truthy());
        assert!(!Value::U32(0).truthy());
        assert!(!Value::Bool(false).truthy());
    }
}
