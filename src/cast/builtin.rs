//! Built-in cast functions.
//!
//! Classical widening and narrowing casts between the primitive types, and
//! quantum-to-classical casts from the quantum unsigned types. Quantum
//! sources receive the intermediate produced by the result interpreter:
//! `Bits` for integer targets, `Histogram` for `sample`, `F64` for floats.
//! Floats narrow to integers by truncating toward zero.

use crate::cast::table::CastTable;
use crate::error::{CastError, CastResult};
use crate::types::TypeName;
use crate::value::Value;

const CLASSICAL_CASTS: &[(&str, &[&str])] = &[
    ("bool", &["int", "u32", "i32", "u64", "i64", "f32", "f64", "float"]),
    ("int", &["bool", "u32", "i32", "u64", "i64", "f32", "f64", "float"]),
    ("u32", &["int", "u64", "i64", "f32", "f64", "float"]),
    ("u64", &["int", "u32", "f32", "f64"]),
    ("i32", &["int", "i64", "f32", "f64"]),
    ("i64", &["int", "i32", "f32", "f64"]),
    ("f32", &["f64"]),
    ("f64", &["f32"]),
    ("float", &["bool", "int"]),
];

const QUANTUM_SOURCES: &[&str] = &["@bool", "@u2", "@u3", "@u4"];
const QUANTUM_INTEGER_TARGETS: &[&str] = &["bool", "int", "u32", "u64", "i64"];

/// Register every built-in cast into `table`.
pub fn register(table: &mut CastTable) {
    for &(from, targets) in CLASSICAL_CASTS {
        for &to in targets {
            let target = TypeName::from(to);
            table.register(from, to, move |v| convert(&v, &target));
        }
    }

    for &from in QUANTUM_SOURCES {
        for &to in QUANTUM_INTEGER_TARGETS {
            let target = TypeName::from(to);
            table.register(from, to, move |v| convert(&v, &target));
        }
        table.register(from, "sample", |v| match v {
            Value::Histogram(_) => Ok(v),
            other => Err(mismatch(&other, "sample")),
        });
        for to in ["f64", "float"] {
            let target = TypeName::from(to);
            table.register(from, to, move |v| convert(&v, &target));
        }
    }
}

fn mismatch(value: &Value, target: &str) -> CastError {
    CastError::interpretation(&TypeName::from(target), format!("cannot cast {value} ({})", value.type_name()))
}

fn overflow(value: &Value, target: &TypeName) -> CastError {
    CastError::Overflow {
        value: value.to_string(),
        target: target.clone(),
    }
}

/// Convert a scalar into a primitive type, checking the range.
pub fn convert(value: &Value, target: &TypeName) -> CastResult<Value> {
    let integer = || -> CastResult<i128> {
        if let Some(v) = value.as_i128() {
            return Ok(v);
        }
        match value.as_f64() {
            Some(f) if f.is_finite() => Ok(f.trunc() as i128),
            Some(_) => Err(overflow(value, target)),
            None => Err(mismatch(value, target.as_str())),
        }
    };
    let float = || value.as_f64().ok_or_else(|| mismatch(value, target.as_str()));

    Ok(match target.as_str() {
        "bool" => Value::Bool(value.truthy()),
        "int" => Value::Int(i64::try_from(integer()?).map_err(|_| overflow(value, target))?),
        "u32" => Value::U32(u32::try_from(integer()?).map_err(|_| overflow(value, target))?),
        "u64" => Value::U64(u64::try_from(integer()?).map_err(|_| overflow(value, target))?),
        "i32" => Value::I32(i32::try_from(integer()?).map_err(|_| overflow(value, target))?),
        "i64" => Value::I64(i64::try_from(integer()?).map_err(|_| overflow(value, target))?),
        "f32" => Value::F32(float()? as f32),
        "f64" => Value::F64(float()?),
        "float" => Value::Float(float()?),
        _ => return Err(mismatch(value, target.as_str())),
    })
}
