//! Type normalization seam.
//!
//! The data model that normalizes values lives outside the runtime core.
//! The argument parser and commands reach it through the [`TypeModel`]
//! trait; [`BaseModel`] covers the primitive types hosts and tests need.

use common_error::{StrataError, StrataResult};

use crate::value::Value;

/// External type-normalization system.
pub trait TypeModel: Send + Sync {
    /// True when `name` is a registered type.
    fn has_type(&self, name: &str) -> bool;

    /// Normalize a value as the named type.
    fn norm(&self, name: &str, valu: &Value) -> StrataResult<Value>;
}

/// A minimal model covering `int`, `str`, `bool` and `time`.
#[derive(Debug, Default)]
pub struct BaseModel;

impl BaseModel {
    fn norm_int(valu: &Value) -> Option<i64> {
        match valu {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) => Some(*f as i64),
            Value::Str(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    fn norm_bool(valu: &Value) -> Option<bool> {
        match valu {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl TypeModel for BaseModel {
    fn has_type(&self, name: &str) -> bool {
        matches!(name, "int" | "str" | "bool" | "time")
    }

    fn norm(&self, name: &str, valu: &Value) -> StrataResult<Value> {
        let normed = match name {
            "int" => Self::norm_int(valu).map(Value::Int),
            // time values normalize to epoch millis
            "time" => Self::norm_int(valu).map(Value::Int),
            "bool" => Self::norm_bool(valu).map(Value::Bool),
            "str" => match valu {
                Value::Namespace(_) => None,
                Value::Str(s) => Some(Value::Str(s.clone())),
                other => Some(Value::Str(other.to_string())),
            },
            _ => {
                return Err(StrataError::NoSuchName(format!(
                    "No type named {name}"
                )))
            }
        };

        normed.ok_or_else(|| {
            StrataError::bad_arg(format!("Invalid value for type ({name}): {valu}"))
        })
    }
}
