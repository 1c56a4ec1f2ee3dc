//! The closed type lattice of the IL (§3 "Type").

use std::fmt;
use serde::{Deserialize, Serialize};

/// Every value in a well-formed module has exactly one of these types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// The absence of a value; only legal as a function return type.
    Void,
    /// Boolean, represented as a single bit.
    I1,
    I16,
    I32,
    I64,
    F64,
    /// Opaque machine-word pointer.
    Ptr,
    /// Reference-counted string handle (§4.B).
    Str,
    /// Opaque error value threaded through structured exception handling.
    Error,
    /// Opaque token produced by an EH entry and consumed by a `Resume*`.
    ResumeTok,
}

impl Type {
    pub fn is_integer(self) -> bool {
        matches!(self, Type::I1 | Type::I16 | Type::I32 | Type::I64)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || matches!(self, Type::F64)
    }

    pub fn bit_width(self) -> Option<u32> {
        match self {
            Type::I1 => Some(1),
            Type::I16 => Some(16),
            Type::I32 => Some(32),
            Type::I64 => Some(64),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Type::Void => "void",
            Type::I1 => "i1",
            Type::I16 => "i16",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F64 => "f64",
            Type::Ptr => "ptr",
            Type::Str => "str",
            Type::Error => "error",
            Type::ResumeTok => "resume_tok",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Type {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "void" => Ok(Type::Void),
            "i1" => Ok(Type::I1),
            "i16" => Ok(Type::I16),
            "i32" => Ok(Type::I32),
            "i64" => Ok(Type::I64),
            "f64" => Ok(Type::F64),
            "ptr" => Ok(Type::Ptr),
            "str" => Ok(Type::Str),
            "error" => Ok(Type::Error),
            "resume_tok" => Ok(Type::ResumeTok),
            other => Err(format!("unknown type '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_parse() {
        for ty in [
            Type::Void, Type::I1, Type::I16, Type::I32, Type::I64,
            Type::F64, Type::Ptr, Type::Str, Type::Error, Type::ResumeTok,
        ] {
            let printed = ty.to_string();
            let parsed: Type = printed.parse().unwrap();
            assert_eq!(ty, parsed);
        }
    }

    #[test]
    fn integer_and_numeric_classification() {
        assert!(Type::I32.is_integer());
        assert!(Type::I32.is_numeric());
        assert!(Type::F64.is_numeric());
        assert!(!Type::F64.is_integer());
        assert!(!Type::Ptr.is_numeric());
    }
}
