//! SSA values (§3 "Value") — temporaries, constants, and global addresses.

use std::fmt;
use serde::{Deserialize, Serialize};

/// Dense nonnegative integer identifying an SSA temporary.
pub type TempId = u32;

/// A use-site operand or a branch argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Temp(TempId),
    ConstInt(i64, bool),
    ConstFloat(f64),
    ConstStr(Vec<u8>),
    GlobalAddr(String),
    NullPtr,
}

impl Value {
    pub fn const_bool(b: bool) -> Self {
        Value::ConstInt(if b { 1 } else { 0 }, true)
    }

    pub fn is_constant(&self) -> bool {
        !matches!(self, Value::Temp(_))
    }

    pub fn as_temp(&self) -> Option<TempId> {
        match self {
            Value::Temp(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            Value::ConstInt(v, _) => Some(*v),
            _ => None,
        }
    }

    pub fn as_const_float(&self) -> Option<f64> {
        match self {
            Value::ConstFloat(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_const_bool(&self) -> Option<bool> {
        match self {
            Value::ConstInt(v, true) => Some(*v != 0),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Temp(id) => write!(f, "%t{}", id),
            Value::ConstInt(v, true) => write!(f, "{}", if *v != 0 { "true" } else { "false" }),
            Value::ConstInt(v, false) => write!(f, "{}", v),
            Value::ConstFloat(v) => {
                if v.is_nan() {
                    write!(f, "NaN")
                } else if v.is_infinite() {
                    write!(f, "{}", if *v > 0.0 { "Inf" } else { "-Inf" })
                } else {
                    write!(f, "{}", v)
                }
            }
            Value::ConstStr(bytes) => {
                write!(f, "\"")?;
                for &b in bytes {
                    match b {
                        b'\n' => write!(f, "\\n")?,
                        b'\t' => write!(f, "\\t")?,
                        b'"' => write!(f, "\\\"")?,
                        b'\\' => write!(f, "\\\\")?,
                        0x20..=0x7e => write!(f, "{}", b as char)?,
                        _ => write!(f, "\\x{:02X}", b)?,
                    }
                }
                write!(f, "\"")
            }
            Value::GlobalAddr(name) => write!(f, "@{}", name),
            Value::NullPtr => write!(f, "null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_textual_grammar() {
        assert_eq!(Value::Temp(3).to_string(), "%t3");
        assert_eq!(Value::ConstInt(1, true).to_string(), "true");
        assert_eq!(Value::ConstInt(0, true).to_string(), "false");
        assert_eq!(Value::ConstInt(-42, false).to_string(), "-42");
        assert_eq!(Value::ConstFloat(f64::NAN).to_string(), "NaN");
        assert_eq!(Value::ConstFloat(f64::INFINITY).to_string(), "Inf");
        assert_eq!(Value::ConstFloat(f64::NEG_INFINITY).to_string(), "-Inf");
        assert_eq!(Value::GlobalAddr("g".into()).to_string(), "@g");
        assert_eq!(Value::NullPtr.to_string(), "null");
    }

    #[test]
    fn const_str_escapes_control_bytes() {
        let v = Value::ConstStr(b"a\nb\"c".to_vec());
        assert_eq!(v.to_string(), "\"a\\nb\\\"c\"");
    }

    #[test]
    fn accessor_helpers() {
        assert_eq!(Value::Temp(1).as_temp(), Some(1));
        assert_eq!(Value::ConstInt(5, false).as_const_int(), Some(5));
        assert_eq!(Value::ConstInt(1, true).as_const_bool(), Some(true));
        assert!(Value::ConstInt(1, false).is_constant());
        assert!(!Value::Temp(0).is_constant());
    }

    proptest::proptest! {
        #[test]
        fn const_int_round_trips_through_as_const_int(v: i64) {
            proptest::prop_assert_eq!(Value::ConstInt(v, false).as_const_int(), Some(v));
        }

        #[test]
        fn const_bool_matches_its_source_bool(b: bool) {
            proptest::prop_assert_eq!(Value::const_bool(b).as_const_bool(), Some(b));
        }

        #[test]
        fn const_str_escaping_keeps_printable_ascii_verbatim(bytes in proptest::collection::vec(0x20u8..=0x7e, 0..32)) {
            let rendered = Value::ConstStr(bytes.clone()).to_string();
            proptest::prop_assert_eq!(rendered, format!("\"{}\"", String::from_utf8(bytes).unwrap().replace('\\', "\\\\").replace('"', "\\\"")));
        }
    }
}
