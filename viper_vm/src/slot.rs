//! The VM's register cell (§4.H "Execution state", GLOSSARY "Slot").
//!
//! The spec describes an untagged union selected by the instruction's
//! static type. A real untagged union would need `unsafe` at every read
//! to stay sound; since every use site already carries the static type
//! that would select the union arm, a safe tagged enum costs nothing at
//! the tree-walking granularity this VM operates at and removes an
//! entire class of UB. See DESIGN.md for this substitution.

use viper_heap::PayloadPtr;
use viper_ir::Type;

/// One VM register. `Ptr` is shared by `Type::Ptr`, `Type::Str`,
/// `Type::Error`, and `Type::ResumeTok` — all four are opaque handles at
/// the VM's level; the IL's static type distinguishes their meaning.
#[derive(Debug, Clone, Copy)]
pub enum Slot {
    I64(i64),
    F64(f64),
    Ptr(PayloadPtr),
}

impl Slot {
    pub fn zero_for(ty: Type) -> Slot {
        match ty {
            Type::F64 => Slot::F64(0.0),
            Type::Ptr | Type::Str | Type::Error | Type::ResumeTok => Slot::Ptr(std::ptr::null_mut()),
            _ => Slot::I64(0),
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Slot::I64(v) => v,
            Slot::F64(v) => v as i64,
            Slot::Ptr(p) => p as i64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Slot::F64(v) => v,
            Slot::I64(v) => v as f64,
            Slot::Ptr(_) => 0.0,
        }
    }

    pub fn as_ptr(self) -> PayloadPtr {
        match self {
            Slot::Ptr(p) => p,
            Slot::I64(v) => v as usize as PayloadPtr,
            Slot::F64(_) => std::ptr::null_mut(),
        }
    }

    pub fn is_null_ptr(self) -> bool {
        matches!(self, Slot::Ptr(p) if p.is_null())
    }
}
