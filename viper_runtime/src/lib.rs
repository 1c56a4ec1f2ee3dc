//! Runtime helper ABI (§4.I, component C9): the fixed set of C-callable
//! functions the VM dispatches to when a `Call`'s callee is not a
//! module-defined function, plus the `{nothrow, readonly, pure}`
//! classification table that both the optimizer's effect analysis and
//! the VM consult.
//!
//! The table is generated from one source of truth, the same X-macro
//! idiom `viper_ir::opcode` uses for the opcode enum, so the registry
//! and the effects table can never drift apart.

use log::warn;
use viper_heap::{PayloadPtr, Str};
use viper_ir::Type;

/// A helper's effect classification. Unclassified (I/O, allocation)
/// helpers get the all-`false` conservative default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HelperEffects {
    pub nothrow: bool,
    pub readonly: bool,
    pub pure_: bool,
}

impl HelperEffects {
    pub const CONSERVATIVE: HelperEffects = HelperEffects { nothrow: false, readonly: false, pure_: false };
    pub const READONLY_NOTHROW: HelperEffects = HelperEffects { nothrow: true, readonly: true, pure_: false };
    pub const PURE_NOTHROW: HelperEffects = HelperEffects { nothrow: true, readonly: false, pure_: true };
}

pub struct HelperSpec {
    pub name: &'static str,
    pub return_type: Type,
    pub param_types: &'static [Type],
    pub effects: HelperEffects,
}

macro_rules! helper_table {
    ( $( $name:literal ( $($param:expr),* ) -> $ret:expr => $effects:expr ),* $(,)? ) => {
        const HELPERS: &[HelperSpec] = &[
            $( HelperSpec { name: $name, return_type: $ret, param_types: &[$($param),*], effects: $effects }, )*
        ];
    };
}

helper_table! {
    "rt_len"          (Type::Ptr) -> Type::I64 => HelperEffects::READONLY_NOTHROW,
    "rt_str_eq"       (Type::Ptr, Type::Ptr) -> Type::I1 => HelperEffects::READONLY_NOTHROW,
    "rt_sqrt"         (Type::F64) -> Type::F64 => HelperEffects::READONLY_NOTHROW,
    "rt_floor"        (Type::F64) -> Type::F64 => HelperEffects::READONLY_NOTHROW,
    "rt_instr2"       (Type::Ptr, Type::Ptr) -> Type::I64 => HelperEffects::READONLY_NOTHROW,
    "rt_instr3"       (Type::Ptr, Type::Ptr, Type::I64) -> Type::I64 => HelperEffects::READONLY_NOTHROW,
    "rt_abs_f64"      (Type::F64) -> Type::F64 => HelperEffects::PURE_NOTHROW,
    "rt_round_even"   (Type::F64) -> Type::F64 => HelperEffects::PURE_NOTHROW,
    "rt_cdbl_from_any" (Type::I64, Type::I64) -> Type::F64 => HelperEffects::PURE_NOTHROW,
    "rt_print_str"    (Type::Ptr) -> Type::Void => HelperEffects::CONSERVATIVE,
    "rt_print_i64"    (Type::I64) -> Type::Void => HelperEffects::CONSERVATIVE,
    "rt_print_f64"    (Type::F64) -> Type::Void => HelperEffects::CONSERVATIVE,
    "rt_str_concat"   (Type::Ptr, Type::Ptr) -> Type::Ptr => HelperEffects::CONSERVATIVE,
    "rt_array_new_i64" (Type::I64) -> Type::Ptr => HelperEffects::CONSERVATIVE,
    "rt_array_get_i64" (Type::Ptr, Type::I64) -> Type::I64 => HelperEffects::CONSERVATIVE,
    "rt_array_set_i64" (Type::Ptr, Type::I64, Type::I64) -> Type::Void => HelperEffects::CONSERVATIVE,
}

pub fn spec(name: &str) -> Option<&'static HelperSpec> {
    HELPERS.iter().find(|h| h.name == name)
}

pub fn effects(name: &str) -> Option<HelperEffects> {
    spec(name).map(|h| h.effects)
}

pub fn signature(name: &str) -> Option<(Type, Vec<Type>)> {
    spec(name).map(|h| (h.return_type, h.param_types.to_vec()))
}

pub fn is_known(name: &str) -> bool {
    spec(name).is_some()
}

pub fn all_helpers() -> &'static [HelperSpec] {
    HELPERS
}

/// The actual Rust bodies the VM invokes through the name table above.
/// Every signature here must match `HELPERS`; a mismatch is a bug in
/// this crate, not something the VM can detect.
pub mod ops {
    use super::*;

    pub fn rt_len(p: PayloadPtr) -> i64 {
        viper_heap::len(p) as i64
    }

    pub fn rt_str_eq(a: PayloadPtr, b: PayloadPtr) -> i64 {
        let sa = unsafe { std::slice::from_raw_parts(viper_heap::data(a), viper_heap::len(a)) };
        let sb = unsafe { std::slice::from_raw_parts(viper_heap::data(b), viper_heap::len(b)) };
        i64::from(sa == sb)
    }

    pub fn rt_sqrt(x: f64) -> f64 {
        x.sqrt()
    }

    pub fn rt_floor(x: f64) -> f64 {
        x.floor()
    }

    fn bytes_of(p: PayloadPtr) -> &'static [u8] {
        unsafe { std::slice::from_raw_parts(viper_heap::data(p), viper_heap::len(p)) }
    }

    /// First byte offset of `needle` within `haystack`, or `-1`.
    pub fn rt_instr2(haystack: PayloadPtr, needle: PayloadPtr) -> i64 {
        rt_instr3(haystack, needle, 0)
    }

    /// Same search starting at byte offset `start`; `start` beyond the
    /// haystack's length yields `-1` rather than panicking.
    pub fn rt_instr3(haystack: PayloadPtr, needle: PayloadPtr, start: i64) -> i64 {
        let hay = bytes_of(haystack);
        let start = start.max(0) as usize;
        if start > hay.len() {
            return -1;
        }
        let pat = bytes_of(needle);
        if pat.is_empty() {
            return start as i64;
        }
        hay[start..]
            .windows(pat.len())
            .position(|w| w == pat)
            .map(|i| (i + start) as i64)
            .unwrap_or(-1)
    }

    pub fn rt_abs_f64(x: f64) -> f64 {
        x.abs()
    }

    pub fn rt_round_even(x: f64) -> f64 {
        x.round_ties_even()
    }

    /// Converts a tagged `Slot` payload to `f64`: tag `0` reinterprets
    /// `bits` as a signed integer, tag `1` reinterprets it as the raw
    /// bits of an `f64`, anything else yields `0.0` as `i1` boolean `0`
    /// or `1`.
    pub fn rt_cdbl_from_any(tag: i64, bits: i64) -> f64 {
        match tag {
            0 => bits as f64,
            1 => f64::from_bits(bits as u64),
            2 => {
                if bits != 0 {
                    1.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    pub fn rt_print_str(p: PayloadPtr) {
        let bytes = bytes_of(p);
        print!("{}", String::from_utf8_lossy(bytes));
    }

    pub fn rt_print_i64(v: i64) {
        print!("{}", v);
    }

    pub fn rt_print_f64(v: f64) {
        print!("{}", v);
    }

    pub fn rt_str_concat(a: PayloadPtr, b: PayloadPtr) -> PayloadPtr {
        let mut joined = bytes_of(a).to_vec();
        joined.extend_from_slice(bytes_of(b));
        Str::from_bytes(&joined).into_raw()
    }

    pub fn rt_array_new_i64(len: i64) -> PayloadPtr {
        let n = len.max(0) as usize;
        viper_heap::alloc(viper_heap::PayloadKind::Array, viper_heap::ElemKind::I64, std::mem::size_of::<i64>(), n, n)
    }

    pub fn rt_array_get_i64(p: PayloadPtr, idx: i64) -> i64 {
        let n = viper_heap::len(p);
        let i = idx as usize;
        if idx < 0 || i >= n {
            warn!("index out of bounds (len={})", n);
            std::process::abort();
        }
        unsafe { *(viper_heap::data(p) as *const i64).add(i) }
    }

    pub fn rt_array_set_i64(p: PayloadPtr, idx: i64, value: i64) {
        let n = viper_heap::len(p);
        let i = idx as usize;
        if idx < 0 || i >= n {
            warn!("index out of bounds (len={})", n);
            std::process::abort();
        }
        unsafe {
            *(viper_heap::data(p) as *mut i64).add(i) = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("rt_len", true, true, false; "readonly nothrow")]
    #[test_case("rt_abs_f64", true, false, true; "pure nothrow")]
    #[test_case("rt_print_str", false, false, false; "conservative")]
    fn classification_matches_spec_table(name: &str, nothrow: bool, readonly: bool, pure_: bool) {
        let e = effects(name).unwrap();
        assert_eq!(e.nothrow, nothrow);
        assert_eq!(e.readonly, readonly);
        assert_eq!(e.pure_, pure_);
    }

    #[test]
    fn unknown_helper_has_no_spec() {
        assert!(spec("rt_does_not_exist").is_none());
        assert!(!is_known("rt_does_not_exist"));
    }

    #[test]
    fn signature_matches_table() {
        assert_eq!(signature("rt_sqrt"), Some((Type::F64, vec![Type::F64])));
        assert_eq!(signature("rt_array_set_i64"), Some((Type::Void, vec![Type::Ptr, Type::I64, Type::I64])));
    }

    #[test]
    fn instr_search_finds_and_misses() {
        let hay_ptr = Str::from_bytes(b"hello world").into_raw();
        let needle_ptr = Str::from_bytes(b"world").into_raw();
        let missing_ptr = Str::from_bytes(b"xyz").into_raw();
        assert_eq!(ops::rt_instr2(hay_ptr, needle_ptr), 6);
        assert_eq!(ops::rt_instr2(hay_ptr, missing_ptr), -1);
        assert_eq!(ops::rt_instr3(hay_ptr, needle_ptr, 7), -1);
        viper_heap::release(hay_ptr);
        viper_heap::release(needle_ptr);
        viper_heap::release(missing_ptr);
    }

    #[test]
    fn str_eq_compares_bytes() {
        let a = Str::from_bytes(b"same").into_raw();
        let b = Str::from_bytes(b"same").into_raw();
        let c = Str::from_bytes(b"different").into_raw();
        assert_eq!(ops::rt_str_eq(a, b), 1);
        assert_eq!(ops::rt_str_eq(a, c), 0);
        viper_heap::release(a);
        viper_heap::release(b);
        viper_heap::release(c);
    }

    #[test]
    fn round_even_ties_to_even_neighbor() {
        assert_eq!(ops::rt_round_even(2.5), 2.0);
        assert_eq!(ops::rt_round_even(3.5), 4.0);
    }

    #[test]
    fn cdbl_from_any_covers_each_tag() {
        assert_eq!(ops::rt_cdbl_from_any(0, 42), 42.0);
        assert_eq!(ops::rt_cdbl_from_any(1, 0x3FF0000000000000u64 as i64), 1.0);
        assert_eq!(ops::rt_cdbl_from_any(2, 1), 1.0);
        assert_eq!(ops::rt_cdbl_from_any(2, 0), 0.0);
    }
}
