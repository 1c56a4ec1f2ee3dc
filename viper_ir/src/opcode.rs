//! The opcode table (§3 "Opcode"), generated from one canonical list.
//!
//! The teacher's IR generates its binary/unary operator tables from a
//! single source of truth; here the equivalent is a `macro_rules!`
//! X-macro that feeds both the `Opcode` enum and its name table, so the
//! enumeration and the name table can never drift out of sync (§9).

use std::fmt;
use serde::{Deserialize, Serialize};

macro_rules! opcode_table {
    ( $( $variant:ident => $name:literal ),* $(,)? ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Opcode {
            $( $variant, )*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$variant, )* ];

            pub fn name(self) -> &'static str {
                match self {
                    $( Opcode::$variant => $name, )*
                }
            }

            pub fn from_name(name: &str) -> Option<Opcode> {
                match name {
                    $( $name => Some(Opcode::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

opcode_table! {
    // Arithmetic (wrapping)
    Add => "add", Sub => "sub", Mul => "mul",
    SDiv => "sdiv", UDiv => "udiv", SRem => "srem", URem => "urem",
    // Arithmetic (checked)
    IAddOvf => "iaddovf", ISubOvf => "isubovf", IMulOvf => "imulovf",
    SDivChk0 => "sdivchk0", UDivChk0 => "udivchk0",
    SRemChk0 => "sremchk0", URemChk0 => "uremchk0",
    // Floating point
    FAdd => "fadd", FSub => "fsub", FMul => "fmul", FDiv => "fdiv",
    // Bitwise / shift
    And => "and", Or => "or", Xor => "xor",
    Shl => "shl", LShr => "lshr", AShr => "ashr",
    // Comparisons
    ICmpEq => "icmp_eq", ICmpNe => "icmp_ne",
    SCmpLT => "scmp_lt", SCmpLE => "scmp_le", SCmpGT => "scmp_gt", SCmpGE => "scmp_ge",
    UCmpLT => "ucmp_lt", UCmpLE => "ucmp_le", UCmpGT => "ucmp_gt", UCmpGE => "ucmp_ge",
    FCmpEQ => "fcmp_eq", FCmpNE => "fcmp_ne",
    FCmpLT => "fcmp_lt", FCmpLE => "fcmp_le", FCmpGT => "fcmp_gt", FCmpGE => "fcmp_ge",
    // Conversions
    Sitofp => "sitofp", Fptosi => "fptosi",
    CastFpToSiRteChk => "cast_fp_to_si_rte_chk", CastFpToUiRteChk => "cast_fp_to_ui_rte_chk",
    CastSiNarrowChk => "cast_si_narrow_chk", CastUiNarrowChk => "cast_ui_narrow_chk",
    CastSiToFp => "cast_si_to_fp", CastUiToFp => "cast_ui_to_fp",
    Zext1 => "zext1", Trunc1 => "trunc1",
    // Memory
    Alloca => "alloca", Gep => "gep", Load => "load", Store => "store",
    AddrOf => "addr_of", ConstStr => "const_str", ConstNull => "const_null",
    // Control flow
    Br => "br", CBr => "cbr", SwitchI32 => "switch_i32", Ret => "ret",
    Trap => "trap", TrapKind => "trap_kind", TrapFromErr => "trap_from_err", TrapErr => "trap_err",
    // Structured EH
    EhPush => "eh_push", EhPop => "eh_pop", EhEntry => "eh_entry",
    ResumeSame => "resume_same", ResumeNext => "resume_next", ResumeLabel => "resume_label",
    ErrGetKind => "err_get_kind", ErrGetCode => "err_get_code",
    ErrGetIp => "err_get_ip", ErrGetLine => "err_get_line",
    // Calls
    Call => "call", CallIndirect => "call_indirect",
    // Bounds
    IdxChk => "idx_chk",
}

impl Opcode {
    /// Terminators end a block (§3 invariant 1); every other opcode must
    /// not be the last instruction, and no instruction may follow one.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Br
                | Opcode::CBr
                | Opcode::SwitchI32
                | Opcode::Ret
                | Opcode::Trap
                | Opcode::TrapKind
                | Opcode::TrapFromErr
                | Opcode::TrapErr
                | Opcode::ResumeSame
                | Opcode::ResumeNext
                | Opcode::ResumeLabel
        )
    }

    /// EH-sensitive opcodes participate in the structured exception
    /// handling protocol (GLOSSARY) and are never touched by DCE,
    /// never inlined across, and never forwarded through by SimplifyCFG.
    pub fn is_eh_sensitive(self) -> bool {
        matches!(
            self,
            Opcode::EhPush
                | Opcode::EhPop
                | Opcode::EhEntry
                | Opcode::ResumeSame
                | Opcode::ResumeNext
                | Opcode::ResumeLabel
                | Opcode::Trap
                | Opcode::TrapKind
                | Opcode::TrapFromErr
                | Opcode::TrapErr
        )
    }

    /// Opcodes with externally observable effects are immediately
    /// Overdefined in SCCP and are never removed by DCE even when their
    /// result is unused (§4.F.1, §4.F.6).
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Opcode::Call
                | Opcode::CallIndirect
                | Opcode::Load
                | Opcode::Store
                | Opcode::Alloca
                | Opcode::Gep
                | Opcode::IdxChk
        ) || self.is_terminator()
            || self.is_eh_sensitive()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use test_case::test_case;

    #[test_case(Opcode::Ret, true; "ret is a terminator")]
    #[test_case(Opcode::Br, true; "br is a terminator")]
    #[test_case(Opcode::CBr, true; "cbr is a terminator")]
    #[test_case(Opcode::SwitchI32, true; "switch_i32 is a terminator")]
    #[test_case(Opcode::Add, false; "add is not a terminator")]
    #[test_case(Opcode::Call, false; "call is not a terminator")]
    fn terminator_classification_table(op: Opcode, expected: bool) {
        assert_eq!(op.is_terminator(), expected, "{:?}", op);
    }

    #[test]
    fn every_opcode_round_trips_through_its_name() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_name(op.name()), Some(op), "opcode {:?} name table mismatch", op);
        }
    }

    #[test]
    fn names_are_unique() {
        let names: HashSet<_> = Opcode::ALL.iter().map(|op| op.name()).collect();
        assert_eq!(names.len(), Opcode::ALL.len(), "duplicate opcode name in table");
    }

    #[test]
    fn from_name_rejects_unknown_opcodes() {
        assert_eq!(Opcode::from_name("not_an_opcode"), None);
    }

    #[test]
    fn eh_sensitive_classification() {
        assert!(Opcode::EhPush.is_eh_sensitive());
        assert!(Opcode::ResumeNext.is_eh_sensitive());
        assert!(!Opcode::Add.is_eh_sensitive());
    }
}
