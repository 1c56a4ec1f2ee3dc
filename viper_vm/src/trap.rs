//! The dynamic trap taxonomy (§7) and the diagnostic line printed for an
//! uncaught trap (§6): `Trap @<fn>#<block_index> line <line>: <Kind>
//! (code=<N>): <message>`.

use std::fmt;

/// Traps observable at runtime. `InvalidOperation` is numbered `0`
/// because §8 scenario 6 pins that exact code in its expected output;
/// the remaining codes are this crate's own assignment (no other code
/// is pinned anywhere in the spec) — see DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    InvalidOperation,
    Overflow,
    DivideByZero,
    IndexOutOfBounds,
    DomainError,
    User,
}

impl TrapKind {
    pub fn code(self) -> i64 {
        match self {
            TrapKind::InvalidOperation => 0,
            TrapKind::Overflow => 1,
            TrapKind::DivideByZero => 2,
            TrapKind::IndexOutOfBounds => 3,
            TrapKind::DomainError => 4,
            TrapKind::User => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<TrapKind> {
        match code {
            0 => Some(TrapKind::InvalidOperation),
            1 => Some(TrapKind::Overflow),
            2 => Some(TrapKind::DivideByZero),
            3 => Some(TrapKind::IndexOutOfBounds),
            4 => Some(TrapKind::DomainError),
            5 => Some(TrapKind::User),
            _ => None,
        }
    }
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A structured trap: the kind, its numeric code, and where it happened.
/// Carries enough to both print the §6 diagnostic and to answer
/// `ErrGetKind`/`ErrGetCode`/`ErrGetIp`/`ErrGetLine` once caught by a
/// handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Trap {
    pub kind: TrapKind,
    pub code: i64,
    pub function: String,
    pub block_index: usize,
    pub instruction_index: usize,
    pub line: u32,
    pub message: String,
}

impl Trap {
    pub fn new(
        kind: TrapKind,
        function: impl Into<String>,
        block_index: usize,
        instruction_index: usize,
        line: u32,
        message: impl Into<String>,
    ) -> Self {
        Trap {
            code: kind.code(),
            kind,
            function: function.into(),
            block_index,
            instruction_index,
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trap @{}#{} line {}: {} (code={}): {}",
            self.function, self.block_index, self.line, self.kind, self.code, self.message
        )
    }
}

impl std::error::Error for Trap {}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn null_load_diagnostic_matches_the_pinned_format() {
        let trap = Trap::new(TrapKind::InvalidOperation, "main", 0, 0, 1, "null load");
        assert_eq!(trap.to_string(), "Trap @main#0 line 1: InvalidOperation (code=0): null load");
    }

    #[test_case(TrapKind::InvalidOperation)]
    #[test_case(TrapKind::Overflow)]
    #[test_case(TrapKind::DivideByZero)]
    #[test_case(TrapKind::IndexOutOfBounds)]
    #[test_case(TrapKind::DomainError)]
    #[test_case(TrapKind::User)]
    fn code_and_from_code_round_trip(kind: TrapKind) {
        assert_eq!(TrapKind::from_code(kind.code()), Some(kind));
    }
}
