//! Dispatch strategy selection (§4.H "Dispatch"). All three strategies
//! execute the exact same `crate::ops::op_*` functions — they differ
//! only in how a `HandlerFn` is located for a given instruction, which
//! is what §8 invariant 4 requires to hold: running the same module
//! under each strategy must produce identical observable behavior.

use std::collections::HashMap;

use viper_ir::Opcode;

use crate::ops::HandlerFn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    /// One big `match` on the opcode (`crate::ops::exec_switch`).
    Switch,
    /// A `HashMap<Opcode, HandlerFn>` built once at VM construction.
    Table,
    /// A per-function `Vec<Vec<HandlerFn>>`, parallel to that
    /// function's blocks and instructions, built the first time the
    /// function runs — the safe-Rust analog of computed-goto/threaded
    /// dispatch: after the first visit, stepping an instruction is a
    /// direct index instead of a lookup.
    Threaded,
}

impl DispatchKind {
    /// Reads `VIPER_DISPATCH` (`table` | `switch` | `threaded`),
    /// defaulting to `Table` when unset or unrecognized.
    pub fn from_env() -> Self {
        match std::env::var("VIPER_DISPATCH").as_deref() {
            Ok("switch") => DispatchKind::Switch,
            Ok("threaded") => DispatchKind::Threaded,
            _ => DispatchKind::Table,
        }
    }
}

pub fn build_table() -> HashMap<Opcode, HandlerFn> {
    Opcode::ALL.iter().map(|&op| (op, crate::ops::handler_for(op))).collect()
}
