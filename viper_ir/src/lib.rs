//! Core data model for the Viper intermediate language: modules,
//! functions, blocks with parameters, SSA instructions, opcodes, types,
//! and values (§3, component C1).
//!
//! This crate is a pure in-memory graph: construction is explicit and
//! serialized on a single thread, and nothing here performs I/O or
//! validation — that is the job of `viper_text` (parsing/printing) and
//! `viper_verify` (structural checking).

pub mod function;
pub mod instruction;
pub mod module;
pub mod opcode;
pub mod types;
pub mod value;

pub use function::{Function, Parameter};
pub use instruction::{BasicBlock, BlockParam, CallAttrs, Instruction};
pub use module::{Extern, Global, Module};
pub use opcode::Opcode;
pub use types::Type;
pub use value::{TempId, Value};

use thiserror::Error;

/// Errors raised while constructing or querying the IR, as distinct from
/// the verifier's structural diagnostics (`viper_verify::VerifyError`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IrError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unknown block '{0}' in function '{1}'")]
    UnknownBlock(String, String),
    #[error("unknown temp %t{0} in function '{1}'")]
    UnknownTemp(TempId, String),
}

pub type IrResult<T> = Result<T, IrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_tiny_module_by_hand() {
        let mut module = Module::new();
        let mut main = Function::new("main", Type::I64, vec![]);
        main.entry_mut().push(Instruction::ret(Some(Value::ConstInt(0, false))));
        module.add_function(main);

        assert!(module.function("main").is_some());
        assert_eq!(module.function("main").unwrap().entry().instructions.len(), 1);
    }
}
