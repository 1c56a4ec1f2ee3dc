//! Textual printer (§4.C). The IR types already implement `Display` in
//! the exact grammar the parser recognizes; this module is the public,
//! documented entry point plus a pretty-printing helper for diagnostics.

use viper_ir::Module;

/// Renders `module` in the textual IL grammar.
pub fn print_module(module: &Module) -> String {
    module.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;
    use pretty_assertions::assert_eq;
    use viper_ir::{Function, Instruction, Type, Value};

    #[test]
    fn print_then_parse_round_trips_a_small_module() {
        let mut module = Module::new();
        let mut main = Function::new("main", Type::I64, vec![]);
        main.entry_mut().push(Instruction::ret(Some(Value::ConstInt(7, false))));
        module.add_function(main);

        let text = print_module(&module);
        let reparsed = parse_module(&text).unwrap();
        assert_eq!(reparsed.function("main").unwrap().entry().instructions.len(), 1);
        assert_eq!(print_module(&reparsed), text);
    }
}
