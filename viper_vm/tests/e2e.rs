//! End-to-end pipeline coverage for §8 scenario 1: build a module,
//! print it, round-trip it through an actual file, reparse, optimize,
//! and execute — exercising `viper_text`, `viper_opt`, and `viper_vm`
//! together the way a front end driving this toolchain would.

use std::io::Write;

use anyhow::{Context, Result};
use viper_ir::{BasicBlock, Function, Instruction, Module, Opcode, Parameter, Type, Value};
use viper_opt::PassManager;
use viper_vm::Vm;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The §8 scenario 1 module: recursive `factorial(n)` plus a `main`
/// that returns `0` iff `factorial(10) == 3628800`.
fn factorial_module() -> Module {
    let mut module = Module::new();

    let mut fact = Function::new("factorial", Type::I64, vec![Parameter::new("n", Type::I64, 0)]);
    {
        let entry = fact.entry_mut();
        entry.push(Instruction::binary(Opcode::SCmpLE, 1, Type::I1, Value::Temp(0), Value::ConstInt(1, false)));
        entry.push(Instruction::cbr(Value::Temp(1), "base", vec![], "rec", vec![]));
    }
    let mut base = BasicBlock::new("base");
    base.push(Instruction::ret(Some(Value::ConstInt(1, false))));
    fact.add_block(base);

    let mut rec = BasicBlock::new("rec");
    rec.push(Instruction::binary(Opcode::Sub, 2, Type::I64, Value::Temp(0), Value::ConstInt(1, false)));
    rec.push(Instruction::call(Some((3, Type::I64)), "factorial", vec![Value::Temp(2)]));
    rec.push(Instruction::binary(Opcode::Mul, 4, Type::I64, Value::Temp(0), Value::Temp(3)));
    rec.push(Instruction::ret(Some(Value::Temp(4))));
    fact.add_block(rec);
    module.add_function(fact);

    let mut main = Function::new("main", Type::I64, vec![]);
    {
        let entry = main.entry_mut();
        entry.push(Instruction::call(Some((0, Type::I64)), "factorial", vec![Value::ConstInt(10, false)]));
        entry.push(Instruction::binary(Opcode::ICmpEq, 1, Type::I1, Value::Temp(0), Value::ConstInt(3628800, false)));
        entry.push(Instruction::new(Opcode::Zext1).with_result(2, Type::I64).with_operands(vec![Value::Temp(1)]));
        entry.push(Instruction::binary(Opcode::ICmpEq, 3, Type::I1, Value::Temp(2), Value::ConstInt(1, false)));
        entry.push(Instruction::new(Opcode::Zext1).with_result(4, Type::I64).with_operands(vec![Value::Temp(3)]));
        entry.push(Instruction::binary(Opcode::Sub, 5, Type::I64, Value::ConstInt(1, false), Value::Temp(4)));
        entry.push(Instruction::ret(Some(Value::Temp(5))));
    }
    module.add_function(main);
    module
}

#[test]
fn factorial_survives_print_file_round_trip_o1_and_execution() -> Result<()> {
    init_logging();

    let module = factorial_module();
    let text = viper_text::print_module(&module);

    let mut file = tempfile::NamedTempFile::new().context("creating scratch IL file")?;
    file.write_all(text.as_bytes()).context("writing printed module to disk")?;
    file.flush().context("flushing the scratch IL file")?;
    let on_disk = std::fs::read_to_string(file.path()).context("reading module back from disk")?;
    let mut reparsed = viper_text::parse_module(&on_disk).context("reparsing the round-tripped module")?;

    let pm = PassManager::new();
    let result = pm.run_pipeline(&mut reparsed, "O1");
    assert!(result.recognized, "O1 must be a recognized pipeline name");

    let mut vm = Vm::new(reparsed);
    let exit_code = vm.run().context("running the optimized module")?;
    assert_eq!(exit_code, 0, "factorial(10) should equal 3628800");

    Ok(())
}
