//! A tree-walking virtual machine over Viper IL modules (§4.H, §5, §6):
//! three interchangeable dispatch strategies, a tagged register `Slot`
//! in place of the spec's literal untagged union, a structured trap
//! model, and execution tracing.

mod dispatch;
mod frame;
mod ops;
mod pool;
mod slot;
mod tracer;
mod vm;

pub use dispatch::DispatchKind;
pub use pool::RegisterPool;
pub use slot::Slot;
pub use tracer::{TraceMode, Tracer};
pub use trap::{Trap, TrapKind};
pub use vm::{PrepareError, Vm};

pub mod trap;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use viper_ir::{BasicBlock, Function, Instruction, Module, Opcode, Parameter, Type, Value};

    /// Builds the §8 scenario 1 module: a recursive `factorial(n)` and a
    /// `main` that checks `factorial(10) == 3628800`.
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

    fn null_load_module() -> Module {
        let mut module = Module::new();
        let mut main = Function::new("main", Type::I64, vec![]);
        {
            let entry = main.entry_mut();
            entry.push(Instruction::new(Opcode::ConstNull).with_result(0, Type::Ptr));
            entry.push(
                Instruction::new(Opcode::Load)
                    .with_result(1, Type::I64)
                    .with_operands(vec![Value::Temp(0)])
                    .with_loc(viper_support::SourceLoc::new(0, 1, 1)),
            );
            entry.push(Instruction::ret(Some(Value::Temp(1))));
        }
        module.add_function(main);
        module
    }

    #[rstest::rstest]
    #[case::switch(DispatchKind::Switch)]
    #[case::table(DispatchKind::Table)]
    #[case::threaded(DispatchKind::Threaded)]
    fn factorial_matches_under_every_dispatch_strategy(#[case] kind: DispatchKind) {
        let mut vm = Vm::with_dispatch(factorial_module(), kind);
        assert_eq!(vm.run().unwrap(), 0, "dispatch {:?}", kind);
    }

    #[rstest::rstest]
    #[case::switch(DispatchKind::Switch)]
    #[case::table(DispatchKind::Table)]
    #[case::threaded(DispatchKind::Threaded)]
    fn null_load_traps_with_the_pinned_diagnostic(#[case] kind: DispatchKind) {
        let mut vm = Vm::with_dispatch(null_load_module(), kind);
        let trap = vm.run().unwrap_err();
        assert_eq!(trap.to_string(), "Trap @main#0 line 1: InvalidOperation (code=0): null load", "dispatch {:?}", kind);
    }

    #[test]
    fn alloca_store_load_round_trips_through_the_bump_region() {
        let mut module = Module::new();
        let mut main = Function::new("main", Type::I64, vec![]);
        {
            let entry = main.entry_mut();
            entry.push(Instruction::new(Opcode::Alloca).with_result(0, Type::Ptr).with_operands(vec![Value::ConstInt(16, false)]));
            entry.push(Instruction::new(Opcode::Store).with_operands(vec![Value::Temp(0), Value::ConstInt(42, false)]));
            entry.push(Instruction::new(Opcode::Gep).with_result(1, Type::Ptr).with_operands(vec![Value::Temp(0), Value::ConstInt(8, false)]));
            entry.push(Instruction::new(Opcode::Store).with_operands(vec![Value::Temp(1), Value::ConstInt(7, false)]));
            entry.push(Instruction::new(Opcode::Load).with_result(2, Type::I64).with_operands(vec![Value::Temp(0)]));
            entry.push(Instruction::new(Opcode::Load).with_result(3, Type::I64).with_operands(vec![Value::Temp(1)]));
            entry.push(Instruction::binary(Opcode::Add, 4, Type::I64, Value::Temp(2), Value::Temp(3)));
            entry.push(Instruction::ret(Some(Value::Temp(4))));
        }
        module.add_function(main);
        let mut vm = Vm::new(module);
        assert_eq!(vm.run().unwrap(), 49);
    }

    #[test]
    fn idx_chk_traps_out_of_bounds_indices() {
        let mut module = Module::new();
        let mut main = Function::new("main", Type::I64, vec![]);
        {
            let entry = main.entry_mut();
            entry.push(
                Instruction::new(Opcode::IdxChk)
                    .with_result(0, Type::I64)
                    .with_operands(vec![Value::ConstInt(5, false), Value::ConstInt(0, false), Value::ConstInt(3, false)]),
            );
            entry.push(Instruction::ret(Some(Value::Temp(0))));
        }
        module.add_function(main);
        let mut vm = Vm::new(module);
        let trap = vm.run().unwrap_err();
        assert_eq!(trap.kind, TrapKind::IndexOutOfBounds);
    }
}
