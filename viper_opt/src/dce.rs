//! Dead code elimination (§4.F.6): drops instructions whose result is
//! unused and which carry no side effect, then drops blocks the CFG
//! can no longer reach from the entry. Terminators and EH-sensitive
//! opcodes are never touched, even when structurally dead, since the
//! unwind protocol they implement is not visible to a local liveness
//! scan.

use std::collections::HashSet;

use viper_ir::{Function, Value};

use viper_analysis::CfgContext;

use crate::stats::OptimizationStats;

fn used_temps(func: &Function) -> HashSet<viper_ir::TempId> {
    let mut used = HashSet::new();
    for block in &func.blocks {
        for instr in &block.instructions {
            for operand in &instr.operands {
                if let Value::Temp(id) = operand {
                    used.insert(*id);
                }
            }
            for args in &instr.branch_args {
                for a in args {
                    if let Value::Temp(id) = a {
                        used.insert(*id);
                    }
                }
            }
        }
    }
    used
}

fn remove_dead_instructions(func: &mut Function, stats: &mut OptimizationStats) -> bool {
    let used = used_temps(func);
    let mut changed = false;
    for block in &mut func.blocks {
        let before = block.instructions.len();
        block.instructions.retain(|instr| {
            if instr.is_terminator() || instr.opcode.has_side_effects() {
                return true;
            }
            match instr.result {
                Some((id, _)) => used.contains(&id),
                None => true,
            }
        });
        let removed = before - block.instructions.len();
        if removed > 0 {
            stats.instructions_folded += removed as u64;
            changed = true;
        }
    }
    changed
}

fn remove_unreachable_blocks(func: &mut Function, stats: &mut OptimizationStats) -> bool {
    let cfg = CfgContext::build(func);
    let mut reachable = vec![false; cfg.block_count()];
    let mut stack = vec![0usize];
    reachable[0] = true;
    while let Some(b) = stack.pop() {
        for &s in cfg.successors(b) {
            if !reachable[s] {
                reachable[s] = true;
                stack.push(s);
            }
        }
    }
    let before = func.blocks.len();
    let mut idx = 0usize;
    func.blocks.retain(|_| {
        let keep = reachable[idx];
        idx += 1;
        keep
    });
    let removed = before - func.blocks.len();
    if removed > 0 {
        stats.blocks_removed += removed as u64;
    }
    removed > 0
}

/// Runs instruction- and block-level DCE to a fixed point.
pub fn run(func: &mut Function, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    loop {
        let mut round = remove_unreachable_blocks(func, stats);
        round |= remove_dead_instructions(func, stats);
        changed |= round;
        if !round {
            break;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use viper_ir::{BasicBlock, Instruction, Opcode, Type};

    #[test]
    fn unused_pure_instruction_is_removed() {
        let mut f = Function::new("f", Type::I64, vec![]);
        f.entry_mut().push(Instruction::binary(Opcode::Add, 0, Type::I64, Value::ConstInt(1, false), Value::ConstInt(2, false)));
        f.entry_mut().push(Instruction::ret(Some(Value::ConstInt(0, false))));

        let mut stats = OptimizationStats::new();
        assert!(run(&mut f, &mut stats));
        assert!(f.entry().instructions.iter().all(|i| i.opcode != Opcode::Add));
    }

    #[test]
    fn unused_call_is_never_removed() {
        let mut f = Function::new("f", Type::Void, vec![]);
        f.entry_mut().push(Instruction::call(Some((0, Type::I64)), "helper", vec![]));
        f.entry_mut().push(Instruction::ret(None));

        let mut stats = OptimizationStats::new();
        assert!(!run(&mut f, &mut stats));
        assert!(f.entry().instructions.iter().any(|i| i.opcode == Opcode::Call));
    }

    #[test]
    fn block_with_no_predecessor_is_dropped() {
        let mut f = Function::new("f", Type::Void, vec![]);
        f.entry_mut().push(Instruction::ret(None));
        let mut orphan = BasicBlock::new("orphan");
        orphan.push(Instruction::ret(None));
        f.add_block(orphan);

        let mut stats = OptimizationStats::new();
        assert!(run(&mut f, &mut stats));
        assert!(f.block("orphan").is_none());
    }
}
