//! Shared rewrite helpers used by SCCP and Peephole: applying a
//! temp-to-constant substitution across a function, and collapsing a
//! terminator whose condition or scrutinee has become a literal
//! constant (§4.F.1, §4.F.3).

use std::collections::HashMap;

use viper_ir::{Function, Instruction, Opcode, TempId, Value};

use crate::stats::OptimizationStats;

/// Replaces every operand and branch-argument reference to a temp in
/// `subst` with its constant value. Returns whether anything changed.
pub fn apply_substitutions(func: &mut Function, subst: &HashMap<TempId, Value>) -> bool {
    let mut changed = false;
    for block in &mut func.blocks {
        for instr in &mut block.instructions {
            for operand in instr.operands.iter_mut() {
                if let Value::Temp(id) = operand {
                    if let Some(v) = subst.get(id) {
                        *operand = v.clone();
                        changed = true;
                    }
                }
            }
            for args in instr.branch_args.iter_mut() {
                for a in args.iter_mut() {
                    if let Value::Temp(id) = a {
                        if let Some(v) = subst.get(id) {
                            *a = v.clone();
                            changed = true;
                        }
                    }
                }
            }
        }
    }
    changed
}

/// Rewrites a `CBr` with a literal boolean condition, or a `SwitchI32`
/// with a literal scrutinee, to an unconditional `Br` to the resolved
/// target, preserving that target's branch-argument list.
pub fn fold_known_terminators(func: &mut Function, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    for block in &mut func.blocks {
        let Some(last) = block.instructions.last() else { continue };
        let rewrite = match last.opcode {
            Opcode::CBr => last.operands.first().and_then(|v| v.as_const_bool()).map(|cond| {
                let idx = if cond { 0 } else { 1 };
                (last.labels[idx].clone(), last.branch_args[idx].clone())
            }),
            Opcode::SwitchI32 => last.operands.first().and_then(|v| v.as_const_int()).map(|scrut| {
                let scrut32 = scrut as i32;
                let mut idx = 0usize;
                for (i, &case_val) in last.cases.iter().enumerate() {
                    if case_val == scrut32 {
                        idx = i + 1;
                        break;
                    }
                }
                (last.labels[idx].clone(), last.branch_args[idx].clone())
            }),
            _ => None,
        };
        if let Some((label, args)) = rewrite {
            let was_switch = last.opcode == Opcode::SwitchI32;
            *block.instructions.last_mut().unwrap() = Instruction::br(label, args);
            if was_switch {
                stats.switch_to_br += 1;
            } else {
                stats.cbr_to_br += 1;
            }
            changed = true;
        }
    }
    changed
}
