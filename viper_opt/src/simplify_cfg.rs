//! SimplifyCFG (§4.F.5): structural branch folding and trampoline-block
//! forwarding, run to a fixed point. EH-sensitive blocks are left alone —
//! forwarding through a handler entry would sever the unwind protocol.

use std::collections::{HashMap, HashSet};

use viper_ir::{Function, Instruction, Opcode, TempId, Value};

use crate::stats::OptimizationStats;

fn eh_sensitive_block(func: &Function, idx: usize) -> bool {
    func.blocks[idx].instructions.iter().any(|i| i.opcode.is_eh_sensitive())
}

/// Collapses a zero-case `SwitchI32` to its default edge, and a `CBr`
/// whose two successors (label and branch args) are identical to a `Br`.
fn fold_degenerate_branches(func: &mut Function, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    for block in &mut func.blocks {
        let Some(last) = block.instructions.last() else { continue };
        let rewrite = match last.opcode {
            Opcode::SwitchI32 if last.cases.is_empty() => {
                Some(Instruction::br(last.labels[0].clone(), last.branch_args[0].clone()))
            }
            Opcode::SwitchI32
                if last.cases.len() == 1
                    && last.labels[1] == last.labels[0]
                    && last.branch_args[1] == last.branch_args[0] =>
            {
                Some(Instruction::br(last.labels[0].clone(), last.branch_args[0].clone()))
            }
            Opcode::CBr if last.labels[0] == last.labels[1] && last.branch_args[0] == last.branch_args[1] => {
                Some(Instruction::br(last.labels[0].clone(), last.branch_args[0].clone()))
            }
            _ => None,
        };
        if let Some(instr) = rewrite {
            let was_switch = last.opcode == Opcode::SwitchI32;
            *block.instructions.last_mut().unwrap() = instr;
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

/// A forwarder (§4.F.5, GLOSSARY): a non-entry, non-EH-sensitive block
/// whose pre-terminator instructions are side-effect-free and whose
/// terminator is an unconditional `Br` with a single argument list. The
/// body is dropped rather than duplicated when bypassing the block, so
/// the terminator's args may reference the block's own params or any
/// value defined outside the block (both necessarily dominate every
/// predecessor, same as they dominate the forwarder itself), but never a
/// temp the dropped body computed.
struct Forwarder {
    params: Vec<TempId>,
    successor: String,
    successor_args: Vec<Value>,
}

fn forwarder_info(func: &Function, idx: usize, block: &viper_ir::BasicBlock) -> Option<Forwarder> {
    if idx == 0 || eh_sensitive_block(func, idx) {
        return None;
    }
    let (last, body) = block.instructions.split_last()?;
    if last.opcode != Opcode::Br || last.labels.len() != 1 || last.branch_args.len() != 1 {
        return None;
    }
    if body.iter().any(|i| i.opcode.has_side_effects()) {
        return None;
    }

    let body_defined: HashSet<TempId> = body.iter().filter_map(|i| i.result.map(|(id, _)| id)).collect();
    if last.branch_args[0].iter().any(|v| matches!(v, Value::Temp(id) if body_defined.contains(id))) {
        return None;
    }

    // A param referenced from any other block can't be bypassed away:
    // that reference would dangle once this block is gone.
    let params: Vec<TempId> = block.params.iter().map(|p| p.temp).collect();
    let param_ids: HashSet<TempId> = params.iter().cloned().collect();
    if !param_ids.is_empty() && references_any(func, idx, &param_ids) {
        return None;
    }

    Some(Forwarder { params, successor: last.labels[0].clone(), successor_args: last.branch_args[0].clone() })
}

fn references_any(func: &Function, except_idx: usize, ids: &HashSet<TempId>) -> bool {
    func.blocks.iter().enumerate().any(|(idx, block)| {
        if idx == except_idx {
            return false;
        }
        block.instructions.iter().any(|instr| {
            instr.operands.iter().any(|v| matches!(v, Value::Temp(id) if ids.contains(id)))
                || instr.branch_args.iter().any(|args| args.iter().any(|v| matches!(v, Value::Temp(id) if ids.contains(id))))
        })
    })
}

fn forwarders(func: &Function) -> HashMap<String, Forwarder> {
    func.blocks
        .iter()
        .enumerate()
        .filter_map(|(idx, block)| forwarder_info(func, idx, block).map(|f| (block.label.clone(), f)))
        .collect()
}

fn remap_value(v: &mut Value, subst: &HashMap<TempId, Value>) {
    if let Value::Temp(id) = v {
        if let Some(mapped) = subst.get(id) {
            *v = mapped.clone();
        }
    }
}

/// Rewrites each predecessor that branches into a forwarder to target the
/// forwarder's successor directly, substituting that predecessor's own
/// incoming argument list for the forwarder's params across the
/// forwarder's outgoing argument list (§4.F.5). Every label slot of a
/// predecessor's terminator that targets the forwarder is retargeted —
/// including both arms of a `CBr` that happen to share the same target.
fn forward_trampolines(func: &mut Function, stats: &mut OptimizationStats) -> bool {
    let targets = forwarders(func);
    if targets.is_empty() {
        return false;
    }

    let mut changed = false;
    for block_idx in 0..func.blocks.len() {
        // A forwarder's own terminator is rewritten when something forwards
        // into *it*, never when processing the forwarder itself — chains
        // resolve across `run`'s fixed-point iterations.
        if targets.contains_key(&func.blocks[block_idx].label) {
            continue;
        }
        let Some(last) = func.blocks[block_idx].instructions.last_mut() else { continue };
        let mut touched = false;
        for slot in 0..last.labels.len() {
            let Some(forwarder) = targets.get(&last.labels[slot]) else { continue };
            let subst: HashMap<TempId, Value> =
                forwarder.params.iter().cloned().zip(last.branch_args[slot].iter().cloned()).collect();
            let mut args = forwarder.successor_args.clone();
            for a in args.iter_mut() {
                remap_value(a, &subst);
            }
            last.labels[slot] = forwarder.successor.clone();
            last.branch_args[slot] = args;
            touched = true;
        }
        changed |= touched;
    }

    if changed {
        stats.predecessors_merged += 1;
    }
    changed
}

/// Removes any now-unreferenced trampoline block (no predecessor left
/// pointing at it after forwarding, and it is not the entry).
fn drop_unreferenced_blocks(func: &mut Function, stats: &mut OptimizationStats) -> bool {
    let mut referenced: std::collections::HashSet<String> = std::collections::HashSet::new();
    for block in &func.blocks {
        if let Some(term) = block.terminator() {
            for label in &term.labels {
                referenced.insert(label.clone());
            }
        }
    }
    let entry_label = func.blocks[0].label.clone();
    let before = func.blocks.len();
    func.blocks.retain(|b| b.label == entry_label || referenced.contains(&b.label));
    let removed = before - func.blocks.len();
    if removed > 0 {
        stats.blocks_removed += removed as u64;
    }
    removed > 0
}

/// Runs branch folding and trampoline forwarding to a fixed point.
pub fn run(func: &mut Function, stats: &mut OptimizationStats) -> bool {
    let mut changed = false;
    loop {
        let mut round = fold_degenerate_branches(func, stats);
        round |= forward_trampolines(func, stats);
        round |= drop_unreferenced_blocks(func, stats);
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
    use viper_ir::{BasicBlock, BlockParam, Parameter, Type, Value};

    /// §8 scenario 4: a parameterless trampoline block is forwarded
    /// through and then removed.
    #[test]
    fn trampoline_block_is_forwarded_and_removed() {
        let mut f = Function::new("f", Type::Void, vec![]);
        f.entry_mut().push(Instruction::br("trampoline", vec![]));
        let mut trampoline = BasicBlock::new("trampoline");
        trampoline.push(Instruction::br("target", vec![]));
        let mut target = BasicBlock::new("target");
        target.push(Instruction::ret(None));
        f.add_block(trampoline);
        f.add_block(target);

        let mut stats = OptimizationStats::new();
        assert!(run(&mut f, &mut stats));
        assert!(f.block("trampoline").is_none());
        assert_eq!(f.entry().terminator().unwrap().labels, vec!["target".to_string()]);
    }

    /// §4.F.5's core requirement: a forwarder's *parameters* are
    /// substituted by the predecessor's incoming argument list, and a
    /// side-effect-free instruction ahead of the forwarder's `Br` doesn't
    /// block the match as long as the terminator doesn't read its result
    /// (the whole block, computation included, is simply bypassed).
    #[test]
    fn parameterized_forwarder_with_a_dead_body_instruction_is_forwarded_through() {
        let mut f = Function::new("f", Type::I64, vec![]);
        f.entry_mut().push(Instruction::br("fwd", vec![Value::ConstInt(41, false)]));

        let mut fwd = BasicBlock::new("fwd").with_params(vec![BlockParam { name: "p".to_string(), ty: Type::I64, temp: 1 }]);
        // Computed but never read by the terminator below — dropping the
        // whole block when bypassing it is still semantics-preserving.
        fwd.push(Instruction::binary(Opcode::Add, 2, Type::I64, Value::Temp(1), Value::ConstInt(1, false)));
        fwd.push(Instruction::br("target", vec![Value::Temp(1)]));
        f.add_block(fwd);

        let mut target = BasicBlock::new("target").with_params(vec![BlockParam { name: "x".to_string(), ty: Type::I64, temp: 3 }]);
        target.push(Instruction::ret(Some(Value::Temp(3))));
        f.add_block(target);

        let mut stats = OptimizationStats::new();
        assert!(run(&mut f, &mut stats));
        assert!(f.block("fwd").is_none());

        let entry_term = f.entry().terminator().unwrap();
        assert_eq!(entry_term.labels, vec!["target".to_string()]);
        assert_eq!(entry_term.branch_args[0], vec![Value::ConstInt(41, false)]);
    }

    /// A forwarder whose terminator reads a value the dropped body itself
    /// computed cannot be bypassed — that value simply wouldn't exist at
    /// the predecessor.
    #[test]
    fn forwarder_whose_br_reads_its_own_body_result_is_not_forwarded() {
        let mut f = Function::new("f", Type::I64, vec![]);
        f.entry_mut().push(Instruction::br("fwd", vec![]));

        let mut fwd = BasicBlock::new("fwd");
        fwd.push(Instruction::binary(Opcode::Add, 0, Type::I64, Value::ConstInt(1, false), Value::ConstInt(1, false)));
        fwd.push(Instruction::br("target", vec![Value::Temp(0)]));
        f.add_block(fwd);

        let mut target = BasicBlock::new("target").with_params(vec![BlockParam { name: "x".to_string(), ty: Type::I64, temp: 1 }]);
        target.push(Instruction::ret(Some(Value::Temp(1))));
        f.add_block(target);

        let mut stats = OptimizationStats::new();
        assert!(!run(&mut f, &mut stats));
        assert!(f.block("fwd").is_some());
    }

    /// A forwarder with an empty body is still safe to forward through
    /// both arms of a `CBr`, with each arm substituting its own incoming
    /// argument for the forwarder's parameter.
    #[test]
    fn parameterized_empty_body_forwarder_is_forwarded_through_both_cbr_arms() {
        let mut f = Function::new("f", Type::I64, vec![Parameter::new("cond", Type::I1, 0)]);
        f.entry_mut().push(Instruction::cbr(
            Value::Temp(0),
            "fwd",
            vec![Value::ConstInt(10, false)],
            "fwd",
            vec![Value::ConstInt(20, false)],
        ));

        let mut fwd = BasicBlock::new("fwd").with_params(vec![BlockParam { name: "p".to_string(), ty: Type::I64, temp: 1 }]);
        fwd.push(Instruction::br("target", vec![Value::Temp(1)]));
        f.add_block(fwd);

        let mut target = BasicBlock::new("target").with_params(vec![BlockParam { name: "x".to_string(), ty: Type::I64, temp: 2 }]);
        target.push(Instruction::ret(Some(Value::Temp(2))));
        f.add_block(target);

        let mut stats = OptimizationStats::new();
        assert!(run(&mut f, &mut stats));
        assert!(f.block("fwd").is_none());

        let entry_term = f.entry().terminator().unwrap();
        assert_eq!(entry_term.labels, vec!["target".to_string(), "target".to_string()]);
        assert_eq!(entry_term.branch_args[0], vec![Value::ConstInt(10, false)]);
        assert_eq!(entry_term.branch_args[1], vec![Value::ConstInt(20, false)]);
    }

    #[test]
    fn cbr_with_identical_arms_becomes_br() {
        let mut f = Function::new("f", Type::Void, vec![]);
        f.entry_mut().push(Instruction::cbr(Value::Temp(0), "x", vec![], "x", vec![]));
        let mut x = BasicBlock::new("x");
        x.push(Instruction::ret(None));
        f.add_block(x);

        let mut stats = OptimizationStats::new();
        assert!(run(&mut f, &mut stats));
        assert_eq!(f.entry().terminator().unwrap().opcode, Opcode::Br);
    }

    #[test]
    fn zero_case_switch_becomes_br_to_default() {
        let mut f = Function::new("f", Type::Void, vec![]);
        f.entry_mut().push(Instruction::switch_i32(Value::Temp(0), "default", vec![], vec![]));
        let mut default = BasicBlock::new("default");
        default.push(Instruction::ret(None));
        f.add_block(default);

        let mut stats = OptimizationStats::new();
        assert!(run(&mut f, &mut stats));
        let term = f.entry().terminator().unwrap();
        assert_eq!(term.opcode, Opcode::Br);
        assert_eq!(term.labels, vec!["default".to_string()]);
    }
}
