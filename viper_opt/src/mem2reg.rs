//! Mem2Reg + SROA (§4.F.2): promotes `Alloca`s whose every use is a
//! direct `Load`/`Store` or a constant-offset `Gep` of one, replacing
//! them with SSA values joined by block parameters at the dominance
//! frontier of their defining stores. A dynamic-offset `Gep`, or any use
//! outside `Load`/`Store`/`Gep`, disqualifies the whole alloca (the SROA
//! restriction named in the component design).

use std::collections::{HashMap, HashSet};

use viper_ir::{BlockParam, Function, Instruction, Opcode, TempId, Type, Value};
use viper_analysis::{CfgContext, Dominators};

use crate::stats::OptimizationStats;
use crate::support::apply_substitutions;

/// A promotable memory cell: one `Alloca` at a fixed byte offset from its
/// base (`0` for the alloca's own pointer, otherwise a constant-offset
/// `Gep` off it).
type Slot = (TempId, i64);

fn zero_value(ty: Type) -> Value {
    match ty {
        Type::Ptr => Value::NullPtr,
        Type::F64 => Value::ConstFloat(0.0),
        Type::I1 => Value::ConstInt(0, true),
        _ => Value::ConstInt(0, false),
    }
}

struct Candidates {
    /// Every pointer temp known to alias a slot of a still-promotable alloca.
    pointer_slot: HashMap<TempId, Slot>,
    /// Allocas ruled out by an escaping or dynamic-offset use.
    disqualified: HashSet<TempId>,
    slot_type: HashMap<Slot, Type>,
}

fn classify(func: &Function) -> Candidates {
    let mut pointer_slot = HashMap::new();
    let mut disqualified = HashSet::new();
    let mut slot_type = HashMap::new();

    for block in &func.blocks {
        for instr in &block.instructions {
            if instr.opcode == Opcode::Alloca {
                if let Some((id, Type::Ptr)) = instr.result {
                    pointer_slot.insert(id, (id, 0));
                }
            }
        }
    }

    // Fixed point: a Gep chained off an already-classified pointer with a
    // literal offset extends the slot map; anything else disqualifies.
    let mut changed = true;
    while changed {
        changed = false;
        for block in &func.blocks {
            for instr in &block.instructions {
                if instr.opcode == Opcode::Gep {
                    let base = instr.operands.first();
                    let offset = instr.operands.get(1).and_then(|v| v.as_const_int());
                    if let Some(Value::Temp(base_id)) = base {
                        if let Some(&(alloca, base_off)) = pointer_slot.get(base_id) {
                            if !disqualified.contains(&alloca) {
                                match (offset, instr.result) {
                                    (Some(off), Some((id, Type::Ptr))) => {
                                        if pointer_slot.insert(id, (alloca, base_off + off)).is_none() {
                                            changed = true;
                                        }
                                    }
                                    _ => {
                                        disqualified.insert(alloca);
                                        changed = true;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    let is_classified_use = |v: &Value| -> Option<TempId> {
        if let Value::Temp(id) = v {
            pointer_slot.get(id).map(|(alloca, _)| *alloca)
        } else {
            None
        }
    };

    for block in &func.blocks {
        for instr in &block.instructions {
            match instr.opcode {
                Opcode::Load => {
                    if let Some(Value::Temp(id)) = instr.operands.first() {
                        if let Some(&slot) = pointer_slot.get(id) {
                            if let Some((_, ty)) = instr.result {
                                slot_type.insert(slot, ty);
                            }
                        }
                    }
                }
                Opcode::Store => {
                    if let Some(Value::Temp(id)) = instr.operands.first() {
                        if let Some(&slot) = pointer_slot.get(id) {
                            slot_type.entry(slot).or_insert(Type::I64);
                        }
                    }
                    // The stored value itself must not be a slot pointer
                    // escaping into memory.
                    if let Some(alloca) = instr.operands.get(1).and_then(is_classified_use) {
                        disqualified.insert(alloca);
                    }
                }
                Opcode::Gep | Opcode::Alloca => {}
                _ => {
                    for operand in &instr.operands {
                        if let Some(alloca) = is_classified_use(operand) {
                            disqualified.insert(alloca);
                        }
                    }
                    for args in &instr.branch_args {
                        for a in args {
                            if let Some(alloca) = is_classified_use(a) {
                                disqualified.insert(alloca);
                            }
                        }
                    }
                }
            }
        }
    }

    pointer_slot.retain(|_, (alloca, _)| !disqualified.contains(alloca));
    Candidates { pointer_slot, disqualified, slot_type }
}

/// Derives each block's immediate-dominator child list from `dom`'s
/// pairwise `dominates` queries: a block's parent is the strict
/// dominator dominated by every other strict dominator.
fn dominator_children(func: &Function, dom: &Dominators, cfg: &CfgContext) -> Vec<Vec<usize>> {
    let n = cfg.block_count();
    let mut children = vec![Vec::new(); n];
    for b in 0..n {
        if b == 0 {
            continue;
        }
        let strict_doms: Vec<usize> = (0..n).filter(|&a| a != b && dom.dominates(a, b)).collect();
        if let Some(&parent) = strict_doms.iter().max_by_key(|&&a| strict_doms.iter().filter(|&&x| dom.dominates(x, a)).count()) {
            children[parent].push(b);
        }
    }
    let _ = func;
    children
}

/// Runs one promotion sweep over `func`. Returns whether anything changed.
pub fn run(func: &mut Function, stats: &mut OptimizationStats) -> bool {
    let candidates = classify(func);
    let promotable: HashSet<TempId> = candidates
        .pointer_slot
        .values()
        .map(|(alloca, _)| *alloca)
        .filter(|a| !candidates.disqualified.contains(a))
        .collect();
    if promotable.is_empty() {
        return false;
    }

    let cfg = CfgContext::build(func);
    let dom = Dominators::compute(&cfg);
    let children = dominator_children(func, &dom, &cfg);

    // Every slot touched by a promotable alloca.
    let mut slots: Vec<Slot> = candidates
        .pointer_slot
        .values()
        .copied()
        .filter(|(alloca, _)| promotable.contains(alloca))
        .collect();
    slots.sort_unstable();
    slots.dedup();

    // Blocks with a Store to each slot, and blocks reachable (for the
    // dominance-frontier-based placement of join parameters).
    let mut def_blocks: HashMap<Slot, HashSet<usize>> = HashMap::new();
    for (bi, block) in func.blocks.iter().enumerate() {
        for instr in &block.instructions {
            if instr.opcode == Opcode::Store {
                if let Some(Value::Temp(id)) = instr.operands.first() {
                    if let Some(&slot) = candidates.pointer_slot.get(id) {
                        if promotable.contains(&slot.0) {
                            def_blocks.entry(slot).or_default().insert(bi);
                        }
                    }
                }
            }
        }
    }

    let df = dom.dominance_frontier(&cfg);

    // Iterated dominance frontier placement: one fresh BlockParam per
    // (block, slot) needing a join.
    let mut params_needed: HashMap<usize, Vec<Slot>> = HashMap::new();
    let mut has_param: HashSet<(usize, Slot)> = HashSet::new();
    for &slot in &slots {
        let mut worklist: Vec<usize> = def_blocks.get(&slot).cloned().unwrap_or_default().into_iter().collect();
        let mut seen: HashSet<usize> = HashSet::new();
        while let Some(b) = worklist.pop() {
            for &f in &df[b] {
                if has_param.insert((f, slot)) {
                    params_needed.entry(f).or_default().push(slot);
                    if seen.insert(f) {
                        worklist.push(f);
                    }
                }
            }
        }
    }

    // Allocate fresh temps for each inserted param and append to the
    // block's parameter list; record each one's position for branch-arg
    // bookkeeping later.
    let mut param_temp: HashMap<(usize, Slot), TempId> = HashMap::new();
    let mut param_position: HashMap<(usize, Slot), usize> = HashMap::new();
    for (&block_idx, block_slots) in params_needed.iter() {
        for &slot in block_slots {
            let ty = *candidates.slot_type.get(&slot).unwrap_or(&Type::I64);
            let temp = func.next_temp();
            let pos = func.blocks[block_idx].params.len();
            func.blocks[block_idx].params.push(BlockParam { name: format!("m2r{}", temp), ty, temp });
            param_temp.insert((block_idx, slot), temp);
            param_position.insert((block_idx, slot), pos);
        }
    }

    let mut subst: HashMap<TempId, Value> = HashMap::new();
    let mut remove: HashSet<(usize, usize)> = HashSet::new();
    let mut promoted_count = 0u64;

    fn resolve(v: &Value, subst: &HashMap<TempId, Value>) -> Value {
        let mut cur = v.clone();
        for _ in 0..4 {
            if let Value::Temp(id) = cur {
                if let Some(next) = subst.get(&id) {
                    cur = next.clone();
                    continue;
                }
            }
            break;
        }
        cur
    }

    fn walk(
        block_idx: usize,
        func: &Function,
        children: &[Vec<usize>],
        candidates: &Candidates,
        promotable: &HashSet<TempId>,
        param_temp: &HashMap<(usize, Slot), TempId>,
        mut current: HashMap<Slot, Value>,
        subst: &mut HashMap<TempId, Value>,
        remove: &mut HashSet<(usize, usize)>,
        promoted_count: &mut u64,
        branch_fill: &mut Vec<(usize, usize, usize, Value)>,
    ) {
        for (&(b, slot), &temp) in param_temp.iter() {
            if b == block_idx {
                current.insert(slot, Value::Temp(temp));
            }
        }

        let block = &func.blocks[block_idx];
        for (ii, instr) in block.instructions.iter().enumerate() {
            match instr.opcode {
                Opcode::Alloca => {
                    if let Some((id, _)) = instr.result {
                        if promotable.contains(&id) {
                            remove.insert((block_idx, ii));
                        }
                    }
                }
                Opcode::Gep => {
                    if let Some((id, _)) = instr.result {
                        if let Some(&(alloca, _)) = candidates.pointer_slot.get(&id) {
                            if promotable.contains(&alloca) {
                                remove.insert((block_idx, ii));
                            }
                        }
                    }
                }
                Opcode::Load => {
                    if let Some(Value::Temp(ptr)) = instr.operands.first() {
                        if let Some(&slot) = candidates.pointer_slot.get(ptr) {
                            if promotable.contains(&slot.0) {
                                if let Some((result, ty)) = instr.result {
                                    let v = current.get(&slot).cloned().unwrap_or_else(|| zero_value(ty));
                                    subst.insert(result, v);
                                    remove.insert((block_idx, ii));
                                    *promoted_count += 1;
                                }
                            }
                        }
                    }
                }
                Opcode::Store => {
                    if let Some(Value::Temp(ptr)) = instr.operands.first() {
                        if let Some(&slot) = candidates.pointer_slot.get(ptr) {
                            if promotable.contains(&slot.0) {
                                let value = instr.operands.get(1).cloned().unwrap_or(Value::NullPtr);
                                current.insert(slot, resolve(&value, subst));
                                remove.insert((block_idx, ii));
                                *promoted_count += 1;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(term) = block.terminator() {
            for (si, label) in term.labels.iter().enumerate() {
                if let Some(succ) = func.block_index(label) {
                    let mut slots_at_succ: Vec<Slot> =
                        param_temp.keys().filter(|(b, _)| *b == succ).map(|(_, s)| *s).collect();
                    slots_at_succ.sort_unstable();
                    for slot in slots_at_succ {
                        let v = current.get(&slot).cloned().unwrap_or_else(|| {
                            let ty = *candidates.slot_type.get(&slot).unwrap_or(&Type::I64);
                            zero_value(ty)
                        });
                        branch_fill.push((block_idx, si, succ, v));
                    }
                }
            }
        }

        for &child in &children[block_idx] {
            walk(
                child,
                func,
                children,
                candidates,
                promotable,
                param_temp,
                current.clone(),
                subst,
                remove,
                promoted_count,
                branch_fill,
            );
        }
    }

    let mut branch_fill: Vec<(usize, usize, usize, Value)> = Vec::new();
    walk(
        0,
        func,
        &children,
        &candidates,
        &promotable,
        &param_temp,
        HashMap::new(),
        &mut subst,
        &mut remove,
        &mut promoted_count,
        &mut branch_fill,
    );

    for (block_idx, si, _succ, value) in branch_fill {
        if let Some(last) = func.blocks[block_idx].instructions.last_mut() {
            if let Some(args) = last.branch_args.get_mut(si) {
                args.push(value);
            }
        }
    }

    for (bi, block) in func.blocks.iter_mut().enumerate() {
        let mut kept = Vec::with_capacity(block.instructions.len());
        for (ii, instr) in block.instructions.drain(..).enumerate() {
            if !remove.contains(&(bi, ii)) {
                kept.push(instr);
            }
        }
        block.instructions = kept;
    }

    let mut changed = !subst.is_empty() || !remove.is_empty();
    changed |= apply_substitutions(func, &subst);
    if promoted_count > 0 {
        stats.promoted_allocas += promotable.len() as u64;
        stats.instructions_folded += promoted_count;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_ir::{BasicBlock, Instruction, Parameter};

    /// §8 scenario 5: a two-field aggregate, stored then immediately
    /// reloaded and summed, promotes away every memory opcode.
    #[test]
    fn two_field_aggregate_promotes_to_pure_ssa() {
        let mut f = Function::new("f", Type::I64, vec![]);
        let base = f.next_temp(); // 0
        let gep1 = f.next_temp(); // 1
        let l0 = f.next_temp(); // 2
        let l1 = f.next_temp(); // 3
        let sum = f.next_temp(); // 4

        f.entry_mut().push(Instruction::new(Opcode::Alloca).with_result(base, Type::Ptr).with_operands(vec![Value::ConstInt(16, false)]));
        f.entry_mut().push(Instruction::new(Opcode::Store).with_operands(vec![Value::Temp(base), Value::ConstInt(1, false)]));
        f.entry_mut().push(Instruction::new(Opcode::Gep).with_result(gep1, Type::Ptr).with_operands(vec![Value::Temp(base), Value::ConstInt(8, false)]));
        f.entry_mut().push(Instruction::new(Opcode::Store).with_operands(vec![Value::Temp(gep1), Value::ConstInt(2, false)]));
        f.entry_mut().push(Instruction::new(Opcode::Load).with_result(l0, Type::I64).with_operands(vec![Value::Temp(base)]));
        f.entry_mut().push(Instruction::new(Opcode::Load).with_result(l1, Type::I64).with_operands(vec![Value::Temp(gep1)]));
        f.entry_mut().push(Instruction::binary(Opcode::Add, sum, Type::I64, Value::Temp(l0), Value::Temp(l1)));
        f.entry_mut().push(Instruction::ret(Some(Value::Temp(sum))));

        let mut stats = OptimizationStats::new();
        assert!(run(&mut f, &mut stats));

        for block in &f.blocks {
            for instr in &block.instructions {
                assert!(!matches!(instr.opcode, Opcode::Alloca | Opcode::Gep | Opcode::Load | Opcode::Store));
            }
        }
        assert_eq!(stats.promoted_allocas, 1);
    }

    #[test]
    fn alloca_escaping_into_a_call_is_not_promoted() {
        let mut f = Function::new("f", Type::Void, vec![Parameter::new("unused", Type::I64, 0)]);
        let base = f.next_temp();
        f.entry_mut().push(Instruction::new(Opcode::Alloca).with_result(base, Type::Ptr).with_operands(vec![Value::ConstInt(8, false)]));
        f.entry_mut().push(Instruction::call(None, "escape", vec![Value::Temp(base)]));
        f.entry_mut().push(Instruction::ret(None));

        let mut stats = OptimizationStats::new();
        assert!(!run(&mut f, &mut stats));
        assert!(f.entry().instructions.iter().any(|i| i.opcode == Opcode::Alloca));
    }

    #[test]
    fn join_point_gets_a_block_parameter_for_the_promoted_value() {
        let mut f = Function::new("f", Type::I64, vec![]);
        let base = f.next_temp();
        f.entry_mut().push(Instruction::new(Opcode::Alloca).with_result(base, Type::Ptr).with_operands(vec![Value::ConstInt(8, false)]));
        f.entry_mut()
            .push(Instruction::cbr(Value::ConstInt(1, true), "left", vec![], "right", vec![]));

        let mut left = BasicBlock::new("left");
        left.push(Instruction::new(Opcode::Store).with_operands(vec![Value::Temp(base), Value::ConstInt(1, false)]));
        left.push(Instruction::br("join", vec![]));

        let mut right = BasicBlock::new("right");
        right.push(Instruction::new(Opcode::Store).with_operands(vec![Value::Temp(base), Value::ConstInt(2, false)]));
        right.push(Instruction::br("join", vec![]));

        let load = f.next_temp();
        let mut join = BasicBlock::new("join");
        join.push(Instruction::new(Opcode::Load).with_result(load, Type::I64).with_operands(vec![Value::Temp(base)]));
        join.push(Instruction::ret(Some(Value::Temp(load))));

        f.add_block(left);
        f.add_block(right);
        f.add_block(join);

        let mut stats = OptimizationStats::new();
        assert!(run(&mut f, &mut stats));
        let join_block = f.block("join").unwrap();
        assert_eq!(join_block.params.len(), 1);
        assert!(!join_block.instructions.iter().any(|i| i.opcode == Opcode::Load));
    }
}
