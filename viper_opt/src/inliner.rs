//! Direct-call inliner (§4.F.4) over a bounded cost model: per-callee
//! instruction threshold, block budget, nesting depth, size bonuses, and
//! a per-module code-growth cap. Recursive callees, EH-sensitive
//! callees, and callees whose entry block takes parameters are never
//! inlined.

use std::collections::HashMap;

use viper_analysis::CallGraph;
use viper_ir::{BasicBlock, BlockParam, Function, Instruction, Module, Opcode, TempId, Type, Value};

use crate::stats::OptimizationStats;

#[derive(Debug, Clone, Copy)]
pub struct InlinerConfig {
    pub instruction_threshold: usize,
    pub block_budget: usize,
    pub max_depth: usize,
    pub constant_arg_bonus: usize,
    pub single_use_bonus: usize,
    pub tiny_function_bonus: usize,
    pub tiny_function_instructions: usize,
    pub growth_cap: i64,
}

impl Default for InlinerConfig {
    fn default() -> Self {
        InlinerConfig {
            instruction_threshold: 80,
            block_budget: 8,
            max_depth: 3,
            constant_arg_bonus: 4,
            single_use_bonus: 10,
            tiny_function_bonus: 16,
            tiny_function_instructions: 8,
            growth_cap: 1000,
        }
    }
}

fn is_eligible(func: &Function, name: &str, call_graph: &CallGraph) -> bool {
    if call_graph.is_recursive(name) {
        return false;
    }
    if func.entry().params.len() > func.params.len() {
        return false;
    }
    // The entry block's own parameters must be exactly the function's
    // parameters (§4.F.4's "entry block has parameters" check means any
    // block parameter beyond the mirrored function params disqualifies).
    if !func.entry().params.is_empty() && func.entry().params.len() != func.params.len() {
        return false;
    }
    for block in &func.blocks {
        for instr in &block.instructions {
            if instr.opcode.is_eh_sensitive() {
                return false;
            }
        }
    }
    true
}

fn score(func: &Function, args: &[Value], call_count: usize, cfg: &InlinerConfig) -> Option<usize> {
    let instr_count = func.instruction_count();
    if instr_count > cfg.instruction_threshold || func.blocks.len() > cfg.block_budget {
        return None;
    }
    let mut bonus = 0usize;
    bonus += args.iter().filter(|v| v.is_constant()).count() * cfg.constant_arg_bonus;
    if call_count <= 1 {
        bonus += cfg.single_use_bonus;
    }
    if instr_count <= cfg.tiny_function_instructions {
        bonus += cfg.tiny_function_bonus;
    }
    Some(bonus)
}

/// Clones `callee`'s blocks into `caller`, renaming every temp to a fresh
/// id and every block label with `prefix`, substituting parameters with
/// `args`. Returns `(cloned_blocks, return-value-per-Ret-rewritten-as-Br)`.
fn clone_callee(
    caller: &mut Function,
    callee: &Function,
    args: &[Value],
    prefix: &str,
    continuation_label: &str,
    result_temp: Option<TempId>,
) -> Vec<BasicBlock> {
    let mut temp_map: HashMap<TempId, Value> = HashMap::new();
    for (param, arg) in callee.params.iter().zip(args.iter()) {
        temp_map.insert(param.temp, arg.clone());
    }

    let mut label_map: HashMap<String, String> = HashMap::new();
    for block in &callee.blocks {
        label_map.insert(block.label.clone(), format!("{}.{}", prefix, block.label));
    }

    let mut cloned = Vec::with_capacity(callee.blocks.len());
    for (block_idx, block) in callee.blocks.iter().enumerate() {
        let mut new_block = BasicBlock::new(label_map[&block.label].clone());
        // The entry block's params are the function's params, already bound
        // to `args` above; cloning fresh params for it here would shadow
        // that binding and leave the call site's `br` (which passes no
        // args) feeding an unset register. Every other block's params are
        // genuine SSA joins and still need fresh temps.
        if block_idx != 0 {
            for p in &block.params {
                let fresh = caller.next_temp();
                temp_map.insert(p.temp, Value::Temp(fresh));
                new_block.params.push(BlockParam { name: p.name.clone(), ty: p.ty, temp: fresh });
            }
        }
        for instr in &block.instructions {
            let mut new_instr = instr.clone();
            if let Some((id, ty)) = instr.result {
                let fresh = caller.next_temp();
                temp_map.insert(id, Value::Temp(fresh));
                new_instr.result = Some((fresh, ty));
            }
            for operand in new_instr.operands.iter_mut() {
                remap_value(operand, &temp_map);
            }
            for args in new_instr.branch_args.iter_mut() {
                for a in args.iter_mut() {
                    remap_value(a, &temp_map);
                }
            }
            for label in new_instr.labels.iter_mut() {
                if let Some(mapped) = label_map.get(label) {
                    *label = mapped.clone();
                }
            }
            if instr.opcode == Opcode::Ret {
                let ret_args = match (result_temp, new_instr.operands.first()) {
                    (Some(_), Some(v)) => vec![v.clone()],
                    _ => vec![],
                };
                new_instr = Instruction::br(continuation_label.to_string(), ret_args);
            }
            new_block.push(new_instr);
        }
        cloned.push(new_block);
    }
    cloned
}

fn remap_value(v: &mut Value, temp_map: &HashMap<TempId, Value>) {
    if let Value::Temp(id) = v {
        if let Some(mapped) = temp_map.get(id) {
            *v = mapped.clone();
        }
    }
}

/// Inlines one eligible call site per pass over `func`'s current block
/// list, splitting the calling block into a call-prefix and a
/// continuation that receives the callee's return value as a block
/// parameter (§4.F.4 steps a-e). Returns whether anything changed.
fn inline_one_round(
    module_functions: &HashMap<String, Function>,
    call_graph: &CallGraph,
    func: &mut Function,
    cfg: &InlinerConfig,
    stats: &mut OptimizationStats,
    next_inline_id: &mut usize,
) -> bool {
    for block_idx in 0..func.blocks.len() {
        let instrs = func.blocks[block_idx].instructions.clone();
        for (ii, instr) in instrs.iter().enumerate() {
            if instr.opcode != Opcode::Call {
                continue;
            }
            let Some(callee_name) = &instr.callee else { continue };
            let Some(callee) = module_functions.get(callee_name) else { continue };
            if !is_eligible(callee, callee_name, call_graph) {
                continue;
            }
            let call_count = call_graph.call_count(callee_name);
            let Some(_bonus) = score(callee, &instr.operands, call_count, cfg) else { continue };

            let growth = callee.instruction_count() as i64 - 1;
            if stats.growth_delta + growth > cfg.growth_cap {
                continue;
            }

            *next_inline_id += 1;
            let prefix = format!("inl{}", next_inline_id);
            let continuation_label = format!("{}.cont", prefix);

            let mut continuation = BasicBlock::new(continuation_label.clone());
            if let Some((result_id, ty)) = instr.result {
                let param_temp = func.next_temp();
                continuation.params.push(BlockParam { name: format!("{}r", prefix), ty, temp: param_temp });
                // Every later use of the call's own result temp now reads
                // the continuation's parameter instead.
                retarget_uses(func, result_id, Value::Temp(param_temp));
            }
            let tail: Vec<Instruction> = func.blocks[block_idx].instructions.split_off(ii + 1);
            continuation.instructions = tail;

            let cloned = clone_callee(func, callee, &instr.operands, &prefix, &continuation_label, instr.result.map(|(id, _)| id));
            let entry_label = cloned[0].label.clone();

            func.blocks[block_idx].instructions.pop();
            func.blocks[block_idx].push(Instruction::br(entry_label, vec![]));

            for block in cloned {
                func.add_block(block);
            }
            func.add_block(continuation);

            stats.inlined_call_sites += 1;
            stats.growth_delta += growth;
            return true;
        }
    }
    false
}

fn retarget_uses(func: &mut Function, old: TempId, new: Value) {
    let subst: HashMap<TempId, Value> = [(old, new)].into_iter().collect();
    crate::support::apply_substitutions(func, &subst);
}

/// Runs the inliner over every function in `module`, bounded by `cfg`.
/// Skips functions beyond `cfg.max_depth` call-chain nesting measured
/// from the call graph's SCC order (leaves inlined first, naturally
/// bounding transitive inlining depth).
pub fn run(module: &mut Module, cfg: &InlinerConfig, stats: &mut OptimizationStats) -> bool {
    let call_graph = CallGraph::build(module);
    let snapshot: HashMap<String, Function> = module.functions.clone().into_iter().collect();
    let mut changed = false;
    let mut next_inline_id = 0usize;

    let names: Vec<String> = module.functions.keys().cloned().collect();
    for name in names {
        let depth = estimate_depth(&call_graph, &name, cfg.max_depth);
        if depth > cfg.max_depth {
            continue;
        }
        let func = module.functions.get_mut(&name).unwrap();
        loop {
            if !inline_one_round(&snapshot, &call_graph, func, cfg, stats, &mut next_inline_id) {
                break;
            }
            changed = true;
        }
    }
    changed
}

/// A cheap depth proxy: the length of the longest simple callee chain up
/// to `limit` hops, used only to bound inlining, not as an exact metric.
fn estimate_depth(call_graph: &CallGraph, name: &str, limit: usize) -> usize {
    fn walk(call_graph: &CallGraph, name: &str, remaining: usize) -> usize {
        if remaining == 0 {
            return 0;
        }
        call_graph
            .callees_of(name)
            .iter()
            .map(|c| 1 + walk(call_graph, c, remaining - 1))
            .max()
            .unwrap_or(0)
    }
    walk(call_graph, name, limit + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_ir::Parameter;

    fn tiny_callee() -> Function {
        let mut f = Function::new("double", Type::I64, vec![Parameter::new("x", Type::I64, 0)]);
        f.entry_mut().push(Instruction::binary(Opcode::Add, 1, Type::I64, Value::Temp(0), Value::Temp(0)));
        f.entry_mut().push(Instruction::ret(Some(Value::Temp(1))));
        f
    }

    #[test]
    fn call_site_is_replaced_by_a_branch_into_a_cloned_entry() {
        let mut caller = Function::new("main", Type::I64, vec![]);
        caller.entry_mut().push(Instruction::call(Some((0, Type::I64)), "double", vec![Value::ConstInt(21, false)]));
        caller.entry_mut().push(Instruction::ret(Some(Value::Temp(0))));

        let mut module = Module::new();
        module.add_function(tiny_callee());
        module.add_function(caller);

        let mut stats = OptimizationStats::new();
        let cfg = InlinerConfig::default();
        assert!(run(&mut module, &cfg, &mut stats));
        assert_eq!(stats.inlined_call_sites, 1);

        let main = module.function("main").unwrap();
        assert!(main.entry().instructions.iter().all(|i| i.opcode != Opcode::Call));
        assert!(main.blocks.len() > 1);

        // Masking: asserting the call site is gone doesn't prove the
        // arguments reached the inlined body. Run it and check the answer.
        let mut vm = viper_vm::Vm::new(module);
        let exit_code = vm.run().expect("inlined module should execute without trapping");
        assert_eq!(exit_code, 42, "double(21) should inline to 42");
    }

    #[test]
    fn recursive_callee_is_never_inlined() {
        let mut recursive = Function::new("fact", Type::I64, vec![Parameter::new("n", Type::I64, 0)]);
        recursive.entry_mut().push(Instruction::call(Some((1, Type::I64)), "fact", vec![Value::Temp(0)]));
        recursive.entry_mut().push(Instruction::ret(Some(Value::Temp(1))));

        let mut caller = Function::new("main", Type::I64, vec![]);
        caller.entry_mut().push(Instruction::call(Some((0, Type::I64)), "fact", vec![Value::ConstInt(5, false)]));
        caller.entry_mut().push(Instruction::ret(Some(Value::Temp(0))));

        let mut module = Module::new();
        module.add_function(recursive);
        module.add_function(caller);

        let mut stats = OptimizationStats::new();
        let cfg = InlinerConfig::default();
        assert!(!run(&mut module, &cfg, &mut stats));
        assert_eq!(stats.inlined_call_sites, 0);
    }
}
