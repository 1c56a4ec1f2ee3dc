//! Per-function control-flow analysis (§4.E).

use std::collections::HashMap;
use viper_ir::Function;

/// Precomputed successor/predecessor edges and traversal orders for one
/// function. Borrowed references are bounded by the analysis's own
/// lifetime, consistent with a single pass-manager invocation (§5).
pub struct CfgContext<'f> {
    func: &'f Function,
    label_index: HashMap<&'f str, usize>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl<'f> CfgContext<'f> {
    /// Builds the context from the function's terminators. `SwitchI32`
    /// contributes its default edge followed by each case edge, in
    /// declaration order, matching `Instruction::successor_labels`.
    pub fn build(func: &'f Function) -> Self {
        let label_index: HashMap<&str, usize> =
            func.blocks.iter().enumerate().map(|(i, b)| (b.label.as_str(), i)).collect();

        let mut successors = vec![Vec::new(); func.blocks.len()];
        let mut predecessors = vec![Vec::new(); func.blocks.len()];

        for (i, block) in func.blocks.iter().enumerate() {
            for label in block.successors() {
                if let Some(&target) = label_index.get(label) {
                    successors[i].push(target);
                    predecessors[target].push(i);
                }
            }
        }

        CfgContext { func, label_index, successors, predecessors }
    }

    pub fn block_index(&self, label: &str) -> Option<usize> {
        self.label_index.get(label).copied()
    }

    pub fn successors(&self, block: usize) -> &[usize] {
        &self.successors[block]
    }

    pub fn predecessors(&self, block: usize) -> &[usize] {
        &self.predecessors[block]
    }

    pub fn block_count(&self) -> usize {
        self.func.blocks.len()
    }

    /// Depth-first post-order starting from the entry block (index 0).
    pub fn post_order(&self) -> Vec<usize> {
        let mut visited = vec![false; self.block_count()];
        let mut order = Vec::new();
        let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
        visited[0] = true;

        while let Some(&mut (node, ref mut next_child)) = stack.last_mut() {
            if *next_child < self.successors[node].len() {
                let child = self.successors[node][*next_child];
                *next_child += 1;
                if !visited[child] {
                    visited[child] = true;
                    stack.push((child, 0));
                }
            } else {
                order.push(node);
                stack.pop();
            }
        }
        order
    }

    /// Reverse of `post_order`; the conventional forward analysis order.
    pub fn reverse_post_order(&self) -> Vec<usize> {
        let mut order = self.post_order();
        order.reverse();
        order
    }

    /// Kahn's algorithm over the block graph; an empty result (while
    /// blocks remain unvisited) signals a cycle.
    pub fn topological_order(&self) -> Vec<usize> {
        let n = self.block_count();
        let mut indegree = vec![0usize; n];
        for succs in &self.successors {
            for &s in succs {
                indegree[s] += 1;
            }
        }
        let mut queue: std::collections::VecDeque<usize> =
            (0..n).filter(|&b| indegree[b] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &succ in &self.successors[node] {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    queue.push_back(succ);
                }
            }
        }
        if order.len() == n {
            order
        } else {
            Vec::new()
        }
    }

    pub fn is_acyclic(&self) -> bool {
        !self.topological_order().is_empty() || self.block_count() <= 1
    }
}

/// Immediate-dominator tree, computed with the Cooper/Harvey/Kennedy
/// iterative data-flow algorithm over reverse post-order — used by the
/// verifier's use-dominates-definition check (§3 invariant 2) and by
/// Mem2Reg's dominance-frontier-based SSA construction (§4.F.2).
pub struct Dominators {
    idom: Vec<Option<usize>>,
    rpo_index: Vec<usize>,
    entry: usize,
}

impl Dominators {
    pub fn compute(cfg: &CfgContext) -> Self {
        let n = cfg.block_count();
        let entry = 0usize;
        let rpo = cfg.reverse_post_order();
        let mut rpo_index = vec![usize::MAX; n];
        for (pos, &block) in rpo.iter().enumerate() {
            rpo_index[block] = pos;
        }

        let mut idom = vec![None; n];
        idom[entry] = Some(entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter() {
                if b == entry {
                    continue;
                }
                let mut new_idom: Option<usize> = None;
                for &p in cfg.predecessors(b) {
                    if idom[p].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(cur, p, &idom, &rpo_index),
                    });
                }
                if idom[b] != new_idom {
                    idom[b] = new_idom;
                    changed = true;
                }
            }
        }

        Dominators { idom, rpo_index, entry }
    }

    /// `true` when `a` dominates `b` (every path from the entry to `b`
    /// passes through `a`); every block dominates itself.
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        if self.rpo_index[a] == usize::MAX || self.rpo_index[b] == usize::MAX {
            return false; // unreachable block
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            if cur == self.entry {
                return a == self.entry;
            }
            match self.idom[cur] {
                Some(next) if next != cur => cur = next,
                _ => return false,
            }
        }
    }

    /// The dominance frontier of every block: blocks that `b` dominates
    /// the predecessor of but not the block itself (Cytron et al.).
    pub fn dominance_frontier(&self, cfg: &CfgContext) -> Vec<Vec<usize>> {
        let n = self.idom.len();
        let mut df: Vec<Vec<usize>> = vec![Vec::new(); n];
        for b in 0..n {
            let preds = cfg.predecessors(b);
            if preds.len() < 2 {
                continue;
            }
            for &p in preds {
                if self.rpo_index[p] == usize::MAX {
                    continue;
                }
                let mut runner = p;
                while Some(runner) != self.idom[b] {
                    if !df[runner].contains(&b) {
                        df[runner].push(b);
                    }
                    match self.idom[runner] {
                        Some(next) if next != runner => runner = next,
                        _ => break,
                    }
                }
            }
        }
        df
    }
}

fn intersect(mut a: usize, mut b: usize, idom: &[Option<usize>], rpo_index: &[usize]) -> usize {
    while a != b {
        while rpo_index[a] > rpo_index[b] {
            a = idom[a].expect("finger walks only through already-dominated nodes");
        }
        while rpo_index[b] > rpo_index[a] {
            b = idom[b].expect("finger walks only through already-dominated nodes");
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_ir::{Instruction, Type};

    fn linear_function() -> Function {
        let mut f = Function::new("f", Type::Void, vec![]);
        f.entry_mut().push(Instruction::br("b", vec![]));
        let mut b = viper_ir::BasicBlock::new("b");
        b.push(Instruction::ret(None));
        f.add_block(b);
        f
    }

    fn cyclic_function() -> Function {
        let mut f = Function::new("f", Type::Void, vec![]);
        f.entry_mut().push(Instruction::br("loop", vec![]));
        let mut loop_block = viper_ir::BasicBlock::new("loop");
        loop_block.push(Instruction::br("loop", vec![]));
        f.add_block(loop_block);
        f
    }

    #[test]
    fn successors_and_predecessors_follow_terminators() {
        let f = linear_function();
        let cfg = CfgContext::build(&f);
        assert_eq!(cfg.successors(0), &[1]);
        assert_eq!(cfg.predecessors(1), &[0]);
    }

    #[test]
    fn topological_order_is_empty_on_a_cycle() {
        let f = cyclic_function();
        let cfg = CfgContext::build(&f);
        assert!(cfg.topological_order().is_empty());
        assert!(!cfg.is_acyclic());
    }

    #[test]
    fn topological_order_succeeds_on_a_dag() {
        let f = linear_function();
        let cfg = CfgContext::build(&f);
        assert_eq!(cfg.topological_order(), vec![0, 1]);
        assert!(cfg.is_acyclic());
    }

    /// `entry -> (left|right) -> join`, the smallest diamond shape.
    fn diamond_function() -> Function {
        let mut f = Function::new("f", Type::I64, vec![]);
        f.entry_mut().push(Instruction::cbr(viper_ir::Value::ConstInt(1, true), "left", vec![], "right", vec![]));
        let mut left = viper_ir::BasicBlock::new("left");
        left.push(Instruction::br("join", vec![]));
        let mut right = viper_ir::BasicBlock::new("right");
        right.push(Instruction::br("join", vec![]));
        let mut join = viper_ir::BasicBlock::new("join");
        join.push(Instruction::ret(None));
        f.add_block(left);
        f.add_block(right);
        f.add_block(join);
        f
    }

    #[test]
    fn dominators_diamond_join_is_dominated_only_by_entry() {
        let f = diamond_function();
        let cfg = CfgContext::build(&f);
        let dom = Dominators::compute(&cfg);
        let entry = cfg.block_index("entry").unwrap();
        let left = cfg.block_index("left").unwrap();
        let join = cfg.block_index("join").unwrap();
        assert!(dom.dominates(entry, join));
        assert!(!dom.dominates(left, join));
        assert!(dom.dominates(left, left));
    }

    #[test]
    fn dominance_frontier_of_diamond_arms_is_the_join_block() {
        let f = diamond_function();
        let cfg = CfgContext::build(&f);
        let dom = Dominators::compute(&cfg);
        let left = cfg.block_index("left").unwrap();
        let join = cfg.block_index("join").unwrap();
        let df = dom.dominance_frontier(&cfg);
        assert_eq!(df[left], vec![join]);
    }

    #[test]
    fn reverse_post_order_is_reverse_of_post_order() {
        let f = linear_function();
        let cfg = CfgContext::build(&f);
        let mut po = cfg.post_order();
        let rpo = cfg.reverse_post_order();
        po.reverse();
        assert_eq!(po, rpo);
    }
}
