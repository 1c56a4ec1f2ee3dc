//! Module-level call graph and strongly-connected-component analysis
//! (§4.E). Indirect calls are ignored by construction: only `Call`
//! instructions with a resolved callee name contribute edges.

use indexmap::IndexMap;
use std::collections::HashMap;
use viper_ir::{Module, Opcode};

/// Per-caller ordered edge list (duplicates preserved to encode call-site
/// multiplicity) and per-callee counts, plus Tarjan SCCs.
pub struct CallGraph {
    edges: IndexMap<String, Vec<String>>,
    callee_counts: HashMap<String, usize>,
    scc_index: HashMap<String, usize>,
    sccs: Vec<Vec<String>>,
}

impl CallGraph {
    pub fn build(module: &Module) -> Self {
        let order: Vec<String> = module.functions.keys().cloned().collect();
        let mut edges: IndexMap<String, Vec<String>> = IndexMap::new();
        let mut callee_counts: HashMap<String, usize> = HashMap::new();

        for name in &order {
            let func = module.function(name).unwrap();
            let mut callees = Vec::new();
            for block in &func.blocks {
                for instr in &block.instructions {
                    if instr.opcode == Opcode::Call {
                        if let Some(callee) = &instr.callee {
                            callees.push(callee.clone());
                            *callee_counts.entry(callee.clone()).or_insert(0) += 1;
                        }
                    }
                }
            }
            edges.insert(name.clone(), callees);
        }

        let mut tarjan = Tarjan::new(&edges);
        for name in &order {
            tarjan.visit(name);
        }
        let sccs = tarjan.sccs;
        let mut scc_index = HashMap::new();
        for (i, comp) in sccs.iter().enumerate() {
            for name in comp {
                scc_index.insert(name.clone(), i);
            }
        }

        CallGraph { edges, callee_counts, scc_index, sccs }
    }

    pub fn callees_of(&self, caller: &str) -> &[String] {
        self.edges.get(caller).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn call_count(&self, callee: &str) -> usize {
        self.callee_counts.get(callee).copied().unwrap_or(0)
    }

    pub fn scc_of(&self, name: &str) -> Option<&[String]> {
        self.scc_index.get(name).map(|&i| self.sccs[i].as_slice())
    }

    /// `true` when `name`'s SCC has more than one member, or it directly
    /// calls itself (a self-edge within a singleton SCC).
    pub fn is_recursive(&self, name: &str) -> bool {
        match self.scc_index.get(name) {
            Some(&idx) => {
                self.sccs[idx].len() > 1
                    || self.edges.get(name).map(|c| c.iter().any(|callee| callee == name)).unwrap_or(false)
            }
            None => false,
        }
    }

    /// Strongly connected components in reverse topological order
    /// (callees settled before their callers), as Tarjan naturally
    /// produces them.
    pub fn sccs_reverse_topological(&self) -> &[Vec<String>] {
        &self.sccs
    }
}

/// Classic recursive Tarjan's algorithm scoped to the functions the
/// module actually defines; a callee name with no corresponding node
/// (an extern) simply contributes no further edges.
struct Tarjan<'a> {
    edges: &'a IndexMap<String, Vec<String>>,
    index: HashMap<&'a str, usize>,
    low_link: HashMap<&'a str, usize>,
    on_stack: HashMap<&'a str, bool>,
    stack: Vec<&'a str>,
    next_index: usize,
    sccs: Vec<Vec<String>>,
}

impl<'a> Tarjan<'a> {
    fn new(edges: &'a IndexMap<String, Vec<String>>) -> Self {
        Tarjan {
            edges,
            index: HashMap::new(),
            low_link: HashMap::new(),
            on_stack: HashMap::new(),
            stack: Vec::new(),
            next_index: 0,
            sccs: Vec::new(),
        }
    }

    fn visit(&mut self, node: &'a str) {
        if self.index.contains_key(node) {
            return;
        }
        self.index.insert(node, self.next_index);
        self.low_link.insert(node, self.next_index);
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack.insert(node, true);

        if let Some(children) = self.edges.get(node) {
            for child in children.clone() {
                let child: &str = self.edges.get_key_value(&child).map(|(k, _)| k.as_str()).unwrap_or("");
                if child.is_empty() {
                    continue; // callee is an extern, not a module function
                }
                if !self.index.contains_key(child) {
                    self.visit(child);
                    let child_low = self.low_link[child];
                    let cur = self.low_link[node];
                    self.low_link.insert(node, cur.min(child_low));
                } else if *self.on_stack.get(child).unwrap_or(&false) {
                    let child_idx = self.index[child];
                    let cur = self.low_link[node];
                    self.low_link.insert(node, cur.min(child_idx));
                }
            }
        }

        if self.low_link[node] == self.index[node] {
            let mut component = Vec::new();
            loop {
                let top = self.stack.pop().expect("SCC root must be on the stack");
                self.on_stack.insert(top, false);
                component.push(top.to_string());
                if top == node {
                    break;
                }
            }
            self.sccs.push(component);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use viper_ir::{Function, Instruction, Type};

    fn function_calling(name: &str, callee: &str) -> Function {
        let mut f = Function::new(name, Type::I64, vec![]);
        f.entry_mut().push(Instruction::call(None, callee, vec![]));
        f.entry_mut().push(Instruction::ret(None));
        f
    }

    #[test]
    fn self_edge_is_recursive() {
        let mut m = Module::new();
        m.add_function(function_calling("fact", "fact"));
        let cg = CallGraph::build(&m);
        assert!(cg.is_recursive("fact"));
    }

    #[test]
    fn mutual_recursion_forms_one_scc() {
        let mut m = Module::new();
        m.add_function(function_calling("a", "b"));
        m.add_function(function_calling("b", "a"));
        let cg = CallGraph::build(&m);
        assert!(cg.is_recursive("a"));
        assert!(cg.is_recursive("b"));
        assert_eq!(cg.scc_of("a"), cg.scc_of("b"));
    }

    #[test]
    fn acyclic_calls_are_not_recursive() {
        let mut m = Module::new();
        m.add_function(function_calling("caller", "callee"));
        m.add_function(Function::new("callee", Type::I64, vec![]));
        let cg = CallGraph::build(&m);
        assert!(!cg.is_recursive("caller"));
        assert!(!cg.is_recursive("callee"));
    }

    #[test]
    fn call_counts_tally_multiple_sites() {
        let mut f = Function::new("caller", Type::I64, vec![]);
        f.entry_mut().push(Instruction::call(None, "helper", vec![]));
        let mut other = viper_ir::BasicBlock::new("other");
        other.push(Instruction::call(None, "helper", vec![]));
        other.push(Instruction::ret(None));
        f.add_block(other);
        f.entry_mut().push(Instruction::br("other", vec![]));

        let mut m = Module::new();
        m.add_function(f);
        let cg = CallGraph::build(&m);
        assert_eq!(cg.call_count("helper"), 2);
    }
}
