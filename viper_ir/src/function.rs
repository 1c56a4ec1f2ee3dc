//! IR function representation (§3 "Function").

use std::fmt;
use serde::{Deserialize, Serialize};

use crate::instruction::{BasicBlock, BlockParam};
use crate::types::Type;
use crate::value::TempId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub ty: Type,
    pub temp: TempId,
}

impl Parameter {
    pub fn new(name: impl Into<String>, ty: Type, temp: TempId) -> Self {
        Self { name: name.into(), ty, temp }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}:{}", self.name, self.ty)
    }
}

/// A function: name, return type, parameters, an ordered block list whose
/// first block is the entry (its parameters must equal the function
/// parameters, §3), and a sparse debug-only name table indexed by temp id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub return_type: Type,
    pub params: Vec<Parameter>,
    pub blocks: Vec<BasicBlock>,
    pub value_names: Vec<Option<String>>,
    next_temp: TempId,
}

impl Function {
    pub fn new(name: impl Into<String>, return_type: Type, params: Vec<Parameter>) -> Self {
        let next_temp = params.iter().map(|p| p.temp + 1).max().unwrap_or(0);
        let entry_params: Vec<BlockParam> = params
            .iter()
            .map(|p| BlockParam { name: p.name.clone(), ty: p.ty, temp: p.temp })
            .collect();
        let entry = BasicBlock::new("entry").with_params(entry_params);
        Self {
            name: name.into(),
            return_type,
            params,
            blocks: vec![entry],
            value_names: Vec::new(),
            next_temp,
        }
    }

    pub fn entry(&self) -> &BasicBlock {
        &self.blocks[0]
    }

    pub fn entry_mut(&mut self) -> &mut BasicBlock {
        &mut self.blocks[0]
    }

    pub fn next_temp(&mut self) -> TempId {
        let id = self.next_temp;
        self.next_temp += 1;
        id
    }

    /// Raises the temp counter so ids allocated externally (e.g. by the
    /// inliner cloning a callee) never collide with this function's own.
    pub fn reserve_temps_at_least(&mut self, minimum: TempId) {
        if self.next_temp < minimum {
            self.next_temp = minimum;
        }
    }

    pub fn add_block(&mut self, block: BasicBlock) {
        self.blocks.push(block);
    }

    pub fn block(&self, label: &str) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.label == label)
    }

    pub fn block_mut(&mut self, label: &str) -> Option<&mut BasicBlock> {
        self.blocks.iter_mut().find(|b| b.label == label)
    }

    pub fn block_index(&self, label: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.label == label)
    }

    pub fn set_value_name(&mut self, temp: TempId, name: impl Into<String>) {
        let idx = temp as usize;
        if self.value_names.len() <= idx {
            self.value_names.resize(idx + 1, None);
        }
        self.value_names[idx] = Some(name.into());
    }

    pub fn value_name(&self, temp: TempId) -> Option<&str> {
        self.value_names.get(temp as usize).and_then(|o| o.as_deref())
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func @{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        writeln!(f, ") -> {} {{", self.return_type)?;
        for block in &self.blocks {
            write!(f, "{}", block)?;
        }
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::value::Value;

    #[test]
    fn entry_block_params_mirror_function_params() {
        let func = Function::new("f", Type::I64, vec![Parameter::new("n", Type::I64, 0)]);
        assert_eq!(func.entry().params.len(), 1);
        assert_eq!(func.entry().params[0].name, "n");
        assert_eq!(func.entry().label, "entry");
    }

    #[test]
    fn next_temp_starts_after_parameters() {
        let mut func = Function::new("f", Type::I64, vec![Parameter::new("n", Type::I64, 0)]);
        assert_eq!(func.next_temp(), 1);
        assert_eq!(func.next_temp(), 2);
    }

    #[test]
    fn block_lookup_by_label() {
        let mut func = Function::new("f", Type::Void, vec![]);
        func.add_block(crate::instruction::BasicBlock::new("exit"));
        assert!(func.block("exit").is_some());
        assert!(func.block("missing").is_none());
    }

    #[test]
    fn instruction_count_sums_all_blocks() {
        let mut func = Function::new("f", Type::Void, vec![]);
        func.entry_mut().push(Instruction::ret(None));
        let mut other = crate::instruction::BasicBlock::new("other");
        other.push(Instruction::ret(None));
        other.push(Instruction::ret(Some(Value::ConstInt(0, false))));
        func.add_block(other);
        assert_eq!(func.instruction_count(), 3);
    }
}
