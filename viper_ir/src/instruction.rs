//! Instructions and basic blocks (§3 "Instruction", "BasicBlock").

use std::fmt;
use serde::{Deserialize, Serialize};
use viper_support::SourceLoc;

use crate::opcode::Opcode;
use crate::types::Type;
use crate::value::{TempId, Value};

/// The small attribute bag carried by call sites (§3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAttrs {
    pub pure_: bool,
    pub readonly: bool,
}

/// One IL instruction.
///
/// `labels`/`branch_args` describe terminator successors in declaration
/// order, one entry per successor; for `SwitchI32` the default label comes
/// first, followed by each case's label, matching the CFG successor
/// convention in §4.E.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub result: Option<(TempId, Type)>,
    pub operands: Vec<Value>,
    pub callee: Option<String>,
    pub labels: Vec<String>,
    pub branch_args: Vec<Vec<Value>>,
    /// Case values for `SwitchI32`, parallel to `labels[1..]` (the default
    /// has no case value and occupies `labels[0]`).
    pub cases: Vec<i32>,
    pub loc: SourceLoc,
    pub attrs: CallAttrs,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            result: None,
            operands: Vec::new(),
            callee: None,
            labels: Vec::new(),
            branch_args: Vec::new(),
            cases: Vec::new(),
            loc: SourceLoc::UNKNOWN,
            attrs: CallAttrs::default(),
        }
    }

    pub fn with_result(mut self, id: TempId, ty: Type) -> Self {
        self.result = Some((id, ty));
        self
    }

    pub fn with_operands(mut self, operands: Vec<Value>) -> Self {
        self.operands = operands;
        self
    }

    pub fn with_callee(mut self, callee: impl Into<String>) -> Self {
        self.callee = Some(callee.into());
        self
    }

    pub fn with_loc(mut self, loc: SourceLoc) -> Self {
        self.loc = loc;
        self
    }

    pub fn binary(opcode: Opcode, id: TempId, ty: Type, lhs: Value, rhs: Value) -> Self {
        Self::new(opcode).with_result(id, ty).with_operands(vec![lhs, rhs])
    }

    pub fn br(label: impl Into<String>, args: Vec<Value>) -> Self {
        let mut i = Self::new(Opcode::Br);
        i.labels = vec![label.into()];
        i.branch_args = vec![args];
        i
    }

    pub fn cbr(
        cond: Value,
        true_label: impl Into<String>,
        true_args: Vec<Value>,
        false_label: impl Into<String>,
        false_args: Vec<Value>,
    ) -> Self {
        let mut i = Self::new(Opcode::CBr).with_operands(vec![cond]);
        i.labels = vec![true_label.into(), false_label.into()];
        i.branch_args = vec![true_args, false_args];
        i
    }

    pub fn switch_i32(
        scrutinee: Value,
        default: impl Into<String>,
        default_args: Vec<Value>,
        arms: Vec<(i32, String, Vec<Value>)>,
    ) -> Self {
        let mut i = Self::new(Opcode::SwitchI32).with_operands(vec![scrutinee]);
        i.labels.push(default.into());
        i.branch_args.push(default_args);
        for (case, label, args) in arms {
            i.cases.push(case);
            i.labels.push(label);
            i.branch_args.push(args);
        }
        i
    }

    pub fn ret(value: Option<Value>) -> Self {
        Self::new(Opcode::Ret).with_operands(value.into_iter().collect())
    }

    pub fn call(id: Option<(TempId, Type)>, callee: impl Into<String>, args: Vec<Value>) -> Self {
        let mut i = Self::new(Opcode::Call).with_operands(args).with_callee(callee);
        i.result = id;
        i
    }

    /// All destination labels of a terminator, in declaration order
    /// (`SwitchI32`'s default first, §4.E).
    pub fn successor_labels(&self) -> &[String] {
        &self.labels
    }

    pub fn branch_args_for(&self, successor_index: usize) -> Option<&[Value]> {
        self.branch_args.get(successor_index).map(|v| v.as_slice())
    }

    pub fn is_terminator(&self) -> bool {
        self.opcode.is_terminator()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((id, ty)) = &self.result {
            write!(f, "%t{}:{} = ", id, ty)?;
        }
        write!(f, "{}", self.opcode.name())?;
        if let Some(callee) = &self.callee {
            write!(f, " @{}", callee)?;
        }
        if !self.operands.is_empty() {
            write!(f, " ")?;
            for (i, op) in self.operands.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", op)?;
            }
        }
        for (i, label) in self.labels.iter().enumerate() {
            if self.opcode == Opcode::SwitchI32 && i > 0 {
                write!(f, ", case {} -> {}", self.cases[i - 1], label)?;
            } else {
                write!(f, " {}", label)?;
            }
            if let Some(args) = self.branch_args.get(i) {
                if !args.is_empty() {
                    write!(f, "(")?;
                    for (j, a) in args.iter().enumerate() {
                        if j > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", a)?;
                    }
                    write!(f, ")")?;
                }
            }
        }
        Ok(())
    }
}

/// A named, typed value at a block head, supplied by predecessors via
/// branch arguments — equivalent to a phi node (GLOSSARY).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParam {
    pub name: String,
    pub ty: Type,
    pub temp: TempId,
}

/// A label, parameter list, instruction list, and `terminated` flag
/// (§3 "BasicBlock"). The last instruction, when present, must be a
/// terminator; the invariant is enforced by the verifier, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub label: String,
    pub params: Vec<BlockParam>,
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), params: Vec::new(), instructions: Vec::new() }
    }

    pub fn with_params(mut self, params: Vec<BlockParam>) -> Self {
        self.params = params;
        self
    }

    pub fn push(&mut self, instr: Instruction) {
        self.instructions.push(instr);
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|i| i.is_terminator())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminator().is_some()
    }

    pub fn successors(&self) -> Vec<&str> {
        match self.terminator() {
            Some(term) => term.successor_labels().iter().map(|s| s.as_str()).collect(),
            None => Vec::new(),
        }
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.label)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "%{}:{}", p.name, p.ty)?;
        }
        writeln!(f, "):")?;
        for instr in &self.instructions {
            writeln!(f, "  {}", instr)?;
        }
        Ok(())
    }
}
