//! Table-driven peephole rewrites (§4.F.3): algebraic identities over a
//! constant operand or two syntactically equal operands, plus literal
//! constant folding of comparisons so that a `CBr`/`SwitchI32` whose
//! condition becomes a literal collapses to an unconditional branch.

use std::collections::HashMap;

use viper_ir::{Instruction, Opcode, TempId, Value};

use crate::stats::OptimizationStats;
use crate::support::{apply_substitutions, fold_known_terminators};

fn same_operands(a: &Value, b: &Value) -> bool {
    a == b
}

/// One identity rule from the §4.F.3 table, or a direct literal-operand
/// fold for comparisons (needed to expose `CBr`/`SwitchI32` folding on
/// a condition computed from two literals in the same pass).
fn try_fold(instr: &Instruction) -> Option<Value> {
    use Opcode::*;
    if instr.result.is_none() {
        return None;
    }
    let ops = &instr.operands;
    let (lhs, rhs) = (ops.first(), ops.get(1));

    match instr.opcode {
        IAddOvf => match (lhs, rhs) {
            (Some(x), Some(Value::ConstInt(0, false))) => Some(x.clone()),
            (Some(Value::ConstInt(0, false)), Some(x)) => Some(x.clone()),
            _ => None,
        },
        ISubOvf => match (lhs, rhs) {
            (Some(x), Some(Value::ConstInt(0, false))) => Some(x.clone()),
            (Some(a), Some(b)) if same_operands(a, b) => Some(Value::ConstInt(0, false)),
            _ => None,
        },
        IMulOvf => match (lhs, rhs) {
            (Some(x), Some(Value::ConstInt(1, false))) => Some(x.clone()),
            (Some(Value::ConstInt(1, false)), Some(x)) => Some(x.clone()),
            (Some(_), Some(Value::ConstInt(0, false))) | (Some(Value::ConstInt(0, false)), Some(_)) => {
                Some(Value::ConstInt(0, false))
            }
            _ => None,
        },
        And => match (lhs, rhs) {
            (Some(x), Some(Value::ConstInt(-1, false))) => Some(x.clone()),
            (Some(Value::ConstInt(-1, false)), Some(x)) => Some(x.clone()),
            (Some(a), Some(b)) if same_operands(a, b) => Some(a.clone()),
            (Some(_), Some(Value::ConstInt(0, false))) | (Some(Value::ConstInt(0, false)), Some(_)) => {
                Some(Value::ConstInt(0, false))
            }
            _ => None,
        },
        Or => match (lhs, rhs) {
            (Some(x), Some(Value::ConstInt(0, false))) => Some(x.clone()),
            (Some(_), Some(Value::ConstInt(-1, false))) => Some(Value::ConstInt(-1, false)),
            (Some(a), Some(b)) if same_operands(a, b) => Some(a.clone()),
            _ => None,
        },
        Xor => match (lhs, rhs) {
            (Some(x), Some(Value::ConstInt(0, false))) => Some(x.clone()),
            (Some(a), Some(b)) if same_operands(a, b) => Some(Value::ConstInt(0, false)),
            _ => None,
        },
        Shl | LShr | AShr => match (lhs, rhs) {
            (Some(x), Some(Value::ConstInt(0, false))) => Some(x.clone()),
            (Some(Value::ConstInt(0, false)), Some(_)) => Some(Value::ConstInt(0, false)),
            _ => None,
        },
        ICmpEq | SCmpLE | SCmpGE | UCmpLE | UCmpGE => match (lhs, rhs) {
            (Some(a), Some(b)) if same_operands(a, b) => Some(Value::const_bool(true)),
            _ => literal_compare(instr.opcode, lhs, rhs),
        },
        ICmpNe | SCmpLT | SCmpGT | UCmpLT | UCmpGT => match (lhs, rhs) {
            (Some(a), Some(b)) if same_operands(a, b) => Some(Value::const_bool(false)),
            _ => literal_compare(instr.opcode, lhs, rhs),
        },
        // Reflexive float compares are withheld by default: the optimizer
        // cannot prove `x` is non-NaN without a fast-math attribute this
        // toolchain does not yet model (§9 open question).
        FCmpEQ | FCmpNE | FCmpLT | FCmpLE | FCmpGT | FCmpGE => literal_compare(instr.opcode, lhs, rhs),
        _ => None,
    }
}

fn literal_compare(op: Opcode, lhs: Option<&Value>, rhs: Option<&Value>) -> Option<Value> {
    use Opcode::*;
    let (lhs, rhs) = (lhs?, rhs?);
    if lhs.is_constant() && rhs.is_constant() {
        if let (Some(a), Some(b)) = (lhs.as_const_int(), rhs.as_const_int()) {
            let result = match op {
                ICmpEq => a == b,
                ICmpNe => a != b,
                SCmpLT => a < b,
                SCmpLE => a <= b,
                SCmpGT => a > b,
                SCmpGE => a >= b,
                UCmpLT => (a as u64) < (b as u64),
                UCmpLE => (a as u64) <= (b as u64),
                UCmpGT => (a as u64) > (b as u64),
                UCmpGE => (a as u64) >= (b as u64),
                _ => return None,
            };
            return Some(Value::const_bool(result));
        }
        if let (Some(a), Some(b)) = (lhs.as_const_float(), rhs.as_const_float()) {
            let result = match op {
                FCmpEQ => a == b,
                FCmpNE => a != b,
                FCmpLT => a < b,
                FCmpLE => a <= b,
                FCmpGT => a > b,
                FCmpGE => a >= b,
                _ => return None,
            };
            return Some(Value::const_bool(result));
        }
    }
    None
}

/// Runs one sweep of the peephole table over `func`, substitutes every
/// folded temp's uses, and collapses any terminator that becomes
/// constant as a result (§4.F.3). Returns whether anything changed.
pub fn run(func: &mut viper_ir::Function, stats: &mut OptimizationStats) -> bool {
    let mut subst: HashMap<TempId, Value> = HashMap::new();
    for block in &func.blocks {
        for instr in &block.instructions {
            if let (Some((id, _)), Some(replacement)) = (instr.result, try_fold(instr)) {
                subst.insert(id, replacement);
            }
        }
    }
    if !subst.is_empty() {
        stats.instructions_folded += subst.len() as u64;
    }
    let mut changed = apply_substitutions(func, &subst);
    changed |= fold_known_terminators(func, stats);
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use viper_ir::{BasicBlock, Function, Type};

    #[test_case(Opcode::IAddOvf, Value::ConstInt(0, false), Value::Temp(1), Value::Temp(1); "iaddovf 0,x")]
    #[test_case(Opcode::ISubOvf, Value::Temp(1), Value::ConstInt(0, false), Value::Temp(1); "isubovf x,0")]
    #[test_case(Opcode::IMulOvf, Value::Temp(1), Value::ConstInt(1, false), Value::Temp(1); "imulovf x,1")]
    #[test_case(Opcode::IMulOvf, Value::Temp(1), Value::ConstInt(0, false), Value::ConstInt(0, false); "imulovf x,0")]
    #[test_case(Opcode::And, Value::Temp(1), Value::ConstInt(-1, false), Value::Temp(1); "and x,-1")]
    #[test_case(Opcode::Xor, Value::Temp(1), Value::Temp(1), Value::ConstInt(0, false); "xor x,x")]
    fn identity_rules_fold_to_expected_value(op: Opcode, lhs: Value, rhs: Value, expected: Value) {
        let instr = Instruction::binary(op, 0, Type::I64, lhs, rhs);
        assert_eq!(try_fold(&instr), Some(expected));
    }

    #[test]
    fn unsigned_compare_of_two_literals_folds_cbr_to_br() {
        let mut f = Function::new("f", Type::Void, vec![]);
        f.entry_mut().push(Instruction::binary(Opcode::UCmpLT, 0, Type::I1, Value::ConstInt(3, false), Value::ConstInt(5, false)));
        f.entry_mut().push(Instruction::cbr(Value::Temp(0), "true_bb", vec![], "false_bb", vec![]));
        let mut tb = BasicBlock::new("true_bb");
        tb.push(Instruction::ret(None));
        let mut fb = BasicBlock::new("false_bb");
        fb.push(Instruction::ret(None));
        f.add_block(tb);
        f.add_block(fb);

        let mut stats = OptimizationStats::new();
        assert!(run(&mut f, &mut stats));
        let term = f.entry().terminator().unwrap();
        assert_eq!(term.opcode, Opcode::Br);
        assert_eq!(term.labels, vec!["true_bb".to_string()]);
    }

    #[test]
    fn reflexive_float_compare_is_not_folded() {
        let instr = Instruction::binary(Opcode::FCmpEQ, 0, Type::I1, Value::Temp(1), Value::Temp(1));
        assert_eq!(try_fold(&instr), None);
    }
}
