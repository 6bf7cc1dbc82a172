//! Peephole pass: short windows rewritten in place.
//!
//! At each position the first matching rule wins:
//! 1. `PUSH; POP` and `DUP; POP` vanish.
//! 2. `PUSH c1; PUSH c2; <binop>` on same-kind constants folds into one
//!    `PUSH` of a freshly appended pool entry.
//! 3. `LOAD_LOCAL s; STORE_LOCAL s` vanishes.
//! 4. A jump whose target is an unconditional `JUMP` is retargeted to the end
//!    of the chain.

use std::collections::HashSet;

use crate::vm::semantics::{self, ArithOp};
use crate::vm::{Constant, Op, Value};

use super::remap::{Rewriter, jump_targets, window_is_clean};
use super::{EPSILON, OptimizationStats, PassOutput};

fn arith_op(op: Op) -> Option<ArithOp> {
    match op {
        Op::Add => Some(ArithOp::Add),
        Op::Sub => Some(ArithOp::Sub),
        Op::Mul => Some(ArithOp::Mul),
        Op::Div => Some(ArithOp::Div),
        Op::Mod => Some(ArithOp::Mod),
        _ => None,
    }
}

/// Fold `a op b` when both constants share a kind the runtime would compute
/// the same way.
fn fold_binary(op: Op, a: &Constant, b: &Constant) -> Option<Constant> {
    let value = match (a, b) {
        (Constant::Bool(x), Constant::Bool(y)) => match op {
            Op::And => Value::from_bool(*x && *y),
            Op::Or => Value::from_bool(*x || *y),
            _ => return None,
        },
        (Constant::Int(_), Constant::Int(_))
        | (Constant::Long(_), Constant::Long(_))
        | (Constant::Char(_), Constant::Char(_)) => {
            // integer division by zero stays a runtime fault
            semantics::arithmetic(arith_op(op)?, a.to_value()?, b.to_value()?).ok()?
        }
        (Constant::Double(_), Constant::Double(y)) => {
            let op = arith_op(op)?;
            if matches!(op, ArithOp::Div | ArithOp::Mod) && y.abs() < EPSILON {
                return None;
            }
            let folded = semantics::arithmetic(op, a.to_value()?, b.to_value()?).ok()?;
            if !folded.as_f64().is_finite() {
                return None;
            }
            folded
        }
        _ => return None,
    };
    Constant::from_value(value)
}

/// Final target of the jump chain starting at `target`, or None when the
/// chain is empty or loops back on itself.
fn thread_target(code: &[Op], target: usize) -> Option<usize> {
    let mut visited = HashSet::new();
    let mut current = target;
    while let Some(Op::Jump(next)) = code.get(current) {
        if !visited.insert(current) {
            return None;
        }
        current = *next;
    }
    (current != target).then_some(current)
}

pub fn peephole(code: &[Op], constants: &mut Vec<Constant>) -> PassOutput {
    let targets = jump_targets(code);
    let mut rw = Rewriter::new(code.len());
    let mut stats = OptimizationStats::default();
    let mut i = 0;

    while i < code.len() {
        let window = |len: usize| i + len <= code.len() && window_is_clean(&targets, i, len);

        if window(2) && matches!((code[i], code[i + 1]), (Op::Push(_) | Op::Dup, Op::Pop)) {
            rw.drop_range(i..i + 2);
            i += 2;
            continue;
        }

        if window(3) {
            if let (Op::Push(x), Op::Push(y)) = (code[i], code[i + 1]) {
                let folded = match (constants.get(x), constants.get(y)) {
                    (Some(a), Some(b)) => fold_binary(code[i + 2], a, b),
                    _ => None,
                };
                if let Some(constant) = folded {
                    constants.push(constant);
                    rw.emit(i..i + 3, Op::Push(constants.len() - 1));
                    stats.constants_folded += 1;
                    i += 3;
                    continue;
                }
            }
        }

        if window(2) {
            if let (Op::LoadLocal { slot: load, .. }, Op::StoreLocal { slot: store, .. }) =
                (code[i], code[i + 1])
            {
                if load == store {
                    rw.drop_range(i..i + 2);
                    i += 2;
                    continue;
                }
            }
        }

        let op = code[i];
        match op.jump_target().and_then(|t| thread_target(code, t)) {
            Some(final_target) => {
                rw.keep(i, op.with_jump_target(final_target));
                stats.jumps_threaded += 1;
            }
            None => rw.keep(i, op),
        }
        i += 1;
    }

    let (out, remap) = rw.finish();
    PassOutput::new(code.len(), out, remap, stats)
}
