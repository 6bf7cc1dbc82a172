//! Compile-time resolution of branches on constant conditions.
//!
//! Windows, tried in this order at each position:
//! - `PUSH a; PUSH b; CMP_*; JUMP_IF_*`
//! - `PUSH c; JUMP_IF_*`
//!
//! A taken branch becomes `JUMP target`; an untaken one disappears.

use crate::vm::{Constant, Op};

use super::remap::{Rewriter, jump_targets, window_is_clean};
use super::{EPSILON, OptimizationStats, PassOutput};

/// Truthiness of a constant condition: null is false, numbers are true when
/// non-zero, `'\0'` is false and strings are true.
pub fn constant_truthiness(c: &Constant) -> bool {
    match c {
        Constant::Null => false,
        Constant::Bool(b) => *b,
        Constant::Int(v) => *v != 0,
        Constant::Long(v) => *v != 0,
        Constant::Double(d) => d.abs() > EPSILON,
        Constant::Char(ch) => *ch != '\0',
        Constant::String(_) => true,
    }
}

/// Truthiness, but only where it agrees with the runtime branch test, which
/// looks at raw payload bits. `-0.0` and NaN are left to the runtime.
fn folded_truthiness(c: &Constant) -> Option<bool> {
    if let Constant::Double(d) = c {
        let runtime = d.to_bits() != 0;
        let folded = constant_truthiness(c);
        return (runtime == folded).then_some(folded);
    }
    Some(constant_truthiness(c))
}

/// Result of `a <op> b` on two constants of the same kind.
fn fold_comparison(op: Op, a: &Constant, b: &Constant) -> Option<bool> {
    use std::cmp::Ordering;

    let ord = match (a, b) {
        (Constant::Int(x), Constant::Int(y)) => x.cmp(y),
        (Constant::Long(x), Constant::Long(y)) => x.cmp(y),
        (Constant::Char(x), Constant::Char(y)) => x.cmp(y),
        (Constant::Double(x), Constant::Double(y)) => {
            // NaN and infinities do not survive the epsilon equality test
            if !x.is_finite() || !y.is_finite() {
                return None;
            }
            if matches!(op, Op::CmpEq | Op::CmpNe) {
                let equal = (x - y).abs() < EPSILON;
                return Some(if op == Op::CmpEq { equal } else { !equal });
            }
            x.partial_cmp(y)?
        }
        _ => return None,
    };

    let result = match op {
        Op::CmpEq => ord == Ordering::Equal,
        Op::CmpNe => ord != Ordering::Equal,
        Op::CmpLt => ord == Ordering::Less,
        Op::CmpGt => ord == Ordering::Greater,
        Op::CmpLe => ord != Ordering::Greater,
        Op::CmpGe => ord != Ordering::Less,
        _ => return None,
    };
    Some(result)
}

fn branch_taken(jump: Op, condition: bool) -> Option<bool> {
    match jump {
        Op::JumpIfTrue(_) => Some(condition),
        Op::JumpIfFalse(_) => Some(!condition),
        _ => None,
    }
}

/// Resolve branches whose condition is a constant or a comparison of two
/// constants.
pub fn simplify_branches(code: &[Op], constants: &[Constant]) -> PassOutput {
    let targets = jump_targets(code);
    let constant = |op: Op| match op {
        Op::Push(index) => constants.get(index),
        _ => None,
    };

    let mut rw = Rewriter::new(code.len());
    let mut stats = OptimizationStats::default();
    let mut i = 0;

    while i < code.len() {
        // PUSH a; PUSH b; CMP; JUMP_IF
        if i + 3 < code.len() && window_is_clean(&targets, i, 4) {
            let (jump, cmp) = (code[i + 3], code[i + 2]);
            let folded = match (constant(code[i]), constant(code[i + 1])) {
                (Some(a), Some(b)) if cmp.is_compare() => fold_comparison(cmp, a, b),
                _ => None,
            };
            if let Some(taken) = folded.and_then(|c| branch_taken(jump, c)) {
                resolve(&mut rw, i..i + 4, jump, taken);
                stats.branches_folded += 1;
                i += 4;
                continue;
            }
        }

        // PUSH c; JUMP_IF
        if i + 1 < code.len() && window_is_clean(&targets, i, 2) {
            let jump = code[i + 1];
            let folded = constant(code[i]).and_then(folded_truthiness);
            if let Some(taken) = folded.and_then(|c| branch_taken(jump, c)) {
                resolve(&mut rw, i..i + 2, jump, taken);
                stats.branches_folded += 1;
                i += 2;
                continue;
            }
        }

        rw.keep(i, code[i]);
        i += 1;
    }

    let (out, remap) = rw.finish();
    PassOutput::new(code.len(), out, remap, stats)
}

fn resolve(rw: &mut Rewriter, window: std::ops::Range<usize>, jump: Op, taken: bool) {
    match (taken, jump.jump_target()) {
        (true, Some(target)) => rw.emit(window, Op::Jump(target)),
        _ => rw.drop_range(window),
    }
}
