use crate::vm::Op;

use super::remap::{Rewriter, jump_targets};
use super::{OptimizationStats, PassOutput};

/// Remove instructions that follow a `JUMP` or `RETURN` and are not a jump
/// target. Code becomes live again at the next jump target.
pub fn eliminate_dead_code(code: &[Op]) -> PassOutput {
    let targets = jump_targets(code);
    let mut rw = Rewriter::new(code.len());
    let mut dead_from: Option<usize> = None;

    for (i, &op) in code.iter().enumerate() {
        if targets[i] {
            if let Some(start) = dead_from.take() {
                rw.drop_range(start..i);
            }
        }
        if dead_from.is_some() {
            continue;
        }
        rw.keep(i, op);
        if op.ends_block() {
            dead_from = Some(i + 1);
        }
    }
    if let Some(start) = dead_from {
        rw.drop_range(start..code.len());
    }

    let (out, remap) = rw.finish();
    PassOutput::new(code.len(), out, remap, OptimizationStats::default())
}
