//! Old-to-new instruction index mapping shared by every pass.
//!
//! A pass walks the old code once and tells a [`Rewriter`] what replaces each
//! old range: a kept instruction, a replacement, or nothing. `finish` then
//! resolves the index map and rewrites every jump operand through it.

use std::ops::Range;

use crate::vm::Op;

/// Maps old instruction indices `0..=old_len` to new ones. The sentinel
/// `old_len` maps to `new_len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remap {
    map: Vec<usize>,
}

impl Remap {
    /// The identity mapping for code of length `len`.
    pub fn identity(len: usize) -> Self {
        Self { map: (0..=len).collect() }
    }

    pub fn old_len(&self) -> usize {
        self.map.len() - 1
    }

    pub fn new_len(&self) -> usize {
        self.map[self.old_len()]
    }

    /// New index for old index `old`. Anything past the end maps to the
    /// new end.
    pub fn get(&self, old: usize) -> usize {
        self.map.get(old).copied().unwrap_or_else(|| self.new_len())
    }

    /// Mapping that applies `self` and then `next`.
    pub fn then(&self, next: &Remap) -> Remap {
        Remap { map: self.map.iter().map(|&mid| next.get(mid)).collect() }
    }
}

pub struct Rewriter {
    out: Vec<Op>,
    mapping: Vec<Option<usize>>,
    removed: usize,
}

impl Rewriter {
    pub fn new(old_len: usize) -> Self {
        Self { out: Vec::with_capacity(old_len), mapping: vec![None; old_len + 1], removed: 0 }
    }

    /// Emit `op` as the replacement for `old`. Old indices in the range that
    /// are not mapped yet point at the emitted instruction.
    pub fn emit(&mut self, old: Range<usize>, op: Op) {
        let at = self.out.len();
        for index in old {
            if let Some(slot) = self.mapping.get_mut(index) {
                slot.get_or_insert(at);
            }
        }
        self.out.push(op);
    }

    /// Keep instruction `index` unchanged.
    pub fn keep(&mut self, index: usize, op: Op) {
        self.emit(index..index + 1, op);
    }

    /// Remove `old` entirely. Its indices resolve to the next emitted
    /// instruction.
    pub fn drop_range(&mut self, old: Range<usize>) {
        self.removed += old.len();
    }

    /// Instructions removed through `drop_range` so far.
    pub fn removed(&self) -> usize {
        self.removed
    }

    pub fn finish(self) -> (Vec<Op>, Remap) {
        let Rewriter { mut out, mapping, .. } = self;
        let old_len = mapping.len() - 1;
        let new_len = out.len();

        let mut map = vec![new_len; old_len + 1];
        for index in (0..old_len).rev() {
            map[index] = mapping[index].unwrap_or(map[index + 1]);
        }
        let remap = Remap { map };

        for op in out.iter_mut() {
            if let Some(target) = op.jump_target() {
                *op = op.with_jump_target(remap.get(target));
            }
        }
        (out, remap)
    }
}

/// `targets[i]` is true when some jump lands on instruction `i`. The vector
/// has one extra entry for the end position.
pub fn jump_targets(code: &[Op]) -> Vec<bool> {
    let mut targets = vec![false; code.len() + 1];
    for op in code {
        if let Some(target) = op.jump_target() {
            targets[target.min(code.len())] = true;
        }
    }
    targets
}

/// A window may be rewritten only if no jump lands strictly inside it.
pub fn window_is_clean(targets: &[bool], start: usize, len: usize) -> bool {
    (start + 1..start + len).all(|i| !targets.get(i).copied().unwrap_or(false))
}
