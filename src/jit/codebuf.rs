//! Code buffer for building JIT code.
//!
//! Labels are bytecode indices. The index one past the last instruction is
//! the routine's epilogue, so every jump target resolves to a label.

use std::collections::HashMap;

use super::memory::{ExecutableMemory, MemoryError};

/// Unconditional AArch64 `B` with a zero offset, patched later.
const AARCH64_B: u32 = 0x1400_0000;

/// Size of a reference to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSize {
    /// 32-bit offset relative to the end of the field (x86-64 `jmp`/`jcc`).
    Rel32,
    /// 26-bit word offset of an AArch64 `B`.
    AArch64Branch,
}

#[derive(Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Label id -> code offset.
    labels: HashMap<usize, usize>,
    /// Pending references: (field offset, label id, size).
    forward_refs: Vec<(usize, usize, ReferenceSize)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Define `label` at the current position.
    pub fn define_label(&mut self, label: usize) {
        self.labels.insert(label, self.code.len());
    }

    pub fn label(&self, label: usize) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Emit a placeholder that `patch_forward_refs` resolves to `label`.
    pub fn emit_forward_ref(&mut self, label: usize, size: ReferenceSize) {
        self.forward_refs.push((self.code.len(), label, size));
        match size {
            ReferenceSize::Rel32 => self.emit_u32(0),
            ReferenceSize::AArch64Branch => self.emit_u32(AARCH64_B),
        }
    }

    /// Resolve every pending reference. Fails on an undefined label or an
    /// offset that does not fit its field.
    pub fn patch_forward_refs(&mut self) -> Result<(), String> {
        for (offset, label, size) in std::mem::take(&mut self.forward_refs) {
            let target = self
                .labels
                .get(&label)
                .copied()
                .ok_or_else(|| format!("undefined label: {}", label))?;

            match size {
                ReferenceSize::Rel32 => {
                    let rel = target as i64 - (offset as i64 + 4);
                    let rel = i32::try_from(rel)
                        .map_err(|_| format!("relative offset out of range for label {}", label))?;
                    self.code[offset..offset + 4].copy_from_slice(&rel.to_le_bytes());
                }
                ReferenceSize::AArch64Branch => {
                    let rel = (target as i64 - offset as i64) / 4;
                    if !(-(1 << 25)..(1 << 25)).contains(&rel) {
                        return Err(format!("branch offset out of range for label {}", label));
                    }
                    let current = u32::from_le_bytes([
                        self.code[offset],
                        self.code[offset + 1],
                        self.code[offset + 2],
                        self.code[offset + 3],
                    ]);
                    let inst = (current & 0xFC00_0000) | ((rel as u32) & 0x03FF_FFFF);
                    self.code[offset..offset + 4].copy_from_slice(&inst.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Patch references and copy the code into executable memory.
    pub fn finalize(mut self) -> Result<ExecutableMemory, MemoryError> {
        self.patch_forward_refs().map_err(|_| MemoryError::InvalidSize)?;
        ExecutableMemory::from_code(&self.code)
    }
}
