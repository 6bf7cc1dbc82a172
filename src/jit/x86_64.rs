//! x86-64 instruction encoding and routine emission.
//!
//! Uses System V AMD64 ABI conventions. A routine keeps the context pointer
//! in RBX (callee-saved) and calls one helper per instruction:
//!
//! ```text
//! mov rdi, rbx ; mov rsi, a ; mov rdx, b ; mov rax, helper ; call rax
//! test rax, rax ; jne epilogue
//! ```

use super::codebuf::{CodeBuffer, ReferenceSize};
use super::compiler::Step;

/// x86-64 general-purpose registers used by compiled routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R12 = 12,
}

impl Reg {
    /// Register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    E = 0x4,
    Ne = 0x5,
}

pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    fn emit_rex_w(&mut self, reg: Reg, rm: Reg) {
        self.buf.emit_u8(0x48 | reg.rex_r() | rm.rex_b());
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    pub fn define_label(&mut self, label: usize) {
        self.buf.define_label(label);
    }

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) {
        self.buf.emit_u8(0x48 | dst.rex_b());
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm);
    }

    /// CMP r64, imm8 (sign-extended)
    pub fn cmp_ri8(&mut self, dst: Reg, imm: i8) {
        self.buf.emit_u8(0x48 | dst.rex_b());
        self.buf.emit_u8(0x83);
        self.buf.emit_u8(Self::modrm(0b11, 7, dst.code()));
        self.buf.emit_u8(imm as u8);
    }

    /// TEST r64, r64
    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x85);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// JMP rel32 to `label`.
    pub fn jmp_label(&mut self, label: usize) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_forward_ref(label, ReferenceSize::Rel32);
    }

    /// Jcc rel32 to `label`.
    pub fn jcc_label(&mut self, cond: Cond, label: usize) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_forward_ref(label, ReferenceSize::Rel32);
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }
}

/// Context pointer for the whole routine.
const CTX: Reg = Reg::Rbx;

fn emit_helper_call(asm: &mut X86_64Assembler<'_>, helper: u64, a: u64, b: u64) {
    asm.mov_rr(Reg::Rdi, CTX);
    asm.mov_ri64(Reg::Rsi, a);
    asm.mov_ri64(Reg::Rdx, b);
    asm.mov_ri64(Reg::Rax, helper);
    asm.call_r(Reg::Rax);
}

/// Emit a routine for `steps`. Label `i` is step `i`; label `steps.len()`
/// is the epilogue.
pub fn emit_routine(steps: &[Step]) -> CodeBuffer {
    let mut buf = CodeBuffer::new();
    let exit = steps.len();
    let mut asm = X86_64Assembler::new(&mut buf);

    // Three pushes after the return address leave RSP 16-byte aligned.
    asm.push(Reg::Rbp);
    asm.mov_rr(Reg::Rbp, Reg::Rsp);
    asm.push(Reg::Rbx);
    asm.push(Reg::R12);
    asm.mov_rr(CTX, Reg::Rdi);

    for (index, step) in steps.iter().enumerate() {
        asm.define_label(index);
        match *step {
            Step::Call { helper, a, b } => {
                emit_helper_call(&mut asm, helper, a, b);
                asm.test_rr(Reg::Rax, Reg::Rax);
                asm.jcc_label(Cond::Ne, exit);
            }
            Step::Branch { helper, expect, target } => {
                emit_helper_call(&mut asm, helper, expect, 0);
                asm.cmp_ri8(Reg::Rax, 1);
                asm.jcc_label(Cond::E, target);
                asm.test_rr(Reg::Rax, Reg::Rax);
                asm.jcc_label(Cond::Ne, exit);
            }
            Step::Jump(target) => asm.jmp_label(target),
            Step::Exit => asm.jmp_label(exit),
        }
    }

    asm.define_label(exit);
    asm.pop(Reg::R12);
    asm.pop(Reg::Rbx);
    asm.pop(Reg::Rbp);
    asm.ret();
    buf
}
