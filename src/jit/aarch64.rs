//! AArch64 instruction encoding and routine emission.
//!
//! A routine keeps the context pointer in x19 (callee-saved). Each helper
//! call loads its operands into x1/x2 and its address into x16, then
//! branches with `blr x16`. A non-zero status leaves through the epilogue.

use super::codebuf::{CodeBuffer, ReferenceSize};
use super::compiler::Step;

/// AArch64 general-purpose registers used by compiled routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X16 = 16,
    X19 = 19,
    Fp = 29,
    Lr = 30,
    Sp = 31,
}

impl Reg {
    /// SP encodes as the zero register in data-processing instructions.
    pub const XZR: Reg = Reg::Sp;

    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Ne = 0b0001,
}

pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    pub fn define_label(&mut self, label: usize) {
        self.buf.define_label(label);
    }

    /// ADD Xd, Xn, #imm12
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        let inst = 0x9100_0000
            | (((imm12 as u32) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// ORR Xd, Xn, Xm
    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        let inst = 0xAA00_0000
            | ((rm.code() as u32) << 16)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// MOV Xd, Xm (ORR Xd, XZR, Xm)
    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        self.orr(rd, Reg::XZR, rm);
    }

    /// MOVZ Xd, #imm16, LSL #(16 * hw)
    pub fn movz(&mut self, rd: Reg, imm16: u16, hw: u8) {
        let inst = 0xD280_0000
            | (((hw & 0x3) as u32) << 21)
            | ((imm16 as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// MOVK Xd, #imm16, LSL #(16 * hw)
    pub fn movk(&mut self, rd: Reg, imm16: u16, hw: u8) {
        let inst = 0xF280_0000
            | (((hw & 0x3) as u32) << 21)
            | ((imm16 as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// Load a full 64-bit immediate in four instructions.
    pub fn mov_imm64(&mut self, rd: Reg, imm: u64) {
        self.movz(rd, imm as u16, 0);
        for hw in 1..4u8 {
            self.movk(rd, (imm >> (16 * hw as u32)) as u16, hw);
        }
    }

    /// CMP Xn, #imm12
    pub fn cmp_imm(&mut self, rn: Reg, imm12: u16) {
        let inst = 0xF100_0000
            | (((imm12 as u32) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (Reg::XZR.code() as u32);
        self.emit_raw(inst);
    }

    /// LDR Xt, [Xn, #imm] (unsigned offset, multiple of 8)
    pub fn ldr(&mut self, rt: Reg, rn: Reg, imm: u16) {
        let scaled = (imm / 8) as u32;
        let inst = 0xF940_0000
            | ((scaled & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// STR Xt, [Xn, #imm] (unsigned offset, multiple of 8)
    pub fn str(&mut self, rt: Reg, rn: Reg, imm: u16) {
        let scaled = (imm / 8) as u32;
        let inst = 0xF900_0000
            | ((scaled & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// STP Xt1, Xt2, [SP, #imm]!
    pub fn stp_pre(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA980_0000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    /// LDP Xt1, Xt2, [SP], #imm
    pub fn ldp_post(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA8C0_0000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    /// B.cond with a byte offset relative to this instruction.
    pub fn b_cond(&mut self, cond: Cond, offset: i32) {
        let inst = 0x5400_0000 | ((((offset / 4) as u32) & 0x7FFFF) << 5) | (cond as u32);
        self.emit_raw(inst);
    }

    /// CBZ Xn with a byte offset relative to this instruction.
    pub fn cbz(&mut self, rn: Reg, offset: i32) {
        let inst = 0xB400_0000 | ((((offset / 4) as u32) & 0x7FFFF) << 5) | (rn.code() as u32);
        self.emit_raw(inst);
    }

    /// B to `label`, patched later.
    pub fn b_label(&mut self, label: usize) {
        self.buf.emit_forward_ref(label, ReferenceSize::AArch64Branch);
    }

    /// BLR Xn
    pub fn blr(&mut self, rn: Reg) {
        self.emit_raw(0xD63F_0000 | ((rn.code() as u32) << 5));
    }

    /// RET (x30)
    pub fn ret(&mut self) {
        self.emit_raw(0xD65F_03C0);
    }
}

/// Context pointer for the whole routine.
const CTX: Reg = Reg::X19;

fn emit_helper_call(asm: &mut AArch64Assembler<'_>, helper: u64, a: u64, b: u64) {
    asm.mov(Reg::X0, CTX);
    asm.mov_imm64(Reg::X1, a);
    asm.mov_imm64(Reg::X2, b);
    asm.mov_imm64(Reg::X16, helper);
    asm.blr(Reg::X16);
}

/// Leave through the epilogue when x0 is non-zero.
fn emit_status_check(asm: &mut AArch64Assembler<'_>, exit: usize) {
    asm.cbz(Reg::X0, 8);
    asm.b_label(exit);
}

/// Emit a routine for `steps`. Label `i` is step `i`; label `steps.len()`
/// is the epilogue.
pub fn emit_routine(steps: &[Step]) -> CodeBuffer {
    let mut buf = CodeBuffer::new();
    let exit = steps.len();
    let mut asm = AArch64Assembler::new(&mut buf);

    asm.stp_pre(Reg::Fp, Reg::Lr, -32);
    asm.add_imm(Reg::Fp, Reg::Sp, 0);
    asm.str(CTX, Reg::Sp, 16);
    asm.mov(CTX, Reg::X0);

    for (index, step) in steps.iter().enumerate() {
        asm.define_label(index);
        match *step {
            Step::Call { helper, a, b } => {
                emit_helper_call(&mut asm, helper, a, b);
                emit_status_check(&mut asm, exit);
            }
            Step::Branch { helper, expect, target } => {
                emit_helper_call(&mut asm, helper, expect, 0);
                asm.cmp_imm(Reg::X0, 1);
                asm.b_cond(Cond::Ne, 8);
                asm.b_label(target);
                emit_status_check(&mut asm, exit);
            }
            Step::Jump(target) => asm.b_label(target),
            Step::Exit => asm.b_label(exit),
        }
    }

    asm.define_label(exit);
    asm.ldr(CTX, Reg::Sp, 16);
    asm.ldp_post(Reg::Fp, Reg::Lr, 32);
    asm.ret();
    buf
}
