//! AArch64 instruction emitter.

use crate::buffer::{CodeBuffer, FixupKind, Label};
use crate::reloc::{RelocEntry, RelocFormat, RelocKind};

use super::{Cond, Emitter, Mem, MembarKind};

/// General-purpose registers. SP and XZR share encoding 31 and are never
/// exposed as operands; the few instructions that need them encode them
/// directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum XReg {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X4 = 4,
    X5 = 5,
    X6 = 6,
    X7 = 7,
    X8 = 8,
    X9 = 9,
    X10 = 10,
    X11 = 11,
    X12 = 12,
    X13 = 13,
    X14 = 14,
    X15 = 15,
    X16 = 16,
    X17 = 17,
    X18 = 18,
    X19 = 19,
    X20 = 20,
    X21 = 21,
    X22 = 22,
    X23 = 23,
    X24 = 24,
    X25 = 25,
    X26 = 26,
    X27 = 27,
    X28 = 28,
    Fp = 29,
    Lr = 30,
}

impl Cond {
    /// Four-bit condition field of `b.cond`.
    fn a64_cc(self) -> u32 {
        match self {
            Cond::Eq => 0b0000,
            Cond::Ne => 0b0001,
            Cond::AboveEqual => 0b0010, // hs
            Cond::Below => 0b0011,      // lo
            Cond::Above => 0b1000,      // hi
            Cond::BelowEqual => 0b1001, // ls
            Cond::Ge => 0b1010,
            Cond::Lt => 0b1011,
            Cond::Gt => 0b1100,
            Cond::Le => 0b1101,
        }
    }
}

pub struct A64Emitter {
    buf: CodeBuffer,
}

impl A64Emitter {
    fn emit(&mut self, insn: u32) {
        self.buf.emit_u32(insn);
    }

    /// Folds an indexed operand into a plain `base + disp` one, materializing
    /// `base + index << log2(scale)` into `SCRATCH2` when needed.
    fn resolve_index(&mut self, mem: Mem<XReg>) -> (XReg, i32) {
        match mem.index {
            None => (mem.base, mem.disp),
            Some(index) => {
                let shift = mem.scale.trailing_zeros();
                // add x17, base, index, lsl #shift
                self.emit(
                    0x8B00_0000
                        | (index as u32) << 16
                        | shift << 10
                        | (mem.base as u32) << 5
                        | Self::SCRATCH2 as u32,
                );
                (Self::SCRATCH2, mem.disp)
            }
        }
    }

    /// Base register and displacement for a load/store of `size` bytes,
    /// falling back to an address computation in `SCRATCH2` when the
    /// displacement fits neither the scaled-imm12 nor the imm9 form.
    fn resolve_addr(&mut self, mem: Mem<XReg>, size: usize) -> (XReg, i32) {
        let (base, disp) = self.resolve_index(mem);
        let scaled_ok = disp >= 0 && disp % size as i32 == 0 && disp / size as i32 <= 0xFFF;
        let unscaled_ok = (-256..256).contains(&disp);
        if scaled_ok || unscaled_ok {
            return (base, disp);
        }
        if base != Self::SCRATCH2 {
            self.mov_rr(Self::SCRATCH2, base);
        }
        self.add_imm(Self::SCRATCH2, disp);
        (Self::SCRATCH2, 0)
    }

    /// Load/store with either the scaled unsigned-imm12 or the imm9 form.
    /// `scaled_op`/`unscaled_op` are the opcode words with zero offset fields.
    fn emit_mem_access(
        &mut self,
        scaled_op: u32,
        unscaled_op: u32,
        reg: XReg,
        mem: Mem<XReg>,
        size: usize,
    ) {
        let (base, disp) = self.resolve_addr(mem, size);
        if disp >= 0 && disp % size as i32 == 0 && disp / size as i32 <= 0xFFF {
            let imm12 = (disp / size as i32) as u32;
            self.emit(scaled_op | imm12 << 10 | (base as u32) << 5 | reg as u32);
        } else {
            let imm9 = (disp as u32) & 0x1FF;
            self.emit(unscaled_op | imm9 << 12 | (base as u32) << 5 | reg as u32);
        }
    }

    fn cond_branch_to(&mut self, insn: u32, label: Label) {
        let at = self.buf.pos();
        self.emit(insn);
        self.buf.use_label(label, at, FixupKind::A64Cond19);
    }
}

impl Emitter for A64Emitter {
    type Reg = XReg;

    const SCRATCH: XReg = XReg::X16;
    const SCRATCH2: XReg = XReg::X17;
    const THREAD: XReg = XReg::X28;
    const FP: XReg = XReg::Fp;
    const RETURN: XReg = XReg::X0;
    // movz + movk x3 + blr, all through x16
    const PATCHABLE_CALL_SIZE: usize = 20;
    // b/bl reach: +/- 2^25 words
    const MAX_BRANCH_DISP: i64 = (1 << 27) - 4;
    const SHIFT_COUNT: Option<XReg> = None;

    fn arg_reg(index: usize) -> XReg {
        assert!(index < 8, "argument {index} is not passed in a register");
        [
            XReg::X0,
            XReg::X1,
            XReg::X2,
            XReg::X3,
            XReg::X4,
            XReg::X5,
            XReg::X6,
            XReg::X7,
        ][index]
    }

    fn new() -> Self {
        A64Emitter {
            buf: CodeBuffer::new(),
        }
    }

    fn buffer(&self) -> &CodeBuffer {
        &self.buf
    }

    fn buffer_mut(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    fn into_buffer(self) -> CodeBuffer {
        self.buf
    }

    fn mov_rr(&mut self, dst: XReg, src: XReg) {
        if dst == src {
            return;
        }
        // orr dst, xzr, src
        self.emit(0xAA00_03E0 | (src as u32) << 16 | dst as u32);
    }

    fn mov_imm(&mut self, dst: XReg, value: u64) {
        let halves: [u32; 4] = std::array::from_fn(|i| ((value >> (i * 16)) & 0xFFFF) as u32);
        let zeros = halves.iter().filter(|&&h| h == 0).count();
        let ones = halves.iter().filter(|&&h| h == 0xFFFF).count();
        let mut first = true;
        if ones > zeros {
            for (i, &half) in halves.iter().enumerate() {
                if half == 0xFFFF {
                    continue;
                }
                let hw = (i as u32) << 21;
                if first {
                    // movn dst, #!half, lsl #(16*i)
                    self.emit(0x9280_0000 | hw | (!half & 0xFFFF) << 5 | dst as u32);
                    first = false;
                } else {
                    self.emit(0xF280_0000 | hw | half << 5 | dst as u32); // movk
                }
            }
            if first {
                self.emit(0x9280_0000 | dst as u32); // movn dst, #0 (all ones)
            }
        } else {
            for (i, &half) in halves.iter().enumerate() {
                if half == 0 {
                    continue;
                }
                let hw = (i as u32) << 21;
                if first {
                    self.emit(0xD280_0000 | hw | half << 5 | dst as u32); // movz
                    first = false;
                } else {
                    self.emit(0xF280_0000 | hw | half << 5 | dst as u32); // movk
                }
            }
            if first {
                self.emit(0xD280_0000 | dst as u32); // movz dst, #0
            }
        }
    }

    fn mov_patchable_imm(&mut self, dst: XReg, value: u64, kind: RelocKind) {
        // ldr dst, =value  -- patchable through the pool slot
        let slot = self.buf.literal_slot(value, Some(kind));
        let at = self.buf.pos();
        self.emit(0x5800_0000 | dst as u32);
        self.buf.use_literal(at, slot);
    }

    fn load_sized_value(&mut self, dst: XReg, src: Mem<XReg>, size: usize, signed: bool) {
        let (scaled, unscaled) = match (size, signed) {
            (8, _) => (0xF940_0000, 0xF840_0000), // ldr / ldur
            (4, false) => (0xB940_0000, 0xB840_0000), // ldr w / ldur w
            (4, true) => (0xB980_0000, 0xB880_0000), // ldrsw / ldursw
            (2, false) => (0x7940_0000, 0x7840_0000), // ldrh / ldurh
            (2, true) => (0x7980_0000, 0x7880_0000), // ldrsh x / ldursh x
            (1, false) => (0x3940_0000, 0x3840_0000), // ldrb / ldurb
            (1, true) => (0x3980_0000, 0x3880_0000), // ldrsb x / ldursb x
            _ => unreachable!("unsupported load width {size}"),
        };
        self.emit_mem_access(scaled, unscaled, dst, src, size);
    }

    fn store_sized_value(&mut self, dst: Mem<XReg>, src: XReg, size: usize) {
        let (scaled, unscaled) = match size {
            8 => (0xF900_0000, 0xF800_0000), // str / stur
            4 => (0xB900_0000, 0xB800_0000), // str w / stur w
            2 => (0x7900_0000, 0x7800_0000), // strh / sturh
            1 => (0x3900_0000, 0x3800_0000), // strb / sturb
            _ => unreachable!("unsupported store width {size}"),
        };
        self.emit_mem_access(scaled, unscaled, src, dst, size);
    }

    fn lea(&mut self, dst: XReg, mem: Mem<XReg>) {
        match mem.index {
            Some(index) => {
                let shift = mem.scale.trailing_zeros();
                // add dst, base, index, lsl #shift
                self.emit(
                    0x8B00_0000
                        | (index as u32) << 16
                        | shift << 10
                        | (mem.base as u32) << 5
                        | dst as u32,
                );
            }
            None => self.mov_rr(dst, mem.base),
        }
        self.add_imm(dst, mem.disp);
    }

    fn adr_pc(&mut self, dst: XReg) {
        // adr dst, #4 -- address of the following instruction
        self.emit(0x1000_0000 | 1 << 5 | dst as u32);
    }

    fn add_rr(&mut self, dst: XReg, src: XReg) {
        self.emit(0x8B00_0000 | (src as u32) << 16 | (dst as u32) << 5 | dst as u32);
    }

    fn add_imm(&mut self, dst: XReg, imm: i32) {
        if imm == 0 {
            return;
        }
        let (op, op_lsl12, mag) = if imm > 0 {
            (0x9100_0000u32, 0x9140_0000u32, imm as u32)
        } else {
            (0xD100_0000, 0xD140_0000, imm.unsigned_abs())
        };
        let rd = (dst as u32) << 5 | dst as u32;
        if mag < 0x1000 {
            self.emit(op | mag << 10 | rd);
        } else if mag < 0x100_0000 {
            let high = mag >> 12;
            let low = mag & 0xFFF;
            self.emit(op_lsl12 | high << 10 | rd);
            if low != 0 {
                self.emit(op | low << 10 | rd);
            }
        } else {
            assert!(
                dst != Self::SCRATCH,
                "large add-immediate clobbers the scratch register"
            );
            self.mov_imm(Self::SCRATCH, imm as i64 as u64);
            self.add_rr(dst, Self::SCRATCH);
        }
    }

    fn sub_rr(&mut self, dst: XReg, src: XReg) {
        self.emit(0xCB00_0000 | (src as u32) << 16 | (dst as u32) << 5 | dst as u32);
    }

    fn and_imm(&mut self, dst: XReg, imm: u64) {
        assert!(
            dst != Self::SCRATCH,
            "and-immediate clobbers the scratch register"
        );
        self.mov_imm(Self::SCRATCH, imm);
        // and dst, dst, x16
        self.emit(0x8A00_0000 | (Self::SCRATCH as u32) << 16 | (dst as u32) << 5 | dst as u32);
    }

    fn shl_imm(&mut self, dst: XReg, shift: u8) {
        let s = (shift & 63) as u32;
        if s == 0 {
            return;
        }
        // lsl is ubfm dst, dst, #(64-s), #(63-s)
        self.emit(
            0xD340_0000
                | ((64 - s) & 63) << 16
                | (63 - s) << 10
                | (dst as u32) << 5
                | dst as u32,
        );
    }

    fn shr_imm(&mut self, dst: XReg, shift: u8) {
        let s = (shift & 63) as u32;
        self.emit(0xD340_FC00 | s << 16 | (dst as u32) << 5 | dst as u32); // lsr
    }

    fn sar_imm(&mut self, dst: XReg, shift: u8) {
        let s = (shift & 63) as u32;
        self.emit(0x9340_FC00 | s << 16 | (dst as u32) << 5 | dst as u32); // asr
    }

    fn shl_reg(&mut self, dst: XReg, count: XReg) {
        self.emit(0x9AC0_2000 | (count as u32) << 16 | (dst as u32) << 5 | dst as u32); // lslv
    }

    fn shr_reg(&mut self, dst: XReg, count: XReg) {
        self.emit(0x9AC0_2400 | (count as u32) << 16 | (dst as u32) << 5 | dst as u32); // lsrv
    }

    fn sar_reg(&mut self, dst: XReg, count: XReg) {
        self.emit(0x9AC0_2800 | (count as u32) << 16 | (dst as u32) << 5 | dst as u32); // asrv
    }

    fn cmp_rr(&mut self, lhs: XReg, rhs: XReg) {
        // subs xzr, lhs, rhs
        self.emit(0xEB00_001F | (rhs as u32) << 16 | (lhs as u32) << 5);
    }

    fn cmp_imm(&mut self, lhs: XReg, imm: i32) {
        if (0..0x1000).contains(&imm) {
            self.emit(0xF100_001F | (imm as u32) << 10 | (lhs as u32) << 5); // cmp
        } else if (-0xFFF..0).contains(&imm) {
            let mag = imm.unsigned_abs();
            self.emit(0xB100_001F | mag << 10 | (lhs as u32) << 5); // cmn
        } else {
            assert!(
                lhs != Self::SCRATCH,
                "wide compare clobbers the scratch register"
            );
            self.mov_imm(Self::SCRATCH, imm as i64 as u64);
            self.cmp_rr(lhs, Self::SCRATCH);
        }
    }

    fn cmp_mem_reg(&mut self, mem: Mem<XReg>, rhs: XReg) {
        assert!(
            rhs != Self::SCRATCH,
            "memory compare clobbers the scratch register"
        );
        self.load(Self::SCRATCH, mem);
        self.cmp_rr(Self::SCRATCH, rhs);
    }

    fn test_rr(&mut self, lhs: XReg, rhs: XReg) {
        // ands xzr, lhs, rhs
        self.emit(0xEA00_001F | (rhs as u32) << 16 | (lhs as u32) << 5);
    }

    fn test_imm(&mut self, reg: XReg, imm: u64) {
        assert!(
            reg != Self::SCRATCH,
            "test-immediate clobbers the scratch register"
        );
        self.mov_imm(Self::SCRATCH, imm);
        self.test_rr(reg, Self::SCRATCH);
    }

    fn jcc(&mut self, cond: Cond, label: Label) {
        self.cond_branch_to(0x5400_0000 | cond.a64_cc(), label);
    }

    fn jmp(&mut self, label: Label) {
        let at = self.buf.pos();
        self.emit(0x1400_0000); // b
        self.buf.use_label(label, at, FixupKind::A64Branch26);
    }

    fn jmp_reg(&mut self, reg: XReg) {
        self.emit(0xD61F_0000 | (reg as u32) << 5); // br
    }

    fn call_reg(&mut self, reg: XReg) {
        self.emit(0xD63F_0000 | (reg as u32) << 5); // blr
    }

    fn call_rel(&mut self, target: u64, kind: RelocKind) {
        let offset = self.buf.pos();
        self.emit(0x9400_0000); // bl
        self.buf.add_reloc(RelocEntry {
            offset,
            kind,
            target,
            format: RelocFormat::Rel26,
        });
    }

    fn jmp_rel(&mut self, target: u64, kind: RelocKind) {
        let offset = self.buf.pos();
        self.emit(0x1400_0000); // b
        self.buf.add_reloc(RelocEntry {
            offset,
            kind,
            target,
            format: RelocFormat::Rel26,
        });
    }

    fn patchable_far_call(&mut self, target: u64, kind: RelocKind) {
        let start = self.buf.pos();
        let rd = Self::SCRATCH as u32;
        let offset = self.buf.pos();
        for i in 0..4u32 {
            let half = ((target >> (i * 16)) & 0xFFFF) as u32;
            let op = if i == 0 { 0xD280_0000 } else { 0xF280_0000 }; // movz / movk
            self.emit(op | i << 21 | half << 5 | rd);
        }
        self.buf.add_reloc(RelocEntry {
            offset,
            kind,
            target,
            format: RelocFormat::A64Mov64,
        });
        self.call_reg(Self::SCRATCH);
        debug_assert_eq!(self.buf.pos() - start, Self::PATCHABLE_CALL_SIZE);
    }

    fn patchable_far_jump(&mut self, target: u64, kind: RelocKind) {
        let start = self.buf.pos();
        let rd = Self::SCRATCH as u32;
        let offset = self.buf.pos();
        for i in 0..4u32 {
            let half = ((target >> (i * 16)) & 0xFFFF) as u32;
            let op = if i == 0 { 0xD280_0000 } else { 0xF280_0000 };
            self.emit(op | i << 21 | half << 5 | rd);
        }
        self.buf.add_reloc(RelocEntry {
            offset,
            kind,
            target,
            format: RelocFormat::A64Mov64,
        });
        self.jmp_reg(Self::SCRATCH);
        debug_assert_eq!(self.buf.pos() - start, Self::PATCHABLE_CALL_SIZE);
    }

    fn cas_ptr(&mut self, addr: XReg, expected: XReg, new_val: XReg, acquire: bool, release: bool) {
        super::assert_different(&[addr, Self::SCRATCH]);
        super::assert_different(&[expected, Self::SCRATCH]);
        super::assert_different(&[new_val, Self::SCRATCH]);
        let retry = self.new_label();
        let done = self.new_label();
        let rn = (addr as u32) << 5;
        let rt = Self::SCRATCH as u32;
        self.bind(retry);
        if acquire {
            self.emit(0xC85F_FC00 | rn | rt); // ldaxr x16, [addr]
        } else {
            self.emit(0xC85F_7C00 | rn | rt); // ldxr x16, [addr]
        }
        self.cmp_rr(Self::SCRATCH, expected);
        self.jcc(Cond::Ne, done);
        // status reuses w16; the loaded value is dead after the compare
        let store = if release { 0xC800_FC00 } else { 0xC800_7C00 }; // stlxr / stxr
        self.emit(store | rt << 16 | rn | new_val as u32);
        self.cond_branch_to(0x3500_0000 | rt, retry); // cbnz w16, retry
        self.bind(done);
        // flags: Eq from the successful compare, Ne on mismatch
    }

    fn membar(&mut self, kind: MembarKind) {
        match kind {
            MembarKind::LoadLoad | MembarKind::LoadStore => self.emit(0xD503_39BF), // dmb ishld
            MembarKind::StoreStore => self.emit(0xD503_3ABF),                       // dmb ishst
            MembarKind::StoreLoad | MembarKind::Full => self.emit(0xD503_3BBF),     // dmb ish
        }
    }

    fn push(&mut self, reg: XReg) {
        // str reg, [sp, #-16]!  (keeps sp 16-byte aligned)
        self.emit(0xF81F_0FE0 | reg as u32);
    }

    fn pop(&mut self, reg: XReg) {
        // ldr reg, [sp], #16
        self.emit(0xF841_07E0 | reg as u32);
    }

    fn enter_frame(&mut self) {
        self.emit(0xA9BF_7BFD); // stp x29, x30, [sp, #-16]!
        self.emit(0x9100_03FD); // mov x29, sp
    }

    fn leave_frame(&mut self) {
        self.emit(0x9100_03BF); // mov sp, x29
        self.emit(0xA8C1_7BFD); // ldp x29, x30, [sp], #16
    }

    fn align_sp(&mut self) {
        // sp is architecturally 16-byte aligned already
    }

    fn store_sp(&mut self, dst: Mem<XReg>) {
        // sp is not a valid str source; stage it through the scratch register
        self.emit(0x9100_03E0 | Self::SCRATCH as u32); // mov x16, sp
        self.store(dst, Self::SCRATCH);
    }

    fn ret(&mut self) {
        self.emit(0xD65F_03C0); // ret
    }

    fn nop(&mut self) {
        self.emit(0xD503_201F); // nop
    }

    fn trap(&mut self) {
        self.emit(0xD420_0000); // brk #0
    }
}
