//! x86-64 instruction emitter.

use crate::buffer::{CodeBuffer, FixupKind, Label};
use crate::reloc::{RelocEntry, RelocFormat, RelocKind};

use super::{Cond, Emitter, Mem, MembarKind};

/// General-purpose registers, numbered as the hardware encodes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Cond {
    /// Low nibble of the `0F 8x` conditional-jump opcode.
    fn x86_cc(self) -> u8 {
        match self {
            Cond::Eq => 0x4,
            Cond::Ne => 0x5,
            Cond::Lt => 0xC,
            Cond::Ge => 0xD,
            Cond::Le => 0xE,
            Cond::Gt => 0xF,
            Cond::Below => 0x2,
            Cond::AboveEqual => 0x3,
            Cond::BelowEqual => 0x6,
            Cond::Above => 0x7,
        }
    }
}

fn rex(w: bool, reg: u8, x: u8, b: u8) -> u8 {
    0x40 | ((w as u8) << 3) | ((reg >> 3) << 2) | ((x >> 3) << 1) | (b >> 3)
}

fn modrm(mod_bits: u8, reg: u8, rm: u8) -> u8 {
    (mod_bits << 6) | ((reg & 7) << 3) | (rm & 7)
}

pub struct X64Emitter {
    buf: CodeBuffer,
}

impl X64Emitter {
    fn rex_rr(&mut self, w: bool, reg: Gpr, rm: Gpr) {
        let byte = rex(w, reg as u8, 0, rm as u8);
        if byte != 0x40 || w {
            self.buf.emit_u8(byte);
        }
    }

    fn rex_rr_forced(&mut self, w: bool, reg: Gpr, rm: Gpr) {
        self.buf.emit_u8(rex(w, reg as u8, 0, rm as u8));
    }

    fn rex_mem(&mut self, w: bool, reg: u8, mem: &Mem<Gpr>, forced: bool) {
        let x = mem.index.map_or(0, |i| i as u8);
        let byte = rex(w, reg, x, mem.base as u8);
        if byte != 0x40 || forced {
            self.buf.emit_u8(byte);
        }
    }

    /// ModRM (+ SIB + displacement) for a `base + index*scale + disp` operand.
    fn mem_operand(&mut self, reg: u8, mem: Mem<Gpr>) {
        let base = mem.base as u8;
        let base_low = base & 7;
        // mod=00 with base rbp/r13 means rip-relative, so those always carry
        // a displacement byte.
        let (mod_bits, disp_bytes) = if mem.disp == 0 && base_low != 5 {
            (0b00u8, 0usize)
        } else if i8::try_from(mem.disp).is_ok() {
            (0b01, 1)
        } else {
            (0b10, 4)
        };
        match mem.index {
            Some(index) => {
                assert!(index != Gpr::Rsp, "rsp cannot be an index register");
                let ss = match mem.scale {
                    1 => 0u8,
                    2 => 1,
                    4 => 2,
                    8 => 3,
                    _ => unreachable!("scale validated at construction"),
                };
                self.buf.emit_u8(modrm(mod_bits, reg, 0b100));
                self.buf
                    .emit_u8((ss << 6) | ((index as u8 & 7) << 3) | base_low);
            }
            None if base_low == 4 => {
                // rsp/r12 base needs a SIB byte with the no-index marker.
                self.buf.emit_u8(modrm(mod_bits, reg, 0b100));
                self.buf.emit_u8((0b100 << 3) | base_low);
            }
            None => {
                self.buf.emit_u8(modrm(mod_bits, reg, base_low));
            }
        }
        match disp_bytes {
            0 => {}
            1 => self.buf.emit_u8(mem.disp as i8 as u8),
            _ => self.buf.emit_u32(mem.disp as u32),
        }
    }

    fn branch_to(&mut self, label: Label) {
        let at = self.buf.pos();
        self.buf.emit_u32(0);
        self.buf.use_label(label, at, FixupKind::X86Rel32);
    }
}

impl Emitter for X64Emitter {
    type Reg = Gpr;

    const SCRATCH: Gpr = Gpr::R11;
    const SCRATCH2: Gpr = Gpr::R10;
    const THREAD: Gpr = Gpr::R15;
    const FP: Gpr = Gpr::Rbp;
    const RETURN: Gpr = Gpr::Rax;
    // movabs r11, imm64 (10 bytes) + call r11 (3 bytes)
    const PATCHABLE_CALL_SIZE: usize = 13;
    const MAX_BRANCH_DISP: i64 = i32::MAX as i64;
    const SHIFT_COUNT: Option<Gpr> = Some(Gpr::Rcx);

    #[cfg(not(windows))]
    fn arg_reg(index: usize) -> Gpr {
        // System V integer argument order.
        [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9][index]
    }

    #[cfg(windows)]
    fn arg_reg(index: usize) -> Gpr {
        [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9][index]
    }

    fn new() -> Self {
        X64Emitter {
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

    fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        if dst == src {
            return;
        }
        self.rex_rr(true, src, dst);
        self.buf.emit_u8(0x89); // mov r/m64, r64
        self.buf.emit_u8(modrm(0b11, src as u8, dst as u8));
    }

    fn mov_imm(&mut self, dst: Gpr, value: u64) {
        if let Ok(imm) = i32::try_from(value as i64) {
            self.rex_rr(true, Gpr::Rax, dst);
            self.buf.emit_u8(0xC7); // mov r/m64, imm32 (sign-extended)
            self.buf.emit_u8(modrm(0b11, 0, dst as u8));
            self.buf.emit_u32(imm as u32);
        } else if let Ok(imm) = u32::try_from(value) {
            if (dst as u8) >= 8 {
                self.buf.emit_u8(0x41);
            }
            self.buf.emit_u8(0xB8 + (dst as u8 & 7)); // mov r32, imm32 (zero-extends)
            self.buf.emit_u32(imm);
        } else {
            self.rex_rr_forced(true, Gpr::Rax, dst);
            self.buf.emit_u8(0xB8 + (dst as u8 & 7)); // movabs r64, imm64
            self.buf.emit_u64(value);
        }
    }

    fn mov_patchable_imm(&mut self, dst: Gpr, value: u64, kind: RelocKind) {
        self.rex_rr_forced(true, Gpr::Rax, dst);
        self.buf.emit_u8(0xB8 + (dst as u8 & 7)); // movabs r64, imm64
        let offset = self.buf.pos();
        self.buf.emit_u64(value);
        self.buf.add_reloc(RelocEntry {
            offset,
            kind,
            target: value,
            format: RelocFormat::AbsImm64,
        });
    }

    fn load_sized_value(&mut self, dst: Gpr, src: Mem<Gpr>, size: usize, signed: bool) {
        match (size, signed) {
            (8, _) => {
                self.rex_mem(true, dst as u8, &src, true);
                self.buf.emit_u8(0x8B); // mov r64, r/m64
            }
            (4, false) => {
                self.rex_mem(false, dst as u8, &src, false);
                self.buf.emit_u8(0x8B); // mov r32, r/m32
            }
            (4, true) => {
                self.rex_mem(true, dst as u8, &src, true);
                self.buf.emit_u8(0x63); // movsxd r64, r/m32
            }
            (2, false) => {
                self.rex_mem(true, dst as u8, &src, true);
                self.buf.emit_slice(&[0x0F, 0xB7]); // movzx r64, r/m16
            }
            (2, true) => {
                self.rex_mem(true, dst as u8, &src, true);
                self.buf.emit_slice(&[0x0F, 0xBF]); // movsx r64, r/m16
            }
            (1, false) => {
                self.rex_mem(true, dst as u8, &src, true);
                self.buf.emit_slice(&[0x0F, 0xB6]); // movzx r64, r/m8
            }
            (1, true) => {
                self.rex_mem(true, dst as u8, &src, true);
                self.buf.emit_slice(&[0x0F, 0xBE]); // movsx r64, r/m8
            }
            _ => unreachable!("unsupported load width {size}"),
        }
        self.mem_operand(dst as u8, src);
    }

    fn store_sized_value(&mut self, dst: Mem<Gpr>, src: Gpr, size: usize) {
        match size {
            1 => {
                // REX always present so sil/dil encode as byte registers.
                self.rex_mem(false, src as u8, &dst, true);
                self.buf.emit_u8(0x88); // mov r/m8, r8
            }
            2 => {
                self.buf.emit_u8(0x66);
                self.rex_mem(false, src as u8, &dst, false);
                self.buf.emit_u8(0x89); // mov r/m16, r16
            }
            4 => {
                self.rex_mem(false, src as u8, &dst, false);
                self.buf.emit_u8(0x89); // mov r/m32, r32
            }
            8 => {
                self.rex_mem(true, src as u8, &dst, true);
                self.buf.emit_u8(0x89); // mov r/m64, r64
            }
            _ => unreachable!("unsupported store width {size}"),
        }
        self.mem_operand(src as u8, dst);
    }

    fn lea(&mut self, dst: Gpr, mem: Mem<Gpr>) {
        self.rex_mem(true, dst as u8, &mem, true);
        self.buf.emit_u8(0x8D); // lea r64, m
        self.mem_operand(dst as u8, mem);
    }

    fn adr_pc(&mut self, dst: Gpr) {
        self.rex_rr_forced(true, dst, Gpr::Rax);
        self.buf.emit_u8(0x8D); // lea r64, [rip + 0]
        self.buf.emit_u8(modrm(0b00, dst as u8, 0b101));
        self.buf.emit_u32(0);
    }

    fn add_rr(&mut self, dst: Gpr, src: Gpr) {
        self.rex_rr(true, src, dst);
        self.buf.emit_u8(0x01); // add r/m64, r64
        self.buf.emit_u8(modrm(0b11, src as u8, dst as u8));
    }

    fn add_imm(&mut self, dst: Gpr, imm: i32) {
        self.rex_rr(true, Gpr::Rax, dst);
        if let Ok(small) = i8::try_from(imm) {
            self.buf.emit_u8(0x83); // add r/m64, imm8
            self.buf.emit_u8(modrm(0b11, 0, dst as u8));
            self.buf.emit_u8(small as u8);
        } else {
            self.buf.emit_u8(0x81); // add r/m64, imm32
            self.buf.emit_u8(modrm(0b11, 0, dst as u8));
            self.buf.emit_u32(imm as u32);
        }
    }

    fn sub_rr(&mut self, dst: Gpr, src: Gpr) {
        self.rex_rr(true, src, dst);
        self.buf.emit_u8(0x29); // sub r/m64, r64
        self.buf.emit_u8(modrm(0b11, src as u8, dst as u8));
    }

    fn and_imm(&mut self, dst: Gpr, imm: u64) {
        if let Ok(imm) = i32::try_from(imm as i64) {
            self.rex_rr(true, Gpr::Rax, dst);
            if let Ok(small) = i8::try_from(imm) {
                self.buf.emit_u8(0x83); // and r/m64, imm8
                self.buf.emit_u8(modrm(0b11, 4, dst as u8));
                self.buf.emit_u8(small as u8);
            } else {
                self.buf.emit_u8(0x81); // and r/m64, imm32
                self.buf.emit_u8(modrm(0b11, 4, dst as u8));
                self.buf.emit_u32(imm as u32);
            }
        } else {
            assert!(dst != Self::SCRATCH, "wide and clobbers the scratch register");
            self.mov_imm(Self::SCRATCH, imm);
            self.rex_rr(true, Self::SCRATCH, dst);
            self.buf.emit_u8(0x21); // and r/m64, r64
            self.buf.emit_u8(modrm(0b11, Self::SCRATCH as u8, dst as u8));
        }
    }

    fn shl_imm(&mut self, dst: Gpr, shift: u8) {
        self.rex_rr(true, Gpr::Rax, dst);
        self.buf.emit_u8(0xC1); // shl r/m64, imm8
        self.buf.emit_u8(modrm(0b11, 4, dst as u8));
        self.buf.emit_u8(shift & 63);
    }

    fn shr_imm(&mut self, dst: Gpr, shift: u8) {
        self.rex_rr(true, Gpr::Rax, dst);
        self.buf.emit_u8(0xC1); // shr r/m64, imm8
        self.buf.emit_u8(modrm(0b11, 5, dst as u8));
        self.buf.emit_u8(shift & 63);
    }

    fn sar_imm(&mut self, dst: Gpr, shift: u8) {
        self.rex_rr(true, Gpr::Rax, dst);
        self.buf.emit_u8(0xC1); // sar r/m64, imm8
        self.buf.emit_u8(modrm(0b11, 7, dst as u8));
        self.buf.emit_u8(shift & 63);
    }

    fn shl_reg(&mut self, dst: Gpr, count: Gpr) {
        assert!(count == Gpr::Rcx, "variable shift count must be in rcx");
        assert!(dst != Gpr::Rcx, "shift destination aliases the count");
        self.rex_rr(true, Gpr::Rax, dst);
        self.buf.emit_u8(0xD3); // shl r/m64, cl
        self.buf.emit_u8(modrm(0b11, 4, dst as u8));
    }

    fn shr_reg(&mut self, dst: Gpr, count: Gpr) {
        assert!(count == Gpr::Rcx, "variable shift count must be in rcx");
        assert!(dst != Gpr::Rcx, "shift destination aliases the count");
        self.rex_rr(true, Gpr::Rax, dst);
        self.buf.emit_u8(0xD3); // shr r/m64, cl
        self.buf.emit_u8(modrm(0b11, 5, dst as u8));
    }

    fn sar_reg(&mut self, dst: Gpr, count: Gpr) {
        assert!(count == Gpr::Rcx, "variable shift count must be in rcx");
        assert!(dst != Gpr::Rcx, "shift destination aliases the count");
        self.rex_rr(true, Gpr::Rax, dst);
        self.buf.emit_u8(0xD3); // sar r/m64, cl
        self.buf.emit_u8(modrm(0b11, 7, dst as u8));
    }

    fn cmp_rr(&mut self, lhs: Gpr, rhs: Gpr) {
        self.rex_rr(true, rhs, lhs);
        self.buf.emit_u8(0x39); // cmp r/m64, r64
        self.buf.emit_u8(modrm(0b11, rhs as u8, lhs as u8));
    }

    fn cmp_imm(&mut self, lhs: Gpr, imm: i32) {
        self.rex_rr(true, Gpr::Rax, lhs);
        if let Ok(small) = i8::try_from(imm) {
            self.buf.emit_u8(0x83); // cmp r/m64, imm8
            self.buf.emit_u8(modrm(0b11, 7, lhs as u8));
            self.buf.emit_u8(small as u8);
        } else {
            self.buf.emit_u8(0x81); // cmp r/m64, imm32
            self.buf.emit_u8(modrm(0b11, 7, lhs as u8));
            self.buf.emit_u32(imm as u32);
        }
    }

    fn cmp_mem_reg(&mut self, mem: Mem<Gpr>, rhs: Gpr) {
        self.rex_mem(true, rhs as u8, &mem, true);
        self.buf.emit_u8(0x39); // cmp r/m64, r64
        self.mem_operand(rhs as u8, mem);
    }

    fn test_rr(&mut self, lhs: Gpr, rhs: Gpr) {
        self.rex_rr(true, rhs, lhs);
        self.buf.emit_u8(0x85); // test r/m64, r64
        self.buf.emit_u8(modrm(0b11, rhs as u8, lhs as u8));
    }

    fn test_imm(&mut self, reg: Gpr, imm: u64) {
        if let Ok(imm) = i32::try_from(imm as i64) {
            self.rex_rr(true, Gpr::Rax, reg);
            self.buf.emit_u8(0xF7); // test r/m64, imm32
            self.buf.emit_u8(modrm(0b11, 0, reg as u8));
            self.buf.emit_u32(imm as u32);
        } else {
            assert!(reg != Self::SCRATCH, "wide test clobbers the scratch register");
            self.mov_imm(Self::SCRATCH, imm);
            self.test_rr(reg, Self::SCRATCH);
        }
    }

    fn jcc(&mut self, cond: Cond, label: Label) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 | cond.x86_cc()); // jcc rel32
        self.branch_to(label);
    }

    fn jmp(&mut self, label: Label) {
        self.buf.emit_u8(0xE9); // jmp rel32
        self.branch_to(label);
    }

    fn jmp_reg(&mut self, reg: Gpr) {
        if (reg as u8) >= 8 {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF); // jmp r64
        self.buf.emit_u8(modrm(0b11, 4, reg as u8));
    }

    fn call_reg(&mut self, reg: Gpr) {
        if (reg as u8) >= 8 {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF); // call r64
        self.buf.emit_u8(modrm(0b11, 2, reg as u8));
    }

    fn call_rel(&mut self, target: u64, kind: RelocKind) {
        self.buf.emit_u8(0xE8); // call rel32
        let offset = self.buf.pos();
        self.buf.emit_u32(0);
        self.buf.add_reloc(RelocEntry {
            offset,
            kind,
            target,
            format: RelocFormat::Rel32,
        });
    }

    fn jmp_rel(&mut self, target: u64, kind: RelocKind) {
        self.buf.emit_u8(0xE9); // jmp rel32
        let offset = self.buf.pos();
        self.buf.emit_u32(0);
        self.buf.add_reloc(RelocEntry {
            offset,
            kind,
            target,
            format: RelocFormat::Rel32,
        });
    }

    fn patchable_far_call(&mut self, target: u64, kind: RelocKind) {
        let start = self.buf.pos();
        self.buf.emit_slice(&[0x49, 0xBB]); // movabs r11, imm64
        let offset = self.buf.pos();
        self.buf.emit_u64(target);
        self.buf.add_reloc(RelocEntry {
            offset,
            kind,
            target,
            format: RelocFormat::AbsImm64,
        });
        self.buf.emit_slice(&[0x41, 0xFF, 0xD3]); // call r11
        debug_assert_eq!(self.buf.pos() - start, Self::PATCHABLE_CALL_SIZE);
    }

    fn patchable_far_jump(&mut self, target: u64, kind: RelocKind) {
        let start = self.buf.pos();
        self.buf.emit_slice(&[0x49, 0xBB]); // movabs r11, imm64
        let offset = self.buf.pos();
        self.buf.emit_u64(target);
        self.buf.add_reloc(RelocEntry {
            offset,
            kind,
            target,
            format: RelocFormat::AbsImm64,
        });
        self.buf.emit_slice(&[0x41, 0xFF, 0xE3]); // jmp r11
        debug_assert_eq!(self.buf.pos() - start, Self::PATCHABLE_CALL_SIZE);
    }

    fn cas_ptr(&mut self, addr: Gpr, expected: Gpr, new_val: Gpr, _acquire: bool, _release: bool) {
        assert!(addr != Gpr::Rax, "cas address register aliases rax");
        assert!(new_val != Gpr::Rax, "cas replacement register aliases rax");
        self.mov_rr(Gpr::Rax, expected);
        self.buf.emit_u8(0xF0); // lock
        self.rex_mem(true, new_val as u8, &Mem::base_disp(addr, 0), true);
        self.buf.emit_slice(&[0x0F, 0xB1]); // cmpxchg [addr], new
        self.mem_operand(new_val as u8, Mem::base_disp(addr, 0));
        // The lock prefix already gives full ordering on x86.
    }

    fn membar(&mut self, kind: MembarKind) {
        match kind {
            // Loads are not reordered with loads, stores not with stores, and
            // loads not with older stores under TSO.
            MembarKind::LoadLoad | MembarKind::LoadStore | MembarKind::StoreStore => {}
            MembarKind::StoreLoad | MembarKind::Full => {
                self.buf.emit_slice(&[0x0F, 0xAE, 0xF0]); // mfence
            }
        }
    }

    fn push(&mut self, reg: Gpr) {
        if (reg as u8) >= 8 {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + (reg as u8 & 7)); // push r64
    }

    fn pop(&mut self, reg: Gpr) {
        if (reg as u8) >= 8 {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + (reg as u8 & 7)); // pop r64
    }

    fn enter_frame(&mut self) {
        self.buf.emit_u8(0x55); // push rbp
        self.buf.emit_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
    }

    fn leave_frame(&mut self) {
        self.buf.emit_slice(&[0x48, 0x89, 0xEC]); // mov rsp, rbp
        self.buf.emit_u8(0x5D); // pop rbp
    }

    fn align_sp(&mut self) {
        self.buf.emit_slice(&[0x48, 0x83, 0xE4, 0xF0]); // and rsp, -16
    }

    #[cfg(target_os = "windows")]
    fn reserve_shadow_space(&mut self) {
        self.buf.emit_slice(&[0x48, 0x83, 0xEC, 0x20]); // sub rsp, 32
    }

    fn store_sp(&mut self, dst: Mem<Gpr>) {
        self.rex_mem(true, Gpr::Rsp as u8, &dst, true);
        self.buf.emit_u8(0x89); // mov [dst], rsp
        self.mem_operand(Gpr::Rsp as u8, dst);
    }

    fn ret(&mut self) {
        self.buf.emit_u8(0xC3); // ret
    }

    fn nop(&mut self) {
        self.buf.emit_u8(0x90); // nop
    }

    fn trap(&mut self) {
        self.buf.emit_slice(&[0x0F, 0x0B]); // ud2
    }
}
