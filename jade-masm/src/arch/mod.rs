//! Architecture backends.
//!
//! Each backend is a pure encoder over a [`CodeBuffer`]; both compile on every
//! host so their byte streams can be checked cross-architecture. Only the
//! backend matching the build target is wired up as [`HostEmitter`].

use crate::buffer::{CodeBuffer, Label};
use crate::reloc::RelocKind;

pub mod aarch64;
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub type HostEmitter = x86_64::X64Emitter;
#[cfg(target_arch = "aarch64")]
pub type HostEmitter = aarch64::A64Emitter;

/// Branch condition, in the flag semantics shared by both backends: signed
/// variants for signed compares, Below/Above variants for unsigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Below,
    BelowEqual,
    Above,
    AboveEqual,
}

impl Cond {
    pub fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Ge => Cond::Lt,
            Cond::Below => Cond::AboveEqual,
            Cond::BelowEqual => Cond::Above,
            Cond::Above => Cond::BelowEqual,
            Cond::AboveEqual => Cond::Below,
        }
    }
}

/// Memory ordering barrier strength.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembarKind {
    LoadLoad,
    LoadStore,
    StoreStore,
    StoreLoad,
    Full,
}

/// `base + index * scale + disp` addressing. The base register is always
/// required; scale must be 1, 2, 4 or 8.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mem<R> {
    pub base: R,
    pub index: Option<R>,
    pub scale: u8,
    pub disp: i32,
}

impl<R: Copy> Mem<R> {
    pub fn base_disp(base: R, disp: i32) -> Self {
        Mem {
            base,
            index: None,
            scale: 1,
            disp,
        }
    }

    pub fn base_index_scale(base: R, index: R, scale: u8, disp: i32) -> Self {
        assert!(
            matches!(scale, 1 | 2 | 4 | 8),
            "unsupported address scale {scale}"
        );
        Mem {
            base,
            index: Some(index),
            scale,
            disp,
        }
    }
}

/// An operand known either at emission time or only at run time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegOrConst<R> {
    Reg(R),
    Const(i32),
}

/// Panics if any two of the named registers alias. Register aliasing in a
/// multi-step sequence silently corrupts the result, so it is a contract
/// violation, not a recoverable error.
#[track_caller]
pub fn assert_different<R: PartialEq + std::fmt::Debug>(regs: &[R]) {
    for (i, a) in regs.iter().enumerate() {
        for b in &regs[i + 1..] {
            assert!(a != b, "register {a:?} used twice in one sequence");
        }
    }
}

/// One architecture's instruction emitter.
///
/// Primitives only; composite sequences (type checks, dispatch, barriers) live
/// in [`MacroAssembler`](crate::masm::MacroAssembler) and are written once
/// against this trait.
pub trait Emitter: Sized {
    type Reg: Copy + Eq + std::fmt::Debug;

    /// First emitter-owned temporary. Some AArch64 primitives (`test_imm`,
    /// `and_imm`, `cmp_mem_reg`, `cas_ptr`) clobber it; never pass it as an
    /// operand to those.
    const SCRATCH: Self::Reg;
    /// Second emitter-owned temporary, clobbered by indexed addressing on
    /// AArch64.
    const SCRATCH2: Self::Reg;
    /// Pinned thread-state register.
    const THREAD: Self::Reg;
    /// Frame pointer.
    const FP: Self::Reg;
    /// Integer return register, also the result register of `cas_ptr` on
    /// x86-64 (RAX).
    const RETURN: Self::Reg;
    /// Byte length of `patchable_far_call`; the sequence is padded to exactly
    /// this so installed code can be repatched in place.
    const PATCHABLE_CALL_SIZE: usize;
    /// Maximum pc-relative displacement of the cheap direct call form.
    const MAX_BRANCH_DISP: i64;
    /// Register a variable shift count must live in, if the architecture
    /// constrains it (CL on x86-64).
    const SHIFT_COUNT: Option<Self::Reg>;

    /// Integer argument register `index` of the native C ABI.
    fn arg_reg(index: usize) -> Self::Reg;

    fn new() -> Self;
    fn buffer(&self) -> &CodeBuffer;
    fn buffer_mut(&mut self) -> &mut CodeBuffer;
    fn into_buffer(self) -> CodeBuffer;

    fn new_label(&mut self) -> Label {
        self.buffer_mut().new_label()
    }

    fn bind(&mut self, label: Label) {
        self.buffer_mut().bind(label);
    }

    fn pos(&self) -> usize {
        self.buffer().pos()
    }

    // Data movement.

    fn mov_rr(&mut self, dst: Self::Reg, src: Self::Reg);
    /// Materializes `value` with the cheapest encoding for its magnitude.
    fn mov_imm(&mut self, dst: Self::Reg, value: u64);
    /// Materializes `value` through a field that stays patchable after
    /// installation, recorded as a relocation of `kind`.
    fn mov_patchable_imm(&mut self, dst: Self::Reg, value: u64, kind: RelocKind);
    /// Loads `size` bytes (1, 2, 4 or 8) and zero- or sign-extends to 64 bits.
    fn load_sized_value(&mut self, dst: Self::Reg, src: Mem<Self::Reg>, size: usize, signed: bool);
    fn store_sized_value(&mut self, dst: Mem<Self::Reg>, src: Self::Reg, size: usize);
    fn lea(&mut self, dst: Self::Reg, mem: Mem<Self::Reg>);
    /// Loads the address of the *next* instruction into `dst`.
    fn adr_pc(&mut self, dst: Self::Reg);

    fn load(&mut self, dst: Self::Reg, src: Mem<Self::Reg>) {
        self.load_sized_value(dst, src, 8, false);
    }

    fn store(&mut self, dst: Mem<Self::Reg>, src: Self::Reg) {
        self.store_sized_value(dst, src, 8);
    }

    // Arithmetic and logic. All operate on full 64-bit registers.

    fn add_rr(&mut self, dst: Self::Reg, src: Self::Reg);
    fn add_imm(&mut self, dst: Self::Reg, imm: i32);
    fn sub_rr(&mut self, dst: Self::Reg, src: Self::Reg);
    fn and_imm(&mut self, dst: Self::Reg, imm: u64);
    fn shl_imm(&mut self, dst: Self::Reg, shift: u8);
    fn shr_imm(&mut self, dst: Self::Reg, shift: u8);
    fn sar_imm(&mut self, dst: Self::Reg, shift: u8);
    fn shl_reg(&mut self, dst: Self::Reg, count: Self::Reg);
    fn shr_reg(&mut self, dst: Self::Reg, count: Self::Reg);
    fn sar_reg(&mut self, dst: Self::Reg, count: Self::Reg);

    // Flag-setting compares.

    fn cmp_rr(&mut self, lhs: Self::Reg, rhs: Self::Reg);
    fn cmp_imm(&mut self, lhs: Self::Reg, imm: i32);
    /// `[mem] cmp reg` — memory operand on the left.
    fn cmp_mem_reg(&mut self, mem: Mem<Self::Reg>, rhs: Self::Reg);
    fn test_rr(&mut self, lhs: Self::Reg, rhs: Self::Reg);
    fn test_imm(&mut self, reg: Self::Reg, imm: u64);

    // Control flow.

    fn jcc(&mut self, cond: Cond, label: Label);
    fn jmp(&mut self, label: Label);
    fn jmp_reg(&mut self, reg: Self::Reg);
    fn call_reg(&mut self, reg: Self::Reg);
    /// Direct pc-relative call; only valid when the install site can reach
    /// `target` (see [`CodeCacheBounds`](crate::cache::CodeCacheBounds)).
    fn call_rel(&mut self, target: u64, kind: RelocKind);
    fn jmp_rel(&mut self, target: u64, kind: RelocKind);
    /// Fixed-length call through a patchable absolute-address field; exactly
    /// `PATCHABLE_CALL_SIZE` bytes. Clobbers `SCRATCH`.
    fn patchable_far_call(&mut self, target: u64, kind: RelocKind);
    /// Fixed-length jump counterpart of `patchable_far_call`.
    fn patchable_far_jump(&mut self, target: u64, kind: RelocKind);

    // Atomics and ordering.

    /// Compare-and-swap of the 64-bit word at `[addr]`: if it equals
    /// `expected` it is replaced by `new_val`. Leaves the flags Eq on success,
    /// Ne on failure. On x86-64 this clobbers `RETURN` (RAX carries the
    /// expected value); on AArch64 it clobbers `SCRATCH`. None of the operand
    /// registers may alias those.
    fn cas_ptr(
        &mut self,
        addr: Self::Reg,
        expected: Self::Reg,
        new_val: Self::Reg,
        acquire: bool,
        release: bool,
    );
    fn membar(&mut self, kind: MembarKind);

    // Stack and frame.

    fn push(&mut self, reg: Self::Reg);
    fn pop(&mut self, reg: Self::Reg);
    /// Standard prologue: saves the caller frame pointer (and link register on
    /// AArch64) and establishes `FP`.
    fn enter_frame(&mut self);
    fn leave_frame(&mut self);
    /// Rounds the stack pointer down to the 16-byte ABI boundary. No-op on
    /// AArch64, where `enter_frame` keeps SP aligned.
    fn align_sp(&mut self);
    /// Reserves the 32-byte callee home area the Windows x64 ABI requires
    /// below the return address of an outgoing C call. No-op under every other
    /// calling convention; a subsequent `leave_frame` releases it.
    fn reserve_shadow_space(&mut self) {}
    /// Stores the stack pointer to memory.
    fn store_sp(&mut self, dst: Mem<Self::Reg>);

    fn ret(&mut self);
    fn nop(&mut self);
    /// Undefined-instruction trap; execution must never fall through this.
    fn trap(&mut self);
}
