//! The macro assembler: VM-level composite sequences over an [`Emitter`].
//!
//! One `MacroAssembler` owns one emitter (and through it one code buffer) and
//! borrows the process-wide [`VmConfig`]. The composite operations are split
//! across sibling modules by concern: subtype checks, dispatch lookup, GC
//! barriers, VM-call trampolines and monitor fast paths. Everything is written
//! once against the `Emitter` trait and works on both backends.

use std::ops::{Deref, DerefMut};

use vm_abi::VmConfig;

use crate::arch::{Emitter, Mem};
use crate::buffer::{MasmError, SealedCode};
use crate::cache::CodeCacheBounds;
use crate::reloc::{AddressLiteral, RelocKind};

pub struct MacroAssembler<'a, A: Emitter> {
    pub(crate) asm: A,
    pub(crate) cfg: &'a VmConfig,
}

impl<'a, A: Emitter> MacroAssembler<'a, A> {
    pub fn new(cfg: &'a VmConfig) -> Self {
        MacroAssembler { asm: A::new(), cfg }
    }

    pub fn config(&self) -> &VmConfig {
        self.cfg
    }

    /// Finalizes the stream; see [`CodeBuffer::seal`](crate::buffer::CodeBuffer::seal).
    pub fn seal(self) -> Result<SealedCode, MasmError> {
        self.asm.into_buffer().seal()
    }

    pub(crate) fn thread_field(&self, offset: i32) -> Mem<A::Reg> {
        Mem::base_disp(A::THREAD, offset)
    }

    /// Materializes an object reference through a patchable field, so the GC
    /// can update it if the object moves.
    pub fn mov_oop(&mut self, dst: A::Reg, oop: u64) {
        self.asm.mov_patchable_imm(dst, oop, RelocKind::Oop);
    }

    /// Materializes a metadata (klass/method) pointer through a patchable
    /// field, tracked for class unloading.
    pub fn mov_metadata(&mut self, dst: A::Reg, metadata: u64) {
        self.asm.mov_patchable_imm(dst, metadata, RelocKind::Metadata);
    }

    /// Calls `dest` with the cheap pc-relative form when it is reachable from
    /// everywhere in the code cache, the fixed-length patchable form
    /// otherwise.
    pub fn runtime_call(&mut self, dest: AddressLiteral, bounds: &CodeCacheBounds) {
        if bounds.reachable_from_cache(dest.target, A::MAX_BRANCH_DISP) {
            tracing::trace!(dest = dest.target, "runtime call, direct");
            self.asm.call_rel(dest.target, dest.kind);
        } else {
            tracing::trace!(dest = dest.target, "runtime call, far");
            self.asm.patchable_far_call(dest.target, dest.kind);
        }
    }

    /// Tail-jump counterpart of [`runtime_call`](Self::runtime_call).
    pub fn jump_to(&mut self, dest: AddressLiteral, bounds: &CodeCacheBounds) {
        if bounds.reachable_from_cache(dest.target, A::MAX_BRANCH_DISP) {
            self.asm.jmp_rel(dest.target, dest.kind);
        } else {
            self.asm.patchable_far_jump(dest.target, dest.kind);
        }
    }

    /// Fatal diagnostic: hands `msg` to the runtime's stop entry and traps.
    /// The entry must not return; the trap catches it if it does.
    pub fn stop(&mut self, msg: &'static str) {
        let stop_entry = self.cfg.entry.stop;
        self.asm.mov_imm(A::arg_reg(0), msg.as_ptr() as u64);
        self.asm.mov_imm(A::arg_reg(1), msg.len() as u64);
        self.asm.patchable_far_call(stop_entry, RelocKind::RuntimeCall);
        self.asm.trap();
    }
}

impl<A: Emitter> Deref for MacroAssembler<'_, A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.asm
    }
}

impl<A: Emitter> DerefMut for MacroAssembler<'_, A> {
    fn deref_mut(&mut self) -> &mut A {
        &mut self.asm
    }
}
