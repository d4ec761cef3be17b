//! Transitions from emitted code into the VM runtime.
//!
//! A VM call publishes a walkable last-Java-frame anchor in the thread
//! structure, calls out through the C ABI with the thread as the leading
//! argument, then tears the anchor down and surfaces any pending exception.
//! The anchor stores are ordered so a profiler or stack walker that observes
//! the stack-pointer slot non-null can rely on the fp and pc slots already
//! being valid.

use crate::arch::{Cond, Emitter, assert_different};
use crate::buffer::Label;
use crate::cache::CodeCacheBounds;
use crate::masm::MacroAssembler;
use crate::reloc::{AddressLiteral, RelocEntry, RelocFormat, RelocKind};

impl<A: Emitter> MacroAssembler<'_, A> {
    /// Publishes the last-Java-frame anchor: fp, then pc, then sp last.
    /// Clobbers the emitter scratch register.
    pub fn set_last_java_frame(&mut self) {
        let thread = self.cfg.thread;
        let fp_slot = self.thread_field(thread.last_java_fp_offset);
        let pc_slot = self.thread_field(thread.last_java_pc_offset);
        let sp_slot = self.thread_field(thread.last_java_sp_offset);
        self.asm.store(fp_slot, A::FP);
        self.asm.adr_pc(A::SCRATCH);
        self.asm.store(pc_slot, A::SCRATCH);
        self.asm.store_sp(sp_slot);
    }

    /// Clears the anchor, sp slot first so walkers never see a half-torn-down
    /// frame. The fp slot is left in place unless `clear_fp`; the pc slot is
    /// always cleared.
    pub fn reset_last_java_frame(&mut self, clear_fp: bool) {
        let thread = self.cfg.thread;
        let sp_slot = self.thread_field(thread.last_java_sp_offset);
        let fp_slot = self.thread_field(thread.last_java_fp_offset);
        let pc_slot = self.thread_field(thread.last_java_pc_offset);
        self.asm.mov_imm(A::SCRATCH, 0);
        self.asm.store(sp_slot, A::SCRATCH);
        if clear_fp {
            self.asm.store(fp_slot, A::SCRATCH);
        }
        self.asm.store(pc_slot, A::SCRATCH);
    }

    /// Full VM call: anchor publication, aligned C call with the thread as
    /// argument zero, anchor teardown, pending-exception check and optional
    /// vm-result extraction.
    ///
    /// `args` (at most three) land in C argument registers one through three;
    /// each must not alias an argument register already written before it.
    pub fn call_vm(
        &mut self,
        entry: AddressLiteral,
        bounds: &CodeCacheBounds,
        args: &[A::Reg],
        vm_result: Option<A::Reg>,
        check_exceptions: bool,
    ) {
        assert!(args.len() <= 3, "at most three VM-call arguments");
        for (i, &arg) in args.iter().enumerate().rev() {
            for j in (i + 1)..args.len() {
                assert_different(&[arg, A::arg_reg(j + 1)]);
            }
            self.asm.mov_rr(A::arg_reg(i + 1), arg);
        }
        self.asm.mov_rr(A::arg_reg(0), A::THREAD);

        self.asm.enter_frame();
        self.asm.align_sp();
        self.asm.reserve_shadow_space();
        self.set_last_java_frame();
        self.runtime_call(entry, bounds);
        self.reset_last_java_frame(true);
        self.asm.leave_frame();

        if check_exceptions {
            self.check_and_forward_exception(bounds);
        }

        if let Some(dst) = vm_result {
            self.get_vm_result(dst);
        }
    }

    /// C call with no Java-frame anchor, for runtime leaf functions that
    /// never walk the stack, block or throw.
    pub fn call_vm_leaf(
        &mut self,
        entry: AddressLiteral,
        bounds: &CodeCacheBounds,
        args: &[A::Reg],
    ) {
        assert!(args.len() <= 4, "at most four leaf-call arguments");
        for (i, &arg) in args.iter().enumerate().rev() {
            for j in (i + 1)..args.len() {
                assert_different(&[arg, A::arg_reg(j)]);
            }
            self.asm.mov_rr(A::arg_reg(i), arg);
        }
        self.asm.enter_frame();
        self.asm.align_sp();
        self.asm.reserve_shadow_space();
        self.runtime_call(entry, bounds);
        self.asm.leave_frame();
    }

    /// Branches to the shared exception forwarder if the thread has a pending
    /// exception. Clobbers both emitter scratch registers.
    pub fn check_and_forward_exception(&mut self, bounds: &CodeCacheBounds) {
        let pending = self.thread_field(self.cfg.thread.pending_exception_offset);
        let forward = self.cfg.entry.forward_exception;
        let ok = self.asm.new_label();
        self.asm.load(A::SCRATCH2, pending);
        self.asm.cmp_imm(A::SCRATCH2, 0);
        self.asm.jcc(Cond::Eq, ok);
        self.jump_to(AddressLiteral::runtime_call(forward), bounds);
        self.asm.bind(ok);
    }

    /// Moves the thread's vm-result slot into `dst` and clears the slot, so a
    /// stale oop never survives into the next VM call.
    pub fn get_vm_result(&mut self, dst: A::Reg) {
        assert_different(&[dst, A::SCRATCH]);
        let slot = self.thread_field(self.cfg.thread.vm_result_offset);
        self.asm.load(dst, slot);
        self.asm.mov_imm(A::SCRATCH, 0);
        self.asm.store(slot, A::SCRATCH);
    }

    /// Safepoint poll: tests the thread-local polling word and branches to
    /// `slow` when a safepoint or handshake is pending. The test site carries
    /// an informational poll relocation for the runtime's pc-to-poll lookup.
    pub fn safepoint_poll(&mut self, slow: Label) {
        let word = self.thread_field(self.cfg.thread.polling_word_offset);
        let poll_bit = self.cfg.poll_bit;
        self.asm.load(A::SCRATCH2, word);
        let offset = self.asm.pos();
        self.asm.buffer_mut().add_reloc(RelocEntry {
            offset,
            kind: RelocKind::Poll,
            target: 0,
            format: RelocFormat::Info,
        });
        self.asm.test_imm(A::SCRATCH2, poll_bit);
        self.asm.jcc(Cond::Ne, slow);
    }
}
