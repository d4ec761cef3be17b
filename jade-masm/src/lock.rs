//! Monitor fast paths.
//!
//! Locking CASes the object's mark word from the unlocked pattern to the
//! owning thread pointer; unlocking reverses it with release semantics.
//! Anything else (an inflated monitor, a recursive acquire, contention)
//! branches to the runtime slow path.

use vm_abi::mark;

use crate::arch::{Cond, Emitter, Mem, assert_different};
use crate::buffer::Label;
use crate::masm::MacroAssembler;

/// How the inline acquire reacts to a CAS failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockRetryPolicy {
    /// One attempt; any failure goes to the slow path.
    SingleShot,
    /// Re-read the mark and retry while it still looks unlocked. A mark held
    /// by another thread branches to the slow path, so the loop cannot spin
    /// against a long-held lock.
    RetryInPlace,
}

impl<A: Emitter> MacroAssembler<'_, A> {
    /// Inline monitor acquire. Branches to `slow` when the fast path cannot
    /// take the lock. Clobbers `tmp` and both emitter scratch registers (and
    /// `RETURN` on x86-64, where the CAS stages the expected value there).
    pub fn fast_lock(
        &mut self,
        obj: A::Reg,
        tmp: A::Reg,
        policy: LockRetryPolicy,
        slow: Label,
    ) {
        assert_different(&[obj, tmp, A::THREAD, A::SCRATCH, A::SCRATCH2]);
        let mark_offset = self.cfg.object.mark_offset;
        self.asm
            .lea(A::SCRATCH2, Mem::base_disp(obj, mark_offset));
        match policy {
            LockRetryPolicy::SingleShot => {
                self.asm.mov_imm(tmp, mark::UNLOCKED);
                self.asm.cas_ptr(A::SCRATCH2, tmp, A::THREAD, true, false);
                self.asm.jcc(Cond::Ne, slow);
            }
            LockRetryPolicy::RetryInPlace => {
                let retry = self.asm.new_label();
                self.asm.bind(retry);
                self.asm.load(tmp, Mem::base_disp(obj, mark_offset));
                self.asm.cmp_imm(tmp, mark::UNLOCKED as i32);
                self.asm.jcc(Cond::Ne, slow);
                // tmp already holds the unlocked pattern.
                self.asm.cas_ptr(A::SCRATCH2, tmp, A::THREAD, true, false);
                self.asm.jcc(Cond::Ne, retry);
            }
        }
    }

    /// Inline monitor release: swaps the owner pointer back to the unlocked
    /// pattern with release ordering. Branches to `slow` when the mark is not
    /// this thread's pointer (inflated or not owned).
    pub fn fast_unlock(&mut self, obj: A::Reg, tmp: A::Reg, slow: Label) {
        assert_different(&[obj, tmp, A::THREAD, A::SCRATCH, A::SCRATCH2]);
        let mark_offset = self.cfg.object.mark_offset;
        self.asm
            .lea(A::SCRATCH2, Mem::base_disp(obj, mark_offset));
        self.asm.mov_imm(tmp, mark::UNLOCKED);
        self.asm.cas_ptr(A::SCRATCH2, A::THREAD, tmp, false, true);
        self.asm.jcc(Cond::Ne, slow);
    }
}
