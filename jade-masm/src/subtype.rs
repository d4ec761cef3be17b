//! Subtype check sequences.
//!
//! The fast path covers the self-check and the primary supertype display; the
//! slow path walks the secondary-supertypes array and refreshes the one-slot
//! cache on a hit. An outcome label passed as `None` means "fall through":
//! at most one of the outcomes may be omitted per call.

use crate::arch::{Cond, Emitter, Mem, RegOrConst, assert_different};
use crate::buffer::Label;
use crate::masm::MacroAssembler;

impl<A: Emitter> MacroAssembler<'_, A> {
    /// Positive-hierarchy check: self-equality, then one compare against the
    /// field at the supertype's check offset inside `sub_klass`.
    ///
    /// When the check offset equals the secondary-super-cache offset, a
    /// mismatch is inconclusive (the cache may simply hold a different type)
    /// and routes to `slow_path` instead of `failure`.
    ///
    /// `super_check_offset` is the supertype's check offset when the caller
    /// already has it; otherwise it is loaded from `super_klass` into `temp`.
    #[allow(clippy::too_many_arguments)]
    pub fn check_klass_subtype_fast_path(
        &mut self,
        sub_klass: A::Reg,
        super_klass: A::Reg,
        temp: A::Reg,
        success: Option<Label>,
        failure: Option<Label>,
        slow_path: Option<Label>,
        super_check_offset: Option<RegOrConst<A::Reg>>,
    ) {
        assert_different(&[sub_klass, super_klass, temp]);
        let omitted = [success, failure, slow_path]
            .iter()
            .filter(|l| l.is_none())
            .count();
        assert!(omitted <= 1, "at most one outcome label may fall through");

        let fall = self.asm.new_label();
        let l_success = success.unwrap_or(fall);
        let l_failure = failure.unwrap_or(fall);
        let l_slow = slow_path.unwrap_or(fall);
        let sc_offset = self.cfg.klass.secondary_super_cache_offset;

        self.asm.cmp_rr(sub_klass, super_klass);
        self.asm.jcc(Cond::Eq, l_success);

        let check_offset = match super_check_offset {
            Some(off) => off,
            None => {
                let sco_addr =
                    Mem::base_disp(super_klass, self.cfg.klass.super_check_offset_offset);
                self.asm.load_sized_value(temp, sco_addr, 4, false);
                RegOrConst::Reg(temp)
            }
        };

        match check_offset {
            RegOrConst::Reg(offset_reg) => {
                self.asm
                    .cmp_mem_reg(Mem::base_index_scale(sub_klass, offset_reg, 1, 0), super_klass);
                self.asm.jcc(Cond::Eq, l_success);
                // Mismatch is final only when the probed slot was not the cache.
                self.asm.cmp_imm(offset_reg, sc_offset);
                if failure.is_none() {
                    self.asm.jcc(Cond::Eq, l_slow);
                } else {
                    self.asm.jcc(Cond::Ne, l_failure);
                    if slow_path.is_some() {
                        self.asm.jmp(l_slow);
                    }
                }
            }
            RegOrConst::Const(offset) if offset == sc_offset => {
                // Probing the cache slot itself: a miss is never conclusive.
                self.asm
                    .cmp_mem_reg(Mem::base_disp(sub_klass, offset), super_klass);
                if slow_path.is_none() {
                    self.asm.jcc(Cond::Eq, l_success);
                } else {
                    self.asm.jcc(Cond::Ne, l_slow);
                    if success.is_some() {
                        self.asm.jmp(l_success);
                    }
                }
            }
            RegOrConst::Const(offset) => {
                // A fixed display slot gives a fast yes/no decision.
                self.asm
                    .cmp_mem_reg(Mem::base_disp(sub_klass, offset), super_klass);
                if failure.is_none() {
                    self.asm.jcc(Cond::Eq, l_success);
                } else {
                    self.asm.jcc(Cond::Ne, l_failure);
                    if success.is_some() {
                        self.asm.jmp(l_success);
                    }
                }
            }
        }

        self.asm.bind(fall);
    }

    /// Linear scan of `sub_klass`'s secondary supertypes. On a hit the cache
    /// slot is refreshed with a plain store; racing threads may each write
    /// the same kind of value, and any of them is a valid cache entry.
    ///
    /// Clobbers `temp` (element cursor), `temp2` (remaining count) and the
    /// emitter scratch register.
    pub fn check_klass_subtype_slow_path(
        &mut self,
        sub_klass: A::Reg,
        super_klass: A::Reg,
        temp: A::Reg,
        temp2: A::Reg,
        success: Option<Label>,
        failure: Option<Label>,
    ) {
        assert_different(&[sub_klass, super_klass, temp, temp2, A::SCRATCH]);
        let omitted = [success, failure].iter().filter(|l| l.is_none()).count();
        assert!(omitted <= 1, "at most one outcome label may fall through");

        let fall = self.asm.new_label();
        let l_success = success.unwrap_or(fall);
        let l_failure = failure.unwrap_or(fall);

        let supers_offset = self.cfg.klass.secondary_supers_offset;
        let length_offset = self.cfg.array.length_offset;
        let base_offset = self.cfg.array.base_offset;
        let cache_offset = self.cfg.klass.secondary_super_cache_offset;

        self.asm
            .load(temp, Mem::base_disp(sub_klass, supers_offset));
        self.asm
            .load_sized_value(temp2, Mem::base_disp(temp, length_offset), 4, false);
        self.asm.add_imm(temp, base_offset);

        let scan = self.asm.new_label();
        let found = self.asm.new_label();
        self.asm.bind(scan);
        self.asm.cmp_imm(temp2, 0);
        self.asm.jcc(Cond::Eq, l_failure);
        self.asm.load(A::SCRATCH, Mem::base_disp(temp, 0));
        self.asm.cmp_rr(A::SCRATCH, super_klass);
        self.asm.jcc(Cond::Eq, found);
        self.asm.add_imm(temp, 8);
        self.asm.add_imm(temp2, -1);
        self.asm.jmp(scan);

        self.asm.bind(found);
        self.asm
            .store(Mem::base_disp(sub_klass, cache_offset), super_klass);
        if success.is_some() {
            self.asm.jmp(l_success);
        }

        self.asm.bind(fall);
    }

    /// Full check: fast path, then the secondary scan, falling through when
    /// `sub_klass` is not a subtype of `super_klass`.
    pub fn check_klass_subtype(
        &mut self,
        sub_klass: A::Reg,
        super_klass: A::Reg,
        temp: A::Reg,
        temp2: A::Reg,
        success: Label,
    ) {
        let failure = self.asm.new_label();
        self.check_klass_subtype_fast_path(
            sub_klass,
            super_klass,
            temp,
            Some(success),
            Some(failure),
            None,
            None,
        );
        self.check_klass_subtype_slow_path(sub_klass, super_klass, temp, temp2, Some(success), None);
        self.asm.bind(failure);
    }
}
