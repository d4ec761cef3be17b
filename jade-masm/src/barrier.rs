//! GC barrier emission.
//!
//! All reference loads and stores in emitted code funnel through a
//! [`BarrierSetAssembler`], chosen by whoever drives code generation for the
//! collector in use. The trait defaults implement the raw (barrier-free)
//! access including compressed-oop handling, plus the TLAB and eden
//! allocation fast paths, so a concrete barrier set only overrides what its
//! collector actually needs.

use vm_abi::decorators::{AS_RAW, IN_HEAP};

use crate::arch::{Cond, Emitter, Mem, RegOrConst, assert_different};
use crate::buffer::Label;
use crate::masm::MacroAssembler;
use crate::reloc::RelocKind;

/// Reference access without any GC bookkeeping. Compressed encoding still
/// applies to heap accesses.
fn raw_load_at<A: Emitter>(
    masm: &mut MacroAssembler<'_, A>,
    decorators: u32,
    dst: A::Reg,
    src: Mem<A::Reg>,
) {
    if decorators & IN_HEAP != 0 && masm.config().oops.compressed {
        masm.load_sized_value(dst, src, 4, false);
        masm.decode_heap_oop(dst);
    } else {
        masm.load(dst, src);
    }
}

fn raw_store_at<A: Emitter>(
    masm: &mut MacroAssembler<'_, A>,
    decorators: u32,
    dst: Mem<A::Reg>,
    val: Option<A::Reg>,
    tmp: A::Reg,
) {
    let narrow = decorators & IN_HEAP != 0 && masm.config().oops.compressed;
    match val {
        Some(v) if narrow => {
            // Encoding is destructive; stage through tmp.
            masm.mov_rr(tmp, v);
            masm.encode_heap_oop(tmp);
            masm.store_sized_value(dst, tmp, 4);
        }
        Some(v) => masm.store(dst, v),
        None => {
            masm.mov_imm(tmp, 0);
            masm.store_sized_value(dst, tmp, if narrow { 4 } else { 8 });
        }
    }
}

/// Per-collector barrier emission. `masm` is passed in rather than owned so
/// one barrier set serves many concurrent emission sessions.
pub trait BarrierSetAssembler<A: Emitter> {
    /// Emits a reference load from `src`, barriers included.
    fn load_at(
        &self,
        masm: &mut MacroAssembler<'_, A>,
        decorators: u32,
        dst: A::Reg,
        src: Mem<A::Reg>,
        _tmp: A::Reg,
    ) {
        raw_load_at(masm, decorators, dst, src);
    }

    /// Emits a reference store to `dst`; `val == None` stores null.
    fn store_at(
        &self,
        masm: &mut MacroAssembler<'_, A>,
        decorators: u32,
        dst: Mem<A::Reg>,
        val: Option<A::Reg>,
        tmp1: A::Reg,
        _tmp2: A::Reg,
    ) {
        raw_store_at(masm, decorators, dst, val, tmp1);
    }

    /// Bump-pointer allocation from the thread-local allocation buffer.
    /// `obj` receives the new object start; branches to `slow_case` when the
    /// buffer cannot hold `size` more bytes, leaving the buffer untouched.
    fn tlab_allocate(
        &self,
        masm: &mut MacroAssembler<'_, A>,
        obj: A::Reg,
        size: RegOrConst<A::Reg>,
        t1: A::Reg,
        slow_case: Label,
    ) {
        assert_different(&[obj, t1]);
        let top = masm.thread_field(masm.config().thread.tlab_top_offset);
        let end = masm.thread_field(masm.config().thread.tlab_end_offset);
        masm.load(obj, top);
        match size {
            RegOrConst::Reg(r) => masm.lea(t1, Mem::base_index_scale(obj, r, 1, 0)),
            RegOrConst::Const(c) => masm.lea(t1, Mem::base_disp(obj, c)),
        }
        masm.cmp_mem_reg(end, t1);
        masm.jcc(Cond::Below, slow_case);
        masm.store(top, t1);
    }

    /// Shared-eden allocation: CAS loop on the global top pointer. Branches
    /// to `slow_case` once the new top would cross the space end.
    fn eden_allocate(
        &self,
        masm: &mut MacroAssembler<'_, A>,
        obj: A::Reg,
        size: RegOrConst<A::Reg>,
        t1: A::Reg,
        slow_case: Label,
    ) {
        assert_different(&[obj, t1, A::SCRATCH, A::SCRATCH2]);
        let eden = masm.config().eden;
        let retry = masm.new_label();
        masm.bind(retry);
        masm.mov_imm(A::SCRATCH2, eden.top_addr);
        masm.load(obj, Mem::base_disp(A::SCRATCH2, 0));
        match size {
            RegOrConst::Reg(r) => masm.lea(t1, Mem::base_index_scale(obj, r, 1, 0)),
            RegOrConst::Const(c) => masm.lea(t1, Mem::base_disp(obj, c)),
        }
        masm.mov_imm(A::SCRATCH, eden.end_addr);
        masm.load(A::SCRATCH, Mem::base_disp(A::SCRATCH, 0));
        masm.cmp_rr(t1, A::SCRATCH);
        masm.jcc(Cond::Above, slow_case);
        // Another thread may have bumped top since the load; retry on a
        // failed exchange.
        masm.cas_ptr(A::SCRATCH2, obj, t1, false, false);
        masm.jcc(Cond::Ne, retry);
    }
}

/// No-barrier collector (stop-the-world mark/sweep, or none).
pub struct RawBarrierSet;

impl<A: Emitter> BarrierSetAssembler<A> for RawBarrierSet {}

/// Generational card-marking collector: every heap reference store dirties
/// the card covering the written-to address.
pub struct CardTableBarrierSet {
    pub card_table_base: u64,
    pub card_shift: u8,
}

impl<A: Emitter> BarrierSetAssembler<A> for CardTableBarrierSet {
    fn store_at(
        &self,
        masm: &mut MacroAssembler<'_, A>,
        decorators: u32,
        dst: Mem<A::Reg>,
        val: Option<A::Reg>,
        tmp1: A::Reg,
        tmp2: A::Reg,
    ) {
        raw_store_at(masm, decorators, dst, val, tmp1);
        if decorators & IN_HEAP == 0 {
            return;
        }
        // Null stores create no old-to-young pointers but dirtying the card
        // anyway keeps the sequence branch-free.
        assert_different(&[tmp1, tmp2, A::SCRATCH, A::SCRATCH2]);
        masm.lea(tmp2, dst);
        masm.shr_imm(tmp2, self.card_shift);
        masm.mov_imm(tmp1, self.card_table_base);
        masm.mov_imm(A::SCRATCH, 0);
        masm.store_sized_value(Mem::base_index_scale(tmp1, tmp2, 1, 0), A::SCRATCH, 1);
    }
}

impl<A: Emitter> MacroAssembler<'_, A> {
    /// Barriered reference load; `AS_RAW` bypasses the barrier set.
    pub fn access_load_at(
        &mut self,
        bs: &dyn BarrierSetAssembler<A>,
        decorators: u32,
        dst: A::Reg,
        src: Mem<A::Reg>,
        tmp: A::Reg,
    ) {
        if decorators & AS_RAW != 0 {
            raw_load_at(self, decorators, dst, src);
        } else {
            bs.load_at(self, decorators, dst, src, tmp);
        }
    }

    /// Barriered reference store; `AS_RAW` bypasses the barrier set.
    #[allow(clippy::too_many_arguments)]
    pub fn access_store_at(
        &mut self,
        bs: &dyn BarrierSetAssembler<A>,
        decorators: u32,
        dst: Mem<A::Reg>,
        val: Option<A::Reg>,
        tmp1: A::Reg,
        tmp2: A::Reg,
    ) {
        if decorators & AS_RAW != 0 {
            raw_store_at(self, decorators, dst, val, tmp1);
        } else {
            bs.store_at(self, decorators, dst, val, tmp1, tmp2);
        }
    }

    /// Compresses the reference in `reg` in place. Null encodes to zero, so
    /// a zero-base heap needs no branch at all.
    pub fn encode_heap_oop(&mut self, reg: A::Reg) {
        let enc = self.cfg.oops;
        if !enc.compressed {
            return;
        }
        if enc.base == 0 {
            if enc.shift != 0 {
                self.asm.shr_imm(reg, enc.shift);
            }
            return;
        }
        assert_different(&[reg, A::SCRATCH]);
        let done = self.asm.new_label();
        self.asm.test_rr(reg, reg);
        self.asm.jcc(Cond::Eq, done);
        self.asm.mov_imm(A::SCRATCH, enc.base);
        self.asm.sub_rr(reg, A::SCRATCH);
        if enc.shift != 0 {
            self.asm.shr_imm(reg, enc.shift);
        }
        self.asm.bind(done);
    }

    /// Inverse of [`encode_heap_oop`](Self::encode_heap_oop).
    pub fn decode_heap_oop(&mut self, reg: A::Reg) {
        let enc = self.cfg.oops;
        if !enc.compressed {
            return;
        }
        if enc.base == 0 {
            if enc.shift != 0 {
                self.asm.shl_imm(reg, enc.shift);
            }
            return;
        }
        assert_different(&[reg, A::SCRATCH]);
        let done = self.asm.new_label();
        self.asm.test_rr(reg, reg);
        self.asm.jcc(Cond::Eq, done);
        if enc.shift != 0 {
            self.asm.shl_imm(reg, enc.shift);
        }
        self.asm.mov_imm(A::SCRATCH, enc.base);
        self.asm.add_rr(reg, A::SCRATCH);
        self.asm.bind(done);
    }

    /// Resolves a jobject handle in `value` to the referent, in place.
    /// A null handle stays null; bit 0 tags a weak handle, whose referent is
    /// read with a phantom-strength load so a concurrent collector keeps it
    /// alive or nulls the slot atomically.
    pub fn resolve_jobject(
        &mut self,
        bs: &dyn BarrierSetAssembler<A>,
        value: A::Reg,
        tmp: A::Reg,
    ) {
        use vm_abi::decorators::{IN_NATIVE, ON_PHANTOM_OOP_REF};

        assert_different(&[value, tmp, A::SCRATCH]);
        let weak_tag = self.cfg.weak_tag_mask;
        let done = self.asm.new_label();
        let weak = self.asm.new_label();
        self.asm.test_rr(value, value);
        self.asm.jcc(Cond::Eq, done);
        self.asm.test_imm(value, weak_tag);
        self.asm.jcc(Cond::Ne, weak);
        self.access_load_at(bs, IN_NATIVE, value, Mem::base_disp(value, 0), tmp);
        let over = self.asm.new_label();
        self.asm.jmp(over);
        self.asm.bind(weak);
        // Untag by addressing at -1 instead of clearing the bit.
        self.access_load_at(
            bs,
            IN_NATIVE | ON_PHANTOM_OOP_REF,
            value,
            Mem::base_disp(value, -(weak_tag as i32)),
            tmp,
        );
        self.asm.bind(over);
        self.asm.bind(done);
    }

    /// Compressed klass-pointer-aware klass load from an object header.
    pub fn load_klass(&mut self, dst: A::Reg, obj: A::Reg) {
        let klass_offset = self.cfg.object.klass_offset;
        if self.cfg.oops.compressed {
            self.asm
                .load_sized_value(dst, Mem::base_disp(obj, klass_offset), 4, false);
            self.decode_heap_oop(dst);
        } else {
            self.asm.load(dst, Mem::base_disp(obj, klass_offset));
        }
    }

    /// Null-check by touching the mark word; faults on a null receiver.
    pub fn null_check(&mut self, reg: A::Reg) {
        let mark = self.cfg.object.mark_offset;
        self.asm
            .load_sized_value(A::SCRATCH2, Mem::base_disp(reg, mark), 4, false);
    }

    /// Patchable load of an external root (an oop held outside the heap).
    pub fn load_external_root(&mut self, dst: A::Reg, root_addr: u64) {
        self.asm
            .mov_patchable_imm(dst, root_addr, RelocKind::ExternalAddress);
        self.asm.load(dst, Mem::base_disp(dst, 0));
    }
}
