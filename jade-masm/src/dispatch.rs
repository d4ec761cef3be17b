//! Virtual and interface method dispatch lookup.

use crate::arch::{Cond, Emitter, Mem, RegOrConst, assert_different};
use crate::buffer::Label;
use crate::masm::MacroAssembler;

/// Bytes per itable scan entry: interface pointer at +0, u32 method-table
/// offset at +8.
const ITABLE_ENTRY_SIZE: i32 = 16;
const ITABLE_OFFSET_FIELD: i32 = 8;

impl<A: Emitter> MacroAssembler<'_, A> {
    /// Loads the method at `vtable_index` of `recv_klass`'s vtable.
    pub fn lookup_virtual_method(
        &mut self,
        recv_klass: A::Reg,
        vtable_index: RegOrConst<A::Reg>,
        method_result: A::Reg,
    ) {
        let vtable_start = self.cfg.klass.vtable_start_offset;
        let entry = match vtable_index {
            RegOrConst::Reg(index) => {
                Mem::base_index_scale(recv_klass, index, 8, vtable_start)
            }
            RegOrConst::Const(index) => Mem::base_disp(recv_klass, vtable_start + index * 8),
        };
        self.asm.load(method_result, entry);
    }

    /// Scans the itable of `recv_klass` for `intf_klass`.
    ///
    /// The itable sits directly after the vtable and is terminated by a null
    /// interface pointer; reaching it branches to `no_such_interface` (the
    /// receiver may have been reloaded since the caller was compiled). With
    /// `return_method` the method at `itable_index` of the matched interface's
    /// method table is loaded into `method_result`, and `recv_klass` is
    /// clobbered along the way; without it the sequence is a pure
    /// implements-check and `method_result` is just a temporary.
    #[allow(clippy::too_many_arguments)]
    pub fn lookup_interface_method(
        &mut self,
        recv_klass: A::Reg,
        intf_klass: A::Reg,
        itable_index: RegOrConst<A::Reg>,
        method_result: A::Reg,
        scan_temp: A::Reg,
        no_such_interface: Label,
        return_method: bool,
    ) {
        assert_different(&[recv_klass, intf_klass, method_result, scan_temp]);

        let vtable_start = self.cfg.klass.vtable_start_offset;
        let vtable_length = self.cfg.klass.vtable_length_offset;

        // scan_temp = first itable entry, right after the vtable
        self.asm.load_sized_value(
            scan_temp,
            Mem::base_disp(recv_klass, vtable_length),
            4,
            false,
        );
        self.asm.lea(
            scan_temp,
            Mem::base_index_scale(recv_klass, scan_temp, 8, vtable_start),
        );

        if return_method {
            // Fold the method index in now, while recv_klass is still live.
            match itable_index {
                RegOrConst::Reg(index) => {
                    self.asm
                        .lea(recv_klass, Mem::base_index_scale(recv_klass, index, 8, 0));
                }
                RegOrConst::Const(index) => self.asm.add_imm(recv_klass, index * 8),
            }
        }

        // First probe peeled: the hot case is a hit in entry zero.
        let search = self.asm.new_label();
        let found = self.asm.new_label();
        self.asm.load(method_result, Mem::base_disp(scan_temp, 0));
        self.asm.cmp_rr(method_result, intf_klass);
        self.asm.jcc(Cond::Eq, found);
        self.asm.bind(search);
        self.asm.test_rr(method_result, method_result);
        self.asm.jcc(Cond::Eq, no_such_interface);
        self.asm.add_imm(scan_temp, ITABLE_ENTRY_SIZE);
        self.asm.load(method_result, Mem::base_disp(scan_temp, 0));
        self.asm.cmp_rr(method_result, intf_klass);
        self.asm.jcc(Cond::Ne, search);
        self.asm.bind(found);

        if return_method {
            self.asm.load_sized_value(
                scan_temp,
                Mem::base_disp(scan_temp, ITABLE_OFFSET_FIELD),
                4,
                false,
            );
            self.asm
                .load(method_result, Mem::base_index_scale(recv_klass, scan_temp, 1, 0));
        }
    }
}
