#![allow(dead_code)]

//! Shared harness: mock VM data structures laid out with `offset_of!`, a
//! `VmConfig` built from them, and helpers that emit a callable stub with the
//! thread register established from the first C argument.

use std::mem::offset_of;

use masm::arch::Emitter;
use masm::{CodeCacheBounds, ExecutableMemory, MacroAssembler};
use vm_abi::{
    ArrayLayout, EdenSpace, EntryPoints, KlassLayout, ObjectLayout, OopEncoding, ThreadLayout,
    VmConfig,
};

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use masm::HostEmitter;

/// Platforms where the emitted code can actually be executed by the tests.
pub fn native_supported() -> bool {
    (cfg!(target_arch = "x86_64")
        && (cfg!(target_os = "windows") || (cfg!(unix) && !cfg!(target_os = "macos"))))
        || (cfg!(target_arch = "aarch64")
            && (cfg!(target_os = "linux") || cfg!(target_os = "macos")))
}

/// Words in the combined vtable + itable region of a [`TestKlass`].
pub const TABLE_WORDS: usize = 24;

#[repr(C)]
pub struct TestKlass {
    pub super_check_offset: u32,
    pub pad0: u32,
    pub secondary_super_cache: u64,
    pub secondary_supers: u64,
    pub vtable_length: u32,
    pub pad1: u32,
    /// Vtable entries first, itable entries after `vtable_length` slots.
    pub table: [u64; TABLE_WORDS],
}

impl TestKlass {
    pub fn zeroed() -> Self {
        TestKlass {
            super_check_offset: 0,
            pad0: 0,
            secondary_super_cache: 0,
            secondary_supers: 0,
            vtable_length: 0,
            pad1: 0,
            table: [0; TABLE_WORDS],
        }
    }

    pub fn addr(&self) -> u64 {
        self as *const TestKlass as u64
    }
}

#[repr(C)]
pub struct TestSupersArray {
    pub length: u32,
    pub pad: u32,
    pub elems: [u64; 8],
}

impl TestSupersArray {
    pub fn new(elems: &[u64]) -> Self {
        let mut arr = TestSupersArray {
            length: elems.len() as u32,
            pad: 0,
            elems: [0; 8],
        };
        arr.elems[..elems.len()].copy_from_slice(elems);
        arr
    }
}

#[repr(C)]
pub struct TestObject {
    pub mark: u64,
    pub klass: u64,
}

#[repr(C)]
#[derive(Default)]
pub struct TestThread {
    pub last_java_sp: u64,
    pub last_java_fp: u64,
    pub last_java_pc: u64,
    pub pending_exception: u64,
    pub vm_result: u64,
    pub polling_word: u64,
    pub tlab_top: u64,
    pub tlab_end: u64,
}

impl TestThread {
    pub fn addr(&mut self) -> u64 {
        self as *mut TestThread as u64
    }
}

/// A `VmConfig` whose offsets come straight from the mock structures above.
pub fn test_config() -> VmConfig {
    VmConfig {
        object: ObjectLayout {
            mark_offset: offset_of!(TestObject, mark) as i32,
            klass_offset: offset_of!(TestObject, klass) as i32,
        },
        klass: KlassLayout {
            super_check_offset_offset: offset_of!(TestKlass, super_check_offset) as i32,
            secondary_super_cache_offset: offset_of!(TestKlass, secondary_super_cache) as i32,
            secondary_supers_offset: offset_of!(TestKlass, secondary_supers) as i32,
            vtable_start_offset: offset_of!(TestKlass, table) as i32,
            vtable_length_offset: offset_of!(TestKlass, vtable_length) as i32,
        },
        array: ArrayLayout {
            length_offset: offset_of!(TestSupersArray, length) as i32,
            base_offset: offset_of!(TestSupersArray, elems) as i32,
        },
        thread: ThreadLayout {
            last_java_sp_offset: offset_of!(TestThread, last_java_sp) as i32,
            last_java_fp_offset: offset_of!(TestThread, last_java_fp) as i32,
            last_java_pc_offset: offset_of!(TestThread, last_java_pc) as i32,
            pending_exception_offset: offset_of!(TestThread, pending_exception) as i32,
            vm_result_offset: offset_of!(TestThread, vm_result) as i32,
            polling_word_offset: offset_of!(TestThread, polling_word) as i32,
            tlab_top_offset: offset_of!(TestThread, tlab_top) as i32,
            tlab_end_offset: offset_of!(TestThread, tlab_end) as i32,
        },
        oops: OopEncoding::wide(),
        eden: EdenSpace {
            top_addr: 0,
            end_addr: 0,
        },
        entry: EntryPoints {
            forward_exception: 0,
            stop: 0,
        },
        poll_bit: vm_abi::POLL_BIT,
        weak_tag_mask: vm_abi::WEAK_TAG_MASK,
    }
}

/// Body temporaries that are caller-saved under every supported ABI and
/// distinct from the emitter-owned registers.
#[cfg(target_arch = "x86_64")]
pub mod regs {
    use masm::arch::x86_64::Gpr;

    pub const T0: Gpr = Gpr::Rcx;
    pub const T1: Gpr = Gpr::Rdx;
    pub const T2: Gpr = Gpr::R8;
    pub const T3: Gpr = Gpr::R9;
}

#[cfg(target_arch = "aarch64")]
pub mod regs {
    use masm::arch::aarch64::XReg;

    pub const T0: XReg = XReg::X9;
    pub const T1: XReg = XReg::X10;
    pub const T2: XReg = XReg::X11;
    pub const T3: XReg = XReg::X12;
}

/// Copies stub payload arguments (C arguments one onward) into `dsts`, in
/// order. `dsts` must not contain an argument register whose value has not
/// been copied out yet; `[T0, T1]` is safe on every supported ABI.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub fn copy_args(
    masm: &mut MacroAssembler<'_, HostEmitter>,
    dsts: &[<HostEmitter as Emitter>::Reg],
) {
    for (i, &dst) in dsts.iter().enumerate() {
        masm.mov_rr(dst, HostEmitter::arg_reg(i + 1));
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub type StubFn = unsafe extern "C" fn(u64, u64, u64) -> u64;

/// Emits `thread-prologue; body; epilogue; ret` and installs it. The stub is
/// called with the thread pointer as argument zero and up to two payload
/// arguments; the body's result is whatever it leaves in the return register.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub fn build_stub<F>(cfg: &VmConfig, body: F) -> (ExecutableMemory, StubFn)
where
    F: FnOnce(&mut MacroAssembler<'_, HostEmitter>, &CodeCacheBounds),
{
    let mut mem = ExecutableMemory::reserve(64 * 1024).expect("reserve code region");
    let bounds = mem.bounds();
    let mut masm = MacroAssembler::<HostEmitter>::new(cfg);
    masm.push(HostEmitter::THREAD);
    masm.enter_frame();
    masm.mov_rr(HostEmitter::THREAD, HostEmitter::arg_reg(0));
    body(&mut masm, &bounds);
    masm.leave_frame();
    masm.pop(HostEmitter::THREAD);
    masm.ret();
    let sealed = masm.seal().expect("seal stub");
    let entry = mem.commit(&sealed).expect("commit stub");
    let func = unsafe { std::mem::transmute::<*const u8, StubFn>(entry) };
    (mem, func)
}

/// Emits the test stand-in for the runtime's exception forwarder: it unwinds
/// the frame `build_stub` established (the VM-call sequence has already torn
/// down its own) and returns `marker` to the original caller.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub fn build_forward_stub(cfg: &VmConfig, marker: u64) -> (ExecutableMemory, u64) {
    let mut mem = ExecutableMemory::reserve(4 * 1024).expect("reserve code region");
    let mut masm = MacroAssembler::<HostEmitter>::new(cfg);
    masm.leave_frame();
    masm.pop(HostEmitter::THREAD);
    masm.mov_imm(HostEmitter::RETURN, marker);
    masm.ret();
    let sealed = masm.seal().expect("seal forward stub");
    let entry = mem.commit(&sealed).expect("commit forward stub");
    (mem, entry as u64)
}
