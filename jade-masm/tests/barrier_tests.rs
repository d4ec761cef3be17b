//! Executable GC barrier, oop encoding and allocation fast-path tests.

#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

mod common;

use std::sync::atomic::{AtomicU64, Ordering};

use common::*;
use masm::arch::Emitter;
use masm::{BarrierSetAssembler, CardTableBarrierSet, Mem, RawBarrierSet, RegOrConst};
use proptest::prelude::*;
use vm_abi::decorators::IN_HEAP;

#[test]
fn tlab_allocate_bumps_top_until_exhausted() {
    if !native_supported() {
        return;
    }
    let cfg = test_config();
    let (_mem, stub) = build_stub(&cfg, |masm, _| {
        copy_args(masm, &[regs::T0]);
        let slow = masm.new_label();
        let done = masm.new_label();
        let bs = RawBarrierSet;
        bs.tlab_allocate(
            masm,
            HostEmitter::RETURN,
            RegOrConst::Reg(regs::T0),
            regs::T1,
            slow,
        );
        masm.jmp(done);
        masm.bind(slow);
        masm.mov_imm(HostEmitter::RETURN, 0);
        masm.bind(done);
    });

    let mut thread = TestThread::default();
    let buffer = vec![0u8; 256];
    thread.tlab_top = buffer.as_ptr() as u64;
    thread.tlab_end = buffer.as_ptr() as u64 + 256;

    let first = unsafe { stub(thread.addr(), 64, 0) };
    assert_eq!(first, buffer.as_ptr() as u64);
    assert_eq!(thread.tlab_top, first + 64);

    let second = unsafe { stub(thread.addr(), 192, 0) };
    assert_eq!(second, first + 64);
    assert_eq!(thread.tlab_top, thread.tlab_end);

    // Exhausted: slow path, top untouched.
    assert_eq!(unsafe { stub(thread.addr(), 8, 0) }, 0);
    assert_eq!(thread.tlab_top, thread.tlab_end);
}

#[test]
fn eden_allocate_is_atomic_across_threads() {
    if !native_supported() {
        return;
    }
    let top = AtomicU64::new(0);
    let end = AtomicU64::new(0);
    let mut cfg = test_config();
    cfg.eden.top_addr = top.as_ptr() as u64;
    cfg.eden.end_addr = end.as_ptr() as u64;

    let heap = vec![0u8; 64 * 1024];
    top.store(heap.as_ptr() as u64, Ordering::SeqCst);
    end.store(heap.as_ptr() as u64 + heap.len() as u64, Ordering::SeqCst);

    let (_mem, stub) = build_stub(&cfg, |masm, _| {
        let slow = masm.new_label();
        let done = masm.new_label();
        copy_args(masm, &[regs::T0]);
        let bs = RawBarrierSet;
        bs.eden_allocate(
            masm,
            HostEmitter::RETURN,
            RegOrConst::Reg(regs::T0),
            regs::T1,
            slow,
        );
        masm.jmp(done);
        masm.bind(slow);
        masm.mov_imm(HostEmitter::RETURN, 0);
        masm.bind(done);
    });
    let stub_addr = stub as usize;

    const THREADS: usize = 4;
    const PER_THREAD: usize = 64;
    const CHUNK: u64 = 32;
    let results: Vec<Vec<u64>> = std::thread::scope(|scope| {
        (0..THREADS)
            .map(|_| {
                scope.spawn(move || {
                    let stub: StubFn = unsafe { std::mem::transmute(stub_addr) };
                    let mut thread = TestThread::default();
                    (0..PER_THREAD)
                        .map(|_| unsafe { stub(thread.addr(), CHUNK, 0) })
                        .collect()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    });

    let mut all: Vec<u64> = results.into_iter().flatten().collect();
    assert!(all.iter().all(|&p| p != 0), "eden unexpectedly exhausted");
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), THREADS * PER_THREAD, "overlapping allocations");
    assert_eq!(
        top.load(Ordering::SeqCst),
        heap.as_ptr() as u64 + (THREADS * PER_THREAD) as u64 * CHUNK
    );
}

#[test]
fn eden_allocate_respects_the_end() {
    if !native_supported() {
        return;
    }
    let top = AtomicU64::new(0);
    let end = AtomicU64::new(0);
    let mut cfg = test_config();
    cfg.eden.top_addr = top.as_ptr() as u64;
    cfg.eden.end_addr = end.as_ptr() as u64;
    let heap = vec![0u8; 64];
    top.store(heap.as_ptr() as u64, Ordering::SeqCst);
    end.store(heap.as_ptr() as u64 + 64, Ordering::SeqCst);

    let (_mem, stub) = build_stub(&cfg, |masm, _| {
        let slow = masm.new_label();
        let done = masm.new_label();
        copy_args(masm, &[regs::T0]);
        let bs = RawBarrierSet;
        bs.eden_allocate(
            masm,
            HostEmitter::RETURN,
            RegOrConst::Reg(regs::T0),
            regs::T1,
            slow,
        );
        masm.jmp(done);
        masm.bind(slow);
        masm.mov_imm(HostEmitter::RETURN, 0);
        masm.bind(done);
    });
    let mut thread = TestThread::default();
    assert_ne!(unsafe { stub(thread.addr(), 64, 0) }, 0);
    assert_eq!(unsafe { stub(thread.addr(), 1, 0) }, 0, "past-end allocation");
}

#[test]
fn card_table_store_dirties_the_covering_card() {
    if !native_supported() {
        return;
    }
    let cfg = test_config();
    const CARD_SHIFT: u8 = 9;
    let heap = vec![0u8; 4096];
    let cards = vec![0xFFu8; 64];
    // Biased base so card index (addr >> shift) lands inside `cards`.
    let base =
        (cards.as_ptr() as u64).wrapping_sub((heap.as_ptr() as u64) >> CARD_SHIFT);

    let bs = CardTableBarrierSet {
        card_table_base: base,
        card_shift: CARD_SHIFT,
    };
    let (_mem, stub) = build_stub(&cfg, |masm, _| {
        copy_args(masm, &[regs::T0, regs::T1]);
        masm.access_store_at(
            &bs,
            IN_HEAP,
            Mem::base_disp(regs::T0, 0),
            Some(regs::T1),
            regs::T2,
            regs::T3,
        );
        masm.mov_imm(HostEmitter::RETURN, 0);
    });

    let mut thread = TestThread::default();
    let slot = heap.as_ptr() as u64 + 1024;
    unsafe { stub(thread.addr(), slot, 0x1234_5678) };

    let written = unsafe { *(slot as *const u64) };
    assert_eq!(written, 0x1234_5678);
    let card = ((slot >> CARD_SHIFT) - ((heap.as_ptr() as u64) >> CARD_SHIFT)) as usize;
    assert_eq!(cards[card], 0, "card not dirtied");
    // Neighboring cards untouched.
    assert!(cards.iter().enumerate().all(|(i, &c)| i == card || c == 0xFF));
}

#[test]
fn resolve_jobject_follows_strong_and_weak_handles() {
    if !native_supported() {
        return;
    }
    let cfg = test_config();
    let bs = RawBarrierSet;
    let (_mem, stub) = build_stub(&cfg, |masm, _| {
        copy_args(masm, &[regs::T0]);
        masm.resolve_jobject(&bs, regs::T0, regs::T1);
        masm.mov_rr(HostEmitter::RETURN, regs::T0);
    });

    let oop = 0xABCD_EF00u64;
    let slot = oop;
    let handle = &slot as *const u64 as u64;
    let mut thread = TestThread::default();

    assert_eq!(unsafe { stub(thread.addr(), handle, 0) }, oop);
    assert_eq!(
        unsafe { stub(thread.addr(), handle | vm_abi::WEAK_TAG_MASK, 0) },
        oop
    );
    assert_eq!(unsafe { stub(thread.addr(), 0, 0) }, 0);
}

#[test]
fn compressed_store_and_load_round_trip_through_memory() {
    if !native_supported() {
        return;
    }
    let mut cfg = test_config();
    let heap = vec![0u8; 1 << 16];
    let heap_base = heap.as_ptr() as u64 & !0x7;
    cfg.oops = vm_abi::OopEncoding {
        compressed: true,
        base: heap_base,
        shift: 3,
    };
    let bs = RawBarrierSet;
    let (_mem, stub) = build_stub(&cfg, |masm, _| {
        copy_args(masm, &[regs::T0, regs::T1]);
        masm.access_store_at(
            &bs,
            IN_HEAP,
            Mem::base_disp(regs::T0, 0),
            Some(regs::T1),
            regs::T2,
            regs::T3,
        );
        masm.access_load_at(
            &bs,
            IN_HEAP,
            HostEmitter::RETURN,
            Mem::base_disp(regs::T0, 0),
            regs::T2,
        );
    });

    let mut thread = TestThread::default();
    let mut slot = 0u64;
    let slot_addr = &mut slot as *mut u64 as u64;
    let oop = heap_base + 0x128;
    assert_eq!(unsafe { stub(thread.addr(), slot_addr, oop) }, oop);
    // Only 32 bits were written.
    assert!(slot <= u32::MAX as u64);
    assert_eq!(cfg.oops.decode(slot as u32), oop);
    // Null stays null in both directions.
    assert_eq!(unsafe { stub(thread.addr(), slot_addr, 0) }, 0);
    assert_eq!(slot, 0);
}

#[test]
fn load_klass_reads_the_header() {
    if !native_supported() {
        return;
    }
    let cfg = test_config();
    let (_mem, stub) = build_stub(&cfg, |masm, _| {
        copy_args(masm, &[regs::T0]);
        masm.load_klass(HostEmitter::RETURN, regs::T0);
    });
    let klass = TestKlass::zeroed();
    let obj = TestObject {
        mark: vm_abi::mark::UNLOCKED,
        klass: klass.addr(),
    };
    let mut thread = TestThread::default();
    assert_eq!(
        unsafe { stub(thread.addr(), &obj as *const TestObject as u64, 0) },
        klass.addr()
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn oop_encode_decode_round_trips_in_emitted_code(offset in 0u64..0xFFFF) {
        if !native_supported() {
            return Ok(());
        }
        let mut cfg = test_config();
        let base = 0x8_0000_0000u64;
        cfg.oops = vm_abi::OopEncoding { compressed: true, base, shift: 3 };
        let (_mem, stub) = build_stub(&cfg, |masm, _| {
            copy_args(masm, &[regs::T0]);
            masm.encode_heap_oop(regs::T0);
            masm.decode_heap_oop(regs::T0);
            masm.mov_rr(HostEmitter::RETURN, regs::T0);
        });
        let mut thread = TestThread::default();
        let oop = base + offset * 8;
        prop_assert_eq!(unsafe { stub(thread.addr(), oop, 0) }, oop);
        prop_assert_eq!(unsafe { stub(thread.addr(), 0, 0) }, 0);
    }
}

#[test]
fn null_check_traps_on_null() {
    if !native_supported() {
        return;
    }
    // Touching the mark word of a valid object must be a no-op.
    let cfg = test_config();
    let (_mem, stub) = build_stub(&cfg, |masm, _| {
        copy_args(masm, &[regs::T0]);
        masm.null_check(regs::T0);
        masm.mov_imm(HostEmitter::RETURN, 1);
    });
    let obj = TestObject { mark: 1, klass: 0 };
    let mut thread = TestThread::default();
    assert_eq!(
        unsafe { stub(thread.addr(), &obj as *const TestObject as u64, 0) },
        1
    );
}

#[test]
fn jcc_below_guards_unsigned_wraparound_in_tlab() {
    if !native_supported() {
        return;
    }
    // End below top (corrupt TLAB) must take the slow path, not allocate.
    let cfg = test_config();
    let (_mem, stub) = build_stub(&cfg, |masm, _| {
        copy_args(masm, &[regs::T0]);
        let slow = masm.new_label();
        let done = masm.new_label();
        let bs = RawBarrierSet;
        bs.tlab_allocate(
            masm,
            HostEmitter::RETURN,
            RegOrConst::Const(64),
            regs::T1,
            slow,
        );
        masm.jmp(done);
        masm.bind(slow);
        masm.mov_imm(HostEmitter::RETURN, 0);
        masm.bind(done);
    });
    let mut thread = TestThread::default();
    thread.tlab_top = 0x1000;
    thread.tlab_end = 0x800;
    assert_eq!(unsafe { stub(thread.addr(), 0, 0) }, 0);
    assert_eq!(thread.tlab_top, 0x1000);
}
