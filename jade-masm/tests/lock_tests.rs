//! Executable monitor fast-path tests.

#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

mod common;

use common::*;
use masm::LockRetryPolicy;
use masm::arch::Emitter;

/// Stub taking the object in `arg1`, returning 1 when the lock (or unlock)
/// fast path succeeded and 0 when it went slow.
fn build_lock_stub(
    cfg: &vm_abi::VmConfig,
    policy: LockRetryPolicy,
) -> (masm::ExecutableMemory, StubFn) {
    build_stub(cfg, |masm, _| {
        copy_args(masm, &[regs::T0]);
        let slow = masm.new_label();
        let done = masm.new_label();
        masm.fast_lock(regs::T0, regs::T1, policy, slow);
        masm.mov_imm(HostEmitter::RETURN, 1);
        masm.jmp(done);
        masm.bind(slow);
        masm.mov_imm(HostEmitter::RETURN, 0);
        masm.bind(done);
    })
}

fn build_unlock_stub(cfg: &vm_abi::VmConfig) -> (masm::ExecutableMemory, StubFn) {
    build_stub(cfg, |masm, _| {
        copy_args(masm, &[regs::T0]);
        let slow = masm.new_label();
        let done = masm.new_label();
        masm.fast_unlock(regs::T0, regs::T1, slow);
        masm.mov_imm(HostEmitter::RETURN, 1);
        masm.jmp(done);
        masm.bind(slow);
        masm.mov_imm(HostEmitter::RETURN, 0);
        masm.bind(done);
    })
}

#[test]
fn lock_installs_the_owner_and_unlock_restores_the_mark() {
    if !native_supported() {
        return;
    }
    let cfg = test_config();
    let (_lm, lock) = build_lock_stub(&cfg, LockRetryPolicy::SingleShot);
    let (_um, unlock) = build_unlock_stub(&cfg);

    let mut obj = TestObject {
        mark: vm_abi::mark::UNLOCKED,
        klass: 0,
    };
    let obj_addr = &mut obj as *mut TestObject as u64;
    let mut thread = TestThread::default();

    assert_eq!(unsafe { lock(thread.addr(), obj_addr, 0) }, 1);
    assert_eq!(obj.mark, thread.addr(), "mark must hold the owner pointer");
    assert_eq!(unsafe { unlock(thread.addr(), obj_addr, 0) }, 1);
    assert_eq!(obj.mark, vm_abi::mark::UNLOCKED);
}

#[test]
fn locking_a_held_object_goes_slow() {
    if !native_supported() {
        return;
    }
    let cfg = test_config();
    for policy in [LockRetryPolicy::SingleShot, LockRetryPolicy::RetryInPlace] {
        let (_mem, lock) = build_lock_stub(&cfg, policy);
        let mut other = TestThread::default();
        let mut obj = TestObject {
            mark: other.addr(),
            klass: 0,
        };
        let obj_addr = &mut obj as *mut TestObject as u64;
        let mut thread = TestThread::default();
        assert_eq!(unsafe { lock(thread.addr(), obj_addr, 0) }, 0, "{policy:?}");
        assert_eq!(obj.mark, other.addr(), "mark must be untouched");
    }
}

#[test]
fn unlocking_by_a_non_owner_goes_slow() {
    if !native_supported() {
        return;
    }
    let cfg = test_config();
    let (_mem, unlock) = build_unlock_stub(&cfg);
    let mut owner = TestThread::default();
    let mut obj = TestObject {
        mark: owner.addr(),
        klass: 0,
    };
    let obj_addr = &mut obj as *mut TestObject as u64;
    let mut intruder = TestThread::default();
    assert_eq!(unsafe { unlock(intruder.addr(), obj_addr, 0) }, 0);
    assert_eq!(obj.mark, owner.addr());
}

#[test]
fn contended_lock_serializes_a_plain_counter() {
    if !native_supported() {
        return;
    }
    const THREADS: usize = 4;
    const INCREMENTS: usize = 250;

    let cfg = test_config();
    // One stub per critical section: retry-in-place acquire, non-atomic
    // read-modify-write of the counter in arg2, release. Returns 0 when the
    // lock was held, so the caller spins at the Rust level.
    let (_mem, stub) = build_stub(&cfg, |masm, _| {
        copy_args(masm, &[regs::T0, regs::T1]);
        let slow = masm.new_label();
        let unlock_slow = masm.new_label();
        let done = masm.new_label();
        masm.fast_lock(regs::T0, regs::T2, LockRetryPolicy::RetryInPlace, slow);
        masm.load(regs::T3, masm::Mem::base_disp(regs::T1, 0));
        masm.add_imm(regs::T3, 1);
        masm.store(masm::Mem::base_disp(regs::T1, 0), regs::T3);
        masm.fast_unlock(regs::T0, regs::T2, unlock_slow);
        masm.mov_imm(HostEmitter::RETURN, 1);
        masm.jmp(done);
        masm.bind(slow);
        masm.mov_imm(HostEmitter::RETURN, 0);
        masm.jmp(done);
        masm.bind(unlock_slow);
        masm.mov_imm(HostEmitter::RETURN, 2);
        masm.bind(done);
    });
    let stub_addr = stub as usize;

    let mut obj = TestObject {
        mark: vm_abi::mark::UNLOCKED,
        klass: 0,
    };
    let obj_addr = &mut obj as *mut TestObject as u64;
    let mut counter = 0u64;
    let counter_addr = &mut counter as *mut u64 as u64;

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(move || {
                let stub: StubFn = unsafe { std::mem::transmute(stub_addr) };
                let mut thread = TestThread::default();
                for _ in 0..INCREMENTS {
                    loop {
                        match unsafe { stub(thread.addr(), obj_addr, counter_addr) } {
                            1 => break,
                            0 => std::hint::spin_loop(),
                            r => panic!("unlock of an owned lock went slow ({r})"),
                        }
                    }
                }
            });
        }
    });

    assert_eq!(counter, (THREADS * INCREMENTS) as u64);
    assert_eq!(obj.mark, vm_abi::mark::UNLOCKED);
}
