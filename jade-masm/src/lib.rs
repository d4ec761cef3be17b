//! Machine-code emission for the VM's compiled entry points and stubs.
//!
//! The crate is layered bottom-up: [`buffer`] holds the instruction stream,
//! labels and literal pool; [`reloc`] describes every patchable field in a
//! sealed stream; [`arch`] provides the per-architecture instruction
//! emitters behind one [`Emitter`] trait; [`masm`] and its sibling modules
//! build the VM-level sequences (subtype checks, dispatch, GC barriers, VM
//! calls, monitor fast paths) on top; [`exec`] installs sealed code into
//! executable memory.

pub mod arch;
pub mod barrier;
pub mod buffer;
pub mod cache;
pub mod exec;
pub mod lock;
pub mod masm;
pub mod reloc;

mod dispatch;
mod subtype;
mod trampoline;

pub use arch::{Cond, Emitter, Mem, MembarKind, RegOrConst};
pub use barrier::{BarrierSetAssembler, CardTableBarrierSet, RawBarrierSet};
pub use buffer::{CodeBuffer, Label, MasmError, SealedCode};
pub use cache::CodeCacheBounds;
pub use exec::{ExecError, ExecutableMemory};
pub use lock::LockRetryPolicy;
pub use masm::MacroAssembler;
pub use reloc::{AddressLiteral, RelocEntry, RelocFormat, RelocKind, apply_relocations};

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use arch::HostEmitter;

/// Convenience alias for a macro assembler on the build target's backend.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub type HostMacroAssembler<'a> = MacroAssembler<'a, HostEmitter>;
