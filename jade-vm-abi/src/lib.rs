//! ABI constants shared between the VM runtime and the code generator.
//!
//! Everything in here is fixed for the lifetime of one VM build: field offsets
//! into the object model and the thread structure, the compressed-oop encoding
//! parameters, and the runtime entry points emitted code may transfer to. The
//! assembler never consults globals for these; a [`VmConfig`] is built once at
//! startup and threaded by reference into every emitter that needs it.

/// Access decorators for heap/native reference loads and stores.
///
/// A decorator set is an or-combination of these flags. `AS_RAW` bypasses the
/// barrier policy entirely; the caller asserts it has already established that
/// no GC bookkeeping is required for the access.
pub mod decorators {
    pub const IN_HEAP: u32 = 1 << 0;
    pub const IN_NATIVE: u32 = 1 << 1;
    pub const IS_ARRAY: u32 = 1 << 2;
    pub const IS_NOT_NULL: u32 = 1 << 3;
    pub const AS_RAW: u32 = 1 << 4;
    pub const ON_STRONG_OOP_REF: u32 = 1 << 5;
    pub const ON_WEAK_OOP_REF: u32 = 1 << 6;
    pub const ON_PHANTOM_OOP_REF: u32 = 1 << 7;

    pub const ON_ANY_OOP_REF: u32 = ON_STRONG_OOP_REF | ON_WEAK_OOP_REF | ON_PHANTOM_OOP_REF;
}

/// Byte offsets into an object header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectLayout {
    /// Mark/header word, target of the monitor fast-path CAS.
    pub mark_offset: i32,
    /// Klass pointer (narrow or wide depending on [`OopEncoding`]).
    pub klass_offset: i32,
}

/// Byte offsets into a klass metadata record.
///
/// The aliasing between `secondary_super_cache_offset` and the value stored in
/// the super-check-offset field is load-bearing: a klass whose check offset
/// equals the cache offset has no primary-display slot for the supertype in
/// question, so a mismatch there routes to the slow path instead of failing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KlassLayout {
    /// Field holding this klass's own super-check offset (u32).
    pub super_check_offset_offset: i32,
    /// Single-slot cache of the last secondary supertype matched (pointer).
    pub secondary_super_cache_offset: i32,
    /// Pointer to the length-prefixed secondary-supertypes array.
    pub secondary_supers_offset: i32,
    /// First vtable entry.
    pub vtable_start_offset: i32,
    /// Number of vtable entries (u32).
    pub vtable_length_offset: i32,
}

/// Layout of a length-prefixed pointer array (secondary supertypes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArrayLayout {
    /// u32 element count.
    pub length_offset: i32,
    /// First element.
    pub base_offset: i32,
}

/// Byte offsets into the thread-local runtime structure, relative to the
/// reserved thread register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadLayout {
    pub last_java_sp_offset: i32,
    pub last_java_fp_offset: i32,
    pub last_java_pc_offset: i32,
    pub pending_exception_offset: i32,
    pub vm_result_offset: i32,
    pub polling_word_offset: i32,
    pub tlab_top_offset: i32,
    pub tlab_end_offset: i32,
}

/// Compressed-oop encoding parameters, fixed at VM initialization.
///
/// `encode(null) == 0` and `decode(0) == null` hold by special case regardless
/// of `base`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OopEncoding {
    pub compressed: bool,
    pub base: u64,
    pub shift: u8,
}

impl OopEncoding {
    /// Uncompressed pointers; encode/decode become plain moves.
    pub fn wide() -> Self {
        OopEncoding {
            compressed: false,
            base: 0,
            shift: 0,
        }
    }

    /// Reference encode, used by tests and the host side of the runtime.
    pub fn encode(&self, p: u64) -> u32 {
        if !self.compressed {
            return p as u32;
        }
        if p == 0 {
            return 0;
        }
        ((p - self.base) >> self.shift) as u32
    }

    /// Reference decode, inverse of [`OopEncoding::encode`].
    pub fn decode(&self, n: u32) -> u64 {
        if !self.compressed {
            return n as u64;
        }
        if n == 0 {
            return 0;
        }
        self.base + ((n as u64) << self.shift)
    }
}

/// Addresses of the global eden allocation window (top is CASed by emitted
/// allocation fast paths, end is read-only).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdenSpace {
    pub top_addr: u64,
    pub end_addr: u64,
}

/// Runtime entry points emitted code may transfer control to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryPoints {
    /// Shared exception-forwarding entry, jumped to when a VM call left a
    /// pending exception on the thread.
    pub forward_exception: u64,
    /// Fatal-diagnostic entry used by emitted `stop` sequences. Receives the
    /// message pointer as the first C argument and must not return.
    pub stop: u64,
}

/// Mark-word constants for the monitor fast paths.
pub mod mark {
    /// Header pattern of an unlocked object.
    pub const UNLOCKED: u64 = 0x1;
}

/// Bit 0 of a jobject handle distinguishes weak from normal indirection.
pub const WEAK_TAG_MASK: u64 = 0x1;

/// Bit tested in the thread-local polling word; set means a safepoint or
/// handshake has been requested.
pub const POLL_BIT: u64 = 0x1;

/// The process-wide constants the assembler consumes, computed once at startup
/// and immutable thereafter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    pub object: ObjectLayout,
    pub klass: KlassLayout,
    pub array: ArrayLayout,
    pub thread: ThreadLayout,
    pub oops: OopEncoding,
    pub eden: EdenSpace,
    pub entry: EntryPoints,
    pub poll_bit: u64,
    pub weak_tag_mask: u64,
}
