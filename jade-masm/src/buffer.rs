//! Instruction stream, labels and the literal pool.
//!
//! A [`CodeBuffer`] is owned by exactly one code-generation session (one
//! compiled method or stub). Emitters append encoded instructions; branches to
//! not-yet-bound labels leave placeholder fields and record fixups that are
//! resolved when the buffer is sealed. Sealing also appends the literal pool
//! and freezes the stream; nothing is mutated afterwards except through the
//! relocation entries carried by the resulting [`SealedCode`].

use crate::reloc::{RelocEntry, RelocFormat, RelocKind};

/// Position in the instruction stream, usable forward or backward.
///
/// A label may be bound exactly once; binding twice is a code-generation bug
/// and panics immediately. A label that is referenced but never bound turns
/// into a [`MasmError::UnboundLabel`] at seal time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(pub(crate) u32);

#[derive(Clone, Copy, Debug)]
pub(crate) enum FixupKind {
    /// 4-byte little-endian displacement relative to the end of the field.
    X86Rel32,
    /// AArch64 `b`/`bl` 26-bit word displacement.
    A64Branch26,
    /// AArch64 `b.cond`/`cbz`/`cbnz` 19-bit word displacement.
    A64Cond19,
}

#[derive(Clone, Copy, Debug)]
struct Fixup {
    at: usize,
    kind: FixupKind,
}

#[derive(Debug, Default)]
struct LabelState {
    bound_at: Option<usize>,
    fixups: Vec<Fixup>,
}

/// A 64-bit literal pool load site waiting for the pool to be placed.
#[derive(Clone, Copy, Debug)]
struct PoolFixup {
    /// Offset of the `ldr` literal instruction word.
    at: usize,
    slot: usize,
}

/// Errors surfaced when a buffer is sealed or relocated.
///
/// Contract violations (aliased registers, double binds, unsupported operand
/// widths) are panics, not variants here; these are the recoverable-by-caller
/// failures only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasmError {
    UnboundLabel(u32),
    BranchOutOfRange { at: usize },
    LiteralOutOfRange { at: usize },
    RelocOutOfRange { offset: usize },
}

impl std::fmt::Display for MasmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasmError::UnboundLabel(id) => write!(f, "label {id} referenced but never bound"),
            MasmError::BranchOutOfRange { at } => {
                write!(f, "branch at offset {at} exceeds encodable displacement")
            }
            MasmError::LiteralOutOfRange { at } => {
                write!(f, "literal load at offset {at} cannot reach the pool")
            }
            MasmError::RelocOutOfRange { offset } => {
                write!(
                    f,
                    "relocation at offset {offset} does not reach its target from the install address"
                )
            }
        }
    }
}

impl std::error::Error for MasmError {}

/// A finalized instruction stream plus its relocation list.
#[derive(Debug, Clone)]
pub struct SealedCode {
    pub code: Vec<u8>,
    pub relocs: Vec<RelocEntry>,
}

/// Append-only machine-code buffer for one emission session.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: Vec<LabelState>,
    relocs: Vec<RelocEntry>,
    pool: Vec<u64>,
    pool_fixups: Vec<PoolFixup>,
    /// (slot, kind, target) for pool entries that stay patchable after install.
    pool_relocs: Vec<(usize, RelocKind, u64)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        CodeBuffer::default()
    }

    pub fn pos(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u32(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    pub fn emit_u64(&mut self, word: u64) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    pub fn emit_slice(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn new_label(&mut self) -> Label {
        let id = u32::try_from(self.labels.len()).expect("label table overflow");
        self.labels.push(LabelState::default());
        Label(id)
    }

    /// Binds `label` to the current position. Panics on a second bind.
    pub fn bind(&mut self, label: Label) {
        let pos = self.pos();
        let state = &mut self.labels[label.0 as usize];
        assert!(
            state.bound_at.is_none(),
            "label {} bound twice (at {} and {})",
            label.0,
            state.bound_at.unwrap(),
            pos
        );
        state.bound_at = Some(pos);
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.labels[label.0 as usize].bound_at.is_some()
    }

    /// Records that the field at `at` must be patched with the displacement to
    /// `label` once it is bound. The placeholder bytes are already emitted.
    pub(crate) fn use_label(&mut self, label: Label, at: usize, kind: FixupKind) {
        self.labels[label.0 as usize].fixups.push(Fixup { at, kind });
    }

    pub fn add_reloc(&mut self, entry: RelocEntry) {
        self.relocs.push(entry);
    }

    /// Reserves a 64-bit literal pool slot. The pool is emitted 8-byte aligned
    /// after the code at seal time; an optional relocation kind marks the slot
    /// as patchable after installation (oops, metadata).
    pub fn literal_slot(&mut self, value: u64, reloc: Option<RelocKind>) -> usize {
        let slot = self.pool.len();
        self.pool.push(value);
        if let Some(kind) = reloc {
            self.pool_relocs.push((slot, kind, value));
        }
        slot
    }

    /// Records a pc-relative `ldr` literal fixup (instruction word at `at`)
    /// against a pool slot.
    pub(crate) fn use_literal(&mut self, at: usize, slot: usize) {
        self.pool_fixups.push(PoolFixup { at, slot });
    }

    /// Finalizes the stream: resolves every label fixup, appends the literal
    /// pool and resolves its load sites, and converts patchable pool slots into
    /// relocation entries.
    pub fn seal(mut self) -> Result<SealedCode, MasmError> {
        for (id, state) in self.labels.iter().enumerate() {
            let target = match state.bound_at {
                Some(t) => t,
                None => {
                    if state.fixups.is_empty() {
                        continue; // created but never used, harmless
                    }
                    return Err(MasmError::UnboundLabel(id as u32));
                }
            };
            for fixup in &state.fixups {
                patch_fixup(&mut self.code, fixup.at, target, fixup.kind)?;
            }
        }

        let mut relocs = std::mem::take(&mut self.relocs);
        if !self.pool.is_empty() {
            while self.code.len() % 8 != 0 {
                self.code.push(0);
            }
            let pool_base = self.code.len();
            for value in &self.pool {
                self.code.extend_from_slice(&value.to_le_bytes());
            }
            for fixup in &self.pool_fixups {
                let target = pool_base + fixup.slot * 8;
                let disp = (target as i64) - (fixup.at as i64);
                debug_assert_eq!(disp % 4, 0);
                let words = disp / 4;
                if !(-(1 << 18)..(1 << 18)).contains(&words) {
                    return Err(MasmError::LiteralOutOfRange { at: fixup.at });
                }
                let imm19 = (words as u32) & 0x7FFFF;
                let mut insn = read_u32(&self.code, fixup.at);
                insn |= imm19 << 5;
                write_u32(&mut self.code, fixup.at, insn);
            }
            for (slot, kind, target) in &self.pool_relocs {
                relocs.push(RelocEntry {
                    offset: pool_base + slot * 8,
                    kind: *kind,
                    target: *target,
                    format: RelocFormat::PoolSlot,
                });
            }
        }

        tracing::debug!(
            code_bytes = self.code.len(),
            pool_entries = self.pool.len(),
            relocs = relocs.len(),
            "sealed code buffer"
        );
        Ok(SealedCode {
            code: self.code,
            relocs,
        })
    }
}

fn patch_fixup(code: &mut [u8], at: usize, target: usize, kind: FixupKind) -> Result<(), MasmError> {
    match kind {
        FixupKind::X86Rel32 => {
            let rel = (target as i64) - ((at + 4) as i64);
            let rel =
                i32::try_from(rel).map_err(|_| MasmError::BranchOutOfRange { at })?;
            code[at..at + 4].copy_from_slice(&rel.to_le_bytes());
        }
        FixupKind::A64Branch26 => {
            let disp = (target as i64) - (at as i64);
            debug_assert_eq!(disp % 4, 0);
            let words = disp / 4;
            if !(-(1 << 25)..(1 << 25)).contains(&words) {
                return Err(MasmError::BranchOutOfRange { at });
            }
            let mut insn = read_u32(code, at);
            insn |= (words as u32) & 0x03FF_FFFF;
            write_u32(code, at, insn);
        }
        FixupKind::A64Cond19 => {
            let disp = (target as i64) - (at as i64);
            debug_assert_eq!(disp % 4, 0);
            let words = disp / 4;
            if !(-(1 << 18)..(1 << 18)).contains(&words) {
                return Err(MasmError::BranchOutOfRange { at });
            }
            let mut insn = read_u32(code, at);
            insn |= ((words as u32) & 0x7FFFF) << 5;
            write_u32(code, at, insn);
        }
    }
    Ok(())
}

fn read_u32(code: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

fn write_u32(code: &mut [u8], at: usize, word: u32) {
    code[at..at + 4].copy_from_slice(&word.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_label_is_a_seal_error() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.emit_u8(0xE9); // jmp rel32
        let at = buf.pos();
        buf.emit_u32(0);
        buf.use_label(l, at, FixupKind::X86Rel32);
        assert_eq!(buf.seal().unwrap_err(), MasmError::UnboundLabel(0));
    }

    #[test]
    fn unused_unbound_label_is_harmless() {
        let mut buf = CodeBuffer::new();
        let _ = buf.new_label();
        buf.emit_u8(0xC3);
        assert!(buf.seal().is_ok());
    }

    #[test]
    #[should_panic(expected = "bound twice")]
    fn double_bind_panics() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.bind(l);
        buf.bind(l);
    }

    #[test]
    fn backward_rel32_fixup_resolves() {
        let mut buf = CodeBuffer::new();
        let l = buf.new_label();
        buf.bind(l);
        buf.emit_u8(0x90);
        buf.emit_u8(0xE9);
        let at = buf.pos();
        buf.emit_u32(0);
        buf.use_label(l, at, FixupKind::X86Rel32);
        let sealed = buf.seal().unwrap();
        // jump lands at offset 0: rel = 0 - (2 + 4) = -6
        assert_eq!(&sealed.code[2..6], &(-6i32).to_le_bytes());
    }

    #[test]
    fn literal_pool_is_aligned_and_patchable() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        let slot = buf.literal_slot(0xDEAD_BEEF_CAFE_F00D, Some(RelocKind::Oop));
        // fake a64 ldr-literal word at offset 4
        while buf.pos() % 4 != 0 {
            buf.emit_u8(0x90);
        }
        let at = buf.pos();
        buf.emit_u32(0x5800_0000);
        buf.use_literal(at, slot);
        let sealed = buf.seal().unwrap();
        let pool_base = sealed.code.len() - 8;
        assert_eq!(pool_base % 8, 0);
        assert_eq!(
            &sealed.code[pool_base..],
            &0xDEAD_BEEF_CAFE_F00Du64.to_le_bytes()
        );
        assert_eq!(sealed.relocs.len(), 1);
        assert_eq!(sealed.relocs[0].offset, pool_base);
        assert_eq!(sealed.relocs[0].kind, RelocKind::Oop);
    }
}
