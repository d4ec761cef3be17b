//! Relocation entries and address literals.
//!
//! Every position-dependent reference in a sealed stream is described by
//! exactly one [`RelocEntry`]. Absolute forms (imm64 fields, literal pool
//! slots) need no work at install time but stay patchable afterwards;
//! pc-relative forms are resolved by [`apply_relocations`] once the final
//! installation address is known.

use crate::buffer::MasmError;

/// What the patched field refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocKind {
    Oop,
    Metadata,
    ExternalAddress,
    InternalAddress,
    RuntimeCall,
    StaticCall,
    OptVirtualCall,
    Poll,
}

/// Shape of the patchable field at `RelocEntry::offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocFormat {
    /// Little-endian absolute 8-byte immediate.
    AbsImm64,
    /// 8-byte literal pool slot.
    PoolSlot,
    /// x86 4-byte displacement relative to the end of the field.
    Rel32,
    /// AArch64 `b`/`bl` 26-bit word displacement.
    Rel26,
    /// AArch64 movz/movk×4 absolute 64-bit sequence.
    A64Mov64,
    /// Informational only (safepoint polls); nothing to patch.
    Info,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelocEntry {
    /// Byte offset of the patchable field (or instruction) in the stream.
    pub offset: usize,
    pub kind: RelocKind,
    pub target: u64,
    pub format: RelocFormat,
}

/// A code or data address paired with how references to it must be recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressLiteral {
    pub target: u64,
    pub kind: RelocKind,
}

impl AddressLiteral {
    pub fn external(target: u64) -> Self {
        AddressLiteral {
            target,
            kind: RelocKind::ExternalAddress,
        }
    }

    pub fn internal(target: u64) -> Self {
        AddressLiteral {
            target,
            kind: RelocKind::InternalAddress,
        }
    }

    pub fn runtime_call(target: u64) -> Self {
        AddressLiteral {
            target,
            kind: RelocKind::RuntimeCall,
        }
    }

    pub fn static_call(target: u64) -> Self {
        AddressLiteral {
            target,
            kind: RelocKind::StaticCall,
        }
    }

    pub fn opt_virtual_call(target: u64) -> Self {
        AddressLiteral {
            target,
            kind: RelocKind::OptVirtualCall,
        }
    }
}

/// Resolves pc-relative relocations against the final base address and
/// re-materializes absolute fields. Must run before the code is made
/// executable; errors if a displacement no longer fits its field.
pub fn apply_relocations(
    code: &mut [u8],
    relocs: &[RelocEntry],
    base: u64,
) -> Result<(), MasmError> {
    for entry in relocs {
        match entry.format {
            RelocFormat::AbsImm64 | RelocFormat::PoolSlot => {
                code[entry.offset..entry.offset + 8]
                    .copy_from_slice(&entry.target.to_le_bytes());
            }
            RelocFormat::Rel32 => {
                let field_end = base
                    .wrapping_add(entry.offset as u64)
                    .wrapping_add(4);
                let disp = (entry.target as i128) - (field_end as i128);
                let disp = i32::try_from(disp).map_err(|_| MasmError::RelocOutOfRange {
                    offset: entry.offset,
                })?;
                code[entry.offset..entry.offset + 4].copy_from_slice(&disp.to_le_bytes());
            }
            RelocFormat::Rel26 => {
                let insn_addr = base.wrapping_add(entry.offset as u64);
                let disp = (entry.target as i128) - (insn_addr as i128);
                if disp % 4 != 0 {
                    return Err(MasmError::RelocOutOfRange {
                        offset: entry.offset,
                    });
                }
                let words = disp / 4;
                if !(-(1 << 25)..(1 << 25)).contains(&words) {
                    return Err(MasmError::RelocOutOfRange {
                        offset: entry.offset,
                    });
                }
                let old = u32::from_le_bytes([
                    code[entry.offset],
                    code[entry.offset + 1],
                    code[entry.offset + 2],
                    code[entry.offset + 3],
                ]);
                let insn = (old & !0x03FF_FFFF) | ((words as u32) & 0x03FF_FFFF);
                code[entry.offset..entry.offset + 4].copy_from_slice(&insn.to_le_bytes());
            }
            RelocFormat::A64Mov64 => {
                // movz + movk ×3, imm16 fields at bits 5..21 of each word.
                for (i, chunk) in code[entry.offset..entry.offset + 16]
                    .chunks_exact_mut(4)
                    .enumerate()
                {
                    let half = ((entry.target >> (i * 16)) & 0xFFFF) as u32;
                    let old = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let insn = (old & !(0xFFFF << 5)) | (half << 5);
                    chunk.copy_from_slice(&insn.to_le_bytes());
                }
            }
            RelocFormat::Info => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel32_patches_against_install_base() {
        let mut code = vec![0xE8, 0, 0, 0, 0];
        let relocs = [RelocEntry {
            offset: 1,
            kind: RelocKind::RuntimeCall,
            target: 0x2000,
            format: RelocFormat::Rel32,
        }];
        apply_relocations(&mut code, &relocs, 0x1000).unwrap();
        // disp = 0x2000 - (0x1000 + 1 + 4)
        assert_eq!(&code[1..5], &0xFFBi32.to_le_bytes());
    }

    #[test]
    fn rel32_out_of_range_is_an_error() {
        let mut code = vec![0xE8, 0, 0, 0, 0];
        let relocs = [RelocEntry {
            offset: 1,
            kind: RelocKind::RuntimeCall,
            target: 0x1_0000_0000_0000,
            format: RelocFormat::Rel32,
        }];
        assert!(matches!(
            apply_relocations(&mut code, &relocs, 0x1000),
            Err(MasmError::RelocOutOfRange { offset: 1 })
        ));
    }

    #[test]
    fn abs_imm64_is_rewritten_in_place() {
        let mut code = vec![0u8; 8];
        let relocs = [RelocEntry {
            offset: 0,
            kind: RelocKind::Oop,
            target: 0xAABB_CCDD_EEFF_0011,
            format: RelocFormat::AbsImm64,
        }];
        apply_relocations(&mut code, &relocs, 0).unwrap();
        assert_eq!(code, 0xAABB_CCDD_EEFF_0011u64.to_le_bytes());
    }
}
