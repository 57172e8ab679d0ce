//! Base relocation block walker.

use std::fmt;

use crate::buffer::BufferView;
use crate::headers::DataDirectory;
use crate::section::SectionTable;

const BLOCK_HEADER_SIZE: u64 = 8;

/// The 4-bit relocation type from the top of each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Padding for alignment; entries of this type are never emitted.
    Absolute,
    /// The high 16 bits of a 32-bit target.
    High,
    /// The low 16 bits of a 32-bit target.
    Low,
    /// A full 32-bit target.
    HighLow,
    /// The high 16 bits, sign-adjusted by the next entry.
    HighAdj,
    MipsJmpAddr,
    ThumbMov32,
    MipsJmpAddr16,
    /// A full 64-bit target.
    Dir64,
    Other(u8),
}

impl RelocKind {
    pub fn from_u4(value: u8) -> RelocKind {
        match value {
            0 => RelocKind::Absolute,
            1 => RelocKind::High,
            2 => RelocKind::Low,
            3 => RelocKind::HighLow,
            4 => RelocKind::HighAdj,
            5 => RelocKind::MipsJmpAddr,
            7 => RelocKind::ThumbMov32,
            9 => RelocKind::MipsJmpAddr16,
            10 => RelocKind::Dir64,
            v => RelocKind::Other(v),
        }
    }
}

/// One relocation site, already shifted to a VA.
#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    pub address: u64,
    pub kind: RelocKind,
}

impl fmt::Display for Reloc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x} {:?}", self.address, self.kind)
    }
}

/// Walks `IMAGE_BASE_RELOCATION` blocks until the directory ends or a
/// zero-sized block terminates the list. Each block covers one 4 KiB page
/// and declares its own byte size; entry count is `(size - 8) / 2`. A block
/// of exactly 8 bytes is legal and contributes nothing. Type-0 entries are
/// alignment padding and are skipped, never emitted.
pub(crate) fn parse(
    buf: BufferView,
    sections: &SectionTable,
    directory: DataDirectory,
) -> Vec<Reloc> {
    let base = match sections.rva_to_offset(directory.rva) {
        Ok(offset) => offset,
        Err(err) => {
            tracing::warn!(rva = directory.rva, %err, "relocation directory is not mapped");
            return Vec::new();
        }
    };
    let end = base as u64 + directory.size as u64;

    let mut relocs = Vec::new();
    let mut cursor = base as u64;
    while cursor + BLOCK_HEADER_SIZE <= end {
        let (page_rva, size_of_block) = match (buf.read_u32(cursor), buf.read_u32(cursor + 4)) {
            (Ok(page), Ok(size)) => (page, size as u64),
            _ => {
                tracing::warn!(offset = cursor, "relocation block header out of bounds, stopping");
                break;
            }
        };
        if size_of_block == 0 {
            break;
        }
        if size_of_block < BLOCK_HEADER_SIZE || cursor + size_of_block > end {
            tracing::warn!(
                offset = cursor,
                size = size_of_block,
                "relocation block size escapes directory, stopping"
            );
            break;
        }

        let entries = (size_of_block - BLOCK_HEADER_SIZE) / 2;
        for i in 0..entries {
            let raw = match buf.read_u16(cursor + BLOCK_HEADER_SIZE + i * 2) {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!(offset = cursor, entry = i, %err, "relocation entry out of bounds");
                    break;
                }
            };
            let kind = RelocKind::from_u4((raw >> 12) as u8);
            if kind == RelocKind::Absolute {
                continue;
            }
            relocs.push(Reloc {
                address: sections.image_base() + page_rva as u64 + (raw & 0x0fff) as u64,
                kind,
            });
        }
        cursor += size_of_block;
    }
    relocs
}
