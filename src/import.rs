//! Import table walker: descriptor array, then one thunk array per module.

use std::fmt;

use crate::buffer::BufferView;
use crate::error::PeError;
use crate::headers::{DataDirectory, PeHeader};
use crate::section::SectionTable;

const DESCRIPTOR_SIZE: u64 = 20;
const ORDINAL_BIT_32: u32 = 0x8000_0000;
const ORDINAL_BIT_64: u64 = 0x8000_0000_0000_0000;

/// One resolved import thunk. `address` is the VA of the IAT slot the loader
/// would patch; ordinal-only imports synthesize an `"ORDINAL <n>"` name.
#[derive(Debug, Clone)]
pub struct Import {
    pub address: u64,
    pub symbol_name: String,
    pub module_name: String,
}

impl fmt::Display for Import {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x} {}!{}", self.address, self.module_name, self.symbol_name)
    }
}

struct Descriptor {
    original_first_thunk: u32,
    name_rva: u32,
    first_thunk: u32,
}

impl Descriptor {
    fn read(buf: BufferView, offset: u64) -> Result<Descriptor, PeError> {
        Ok(Descriptor {
            original_first_thunk: buf.read_u32(offset)?,
            // TimeDateStamp and ForwarderChain at +4 and +8 don't affect
            // structural decoding
            name_rva: buf.read_u32(offset + 12)?,
            first_thunk: buf.read_u32(offset + 16)?,
        })
    }

    fn is_terminator(&self) -> bool {
        self.original_first_thunk == 0 && self.name_rva == 0 && self.first_thunk == 0
    }
}

/// Walks the import directory. A descriptor with an unreadable name or
/// thunk array poisons only that module; remaining descriptors still parse.
pub(crate) fn parse(
    buf: BufferView,
    sections: &SectionTable,
    header: &PeHeader,
    directory: DataDirectory,
) -> Vec<Import> {
    let base = match sections.rva_to_offset(directory.rva) {
        Ok(offset) => offset,
        Err(err) => {
            tracing::warn!(rva = directory.rva, %err, "import directory is not mapped");
            return Vec::new();
        }
    };

    let mut imports = Vec::new();
    for index in 0.. {
        let descriptor = match Descriptor::read(buf, base as u64 + index * DESCRIPTOR_SIZE) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                tracing::warn!(index, %err, "import descriptor out of bounds, stopping");
                break;
            }
        };
        if descriptor.is_terminator() {
            break;
        }
        if let Err(err) = walk_module(buf, sections, header, &descriptor, &mut imports) {
            tracing::warn!(index, %err, "malformed import module, skipping");
        }
    }
    imports
}

/// Reads one module's name and thunk array. Returns `Err` for failures that
/// desynchronize this module's tables; the caller isolates them.
fn walk_module(
    buf: BufferView,
    sections: &SectionTable,
    header: &PeHeader,
    descriptor: &Descriptor,
    out: &mut Vec<Import>,
) -> Result<(), PeError> {
    let name_offset = sections.rva_to_offset(descriptor.name_rva)?;
    let module_name = buf.read_cstring(name_offset as u64)?;

    // the lookup table names the symbols; when a linker emitted only the
    // address table, read names from it instead (it holds the same thunks
    // pre-load)
    let lookup_rva = if descriptor.original_first_thunk != 0 {
        descriptor.original_first_thunk
    } else {
        descriptor.first_thunk
    };
    let lookup_base = sections.rva_to_offset(lookup_rva)? as u64;
    let thunk_size: u64 = if header.is_64bit() { 8 } else { 4 };

    for index in 0.. {
        let at = lookup_base + index * thunk_size;
        let (raw, ordinal) = if header.is_64bit() {
            let raw = buf.read_u64(at)?;
            (raw, raw & ORDINAL_BIT_64 != 0)
        } else {
            let raw = buf.read_u32(at)? as u64;
            (raw, raw as u32 & ORDINAL_BIT_32 != 0)
        };
        if raw == 0 {
            break;
        }

        let symbol_name = if ordinal {
            format!("ORDINAL {}", raw as u16)
        } else {
            // hint/name entry: u16 hint, then the NUL-terminated name
            let hint_name_rva = (raw as u32) & !ORDINAL_BIT_32;
            let name_offset = sections.rva_to_offset(hint_name_rva)?;
            buf.read_cstring(name_offset as u64 + 2)?
        };

        out.push(Import {
            // VA of the address-table slot the loader patches
            address: header.image_base + descriptor.first_thunk as u64 + index * thunk_size,
            symbol_name,
            module_name: module_name.clone(),
        });
    }
    Ok(())
}
