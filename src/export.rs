//! Export directory walker: three parallel arrays and forwarder detection.

use std::collections::HashMap;
use std::fmt;

use crate::buffer::BufferView;
use crate::error::PeError;
use crate::headers::DataDirectory;
use crate::section::SectionTable;

/// What an export resolves to: a code/data address inside this image, or a
/// forwarder string naming `Module.Symbol` in another module. A forwarder's
/// address-table slot holds an RVA into the export directory itself; treating
/// it as code would be wrong, so the two cases are kept apart by type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    Address(u64),
    Forwarder(String),
}

/// One export-table entry. `symbol_name` is `None` for ordinal-only exports
/// (address-table slots no name points at); `module_name` is the image name
/// the export directory declares for itself.
#[derive(Debug, Clone)]
pub struct Export {
    pub symbol_name: Option<String>,
    pub ordinal: u32,
    pub target: ExportTarget,
    pub module_name: String,
}

impl fmt::Display for Export {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = self.symbol_name.as_deref().unwrap_or("<no name>");
        match &self.target {
            ExportTarget::Address(va) => {
                write!(f, "{:#x} {}!{} (ordinal {})", va, self.module_name, name, self.ordinal)
            }
            ExportTarget::Forwarder(fwd) => {
                write!(f, "{}!{} -> {} (ordinal {})", self.module_name, name, fwd, self.ordinal)
            }
        }
    }
}

/// Walks the single export directory. Individual unreadable names or slots
/// are skipped; only an unmapped directory empties the table.
pub(crate) fn parse(
    buf: BufferView,
    sections: &SectionTable,
    directory: DataDirectory,
) -> Vec<Export> {
    match parse_inner(buf, sections, directory) {
        Ok(exports) => exports,
        Err(err) => {
            tracing::warn!(rva = directory.rva, %err, "malformed export directory");
            Vec::new()
        }
    }
}

fn parse_inner(
    buf: BufferView,
    sections: &SectionTable,
    directory: DataDirectory,
) -> Result<Vec<Export>, PeError> {
    let base = sections.rva_to_offset(directory.rva)? as u64;

    let name_rva = buf.read_u32(base + 12)?;
    let ordinal_base = buf.read_u32(base + 16)?;
    let number_of_functions = buf.read_u32(base + 20)?;
    let number_of_names = buf.read_u32(base + 24)?;
    let functions_offset = sections.rva_to_offset(buf.read_u32(base + 28)?)? as u64;
    let names_offset = sections.rva_to_offset(buf.read_u32(base + 32)?)? as u64;
    let ordinals_offset = sections.rva_to_offset(buf.read_u32(base + 36)?)? as u64;

    let module_name = match sections
        .rva_to_offset(name_rva)
        .and_then(|offset| buf.read_cstring(offset as u64))
    {
        Ok(name) => name,
        Err(err) => {
            tracing::warn!(%err, "export directory image name unreadable");
            String::new()
        }
    };

    // name-pointer table and ordinal table are parallel: names[i] belongs to
    // address-table index ordinals[i]. A declared count past either table's
    // end means the count itself is a lie; stop rather than spin on it.
    let mut names: HashMap<u32, String> = HashMap::new();
    for i in 0..number_of_names as u64 {
        let (name_rva, index) = match (
            buf.read_u32(names_offset + i * 4),
            buf.read_u16(ordinals_offset + i * 2),
        ) {
            (Ok(rva), Ok(index)) => (rva, index),
            (rva, index) => {
                let err = rva.err().or(index.err()).unwrap();
                tracing::warn!(entry = i, %err, "export name tables truncated, stopping");
                break;
            }
        };
        match sections
            .rva_to_offset(name_rva)
            .and_then(|offset| buf.read_cstring(offset as u64))
        {
            Ok(name) => {
                names.insert(index as u32, name);
            }
            Err(err) => {
                tracing::warn!(entry = i, %err, "unreadable export name, skipping entry");
            }
        }
    }

    let directory_end = directory.rva.wrapping_add(directory.size);
    let mut exports = Vec::new();
    for index in 0..number_of_functions {
        let target_rva = match buf.read_u32(functions_offset + index as u64 * 4) {
            Ok(rva) => rva,
            Err(err) => {
                tracing::warn!(index, %err, "export address table truncated, stopping");
                break;
            }
        };
        // zero slots are unused padding in the address table
        if target_rva == 0 {
            continue;
        }

        // an address inside the export directory is a forwarder string, not
        // code
        let target = if target_rva >= directory.rva && target_rva < directory_end {
            match sections
                .rva_to_offset(target_rva)
                .and_then(|offset| buf.read_cstring(offset as u64))
            {
                Ok(forwarder) => ExportTarget::Forwarder(forwarder),
                Err(err) => {
                    tracing::warn!(index, %err, "unreadable forwarder string, skipping");
                    continue;
                }
            }
        } else {
            ExportTarget::Address(sections.image_base() + target_rva as u64)
        };

        exports.push(Export {
            symbol_name: names.remove(&index),
            ordinal: ordinal_base.wrapping_add(index),
            target,
            module_name: module_name.clone(),
        });
    }
    Ok(exports)
}
