//! COFF symbol table and string table decoding.
//!
//! Symbols are fixed 18-byte records. A record's name either fits inline in
//! its first 8 bytes or, when those start with four zero bytes, is an offset
//! into the string table that trails the symbol table. Each record may be
//! followed by auxiliary records whose shape depends on the symbol's storage
//! class and type; the five documented shapes are decoded into a tagged enum
//! and anything else is kept opaque rather than failing the table.

use std::fmt;

use crate::buffer::BufferView;
use crate::error::PeError;
use crate::headers::PeHeader;

pub const SYMBOL_RECORD_SIZE: u64 = 18;

// storage classes that select an auxiliary record shape
const SYM_CLASS_EXTERNAL: u8 = 2;
const SYM_CLASS_STATIC: u8 = 3;
const SYM_CLASS_FUNCTION: u8 = 101;
const SYM_CLASS_FILE: u8 = 103;
const SYM_CLASS_WEAK_EXTERNAL: u8 = 105;
/// Complex-type bits marking a function symbol.
const SYM_TYPE_FUNCTION: u16 = 0x20;
/// Section number of an undefined symbol.
const SYM_UNDEFINED: i16 = 0;

/// How a symbol's name was stored: inline in the record, or in the trailing
/// string table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolName {
    Short([u8; 8]),
    Offset(u32),
}

/// One auxiliary record, decoded by the shape its owning symbol selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuxSymbol {
    /// Follows an external function definition.
    FunctionDefinition {
        tag_index: u32,
        total_size: u32,
        pointer_to_line_number: u32,
        pointer_to_next_function: u32,
    },
    /// Follows a `.bf` or `.ef` record.
    FunctionLines {
        line_number: u16,
        pointer_to_next_function: u32,
    },
    /// Follows a weak external.
    WeakExternal { tag_index: u32, characteristics: u32 },
    /// Follows a `.file` record; the record is the file name.
    File { file_name: String },
    /// Follows a section definition.
    SectionDefinition {
        length: u32,
        number_of_relocations: u16,
        number_of_line_numbers: u16,
        check_sum: u32,
        number: u16,
        selection: u8,
    },
    /// A shape this decoder does not recognize, preserved as raw bytes.
    Opaque([u8; 18]),
}

impl fmt::Display for AuxSymbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuxSymbol::FunctionDefinition {
                tag_index,
                total_size,
                pointer_to_line_number,
                pointer_to_next_function,
            } => write!(
                f,
                "fndef: tag:{:>#8x} size:{:>#8x} lines:{:>#8x} next:{:>#8x}",
                tag_index, total_size, pointer_to_line_number, pointer_to_next_function
            ),
            AuxSymbol::FunctionLines {
                line_number,
                pointer_to_next_function,
            } => write!(f, "lines: line:{} next:{:>#8x}", line_number, pointer_to_next_function),
            AuxSymbol::WeakExternal {
                tag_index,
                characteristics,
            } => write!(f, "weak: tag:{:>#8x} characteristics:{:>#8x}", tag_index, characteristics),
            AuxSymbol::File { file_name } => write!(f, "file: {}", file_name),
            AuxSymbol::SectionDefinition {
                length,
                number_of_relocations,
                number_of_line_numbers,
                selection,
                ..
            } => write!(
                f,
                "section: length:{:>#8x} nreloc:{} nlineno:{} selection:{}",
                length, number_of_relocations, number_of_line_numbers, selection
            ),
            AuxSymbol::Opaque(bytes) => {
                write!(f, "opaque: ")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// One decoded symbol with its resolved name and auxiliary records.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub raw_name: SymbolName,
    pub value: u32,
    /// 1-based section index; 0 undefined, -1 absolute, -2 debug.
    pub section_number: i16,
    pub typ: u16,
    pub storage_class: u8,
    pub aux: Vec<AuxSymbol>,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:<40} | {:>#10x} | {:>5} | {:>5} | {:>5} | {:>2} aux",
            self.name,
            self.value,
            self.section_number,
            self.typ,
            self.storage_class,
            self.aux.len()
        )
    }
}

/// Decodes the symbol table named by the COFF header, if any. Aux records
/// consume symbol-table slots, so the loop advances by `1 + aux_count`. A
/// truncated record ends the table with a warning; earlier symbols are kept.
pub(crate) fn parse(buf: BufferView, header: &PeHeader) -> Vec<Symbol> {
    if header.pointer_to_symbol_table == 0 || header.number_of_symbols == 0 {
        return Vec::new();
    }
    let base = header.pointer_to_symbol_table as u64;
    let count = header.number_of_symbols as u64;
    let strings = string_table(buf, base + count * SYMBOL_RECORD_SIZE);

    let mut symbols = Vec::new();
    let mut index = 0u64;
    while index < count {
        let at = base + index * SYMBOL_RECORD_SIZE;
        let symbol = match read_symbol(buf, at, strings) {
            Ok(symbol) => symbol,
            Err(err) => {
                tracing::warn!(index, %err, "symbol record out of bounds, stopping table");
                break;
            }
        };
        let (mut symbol, aux_count) = symbol;

        for aux_index in 0..aux_count {
            // aux records occupy slots; a count past the declared table end
            // is malformed
            if index + 1 + aux_index >= count {
                tracing::warn!(index, "aux count exceeds symbol table, truncating");
                break;
            }
            let aux_at = at + (1 + aux_index) * SYMBOL_RECORD_SIZE;
            match read_aux(buf, aux_at, &symbol) {
                Ok(aux) => symbol.aux.push(aux),
                Err(err) => {
                    tracing::warn!(index, aux_index, %err, "aux record out of bounds");
                    break;
                }
            }
        }

        index += 1 + aux_count;
        symbols.push(symbol);
    }
    symbols
}

/// The string table trails the symbol table; its first u32 is its own
/// length, terminator included.
fn string_table<'a>(buf: BufferView<'a>, offset: u64) -> Option<BufferView<'a>> {
    let declared = buf.read_u32(offset).ok()?;
    if declared < 4 {
        return None;
    }
    let end = offset + declared as u64;
    if end > buf.len() as u64 {
        tracing::warn!(offset, declared, "string table length escapes file, ignoring table");
        return None;
    }
    buf.split(offset as u32, end as u32).ok()
}

fn read_symbol(
    buf: BufferView,
    at: u64,
    strings: Option<BufferView>,
) -> Result<(Symbol, u64), PeError> {
    let mut name_bytes = [0u8; 8];
    for (i, slot) in name_bytes.iter_mut().enumerate() {
        *slot = buf.read_u8(at + i as u64)?;
    }
    let raw_name = if name_bytes[..4] == [0, 0, 0, 0] {
        SymbolName::Offset(u32::from_le_bytes([
            name_bytes[4],
            name_bytes[5],
            name_bytes[6],
            name_bytes[7],
        ]))
    } else {
        SymbolName::Short(name_bytes)
    };
    let name = resolve_name(&raw_name, strings);

    let value = buf.read_u32(at + 8)?;
    let section_number = buf.read_u16(at + 12)? as i16;
    let typ = buf.read_u16(at + 14)?;
    let storage_class = buf.read_u8(at + 16)?;
    let aux_count = buf.read_u8(at + 17)? as u64;

    Ok((
        Symbol {
            name,
            raw_name,
            value,
            section_number,
            typ,
            storage_class,
            aux: Vec::new(),
        },
        aux_count,
    ))
}

fn resolve_name(raw: &SymbolName, strings: Option<BufferView>) -> String {
    match raw {
        SymbolName::Short(bytes) => {
            let len = bytes.iter().position(|&b| b == 0).unwrap_or(8);
            String::from_utf8_lossy(&bytes[..len]).into_owned()
        }
        SymbolName::Offset(offset) => match strings {
            Some(table) => table
                .read_cstring(*offset as u64)
                .unwrap_or_else(|_| String::new()),
            None => String::new(),
        },
    }
}

/// Selects and decodes the aux shape the owning symbol's class/type imply.
fn read_aux(buf: BufferView, at: u64, owner: &Symbol) -> Result<AuxSymbol, PeError> {
    let is_function_def = owner.storage_class == SYM_CLASS_EXTERNAL
        && owner.typ & SYM_TYPE_FUNCTION != 0
        && owner.section_number > 0;
    let is_weak_external = owner.storage_class == SYM_CLASS_WEAK_EXTERNAL
        || (owner.storage_class == SYM_CLASS_EXTERNAL
            && owner.section_number == SYM_UNDEFINED
            && owner.value == 0);

    if is_function_def {
        return Ok(AuxSymbol::FunctionDefinition {
            tag_index: buf.read_u32(at)?,
            total_size: buf.read_u32(at + 4)?,
            pointer_to_line_number: buf.read_u32(at + 8)?,
            pointer_to_next_function: buf.read_u32(at + 12)?,
        });
    }
    if owner.storage_class == SYM_CLASS_FUNCTION {
        return Ok(AuxSymbol::FunctionLines {
            line_number: buf.read_u16(at + 4)?,
            pointer_to_next_function: buf.read_u32(at + 12)?,
        });
    }
    if is_weak_external {
        return Ok(AuxSymbol::WeakExternal {
            tag_index: buf.read_u32(at)?,
            characteristics: buf.read_u32(at + 4)?,
        });
    }
    if owner.storage_class == SYM_CLASS_FILE {
        let mut bytes = [0u8; 18];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = buf.read_u8(at + i as u64)?;
        }
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(18);
        return Ok(AuxSymbol::File {
            file_name: String::from_utf8_lossy(&bytes[..len]).into_owned(),
        });
    }
    if owner.storage_class == SYM_CLASS_STATIC {
        return Ok(AuxSymbol::SectionDefinition {
            length: buf.read_u32(at)?,
            number_of_relocations: buf.read_u16(at + 4)?,
            number_of_line_numbers: buf.read_u16(at + 6)?,
            check_sum: buf.read_u32(at + 8)?,
            number: buf.read_u16(at + 12)?,
            selection: buf.read_u8(at + 14)?,
        });
    }

    let mut bytes = [0u8; 18];
    for (i, slot) in bytes.iter_mut().enumerate() {
        *slot = buf.read_u8(at + i as u64)?;
    }
    Ok(AuxSymbol::Opaque(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ImageBuffer;

    fn push_symbol(
        bytes: &mut Vec<u8>,
        name: &[u8; 8],
        value: u32,
        section: i16,
        typ: u16,
        class: u8,
        aux: u8,
    ) {
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(&value.to_le_bytes());
        bytes.extend_from_slice(&(section as u16).to_le_bytes());
        bytes.extend_from_slice(&typ.to_le_bytes());
        bytes.push(class);
        bytes.push(aux);
    }

    fn header_with(symbols_at: u32, count: u32) -> PeHeader {
        // only the symbol-table fields matter to this module
        let mut bytes = vec![0u8; 0x200];
        bytes[0] = b'M';
        bytes[1] = b'Z';
        bytes[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());
        bytes[0x40..0x44].copy_from_slice(&crate::headers::NT_SIGNATURE.to_le_bytes());
        bytes[0x4c..0x50].copy_from_slice(&symbols_at.to_le_bytes());
        bytes[0x50..0x54].copy_from_slice(&count.to_le_bytes());
        bytes[0x54..0x56].copy_from_slice(&0xe0u16.to_le_bytes()); // SizeOfOptionalHeader
        bytes[0x58..0x5a].copy_from_slice(&crate::headers::OPTIONAL_MAGIC_PE32.to_le_bytes());
        let buf = ImageBuffer::from_vec(bytes).unwrap();
        PeHeader::parse(buf.view()).unwrap()
    }

    #[test]
    fn decodes_inline_and_long_names_with_aux_shapes() {
        let symbols_at = 0x100usize;
        let mut bytes = vec![0u8; symbols_at];
        // external function with one function-definition aux
        push_symbol(&mut bytes, b"Foo\0\0\0\0\0", 0x10, 1, 0x20, SYM_CLASS_EXTERNAL, 1);
        bytes.extend_from_slice(&1u32.to_le_bytes()); // tag
        bytes.extend_from_slice(&0x40u32.to_le_bytes()); // total size
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 2]);
        // long-named static section symbol with a section-definition aux
        push_symbol(&mut bytes, &[0, 0, 0, 0, 4, 0, 0, 0], 0, 1, 0, SYM_CLASS_STATIC, 1);
        bytes.extend_from_slice(&0x80u32.to_le_bytes()); // length
        bytes.extend_from_slice(&2u16.to_le_bytes()); // nreloc
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // checksum
        bytes.extend_from_slice(&1u16.to_le_bytes()); // number
        bytes.push(0); // selection
        bytes.extend_from_slice(&[0u8; 3]);
        // string table: length + one name
        let name = b"a_rather_long_section_name\0";
        bytes.extend_from_slice(&(4 + name.len() as u32).to_le_bytes());
        bytes.extend_from_slice(name);

        let header = header_with(symbols_at as u32, 4);
        let buf = ImageBuffer::from_vec(bytes).unwrap();
        let symbols = parse(buf.view(), &header);

        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].name, "Foo");
        assert!(matches!(
            symbols[0].aux[0],
            AuxSymbol::FunctionDefinition { total_size: 0x40, .. }
        ));
        assert_eq!(symbols[1].name, "a_rather_long_section_name");
        assert!(matches!(
            symbols[1].aux[0],
            AuxSymbol::SectionDefinition { length: 0x80, number_of_relocations: 2, .. }
        ));
    }

    #[test]
    fn truncated_record_keeps_earlier_symbols() {
        let symbols_at = 0x100usize;
        let mut bytes = vec![0u8; symbols_at];
        push_symbol(&mut bytes, b"whole\0\0\0", 0, 1, 0, SYM_CLASS_STATIC, 0);
        bytes.extend_from_slice(&[0u8; 9]); // half a record, then EOF

        let header = header_with(symbols_at as u32, 2);
        let buf = ImageBuffer::from_vec(bytes).unwrap();
        let symbols = parse(buf.view(), &header);
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "whole");
    }
}
