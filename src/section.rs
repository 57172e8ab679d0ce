//! Section table decoding and RVA/VA address translation.

use std::fmt;
use std::ops::Range;

use bitflags::bitflags;

use crate::buffer::BufferView;
use crate::error::{fail, PeError};
use crate::headers::PeHeader;

/// Size of one section header on disk.
const SECTION_HEADER_SIZE: u64 = 40;

bitflags! {
    /// Section header `Characteristics`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionCharacteristics: u32 {
        /// The section contains executable code.
        const CNT_CODE = 0x0000_0020;
        /// The section contains initialized data.
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// The section contains uninitialized data.
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        const LNK_INFO = 0x0000_0200;
        const LNK_REMOVE = 0x0000_0800;
        const LNK_COMDAT = 0x0000_1000;
        const GPREL = 0x0000_8000;
        /// The section contains extended relocations.
        const LNK_NRELOC_OVFL = 0x0100_0000;
        const MEM_DISCARDABLE = 0x0200_0000;
        const MEM_NOT_CACHED = 0x0400_0000;
        const MEM_NOT_PAGED = 0x0800_0000;
        const MEM_SHARED = 0x1000_0000;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;
    }
}

/// One decoded section header. `data` is the section's raw byte range as
/// file offsets, already clamped to the file; `None` when the header claims
/// a range the file does not contain.
#[derive(Debug, Clone)]
pub struct Section {
    /// Up to 8 bytes, NUL-padded in the file.
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: SectionCharacteristics,
    pub data: Option<Range<u32>>,
}

impl Section {
    fn parse(buf: BufferView, offset: u64) -> Result<Section, PeError> {
        let mut raw_name = [0u8; 8];
        for (i, slot) in raw_name.iter_mut().enumerate() {
            *slot = buf.read_u8(offset + i as u64)?;
        }
        let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(8);
        let name = String::from_utf8_lossy(&raw_name[..name_len]).into_owned();

        let virtual_size = buf.read_u32(offset + 8)?;
        let virtual_address = buf.read_u32(offset + 12)?;
        let size_of_raw_data = buf.read_u32(offset + 16)?;
        let pointer_to_raw_data = buf.read_u32(offset + 20)?;
        // relocation/linenumber pointers at +24..+36 only apply to objects
        let characteristics = SectionCharacteristics::from_bits_retain(buf.read_u32(offset + 36)?);

        // Slice out the raw data range, clamped to the file. A section whose
        // raw range escapes the file is recoverable: keep the header, drop
        // the data.
        let data = if pointer_to_raw_data == 0 || size_of_raw_data == 0 {
            None
        } else {
            let end = pointer_to_raw_data as u64 + size_of_raw_data as u64;
            if end <= buf.len() as u64 {
                Some(pointer_to_raw_data..end as u32)
            } else {
                tracing::warn!(
                    section = %name,
                    raw_start = pointer_to_raw_data,
                    raw_size = size_of_raw_data,
                    file_len = buf.len(),
                    "section raw data extends past end of file, dropping data"
                );
                None
            }
        };

        Ok(Section {
            name,
            virtual_size,
            virtual_address,
            size_of_raw_data,
            pointer_to_raw_data,
            characteristics,
            data,
        })
    }

    /// Whether `[VirtualAddress, VirtualAddress + VirtualSize)` contains `rva`.
    fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && (rva - self.virtual_address) < self.virtual_size
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:>8} | {:>#10x}, {:>#10x} | {:>#10x}, {:>#10x} | {:?}",
            self.name,
            self.pointer_to_raw_data,
            self.size_of_raw_data,
            self.virtual_address,
            self.virtual_size,
            self.characteristics
        )
    }
}

/// The decoded section table plus the translation state every directory
/// walker depends on.
#[derive(Debug)]
pub struct SectionTable {
    sections: Vec<Section>,
    image_base: u64,
    size_of_headers: u32,
}

impl SectionTable {
    /// Decodes `NumberOfSections` headers following the optional header.
    /// An out-of-bounds section header aborts the parse; without a coherent
    /// table no address in the image can be translated.
    pub fn parse(buf: BufferView, header: &PeHeader) -> Result<SectionTable, PeError> {
        let base = header.section_table_offset();
        let mut sections = Vec::with_capacity(header.number_of_sections as usize);
        for i in 0..header.number_of_sections as u64 {
            match Section::parse(buf, base + i * SECTION_HEADER_SIZE) {
                Ok(section) => sections.push(section),
                Err(_) => fail!(SectionTable),
            }
        }
        Ok(SectionTable {
            sections,
            image_base: header.image_base,
            size_of_headers: header.size_of_headers,
        })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Translates an RVA to a file offset.
    ///
    /// Sections are scanned in table order and the first containing section
    /// wins; overlapping or unsorted tables are format ambiguities that are
    /// mirrored, not repaired. An RVA below `SizeOfHeaders` resolves into
    /// the header region of the file directly.
    pub fn rva_to_offset(&self, rva: u32) -> Result<u32, PeError> {
        for section in &self.sections {
            if section.contains_rva(rva) {
                let offset =
                    section.pointer_to_raw_data as u64 + (rva - section.virtual_address) as u64;
                if offset > u32::MAX as u64 {
                    fail!(AddressNotMapped);
                }
                return Ok(offset as u32);
            }
        }
        if rva < self.size_of_headers {
            return Ok(rva);
        }
        fail!(AddressNotMapped);
    }

    /// Translates a VA to an RVA by subtracting the image base.
    pub fn va_to_rva(&self, va: u64) -> Result<u32, PeError> {
        if va < self.image_base || va - self.image_base > u32::MAX as u64 {
            fail!(AddressNotMapped);
        }
        Ok((va - self.image_base) as u32)
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn table(sections: Vec<Section>) -> SectionTable {
        SectionTable {
            sections,
            image_base: 0x40_0000,
            size_of_headers: 0x200,
        }
    }

    fn section(name: &str, vaddr: u32, vsize: u32, raw_ptr: u32) -> Section {
        Section {
            name: name.to_owned(),
            virtual_size: vsize,
            virtual_address: vaddr,
            size_of_raw_data: vsize,
            pointer_to_raw_data: raw_ptr,
            characteristics: SectionCharacteristics::empty(),
            data: None,
        }
    }

    #[test]
    fn rva_resolves_through_containing_section() {
        let t = table(vec![
            section(".text", 0x1000, 0x1000, 0x400),
            section(".data", 0x2000, 0x800, 0x1400),
        ]);
        assert_eq!(t.rva_to_offset(0x1000).unwrap(), 0x400);
        assert_eq!(t.rva_to_offset(0x1fff).unwrap(), 0x13ff);
        assert_eq!(t.rva_to_offset(0x2010).unwrap(), 0x1410);
    }

    #[test]
    fn overlapping_sections_resolve_first_in_table_order() {
        // deliberately overlapping and out of address order
        let t = table(vec![
            section("b", 0x2000, 0x1000, 0x3000),
            section("a", 0x1000, 0x2000, 0x400),
        ]);
        // 0x2800 is inside both; the first table entry wins
        assert_eq!(t.rva_to_offset(0x2800).unwrap(), 0x3800);
    }

    #[test]
    fn header_region_is_a_fallback_not_a_section() {
        let t = table(vec![section(".text", 0x1000, 0x1000, 0x400)]);
        assert_eq!(t.rva_to_offset(0x100).unwrap(), 0x100);
        assert_eq!(
            t.rva_to_offset(0x9000).unwrap_err().kind(),
            ErrorKind::AddressNotMapped
        );
    }

    #[test]
    fn va_below_image_base_fails() {
        let t = table(vec![]);
        assert_eq!(t.va_to_rva(0x40_1000).unwrap(), 0x1000);
        assert_eq!(
            t.va_to_rva(0x1000).unwrap_err().kind(),
            ErrorKind::AddressNotMapped
        );
    }
}
