//! MS-DOS stub, COFF file header, and 32/64-bit optional header decoding.
//!
//! The Microsoft PE format is largely an extension to the COFF format, which
//! is why PE is also sometimes written as PE/COFF; many of these fields have
//! both a COFF name and a Microsoft name. The layout here follows the MSDN
//! PE/COFF documentation, decoded field by field at explicit offsets.

use std::fmt;

use bitflags::bitflags;

use crate::buffer::BufferView;
use crate::error::{fail, PeError};

pub const DOS_MAGIC: u16 = 0x5a4d; // "MZ"
pub const NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const OPTIONAL_MAGIC_PE32: u16 = 0x10b;
pub const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20b;

/// Offset of `e_lfanew` in the DOS header.
const E_LFANEW_OFFSET: u64 = 0x3c;
/// Size of the COFF file header, which follows the PE signature.
const FILE_HEADER_SIZE: u32 = 20;

/// Index constants into the data-directory array.
pub const DIR_EXPORT: usize = 0;
pub const DIR_IMPORT: usize = 1;
pub const DIR_RESOURCE: usize = 2;
pub const DIR_BASERELOC: usize = 5;
/// The format defines at most 16 directories; larger declared counts are
/// clamped rather than trusted.
pub const NUM_DATA_DIRECTORIES: usize = 16;

/// The target machine, also known as `Machine` in MSDN docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    /// Applicable to any machine type (think pure data blobs).
    Unknown,
    /// Intel 386 or later and compatible processors.
    I386,
    /// x64.
    Amd64,
    /// ARM little endian.
    Arm,
    /// ARM Thumb-2 little endian.
    ArmNt,
    /// ARM64 little endian.
    Arm64,
    /// Intel Itanium.
    Ia64,
    /// EFI byte code.
    Ebc,
    /// MIPS little endian.
    R4000,
    /// Power PC little endian.
    PowerPc,
    /// RISC-V 32-bit address space.
    RiscV32,
    /// RISC-V 64-bit address space.
    RiscV64,
    /// Thumb.
    Thumb,
    /// Anything else; the raw value is preserved.
    Other(u16),
}

impl Machine {
    pub fn from_u16(value: u16) -> Machine {
        match value {
            0x0 => Machine::Unknown,
            0x14c => Machine::I386,
            0x8664 => Machine::Amd64,
            0x1c0 => Machine::Arm,
            0x1c4 => Machine::ArmNt,
            0xaa64 => Machine::Arm64,
            0x200 => Machine::Ia64,
            0xebc => Machine::Ebc,
            0x166 => Machine::R4000,
            0x1f0 => Machine::PowerPc,
            0x5032 => Machine::RiscV32,
            0x5064 => Machine::RiscV64,
            0x1c2 => Machine::Thumb,
            v => Machine::Other(v),
        }
    }
}

bitflags! {
    /// COFF file header `Characteristics`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileCharacteristics: u16 {
        const RELOCS_STRIPPED = 0x0001;
        const EXECUTABLE_IMAGE = 0x0002;
        const LINE_NUMS_STRIPPED = 0x0004;
        const LOCAL_SYMS_STRIPPED = 0x0008;
        const LARGE_ADDRESS_AWARE = 0x0020;
        const MACHINE_32BIT = 0x0100;
        const DEBUG_STRIPPED = 0x0200;
        const REMOVABLE_RUN_FROM_SWAP = 0x0400;
        const NET_RUN_FROM_SWAP = 0x0800;
        const SYSTEM = 0x1000;
        const DLL = 0x2000;
        const UP_SYSTEM_ONLY = 0x4000;
    }
}

/// RVA and size of one special structure (exports, imports, resources, ...).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn is_present(&self) -> bool {
        self.rva != 0 && self.size != 0
    }
}

/// The decoded headers of a PE image, 32-bit and 64-bit variants unified
/// into one record. `image_base` and the stack/heap sizes are widened to
/// `u64`; everything else is identical between the two layouts.
#[derive(Debug)]
pub struct PeHeader {
    // COFF file header
    pub machine: Machine,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: FileCharacteristics,

    // optional header, standard + windows-specific fields
    /// 0x10b for PE32, 0x20b for PE32+.
    pub optional_magic: u16,
    pub linker_version: (u8, u8),
    pub size_of_code: u32,
    pub entry_point_rva: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub os_version: (u16, u16),
    pub image_version: (u16, u16),
    pub subsystem_version: (u16, u16),
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub data_directories: Vec<DataDirectory>,

    /// File offset of the `PE\0\0` signature (`e_lfanew`).
    nt_offset: u32,
}

impl PeHeader {
    pub fn is_64bit(&self) -> bool {
        self.optional_magic == OPTIONAL_MAGIC_PE32_PLUS
    }

    /// The data directory at `index`, if it is declared and non-empty.
    pub fn data_directory(&self, index: usize) -> Option<DataDirectory> {
        self.data_directories
            .get(index)
            .copied()
            .filter(DataDirectory::is_present)
    }

    /// File offset of the first section header: signature + file header +
    /// declared optional header size.
    pub fn section_table_offset(&self) -> u64 {
        self.nt_offset as u64 + 4 + FILE_HEADER_SIZE as u64 + self.size_of_optional_header as u64
    }

    /// Decodes the DOS stub far enough to find `e_lfanew`, verifies the
    /// signatures, then decodes the COFF file header and whichever optional
    /// header variant the magic selects. Any out-of-bounds read here is a
    /// hard failure; nothing downstream can be located without the headers.
    pub fn parse(buf: BufferView) -> Result<PeHeader, PeError> {
        if buf.read_u16(0)? != DOS_MAGIC {
            fail!(Magic);
        }
        let nt_offset = buf.read_u32(E_LFANEW_OFFSET)?;
        if buf.read_u32(nt_offset as u64)? != NT_SIGNATURE {
            fail!(Magic);
        }

        let coff = nt_offset as u64 + 4;
        let machine = Machine::from_u16(buf.read_u16(coff)?);
        let number_of_sections = buf.read_u16(coff + 2)?;
        let time_date_stamp = buf.read_u32(coff + 4)?;
        let pointer_to_symbol_table = buf.read_u32(coff + 8)?;
        let number_of_symbols = buf.read_u32(coff + 12)?;
        let size_of_optional_header = buf.read_u16(coff + 16)?;
        let characteristics = FileCharacteristics::from_bits_retain(buf.read_u16(coff + 18)?);

        let opt = coff + FILE_HEADER_SIZE as u64;
        let optional_magic = buf.read_u16(opt)?;
        let is_64 = match optional_magic {
            OPTIONAL_MAGIC_PE32 => false,
            OPTIONAL_MAGIC_PE32_PLUS => true,
            _ => fail!(Magic),
        };

        let linker_version = (buf.read_u8(opt + 2)?, buf.read_u8(opt + 3)?);
        let size_of_code = buf.read_u32(opt + 4)?;
        let entry_point_rva = buf.read_u32(opt + 16)?;
        let base_of_code = buf.read_u32(opt + 20)?;
        // PE32 carries BaseOfData at +24 and a 32-bit ImageBase at +28;
        // PE32+ drops BaseOfData and widens ImageBase to 64 bits at +24.
        let image_base = if is_64 {
            buf.read_u64(opt + 24)?
        } else {
            buf.read_u32(opt + 28)? as u64
        };
        let section_alignment = buf.read_u32(opt + 32)?;
        let file_alignment = buf.read_u32(opt + 36)?;
        let os_version = (buf.read_u16(opt + 40)?, buf.read_u16(opt + 42)?);
        let image_version = (buf.read_u16(opt + 44)?, buf.read_u16(opt + 46)?);
        let subsystem_version = (buf.read_u16(opt + 48)?, buf.read_u16(opt + 50)?);
        let size_of_image = buf.read_u32(opt + 56)?;
        let size_of_headers = buf.read_u32(opt + 60)?;
        let subsystem = buf.read_u16(opt + 68)?;
        let dll_characteristics = buf.read_u16(opt + 70)?;

        // The fixed trailer (stack/heap sizes, loader flags) is 32 or 64 bit
        // wide; only its length matters for locating the directory array.
        let (count_offset, dirs_offset) = if is_64 {
            (opt + 108, opt + 112)
        } else {
            (opt + 92, opt + 96)
        };
        let declared_dirs = buf.read_u32(count_offset)? as usize;
        let dir_count = declared_dirs.min(NUM_DATA_DIRECTORIES);
        // the directory array is part of the optional header; a declared
        // header size too small to contain it is structurally inconsistent
        let needed = (dirs_offset - opt) + dir_count as u64 * 8;
        if (size_of_optional_header as u64) < needed {
            fail!(Header);
        }
        let mut data_directories = Vec::with_capacity(dir_count);
        for i in 0..dir_count {
            let at = dirs_offset + i as u64 * 8;
            data_directories.push(DataDirectory {
                rva: buf.read_u32(at)?,
                size: buf.read_u32(at + 4)?,
            });
        }

        Ok(PeHeader {
            machine,
            number_of_sections,
            time_date_stamp,
            pointer_to_symbol_table,
            number_of_symbols,
            size_of_optional_header,
            characteristics,
            optional_magic,
            linker_version,
            size_of_code,
            entry_point_rva,
            base_of_code,
            image_base,
            section_alignment,
            file_alignment,
            os_version,
            image_version,
            subsystem_version,
            size_of_image,
            size_of_headers,
            subsystem,
            dll_characteristics,
            data_directories,
            nt_offset,
        })
    }
}

impl fmt::Display for PeHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "machine: {:?}, {} sections, {}",
            self.machine,
            self.number_of_sections,
            if self.is_64bit() { "PE32+" } else { "PE32" }
        )?;
        writeln!(
            f,
            "entry: {:#x} (rva {:#x}), image base {:#x}",
            self.image_base + self.entry_point_rva as u64,
            self.entry_point_rva,
            self.image_base
        )?;
        write!(f, "characteristics: {:?}", self.characteristics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ImageBuffer;
    use crate::error::ErrorKind;

    #[test]
    fn rejects_missing_dos_magic() {
        let buf = ImageBuffer::from_vec(vec![0u8; 0x100]).unwrap();
        let err = PeHeader::parse(buf.view()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Magic);
    }

    #[test]
    fn rejects_lfanew_past_end() {
        let mut bytes = vec![0u8; 0x40];
        bytes[0] = b'M';
        bytes[1] = b'Z';
        bytes[0x3c..0x40].copy_from_slice(&0xffff_0000u32.to_le_bytes());
        let buf = ImageBuffer::from_vec(bytes).unwrap();
        let err = PeHeader::parse(buf.view()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Read);
    }

    #[test]
    fn rejects_directory_array_outside_declared_optional_header() {
        let mut bytes = vec![0u8; 0x200];
        bytes[0] = b'M';
        bytes[1] = b'Z';
        bytes[0x3c..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        bytes[0x80..0x84].copy_from_slice(&NT_SIGNATURE.to_le_bytes());
        // 16 directories declared, but the header claims only 0x60 bytes
        bytes[0x94..0x96].copy_from_slice(&0x60u16.to_le_bytes());
        bytes[0x98..0x9a].copy_from_slice(&OPTIONAL_MAGIC_PE32.to_le_bytes());
        bytes[0xf4..0xf8].copy_from_slice(&16u32.to_le_bytes());
        let buf = ImageBuffer::from_vec(bytes).unwrap();
        let err = PeHeader::parse(buf.view()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Header);
    }

    #[test]
    fn rejects_unknown_optional_magic() {
        // valid up to the optional header, then a bogus magic
        let mut bytes = vec![0u8; 0x200];
        bytes[0] = b'M';
        bytes[1] = b'Z';
        bytes[0x3c..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        bytes[0x80..0x84].copy_from_slice(&NT_SIGNATURE.to_le_bytes());
        bytes[0x98..0x9a].copy_from_slice(&0x30bu16.to_le_bytes());
        let buf = ImageBuffer::from_vec(bytes).unwrap();
        let err = PeHeader::parse(buf.view()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Magic);
    }
}
