//! A read-only structural decoder for Windows PE/COFF images.
//!
//! The input is an arbitrary, untrusted byte buffer; the output is an
//! immutable [`PeFile`] holding the decoded headers, section table,
//! resources, imports, exports, base relocations, and COFF symbols. Every
//! offset, count, and size is read from the file itself and validated
//! against the buffer before use: nothing is executed, relocated, or
//! trusted.
//!
//! Failure is confined by structure. Header or section-table corruption
//! aborts the parse, because nothing downstream can be located without
//! them; a malformed individual resource, import module, relocation block,
//! or symbol is skipped with a `tracing` warning and the rest of the image
//! still decodes.

pub mod buffer;
mod error;
pub mod export;
pub mod headers;
pub mod import;
pub mod reloc;
pub mod resource;
pub mod section;
pub mod symbol;

use std::fmt;
use std::ops::Range;
use std::path::Path;

pub use buffer::{BufferView, ImageBuffer};
pub use error::{ErrorKind, PeError};
pub use export::{Export, ExportTarget};
pub use headers::{DataDirectory, FileCharacteristics, Machine, PeHeader};
pub use import::Import;
pub use reloc::{Reloc, RelocKind};
pub use resource::{Resource, ResourceId, ResourceType};
pub use section::{Section, SectionCharacteristics, SectionTable};
pub use symbol::{AuxSymbol, Symbol, SymbolName};

use headers::{DIR_BASERELOC, DIR_EXPORT, DIR_IMPORT, DIR_RESOURCE};

/// A fully parsed PE image: the owned file bytes plus every decoded
/// collection. Immutable after construction; safe to share across threads.
#[derive(Debug)]
pub struct PeFile {
    buffer: ImageBuffer,
    header: PeHeader,
    sections: SectionTable,
    resources: Vec<Resource>,
    imports: Vec<Import>,
    exports: Vec<Export>,
    relocs: Vec<Reloc>,
    symbols: Vec<Symbol>,
}

impl PeFile {
    /// Maps `path` read-only and parses it.
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<PeFile, PeError> {
        PeFile::parse(ImageBuffer::open(path)?)
    }

    /// Parses an image already held in memory.
    pub fn parse_bytes(bytes: Vec<u8>) -> Result<PeFile, PeError> {
        PeFile::parse(ImageBuffer::from_vec(bytes)?)
    }

    /// Runs the whole decode pipeline: headers, section table, then each
    /// data directory and the symbol table over the translated addresses.
    /// Returns either a complete model or a single terminal error; callers
    /// never observe a partially constructed image.
    pub fn parse(buffer: ImageBuffer) -> Result<PeFile, PeError> {
        let view = buffer.view();
        let header = PeHeader::parse(view)?;
        let sections = SectionTable::parse(view, &header)?;

        let resources = match header.data_directory(DIR_RESOURCE) {
            Some(dir) => resource::parse(view, &sections, dir),
            None => Vec::new(),
        };
        let imports = match header.data_directory(DIR_IMPORT) {
            Some(dir) => import::parse(view, &sections, &header, dir),
            None => Vec::new(),
        };
        let exports = match header.data_directory(DIR_EXPORT) {
            Some(dir) => export::parse(view, &sections, dir),
            None => Vec::new(),
        };
        let relocs = match header.data_directory(DIR_BASERELOC) {
            Some(dir) => reloc::parse(view, &sections, dir),
            None => Vec::new(),
        };
        let symbols = symbol::parse(view, &header);

        Ok(PeFile {
            buffer,
            header,
            sections,
            resources,
            imports,
            exports,
            relocs,
            symbols,
        })
    }

    pub fn header(&self) -> &PeHeader {
        &self.header
    }

    /// Sections in table order.
    pub fn sections(&self) -> &[Section] {
        self.sections.sections()
    }

    /// Resource leaves in tree order (type, name, language).
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Import thunks in descriptor order.
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    /// Exports in address-table order.
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    /// Relocation sites in block order, type-0 padding already dropped.
    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    /// COFF symbols, when the image carries a symbol table.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// A section's raw bytes, when its declared range fit inside the file.
    pub fn section_data(&self, section: &Section) -> Option<&[u8]> {
        self.range_bytes(section.data.clone())
    }

    /// A resource leaf's bytes, when its RVA and size resolved.
    pub fn resource_data(&self, res: &Resource) -> Option<&[u8]> {
        self.range_bytes(res.data.clone())
    }

    fn range_bytes(&self, range: Option<Range<u32>>) -> Option<&[u8]> {
        let range = range?;
        Some(&self.buffer.bytes()[range.start as usize..range.end as usize])
    }

    /// Translates an RVA to a file offset through the section table.
    pub fn rva_to_offset(&self, rva: u32) -> Result<u32, PeError> {
        self.sections.rva_to_offset(rva)
    }

    /// Translates a VA to an RVA against the image base.
    pub fn va_to_rva(&self, va: u64) -> Result<u32, PeError> {
        self.sections.va_to_rva(va)
    }

    /// The byte the image would hold at `va` once loaded at its preferred
    /// base.
    pub fn byte_at_va(&self, va: u64) -> Result<u8, PeError> {
        let rva = self.sections.va_to_rva(va)?;
        let offset = self.sections.rva_to_offset(rva)?;
        self.buffer.view().read_u8(offset as u64)
    }

    /// The entry point as a VA: entry RVA plus image base.
    pub fn entry_point(&self) -> u64 {
        self.header.image_base + self.header.entry_point_rva as u64
    }
}

impl fmt::Display for PeFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.header)?;
        writeln!(f, "{:>8} | {:>10}  {:>10} | {:>10}  {:>10} |", "name", "raw off", "raw size", "vaddr", "vsize")?;
        for section in self.sections() {
            writeln!(f, "{}", section)?;
        }
        for import in self.imports() {
            writeln!(f, "import: {}", import)?;
        }
        for export in self.exports() {
            writeln!(f, "export: {}", export)?;
        }
        for res in self.resources() {
            writeln!(
                f,
                "resource: {} / {} / {} ({} bytes at rva {:#x})",
                res.type_id, res.name, res.lang, res.size, res.rva
            )?;
        }
        for reloc in self.relocs() {
            writeln!(f, "reloc: {}", reloc)?;
        }
        if !self.symbols().is_empty() {
            writeln!(f, "{:^40} | value      | scnum | type  | class | aux", "symbols")?;
            for symbol in self.symbols() {
                writeln!(f, "{}", symbol)?;
                for aux in &symbol.aux {
                    writeln!(f, "  {}", aux)?;
                }
            }
        }
        Ok(())
    }
}
