//! End-to-end tests over a synthetic PE32 image built byte by byte.
//!
//! The fixture is one `.text` section at RVA 0x1000 (file offset 0x200)
//! carrying an export directory (one named export plus one forwarder), an
//! import directory (one named thunk plus one ordinal thunk), a three-level
//! resource tree, one relocation block, and a small COFF symbol table.

use peview::{ErrorKind, ExportTarget, PeFile, RelocKind, ResourceId};

const IMAGE_BASE: u64 = 0x40_0000;
const SECTION_RVA: u32 = 0x1000;
const SECTION_RAW: u32 = 0x200;
const FILE_LEN: usize = 0x1200;

fn put_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_bytes(bytes: &mut [u8], at: usize, value: &[u8]) {
    bytes[at..at + value.len()].copy_from_slice(value);
}

/// File offset of an RVA inside the single section.
fn off(rva: u32) -> usize {
    (rva - SECTION_RVA + SECTION_RAW) as usize
}

fn fixture() -> Vec<u8> {
    let mut b = vec![0u8; FILE_LEN];

    // DOS stub and PE signature
    put_bytes(&mut b, 0, b"MZ");
    put_u32(&mut b, 0x3c, 0x80);
    put_bytes(&mut b, 0x80, b"PE\0\0");

    // COFF file header
    put_u16(&mut b, 0x84, 0x14c); // i386
    put_u16(&mut b, 0x86, 1); // one section
    put_u32(&mut b, 0x8c, 0x1100); // PointerToSymbolTable
    put_u32(&mut b, 0x90, 3); // NumberOfSymbols
    put_u16(&mut b, 0x94, 0xe0); // SizeOfOptionalHeader
    put_u16(&mut b, 0x96, 0x0102); // executable, 32-bit

    // optional header (PE32)
    let opt = 0x98;
    put_u16(&mut b, opt, 0x10b);
    put_u32(&mut b, opt + 16, 0x1000); // AddressOfEntryPoint
    put_u32(&mut b, opt + 20, 0x1000); // BaseOfCode
    put_u32(&mut b, opt + 28, IMAGE_BASE as u32);
    put_u32(&mut b, opt + 32, 0x1000); // SectionAlignment
    put_u32(&mut b, opt + 36, 0x200); // FileAlignment
    put_u32(&mut b, opt + 56, 0x3000); // SizeOfImage
    put_u32(&mut b, opt + 60, 0x200); // SizeOfHeaders
    put_u16(&mut b, opt + 68, 3); // console subsystem
    put_u32(&mut b, opt + 92, 16); // NumberOfRvaAndSizes
    let dirs = opt + 96;
    put_u32(&mut b, dirs, 0x1200); // export
    put_u32(&mut b, dirs + 4, 0x100);
    put_u32(&mut b, dirs + 8, 0x1300); // import
    put_u32(&mut b, dirs + 12, 0x40);
    put_u32(&mut b, dirs + 16, 0x1600); // resource
    put_u32(&mut b, dirs + 20, 0x200);
    put_u32(&mut b, dirs + 40, 0x1800); // base relocations
    put_u32(&mut b, dirs + 44, 0x10);

    // section table: one .text section
    let sec = 0x178;
    put_bytes(&mut b, sec, b".text\0\0\0");
    put_u32(&mut b, sec + 8, 0x1000); // VirtualSize
    put_u32(&mut b, sec + 12, SECTION_RVA);
    put_u32(&mut b, sec + 16, 0x1000); // SizeOfRawData
    put_u32(&mut b, sec + 20, SECTION_RAW);
    put_u32(&mut b, sec + 36, 0x6000_0020); // code | exec | read

    // marker byte at the section start (RVA 0x1000)
    b[off(0x1000)] = 0xcc;

    // export directory at RVA 0x1200
    let exp = off(0x1200);
    put_u32(&mut b, exp + 12, 0x1290); // image name
    put_u32(&mut b, exp + 16, 1); // ordinal base
    put_u32(&mut b, exp + 20, 2); // NumberOfFunctions
    put_u32(&mut b, exp + 24, 1); // NumberOfNames
    put_u32(&mut b, exp + 28, 0x1228); // AddressOfFunctions
    put_u32(&mut b, exp + 32, 0x1240); // AddressOfNames
    put_u32(&mut b, exp + 36, 0x1250); // AddressOfNameOrdinals
    put_u32(&mut b, off(0x1228), 0x1000); // Foo's code
    put_u32(&mut b, off(0x122c), 0x12a0); // inside the directory: forwarder
    put_u32(&mut b, off(0x1240), 0x1280); // name pointer
    put_u16(&mut b, off(0x1250), 0); // name 0 -> address index 0
    put_bytes(&mut b, off(0x1280), b"Foo\0");
    put_bytes(&mut b, off(0x1290), b"fixture.dll\0");
    put_bytes(&mut b, off(0x12a0), b"OTHER.Func\0");

    // import directory at RVA 0x1300: one descriptor, zero terminator
    let imp = off(0x1300);
    put_u32(&mut b, imp, 0x1330); // OriginalFirstThunk
    put_u32(&mut b, imp + 12, 0x1360); // module name
    put_u32(&mut b, imp + 16, 0x1340); // FirstThunk
    put_u32(&mut b, off(0x1330), 0x1370); // hint/name thunk
    put_u32(&mut b, off(0x1334), 0x8000_0005); // ordinal thunk
    put_bytes(&mut b, off(0x1360), b"USER32.dll\0");
    put_u16(&mut b, off(0x1370), 0x12); // hint
    put_bytes(&mut b, off(0x1372), b"MessageBoxA\0");

    // resource tree at RVA 0x1600: named type -> id name -> id language
    let rsrc = off(0x1600);
    put_u16(&mut b, rsrc + 12, 1); // root: one named entry
    put_u32(&mut b, rsrc + 16, 0x8000_0060); // name at rel 0x60
    put_u32(&mut b, rsrc + 20, 0x8000_0020); // subdirectory at rel 0x20
    put_u16(&mut b, rsrc + 0x20 + 14, 1); // name level: one id entry
    put_u32(&mut b, rsrc + 0x30, 7);
    put_u32(&mut b, rsrc + 0x34, 0x8000_0040);
    put_u16(&mut b, rsrc + 0x40 + 14, 1); // language level: one id entry
    put_u32(&mut b, rsrc + 0x50, 0x409);
    put_u32(&mut b, rsrc + 0x54, 0x70); // leaf data entry at rel 0x70
    put_u16(&mut b, rsrc + 0x60, 4); // name: length-prefixed UTF-16 "DATA"
    for (i, ch) in "DATA".encode_utf16().enumerate() {
        put_u16(&mut b, rsrc + 0x62 + i * 2, ch);
    }
    put_u32(&mut b, rsrc + 0x70, 0x1700); // leaf rva
    put_u32(&mut b, rsrc + 0x74, 8); // leaf size
    put_bytes(&mut b, off(0x1700), b"RSRCDATA");

    // one relocation block at RVA 0x1800: HIGHLOW + absolute padding
    let rel = off(0x1800);
    put_u32(&mut b, rel, 0x1000); // page rva
    put_u32(&mut b, rel + 4, 12); // SizeOfBlock
    put_u16(&mut b, rel + 8, 0x3010); // HIGHLOW at page+0x10
    put_u16(&mut b, rel + 10, 0); // padding entry, never emitted

    // COFF symbol table at file offset 0x1100: three records
    let sym = 0x1100;
    put_bytes(&mut b, sym, b"Bar\0\0\0\0\0");
    put_u32(&mut b, sym + 8, 0x20);
    put_u16(&mut b, sym + 12, 1);
    b[sym + 16] = 3; // static, no aux
    put_bytes(&mut b, sym + 18, b".file\0\0\0");
    b[sym + 18 + 16] = 103; // file
    b[sym + 18 + 17] = 1; // one aux record: the file name
    put_bytes(&mut b, sym + 36, b"fix.c\0");
    put_u32(&mut b, sym + 54, 4); // empty string table

    b
}

#[test]
fn headers_decode() {
    let pe = PeFile::parse_bytes(fixture()).unwrap();
    assert_eq!(pe.header().machine, peview::Machine::I386);
    assert_eq!(pe.header().number_of_sections, 1);
    assert!(!pe.header().is_64bit());
    assert_eq!(pe.header().image_base, IMAGE_BASE);
    assert_eq!(pe.header().size_of_headers, 0x200);
    assert_eq!(pe.entry_point(), 0x40_1000);
}

#[test]
fn not_a_pe_is_a_magic_error() {
    let err = PeFile::parse_bytes(vec![0x7f; 0x400]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Magic);
    assert!(!err.location().is_empty());
}

#[test]
fn rva_of_section_start_maps_to_raw_pointer() {
    let pe = PeFile::parse_bytes(fixture()).unwrap();
    for section in pe.sections() {
        assert_eq!(
            pe.rva_to_offset(section.virtual_address).unwrap(),
            section.pointer_to_raw_data
        );
    }
    // header region fallback, and an unmapped rva
    assert_eq!(pe.rva_to_offset(0x84).unwrap(), 0x84);
    assert_eq!(
        pe.rva_to_offset(0x9_0000).unwrap_err().kind(),
        ErrorKind::AddressNotMapped
    );
}

#[test]
fn byte_at_va_reads_through_translation() {
    let pe = PeFile::parse_bytes(fixture()).unwrap();
    assert_eq!(pe.byte_at_va(0x40_1000).unwrap(), 0xcc);
    assert!(pe.byte_at_va(0x1000).is_err()); // below image base
}

#[test]
fn named_export_resolves_to_va() {
    let pe = PeFile::parse_bytes(fixture()).unwrap();
    let foo = &pe.exports()[0];
    assert_eq!(foo.symbol_name.as_deref(), Some("Foo"));
    assert_eq!(foo.module_name, "fixture.dll");
    assert_eq!(foo.ordinal, 1);
    assert_eq!(foo.target, ExportTarget::Address(0x40_1000));
}

#[test]
fn export_into_directory_range_is_a_forwarder() {
    let pe = PeFile::parse_bytes(fixture()).unwrap();
    let fwd = &pe.exports()[1];
    assert_eq!(fwd.symbol_name, None);
    assert_eq!(fwd.ordinal, 2);
    assert_eq!(fwd.target, ExportTarget::Forwarder("OTHER.Func".to_owned()));
}

#[test]
fn lying_export_name_count_terminates() {
    let mut bytes = fixture();
    // NumberOfNames claims ~4 billion entries; the tables end long before
    put_u32(&mut bytes, off(0x1218), 0xffff_ffff);
    let pe = PeFile::parse_bytes(bytes).unwrap();
    assert_eq!(pe.exports().len(), 2);
}

#[test]
fn imports_classify_name_and_ordinal_thunks() {
    let pe = PeFile::parse_bytes(fixture()).unwrap();
    assert_eq!(pe.imports().len(), 2);
    let by_name = &pe.imports()[0];
    assert_eq!(by_name.module_name, "USER32.dll");
    assert_eq!(by_name.symbol_name, "MessageBoxA");
    assert_eq!(by_name.address, IMAGE_BASE + 0x1340);
    let by_ordinal = &pe.imports()[1];
    assert_eq!(by_ordinal.symbol_name, "ORDINAL 5");
    assert_eq!(by_ordinal.address, IMAGE_BASE + 0x1344);
}

#[test]
fn resource_tree_walks_three_levels() {
    let pe = PeFile::parse_bytes(fixture()).unwrap();
    assert_eq!(pe.resources().len(), 1);
    let res = &pe.resources()[0];
    assert_eq!(res.type_id, ResourceId::Name("DATA".to_owned()));
    assert_eq!(res.name, ResourceId::Id(7));
    assert_eq!(res.lang, ResourceId::Id(0x409));
    assert_eq!(res.size, 8);
    assert_eq!(pe.resource_data(res).unwrap(), b"RSRCDATA");
}

#[test]
fn reloc_block_skips_absolute_padding() {
    let pe = PeFile::parse_bytes(fixture()).unwrap();
    assert_eq!(pe.relocs().len(), 1);
    assert_eq!(pe.relocs()[0].address, 0x40_1010);
    assert_eq!(pe.relocs()[0].kind, RelocKind::HighLow);
}

#[test]
fn empty_reloc_block_yields_no_entries() {
    let mut bytes = fixture();
    // shrink the block to a bare header; still a valid list
    put_u32(&mut bytes, off(0x1804), 8);
    put_u32(&mut bytes, 0x98 + 96 + 44, 8); // directory size
    let pe = PeFile::parse_bytes(bytes).unwrap();
    assert!(pe.relocs().is_empty());
}

#[test]
fn symbol_table_decodes_with_file_aux() {
    let pe = PeFile::parse_bytes(fixture()).unwrap();
    assert_eq!(pe.symbols().len(), 2);
    assert_eq!(pe.symbols()[0].name, "Bar");
    assert_eq!(pe.symbols()[0].value, 0x20);
    let file_sym = &pe.symbols()[1];
    assert_eq!(file_sym.name, ".file");
    assert_eq!(
        file_sym.aux[0],
        peview::AuxSymbol::File {
            file_name: "fix.c".to_owned()
        }
    );
}

#[test]
fn truncated_section_keeps_parsing_without_its_data() {
    let mut bytes = fixture();
    // claim more raw data than the file holds
    put_u32(&mut bytes, 0x178 + 16, 0x2000);
    let pe = PeFile::parse_bytes(bytes).unwrap();
    let section = &pe.sections()[0];
    assert_eq!(section.size_of_raw_data, 0x2000);
    assert!(section.data.is_none());
    assert!(pe.section_data(section).is_none());
    // the rest of the image still decoded
    assert_eq!(pe.header().machine, peview::Machine::I386);
    assert_eq!(pe.exports().len(), 2);
}

#[test]
fn section_data_matches_declared_range() {
    let pe = PeFile::parse_bytes(fixture()).unwrap();
    let section = &pe.sections()[0];
    let data = pe.section_data(section).unwrap();
    assert_eq!(data.len(), 0x1000);
    assert_eq!(data[0], 0xcc);
}
