//! Resource directory tree walker.
//!
//! The resource directory is a three-level tree (type, then name, then
//! language). Each node is a directory header followed by an entry array;
//! an entry either descends into another directory (high bit of its offset
//! set) or lands on a leaf data entry. All offsets inside the tree are
//! relative to the start of the resource directory and attacker-controlled,
//! so every one is bounds-checked, and descent is capped at the three
//! levels the format defines; a fourth level is treated as malformed rather
//! than followed.

use std::fmt;
use std::ops::Range;

use crate::buffer::BufferView;
use crate::error::PeError;
use crate::headers::DataDirectory;
use crate::section::SectionTable;

const DIRECTORY_HEADER_SIZE: u64 = 16;
const DIRECTORY_ENTRY_SIZE: u64 = 8;
const DATA_ENTRY_SIZE: u64 = 16;
/// High bit flagging "the other half of this entry is an offset, not an id".
const SUBDIRECTORY_BIT: u32 = 0x8000_0000;

/// A resource identifier at one tree level: a numeric id or a UTF-16 name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceId {
    Id(u32),
    Name(String),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResourceId::Id(id) => write!(f, "#{}", id),
            ResourceId::Name(name) => write!(f, "{:?}", name),
        }
    }
}

/// Well-known resource type ids at the first tree level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Cursor,
    Bitmap,
    Icon,
    Menu,
    Dialog,
    StringTable,
    FontDir,
    Font,
    Accelerator,
    RcData,
    MessageTable,
    GroupCursor,
    GroupIcon,
    Version,
    DlgInclude,
    PlugPlay,
    Vxd,
    AniCursor,
    AniIcon,
    Html,
    Manifest,
}

impl ResourceType {
    pub fn from_id(id: u32) -> Option<ResourceType> {
        Some(match id {
            1 => ResourceType::Cursor,
            2 => ResourceType::Bitmap,
            3 => ResourceType::Icon,
            4 => ResourceType::Menu,
            5 => ResourceType::Dialog,
            6 => ResourceType::StringTable,
            7 => ResourceType::FontDir,
            8 => ResourceType::Font,
            9 => ResourceType::Accelerator,
            10 => ResourceType::RcData,
            11 => ResourceType::MessageTable,
            12 => ResourceType::GroupCursor,
            14 => ResourceType::GroupIcon,
            16 => ResourceType::Version,
            17 => ResourceType::DlgInclude,
            19 => ResourceType::PlugPlay,
            20 => ResourceType::Vxd,
            21 => ResourceType::AniCursor,
            22 => ResourceType::AniIcon,
            23 => ResourceType::Html,
            24 => ResourceType::Manifest,
            _ => return None,
        })
    }
}

/// One leaf of the resource tree with its full (type, name, language) path.
/// `data` is the file-offset range of the resource bytes, when the leaf's
/// RVA and size resolve inside the file.
#[derive(Debug, Clone)]
pub struct Resource {
    pub type_id: ResourceId,
    pub name: ResourceId,
    pub lang: ResourceId,
    pub codepage: u32,
    pub rva: u32,
    pub size: u32,
    pub data: Option<Range<u32>>,
}

impl Resource {
    /// The well-known type, when the type level is one of the RT_* ids.
    pub fn resource_type(&self) -> Option<ResourceType> {
        match self.type_id {
            ResourceId::Id(id) => ResourceType::from_id(id),
            ResourceId::Name(_) => None,
        }
    }
}

/// Walks the resource data directory. Individual malformed entries are
/// skipped with a warning; only an unresolvable directory RVA empties the
/// whole table.
pub(crate) fn parse(
    buf: BufferView,
    sections: &SectionTable,
    directory: DataDirectory,
) -> Vec<Resource> {
    let base = match sections.rva_to_offset(directory.rva) {
        Ok(offset) => offset,
        Err(err) => {
            tracing::warn!(rva = directory.rva, %err, "resource directory is not mapped");
            return Vec::new();
        }
    };
    let mut resources = Vec::new();
    walk_directory(
        buf,
        sections,
        base,
        0,
        0,
        &mut Vec::new(),
        &mut resources,
    );
    resources
}

/// Reads the length-prefixed UTF-16 string a named entry points at.
fn read_utf16_name(buf: BufferView, base: u32, rel: u32) -> Result<String, PeError> {
    let at = base as u64 + rel as u64;
    let count = buf.read_u16(at)? as u64;
    let mut units = Vec::with_capacity(count as usize);
    for i in 0..count {
        units.push(buf.read_u16(at + 2 + i * 2)?);
    }
    Ok(String::from_utf16_lossy(&units))
}

/// Recursive descent over one directory node. `level` 0 is the type level,
/// 1 the name level, 2 the language level; `rel` is the node's offset
/// relative to the directory base. Depth is bounded by the level check, so
/// a cyclic offset cannot cause non-termination.
fn walk_directory(
    buf: BufferView,
    sections: &SectionTable,
    base: u32,
    rel: u32,
    level: u8,
    path: &mut Vec<ResourceId>,
    out: &mut Vec<Resource>,
) {
    let node = base as u64 + rel as u64;
    let (named, ids) = match (buf.read_u16(node + 12), buf.read_u16(node + 14)) {
        (Ok(named), Ok(ids)) => (named, ids),
        _ => {
            tracing::warn!(rel, level, "resource directory header out of bounds");
            return;
        }
    };

    let entries = named as u64 + ids as u64;
    for index in 0..entries {
        let entry = node + DIRECTORY_HEADER_SIZE + index * DIRECTORY_ENTRY_SIZE;
        let (id_field, offset_field) = match (buf.read_u32(entry), buf.read_u32(entry + 4)) {
            (Ok(id), Ok(offset)) => (id, offset),
            _ => {
                tracing::warn!(rel, level, index, "resource entry out of bounds, stopping node");
                return;
            }
        };

        let id = if id_field & SUBDIRECTORY_BIT != 0 {
            match read_utf16_name(buf, base, id_field & !SUBDIRECTORY_BIT) {
                Ok(name) => ResourceId::Name(name),
                Err(err) => {
                    tracing::warn!(rel, level, index, %err, "unreadable resource name, skipping entry");
                    continue;
                }
            }
        } else {
            ResourceId::Id(id_field)
        };

        if offset_field & SUBDIRECTORY_BIT != 0 {
            // the format fixes the tree at type -> name -> language; a
            // directory below the language level is malformed
            if level >= 2 {
                tracing::warn!(rel, level, index, "resource tree deeper than three levels, skipping");
                continue;
            }
            path.push(id);
            walk_directory(
                buf,
                sections,
                base,
                offset_field & !SUBDIRECTORY_BIT,
                level + 1,
                path,
                out,
            );
            path.pop();
        } else {
            if level != 2 {
                tracing::warn!(rel, level, index, "resource data entry above language level, skipping");
                continue;
            }
            let leaf = base as u64 + offset_field as u64;
            if leaf + DATA_ENTRY_SIZE > buf.len() as u64 {
                tracing::warn!(rel, index, "resource data entry out of bounds, skipping");
                continue;
            }
            let (rva, size, codepage) = match (
                buf.read_u32(leaf),
                buf.read_u32(leaf + 4),
                buf.read_u32(leaf + 8),
            ) {
                (Ok(rva), Ok(size), Ok(codepage)) => (rva, size, codepage),
                _ => continue,
            };
            let data = resolve_data(buf, sections, rva, size);
            out.push(Resource {
                type_id: path.first().cloned().unwrap_or(ResourceId::Id(0)),
                name: path.get(1).cloned().unwrap_or(ResourceId::Id(0)),
                lang: id,
                codepage,
                rva,
                size,
                data,
            });
        }
    }
}

/// Translates a leaf's RVA and clamps its byte range to the file.
fn resolve_data(
    buf: BufferView,
    sections: &SectionTable,
    rva: u32,
    size: u32,
) -> Option<Range<u32>> {
    let start = match sections.rva_to_offset(rva) {
        Ok(start) => start,
        Err(_) => {
            tracing::warn!(rva, size, "resource data rva is not mapped");
            return None;
        }
    };
    let end = start as u64 + size as u64;
    if end > buf.len() as u64 {
        tracing::warn!(rva, size, "resource data extends past end of file");
        return None;
    }
    Some(start..end as u32)
}
