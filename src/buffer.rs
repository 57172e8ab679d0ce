//! The bounded byte buffer every other module reads through.
//!
//! An [`ImageBuffer`] owns the backing bytes, either a read-only file mapping
//! or an in-memory vector. A [`BufferView`] is a borrowed window into an
//! `ImageBuffer` (or into another view); every read is independently
//! bounds-checked and decoded as little-endian at an explicit offset, so a
//! hostile length or pointer in the file can never escape the buffer.

use std::fmt;
use std::fs::File;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;

use crate::error::{fail, PeError};

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

/// An immutable byte buffer holding a whole PE image.
///
/// Lengths are capped at `u32::MAX`; the PE format cannot address file
/// offsets past 4 GiB and the cap keeps all downstream offset arithmetic in
/// a range where `u64` sums cannot overflow.
pub struct ImageBuffer {
    backing: Backing,
}

impl ImageBuffer {
    /// Maps `path` read-only.
    ///
    /// Each stage fails with its own [`ErrorKind`](crate::ErrorKind) so a
    /// caller can tell an unopenable file from an unmappable one.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<ImageBuffer, PeError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(_) => fail!(Open),
        };
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(_) => fail!(Stat),
        };
        if meta.len() > u32::MAX as u64 {
            fail!(Map);
        }
        // Safety: the mapping is read-only and private to this process; all
        // reads go through bounds-checked views of the mapped length.
        let map = match unsafe { Mmap::map(&file) } {
            Ok(map) => map,
            Err(_) => fail!(Map),
        };
        Ok(ImageBuffer {
            backing: Backing::Mapped(map),
        })
    }

    /// Wraps an already-loaded image.
    pub fn from_vec(bytes: Vec<u8>) -> Result<ImageBuffer, PeError> {
        if bytes.len() > u32::MAX as usize {
            fail!(Mem);
        }
        Ok(ImageBuffer {
            backing: Backing::Owned(bytes),
        })
    }

    pub fn len(&self) -> u32 {
        self.bytes().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(map) => map,
            Backing::Owned(vec) => vec,
        }
    }

    /// A view over the whole buffer.
    pub fn view(&self) -> BufferView<'_> {
        BufferView { data: self.bytes() }
    }
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // the backing bytes are megabytes of image; report shape, not content
        f.debug_struct("ImageBuffer")
            .field(
                "backing",
                &match self.backing {
                    Backing::Mapped(_) => "mapped",
                    Backing::Owned(_) => "owned",
                },
            )
            .field("len", &self.len())
            .finish()
    }
}

/// A borrowed, bounds-checked window into an [`ImageBuffer`].
///
/// Views are `Copy` and never own storage; the borrow checker ties their
/// lifetime to the owning buffer, so a view cannot outlive the mapping it
/// reads from.
#[derive(Clone, Copy)]
pub struct BufferView<'a> {
    data: &'a [u8],
}

impl<'a> BufferView<'a> {
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Bounds check for a `width`-byte read at `offset`; returns the start
    /// index into the slice.
    fn check(&self, offset: u64, width: u64) -> Result<usize, PeError> {
        // offset is caller-supplied and may be anywhere in u64 range
        let end = match offset.checked_add(width) {
            Some(end) => end,
            None => fail!(Read),
        };
        if end > self.data.len() as u64 {
            fail!(Read);
        }
        Ok(offset as usize)
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8, PeError> {
        let at = self.check(offset, 1)?;
        Ok(self.data[at])
    }

    pub fn read_u16(&self, offset: u64) -> Result<u16, PeError> {
        let at = self.check(offset, 2)?;
        Ok(LittleEndian::read_u16(&self.data[at..at + 2]))
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32, PeError> {
        let at = self.check(offset, 4)?;
        Ok(LittleEndian::read_u32(&self.data[at..at + 4]))
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64, PeError> {
        let at = self.check(offset, 8)?;
        Ok(LittleEndian::read_u64(&self.data[at..at + 8]))
    }

    /// A sub-view over `[from, to)`. Fails when `to < from` or `to` is past
    /// the end; the result borrows the same storage as `self`.
    pub fn split(&self, from: u32, to: u32) -> Result<BufferView<'a>, PeError> {
        if to < from || to as usize > self.data.len() {
            fail!(Read);
        }
        Ok(BufferView {
            data: &self.data[from as usize..to as usize],
        })
    }

    /// Reads a NUL-terminated byte string at `offset`. The terminator must
    /// lie inside the buffer; non-ASCII bytes are replaced rather than
    /// trusted.
    pub fn read_cstring(&self, offset: u64) -> Result<String, PeError> {
        let start = self.check(offset, 0)?;
        let rest = &self.data[start..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => Ok(String::from_utf8_lossy(&rest[..end]).into_owned()),
            None => fail!(Read),
        }
    }
}
