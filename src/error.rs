use thiserror::Error;

/// What went wrong, as a coarse category. One variant per failure stage so a
/// caller can distinguish "the file would not open" from "the file is not a
/// PE" from "a field pointed outside the buffer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// Unable to open the file.
    #[error("unable to open file")]
    Open,
    /// Unable to query file metadata.
    #[error("unable to query file size")]
    Stat,
    /// Unable to map the file, or the image is larger than 4 GiB.
    #[error("unable to map file")]
    Map,
    /// The buffer could not be materialized in memory.
    #[error("buffer allocation failure")]
    Mem,
    /// A magic number or signature did not match; this is not a PE image.
    #[error("bad magic or signature, not a PE image")]
    Magic,
    /// The DOS/COFF/optional headers are structurally inconsistent.
    #[error("malformed header")]
    Header,
    /// The section table could not be decoded.
    #[error("malformed section table")]
    SectionTable,
    /// No section (and not the header region) contains the given address.
    #[error("address is not covered by any section")]
    AddressNotMapped,
    /// A field read would have escaped the buffer.
    #[error("read past end of buffer")]
    Read,
}

/// A decode failure: the category plus the `module:line` that raised it.
///
/// pe-style parsers historically kept a process-wide last-error code and
/// location; here the same triple (code, location, message) travels inside
/// the error value itself, so concurrent parses cannot interfere.
#[derive(Debug, Clone, Error)]
#[error("{kind} [{location}]")]
pub struct PeError {
    kind: ErrorKind,
    location: &'static str,
}

impl PeError {
    pub(crate) fn new(kind: ErrorKind, location: &'static str) -> PeError {
        PeError { kind, location }
    }

    /// The error category.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Where in the decoder the error was raised, as `module:line`.
    pub fn location(&self) -> &'static str {
        self.location
    }
}

/// Expands to a `&'static str` naming the current module and line.
macro_rules! here {
    () => {
        concat!(module_path!(), ":", line!())
    };
}
pub(crate) use here;

/// Shorthand for raising a [`PeError`] at the current location.
macro_rules! fail {
    ($kind:ident) => {
        return Err(crate::error::PeError::new(
            crate::error::ErrorKind::$kind,
            crate::error::here!(),
        ))
    };
}
pub(crate) use fail;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reports_kind_and_location() {
        let err = PeError::new(ErrorKind::Magic, "somewhere:12");
        assert_eq!(err.kind(), ErrorKind::Magic);
        assert_eq!(err.location(), "somewhere:12");
        let msg = err.to_string();
        assert!(msg.contains("not a PE image"));
        assert!(msg.contains("somewhere:12"));
    }
}
