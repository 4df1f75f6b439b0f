//! Code specific to the PyInstaller archive format.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`read`] module.
//!
//! The format is defined by the PyInstaller bootloader
//! (`pyi_archive.h` and friends), not by any published standard,
//! so the constants below are pinned against the bootloader's structs.
//! Most comments quote those structs.
//! Unlike ZIP and friends, all integer fields are **big-endian**.
//!
//! [`read`]: ../read/index.html

use std::convert::TryInto;
use std::fmt;

use log::*;
use memchr::memmem;

use crate::result::*;

/// The magic that opens the archive cookie: `'MEI\014\013\012\013\016'`
pub const COOKIE_MAGIC: [u8; 8] = [b'M', b'E', b'I', 0x0c, 0x0b, 0x0a, 0x0b, 0x0e];

/// Size of the cookie without the Python library name field
pub const NARROW_COOKIE_SIZE: usize = 24;

/// Size of the Python library name field in newer cookies
pub const PYLIB_NAME_SIZE: usize = 64;

/// Size of the cookie with the Python library name field
pub const WIDE_COOKIE_SIZE: usize = NARROW_COOKIE_SIZE + PYLIB_NAME_SIZE;

/// Fixed-size prefix of a TOC record, before its variable-length name
pub const TOC_RECORD_FIXED_SIZE: usize = 18;

/// How far from the end of the file we're willing to search for the cookie.
///
/// The cookie is the last thing the build tool writes, but code signing
/// (and other appenders) can add data after it, so it isn't guaranteed
/// to sit at the very end.
pub const COOKIE_SEARCH_WINDOW: usize = 1024 * 1024;

// Straight from the Rust docs:

/// Reads a big-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_be_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a byte from the front of the provided slice, shrinking it.
fn read_u8(input: &mut &[u8]) -> u8 {
    let (byte, rest) = input.split_at(1);
    *input = rest;
    byte[0]
}

/// The version of the interpreter that produced the archive's bytecode,
/// as recorded in the cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PythonVersion {
    pub major: u8,
    pub minor: u8,
}

impl PythonVersion {
    /// Decodes the cookie's version field.
    ///
    /// Current build tools store `MAJOR * 100 + MINOR` (e.g. 310 for 3.10);
    /// older ones stored `MAJOR * 10 + MINOR` (e.g. 27 for 2.7).
    /// Values under 100 can only be the old encoding.
    pub fn from_cookie_field(raw: u32) -> Self {
        let (major, minor) = if raw >= 100 {
            (raw / 100, raw % 100)
        } else {
            (raw / 10, raw % 10)
        };
        // A garbage field can decode to huge numbers; saturate instead of
        // wrapping so it can't masquerade as a real version.
        Self {
            major: u8::try_from(major).unwrap_or(u8::MAX),
            minor: u8::try_from(minor).unwrap_or(u8::MAX),
        }
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Which of the two historical cookie layouts an archive uses.
///
/// The layouts share their integer fields; the wide one appends the name
/// of the Python shared library the bootloader should load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieFormat {
    /// 24 bytes, no library name (old bootloaders)
    Narrow,
    /// 88 bytes, with a 64-byte NUL-padded library name
    Wide,
}

impl CookieFormat {
    pub fn size_in_file(self) -> usize {
        match self {
            CookieFormat::Narrow => NARROW_COOKIE_SIZE,
            CookieFormat::Wide => WIDE_COOKIE_SIZE,
        }
    }
}

/// Data from the archive cookie
///
/// Found near the back of a frozen executable, this locates the embedded
/// package and its table of contents, in the spirit of ZIP's end of central
/// directory record.
#[derive(Debug)]
pub struct ArchiveCookie {
    pub format: CookieFormat,
    /// Length of the entire package, *including* this cookie
    pub package_length: u64,
    /// Position of the TOC relative to the start of the package
    pub toc_offset: u64,
    /// Length of the TOC in bytes
    pub toc_length: u64,
    pub python_version: PythonVersion,
    /// Filename of the Python shared library (wide cookies only)
    pub python_lib_name: Option<String>,
}

impl ArchiveCookie {
    /// Parses a cookie from a slice starting at its magic,
    /// self-detecting which of the two layouts applies.
    pub fn parse(cookie: &[u8]) -> ExtractResult<Self> {
        // From the bootloader's pyi_archive.h:
        //
        // typedef struct _cookie {
        //     char     magic[8];      /* 'MEI\014\013\012\013\016' */
        //     uint32_t len;           /* len of entire package */
        //     uint32_t TOC;           /* pos (rel to start) of TableOfContents */
        //     uint32_t TOClen;        /* length of TableOfContents */
        //     uint32_t pyvers;        /* new (MAJOR*100+MINOR) or old (MAJOR*10+MINOR) */
        //     char     pylibname[64]; /* Filename of Python dynamic library */
        // } COOKIE;
        //
        // The pylibname field was added partway through the format's life,
        // and nothing in the cookie says whether it's present.
        // Probe for it: the field always names some libpython variant.

        if cookie.len() < NARROW_COOKIE_SIZE {
            return Err(ExtractError::Format(format!(
                "Truncated cookie: {} bytes, need at least {NARROW_COOKIE_SIZE}",
                cookie.len()
            )));
        }
        if cookie[..8] != COOKIE_MAGIC {
            return Err(ExtractError::Format(format!(
                "Bad cookie magic {:02x?}",
                &cookie[..8]
            )));
        }
        let mut fields = &cookie[8..];
        let package_length = read_u32(&mut fields) as u64;
        let toc_offset = read_u32(&mut fields) as u64;
        let toc_length = read_u32(&mut fields) as u64;
        let python_version = PythonVersion::from_cookie_field(read_u32(&mut fields));

        let lib_name = if cookie.len() >= WIDE_COOKIE_SIZE {
            lib_name_of(&cookie[NARROW_COOKIE_SIZE..WIDE_COOKIE_SIZE])
        } else {
            None
        };
        let format = if lib_name.is_some() {
            CookieFormat::Wide
        } else {
            CookieFormat::Narrow
        };

        // Sanity that doesn't need the file size
        // (the read module checks the rest against it):
        let toc_end = toc_offset
            .checked_add(toc_length)
            .filter(|end| *end <= package_length)
            .ok_or_else(|| {
                ExtractError::Format(format!(
                    "TOC at {toc_offset}+{toc_length} overruns package of {package_length} bytes",
                ))
            })?;
        if toc_length == 0 || toc_end == 0 {
            return Err(ExtractError::Format("Cookie declares an empty TOC".into()));
        }

        Ok(Self {
            format,
            package_length,
            toc_offset,
            toc_length,
            python_version,
            python_lib_name: lib_name,
        })
    }

    pub fn size_in_file(&self) -> usize {
        self.format.size_in_file()
    }
}

/// Decodes the 64-byte pylibname field, or returns `None` if the bytes
/// don't look like one (meaning the cookie is the narrow layout and these
/// bytes belong to whatever follows it).
fn lib_name_of(field: &[u8]) -> Option<String> {
    let until_nul = match field.iter().position(|&b| b == 0) {
        Some(n) => &field[..n],
        None => field,
    };
    let name = std::str::from_utf8(until_nul).ok()?;
    // Every bootloader ships some libpython variant here
    // (libpython3.10.so.1.0, python310.dll, ...).
    if name.to_ascii_lowercase().contains("python") {
        Some(name.to_owned())
    } else {
        None
    }
}

/// Searches backward through the tail of `mapping` for archive cookies,
/// yielding candidate positions (absolute offsets of the magic).
///
/// Candidates, not a single answer: appended data after the cookie could
/// contain a stray copy of the magic, so the caller should keep trying
/// until one decodes and validates.
pub fn cookie_candidates(mapping: &[u8]) -> impl Iterator<Item = usize> + '_ {
    let window_start = mapping.len().saturating_sub(COOKIE_SEARCH_WINDOW);
    memmem::rfind_iter(&mapping[window_start..], &COOKIE_MAGIC)
        .map(move |posit| posit + window_start)
}

/// What a TOC record says its payload is.
///
/// The codes come from the build tool's CArchive writer;
/// codes we don't know are passed through so their payloads
/// can still be dumped verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// `m`: compiled module, headerless bytecode
    Module,
    /// `M`: compiled package `__init__`, headerless bytecode
    PackageModule,
    /// `s`: entry-point script, headerless bytecode
    Script,
    /// `x`: arbitrary data file
    DataFile,
    /// `b`: shared library or other binary
    Binary,
    /// `z` or `Z`: nested zlib archive of frozen modules (a PYZ)
    ZlibArchive,
    /// `l`: splash screen resources
    Splash,
    /// `o`: runtime option for the bootloader, no payload of interest
    RuntimeOption,
    /// `d`: binary dependency reference into another archive, no payload
    Dependency,
    Unknown(u8),
}

impl EntryKind {
    pub fn from_type_code(code: u8) -> Self {
        match code {
            b'm' => EntryKind::Module,
            b'M' => EntryKind::PackageModule,
            b's' => EntryKind::Script,
            b'x' => EntryKind::DataFile,
            b'b' => EntryKind::Binary,
            b'z' | b'Z' => EntryKind::ZlibArchive,
            b'l' => EntryKind::Splash,
            b'o' => EntryKind::RuntimeOption,
            b'd' => EntryKind::Dependency,
            other => EntryKind::Unknown(other),
        }
    }

    /// True for payloads that are compiled bytecode with no file header.
    pub fn is_bytecode(self) -> bool {
        matches!(
            self,
            EntryKind::Module | EntryKind::PackageModule | EntryKind::Script
        )
    }
}

/// Data from one TOC record
///
/// Each record describes one file or module embedded in the package.
#[derive(Debug)]
pub struct TocRecord {
    /// Size of this record in the TOC, including the name
    pub entry_length: u32,
    /// Position of the payload relative to the start of the package
    pub data_offset: u32,
    pub compressed_length: u32,
    pub uncompressed_length: u32,
    pub compressed: bool,
    pub kind: EntryKind,
    /// The stored name, NUL-trimmed. May contain path separators;
    /// sanitize before using it as a filesystem path.
    pub name: String,
}

impl TocRecord {
    /// Parses one record from the front of the TOC slice, consuming it.
    ///
    /// `record_offset` is the record's absolute position in the file,
    /// used only for error context.
    pub fn parse_and_consume(toc: &mut &[u8], record_offset: u64) -> ExtractResult<Self> {
        // From the bootloader's pyi_archive.h:
        //
        // typedef struct _toc {
        //     uint32_t structlen;  /* len of this one - including full len of name */
        //     uint32_t pos;        /* pos rel to start of concatenation */
        //     uint32_t len;        /* len of the data (compressed) */
        //     uint32_t ulen;       /* len of data (uncompressed) */
        //     char     cflag;      /* is it compressed (1 = yes) */
        //     char     typcd;      /* type code - see above */
        //     char     name[1];    /* the name to save it as */
        //                          /* starting in v5, we stretch this out, NUL terminated */
        // } TOC;
        if toc.len() < TOC_RECORD_FIXED_SIZE {
            return Err(ExtractError::Format(format!(
                "Truncated TOC record at offset {record_offset}: {} bytes left",
                toc.len()
            )));
        }
        let entry_length = read_u32(toc);
        let name_length = (entry_length as usize)
            .checked_sub(TOC_RECORD_FIXED_SIZE)
            .ok_or_else(|| {
                ExtractError::Format(format!(
                    "TOC record at offset {record_offset} declares impossible length {entry_length}",
                ))
            })?;
        let data_offset = read_u32(toc);
        let compressed_length = read_u32(toc);
        let uncompressed_length = read_u32(toc);
        let compression_flag = read_u8(toc);
        let type_code = read_u8(toc);
        if name_length > toc.len() {
            return Err(ExtractError::Format(format!(
                "TOC record at offset {record_offset} overruns the TOC: \
                 name of {name_length} bytes with {} left",
                toc.len()
            )));
        }
        let (name_bytes, rest) = toc.split_at(name_length);
        *toc = rest;

        let until_nul = match name_bytes.iter().position(|&b| b == 0) {
            Some(n) => &name_bytes[..n],
            None => name_bytes,
        };
        let name = match std::str::from_utf8(until_nul) {
            Ok(s) => s.to_owned(),
            Err(_) => {
                let lossy = String::from_utf8_lossy(until_nul).into_owned();
                warn!("TOC record at offset {record_offset} has a non-UTF-8 name; using {lossy:?}");
                lossy
            }
        };

        Ok(Self {
            entry_length,
            data_offset,
            compressed_length,
            uncompressed_length,
            compressed: compression_flag != 0,
            kind: EntryKind::from_type_code(type_code),
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_field_decodes_both_encodings() {
        assert_eq!(
            PythonVersion::from_cookie_field(27),
            PythonVersion { major: 2, minor: 7 }
        );
        assert_eq!(
            PythonVersion::from_cookie_field(38),
            PythonVersion { major: 3, minor: 8 }
        );
        assert_eq!(
            PythonVersion::from_cookie_field(310),
            PythonVersion {
                major: 3,
                minor: 10
            }
        );
    }

    #[test]
    fn garbage_version_field_saturates() {
        let version = PythonVersion::from_cookie_field(u32::MAX);
        assert_eq!(version.major, u8::MAX);
        assert!(crate::pyc::magic_bytes(version).is_none());
    }

    fn cookie_bytes(package: u32, toc: u32, toc_len: u32, pyvers: u32) -> Vec<u8> {
        let mut buf = COOKIE_MAGIC.to_vec();
        buf.extend_from_slice(&package.to_be_bytes());
        buf.extend_from_slice(&toc.to_be_bytes());
        buf.extend_from_slice(&toc_len.to_be_bytes());
        buf.extend_from_slice(&pyvers.to_be_bytes());
        buf
    }

    #[test]
    fn wide_cookie_detected_by_lib_name() {
        let mut buf = cookie_bytes(1000, 900, 100, 310);
        let mut lib = [0u8; PYLIB_NAME_SIZE];
        lib[..16].copy_from_slice(b"libpython3.10.so");
        buf.extend_from_slice(&lib);

        let cookie = ArchiveCookie::parse(&buf).unwrap();
        assert_eq!(cookie.format, CookieFormat::Wide);
        assert_eq!(cookie.package_length, 1000);
        assert_eq!(cookie.toc_offset, 900);
        assert_eq!(cookie.toc_length, 100);
        assert_eq!(cookie.python_lib_name.as_deref(), Some("libpython3.10.so"));
    }

    #[test]
    fn narrow_cookie_when_no_lib_name_follows() {
        // 64 bytes of trailing junk that isn't a library name
        let mut buf = cookie_bytes(1000, 900, 100, 27);
        buf.extend_from_slice(&[0xAA; PYLIB_NAME_SIZE]);

        let cookie = ArchiveCookie::parse(&buf).unwrap();
        assert_eq!(cookie.format, CookieFormat::Narrow);
        assert_eq!(cookie.python_lib_name, None);
        assert_eq!(
            cookie.python_version,
            PythonVersion { major: 2, minor: 7 }
        );
    }

    #[test]
    fn parse_wants_a_magic_anchored_slice() {
        match ArchiveCookie::parse(b"") {
            Err(ExtractError::Format(_)) => {}
            other => panic!("expected a format error, got {other:?}"),
        }
        match ArchiveCookie::parse(&[0u8; NARROW_COOKIE_SIZE]) {
            Err(ExtractError::Format(msg)) => assert!(msg.contains("magic")),
            other => panic!("expected a format error, got {other:?}"),
        }
    }

    #[test]
    fn cookie_rejects_overrunning_toc() {
        let buf = cookie_bytes(100, 90, 20, 310);
        match ArchiveCookie::parse(&buf) {
            Err(ExtractError::Format(_)) => {}
            other => panic!("expected a format error, got {other:?}"),
        }
    }

    #[test]
    fn toc_record_roundtrip() {
        let mut record = Vec::new();
        let name = b"mod.dotted\0\0";
        record.extend_from_slice(&((TOC_RECORD_FIXED_SIZE + name.len()) as u32).to_be_bytes());
        record.extend_from_slice(&42u32.to_be_bytes());
        record.extend_from_slice(&10u32.to_be_bytes());
        record.extend_from_slice(&20u32.to_be_bytes());
        record.push(1);
        record.push(b'm');
        record.extend_from_slice(name);

        let mut slice = &record[..];
        let parsed = TocRecord::parse_and_consume(&mut slice, 0).unwrap();
        assert!(slice.is_empty());
        assert_eq!(parsed.data_offset, 42);
        assert_eq!(parsed.compressed_length, 10);
        assert_eq!(parsed.uncompressed_length, 20);
        assert!(parsed.compressed);
        assert_eq!(parsed.kind, EntryKind::Module);
        assert_eq!(parsed.name, "mod.dotted");
    }

    #[test]
    fn toc_record_rejects_truncation() {
        let mut record = Vec::new();
        record.extend_from_slice(&100u32.to_be_bytes()); // name would need 82 bytes
        record.extend_from_slice(&[0u8; TOC_RECORD_FIXED_SIZE - 4]);
        let mut slice = &record[..];
        match TocRecord::parse_and_consume(&mut slice, 0) {
            Err(ExtractError::Format(_)) => {}
            other => panic!("expected a format error, got {other:?}"),
        }
    }
}
