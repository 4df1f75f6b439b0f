//! Tools for reading the archive embedded in a frozen executable.
//!
//! To start, create a [`PkgArchive`] from the executable's bytes.
//!
//! The library is arranged like a ZIP reader would be:
//! a [`spec`] module holds the raw on-disk structures, and this one
//! turns them into validated metadata and decoded payloads.
//!
//! [`PkgArchive`]: struct.PkgArchive.html
//! [`spec`]: ../spec/index.html

use std::borrow::Cow;
use std::fmt;
use std::io::Read;

use flate2::read::ZlibDecoder;
use log::*;

use crate::arch::usize;
use crate::result::*;
use crate::spec::{self, ArchiveCookie, EntryKind, PythonVersion, TocRecord};

/// Metadata for one entry of the package, taken from its TOC record.
///
/// Offsets and lengths point into the package region;
/// no payload bytes are copied until [`PkgArchive::read`].
///
/// [`PkgArchive::read`]: struct.PkgArchive.html#method.read
#[derive(Debug)]
pub struct EntryMetadata {
    /// The stored name. May be empty and may contain path separators;
    /// it is *not* safe to use as an output path without sanitizing.
    pub name: String,

    pub kind: EntryKind,

    /// Payload position relative to the start of the package region
    pub data_offset: u64,

    /// Stored payload size in bytes
    pub compressed_length: usize,

    /// Declared payload size after inflation
    /// (equal to `compressed_length` for stored entries)
    pub uncompressed_length: usize,

    /// True if the payload is zlib-compressed
    pub compressed: bool,
}

/// An embedded archive to be read
pub struct PkgArchive<'a> {
    /// The whole executable, as a byte slice
    mapping: &'a [u8],
    /// Absolute position of the package region
    package_start: usize,
    cookie: ArchiveCookie,
    /// Entries in on-disk order. The format makes no ordering
    /// or uniqueness promises beyond that.
    entries: Vec<EntryMetadata>,
}

// Hand-rolled so the whole mapping doesn't end up in log output.
impl fmt::Debug for PkgArchive<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PkgArchive")
            .field("mapping", &format_args!("{} bytes", self.mapping.len()))
            .field("package_start", &self.package_start)
            .field("cookie", &self.cookie)
            .field("entries", &self.entries)
            .finish()
    }
}

impl<'a> PkgArchive<'a> {
    /// Reads an archive from a byte slice of the whole executable.
    /// Smaller files can be read into a buffer.
    ///
    /// ```no_run
    /// # use std::fs;
    /// # use defrost::*;
    /// let bytes = fs::read("frozen.exe")?;
    /// let archive = PkgArchive::new(&bytes)?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    ///
    /// For larger ones, memory map!
    /// ```no_run
    /// # use std::fs::File;
    /// # use memmap2::Mmap;
    /// # use defrost::*;
    /// let exe = File::open("frozen.exe")?;
    /// let mapping = unsafe { Mmap::map(&exe)? };
    /// let archive = PkgArchive::new(&mapping)?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(mapping: &'a [u8]) -> ExtractResult<Self> {
        let (cookie, package_start) = locate_cookie(mapping)?;
        trace!("{:?}", cookie);
        if let Some(lib) = &cookie.python_lib_name {
            debug!("Archive built against {lib}");
        }

        let toc_start = package_start + usize(cookie.toc_offset)?;
        let toc_length = usize(cookie.toc_length)?;
        // The cookie parse checked the TOC against the package bounds,
        // and locate_cookie() checked the package against the file.
        let mut toc = &mapping[toc_start..toc_start + toc_length];

        let mut entries = Vec::new();
        while !toc.is_empty() {
            let record_offset = (toc_start + toc_length - toc.len()) as u64;
            let record = TocRecord::parse_and_consume(&mut toc, record_offset)?;
            trace!("{:?}", record);

            let entry = EntryMetadata {
                name: record.name,
                kind: record.kind,
                data_offset: record.data_offset as u64,
                compressed_length: usize(record.compressed_length)?,
                uncompressed_length: usize(record.uncompressed_length)?,
                compressed: record.compressed,
            };
            debug!("{:?}", entry);
            entries.push(entry);
        }
        debug!("Parsed {} TOC entries", entries.len());

        Ok(Self {
            mapping,
            package_start,
            cookie,
            entries,
        })
    }

    /// Returns the entries listed in the archive's table of contents,
    /// in on-disk order.
    pub fn entries(&self) -> &[EntryMetadata] {
        &self.entries
    }

    pub fn cookie(&self) -> &ArchiveCookie {
        &self.cookie
    }

    /// The interpreter version recorded in the cookie;
    /// extracted bytecode gets headers rebuilt for this version.
    pub fn python_version(&self) -> PythonVersion {
        self.cookie.python_version
    }

    /// Reads and (if needed) inflates the given entry's payload.
    ///
    /// Stored payloads are borrowed straight from the mapping;
    /// compressed ones are inflated into an owned buffer and checked
    /// against the declared uncompressed length.
    ///
    /// Since each entry is compressed independently,
    /// multiple entries can be read in parallel.
    pub fn read(&self, entry: &EntryMetadata) -> ExtractResult<Cow<'a, [u8]>> {
        let package_length = usize(self.cookie.package_length)?;
        let start = usize(entry.data_offset)?;
        let end = start.checked_add(entry.compressed_length);
        // Everything is measured against the cookie-declared package size,
        // so a forged offset can't reach outside it.
        let slice = match end {
            Some(end) if end <= package_length => {
                &self.mapping[self.package_start + start..self.package_start + end]
            }
            _ => {
                return Err(ExtractError::Decode(format!(
                    "{}: data at {}+{} falls outside the {}-byte package",
                    display_name(entry),
                    entry.data_offset,
                    entry.compressed_length,
                    package_length,
                )))
            }
        };

        if entry.compressed {
            let inflated = inflate(slice, entry.uncompressed_length, &entry.name)?;
            Ok(Cow::Owned(inflated))
        } else {
            if entry.compressed_length != entry.uncompressed_length {
                return Err(ExtractError::Decode(format!(
                    "{}: stored entry declares {} bytes but holds {}",
                    display_name(entry),
                    entry.uncompressed_length,
                    entry.compressed_length,
                )));
            }
            Ok(Cow::Borrowed(slice))
        }
    }
}

/// Searches the trailing window for the cookie and decodes it.
///
/// Returns the cookie and the absolute position of the package region.
/// Magic hits that don't decode to a plausible cookie (stray bytes in
/// appended data, most likely) are skipped and the search continues.
fn locate_cookie(mapping: &[u8]) -> ExtractResult<(ArchiveCookie, usize)> {
    for posit in spec::cookie_candidates(mapping) {
        let cookie = match ArchiveCookie::parse(&mapping[posit..]) {
            Ok(cookie) => cookie,
            Err(err) => {
                debug!("Skipping cookie candidate at {posit}: {err}");
                continue;
            }
        };
        // The package ends where the cookie does. Anything after that is
        // appended data (code signing and the like); anything before the
        // package is the bootloader executable itself.
        let package_end = posit + cookie.size_in_file();
        match package_end.checked_sub(usize(cookie.package_length)?) {
            Some(package_start) => {
                trace!(
                    "Cookie at {posit}; package spans {package_start}..{package_end} \
                     with {} bytes appended",
                    mapping.len() - package_end
                );
                return Ok((cookie, package_start));
            }
            None => {
                debug!(
                    "Skipping cookie candidate at {posit}: package of {} bytes \
                     can't fit before it",
                    cookie.package_length
                );
            }
        }
    }
    Err(ExtractError::Format(format!(
        "No archive cookie in the trailing {} bytes; not a frozen executable?",
        spec::COOKIE_SEARCH_WINDOW.min(mapping.len())
    )))
}

/// Inflates a zlib stream that must produce exactly `declared_length` bytes.
///
/// The reader is capped just past the declared length so a forged length
/// field can't balloon the allocation.
pub(crate) fn inflate(
    compressed: &[u8],
    declared_length: usize,
    name: &str,
) -> ExtractResult<Vec<u8>> {
    let mut inflated = Vec::new();
    let mut decoder = ZlibDecoder::new(compressed).take(declared_length as u64 + 1);
    match decoder.read_to_end(&mut inflated) {
        Ok(_) if inflated.len() != declared_length => Err(ExtractError::Decode(format!(
            "{name}: inflated to {} bytes, expected {declared_length}",
            inflated.len(),
        ))),
        Ok(_) => Ok(inflated),
        Err(err) => Err(ExtractError::Decode(format!("{name}: inflate failed: {err}"))),
    }
}

/// Inflates a zlib stream whose uncompressed size isn't on record,
/// refusing to produce more than `limit` bytes.
pub(crate) fn inflate_up_to(
    compressed: &[u8],
    limit: usize,
    name: &str,
) -> ExtractResult<Vec<u8>> {
    let mut inflated = Vec::new();
    let mut decoder = ZlibDecoder::new(compressed).take(limit as u64 + 1);
    match decoder.read_to_end(&mut inflated) {
        Ok(_) if inflated.len() > limit => Err(ExtractError::Decode(format!(
            "{name}: inflates past the {limit}-byte cap"
        ))),
        Ok(_) => Ok(inflated),
        Err(err) => Err(ExtractError::Decode(format!("{name}: inflate failed: {err}"))),
    }
}

fn display_name(entry: &EntryMetadata) -> &str {
    if entry.name.is_empty() {
        "<unnamed>"
    } else {
        &entry.name
    }
}
