//! Reading the nested PYZ archive of frozen modules.
//!
//! One TOC entry of the outer package (type code `z`) holds an entire
//! sub-archive: a small header, a heap of individually zlib-compressed
//! module payloads, and a marshal-serialized index mapping dotted module
//! names to `(typecode, offset, length)` records.
//!
//! Like the outer [`PkgArchive`], a parsed [`PyzArchive`] holds only
//! offsets into the blob it was given; module bytes are materialized
//! one at a time by [`PyzArchive::read`].
//!
//! [`PkgArchive`]: ../read/struct.PkgArchive.html
//! [`PyzArchive`]: struct.PyzArchive.html
//! [`PyzArchive::read`]: struct.PyzArchive.html#method.read

use std::fmt;

use camino::Utf8PathBuf;
use log::*;

use crate::marshal::{self, Object};
use crate::read::inflate_up_to;
use crate::result::*;
use crate::spec::PythonVersion;

/// The magic that opens a PYZ blob
pub const PYZ_MAGIC: [u8; 4] = [b'P', b'Y', b'Z', 0];

// Index typecodes from the build tool's ZlibArchive writer.
// (The oldest archives store a plain is-package bool, which reads as
// MODULE/PKG here just the same.)
const PYZ_TYPE_PKG: i64 = 1;
const PYZ_TYPE_NSPKG: i64 = 3;

// The index records no uncompressed sizes, so module inflation is bounded
// by a generous multiple of the stored size instead. Bytecode compresses
// a few times over at best; only a bomb gets near this ratio.
const INFLATION_LIMIT_RATIO: usize = 256;
const INFLATION_LIMIT_FLOOR: usize = 1 << 20;

/// One record of the PYZ index.
///
/// Offsets and lengths are relative to the start of the PYZ blob,
/// never to the outer file.
#[derive(Debug)]
pub struct PyzEntry {
    /// Dotted module name, e.g. `email.mime.text`
    pub module_name: String,
    pub is_package: bool,
    pub offset: u64,
    pub length: u64,
}

impl PyzEntry {
    /// The path this module extracts to, before sanitization.
    ///
    /// A package's code lives at `<name>/__init__.pyc`, a plain module
    /// at `<name>.pyc`, with dots becoming directory separators.
    /// This is what makes the extracted tree inspectable as a directory
    /// of individually valid bytecode files.
    pub fn output_path(&self) -> Utf8PathBuf {
        let mut path: Utf8PathBuf = self.module_name.split('.').collect();
        if self.is_package {
            path.push("__init__");
        }
        path.set_extension("pyc");
        path
    }
}

/// A parsed PYZ sub-archive
pub struct PyzArchive<'a> {
    /// The whole decompressed PYZ blob
    data: &'a [u8],
    version: PythonVersion,
    entries: Vec<PyzEntry>,
}

// Hand-rolled so the whole blob doesn't end up in log output.
impl fmt::Debug for PyzArchive<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PyzArchive")
            .field("data", &format_args!("{} bytes", self.data.len()))
            .field("version", &self.version)
            .field("entries", &self.entries)
            .finish()
    }
}

impl<'a> PyzArchive<'a> {
    /// Parses a PYZ blob (the decoded payload of a `z` entry).
    ///
    /// `version` is the interpreter version from the outer cookie;
    /// it travels with the archive so extracted modules get matching
    /// headers rebuilt.
    pub fn parse(data: &'a [u8], version: PythonVersion) -> ExtractResult<Self> {
        // Layout, from the build tool's ZlibArchive:
        //
        //   magic           4 bytes   'PYZ\0'
        //   pyc magic       4 bytes   (of the building interpreter)
        //   index offset    4 bytes   big-endian, rel. to blob start
        //   module data     ...       zlib streams, individually compressed
        //   index           ...       marshalled list of
        //                             (name, (typecode, offset, length))
        if data.len() < 12 {
            return Err(ExtractError::Format(format!(
                "PYZ blob of {} bytes is too small for its header",
                data.len()
            )));
        }
        if data[..4] != PYZ_MAGIC {
            return Err(ExtractError::Format(format!(
                "Bad PYZ magic {:02x?}",
                &data[..4]
            )));
        }
        trace!(
            "PYZ built by an interpreter with pyc magic {:02x?}",
            &data[4..8]
        );

        let index_offset = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;
        if index_offset < 12 || index_offset >= data.len() {
            return Err(ExtractError::Format(format!(
                "PYZ index offset {index_offset} outside the {}-byte blob",
                data.len()
            )));
        }

        let index = marshal::loads(&data[index_offset..])?;
        let entries = decode_index(index)?;
        debug!("PYZ holds {} modules", entries.len());

        Ok(Self {
            data,
            version,
            entries,
        })
    }

    /// Returns the index records, in index order.
    pub fn entries(&self) -> &[PyzEntry] {
        &self.entries
    }

    pub fn python_version(&self) -> PythonVersion {
        self.version
    }

    /// Reads one module's payload: slices it out of the blob and inflates.
    ///
    /// The result is raw marshalled bytecode with no file header;
    /// see the [`pyc`] module for putting one back.
    ///
    /// [`pyc`]: ../pyc/index.html
    pub fn read(&self, entry: &PyzEntry) -> ExtractResult<Vec<u8>> {
        let start = crate::arch::usize(entry.offset)?;
        let length = crate::arch::usize(entry.length)?;
        let slice = match start.checked_add(length) {
            Some(end) if end <= self.data.len() => &self.data[start..end],
            _ => {
                return Err(ExtractError::Decode(format!(
                    "{}: module data at {}+{} falls outside the {}-byte PYZ blob",
                    entry.module_name,
                    entry.offset,
                    entry.length,
                    self.data.len(),
                )))
            }
        };
        let limit = slice
            .len()
            .saturating_mul(INFLATION_LIMIT_RATIO)
            .max(INFLATION_LIMIT_FLOOR);
        inflate_up_to(slice, limit, &entry.module_name)
    }
}

/// Turns the marshalled index object into entry records.
///
/// The index has been a list of pairs, and sometimes a dict, over the
/// format's life; both shapes decode the same way from here.
fn decode_index(index: Object) -> ExtractResult<Vec<PyzEntry>> {
    let pairs: Vec<(Object, Object)> = match index {
        Object::Dict(pairs) => pairs,
        Object::List(items) | Object::Tuple(items) => items
            .into_iter()
            .map(|item| match item {
                Object::Tuple(pair) | Object::List(pair) if pair.len() == 2 => {
                    let mut pair = pair.into_iter();
                    Ok((pair.next().unwrap(), pair.next().unwrap()))
                }
                other => Err(ExtractError::Format(format!(
                    "PYZ index item isn't a (name, record) pair: {other:?}"
                ))),
            })
            .collect::<ExtractResult<_>>()?,
        other => {
            return Err(ExtractError::Format(format!(
                "PYZ index isn't a list or dict: {other:?}"
            )))
        }
    };

    pairs
        .into_iter()
        .map(|(name, record)| {
            let module_name = match name {
                Object::Str(s) => s,
                // Python 2 archives store names as raw bytes.
                Object::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
                other => {
                    return Err(ExtractError::Format(format!(
                        "PYZ index name isn't a string: {other:?}"
                    )))
                }
            };
            let fields = match record {
                Object::Tuple(fields) | Object::List(fields) if fields.len() == 3 => fields,
                other => {
                    return Err(ExtractError::Format(format!(
                        "PYZ index record for {module_name} isn't a \
                         (typecode, offset, length) triple: {other:?}"
                    )))
                }
            };
            let int_field = |which: usize, what: &str| match &fields[which] {
                Object::Int(i) if *i >= 0 => Ok(*i as u64),
                Object::Bool(b) => Ok(*b as u64),
                other => Err(ExtractError::Format(format!(
                    "PYZ index record for {module_name} has a bad {what}: {other:?}"
                ))),
            };
            let typecode = int_field(0, "typecode")? as i64;
            let offset = int_field(1, "offset")?;
            let length = int_field(2, "length")?;
            Ok(PyzEntry {
                module_name,
                is_package: typecode == PYZ_TYPE_PKG || typecode == PYZ_TYPE_NSPKG,
                offset,
                length,
            })
        })
        .collect()
}
