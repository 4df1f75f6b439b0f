//! defrost reads the archive a PyInstaller bootloader appends to a frozen
//! executable and extracts it using a simple API:
//!
//! ```no_run
//! # use std::fs;
//! # use defrost::*;
//! // For smaller files,
//! let bytes = fs::read("frozen.exe")?;
//! let archive = PkgArchive::new(&bytes)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//! works just fine. Memory map larger ones!
//! ```no_run
//! # use std::fs::File;
//! # use camino::Utf8Path;
//! # use memmap2::Mmap;
//! # use defrost::*;
//! let exe = File::open("frozen.exe")?;
//! let mapping = unsafe { Mmap::map(&exe)? };
//! let archive = PkgArchive::new(&mapping)?;
//!
//! // We can walk the table of contents directly...
//! for entry in archive.entries() {
//!     println!("{:?}\t{}", entry.kind, entry.name);
//! }
//!
//! // ...or hand the whole thing to the extractor, which decodes every
//! // entry (in parallel), expands nested module archives, rebuilds the
//! // bytecode headers the build tool stripped, and reports per-entry
//! // results instead of dying on the first corrupt record.
//! let report = Extractor::new().run(&archive, Utf8Path::new("frozen_extracted"))?;
//! for failure in &report.failed {
//!     eprintln!("couldn't extract {}: {}", failure.name, failure.error);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The archive format is an interesting one: a cookie near the end of the
//! executable locates a package of independently-compressed entries, one
//! of which is usually a nested PYZ archive holding the frozen standard
//! library. Since each entry stands alone, extraction parallelizes
//! naturally so long as we can read from multiple places at once.
//!
//! Nothing about the format is officially documented; the `spec` module
//! pins its constants against the bootloader's structs and says where
//! each came from.

pub mod extract;
pub mod pyc;
pub mod pyz;
pub mod read;
pub mod result;
pub mod spec;

pub use extract::{ExtractionReport, Extractor};
pub use read::PkgArchive;
pub use spec::{EntryKind, PythonVersion};

mod arch;
mod marshal;
