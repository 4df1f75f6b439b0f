//! Driving extraction: walking the TOC, writing the output tree,
//! and reporting per-entry results.
//!
//! A run never gives up because one entry is bad — partially-extracted
//! archives are still worth inspecting — so per-entry failures are
//! collected into the [`ExtractionReport`] instead of propagated.
//!
//! [`ExtractionReport`]: struct.ExtractionReport.html

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use log::*;
use rayon::prelude::*;

use crate::pyc;
use crate::pyz::PyzArchive;
use crate::read::{EntryMetadata, PkgArchive};
use crate::result::*;
use crate::spec::{EntryKind, PythonVersion};

/// One entry (or nested module) that couldn't be extracted, and why.
#[derive(Debug)]
pub struct FailedEntry {
    pub name: String,
    pub error: ExtractError,
}

/// What an extraction run accomplished.
///
/// `succeeded` counts files written, including modules fanned out of
/// nested PYZ archives. Entries skipped by policy (dependency references,
/// runtime options, or anything after an abort) count as neither.
#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub succeeded: usize,
    pub failed: Vec<FailedEntry>,
}

impl ExtractionReport {
    fn merge(mut self, mut other: Self) -> Self {
        self.succeeded += other.succeeded;
        self.failed.append(&mut other.failed);
        self
    }

    fn one_success() -> Self {
        Self {
            succeeded: 1,
            failed: Vec::new(),
        }
    }

    fn one_failure(name: &str, error: ExtractError) -> Self {
        Self {
            succeeded: 0,
            failed: vec![FailedEntry {
                name: name.to_owned(),
                error,
            }],
        }
    }
}

/// Extracts a [`PkgArchive`] to an output directory tree.
///
/// ```no_run
/// # use std::fs;
/// # use camino::Utf8Path;
/// # use defrost::*;
/// let bytes = fs::read("frozen.exe")?;
/// let archive = PkgArchive::new(&bytes)?;
/// let report = Extractor::new().run(&archive, Utf8Path::new("frozen_extracted"))?;
/// println!("{} extracted, {} failed", report.succeeded, report.failed.len());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// [`PkgArchive`]: ../read/struct.PkgArchive.html
pub struct Extractor {
    overwrite: bool,
    parallel: bool,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            overwrite: false,
            parallel: true,
        }
    }

    /// Overwrite existing files instead of recording them as failures.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Extract entries in parallel (the default) or one at a time.
    ///
    /// Entries are independent once the TOC is parsed: each worker reads
    /// its own slice of the shared mapping and writes its own output path.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Extracts every entry of `archive` under `output_root`,
    /// creating directories as needed.
    pub fn run(
        &self,
        archive: &PkgArchive,
        output_root: &Utf8Path,
    ) -> ExtractResult<ExtractionReport> {
        self.run_until(archive, output_root, &AtomicBool::new(false))
    }

    /// Like [`run`], but checks `abort` before starting each entry.
    ///
    /// In-flight entries run to completion; the report covers whatever
    /// finished before the flag was honored.
    ///
    /// [`run`]: #method.run
    pub fn run_until(
        &self,
        archive: &PkgArchive,
        output_root: &Utf8Path,
        abort: &AtomicBool,
    ) -> ExtractResult<ExtractionReport> {
        fs::create_dir_all(output_root)?;
        info!(
            "Extracting {} entries to {output_root} (Python {})",
            archive.entries().len(),
            archive.python_version(),
        );

        let extract = |(index, entry): (usize, &EntryMetadata)| -> ExtractionReport {
            if abort.load(Ordering::Relaxed) {
                debug!("Abort requested; skipping remaining entries");
                return ExtractionReport::default();
            }
            self.extract_entry(archive, index, entry, output_root)
        };

        let report = if self.parallel {
            archive
                .entries()
                .par_iter()
                .enumerate()
                .map(extract)
                .reduce(ExtractionReport::default, ExtractionReport::merge)
        } else {
            archive
                .entries()
                .iter()
                .enumerate()
                .map(extract)
                .fold(ExtractionReport::default(), ExtractionReport::merge)
        };

        info!(
            "Extraction finished: {} succeeded, {} failed",
            report.succeeded,
            report.failed.len()
        );
        Ok(report)
    }

    fn extract_entry(
        &self,
        archive: &PkgArchive,
        index: usize,
        entry: &EntryMetadata,
        output_root: &Utf8Path,
    ) -> ExtractionReport {
        let name = entry_name(entry, index);

        match entry.kind {
            // These records exist for the bootloader, not for us:
            // no payload worth writing.
            EntryKind::Dependency | EntryKind::RuntimeOption => {
                debug!("Skipping {:?} record {name}", entry.kind);
                return ExtractionReport::default();
            }
            _ => {}
        }

        let data = match archive.read(entry) {
            Ok(data) => data,
            Err(error) => {
                warn!("Couldn't decode {name}: {error}");
                return ExtractionReport::one_failure(&name, error);
            }
        };

        let relative = sanitize_name(&name);
        let result = match entry.kind {
            kind if kind.is_bytecode() => {
                if kind == EntryKind::Script {
                    info!("Possible entry point: {relative}.pyc");
                }
                self.write_bytecode(
                    &output_root.join(format!("{relative}.pyc")),
                    &data,
                    archive.python_version(),
                )
            }
            EntryKind::ZlibArchive => {
                // Write the raw blob, then fan its modules out next to it.
                let written = self
                    .write_file(&output_root.join(&relative), &data)
                    .map(|()| ExtractionReport::one_success())
                    .unwrap_or_else(|error| ExtractionReport::one_failure(&name, error));
                let nested_root = output_root.join(format!("{relative}_extracted"));
                return written.merge(self.extract_pyz(archive, &name, &data, &nested_root));
            }
            _ => self.write_file(&output_root.join(&relative), &data),
        };

        match result {
            Ok(()) => ExtractionReport::one_success(),
            Err(error) => {
                warn!("Couldn't extract {name}: {error}");
                ExtractionReport::one_failure(&name, error)
            }
        }
    }

    /// Expands a PYZ blob under `nested_root`, one file per module.
    fn extract_pyz(
        &self,
        archive: &PkgArchive,
        name: &str,
        data: &[u8],
        nested_root: &Utf8Path,
    ) -> ExtractionReport {
        let pyz = match PyzArchive::parse(data, archive.python_version()) {
            Ok(pyz) => pyz,
            Err(error) => {
                warn!("Couldn't parse PYZ {name}: {error}");
                return ExtractionReport::one_failure(name, error);
            }
        };

        let mut report = ExtractionReport::default();
        for module in pyz.entries() {
            let full_name = format!("{name}:{}", module.module_name);
            let result = pyz.read(module).and_then(|bytecode| {
                let relative = sanitize_name(module.output_path().as_str());
                self.write_bytecode(
                    &nested_root.join(relative),
                    &bytecode,
                    pyz.python_version(),
                )
            });
            report = report.merge(match result {
                Ok(()) => ExtractionReport::one_success(),
                Err(error) => {
                    warn!("Couldn't extract {full_name}: {error}");
                    ExtractionReport::one_failure(&full_name, error)
                }
            });
        }
        report
    }

    /// Writes a bytecode file, rebuilding its header unless the payload
    /// already carries one (older build tools left it in place).
    fn write_bytecode(
        &self,
        path: &Utf8Path,
        data: &[u8],
        version: PythonVersion,
    ) -> ExtractResult<()> {
        if pyc::has_header(data) {
            self.write_file(path, data)
        } else {
            self.write_file(path, &pyc::reconstruct(data, version)?)
        }
    }

    fn write_file(&self, path: &Utf8Path, bytes: &[u8]) -> ExtractResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.write(true);
        if self.overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut file = options.open(path)?;
        file.write_all(bytes)?;
        trace!("Wrote {} bytes to {path}", bytes.len());
        Ok(())
    }
}

/// Returns a non-empty name for the entry, synthesizing a deterministic
/// one from the TOC index when the record's is blank.
fn entry_name(entry: &EntryMetadata, index: usize) -> String {
    if entry.name.is_empty() {
        warn!("TOC entry {index} has no name");
        format!("unnamed_{index}")
    } else {
        entry.name.clone()
    }
}

/// Rewrites a stored name into a path that stays under the output root.
///
/// The archive is untrusted input: a crafted name like `../../etc/passwd`
/// or `/etc/passwd` must never escape. Anything that isn't a normal path
/// component — parent dirs, roots, drive prefixes — is dropped, keeping
/// the salvageable remainder.
fn sanitize_name(name: &str) -> Utf8PathBuf {
    let slashed = name.replace('\\', "/");
    let mut sanitized = Utf8PathBuf::new();
    for component in Utf8Path::new(&slashed).components() {
        match component {
            Utf8Component::Normal(part) => sanitized.push(part),
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir | Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                warn!("Dropping {component:?} from stored name {name:?}");
            }
        }
    }
    if sanitized.as_str().is_empty() {
        // Nothing survived; don't let the entry vanish.
        sanitized.push("unnamed");
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_is_stripped() {
        assert_eq!(sanitize_name("../../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_name("/etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_name("a/../../b"), "a/b");
        assert_eq!(sanitize_name("..\\..\\win\\path"), "win/path");
    }

    #[test]
    fn ordinary_names_pass_through() {
        assert_eq!(sanitize_name("some/lib.so"), "some/lib.so");
        assert_eq!(sanitize_name("./module"), "module");
        assert_eq!(sanitize_name("plain"), "plain");
    }

    #[test]
    fn nothing_left_means_placeholder() {
        assert_eq!(sanitize_name("../.."), "unnamed");
        assert_eq!(sanitize_name("/"), "unnamed");
    }
}
