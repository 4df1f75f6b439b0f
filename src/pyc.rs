//! Rebuilding the file header of extracted bytecode.
//!
//! Module payloads in the archive are stored headerless — the build tool
//! strips the `.pyc` header because the bootloader doesn't need it.
//! To make the extracted tree loadable (and decompilable), we prepend a
//! fresh header for the interpreter version recorded in the cookie.
//!
//! The version→magic mapping is defined by CPython
//! (`importlib/_bootstrap_external.py`) and evolves with every minor
//! release, so it lives in one explicit table: supporting a new version
//! is a one-line edit.

use crate::result::*;
use crate::spec::PythonVersion;

/// Bytecode magic words, per CPython release line.
const MAGIC_BY_VERSION: &[((u8, u8), u16)] = &[
    ((2, 6), 62161),
    ((2, 7), 62211),
    ((3, 0), 3131),
    ((3, 1), 3151),
    ((3, 2), 3180),
    ((3, 3), 3230),
    ((3, 4), 3310),
    ((3, 5), 3351),
    ((3, 6), 3379),
    ((3, 7), 3394),
    ((3, 8), 3413),
    ((3, 9), 3425),
    ((3, 10), 3439),
    ((3, 11), 3495),
    ((3, 12), 3531),
    ((3, 13), 3571),
];

/// Returns the four magic bytes opening a `.pyc` for the given version:
/// the magic word, little-endian, followed by `\r\n`.
///
/// (The `\r\n` is CPython's trick to catch files mangled by text-mode
/// transfer.)
pub fn magic_bytes(version: PythonVersion) -> Option<[u8; 4]> {
    let word = MAGIC_BY_VERSION
        .iter()
        .find(|(v, _)| *v == (version.major, version.minor))
        .map(|(_, word)| *word)?;
    let le = word.to_le_bytes();
    Some([le[0], le[1], b'\r', b'\n'])
}

/// Size of the `.pyc` header for the given version.
///
/// - before 3.3: magic + timestamp
/// - 3.3 to 3.6: magic + timestamp + source size
/// - 3.7 and up: magic + flags word + timestamp + source size
pub fn header_length(version: PythonVersion) -> usize {
    match (version.major, version.minor) {
        (0..=2, _) | (3, 0..=2) => 8,
        (3, 3..=6) => 12,
        _ => 16,
    }
}

/// True if `data` already starts with a plausible `.pyc` header.
///
/// Older build tools left the header on some module records;
/// every magic ends in `\r\n`, which raw marshalled code never starts with.
pub fn has_header(data: &[u8]) -> bool {
    data.len() >= 4 && data[2] == b'\r' && data[3] == b'\n'
}

/// Prepends a `.pyc` header to headerless bytecode.
///
/// The timestamp/hash fields the build discarded are synthesized as
/// zeros; the result is structurally loadable but not bit-identical to
/// the file the original compile produced.
pub fn reconstruct(raw_bytecode: &[u8], version: PythonVersion) -> ExtractResult<Vec<u8>> {
    let magic =
        magic_bytes(version).ok_or(ExtractError::UnsupportedVersion(version))?;
    let header_length = header_length(version);

    let mut file = Vec::with_capacity(header_length + raw_bytecode.len());
    file.extend_from_slice(&magic);
    file.resize(header_length, 0);
    file.extend_from_slice(raw_bytecode);
    Ok(file)
}
