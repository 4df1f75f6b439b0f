//! Error types and the related `Result<T>`

use thiserror::Error;

use crate::spec::PythonVersion;

pub type ExtractResult<T> = Result<T, ExtractError>;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// An error from underlying I/O
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    /// The container structure (cookie, TOC, or PYZ index) is malformed.
    ///
    /// Nothing can be safely extracted without a valid TOC,
    /// so these abort the whole run.
    /// Messages carry the byte offset where decoding went wrong.
    #[error("Invalid archive: {0}")]
    Format(String),

    /// A single entry couldn't be decoded:
    /// its compressed data didn't inflate,
    /// or the inflated size didn't match the declared one.
    /// These are recorded per entry and don't abort the run.
    #[error("Couldn't decode entry: {0}")]
    Decode(String),

    /// No known bytecode-header magic for the interpreter version
    /// recorded in the cookie.
    #[error("No known bytecode magic for Python {0}")]
    UnsupportedVersion(PythonVersion),

    /// A cast from a 64-bit int to a usize failed while mapping the file,
    /// probably on a 32-bit system.
    #[error("Archive too large for address space")]
    InsufficientAddressSpace,
}
