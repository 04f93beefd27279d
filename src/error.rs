use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `pfa` crate.
///
/// Variants are split into fatal ones (the shared output stream or the container
/// schema can no longer be trusted) and recoverable ones (a single source file or
/// a single archived file is affected). See [`PfaError::is_fatal`].
#[derive(Debug, Error)]
pub enum PfaError {
    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened (empty for anonymous streams).
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// The destination container file could not be created.
    #[error("could not create output '{}': {source}", path.display())]
    CreateOutput {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// The stream does not start with (or a section does not carry) the expected magic.
    #[error("bad magic 0x{found:x}, not a pfa container")]
    BadMagic { found: u64 },

    /// A section header named a type this build does not know.
    #[error("unexpected type {0} in section header")]
    UnknownSection(u16),

    /// A file header named a codec this build does not know.
    #[error("unsupported compression type {0}")]
    UnknownCompression(u16),

    /// A structured payload did not match its declared size.
    #[error("malformed {kind} section: declared {declared} bytes, consumed {consumed}")]
    MalformedSection {
        kind: &'static str,
        declared: usize,
        consumed: usize,
    },

    /// A file header reused an ID that is still open in the same stream.
    #[error("file id {0} opened twice in one stream")]
    DuplicateFileId(u64),

    #[error("unsupported container version {0}")]
    UnsupportedVersion(u16),

    /// The stream ended in the middle of a record.
    #[error("truncated archive: {0}")]
    Truncated(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("worker thread panicked: {0}")]
    WorkerPanic(String),

    /// A remote peer failed to produce its archive stream.
    #[error("remote node '{host}' failed: {message}")]
    Remote { host: String, message: String },

    /// A wrapper for any other error that doesn't fit the specific variants.
    #[error("{0}")]
    Other(String),
}

impl PfaError {
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        PfaError::Io { source, path: path.into() }
    }

    /// Returns true when the error compromises the shared output stream or the
    /// container schema, i.e. when the whole run has to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PfaError::CreateOutput { .. }
                | PfaError::BadMagic { .. }
                | PfaError::UnknownSection(_)
                | PfaError::UnknownCompression(_)
                | PfaError::MalformedSection { .. }
                | PfaError::DuplicateFileId(_)
                | PfaError::UnsupportedVersion(_)
                | PfaError::WorkerPanic(_)
        )
    }
}

impl From<std::io::Error> for PfaError {
    fn from(err: std::io::Error) -> Self {
        PfaError::Io { source: err, path: PathBuf::new() } // Generic path
    }
}

impl From<serde_json::Error> for PfaError {
    fn from(err: serde_json::Error) -> Self {
        PfaError::Other(format!("serialization error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, PfaError>;

/// What went wrong with one archived file while reading a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueKind {
    CrcMismatch { expected: u64, actual: u64 },
    /// The stream ended while the file was still open.
    MissingFooter,
    /// A body fragment named a file ID with no open header.
    OrphanFragment,
    /// A footer named a file ID with no open header.
    OrphanFooter,
    Decode(String),
    Write(String),
    /// The stored path would land outside the extraction root.
    UnsafePath,
}

/// A non-fatal integrity problem, reported to the operator and collected in the
/// read report. Processing of the remaining files continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub stream: String,
    pub file_id: u64,
    pub path: String,
    pub kind: IssueKind,
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            IssueKind::CrcMismatch { expected, actual } => write!(
                f,
                "{}: archive CRC mismatch for '{}' (id {}): expected {:016x}, got {:016x}",
                self.stream, self.path, self.file_id, expected, actual
            ),
            IssueKind::MissingFooter => write!(
                f,
                "{}: archive does not close file '{}' (id {}), stream truncated?",
                self.stream, self.path, self.file_id
            ),
            IssueKind::OrphanFragment => {
                write!(f, "{}: body fragment for unknown file id {}", self.stream, self.file_id)
            }
            IssueKind::OrphanFooter => {
                write!(f, "{}: footer for unknown file id {}", self.stream, self.file_id)
            }
            IssueKind::Decode(msg) => write!(
                f,
                "{}: could not decode '{}' (id {}): {}",
                self.stream, self.path, self.file_id, msg
            ),
            IssueKind::Write(msg) => write!(
                f,
                "{}: could not write '{}' (id {}): {}",
                self.stream, self.path, self.file_id, msg
            ),
            IssueKind::UnsafePath => {
                write!(f, "{}: refusing unsafe path '{}'", self.stream, self.path)
            }
        }
    }
}
