use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `blitzpack` crate.
///
/// `build()` and `extract()` return exactly one of these; retries are left to the caller.
#[derive(Debug, Error)]
pub enum ArchiverError {
    /// Invalid destination, missing source or conflicting settings.
    /// Always raised before any build or extraction work starts.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A resource claimed to be a file or directory but is gone.
    #[error("Resource '{name}' does not exist")]
    ResourceNotFound { name: String },

    /// A second entry mapped onto an already emitted name under the `Fail` policy.
    #[error("Duplicate entry '{name}' (duplicate policy is 'fail')")]
    DuplicateEntry { name: String },

    /// No file entry was emitted and empty archives are not allowed.
    #[error("Archive '{}' would contain no entries", path.display())]
    EmptyArchive { path: PathBuf },

    /// A worker failed while reading or compressing an entry.
    /// Surfaced when the drain reaches the entry's position.
    #[error("Failed to compress entry '{name}': {source}")]
    CompressionTask {
        name: String,
        #[source]
        source: io::Error,
    },

    /// An entry name (or its mapped form) resolves outside the destination root.
    #[error("Entry '{name}' resolves outside of destination '{}'", root.display())]
    PathEscape { name: String, root: PathBuf },

    /// Extraction wrote more than the configured output cap.
    #[error("Extraction exceeded the output limit of {limit} bytes while writing '{name}'")]
    OutputSizeExceeded { name: String, limit: u64 },

    /// Permission bits could not be applied. Only ever logged.
    #[error("Failed to apply permissions to '{}': {source}", path.display())]
    PermissionApply {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// An I/O error tied to one archive entry and the phase it happened in.
    #[error("I/O error while {phase} entry '{name}': {source}")]
    Entry {
        phase: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    /// An include/exclude pattern or mapper expression did not compile.
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// The compression worker pool could not be started.
    #[error("Failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    /// The build failed and restoring the original archive failed as well.
    #[error("{source} (additionally, reverting the destination failed: {detail})")]
    RevertFailed {
        #[source]
        source: Box<ArchiverError>,
        detail: String,
    },

    /// A wrapper for any other error that doesn't fit the specific variants.
    #[error("An unexpected error occurred: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl ArchiverError {
    pub(crate) fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        ArchiverError::Io { source, path: path.into() }
    }

    pub(crate) fn entry(phase: &'static str, name: &str, source: io::Error) -> Self {
        ArchiverError::Entry { phase, name: name.to_string(), source }
    }
}

// Generic IO error conversion that doesn't require a path
impl From<io::Error> for ArchiverError {
    fn from(err: io::Error) -> Self {
        ArchiverError::Io { source: err, path: PathBuf::new() }
    }
}

impl From<zip::result::ZipError> for ArchiverError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => ArchiverError::from(e),
            other => ArchiverError::Other(Box::new(other)),
        }
    }
}
