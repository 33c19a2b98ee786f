//! # Format Adapters
//!
//! The core never looks at container bytes. A format plugs in through three seams:
//!
//! - [`EntryCompressor`] runs on worker threads and turns one entry's content into a
//!   self-contained segment.
//! - [`ArchiveSink`] runs on the owning thread and appends records (metadata-only entries or
//!   finished segments) to the container in the order it is called.
//! - [`ArchiveSource`] enumerates an existing container as a sequence of [`SourceEntry`]s, for
//!   extraction and for reading an archive as a resource collection.

pub mod tar;
pub mod zip;

use crate::attributes::{TimeGranularity, TimeZoneMode};
use crate::common::{EntryHeader, EntryKind};
use crate::compress::{self, CompressionAlgo, StreamCodec};
use crate::fsx as fs;
use crate::workers::spill::SpillableSegment;
use crate::ArchiverError;

use serde::{Deserialize, Serialize};
use std::io::{self, BufReader, Read, Write};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

/// Supported container types.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    /// zip and its aliases (jar, war, ear).
    Zip,
    /// POSIX/GNU tar, optionally wrapped in a whole-stream codec.
    Tar(StreamCodec),
}

impl ArchiveFormat {
    /// Infer the format from a file name. Matching is case-insensitive.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if [".zip", ".jar", ".war", ".ear"].iter().any(|s| name.ends_with(s)) {
            return Some(ArchiveFormat::Zip);
        }
        let codec = if name.ends_with(".tar") {
            StreamCodec::None
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            StreamCodec::Gzip
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            StreamCodec::Bzip2
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            StreamCodec::Xz
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            StreamCodec::Zstd
        } else {
            return None;
        };
        Some(ArchiveFormat::Tar(codec))
    }

    /// Resolution of this container's timestamp field.
    pub fn granularity(self) -> TimeGranularity {
        match self {
            ArchiveFormat::Zip => TimeGranularity::TwoSeconds,
            ArchiveFormat::Tar(_) => TimeGranularity::Seconds,
        }
    }

    /// Open `path` for enumeration.
    pub fn open_source(self, path: &Path, zone: TimeZoneMode) -> Result<Box<dyn ArchiveSource + Send>, ArchiverError> {
        let file = fs::File::open(path).map_err(|e| ArchiverError::io(e, path))?;
        Ok(match self {
            ArchiveFormat::Zip => Box::new(zip::ZipSource::new(BufReader::new(file), zone)?),
            ArchiveFormat::Tar(codec) => {
                let input = compress::decoder(codec, BufReader::new(file)).map_err(|e| ArchiverError::io(e, path))?;
                Box::new(tar::TarSource::new(input))
            }
        })
    }

    /// Writer-side halves of this format over `out`.
    pub fn writer<W: Write + io::Seek + Send + 'static>(
        self,
        out: W,
        options: &WriteOptions,
    ) -> Result<(Arc<dyn EntryCompressor>, Box<dyn ArchiveSink>), ArchiverError> {
        Ok(match self {
            ArchiveFormat::Zip => (
                Arc::new(zip::ZipEntryCompressor::new(options)),
                Box::new(zip::ZipSink::new(out, options.zone)),
            ),
            ArchiveFormat::Tar(codec) => (
                Arc::new(tar::TarEntryCompressor),
                Box::new(tar::TarSink::new(out, codec, options.codec_level)?),
            ),
        })
    }
}

/// Encoding settings shared by the format adapters.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub compression: CompressionAlgo,
    pub compression_level: Option<i32>,
    /// Level for the whole-stream codec of compressed tarballs.
    pub codec_level: Option<u32>,
    /// When false, entries that already look compressed are stored as-is.
    pub recompress_added_archives: bool,
    pub zone: TimeZoneMode,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression: CompressionAlgo::default(),
            compression_level: None,
            codec_level: None,
            recompress_added_archives: true,
            zone: TimeZoneMode::default(),
        }
    }
}

// --- seams ---

/// Per-entry encoding, executed on a worker thread.
pub trait EntryCompressor: Send + Sync {
    /// Encode `input` for `header` into `segment`.
    fn compress(&self, header: &EntryHeader, input: &mut dyn Read, segment: &mut SpillableSegment) -> io::Result<()>;
}

/// Ordered record writer, executed on the owning thread.
pub trait ArchiveSink {
    /// Write a directory or symlink record.
    fn write_metadata(&mut self, header: &EntryHeader) -> Result<(), ArchiverError>;
    /// Append a segment produced by the matching [`EntryCompressor`]. The segment is released
    /// afterwards.
    fn write_segment(&mut self, header: &EntryHeader, segment: &mut SpillableSegment) -> Result<(), ArchiverError>;
    /// Write trailers and flush everything to the underlying output.
    fn finish(self: Box<Self>) -> Result<(), ArchiverError>;
}

/// One entry of an existing container.
pub struct SourceEntry<'a> {
    /// Name exactly as stored, not sanitized.
    pub name: String,
    pub kind: EntryKind,
    pub mode: Option<u32>,
    pub mtime: Option<SystemTime>,
    pub symlink_target: Option<String>,
    pub size: u64,
    /// Decoded content of a file entry. `None` when the entry cannot be decoded.
    pub data: Option<&'a mut dyn Read>,
}

/// Sequential enumeration of an existing container.
pub trait ArchiveSource {
    /// Visit every entry in container order until `visit` breaks or fails.
    fn for_each_entry(
        &mut self,
        visit: &mut dyn FnMut(SourceEntry<'_>) -> Result<ControlFlow<()>, ArchiverError>,
    ) -> Result<(), ArchiverError>;

    /// Copy the content of the entry at position `ordinal` into `out`.
    /// Returns false when there is no such entry or it has no content.
    fn read_entry(&mut self, ordinal: usize, out: &mut dyn Write) -> Result<bool, ArchiverError> {
        let mut index = 0;
        let mut found = false;
        self.for_each_entry(&mut |entry| {
            if index < ordinal {
                index += 1;
                return Ok(ControlFlow::Continue(()));
            }
            if let Some(data) = entry.data {
                io::copy(data, &mut *out).map_err(|e| ArchiverError::entry("reading", &entry.name, e))?;
                found = true;
            }
            Ok(ControlFlow::Break(()))
        })?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        assert_eq!(ArchiveFormat::from_path(Path::new("out/app.JAR")), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_path(Path::new("x.tar")), Some(ArchiveFormat::Tar(StreamCodec::None)));
        assert_eq!(ArchiveFormat::from_path(Path::new("x.tgz")), Some(ArchiveFormat::Tar(StreamCodec::Gzip)));
        assert_eq!(ArchiveFormat::from_path(Path::new("x.tar.zst")), Some(ArchiveFormat::Tar(StreamCodec::Zstd)));
        assert_eq!(ArchiveFormat::from_path(Path::new("x.gz")), None);
    }

    #[test]
    fn format_config_names() -> Result<(), serde_json::Error> {
        let f: ArchiveFormat = serde_json::from_str(r#"{"tar":"xz"}"#)?;
        assert_eq!(f, ArchiveFormat::Tar(StreamCodec::Xz));
        let z: ArchiveFormat = serde_json::from_str(r#""zip""#)?;
        assert_eq!(z, ArchiveFormat::Zip);
        Ok(())
    }
}
