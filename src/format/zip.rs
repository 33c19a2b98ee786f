//! zip adapter over the `zip` crate.
//!
//! Workers encode each file into a complete single-entry zip held in a [`SpillableSegment`];
//! the sink then raw-copies that entry (local header, compressed data, descriptor) into the
//! real archive without decompressing it again.

use super::{ArchiveSink, ArchiveSource, EntryCompressor, SourceEntry, WriteOptions};
use crate::attributes::{from_dos, to_dos, DosDateTime, TimeZoneMode};
use crate::common::{EntryHeader, EntryKind};
use crate::compress::{extension_of, is_dense_ext, CompressionAlgo};
use crate::workers::spill::SpillableSegment;
use crate::ArchiverError;

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::time::SystemTime;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Archive comment declaring that every DOS time field holds UTC instead of local time.
///
/// Per-entry extra fields do not survive `raw_copy_file`, so the marker lives in the
/// end-of-central-directory record.
const UTC_TIMES_COMMENT: &[u8] = b"blitzpack: dos times are utc";

fn to_io(err: ZipError) -> io::Error {
    match err {
        ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

fn write_error(name: &str) -> impl FnOnce(ZipError) -> ArchiverError + '_ {
    move |e| ArchiverError::entry("writing", name, to_io(e))
}

fn zip_time(t: SystemTime, zone: TimeZoneMode) -> DateTime {
    let d = to_dos(t, zone);
    DateTime::from_date_and_time(d.year, d.month, d.day, d.hour, d.minute, d.second).unwrap_or_default()
}

// --- writing ---

/// Encodes one file into a single-entry zip.
#[derive(Debug, Clone)]
pub struct ZipEntryCompressor {
    compression: CompressionAlgo,
    level: Option<i32>,
    recompress_added_archives: bool,
    zone: TimeZoneMode,
}

impl ZipEntryCompressor {
    pub fn new(options: &WriteOptions) -> Self {
        Self {
            compression: options.compression,
            level: options.compression_level,
            recompress_added_archives: options.recompress_added_archives,
            zone: options.zone,
        }
    }

    fn method_for(&self, name: &str) -> CompressionMethod {
        let dense = !self.recompress_added_archives && extension_of(name).map_or(false, is_dense_ext);
        match self.compression {
            _ if dense => CompressionMethod::Stored,
            CompressionAlgo::Store => CompressionMethod::Stored,
            CompressionAlgo::Deflate => CompressionMethod::Deflated,
            CompressionAlgo::Zstd => CompressionMethod::Zstd,
        }
    }

    fn file_options(&self, header: &EntryHeader) -> FileOptions {
        let method = self.method_for(&header.name);
        let mut options = FileOptions::default()
            .compression_method(method)
            .last_modified_time(zip_time(header.attributes.mtime, self.zone))
            .unix_permissions(header.attributes.mode)
            .large_file(header.size.map_or(true, |s| s >= u32::MAX as u64));
        if method != CompressionMethod::Stored {
            options = options.compression_level(self.level);
        }
        options
    }
}

impl EntryCompressor for ZipEntryCompressor {
    fn compress(&self, header: &EntryHeader, input: &mut dyn Read, segment: &mut SpillableSegment) -> io::Result<()> {
        let mut zip = ZipWriter::new(&mut *segment);
        zip.start_file(header.name.as_str(), self.file_options(header)).map_err(to_io)?;
        io::copy(input, &mut zip)?;
        zip.finish().map_err(to_io)?;
        Ok(())
    }
}

/// Appends records to the final zip in call order.
pub struct ZipSink<W: Write + Seek> {
    writer: ZipWriter<W>,
    zone: TimeZoneMode,
}

impl<W: Write + Seek> ZipSink<W> {
    pub fn new(out: W, zone: TimeZoneMode) -> Self {
        let mut writer = ZipWriter::new(out);
        if zone == TimeZoneMode::Utc {
            writer.set_raw_comment(UTC_TIMES_COMMENT.to_vec());
        }
        Self { writer, zone }
    }
}

impl<W: Write + Seek> ArchiveSink for ZipSink<W> {
    fn write_metadata(&mut self, header: &EntryHeader) -> Result<(), ArchiverError> {
        let options = FileOptions::default()
            .last_modified_time(zip_time(header.attributes.mtime, self.zone))
            .unix_permissions(header.attributes.mode);
        let name = header.name.as_str();
        match header.kind {
            EntryKind::Directory => self.writer.add_directory(name, options).map_err(write_error(name)),
            EntryKind::Symlink => {
                let target = header.symlink_target.as_deref().unwrap_or_default();
                self.writer.add_symlink(name, target, options).map_err(write_error(name))
            }
            EntryKind::File => self
                .writer
                .start_file(name, options.compression_method(CompressionMethod::Stored))
                .map_err(write_error(name)),
        }
    }

    fn write_segment(&mut self, header: &EntryHeader, segment: &mut SpillableSegment) -> Result<(), ArchiverError> {
        let name = header.name.as_str();
        segment
            .seek(SeekFrom::Start(0))
            .map_err(|e| ArchiverError::entry("writing", name, e))?;
        {
            let mut source = ZipArchive::new(&mut *segment).map_err(write_error(name))?;
            let file = source.by_index_raw(0).map_err(write_error(name))?;
            self.writer.raw_copy_file(file).map_err(write_error(name))?;
        }
        segment.release();
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), ArchiverError> {
        let mut out = self.writer.finish()?;
        out.flush()?;
        Ok(())
    }
}

// --- reading ---

/// Enumerates a zip archive.
///
/// Entries the crate cannot decode (encrypted, unknown method) are still listed, with no data.
/// Archives carrying the UTC marker comment are decoded as UTC whatever zone was asked for.
pub struct ZipSource<R: Read + Seek> {
    archive: ZipArchive<R>,
    zone: TimeZoneMode,
}

impl<R: Read + Seek> ZipSource<R> {
    pub fn new(reader: R, zone: TimeZoneMode) -> Result<Self, ArchiverError> {
        let archive = ZipArchive::new(reader)?;
        let zone = if archive.comment() == UTC_TIMES_COMMENT {
            debug!("zip declares utc times");
            TimeZoneMode::Utc
        } else {
            zone
        };
        Ok(Self { archive, zone })
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.len() == 0
    }
}

impl<R: Read + Seek> ArchiveSource for ZipSource<R> {
    fn for_each_entry(
        &mut self,
        visit: &mut dyn FnMut(SourceEntry<'_>) -> Result<ControlFlow<()>, ArchiverError>,
    ) -> Result<(), ArchiverError> {
        for index in 0..self.archive.len() {
            let decodable = match self.archive.by_index(index) {
                Ok(_) => true,
                Err(ZipError::UnsupportedArchive(reason)) => {
                    warn!(index, reason, "zip entry cannot be decoded");
                    false
                }
                Err(e) => return Err(e.into()),
            };
            let mut file = if decodable {
                self.archive.by_index(index)?
            } else {
                self.archive.by_index_raw(index)?
            };

            let name = file.name().to_string();
            let mode = file.unix_mode();
            let kind = if file.is_dir() {
                EntryKind::Directory
            } else if mode.map_or(false, |m| m & S_IFMT == S_IFLNK) {
                EntryKind::Symlink
            } else {
                EntryKind::File
            };
            let dt = file.last_modified();
            let mtime = from_dos(
                &DosDateTime {
                    year: dt.year(),
                    month: dt.month(),
                    day: dt.day(),
                    hour: dt.hour(),
                    minute: dt.minute(),
                    second: dt.second(),
                },
                self.zone,
            );
            let size = file.size();

            let mut symlink_target = None;
            if kind == EntryKind::Symlink && decodable {
                let mut target = String::new();
                file.read_to_string(&mut target)
                    .map_err(|e| ArchiverError::entry("reading", &name, e))?;
                symlink_target = Some(target);
            }
            let data: Option<&mut dyn Read> = if kind == EntryKind::File && decodable { Some(&mut file) } else { None };

            let entry = SourceEntry {
                name,
                kind,
                mode: mode.map(|m| m & 0o7777),
                mtime,
                symlink_target,
                size,
                data,
            };
            if visit(entry)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    fn read_entry(&mut self, ordinal: usize, out: &mut dyn Write) -> Result<bool, ArchiverError> {
        if ordinal >= self.archive.len() {
            return Ok(false);
        }
        let mut file = self.archive.by_index(ordinal)?;
        if file.is_dir() {
            return Ok(false);
        }
        let name = file.name().to_string();
        io::copy(&mut file, out).map_err(|e| ArchiverError::entry("reading", &name, e))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{EntryAttributes, Owner};
    use crate::fsx as fs;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::tempdir;

    fn header(name: &str, kind: EntryKind, mode: u32) -> EntryHeader {
        EntryHeader {
            name: name.to_string(),
            kind,
            attributes: EntryAttributes {
                mode,
                owner: Owner::default(),
                mtime: UNIX_EPOCH + Duration::from_secs(1_700_000_001),
            },
            symlink_target: (kind == EntryKind::Symlink).then(|| "target.txt".to_string()),
            size: Some(5),
        }
    }

    #[test]
    fn segments_are_raw_copied_into_the_archive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("out.zip");
        let options = WriteOptions { zone: TimeZoneMode::Utc, ..WriteOptions::default() };
        let compressor = ZipEntryCompressor::new(&options);
        let mut sink: Box<dyn ArchiveSink> = Box::new(ZipSink::new(fs::File::create(&path)?, options.zone));

        sink.write_metadata(&header("docs", EntryKind::Directory, 0o750))?;
        let file = header("docs/a.txt", EntryKind::File, 0o640);
        let mut segment = SpillableSegment::new(1024);
        compressor.compress(&file, &mut &b"hello"[..], &mut segment)?;
        sink.write_segment(&file, &mut segment)?;
        sink.write_metadata(&header("docs/link", EntryKind::Symlink, 0o777))?;
        sink.finish()?;

        let mut source = ZipSource::new(fs::File::open(&path)?, TimeZoneMode::Utc)?;
        let mut seen = Vec::new();
        source.for_each_entry(&mut |entry| {
            let mut content = String::new();
            if let Some(data) = entry.data {
                data.read_to_string(&mut content)?;
            }
            seen.push((entry.name, entry.kind, entry.mode, entry.mtime, entry.symlink_target, content));
            Ok(ControlFlow::Continue(()))
        })?;

        let t = Some(UNIX_EPOCH + Duration::from_secs(1_700_000_002));
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, "docs/");
        assert_eq!(seen[0].1, EntryKind::Directory);
        assert_eq!(
            seen[1],
            ("docs/a.txt".to_string(), EntryKind::File, Some(0o640), t, None, "hello".to_string())
        );
        assert_eq!(seen[2].1, EntryKind::Symlink);
        assert_eq!(seen[2].4.as_deref(), Some("target.txt"));

        let mut out = Vec::new();
        assert!(source.read_entry(1, &mut out)?);
        assert_eq!(out, b"hello");
        Ok(())
    }

    #[test]
    fn utc_archives_declare_their_zone() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        for (zone, marked) in [(TimeZoneMode::Utc, true), (TimeZoneMode::Local, false)] {
            let path = dir.path().join(format!("{zone:?}.zip"));
            let mut sink: Box<dyn ArchiveSink> = Box::new(ZipSink::new(fs::File::create(&path)?, zone));
            sink.write_metadata(&header("docs", EntryKind::Directory, 0o755))?;
            sink.finish()?;

            let source = ZipSource::new(fs::File::open(&path)?, TimeZoneMode::Local)?;
            assert_eq!(source.archive.comment() == UTC_TIMES_COMMENT, marked);
            let expected = if marked { TimeZoneMode::Utc } else { TimeZoneMode::Local };
            assert_eq!(source.zone, expected, "{zone:?}");
        }
        Ok(())
    }

    #[test]
    fn dense_entries_are_stored_when_not_recompressing() {
        let options = WriteOptions { recompress_added_archives: false, ..WriteOptions::default() };
        let compressor = ZipEntryCompressor::new(&options);
        assert_eq!(compressor.method_for("lib/dep.jar"), CompressionMethod::Stored);
        assert_eq!(compressor.method_for("README.md"), CompressionMethod::Deflated);

        let recompress = ZipEntryCompressor::new(&WriteOptions::default());
        assert_eq!(recompress.method_for("lib/dep.jar"), CompressionMethod::Deflated);
    }
}
