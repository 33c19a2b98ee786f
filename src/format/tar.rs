//! tar adapter over the `tar` crate, with an optional whole-stream codec.
//!
//! Entry content is not encoded per entry: workers only read (and rewrite) the resource into a
//! segment so the owning thread never blocks on slow sources; the record is emitted at drain
//! time and the codec compresses the stream as a whole.

use super::{ArchiveSink, ArchiveSource, EntryCompressor, SourceEntry};
use crate::attributes::TimeGranularity;
use crate::common::{EntryHeader, EntryKind};
use crate::compress::{CodecWriter, StreamCodec};
use crate::workers::spill::SpillableSegment;
use crate::ArchiverError;

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

/// Buffers file content unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarEntryCompressor;

impl EntryCompressor for TarEntryCompressor {
    fn compress(&self, _header: &EntryHeader, input: &mut dyn Read, segment: &mut SpillableSegment) -> io::Result<()> {
        io::copy(input, segment)?;
        Ok(())
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    TimeGranularity::Seconds
        .normalize(t)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn record_header(entry: &EntryHeader, entry_type: EntryType, size: u64) -> io::Result<Header> {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(entry.attributes.mode);
    header.set_mtime(unix_secs(entry.attributes.mtime));
    let owner = &entry.attributes.owner;
    header.set_uid(owner.uid.unwrap_or(0) as u64);
    header.set_gid(owner.gid.unwrap_or(0) as u64);
    if let Some(user) = &owner.user_name {
        header.set_username(user)?;
    }
    if let Some(group) = &owner.group_name {
        header.set_groupname(group)?;
    }
    Ok(header)
}

/// Appends GNU tar records in call order.
pub struct TarSink<W: Write> {
    builder: Builder<CodecWriter<W>>,
}

impl<W: Write> TarSink<W> {
    pub fn new(out: W, codec: StreamCodec, level: Option<u32>) -> Result<Self, ArchiverError> {
        Ok(Self { builder: Builder::new(CodecWriter::new(codec, out, level)?) })
    }
}

impl<W: Write> ArchiveSink for TarSink<W> {
    fn write_metadata(&mut self, entry: &EntryHeader) -> Result<(), ArchiverError> {
        let name = entry.name.as_str();
        let written = match entry.kind {
            EntryKind::Directory => record_header(entry, EntryType::Directory, 0)
                .and_then(|mut h| self.builder.append_data(&mut h, format!("{name}/"), io::empty())),
            EntryKind::Symlink => {
                let target = entry.symlink_target.as_deref().unwrap_or_default();
                record_header(entry, EntryType::Symlink, 0)
                    .and_then(|mut h| self.builder.append_link(&mut h, name, target))
            }
            EntryKind::File => record_header(entry, EntryType::Regular, 0)
                .and_then(|mut h| self.builder.append_data(&mut h, name, io::empty())),
        };
        written.map_err(|e| ArchiverError::entry("writing", name, e))
    }

    fn write_segment(&mut self, entry: &EntryHeader, segment: &mut SpillableSegment) -> Result<(), ArchiverError> {
        let name = entry.name.as_str();
        let appended = (|| {
            let size = segment.len()?;
            segment.seek(SeekFrom::Start(0))?;
            let mut header = record_header(entry, EntryType::Regular, size)?;
            self.builder.append_data(&mut header, name, &mut *segment)
        })();
        appended.map_err(|e| ArchiverError::entry("writing", name, e))?;
        segment.release();
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), ArchiverError> {
        let codec = self.builder.into_inner()?;
        let mut out = codec.finish()?;
        out.flush()?;
        Ok(())
    }
}

/// Enumerates a (decoded) tar stream. Single pass: a second enumeration is an error.
pub struct TarSource {
    archive: Archive<Box<dyn Read + Send>>,
    consumed: bool,
}

impl TarSource {
    pub fn new(input: Box<dyn Read + Send>) -> Self {
        Self { archive: Archive::new(input), consumed: false }
    }
}

impl ArchiveSource for TarSource {
    fn for_each_entry(
        &mut self,
        visit: &mut dyn FnMut(SourceEntry<'_>) -> Result<ControlFlow<()>, ArchiverError>,
    ) -> Result<(), ArchiverError> {
        if self.consumed {
            return Err(ArchiverError::Other("tar stream has already been enumerated".into()));
        }
        self.consumed = true;

        for item in self.archive.entries()? {
            let mut entry = item?;
            let header = entry.header();
            let kind = match header.entry_type() {
                EntryType::Directory => EntryKind::Directory,
                EntryType::Symlink => EntryKind::Symlink,
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => EntryKind::File,
                other => {
                    debug!(?other, "skipping tar entry of unsupported type");
                    continue;
                }
            };
            let mode = header.mode().ok().map(|m| m & 0o7777);
            let mtime = header.mtime().ok().map(|s| UNIX_EPOCH + Duration::from_secs(s));
            let size = entry.size();
            let name = entry
                .path()
                .map_err(|e| ArchiverError::entry("reading", "<tar header>", e))?
                .to_string_lossy()
                .into_owned();
            let symlink_target = if kind == EntryKind::Symlink {
                entry
                    .link_name()
                    .map_err(|e| ArchiverError::entry("reading", &name, e))?
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            } else {
                None
            };
            let data: Option<&mut dyn Read> = if kind == EntryKind::File { Some(&mut entry) } else { None };

            let source_entry = SourceEntry { name, kind, mode, mtime, symlink_target, size, data };
            if visit(source_entry)?.is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{EntryAttributes, Owner};
    use crate::compress::decoder;
    use crate::fsx as fs;
    use tempfile::tempdir;

    fn header(name: &str, kind: EntryKind) -> EntryHeader {
        EntryHeader {
            name: name.to_string(),
            kind,
            attributes: EntryAttributes {
                mode: 0o640,
                owner: Owner { uid: Some(0), user_name: Some("root".into()), gid: Some(0), group_name: None },
                mtime: UNIX_EPOCH + Duration::new(1_600_000_000, 900_000_000),
            },
            symlink_target: (kind == EntryKind::Symlink).then(|| "../a.txt".to_string()),
            size: None,
        }
    }

    #[test]
    fn gzip_tar_records_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("out.tar.gz");
        let mut sink: Box<dyn ArchiveSink> =
            Box::new(TarSink::new(fs::File::create(&path)?, StreamCodec::Gzip, None)?);

        sink.write_metadata(&header("d", EntryKind::Directory))?;
        let file = header("d/a.txt", EntryKind::File);
        let mut segment = SpillableSegment::new(4);
        TarEntryCompressor.compress(&file, &mut &b"tar content"[..], &mut segment)?;
        sink.write_segment(&file, &mut segment)?;
        sink.write_metadata(&header("d/link", EntryKind::Symlink))?;
        sink.finish()?;

        let mut source = TarSource::new(decoder(StreamCodec::Gzip, fs::File::open(&path)?)?);
        let mut seen = Vec::new();
        source.for_each_entry(&mut |entry| {
            let mut content = String::new();
            if let Some(data) = entry.data {
                data.read_to_string(&mut content)?;
            }
            seen.push((entry.name, entry.kind, entry.mode, entry.mtime, entry.symlink_target, content));
            Ok(ControlFlow::Continue(()))
        })?;

        let t = Some(UNIX_EPOCH + Duration::from_secs(1_600_000_000));
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].1, EntryKind::Directory);
        assert_eq!(
            seen[1],
            ("d/a.txt".to_string(), EntryKind::File, Some(0o640), t, None, "tar content".to_string())
        );
        assert_eq!(seen[2].1, EntryKind::Symlink);
        assert_eq!(seen[2].4.as_deref(), Some("../a.txt"));

        assert!(source.for_each_entry(&mut |_| Ok(ControlFlow::Continue(()))).is_err());
        Ok(())
    }
}
