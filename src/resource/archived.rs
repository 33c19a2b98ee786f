//! Another archive read as a resource collection.
//!
//! Each enumeration pass reads the archive's catalog once. Content is only decoded when a
//! handle is opened, on whichever thread opens it, by re-opening the archive and seeking to
//! the entry's position.

use crate::attributes::TimeZoneMode;
use crate::common::EntryKind;
use crate::format::ArchiveFormat;
use crate::resource::{CollectionOptions, ResourceCollection, ResourceHandle, ResourceReader, ResourceStream, TraversalOrder};
use crate::workers::spill::DEFAULT_SPILL_THRESHOLD;
use crate::ArchiverError;

use std::io::{self, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

#[derive(Debug)]
struct ArchiveLocation {
    path: PathBuf,
    format: ArchiveFormat,
    zone: TimeZoneMode,
}

/// Entries of an existing archive, filtered and renamed through [`CollectionOptions`].
#[derive(Debug, Clone)]
pub struct ArchivedCollection {
    location: Arc<ArchiveLocation>,
    options: CollectionOptions,
}

impl ArchivedCollection {
    /// Format inferred from the file name.
    pub fn new(path: impl Into<PathBuf>, options: CollectionOptions) -> Result<Self, ArchiverError> {
        let path = path.into();
        let format = ArchiveFormat::from_path(&path).ok_or_else(|| {
            ArchiverError::Configuration(format!("cannot tell the archive format of '{}'", path.display()))
        })?;
        Ok(Self::with_format(path, format, options))
    }

    pub fn with_format(path: impl Into<PathBuf>, format: ArchiveFormat, options: CollectionOptions) -> Self {
        let location = ArchiveLocation { path: path.into(), format, zone: TimeZoneMode::default() };
        Self { location: Arc::new(location), options }
    }

    /// How zip timestamps in the source are interpreted.
    pub fn with_time_zone(self, zone: TimeZoneMode) -> Self {
        let location = ArchiveLocation {
            path: self.location.path.clone(),
            format: self.location.format,
            zone,
        };
        Self { location: Arc::new(location), options: self.options }
    }

    pub fn path(&self) -> &Path {
        &self.location.path
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }
}

impl ResourceCollection for ArchivedCollection {
    fn resources(&self, order: TraversalOrder) -> Result<ResourceStream, ArchiverError> {
        let compiled = self.options.compile()?;
        let location = &self.location;
        let mut source = location.format.open_source(&location.path, location.zone)?;

        let mut handles: Vec<Arc<dyn ResourceHandle>> = Vec::new();
        let mut ordinal = 0;
        source.for_each_entry(&mut |entry| {
            let position = ordinal;
            ordinal += 1;
            if let Some(name) = compiled.entry_name(&entry.name) {
                let resource = ArchivedResource {
                    location: Arc::clone(location),
                    ordinal: position,
                    name,
                    kind: entry.kind,
                    size: entry.size,
                    mtime: entry.mtime,
                    mode: entry.mode,
                    target: entry.symlink_target,
                    readable: entry.data.is_some() || entry.kind != EntryKind::File,
                };
                handles.push(compiled.wrap(Arc::new(resource)));
            }
            Ok(ControlFlow::Continue(()))
        })?;
        debug!(archive = %location.path.display(), entries = handles.len(), "read archive catalog");

        if order == TraversalOrder::Sorted {
            handles.sort_by(|a, b| a.name().cmp(b.name()));
        }
        Ok(Box::new(handles.into_iter().map(Ok)))
    }
}

/// One entry of an [`ArchivedCollection`].
#[derive(Debug)]
pub struct ArchivedResource {
    location: Arc<ArchiveLocation>,
    ordinal: usize,
    name: String,
    kind: EntryKind,
    size: u64,
    mtime: Option<SystemTime>,
    mode: Option<u32>,
    target: Option<String>,
    readable: bool,
}

fn into_io(err: ArchiverError) -> io::Error {
    match err {
        ArchiverError::Io { source, .. } => source,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl ResourceHandle for ArchivedResource {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> EntryKind {
        self.kind
    }
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
    fn last_modified(&self) -> Option<SystemTime> {
        self.mtime
    }
    fn mode(&self) -> Option<u32> {
        self.mode
    }
    fn symlink_target(&self) -> Option<&str> {
        self.target.as_deref()
    }
    fn exists(&self) -> bool {
        self.location.path.exists()
    }
    fn open(&self) -> io::Result<ResourceReader> {
        if !self.readable {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("entry '{}' cannot be decoded", self.name),
            ));
        }
        let location = &self.location;
        let mut source = location.format.open_source(&location.path, location.zone).map_err(into_io)?;
        let mut buffer = tempfile::spooled_tempfile(DEFAULT_SPILL_THRESHOLD);
        if !source.read_entry(self.ordinal, &mut buffer).map_err(into_io)? {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("entry '{}' is no longer in '{}'", self.name, location.path.display()),
            ));
        }
        buffer.seek(SeekFrom::Start(0))?;
        Ok(Box::new(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::StreamCodec;
    use crate::fsx as fs;
    use std::io::Read;
    use tempfile::tempdir;

    fn write_tar(path: &Path) -> io::Result<()> {
        let mut builder = tar::Builder::new(fs::File::create(path)?);
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        builder.append_data(&mut dir, "conf/", io::empty())?;
        for (name, body) in [("conf/z.properties", "z=1"), ("conf/a.properties", "a=1"), ("notes.tmp", "x")] {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o600);
            builder.append_data(&mut header, name, body.as_bytes())?;
        }
        builder.into_inner()?;
        Ok(())
    }

    #[test]
    fn entries_are_renamed_filtered_and_readable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("base.tar");
        write_tar(&path)?;

        let coll = ArchivedCollection::new(&path, CollectionOptions::default().with_prefix("WEB-INF").exclude("*.tmp"))?;
        let handles: Vec<_> = coll.resources(TraversalOrder::Sorted)?.collect::<Result<_, _>>()?;
        let names: Vec<_> = handles.iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, vec!["WEB-INF/conf", "WEB-INF/conf/a.properties", "WEB-INF/conf/z.properties"]);

        let mut content = String::new();
        handles[2].open()?.read_to_string(&mut content)?;
        assert_eq!(content, "z=1");
        assert_eq!(handles[1].mode(), Some(0o600));
        assert_eq!(handles[0].kind(), EntryKind::Directory);
        Ok(())
    }

    #[test]
    fn unknown_extension_is_a_configuration_error() {
        let err = ArchivedCollection::new("blob.bin", CollectionOptions::default()).unwrap_err();
        assert!(matches!(err, ArchiverError::Configuration(_)));
        let explicit = ArchivedCollection::with_format("blob.bin", ArchiveFormat::Tar(StreamCodec::None), CollectionOptions::default());
        assert_eq!(explicit.path(), Path::new("blob.bin"));
    }
}
