//! # Archive Assembly
//!
//! [`Archiver`] collects additions (single files, directory trees, other archives, in-memory
//! content) and turns them into one container per [`Archiver::build`] call:
//!
//! 1. validate the configuration before touching anything;
//! 2. skip the build if the destination is newer than every input (unless `force`);
//! 3. in update mode, move the existing archive aside and queue its entries last;
//! 4. run the [`ResourceIterator`] on this thread, synthesizing missing parent directories,
//!    and feed the [`ConcurrentEntryWriter`];
//! 5. on failure, delete the partial output and put the original back.
//!
//! The queue of additions is cleared by every build, successful or not.

pub mod dirs;
pub mod iterate;

pub use dirs::DirectorySet;
pub use iterate::{ArchiveEntry, DuplicatePolicy, EntrySpec, IterationSettings, PendingAddition, ResourceIterator};

use crate::attributes::{AttributeResolver, CollectionOverrides, PermissionConfig, ReproducibilityConfig, TimeZoneMode};
use crate::common::{normalize_name, EntryKind};
use crate::compress::CompressionAlgo;
use crate::format::{ArchiveFormat, WriteOptions};
use crate::fsx as fs;
use crate::resource::archived::ArchivedCollection;
use crate::resource::directory::DirectoryCollection;
use crate::resource::file::{FileResource, MemoryResource, VirtualResource};
use crate::resource::{CollectionOptions, ResourceCollection, ResourceHandle, TraversalOrder};
use crate::workers::spill::DEFAULT_SPILL_THRESHOLD;
use crate::workers::{ConcurrentEntryWriter, WriterStats};
use crate::ArchiverError;

use serde::{Deserialize, Serialize};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{PathPersistError, TempPath};
use tracing::{debug, info, warn};

/// Holds all configuration options for building an archive.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ArchiverConfig {
    /// Output path. Its extension selects the format unless `format` is set.
    pub destination: Option<PathBuf>,
    pub format: Option<ArchiveFormat>,
    pub permissions: PermissionConfig,
    pub duplicate_policy: DuplicatePolicy,
    /// Byte-reproducible output when set.
    pub reproducible: Option<ReproducibilityConfig>,
    pub include_empty_dirs: bool,
    /// Allow an archive without any file entry.
    pub allow_empty: bool,
    /// Rebuild even if the destination is newer than every input.
    pub force: bool,
    /// Keep the entries of an existing destination that are not added again.
    pub update: bool,
    /// Compression workers; 0 means one per CPU.
    pub threads: usize,
    /// Per-entry buffer size before spilling to a temporary file.
    pub spill_threshold: usize,
    /// Per-entry method (zip only).
    pub compression: CompressionAlgo,
    pub compression_level: Option<i32>,
    /// Level of the whole-stream codec (compressed tarballs only).
    pub codec_level: Option<u32>,
    /// Compress entries that already look compressed (zip only).
    pub recompress_added_archives: bool,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            destination: None,
            format: None,
            permissions: PermissionConfig::default(),
            duplicate_policy: DuplicatePolicy::default(),
            reproducible: None,
            include_empty_dirs: true,
            allow_empty: false,
            force: true,
            update: false,
            threads: 0,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            compression: CompressionAlgo::default(),
            compression_level: None,
            codec_level: None,
            recompress_added_archives: true,
        }
    }
}

impl ArchiverConfig {
    pub fn from_json(text: &str) -> Result<Self, ArchiverError> {
        serde_json::from_str(text)
            .map_err(|e| ArchiverError::Configuration(format!("invalid archiver configuration: {e}")))
    }

    /// Turn on reproducible mode if `SOURCE_DATE_EPOCH` is set and no explicit config exists.
    pub fn with_source_date_epoch(mut self) -> Self {
        if self.reproducible.is_none() {
            self.reproducible = ReproducibilityConfig::from_source_date_epoch();
        }
        self
    }
}

/// Result of a successful [`Archiver::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The archive was written with this many records (directories included).
    Created { entries: usize },
    /// The destination was newer than every input; nothing was written.
    UpToDate,
}

/// Assembles archives from queued additions.
///
/// One instance drives one build at a time; it is not meant to be shared across threads.
#[derive(Debug)]
pub struct Archiver {
    config: ArchiverConfig,
    additions: Vec<PendingAddition>,
}

impl Archiver {
    pub fn new(config: ArchiverConfig) -> Self {
        Self { config, additions: Vec::new() }
    }

    /// An archiver with default settings writing to `destination`.
    pub fn with_destination(destination: impl Into<PathBuf>) -> Self {
        Self::new(ArchiverConfig { destination: Some(destination.into()), ..ArchiverConfig::default() })
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ArchiverConfig {
        &mut self.config
    }

    // --- additions ---

    /// Queue one file. `dest_name` defaults to the file name; `mode` beats every other tier.
    pub fn add_file(&mut self, path: impl AsRef<Path>, dest_name: Option<&str>, mode: Option<u32>) -> Result<(), ArchiverError> {
        let path = path.as_ref();
        let meta = fs::symlink_metadata(path).map_err(|_| {
            ArchiverError::Configuration(format!("source file '{}' does not exist", path.display()))
        })?;
        if meta.is_dir() {
            return Err(ArchiverError::Configuration(format!(
                "'{}' is a directory, add it with add_directory",
                path.display()
            )));
        }
        let name = match dest_name {
            Some(name) => normalize_name(name),
            None => path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        };
        let name = self.checked_name(&name)?;
        let resource = FileResource::from_path(path, &name, false).map_err(|e| ArchiverError::io(e, path))?;
        self.push_entry(Arc::new(resource), name, mode);
        Ok(())
    }

    /// Queue every resource below `path`.
    pub fn add_directory(&mut self, path: impl AsRef<Path>, options: CollectionOptions) -> Result<(), ArchiverError> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(ArchiverError::Configuration(format!(
                "source directory '{}' does not exist",
                path.display()
            )));
        }
        let overrides = options.modes;
        self.add_collection(Arc::new(DirectoryCollection::new(path, options)), overrides);
        Ok(())
    }

    /// Queue the entries of another archive.
    pub fn add_archived_file_set(&mut self, path: impl AsRef<Path>, options: CollectionOptions) -> Result<(), ArchiverError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ArchiverError::Configuration(format!(
                "source archive '{}' does not exist",
                path.display()
            )));
        }
        let overrides = options.modes;
        self.add_collection(Arc::new(ArchivedCollection::new(path, options)?), overrides);
        Ok(())
    }

    /// Queue any collection, forcing `overrides` on everything it yields.
    pub fn add_collection(&mut self, collection: Arc<dyn ResourceCollection>, overrides: CollectionOverrides) {
        self.additions.push(PendingAddition::Collection { collection, overrides, duplicates: None });
    }

    /// Queue a single resource under `name`.
    pub fn add_resource(&mut self, resource: Arc<dyn ResourceHandle>, name: &str, mode: Option<u32>) -> Result<(), ArchiverError> {
        let name = self.checked_name(name)?;
        self.push_entry(resource, name, mode);
        Ok(())
    }

    /// Queue in-memory content.
    pub fn add_bytes(&mut self, name: &str, bytes: impl Into<Arc<[u8]>>, mode: Option<u32>) -> Result<(), ArchiverError> {
        let name = self.checked_name(name)?;
        self.push_entry(Arc::new(MemoryResource::new(&name, bytes)), name, mode);
        Ok(())
    }

    pub fn add_symlink(&mut self, name: &str, target: &str) -> Result<(), ArchiverError> {
        let name = self.checked_name(name)?;
        self.push_entry(Arc::new(VirtualResource::symlink(&name, target)), name, None);
        Ok(())
    }

    pub fn add_empty_directory(&mut self, name: &str, mode: Option<u32>) -> Result<(), ArchiverError> {
        let name = self.checked_name(name)?;
        self.push_entry(Arc::new(VirtualResource::directory(&name)), name, mode);
        Ok(())
    }

    fn checked_name(&self, name: &str) -> Result<String, ArchiverError> {
        let name = normalize_name(name);
        if name.is_empty() {
            return Err(ArchiverError::Configuration("entry name is empty".into()));
        }
        Ok(name)
    }

    fn push_entry(&mut self, resource: Arc<dyn ResourceHandle>, name: String, mode: Option<u32>) {
        self.additions.push(PendingAddition::Entry(EntrySpec { resource, name, mode }));
    }

    // --- iteration ---

    fn settings(&self) -> IterationSettings {
        let reproducible = self.config.reproducible.is_some();
        IterationSettings {
            duplicates: self.config.duplicate_policy,
            resolver: AttributeResolver::new(self.config.permissions.clone(), self.config.reproducible.clone()),
            order: if reproducible { TraversalOrder::Sorted } else { TraversalOrder::Native },
            include_empty_dirs: self.config.include_empty_dirs,
        }
    }

    /// A fresh pass over everything queued so far, as the next build would see it.
    pub fn entries(&self) -> ResourceIterator {
        ResourceIterator::new(self.additions.clone(), self.settings())
    }

    // --- build ---

    fn validate(&self) -> Result<(PathBuf, ArchiveFormat), ArchiverError> {
        let dest = self
            .config
            .destination
            .clone()
            .ok_or_else(|| ArchiverError::Configuration("no destination set".into()))?;
        if dest.is_dir() {
            return Err(ArchiverError::Configuration(format!(
                "destination '{}' is a directory",
                dest.display()
            )));
        }
        let format = self.config.format.or_else(|| ArchiveFormat::from_path(&dest)).ok_or_else(|| {
            ArchiverError::Configuration(format!("cannot tell the archive format of '{}'", dest.display()))
        })?;
        if let Some(level) = self.config.compression_level {
            let valid = match self.config.compression {
                CompressionAlgo::Store => true,
                CompressionAlgo::Deflate => (0..=9).contains(&level),
                CompressionAlgo::Zstd => (1..=22).contains(&level),
            };
            if !valid {
                return Err(ArchiverError::Configuration(format!(
                    "compression level {level} is out of range for {:?}",
                    self.config.compression
                )));
            }
        }
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ArchiverError::io(e, parent))?;
        }
        Ok((dest, format))
    }

    /// True if `dest` exists and is at least as new as every queued input.
    fn is_up_to_date(&self, dest: &Path, additions: &[PendingAddition]) -> Result<bool, ArchiverError> {
        let Ok(dest_time) = fs::metadata(dest).and_then(|m| m.modified()) else {
            return Ok(false);
        };
        if additions.is_empty() {
            return Ok(false);
        }
        for entry in ResourceIterator::new(additions.to_vec(), self.settings()) {
            let entry = entry?;
            if entry.kind() != EntryKind::File {
                continue;
            }
            match entry.resource.last_modified() {
                Some(t) if t <= dest_time => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Write the archive from everything queued, then clear the queue.
    pub fn build(&mut self) -> Result<BuildOutcome, ArchiverError> {
        let mut additions = std::mem::take(&mut self.additions);
        let (dest, format) = self.validate()?;

        if !self.config.force && self.is_up_to_date(&dest, &additions)? {
            info!(destination = %dest.display(), "archive is up to date");
            return Ok(BuildOutcome::UpToDate);
        }

        let backup = if self.config.update && dest.exists() {
            Some(self.stash_original(&dest, format, &mut additions)?)
        } else {
            None
        };

        info!(destination = %dest.display(), ?format, additions = additions.len(), "building archive");
        let mut created = false;
        let result = fs::File::create(&dest)
            .map_err(|e| ArchiverError::io(e, &dest))
            .and_then(|out| {
                created = true;
                self.write_archive(&dest, out, format, additions)
            });

        match result {
            Ok(stats) => {
                if let Some(backup) = backup {
                    if let Err(e) = backup.close() {
                        warn!(error = %e, "could not remove the previous archive");
                    }
                }
                info!(destination = %dest.display(), entries = stats.total(), "archive written");
                Ok(BuildOutcome::Created { entries: stats.total() })
            }
            Err(err) => Err(revert(&dest, created, backup, err)),
        }
    }

    /// Move the existing destination aside and queue its entries behind everything else.
    fn stash_original(
        &self,
        dest: &Path,
        format: ArchiveFormat,
        additions: &mut Vec<PendingAddition>,
    ) -> Result<TempPath, ArchiverError> {
        let dir = dest.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let backup = tempfile::Builder::new()
            .prefix(".blitzpack-")
            .suffix(".orig")
            .tempfile_in(dir)
            .map_err(|e| ArchiverError::io(e, dir))?
            .into_temp_path();
        fs::rename(dest, &backup).map_err(|e| ArchiverError::io(e, dest))?;
        debug!(backup = %backup.display(), "moved existing archive aside");

        let options = CollectionOptions { use_default_excludes: false, ..CollectionOptions::default() };
        additions.push(PendingAddition::Collection {
            collection: Arc::new(ArchivedCollection::with_format(backup.to_path_buf(), format, options)),
            overrides: CollectionOverrides::default(),
            duplicates: Some(DuplicatePolicy::Skip),
        });
        Ok(backup)
    }

    fn write_archive(
        &self,
        dest: &Path,
        out: fs::File,
        format: ArchiveFormat,
        additions: Vec<PendingAddition>,
    ) -> Result<WriterStats, ArchiverError> {
        let options = WriteOptions {
            compression: self.config.compression,
            compression_level: self.config.compression_level,
            codec_level: self.config.codec_level,
            recompress_added_archives: self.config.recompress_added_archives,
            zone: if self.config.reproducible.is_some() { TimeZoneMode::Utc } else { TimeZoneMode::Local },
        };
        let (compressor, sink) = format.writer(BufWriter::new(out), &options)?;
        let mut writer =
            ConcurrentEntryWriter::new(compressor, sink, self.config.threads, self.config.spill_threshold)?;

        let mut dirs = DirectorySet::new();
        let mut files = 0;
        for entry in ResourceIterator::new(additions, self.settings()) {
            let entry = entry?;
            for parent in dirs.missing_parents(entry.name()) {
                writer.submit_metadata(entry.parent_header(parent))?;
            }
            match entry.kind() {
                EntryKind::Directory => {
                    if dirs.insert(entry.name()) {
                        writer.submit_metadata(entry.header)?;
                    }
                }
                EntryKind::Symlink => writer.submit_metadata(entry.header)?,
                EntryKind::File => {
                    files += 1;
                    writer.submit_file(entry.header, entry.resource)?;
                }
            }
        }
        // checked before the container is finalized; the caller reverts the partial output
        if files == 0 && !self.config.allow_empty {
            return Err(ArchiverError::EmptyArchive { path: dest.to_path_buf() });
        }
        writer.finish()
    }
}

/// Remove a partial output and restore the original, keeping `err` as the primary error.
fn revert(dest: &Path, created: bool, backup: Option<TempPath>, err: ArchiverError) -> ArchiverError {
    warn!(destination = %dest.display(), error = %err, "build failed, reverting");
    let mut problems = Vec::new();
    if created {
        match fs::remove_file(dest) {
            Ok(()) => debug!("removed partial archive"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => problems.push(format!("could not remove partial archive: {e}")),
        }
    }
    if let Some(backup) = backup {
        match backup.persist(dest) {
            Ok(()) => info!(destination = %dest.display(), "restored previous archive"),
            Err(PathPersistError { error, path }) => {
                let kept = path
                    .keep()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "<unknown>".to_string());
                problems.push(format!("could not restore previous archive, it is kept at {kept}: {error}"));
            }
        }
    }
    if problems.is_empty() {
        err
    } else {
        ArchiverError::RevertFailed { source: Box::new(err), detail: problems.join("; ") }
    }
}
