//! # Extraction Module
//!
//! Replays the entries of an existing container onto a destination directory. Extraction is
//! sequential; per entry:
//!
//! 1. filter by `path` prefix and include/exclude patterns, then apply the name mappers;
//! 2. resolve the name inside the destination root and reject anything that escapes it,
//!    including escapes through symlinks already on disk;
//! 3. decide whether an existing target is overwritten;
//! 4. create parents and materialize the symlink, directory or file;
//! 5. restore the modification time and, unless ignored, the permission bits.
//!
//! Path escapes and the output cap abort the whole run. A file entry whose content cannot be
//! decoded is logged and skipped.

use crate::attributes::TimeZoneMode;
use crate::common::{normalize_name, EntryKind};
use crate::format::{ArchiveFormat, ArchiveSource, SourceEntry};
use crate::fsx as fs;
use crate::mapper::FileMapper;
use crate::resource::selector::PathSelector;
use crate::ArchiverError;

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Options for one or more extraction runs.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExtractOptions {
    /// Replace targets that are not older than the entry.
    pub overwrite: bool,
    /// Do not restore permission bits on files and symlinks. Directories always get theirs.
    pub ignore_permissions: bool,
    /// Cap on the total bytes written by one run.
    pub max_output_size: Option<u64>,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    /// Read zip timestamps as UTC instead of local time.
    pub utc_timestamps: bool,
    /// Container type; inferred from the source name when unset.
    pub format: Option<ArchiveFormat>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            overwrite: true,
            ignore_permissions: false,
            max_output_size: None,
            includes: Vec::new(),
            excludes: Vec::new(),
            utc_timestamps: false,
            format: None,
        }
    }
}

impl ExtractOptions {
    pub fn from_json(text: &str) -> Result<Self, ArchiverError> {
        serde_json::from_str(text)
            .map_err(|e| ArchiverError::Configuration(format!("invalid extraction options: {e}")))
    }
}

/// Totals of one extraction run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub extracted: usize,
    /// Entries left alone by the overwrite rule or for lack of content.
    pub skipped: usize,
    pub bytes_written: u64,
}

/// Metadata of one entry as returned by [`Extractor::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: Option<u32>,
    pub mtime: Option<SystemTime>,
    pub symlink_target: Option<String>,
}

/// Unpacks containers onto the filesystem.
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    options: ExtractOptions,
    mappers: Vec<Arc<dyn FileMapper>>,
}

impl Extractor {
    pub fn new(options: ExtractOptions) -> Self {
        Self { options, mappers: Vec::new() }
    }

    /// Append a mapper; mappers run in the order they were added.
    pub fn with_mapper(mut self, mapper: Arc<dyn FileMapper>) -> Self {
        self.mappers.push(mapper);
        self
    }

    pub fn options(&self) -> &ExtractOptions {
        &self.options
    }

    fn open(&self, source: &Path) -> Result<Box<dyn ArchiveSource + Send>, ArchiverError> {
        if !source.is_file() {
            return Err(ArchiverError::Configuration(format!(
                "source archive '{}' does not exist",
                source.display()
            )));
        }
        let format = self.options.format.or_else(|| ArchiveFormat::from_path(source)).ok_or_else(|| {
            ArchiverError::Configuration(format!("cannot tell the archive format of '{}'", source.display()))
        })?;
        let zone = if self.options.utc_timestamps { TimeZoneMode::Utc } else { TimeZoneMode::Local };
        format.open_source(source, zone)
    }

    /// Extract `source` below `dest`. With `path`, only entries at or below that name are taken.
    pub fn extract(
        &self,
        source: impl AsRef<Path>,
        dest: impl AsRef<Path>,
        path: Option<&str>,
    ) -> Result<ExtractStats, ArchiverError> {
        let source = source.as_ref();
        let mut archive = self.open(source)?;
        info!(source = %source.display(), dest = %dest.as_ref().display(), "extracting archive");
        self.extract_from(archive.as_mut(), dest.as_ref(), path)
    }

    /// Extract from an already opened container.
    pub fn extract_from(
        &self,
        source: &mut dyn ArchiveSource,
        dest: &Path,
        path: Option<&str>,
    ) -> Result<ExtractStats, ArchiverError> {
        let selector = PathSelector::new(&self.options.includes, &self.options.excludes, false)?;
        fs::create_dir_all(dest).map_err(|e| ArchiverError::io(e, dest))?;
        let root = dest.canonicalize().map_err(|e| ArchiverError::io(e, dest))?;

        let mut run = ExtractRun {
            extractor: self,
            selector,
            scope: path.map(normalize_name).filter(|p| !p.is_empty()),
            root,
            stats: ExtractStats::default(),
            casing_warned: false,
        };
        source.for_each_entry(&mut |entry| {
            run.extract_entry(entry)?;
            Ok(ControlFlow::Continue(()))
        })?;

        let stats = run.stats;
        info!(
            extracted = stats.extracted,
            skipped = stats.skipped,
            bytes = stats.bytes_written,
            "extraction finished"
        );
        Ok(stats)
    }

    /// Entry metadata of `source` in container order. Nothing is decoded.
    pub fn list(&self, source: impl AsRef<Path>) -> Result<Vec<ListedEntry>, ArchiverError> {
        let mut archive = self.open(source.as_ref())?;
        let mut entries = Vec::new();
        archive.for_each_entry(&mut |entry| {
            entries.push(ListedEntry {
                name: entry.name,
                kind: entry.kind,
                size: entry.size,
                mode: entry.mode,
                mtime: entry.mtime,
                symlink_target: entry.symlink_target,
            });
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(entries)
    }

    fn map_name(&self, name: &str) -> String {
        self.mappers.iter().fold(name.to_string(), |current, mapper| mapper.map(&current))
    }
}

/// State of a single extraction call.
struct ExtractRun<'a> {
    extractor: &'a Extractor,
    selector: PathSelector,
    scope: Option<String>,
    root: PathBuf,
    stats: ExtractStats,
    casing_warned: bool,
}

impl ExtractRun<'_> {
    fn in_scope(&self, name: &str) -> bool {
        let under_path = match &self.scope {
            Some(scope) => name == scope || name.strip_prefix(scope.as_str()).map_or(false, |rest| rest.starts_with('/')),
            None => true,
        };
        under_path && self.selector.matches(name)
    }

    fn extract_entry(&mut self, mut entry: SourceEntry<'_>) -> Result<(), ArchiverError> {
        let stored = normalize_name(&entry.name);
        if stored.is_empty() || !self.in_scope(&stored) {
            return Ok(());
        }
        let mapped = normalize_name(&self.extractor.map_name(&stored));
        if mapped.is_empty() {
            debug!(entry = %entry.name, "mapped to an empty name, skipping");
            return Ok(());
        }
        let target = resolve_within(&self.root, &mapped).ok_or_else(|| ArchiverError::PathEscape {
            name: entry.name.clone(),
            root: self.root.clone(),
        })?;
        if target == self.root {
            debug!(entry = %entry.name, "entry names the destination root, skipping");
            return Ok(());
        }

        if !self.should_extract(&entry, &target) {
            debug!(entry = %entry.name, "target is up to date, skipping");
            self.stats.skipped += 1;
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiverError::io(e, parent))?;
        }
        if let Ok(meta) = fs::symlink_metadata(&target) {
            let replaceable = meta.file_type().is_symlink() || (meta.is_file() && entry.symlink_target.is_some());
            if replaceable {
                fs::remove_file(&target).map_err(|e| ArchiverError::io(e, &target))?;
            }
        }

        let kind = entry.kind;
        if let Some(link) = &entry.symlink_target {
            fs::create_symlink(link, &target).map_err(|e| ArchiverError::io(e, &target))?;
        } else if kind == EntryKind::Directory {
            fs::create_dir_all(&target).map_err(|e| ArchiverError::io(e, &target))?;
        } else {
            let Some(data) = entry.data.take() else {
                warn!(entry = %entry.name, "no content available for entry, skipping");
                self.stats.skipped += 1;
                return Ok(());
            };
            let written = self.copy_capped(&entry.name, data, &target)?;
            self.stats.bytes_written += written;
        }

        if let Some(mtime) = entry.mtime {
            fs::set_modified(&target, mtime).map_err(|e| ArchiverError::entry("setting time of", &entry.name, e))?;
        }
        let is_link = entry.symlink_target.is_some();
        let wants_mode = !self.extractor.options.ignore_permissions || kind == EntryKind::Directory;
        if let (Some(mode), true, false) = (entry.mode, wants_mode, is_link) {
            if let Err(source) = fs::set_unix_permissions(&target, mode) {
                let err = ArchiverError::PermissionApply { path: target.clone(), source };
                warn!(error = %err, "permissions not applied");
            }
        }
        self.stats.extracted += 1;
        Ok(())
    }

    /// Overwrite rule. Missing or older targets are always replaced; otherwise `overwrite` decides.
    fn should_extract(&mut self, entry: &SourceEntry<'_>, target: &Path) -> bool {
        let Ok(meta) = fs::symlink_metadata(target) else {
            return true;
        };
        if !self.casing_warned && entry.kind != EntryKind::Directory {
            if let Some(on_disk) = case_variant_on_disk(&self.root, target) {
                warn!(
                    entry = %entry.name,
                    on_disk = %on_disk,
                    "entry name and existing file differ only by case; the filesystem may be case-insensitive"
                );
                self.casing_warned = true;
            }
        }
        if let (Some(entry_time), Ok(disk_time)) = (entry.mtime, meta.modified()) {
            if disk_time < entry_time {
                return true;
            }
        }
        self.extractor.options.overwrite
    }

    /// Copy `data` into a fresh file at `target`, stopping exactly at the run's output cap.
    fn copy_capped(&mut self, name: &str, data: &mut dyn Read, target: &Path) -> Result<u64, ArchiverError> {
        let mut out = fs::File::create(target).map_err(|e| ArchiverError::io(e, target))?;
        let limit = self.extractor.options.max_output_size;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let n = match data.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ArchiverError::entry("reading", name, e)),
            };
            let mut chunk = &buf[..n];
            let mut exceeded = None;
            if let Some(limit) = limit {
                let remaining = limit.saturating_sub(self.stats.bytes_written + written);
                if chunk.len() as u64 > remaining {
                    chunk = &chunk[..remaining as usize];
                    exceeded = Some(limit);
                }
            }
            out.write_all(chunk).map_err(|e| ArchiverError::entry("writing", name, e))?;
            written += chunk.len() as u64;
            if let Some(limit) = exceeded {
                self.stats.bytes_written += written;
                warn!(entry = name, limit, "output limit reached");
                return Err(ArchiverError::OutputSizeExceeded { name: name.to_string(), limit });
            }
        }
        out.flush().map_err(|e| ArchiverError::entry("writing", name, e))?;
        Ok(written)
    }
}

/// Resolve `name` below `root`, or `None` if it would land outside.
///
/// The name is resolved lexically first; then the deepest ancestor that already exists is
/// canonicalized so that symlinks on disk cannot redirect the write. A name that folds back
/// to the root itself resolves to `root`.
fn resolve_within(root: &Path, name: &str) -> Option<PathBuf> {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            part => {
                let mut components = Path::new(part).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(_)), None) => parts.push(part),
                    _ => return None,
                }
            }
        }
    }
    if parts.is_empty() {
        return Some(root.to_path_buf());
    }
    let target = parts.iter().fold(root.to_path_buf(), |path, part| path.join(part));

    let mut existing = target.parent()?;
    while fs::symlink_metadata(existing).is_err() {
        existing = existing.parent()?;
    }
    let canonical = existing.canonicalize().ok()?;
    canonical.starts_with(root).then_some(target)
}

/// On-disk spelling of `target` below `root` when it matches only case-insensitively.
///
/// Every component is looked up in its parent directory, so `Dir/file` landing in an
/// existing `dir/` is reported as `dir/file`.
fn case_variant_on_disk(root: &Path, target: &Path) -> Option<String> {
    let relative = target.strip_prefix(root).ok()?;
    let mut dir = root.to_path_buf();
    let mut on_disk = Vec::new();
    let mut differs = false;
    for part in relative.components() {
        let wanted = part.as_os_str().to_string_lossy().into_owned();
        let mut exact = false;
        let mut variant = None;
        for entry in fs::read_dir(&dir).ok()?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == wanted {
                exact = true;
                break;
            }
            if variant.is_none() && name.eq_ignore_ascii_case(&wanted) {
                variant = Some(name);
            }
        }
        let actual = if exact {
            wanted
        } else {
            differs = true;
            variant?
        };
        dir.push(&actual);
        on_disk.push(actual);
    }
    differs.then(|| on_disk.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::tempdir;

    struct StubEntry {
        name: &'static str,
        kind: EntryKind,
        content: Option<&'static [u8]>,
        mtime: Option<SystemTime>,
        target: Option<String>,
    }

    fn file(name: &'static str, content: &'static [u8], mtime: SystemTime) -> StubEntry {
        StubEntry { name, kind: EntryKind::File, content: Some(content), mtime: Some(mtime), target: None }
    }

    struct StubSource(Vec<StubEntry>);

    impl ArchiveSource for StubSource {
        fn for_each_entry(
            &mut self,
            visit: &mut dyn FnMut(SourceEntry<'_>) -> Result<ControlFlow<()>, ArchiverError>,
        ) -> Result<(), ArchiverError> {
            for stub in &self.0 {
                let mut reader = stub.content.map(io::Cursor::new);
                let entry = SourceEntry {
                    name: stub.name.to_string(),
                    kind: stub.kind,
                    mode: Some(0o640),
                    mtime: stub.mtime,
                    symlink_target: stub.target.clone(),
                    size: stub.content.map_or(0, |c| c.len() as u64),
                    data: reader.as_mut().map(|r| r as &mut dyn Read),
                };
                if visit(entry)?.is_break() {
                    break;
                }
            }
            Ok(())
        }
    }

    fn hours_ago(h: u64) -> SystemTime {
        SystemTime::now() - Duration::from_secs(h * 3600)
    }

    #[test]
    fn overwrite_table() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let existing = dir.path().join("exists.txt");

        let check = |overwrite: bool, disk: SystemTime, entry: SystemTime| -> Result<String, Box<dyn std::error::Error>> {
            fs::write(&existing, b"disk")?;
            fs::set_modified(&existing, disk)?;
            let extractor = Extractor::new(ExtractOptions { overwrite, ..ExtractOptions::default() });
            let mut source = StubSource(vec![file("exists.txt", b"entry", entry)]);
            extractor.extract_from(&mut source, dir.path(), None)?;
            Ok(fs::read_to_string(&existing)?)
        };

        // entry newer than disk: always replaced
        assert_eq!(check(false, hours_ago(5), hours_ago(1))?, "entry");
        // entry older, overwrite off: kept
        assert_eq!(check(false, hours_ago(1), hours_ago(5))?, "disk");
        // entry older, overwrite on: replaced
        assert_eq!(check(true, hours_ago(1), hours_ago(5))?, "entry");

        let extractor = Extractor::new(ExtractOptions { overwrite: false, ..ExtractOptions::default() });
        let mut source = StubSource(vec![file("fresh.txt", b"new", hours_ago(5))]);
        let stats = extractor.extract_from(&mut source, dir.path(), None)?;
        assert_eq!(stats.extracted, 1);
        assert_eq!(fs::read_to_string(dir.path().join("fresh.txt"))?, "new");
        Ok(())
    }

    #[test]
    fn output_cap_stops_mid_entry() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let extractor = Extractor::new(ExtractOptions { max_output_size: Some(10), ..ExtractOptions::default() });
        let mut source = StubSource(vec![file("bomb.bin", b"eleven byte", UNIX_EPOCH)]);
        match extractor.extract_from(&mut source, dir.path(), None) {
            Err(ArchiverError::OutputSizeExceeded { name, limit }) => {
                assert_eq!(name, "bomb.bin");
                assert_eq!(limit, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fs::read(dir.path().join("bomb.bin"))?.len(), 10);

        let other = tempdir()?;
        let mut exact = StubSource(vec![file("a.bin", b"12345", UNIX_EPOCH), file("b.bin", b"67890", UNIX_EPOCH)]);
        assert_eq!(extractor.extract_from(&mut exact, other.path(), None)?.bytes_written, 10);
        Ok(())
    }

    #[test]
    fn missing_stream_skips_only_that_entry() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut source = StubSource(vec![
            StubEntry { name: "broken.bin", kind: EntryKind::File, content: None, mtime: None, target: None },
            file("ok.txt", b"ok", UNIX_EPOCH),
        ]);
        let stats = Extractor::default().extract_from(&mut source, dir.path(), None)?;
        assert_eq!(stats, ExtractStats { extracted: 1, skipped: 1, bytes_written: 2 });
        assert!(!dir.path().join("broken.bin").exists());
        Ok(())
    }

    #[test]
    fn traversal_is_rejected_before_anything_is_written() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let dest = dir.path().join("out");
        let mut source = StubSource(vec![file("../../evil.txt", b"x", UNIX_EPOCH)]);
        let err = Extractor::default().extract_from(&mut source, &dest, None).unwrap_err();
        assert!(matches!(err, ArchiverError::PathEscape { .. }));
        assert!(!dir.path().join("evil.txt").exists());

        let mut inner = StubSource(vec![file("a/../b.txt", b"b", UNIX_EPOCH)]);
        Extractor::default().extract_from(&mut inner, &dest, None)?;
        assert!(dest.join("b.txt").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_parent_cannot_redirect_writes() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let outside = tempdir()?;
        let dest = dir.path().join("out");
        let mut source = StubSource(vec![
            StubEntry {
                name: "escape",
                kind: EntryKind::Symlink,
                content: None,
                mtime: None,
                target: Some(outside.path().display().to_string()),
            },
            file("escape/owned.txt", b"x", UNIX_EPOCH),
        ]);
        let err = Extractor::default().extract_from(&mut source, &dest, None).unwrap_err();
        assert!(matches!(err, ArchiverError::PathEscape { .. }));
        assert!(!outside.path().join("owned.txt").exists());
        Ok(())
    }

    #[test]
    fn scope_and_selectors_filter_entries() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let extractor = Extractor::new(ExtractOptions { excludes: vec!["**/*.log".into()], ..ExtractOptions::default() });
        let mut source = StubSource(vec![
            file("docs/readme.md", b"r", UNIX_EPOCH),
            file("docs/build.log", b"l", UNIX_EPOCH),
            file("docsx/other.md", b"o", UNIX_EPOCH),
            file("src/main.rs", b"m", UNIX_EPOCH),
        ]);
        let stats = extractor.extract_from(&mut source, dir.path(), Some("docs"))?;
        assert_eq!(stats.extracted, 1);
        assert!(dir.path().join("docs/readme.md").exists());
        assert!(!dir.path().join("docs/build.log").exists());
        assert!(!dir.path().join("docsx").exists());
        Ok(())
    }

    #[test]
    fn resolve_within_rules() {
        let root = std::env::temp_dir().canonicalize().unwrap();
        assert_eq!(resolve_within(&root, "a/b.txt"), Some(root.join("a").join("b.txt")));
        assert_eq!(resolve_within(&root, "a/../../x"), None);
        assert_eq!(resolve_within(&root, ".."), None);
        assert_eq!(resolve_within(&root, "a/.."), Some(root.clone()));
        assert_eq!(resolve_within(&root, "sub/../"), Some(root.clone()));
    }

    #[test]
    fn entries_naming_the_root_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut source = StubSource(vec![
            StubEntry { name: "sub/../", kind: EntryKind::Directory, content: None, mtime: None, target: None },
            file("ok.txt", b"ok", UNIX_EPOCH),
        ]);
        let stats = Extractor::default().extract_from(&mut source, dir.path(), None)?;
        assert_eq!(stats.extracted, 1);
        assert_eq!(fs::read(dir.path().join("ok.txt"))?, b"ok");
        Ok(())
    }

    #[test]
    fn casing_differences_anywhere_in_the_path_are_found() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let root = dir.path().canonicalize()?;
        fs::create_dir_all(root.join("dir"))?;
        fs::write(root.join("dir/file.txt"), b"x")?;

        assert_eq!(case_variant_on_disk(&root, &root.join("Dir").join("file.txt")).as_deref(), Some("dir/file.txt"));
        assert_eq!(case_variant_on_disk(&root, &root.join("dir").join("FILE.txt")).as_deref(), Some("dir/file.txt"));
        assert_eq!(case_variant_on_disk(&root, &root.join("dir").join("file.txt")), None);
        assert_eq!(case_variant_on_disk(&root, &root.join("dir").join("other.txt")), None);
        Ok(())
    }
}
