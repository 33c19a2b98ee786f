//! Single resources: files on disk, in-memory content and content-less placeholders.

use crate::common::{EntryKind, Owner};
use crate::fsx as fs;
use crate::resource::{ResourceHandle, ResourceReader};

use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// A file, directory or symlink on the local filesystem.
///
/// Metadata is captured once when the handle is created; [`ResourceHandle::exists`] re-checks
/// the path so a file removed mid-build is reported instead of silently archived as empty.
#[derive(Debug, Clone)]
pub struct FileResource {
    path: PathBuf,
    name: String,
    kind: EntryKind,
    size: u64,
    mtime: Option<SystemTime>,
    mode: Option<u32>,
    owner: Owner,
    target: Option<String>,
}

impl FileResource {
    /// Describe `path` under the archive name `name`.
    ///
    /// With `follow_symlinks` a link is described by what it points to.
    pub fn from_path(path: &Path, name: &str, follow_symlinks: bool) -> io::Result<Self> {
        let meta = if follow_symlinks { fs::metadata(path)? } else { fs::symlink_metadata(path)? };
        let (kind, target) = if meta.file_type().is_symlink() {
            let target = fs::read_link(path)?.to_string_lossy().replace('\\', "/");
            (EntryKind::Symlink, Some(target))
        } else if meta.is_dir() {
            (EntryKind::Directory, None)
        } else {
            (EntryKind::File, None)
        };
        let (uid, gid) = fs::owner_ids(&meta);
        Ok(Self {
            path: path.to_path_buf(),
            name: name.to_string(),
            kind,
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            mtime: meta.modified().ok(),
            mode: fs::maybe_unix_mode(&meta),
            owner: Owner { uid, gid, ..Owner::default() },
            target,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResourceHandle for FileResource {
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
    fn owner(&self) -> Owner {
        self.owner.clone()
    }
    fn symlink_target(&self) -> Option<&str> {
        self.target.as_deref()
    }
    fn exists(&self) -> bool {
        fs::symlink_metadata(&self.path).is_ok()
    }
    fn open(&self) -> io::Result<ResourceReader> {
        Ok(Box::new(fs::File::open(&self.path)?))
    }
}

/// File content held in memory.
#[derive(Debug, Clone)]
pub struct MemoryResource {
    name: String,
    bytes: Arc<[u8]>,
    mode: Option<u32>,
    mtime: Option<SystemTime>,
}

impl MemoryResource {
    pub fn new(name: &str, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self { name: name.to_string(), bytes: bytes.into(), mode: None, mtime: None }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }
}

impl ResourceHandle for MemoryResource {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> EntryKind {
        EntryKind::File
    }
    fn size(&self) -> Option<u64> {
        Some(self.bytes.len() as u64)
    }
    fn last_modified(&self) -> Option<SystemTime> {
        self.mtime
    }
    fn mode(&self) -> Option<u32> {
        self.mode
    }
    fn open(&self) -> io::Result<ResourceReader> {
        Ok(Box::new(Cursor::new(Arc::clone(&self.bytes))))
    }
}

/// A directory or symlink with no backing item.
#[derive(Debug, Clone)]
pub struct VirtualResource {
    name: String,
    kind: EntryKind,
    target: Option<String>,
    mtime: Option<SystemTime>,
}

impl VirtualResource {
    pub fn directory(name: &str) -> Self {
        Self { name: name.to_string(), kind: EntryKind::Directory, target: None, mtime: None }
    }

    pub fn symlink(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EntryKind::Symlink,
            target: Some(target.to_string()),
            mtime: None,
        }
    }

    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }
}

impl ResourceHandle for VirtualResource {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> EntryKind {
        self.kind
    }
    fn size(&self) -> Option<u64> {
        Some(0)
    }
    fn last_modified(&self) -> Option<SystemTime> {
        self.mtime
    }
    fn mode(&self) -> Option<u32> {
        None
    }
    fn symlink_target(&self) -> Option<&str> {
        self.target.as_deref()
    }
    fn open(&self) -> io::Result<ResourceReader> {
        Ok(Box::new(io::empty()))
    }
}
