//! A directory tree on the local filesystem as a resource collection.

use crate::resource::file::FileResource;
use crate::resource::{CollectionOptions, ResourceCollection, ResourceHandle, ResourceStream, TraversalOrder};
use crate::ArchiverError;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

/// Every file, directory and symlink below `root`, named relative to it.
#[derive(Debug, Clone)]
pub struct DirectoryCollection {
    root: PathBuf,
    options: CollectionOptions,
}

impl DirectoryCollection {
    pub fn new(root: impl Into<PathBuf>, options: CollectionOptions) -> Self {
        Self { root: root.into(), options }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }
}

impl ResourceCollection for DirectoryCollection {
    fn resources(&self, order: TraversalOrder) -> Result<ResourceStream, ArchiverError> {
        if !self.root.is_dir() {
            return Err(ArchiverError::ResourceNotFound { name: self.root.display().to_string() });
        }
        let compiled = self.options.compile()?;
        let follow = self.options.follow_symlinks;
        let root = self.root.clone();

        let mut walker = WalkDir::new(&self.root).min_depth(1).follow_links(follow);
        if order == TraversalOrder::Sorted {
            walker = walker.sort_by_file_name();
        }
        debug!(root = %root.display(), ?order, "enumerating directory");

        let stream = walker.into_iter().filter_map(move |item| {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    return Some(Err(ArchiverError::io(io::Error::from(e), path)));
                }
            };
            let relative = entry.path().strip_prefix(&root).ok()?;
            let name = compiled.entry_name(&relative.to_string_lossy())?;
            match FileResource::from_path(entry.path(), &name, follow) {
                Ok(res) => {
                    let handle: Arc<dyn ResourceHandle> = Arc::new(res);
                    Some(Ok(compiled.wrap(handle)))
                }
                // removed between listing and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => Some(Err(ArchiverError::ResourceNotFound { name })),
                Err(e) => Some(Err(ArchiverError::io(e, entry.path()))),
            }
        });
        Ok(Box::new(stream))
    }
}
