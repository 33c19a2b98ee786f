//! # Resources
//!
//! A [`ResourceHandle`] is one named item (file, directory or symlink) that may end up in an
//! archive. A [`ResourceCollection`] is a lazily enumerated group of handles sharing one set of
//! [`CollectionOptions`]: a name prefix, include/exclude selection, a name mapper and an opaque
//! content-rewrite hook.
//!
//! Concrete collections live in the submodules: a directory tree ([`directory`]) and another
//! archive read as a virtual filesystem ([`archived`]). Single files and in-memory content are
//! in [`file`].

pub mod archived;
pub mod directory;
pub mod file;
pub mod selector;

use crate::attributes::CollectionOverrides;
use crate::common::{normalize_name, normalize_prefix, EntryKind, Owner};
use crate::mapper::FileMapper;
use crate::ArchiverError;
use selector::PathSelector;

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::SystemTime;

/// Boxed readable content handed to compression workers.
pub type ResourceReader = Box<dyn Read + Send>;

/// One lazily enumerated collection pass.
pub type ResourceStream = Box<dyn Iterator<Item = Result<Arc<dyn ResourceHandle>, ArchiverError>> + Send>;

/// One named item that can be added to an archive.
///
/// Handles are immutable for the duration of an enumeration pass and are shared with worker
/// threads, which call [`ResourceHandle::open`].
pub trait ResourceHandle: Send + Sync + fmt::Debug {
    /// Archive-relative name, forward-slash separated.
    fn name(&self) -> &str;
    fn kind(&self) -> EntryKind;
    /// Content size, `None` when unknown.
    fn size(&self) -> Option<u64>;
    /// Last modification time, `None` when unknown.
    fn last_modified(&self) -> Option<SystemTime>;
    /// Permission bits, `None` when unknown.
    fn mode(&self) -> Option<u32>;
    fn owner(&self) -> Owner {
        Owner::default()
    }
    fn symlink_target(&self) -> Option<&str> {
        None
    }
    /// Whether the backing item still exists.
    fn exists(&self) -> bool {
        true
    }
    /// Open the content for reading.
    fn open(&self) -> io::Result<ResourceReader>;
}

/// Order in which a collection enumerates its resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOrder {
    /// Whatever order the backing store produces.
    Native,
    /// Sorted by file name, for reproducible output.
    Sorted,
}

/// A lazily enumerable group of resources.
pub trait ResourceCollection: Send + Sync + fmt::Debug {
    /// Start one enumeration pass. Every call re-reads the backing store.
    fn resources(&self, order: TraversalOrder) -> Result<ResourceStream, ArchiverError>;
}

/// Opaque content-rewrite hook, invoked on a worker thread when an entry is opened.
pub trait ContentTransformer: Send + Sync + fmt::Debug {
    fn transform(&self, name: &str, input: ResourceReader) -> io::Result<ResourceReader>;
}

/// Naming, selection and rewrite settings shared by every collection type.
#[derive(Debug, Clone)]
pub struct CollectionOptions {
    /// Prepended to every mapped name.
    pub prefix: String,
    /// Ant-style patterns; empty means "include everything".
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    /// Also exclude VCS metadata and editor droppings.
    pub use_default_excludes: bool,
    /// Follow symlinks instead of recording them as symlink entries.
    pub follow_symlinks: bool,
    pub mapper: Option<Arc<dyn FileMapper>>,
    pub transformer: Option<Arc<dyn ContentTransformer>>,
    /// File and directory modes forced on everything this collection contributes.
    pub modes: CollectionOverrides,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            includes: Vec::new(),
            excludes: Vec::new(),
            use_default_excludes: true,
            follow_symlinks: false,
            mapper: None,
            transformer: None,
            modes: CollectionOverrides::default(),
        }
    }
}

impl CollectionOptions {
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn include(mut self, pattern: &str) -> Self {
        self.includes.push(pattern.to_string());
        self
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.excludes.push(pattern.to_string());
        self
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn FileMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn ContentTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn with_modes(mut self, file_mode: Option<u32>, dir_mode: Option<u32>) -> Self {
        self.modes = CollectionOverrides { file_mode, dir_mode };
        self
    }

    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Compile the options once per enumeration pass.
    pub(crate) fn compile(&self) -> Result<CompiledOptions, ArchiverError> {
        Ok(CompiledOptions {
            prefix: normalize_prefix(&self.prefix),
            selector: PathSelector::new(&self.includes, &self.excludes, self.use_default_excludes)?,
            mapper: self.mapper.clone(),
            transformer: self.transformer.clone(),
        })
    }
}

pub(crate) struct CompiledOptions {
    prefix: String,
    selector: PathSelector,
    mapper: Option<Arc<dyn FileMapper>>,
    transformer: Option<Arc<dyn ContentTransformer>>,
}

impl CompiledOptions {
    /// Final archive name for a collection-relative path, or `None` when it is not selected.
    pub(crate) fn entry_name(&self, relative: &str) -> Option<String> {
        let relative = normalize_name(relative);
        if relative.is_empty() || !self.selector.matches(&relative) {
            return None;
        }
        let mapped = match &self.mapper {
            Some(mapper) => normalize_name(&mapper.map(&relative)),
            None => relative,
        };
        if mapped.is_empty() {
            return None;
        }
        Some(format!("{}{}", self.prefix, mapped))
    }

    /// Attach the content-rewrite hook, if any.
    pub(crate) fn wrap(&self, handle: Arc<dyn ResourceHandle>) -> Arc<dyn ResourceHandle> {
        match (&self.transformer, handle.kind()) {
            (Some(transformer), EntryKind::File) => Arc::new(TransformedResource {
                inner: handle,
                transformer: Arc::clone(transformer),
            }),
            _ => handle,
        }
    }
}

/// A resource whose content passes through a [`ContentTransformer`] when opened.
#[derive(Debug)]
struct TransformedResource {
    inner: Arc<dyn ResourceHandle>,
    transformer: Arc<dyn ContentTransformer>,
}

impl ResourceHandle for TransformedResource {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn kind(&self) -> EntryKind {
        self.inner.kind()
    }
    fn size(&self) -> Option<u64> {
        // the rewritten length is unknown until the hook has run
        None
    }
    fn last_modified(&self) -> Option<SystemTime> {
        self.inner.last_modified()
    }
    fn mode(&self) -> Option<u32> {
        self.inner.mode()
    }
    fn owner(&self) -> Owner {
        self.inner.owner()
    }
    fn symlink_target(&self) -> Option<&str> {
        self.inner.symlink_target()
    }
    fn exists(&self) -> bool {
        self.inner.exists()
    }
    fn open(&self) -> io::Result<ResourceReader> {
        let input = self.inner.open()?;
        self.transformer.transform(self.inner.name(), input)
    }
}
