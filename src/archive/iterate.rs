//! # Resource Iteration
//!
//! Flattens the ordered list of [`PendingAddition`]s into one lazy sequence of
//! [`ArchiveEntry`]s. Single entries pass through as they are; collections are expanded
//! through their own lazy streams. Every name is normalized and checked against the names
//! already produced in this pass, and the [`DuplicatePolicy`] decides what happens to a repeat.
//!
//! Directory repeats are always dropped silently; the policy governs files and symlinks.
//!
//! The sequence is single-pass. Starting over means building a new [`ResourceIterator`], which
//! re-reads every collection. After the first error the iterator is fused.

use crate::attributes::{AttributeResolver, CollectionOverrides};
use crate::common::{normalize_name, EntryAttributes, EntryHeader, EntryKind};
use crate::resource::{ResourceCollection, ResourceHandle, ResourceStream, TraversalOrder};
use crate::ArchiverError;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What to do with an entry whose name was already produced.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Keep every occurrence.
    #[default]
    Add,
    /// Keep the first occurrence.
    Preserve,
    /// Keep the first occurrence.
    Skip,
    /// Abort with [`ArchiverError::DuplicateEntry`].
    Fail,
}

/// One explicitly added resource.
#[derive(Debug, Clone)]
pub struct EntrySpec {
    pub resource: Arc<dyn ResourceHandle>,
    /// Archive name; overrides the resource's own name.
    pub name: String,
    /// Explicit mode, the highest-precedence tier.
    pub mode: Option<u32>,
}

/// Something queued for the next build.
#[derive(Debug, Clone)]
pub enum PendingAddition {
    Entry(EntrySpec),
    Collection {
        collection: Arc<dyn ResourceCollection>,
        overrides: CollectionOverrides,
        /// Replaces the build-wide policy for this collection's entries.
        duplicates: Option<DuplicatePolicy>,
    },
}

/// One resolved entry, ready for the writer.
#[derive(Clone)]
pub struct ArchiveEntry {
    pub header: EntryHeader,
    pub resource: Arc<dyn ResourceHandle>,
    /// Mode for parent directories this entry implies.
    pub implied_dir_mode: u32,
}

impl ArchiveEntry {
    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn kind(&self) -> EntryKind {
        self.header.kind
    }

    /// Header for a parent directory synthesized on behalf of this entry.
    pub fn parent_header(&self, dir: &str) -> EntryHeader {
        EntryHeader {
            name: dir.to_string(),
            kind: EntryKind::Directory,
            attributes: EntryAttributes {
                mode: self.implied_dir_mode,
                owner: self.header.attributes.owner.clone(),
                mtime: self.header.attributes.mtime,
            },
            symlink_target: None,
            size: Some(0),
        }
    }
}

impl fmt::Debug for ArchiveEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveEntry")
            .field("name", &self.header.name)
            .field("kind", &self.header.kind)
            .field("mode", &format_args!("{:o}", self.header.attributes.mode))
            .finish()
    }
}

/// Build-wide inputs of one iteration pass.
#[derive(Debug, Clone)]
pub struct IterationSettings {
    pub duplicates: DuplicatePolicy,
    pub resolver: AttributeResolver,
    pub order: TraversalOrder,
    /// Emit directory resources of collections. Parents of files are emitted regardless.
    pub include_empty_dirs: bool,
}

impl Default for IterationSettings {
    fn default() -> Self {
        Self {
            duplicates: DuplicatePolicy::default(),
            resolver: AttributeResolver::default(),
            order: TraversalOrder::Native,
            include_empty_dirs: true,
        }
    }
}

struct CollectionCursor {
    stream: ResourceStream,
    overrides: CollectionOverrides,
    duplicates: DuplicatePolicy,
}

struct Candidate {
    handle: Arc<dyn ResourceHandle>,
    name: Option<String>,
    mode: Option<u32>,
    overrides: CollectionOverrides,
    duplicates: DuplicatePolicy,
    explicit: bool,
}

/// The duplicate-resolved entry sequence of one build.
pub struct ResourceIterator {
    additions: std::vec::IntoIter<PendingAddition>,
    cursor: Option<CollectionCursor>,
    /// Streams abandoned before exhaustion, released on close.
    deferred: Vec<ResourceStream>,
    seen: HashSet<String>,
    settings: IterationSettings,
    done: bool,
}

impl ResourceIterator {
    pub fn new(additions: Vec<PendingAddition>, settings: IterationSettings) -> Self {
        Self {
            additions: additions.into_iter(),
            cursor: None,
            deferred: Vec::new(),
            seen: HashSet::new(),
            settings,
            done: false,
        }
    }

    /// Release every collection stream still open. Further calls to `next` return `None`.
    pub fn close(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            self.deferred.push(cursor.stream);
        }
        if !self.deferred.is_empty() {
            debug!(count = self.deferred.len(), "releasing unfinished collection streams");
            self.deferred.clear();
        }
        self.done = true;
    }

    fn abort(&mut self, err: ArchiverError) -> ArchiverError {
        if let Some(cursor) = self.cursor.take() {
            self.deferred.push(cursor.stream);
        }
        self.done = true;
        err
    }

    fn admit(&mut self, candidate: Candidate) -> Result<Option<ArchiveEntry>, ArchiverError> {
        let handle = candidate.handle;
        let name = normalize_name(candidate.name.as_deref().unwrap_or_else(|| handle.name()));
        let kind = handle.kind();
        if name.is_empty() {
            debug!(resource = ?handle, "skipping resource without a name");
            return Ok(None);
        }
        if matches!(kind, EntryKind::File | EntryKind::Directory) && !handle.exists() {
            return Err(ArchiverError::ResourceNotFound { name });
        }

        match kind {
            EntryKind::Directory => {
                if !candidate.explicit && !self.settings.include_empty_dirs {
                    return Ok(None);
                }
                if !self.seen.insert(format!("{name}/")) {
                    debug!(%name, "directory already added");
                    return Ok(None);
                }
            }
            EntryKind::File | EntryKind::Symlink => {
                if self.seen.contains(&name) {
                    match candidate.duplicates {
                        DuplicatePolicy::Add => debug!(%name, "adding duplicate entry"),
                        DuplicatePolicy::Preserve | DuplicatePolicy::Skip => {
                            debug!(%name, "dropping duplicate entry, first occurrence wins");
                            return Ok(None);
                        }
                        DuplicatePolicy::Fail => return Err(ArchiverError::DuplicateEntry { name }),
                    }
                } else {
                    self.seen.insert(name.clone());
                }
            }
        }

        let resolver = &self.settings.resolver;
        let attributes = resolver.resolve(kind, Some(handle.as_ref()), candidate.mode, candidate.overrides);
        let header = EntryHeader {
            name,
            kind,
            attributes,
            symlink_target: handle.symlink_target().map(str::to_string),
            size: if kind == EntryKind::File { handle.size() } else { Some(0) },
        };
        Ok(Some(ArchiveEntry {
            header,
            implied_dir_mode: resolver.directory_mode(candidate.overrides),
            resource: handle,
        }))
    }
}

impl Iterator for ResourceIterator {
    type Item = Result<ArchiveEntry, ArchiverError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let candidate = match self.cursor.as_mut() {
                Some(cursor) => match cursor.stream.next() {
                    Some(Ok(handle)) => Candidate {
                        handle,
                        name: None,
                        mode: None,
                        overrides: cursor.overrides,
                        duplicates: cursor.duplicates,
                        explicit: false,
                    },
                    Some(Err(e)) => return Some(Err(self.abort(e))),
                    None => {
                        self.cursor = None;
                        continue;
                    }
                },
                None => match self.additions.next() {
                    None => {
                        self.done = true;
                        break;
                    }
                    Some(PendingAddition::Entry(spec)) => Candidate {
                        handle: spec.resource,
                        name: Some(spec.name),
                        mode: spec.mode,
                        overrides: CollectionOverrides::default(),
                        duplicates: self.settings.duplicates,
                        explicit: true,
                    },
                    Some(PendingAddition::Collection { collection, overrides, duplicates }) => {
                        match collection.resources(self.settings.order) {
                            Ok(stream) => {
                                self.cursor = Some(CollectionCursor {
                                    stream,
                                    overrides,
                                    duplicates: duplicates.unwrap_or(self.settings.duplicates),
                                })
                            }
                            Err(e) => return Some(Err(self.abort(e))),
                        }
                        continue;
                    }
                },
            };
            match self.admit(candidate) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(e) => return Some(Err(self.abort(e))),
            }
        }
        None
    }
}

impl Drop for ResourceIterator {
    fn drop(&mut self) {
        self.close();
    }
}
