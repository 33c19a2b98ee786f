//! Directories already written during one build.

use crate::common::parent_dirs;
use std::collections::HashSet;

/// Monotonically growing set of emitted directory names, owned by a single build.
#[derive(Debug, Default)]
pub struct DirectorySet {
    added: HashSet<String>,
}

impl DirectorySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `dir`. Returns false if it was already emitted.
    pub fn insert(&mut self, dir: &str) -> bool {
        if self.added.contains(dir) {
            return false;
        }
        self.added.insert(dir.to_string())
    }

    pub fn contains(&self, dir: &str) -> bool {
        self.added.contains(dir)
    }

    /// Ancestors of `name` not emitted yet, outermost first. They are recorded as emitted.
    pub fn missing_parents<'a>(&mut self, name: &'a str) -> Vec<&'a str> {
        parent_dirs(name).into_iter().filter(|dir| self.insert(dir)).collect()
    }

    pub fn len(&self) -> usize {
        self.added.len()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
    }

    pub fn clear(&mut self) {
        self.added.clear();
    }
}
