//! Common utilities and types module.
// Shared entry types and name handling used by both the build and the extraction side.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// The kind of a single entry destined for, or read from, an archive.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    /// Directories and symlinks carry no content and never go through a worker.
    pub fn is_metadata_only(self) -> bool {
        !matches!(self, EntryKind::File)
    }
}

/// Ownership recorded for an entry. `None` fields are left unset in the container.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Owner {
    pub uid: Option<u32>,
    pub user_name: Option<String>,
    pub gid: Option<u32>,
    pub group_name: Option<String>,
}

impl Owner {
    /// Fills every unset field of `self` from `other`.
    pub fn or(self, other: &Owner) -> Owner {
        Owner {
            uid: self.uid.or(other.uid),
            user_name: self.user_name.or_else(|| other.user_name.clone()),
            gid: self.gid.or(other.gid),
            group_name: self.group_name.or_else(|| other.group_name.clone()),
        }
    }
}

/// Fully resolved metadata for one entry, after permission/owner/time precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAttributes {
    /// Permission bits only (`0o7777` mask), never file-type bits.
    pub mode: u32,
    pub owner: Owner,
    pub mtime: SystemTime,
}

/// Everything a format adapter needs to write one record.
#[derive(Debug, Clone)]
pub struct EntryHeader {
    /// Normalized archive-relative name, without trailing separator.
    pub name: String,
    pub kind: EntryKind,
    pub attributes: EntryAttributes,
    pub symlink_target: Option<String>,
    /// Uncompressed size if known up front.
    pub size: Option<u64>,
}

/// Normalize an archive-relative name: forward slashes only, no leading `./` or `/`,
/// no repeated or trailing separators.
/// Example: "./dir1\\dir2//file.txt" becomes "dir1/dir2/file.txt"
pub fn normalize_name(name: &str) -> String {
    let s = name.replace('\\', "/");
    let mut out = String::with_capacity(s.len());
    for part in s.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Every ancestor directory of `name`, outermost first.
/// `"a/b/c.txt"` yields `["a", "a/b"]`.
pub fn parent_dirs(name: &str) -> Vec<&str> {
    name.match_indices('/').map(|(idx, _)| &name[..idx]).collect()
}

/// Ensures a non-empty prefix ends with exactly one `/`.
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let p = normalize_name(prefix);
    if p.is_empty() {
        p
    } else {
        format!("{p}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_dots() {
        assert_eq!(normalize_name("./dir1\\dir2//file.txt"), "dir1/dir2/file.txt");
        assert_eq!(normalize_name("/abs/path/"), "abs/path");
        assert_eq!(normalize_name("."), "");
        // traversal segments are kept, the extractor is responsible for them
        assert_eq!(normalize_name("../x"), "../x");
    }

    #[test]
    fn parents_are_outermost_first() {
        assert_eq!(parent_dirs("a/b/c.txt"), vec!["a", "a/b"]);
        assert!(parent_dirs("top.txt").is_empty());
    }

    #[test]
    fn prefix_gets_single_trailing_slash() {
        assert_eq!(normalize_prefix("lib"), "lib/");
        assert_eq!(normalize_prefix("lib//"), "lib/");
        assert_eq!(normalize_prefix(""), "");
    }

    #[test]
    fn owner_or_fills_gaps_only() {
        let explicit = Owner { uid: Some(5), ..Owner::default() };
        let fallback = Owner { uid: Some(0), gid: Some(7), user_name: None, group_name: Some("g".into()) };
        let merged = explicit.or(&fallback);
        assert_eq!(merged.uid, Some(5));
        assert_eq!(merged.gid, Some(7));
        assert_eq!(merged.group_name.as_deref(), Some("g"));
    }
}
