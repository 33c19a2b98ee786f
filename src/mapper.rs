//! # Name Mappers
//!
//! Pure string transforms applied to archive-relative names, both when collections are added
//! and when entries are extracted. A mapper returning an empty string drops the entry.

use crate::ArchiverError;
use regex::Regex;
use std::fmt;

/// Rewrites one forward-slash separated name.
pub trait FileMapper: Send + Sync + fmt::Debug {
    fn map(&self, name: &str) -> String;
}

/// Leaves names untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl FileMapper for IdentityMapper {
    fn map(&self, name: &str) -> String {
        name.to_string()
    }
}

/// Prepends a fixed string.
#[derive(Debug, Clone)]
pub struct PrefixMapper {
    prefix: String,
}

impl PrefixMapper {
    pub fn new(prefix: &str) -> Self {
        Self { prefix: prefix.to_string() }
    }
}

impl FileMapper for PrefixMapper {
    fn map(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

/// Inserts a suffix before the file extension: `a/b.txt` with `-v2` becomes `a/b-v2.txt`.
#[derive(Debug, Clone)]
pub struct SuffixMapper {
    suffix: String,
}

impl SuffixMapper {
    pub fn new(suffix: &str) -> Self {
        Self { suffix: suffix.to_string() }
    }
}

impl FileMapper for SuffixMapper {
    fn map(&self, name: &str) -> String {
        let base_start = name.rfind('/').map_or(0, |i| i + 1);
        match name[base_start..].rfind('.') {
            // a leading dot marks a hidden file, not an extension
            Some(dot) if dot > 0 => {
                let split = base_start + dot;
                format!("{}{}{}", &name[..split], self.suffix, &name[split..])
            }
            _ => format!("{}{}", name, self.suffix),
        }
    }
}

/// Strips every directory component.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenMapper;

impl FileMapper for FlattenMapper {
    fn map(&self, name: &str) -> String {
        let trimmed = name.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
    }
}

/// Rewrites names matching a regex using a `$1`-style replacement.
/// Names that do not match map to the empty string and are dropped.
#[derive(Debug, Clone)]
pub struct RegexMapper {
    pattern: Regex,
    replacement: String,
}

impl RegexMapper {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, ArchiverError> {
        Ok(Self { pattern: Regex::new(pattern)?, replacement: replacement.to_string() })
    }
}

impl FileMapper for RegexMapper {
    fn map(&self, name: &str) -> String {
        if !self.pattern.is_match(name) {
            return String::new();
        }
        self.pattern.replace(name, self.replacement.as_str()).into_owned()
    }
}
