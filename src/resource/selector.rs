//! Ant-style include/exclude selection over archive-relative names.
//!
//! `*` matches within one path segment, `?` one character of a segment, `**` any number of
//! segments. A pattern ending in `/` behaves as if `**` followed it, and a trailing `/**`
//! also matches the directory itself.

use crate::ArchiverError;
use regex::Regex;

/// Patterns excluded from directory collections unless disabled.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/*~",
    "**/#*#",
    "**/.#*",
    "**/%*%",
    "**/._*",
    "**/.git/**",
    "**/.gitignore",
    "**/.gitattributes",
    "**/.hg/**",
    "**/.hgignore",
    "**/.svn/**",
    "**/CVS/**",
    "**/.cvsignore",
    "**/.bzr/**",
    "**/_darcs/**",
    "**/vssver.scc",
    "**/.DS_Store",
];

/// A compiled set of include and exclude patterns.
#[derive(Debug, Clone, Default)]
pub struct PathSelector {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl PathSelector {
    pub fn new(includes: &[String], excludes: &[String], default_excludes: bool) -> Result<Self, ArchiverError> {
        let includes = includes.iter().map(|p| compile(p)).collect::<Result<Vec<_>, _>>()?;
        let mut compiled_excludes = excludes.iter().map(|p| compile(p)).collect::<Result<Vec<_>, _>>()?;
        if default_excludes {
            for p in DEFAULT_EXCLUDES {
                compiled_excludes.push(compile(p)?);
            }
        }
        Ok(Self { includes, excludes: compiled_excludes })
    }

    /// True when `name` is included and not excluded.
    pub fn matches(&self, name: &str) -> bool {
        let included = self.includes.is_empty() || self.includes.iter().any(|re| re.is_match(name));
        included && !self.excludes.iter().any(|re| re.is_match(name))
    }
}

/// Translate one Ant-style pattern into an anchored regex.
fn compile(pattern: &str) -> Result<Regex, ArchiverError> {
    let mut pattern = pattern.replace('\\', "/");
    if pattern.ends_with('/') {
        pattern.push_str("**");
    }
    let pattern = pattern.trim_start_matches("./");

    let chars: Vec<char> = pattern.chars().collect();
    let mut re = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                let at_segment_start = i == 0 || chars[i - 1] == '/';
                if at_segment_start && chars.get(i + 2) == Some(&'/') {
                    // "**/" : zero or more leading directories
                    re.push_str("(?:.*/)?");
                    i += 3;
                    continue;
                }
                if i + 2 == chars.len() && i > 0 && chars[i - 1] == '/' {
                    // trailing "/**" : the directory itself or anything below it
                    re.pop();
                    re.push_str("(?:/.*)?");
                } else {
                    re.push_str(".*");
                }
                i += 2;
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');
    Ok(Regex::new(&re)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(includes: &[&str], excludes: &[&str]) -> PathSelector {
        let inc: Vec<String> = includes.iter().map(|s| s.to_string()).collect();
        let exc: Vec<String> = excludes.iter().map(|s| s.to_string()).collect();
        PathSelector::new(&inc, &exc, false).unwrap()
    }

    #[test]
    fn single_star_stays_in_segment() {
        let s = sel(&["*.txt"], &[]);
        assert!(s.matches("a.txt"));
        assert!(!s.matches("dir/a.txt"));
    }

    #[test]
    fn double_star_spans_segments() {
        let s = sel(&["**/*.txt"], &[]);
        assert!(s.matches("a.txt"));
        assert!(s.matches("x/y/a.txt"));
        assert!(!s.matches("x/y/a.bin"));
    }

    #[test]
    fn trailing_double_star_includes_directory_itself() {
        let s = sel(&[], &["build/**"]);
        assert!(!s.matches("build"));
        assert!(!s.matches("build/out.o"));
        assert!(s.matches("builder.rs"));
    }

    #[test]
    fn trailing_slash_means_everything_below() {
        let s = sel(&["src/"], &[]);
        assert!(s.matches("src/lib.rs"));
        assert!(!s.matches("tests/a.rs"));
    }

    #[test]
    fn question_mark_and_literals() {
        let s = sel(&["file?.(1)"], &[]);
        assert!(s.matches("fileA.(1)"));
        assert!(!s.matches("file.(1)"));
    }

    #[test]
    fn default_excludes_drop_vcs_metadata() -> Result<(), ArchiverError> {
        let s = PathSelector::new(&[], &[], true)?;
        assert!(!s.matches(".git"));
        assert!(!s.matches("sub/.git/HEAD"));
        assert!(!s.matches("notes.txt~"));
        assert!(!s.matches("a/.DS_Store"));
        assert!(s.matches("src/main.rs"));
        Ok(())
    }
}
