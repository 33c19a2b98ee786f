//! Cross-platform filesystem wrapper.
//!
//! On Unix we transparently re-export std::fs and add the handful of
//! metadata helpers the resource and extraction code needs (permission bits,
//! owner ids, modification time, symlinks). On other platforms the POSIX-only
//! helpers degrade to no-ops so call-sites stay identical across OSes.

use std::io;
use std::path::Path;
use std::time::SystemTime;

pub use std::fs::*;

#[cfg(unix)]
/// Set POSIX permission bits on Unix.
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
/// No-op on non-Unix platforms: POSIX permission bits are not preserved.
pub fn set_unix_permissions(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Permission bits of `meta`, if the platform has them.
pub fn maybe_unix_mode(meta: &Metadata) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Some(meta.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        None
    }
}

/// Numeric `(uid, gid)` of `meta`, if the platform has them.
pub fn owner_ids(meta: &Metadata) -> (Option<u32>, Option<u32>) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        (Some(meta.uid()), Some(meta.gid()))
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        (None, None)
    }
}

/// Sets the modification time of a regular file or directory.
///
/// Symlinks are never touched (setting times through them would follow the link).
pub fn set_modified(path: &Path, time: SystemTime) -> io::Result<()> {
    let meta = symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        #[cfg(unix)]
        {
            return File::open(path)?.set_modified(time);
        }
        #[cfg(not(unix))]
        {
            return Ok(());
        }
    }
    OpenOptions::new().write(true).open(path)?.set_modified(time)
}

/// Creates a symbolic link at `link` pointing to `target`.
pub fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_file(target, link)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (target, link);
        Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::tempdir;

    #[test]
    fn set_modified_on_file_and_dir() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file = dir.path().join("f.txt");
        write(&file, b"x")?;
        let t = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        set_modified(&file, t)?;
        assert_eq!(metadata(&file)?.modified()?, t);

        #[cfg(unix)]
        {
            let sub = dir.path().join("sub");
            create_dir(&sub)?;
            set_modified(&sub, t)?;
            assert_eq!(metadata(&sub)?.modified()?, t);
        }
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn permission_bits_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file = dir.path().join("run.sh");
        write(&file, b"#!/bin/sh\n")?;
        set_unix_permissions(&file, 0o750)?;
        assert_eq!(maybe_unix_mode(&metadata(&file)?), Some(0o750));
        Ok(())
    }
}
