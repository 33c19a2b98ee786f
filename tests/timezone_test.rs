//! Changes `TZ` for the whole process, so it lives in its own test binary with a single test.

use blitzpack::{ArchiveFormat, Archiver, ArchiverConfig, Extractor, ReproducibilityConfig};
use std::fs;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::tempdir;

// ---------- helpers ----------
/// chrono caches the local zone for up to a second per thread.
fn switch_zone(tz: &str) {
    std::env::set_var("TZ", tz);
    sleep(Duration::from_millis(1_100));
}

fn build(dest: &Path, epoch: u64) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let config = ArchiverConfig {
        destination: Some(dest.to_path_buf()),
        reproducible: Some(ReproducibilityConfig::at(UNIX_EPOCH + Duration::from_secs(epoch))),
        ..ArchiverConfig::default()
    };
    let mut archiver = Archiver::new(config);
    archiver.add_bytes("conf/app.toml", b"name = \"app\"\n".to_vec(), None)?;
    archiver.add_empty_directory("logs", None)?;
    archiver.build()?;
    Ok(fs::read(dest)?)
}

#[test]
fn reproducible_zip_ignores_process_timezone() -> Result<(), Box<dyn std::error::Error>> {
    let work = tempdir()?;
    let epoch = 1_700_000_000;

    switch_zone("UTC0");
    let in_utc = build(&work.path().join("utc.zip"), epoch)?;
    switch_zone("JST-9");
    let in_tokyo = build(&work.path().join("tokyo.zip"), epoch)?;
    assert!(in_utc == in_tokyo, "zip bytes depend on the process timezone");

    // default options decode local time unless the archive says otherwise
    let dest = work.path().join("tokyo.zip");
    let out = work.path().join("out");
    Extractor::default().extract(&dest, &out, None)?;
    let expected = ArchiveFormat::Zip.granularity().normalize(UNIX_EPOCH + Duration::from_secs(epoch));
    assert_eq!(fs::metadata(out.join("conf/app.toml"))?.modified()?, expected);
    assert_eq!(fs::metadata(out.join("logs"))?.modified()?, expected);

    let listed = Extractor::default().list(&dest)?;
    assert!(listed.iter().all(|e| e.mtime == Some(expected)));
    Ok(())
}
