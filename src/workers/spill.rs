//! Per-entry output buffer that lives in memory until it grows past a threshold and then
//! moves to an anonymous temporary file.
//!
//! A segment is owned by the worker that fills it, handed to the drain over a channel, copied
//! once into the container and then released. Released segments refuse further I/O.

use std::io::{self, Read, Seek, SeekFrom, Write};
use tempfile::SpooledTempFile;
use tracing::debug;

/// Default spill threshold: 4 MiB.
pub const DEFAULT_SPILL_THRESHOLD: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    InMemory,
    SpilledToDisk,
    /// Drained; backing storage has been released.
    Consumed,
}

#[derive(Debug)]
pub struct SpillableSegment {
    inner: Option<SpooledTempFile>,
    threshold: usize,
}

impl SpillableSegment {
    pub fn new(threshold: usize) -> Self {
        Self { inner: Some(SpooledTempFile::new(threshold)), threshold }
    }

    pub fn state(&self) -> SegmentState {
        match &self.inner {
            None => SegmentState::Consumed,
            Some(file) if file.is_rolled() => SegmentState::SpilledToDisk,
            Some(_) => SegmentState::InMemory,
        }
    }

    /// Total number of bytes buffered, independent of the current position.
    pub fn len(&mut self) -> io::Result<u64> {
        let file = self.file()?;
        let pos = file.stream_position()?;
        let end = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }

    pub fn is_empty(&mut self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Copy everything buffered into `out`, then release the segment.
    pub fn copy_into(&mut self, out: &mut dyn Write) -> io::Result<u64> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(0))?;
        let copied = io::copy(file, out)?;
        self.release();
        Ok(copied)
    }

    /// Drop the buffer (and its temp file, if spilled).
    pub fn release(&mut self) {
        self.inner = None;
    }

    fn file(&mut self) -> io::Result<&mut SpooledTempFile> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "segment already consumed"))
    }
}

impl Write for SpillableSegment {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let threshold = self.threshold;
        let file = self.file()?;
        let was_rolled = file.is_rolled();
        let n = file.write(buf)?;
        if !was_rolled && file.is_rolled() {
            debug!(threshold, "segment spilled to disk");
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl Read for SpillableSegment {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }
}

impl Seek for SpillableSegment {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file()?.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_in_memory_below_threshold() -> io::Result<()> {
        let mut seg = SpillableSegment::new(16);
        seg.write_all(b"0123456789")?;
        assert_eq!(seg.state(), SegmentState::InMemory);
        assert_eq!(seg.len()?, 10);
        Ok(())
    }

    #[test]
    fn spills_past_threshold_and_keeps_content() -> io::Result<()> {
        let mut seg = SpillableSegment::new(8);
        seg.write_all(b"0123456789abcdef")?;
        assert_eq!(seg.state(), SegmentState::SpilledToDisk);

        let mut out = Vec::new();
        assert_eq!(seg.copy_into(&mut out)?, 16);
        assert_eq!(out, b"0123456789abcdef");
        assert_eq!(seg.state(), SegmentState::Consumed);
        Ok(())
    }

    #[test]
    fn consumed_segment_rejects_io() {
        let mut seg = SpillableSegment::new(8);
        seg.release();
        assert!(seg.write(b"x").is_err());
        assert!(seg.len().is_err());
    }
}
