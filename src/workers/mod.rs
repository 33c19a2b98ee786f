//! # Concurrent Entry Writer
//!
//! File entries are compressed on a bounded rayon pool while the container is written strictly
//! in submission order:
//!
//! 1. Every submission takes a slot at the back of a queue. Directories and symlinks carry no
//!    content, so their slot holds the header only.
//! 2. A file's slot holds the receiving end of a one-shot channel; a worker opens the resource,
//!    compresses it into a [`SpillableSegment`] and sends the segment (or the error) back.
//! 3. The drain only ever pops the front slot. Finished fronts are written opportunistically
//!    after each submission; [`ConcurrentEntryWriter::finish`] blocks on each remaining front
//!    in turn.
//!
//! A failed task aborts the drain at its own position, so every entry before it is written and
//! nothing after it is.

pub mod spill;

use crate::common::EntryHeader;
use crate::format::{ArchiveSink, EntryCompressor};
use crate::resource::ResourceHandle;
use crate::ArchiverError;
use spill::SpillableSegment;

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tracing::{debug, error};

/// Outstanding compression tasks allowed per worker before submission blocks on the drain.
const PENDING_PER_WORKER: usize = 4;

type TaskResult = Result<SpillableSegment, ArchiverError>;

enum Slot {
    Metadata(EntryHeader),
    Compressed { header: EntryHeader, result: Receiver<TaskResult> },
}

/// Counts of records written by one [`ConcurrentEntryWriter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub files: usize,
    pub metadata: usize,
}

impl WriterStats {
    pub fn total(&self) -> usize {
        self.files + self.metadata
    }
}

/// Parallel per-entry compression with an order-preserving drain.
///
/// One writer serves one build; the pool is torn down with it.
pub struct ConcurrentEntryWriter {
    pool: rayon::ThreadPool,
    compressor: Arc<dyn EntryCompressor>,
    sink: Box<dyn ArchiveSink>,
    pending: VecDeque<Slot>,
    max_pending: usize,
    spill_threshold: usize,
    stats: WriterStats,
}

impl ConcurrentEntryWriter {
    /// `threads == 0` sizes the pool to the number of CPUs.
    pub fn new(
        compressor: Arc<dyn EntryCompressor>,
        sink: Box<dyn ArchiveSink>,
        threads: usize,
        spill_threshold: usize,
    ) -> Result<Self, ArchiverError> {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("blitzpack-compress-{i}"))
            .panic_handler(|_| error!("compression worker panicked"))
            .build()?;
        debug!(threads, spill_threshold, "entry writer started");
        Ok(Self {
            pool,
            compressor,
            sink,
            pending: VecDeque::new(),
            max_pending: threads * PENDING_PER_WORKER,
            spill_threshold,
            stats: WriterStats::default(),
        })
    }

    /// Queue a directory or symlink record. Written immediately when nothing is pending ahead.
    pub fn submit_metadata(&mut self, header: EntryHeader) -> Result<(), ArchiverError> {
        if self.pending.is_empty() {
            self.sink.write_metadata(&header)?;
            self.stats.metadata += 1;
            return Ok(());
        }
        self.pending.push_back(Slot::Metadata(header));
        Ok(())
    }

    /// Schedule compression of a file entry. Never blocks unless the pending queue is full.
    pub fn submit_file(&mut self, header: EntryHeader, resource: Arc<dyn ResourceHandle>) -> Result<(), ArchiverError> {
        let (tx, rx) = bounded(1);
        let compressor = Arc::clone(&self.compressor);
        let task_header = header.clone();
        let threshold = self.spill_threshold;
        self.pool.spawn(move || {
            let result = compress_entry(compressor.as_ref(), &task_header, resource.as_ref(), threshold);
            // the receiver is gone when the build was aborted
            let _ = tx.send(result);
        });
        self.pending.push_back(Slot::Compressed { header, result: rx });

        self.flush_completed(false)?;
        while self.pending.len() > self.max_pending {
            self.drain_front(true)?;
        }
        Ok(())
    }

    /// Drain every pending slot in order, then finalize the container.
    pub fn finish(mut self) -> Result<WriterStats, ArchiverError> {
        self.flush_completed(true)?;
        let stats = self.stats;
        self.sink.finish()?;
        debug!(files = stats.files, metadata = stats.metadata, "entry writer finished");
        Ok(stats)
    }

    /// Write fronts that are ready; with `block` wait for every one.
    fn flush_completed(&mut self, block: bool) -> Result<(), ArchiverError> {
        while !self.pending.is_empty() {
            if !self.drain_front(block)? {
                break;
            }
        }
        Ok(())
    }

    /// Write the front slot. Returns false if it is still running and `block` is false.
    fn drain_front(&mut self, block: bool) -> Result<bool, ArchiverError> {
        let Some(front) = self.pending.front() else {
            return Ok(false);
        };
        let outcome = match front {
            Slot::Metadata(_) => None,
            Slot::Compressed { header, result } => {
                let received = if block {
                    result.recv().map_err(|_| TryRecvError::Disconnected)
                } else {
                    result.try_recv()
                };
                match received {
                    Ok(task) => Some(task),
                    Err(TryRecvError::Empty) => return Ok(false),
                    Err(TryRecvError::Disconnected) => Some(Err(ArchiverError::CompressionTask {
                        name: header.name.clone(),
                        source: io::Error::new(io::ErrorKind::Other, "worker terminated"),
                    })),
                }
            }
        };

        match (self.pending.pop_front(), outcome) {
            (Some(Slot::Metadata(header)), _) => {
                self.sink.write_metadata(&header)?;
                self.stats.metadata += 1;
            }
            (Some(Slot::Compressed { header, .. }), Some(task)) => {
                let mut segment = task?;
                self.sink.write_segment(&header, &mut segment)?;
                self.stats.files += 1;
            }
            _ => {}
        }
        Ok(true)
    }
}

/// Open `resource` and compress it into a fresh segment. Runs on a worker.
pub(crate) fn compress_entry(
    compressor: &dyn EntryCompressor,
    header: &EntryHeader,
    resource: &dyn ResourceHandle,
    spill_threshold: usize,
) -> TaskResult {
    let wrap = |source| ArchiverError::CompressionTask { name: header.name.clone(), source };
    let mut input = resource.open().map_err(wrap)?;
    let mut segment = SpillableSegment::new(spill_threshold);
    compressor.compress(header, &mut input, &mut segment).map_err(wrap)?;
    Ok(segment)
}
