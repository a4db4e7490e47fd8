use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::common::{Lsn, Result, INVALID_LSN};

/// The write-ahead log as seen by the buffer pool.
///
/// The only ordering contract the cache relies on: `flush(lsn)` returns only
/// after every record up to and including `lsn` is durable.
pub trait WriteAheadLog: Send + Sync {
    /// Appends a record and returns its log position.
    fn append(&self, record: &[u8]) -> Result<Lsn>;

    /// Makes every record through `lsn` durable.
    fn flush(&self, lsn: Lsn) -> Result<()>;

    /// Highest log position known to be durable.
    fn durable_lsn(&self) -> Lsn;
}

/// In-memory log that hands out consecutive positions starting at 1.
///
/// Durability is simulated by advancing a watermark, which is enough to
/// verify write-ahead ordering.
pub struct MemoryLog {
    records: Mutex<Vec<Bytes>>,
    durable: AtomicU64,
    num_flushes: AtomicU64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            durable: AtomicU64::new(INVALID_LSN),
            num_flushes: AtomicU64::new(0),
        }
    }

    /// Returns the record stored at `lsn`, if any.
    pub fn record(&self, lsn: Lsn) -> Option<Bytes> {
        if lsn == INVALID_LSN {
            return None;
        }
        self.records.lock().get((lsn - 1) as usize).cloned()
    }

    /// Position of the most recently appended record.
    pub fn last_lsn(&self) -> Lsn {
        self.records.lock().len() as Lsn
    }

    /// Number of `flush` calls that actually advanced the watermark.
    pub fn num_flushes(&self) -> u64 {
        self.num_flushes.load(Ordering::Relaxed)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteAheadLog for MemoryLog {
    fn append(&self, record: &[u8]) -> Result<Lsn> {
        let mut records = self.records.lock();
        records.push(Bytes::copy_from_slice(record));
        Ok(records.len() as Lsn)
    }

    fn flush(&self, lsn: Lsn) -> Result<()> {
        let target = lsn.min(self.last_lsn());
        let previous = self.durable.fetch_max(target, Ordering::AcqRel);
        if previous < target {
            self.num_flushes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn durable_lsn(&self) -> Lsn {
        self.durable.load(Ordering::Acquire)
    }
}
