use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::common::{
    BlockId, FrameId, Lsn, Result, StrataError, TxId, INVALID_LSN, LSN_HEADER_SIZE,
};
use crate::storage::file::FileManager;
use crate::storage::log::WriteAheadLog;
use crate::storage::page::PageFormatter;

use super::{FieldType, FieldValue};

/// Proof that the holder owns a frame's identity-swap lock.
pub(crate) struct SwapGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Frame is one in-memory mirror of a disk block plus the bookkeeping the
/// pool needs to share it safely.
///
/// Lock roles:
/// - `data` is the content lock: shared for reads, exclusive for writes.
/// - `swap_lock` guards identity changes and pin count transitions.
/// - `flush_lock` serializes write-back of this frame.
pub struct Frame {
    /// The frame ID (index in the buffer pool)
    frame_id: FrameId,
    file_manager: Arc<FileManager>,
    log: Arc<dyn WriteAheadLog>,
    /// The block mirrored by this frame, None while unassigned
    block: RwLock<Option<BlockId>>,
    /// Number of pins currently held on this frame
    pin_count: AtomicU32,
    /// Second-chance bit: set on pin, cleared by the eviction scan
    recently_pinned: AtomicBool,
    /// Whether the block has been modified since it was loaded
    is_dirty: AtomicBool,
    /// Whether the block was just appended and has never been written back
    is_fresh: AtomicBool,
    /// Last transaction that modified the block (0 = none)
    modified_by: AtomicU64,
    /// Last-applied log position, mirrored in the block header
    lsn: AtomicU64,
    /// Block bytes, header included
    data: RwLock<Box<[u8]>>,
    swap_lock: Mutex<()>,
    flush_lock: Mutex<()>,
}

impl Frame {
    /// Creates an unassigned frame holding `block_size` bytes.
    pub fn new(
        frame_id: FrameId,
        block_size: usize,
        file_manager: Arc<FileManager>,
        log: Arc<dyn WriteAheadLog>,
    ) -> Self {
        assert!(
            block_size > LSN_HEADER_SIZE,
            "block size must leave room for the LSN header"
        );

        Self {
            frame_id,
            file_manager,
            log,
            block: RwLock::new(None),
            pin_count: AtomicU32::new(0),
            recently_pinned: AtomicBool::new(false),
            is_dirty: AtomicBool::new(false),
            is_fresh: AtomicBool::new(false),
            modified_by: AtomicU64::new(0),
            lsn: AtomicU64::new(INVALID_LSN),
            data: RwLock::new(vec![0u8; block_size].into_boxed_slice()),
            swap_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
        }
    }

    /// Returns the frame ID.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the block currently mirrored by this frame.
    pub fn block(&self) -> Option<BlockId> {
        self.block.read().clone()
    }

    /// Returns the mirrored block of a frame known to be positioned.
    ///
    /// # Panics
    /// Panics if the frame has never been assigned a block.
    pub(crate) fn assigned_block(&self) -> BlockId {
        self.block()
            .unwrap_or_else(|| panic!("{} used before being assigned a block", self.frame_id))
    }

    /// Number of payload bytes addressable by `read` and `write`.
    pub fn capacity(&self) -> usize {
        self.data.read().len() - LSN_HEADER_SIZE
    }

    /// Reads a value of type `ty` at payload `offset`.
    pub fn read(&self, offset: usize, ty: FieldType) -> Result<FieldValue> {
        let data = self.data.read();
        let payload = &data[LSN_HEADER_SIZE..];
        if offset >= payload.len() {
            return Err(StrataError::OutOfBounds {
                offset,
                len: 0,
                size: payload.len(),
            });
        }
        FieldValue::decode(ty, &payload[offset..], offset, payload.len())
    }

    pub fn get_i32(&self, offset: usize) -> Result<i32> {
        match self.read(offset, FieldType::Int)? {
            FieldValue::Int(v) => Ok(v),
            _ => unreachable!("decode returns the requested type"),
        }
    }

    pub fn get_i64(&self, offset: usize) -> Result<i64> {
        match self.read(offset, FieldType::Long)? {
            FieldValue::Long(v) => Ok(v),
            _ => unreachable!("decode returns the requested type"),
        }
    }

    pub fn get_string(&self, offset: usize) -> Result<String> {
        match self.read(offset, FieldType::Str)? {
            FieldValue::Str(v) => Ok(v),
            _ => unreachable!("decode returns the requested type"),
        }
    }

    /// Writes `value` at payload `offset` without a log position.
    pub fn write(&self, offset: usize, value: &FieldValue) -> Result<()> {
        let mut data = self.data.write();
        Self::encode_at(&mut data, offset, value)?;
        self.is_dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Writes `value` on behalf of `tx` whose log record sits at `lsn`.
    ///
    /// The stored log position only moves forward and is persisted into the
    /// block header so it survives eviction.
    pub fn write_logged(&self, offset: usize, value: &FieldValue, tx: TxId, lsn: Lsn) -> Result<()> {
        let mut data = self.data.write();
        Self::encode_at(&mut data, offset, value)?;

        self.is_dirty.store(true, Ordering::Release);
        self.modified_by.store(tx.as_u64(), Ordering::Release);

        if lsn != INVALID_LSN && lsn > self.lsn.load(Ordering::Acquire) {
            self.lsn.store(lsn, Ordering::Release);
            (&mut data[..LSN_HEADER_SIZE]).put_u64(lsn);
        }
        Ok(())
    }

    fn encode_at(data: &mut [u8], offset: usize, value: &FieldValue) -> Result<()> {
        let payload = &mut data[LSN_HEADER_SIZE..];
        let len = value.encoded_len();
        match offset.checked_add(len) {
            Some(end) if end <= payload.len() => {
                value.encode_into(&mut payload[offset..end]);
                Ok(())
            }
            _ => Err(StrataError::OutOfBounds {
                offset,
                len,
                size: payload.len(),
            }),
        }
    }

    /// Writes the block back to disk if it is dirty or freshly appended.
    ///
    /// The log is flushed through this frame's LSN before the block is
    /// written. The content lock is held shared for the whole write-back so
    /// no mutation can land between the copy and the flag reset.
    pub fn flush(&self) -> Result<()> {
        let _flush = self.flush_lock.lock();
        let data = self.data.read();

        if !self.is_dirty() && !self.is_fresh() {
            return Ok(());
        }
        let block = match self.block() {
            Some(block) => block,
            None => return Ok(()),
        };

        let lsn = self.lsn.load(Ordering::Acquire);
        if lsn != INVALID_LSN {
            self.log.flush(lsn)?;
        }
        self.file_manager.write(&block, &data)?;

        self.is_dirty.store(false, Ordering::Release);
        self.is_fresh.store(false, Ordering::Release);
        tracing::trace!(frame = self.frame_id.0, %block, lsn, "frame written back");
        Ok(())
    }

    /// Increments the pin count and returns the new value.
    pub fn pin(&self) -> u32 {
        self.recently_pinned.store(true, Ordering::Release);
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value.
    /// Returns None if the pin count was already 0.
    pub fn unpin(&self) -> Option<u32> {
        loop {
            let current = self.pin_count.load(Ordering::Acquire);
            if current == 0 {
                return None;
            }
            if self
                .pin_count
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(current - 1);
            }
        }
    }

    /// Returns the current pin count.
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Clears the second-chance bit, returning its previous value.
    pub(crate) fn take_recently_pinned(&self) -> bool {
        self.recently_pinned.swap(false, Ordering::AcqRel)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh.load(Ordering::Acquire)
    }

    /// Returns the last-applied log position.
    pub fn lsn(&self) -> Lsn {
        self.lsn.load(Ordering::Acquire)
    }

    /// Returns the last transaction that modified this frame's block.
    pub fn modified_by(&self) -> Option<TxId> {
        match self.modified_by.load(Ordering::Acquire) {
            0 => None,
            id => Some(TxId::new(id)),
        }
    }

    pub(crate) fn lock_swap(&self) -> SwapGuard<'_> {
        SwapGuard {
            _guard: self.swap_lock.lock(),
        }
    }

    pub(crate) fn try_lock_swap(&self) -> Option<SwapGuard<'_>> {
        self.swap_lock
            .try_lock()
            .map(|guard| SwapGuard { _guard: guard })
    }

    /// Rebinds this frame to `block`, writing back the previous content first.
    ///
    /// If loading fails the frame is left unassigned.
    ///
    /// # Panics
    /// Panics if the frame is pinned.
    pub(crate) fn assign_to_block(&self, _swap: &SwapGuard<'_>, block: &BlockId) -> Result<()> {
        assert_eq!(self.pin_count(), 0, "cannot reassign pinned {}", self.frame_id);

        self.flush()?;
        *self.block.write() = None;

        let lsn = {
            let mut data = self.data.write();
            self.file_manager.read(block, &mut data)?;
            (&data[..LSN_HEADER_SIZE]).get_u64()
        };

        self.reset_bookkeeping(lsn, false);
        *self.block.write() = Some(block.clone());
        Ok(())
    }

    /// Appends a new block to `file`, formats it and binds this frame to it.
    ///
    /// The frame is marked fresh so the first write-back happens even
    /// without an explicit mutation.
    ///
    /// # Panics
    /// Panics if the frame is pinned.
    pub(crate) fn assign_to_new(
        &self,
        _swap: &SwapGuard<'_>,
        file: &str,
        formatter: &dyn PageFormatter,
    ) -> Result<BlockId> {
        assert_eq!(self.pin_count(), 0, "cannot reassign pinned {}", self.frame_id);

        self.flush()?;
        *self.block.write() = None;

        let block = self.file_manager.append(file)?;
        {
            let mut data = self.data.write();
            data.fill(0);
            formatter.format(&mut data[LSN_HEADER_SIZE..]);
        }

        self.reset_bookkeeping(INVALID_LSN, true);
        *self.block.write() = Some(block.clone());
        Ok(block)
    }

    fn reset_bookkeeping(&self, lsn: Lsn, fresh: bool) {
        self.pin_count.store(0, Ordering::Release);
        self.lsn.store(lsn, Ordering::Release);
        self.modified_by.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.is_fresh.store(fresh, Ordering::Release);
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("block", &self.block())
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .field("fresh", &self.is_fresh())
            .field("lsn", &self.lsn())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::log::MemoryLog;
    use crate::storage::page::ZeroFormatter;
    use tempfile::{tempdir, TempDir};

    const BLOCK_SIZE: usize = 256;

    fn create_frame() -> (Frame, Arc<FileManager>, Arc<MemoryLog>, TempDir) {
        let dir = tempdir().unwrap();
        let fm = Arc::new(FileManager::new(dir.path(), BLOCK_SIZE).unwrap());
        let log = Arc::new(MemoryLog::new());
        let frame = Frame::new(FrameId::new(0), BLOCK_SIZE, fm.clone(), log.clone());
        (frame, fm, log, dir)
    }

    #[test]
    fn test_frame_new() {
        let (frame, _fm, _log, _dir) = create_frame();
        assert_eq!(frame.frame_id(), FrameId::new(0));
        assert_eq!(frame.block(), None);
        assert_eq!(frame.pin_count(), 0);
        assert_eq!(frame.capacity(), BLOCK_SIZE - LSN_HEADER_SIZE);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_frame_pin_unpin() {
        let (frame, _fm, _log, _dir) = create_frame();

        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.pin(), 2);
        assert!(frame.take_recently_pinned());
        assert!(!frame.take_recently_pinned());

        assert_eq!(frame.unpin(), Some(1));
        assert_eq!(frame.unpin(), Some(0));
        assert_eq!(frame.unpin(), None);
    }

    #[test]
    fn test_frame_read_write_values() {
        let (frame, _fm, _log, _dir) = create_frame();

        frame.write(0, &FieldValue::Int(-7)).unwrap();
        frame.write(4, &FieldValue::Long(1 << 40)).unwrap();
        frame.write(12, &FieldValue::from("hello")).unwrap();

        assert_eq!(frame.get_i32(0).unwrap(), -7);
        assert_eq!(frame.get_i64(4).unwrap(), 1 << 40);
        assert_eq!(frame.get_string(12).unwrap(), "hello");
        assert!(frame.is_dirty());
    }

    #[test]
    fn test_frame_out_of_bounds() {
        let (frame, _fm, _log, _dir) = create_frame();
        let capacity = frame.capacity();

        assert!(frame.write(capacity - 4, &FieldValue::Int(1)).is_ok());
        assert!(matches!(
            frame.write(capacity - 3, &FieldValue::Int(1)),
            Err(StrataError::OutOfBounds { .. })
        ));
        assert!(matches!(
            frame.read(capacity, FieldType::Int),
            Err(StrataError::OutOfBounds { .. })
        ));
        assert!(matches!(
            frame.read(capacity - 2, FieldType::Int),
            Err(StrataError::OutOfBounds { .. })
        ));
        assert!(frame.write(usize::MAX, &FieldValue::Int(1)).is_err());
    }

    #[test]
    fn test_write_logged_keeps_newest_lsn() {
        let (frame, _fm, _log, _dir) = create_frame();

        frame.write_logged(0, &FieldValue::Int(1), TxId::new(3), 10).unwrap();
        assert_eq!(frame.lsn(), 10);
        assert_eq!(frame.modified_by(), Some(TxId::new(3)));

        frame.write_logged(0, &FieldValue::Int(2), TxId::new(3), 4).unwrap();
        assert_eq!(frame.lsn(), 10);
        assert_eq!(frame.get_i32(0).unwrap(), 2);
    }

    #[test]
    fn test_flush_forces_log_first() {
        let (frame, fm, log, _dir) = create_frame();
        let block = fm.append("t.tbl").unwrap();
        let swap = frame.lock_swap();
        frame.assign_to_block(&swap, &block).unwrap();
        drop(swap);

        for _ in 0..5 {
            log.append(b"update").unwrap();
        }
        frame.write_logged(0, &FieldValue::Int(99), TxId::new(1), 4).unwrap();
        assert_eq!(log.durable_lsn(), INVALID_LSN);

        let writes_before = fm.num_writes();
        frame.flush().unwrap();

        assert_eq!(log.durable_lsn(), 4);
        assert_eq!(fm.num_writes(), writes_before + 1);
        assert!(!frame.is_dirty());

        // A clean frame is not written again
        frame.flush().unwrap();
        assert_eq!(fm.num_writes(), writes_before + 1);
    }

    #[test]
    fn test_lsn_survives_reassignment() {
        let (frame, fm, log, _dir) = create_frame();
        let first = fm.append("t.tbl").unwrap();
        let second = fm.append("t.tbl").unwrap();
        for _ in 0..8 {
            log.append(b"update").unwrap();
        }

        {
            let swap = frame.lock_swap();
            frame.assign_to_block(&swap, &first).unwrap();
        }
        frame.write_logged(16, &FieldValue::Int(5), TxId::new(2), 8).unwrap();

        {
            let swap = frame.lock_swap();
            frame.assign_to_block(&swap, &second).unwrap();
        }
        assert_eq!(frame.lsn(), INVALID_LSN);
        assert_eq!(frame.block(), Some(second));

        {
            let swap = frame.lock_swap();
            frame.assign_to_block(&swap, &first).unwrap();
        }
        assert_eq!(frame.lsn(), 8);
        assert_eq!(frame.get_i32(16).unwrap(), 5);
        assert_eq!(frame.modified_by(), None);
    }

    #[test]
    fn test_assign_to_new_is_written_without_mutation() {
        let (frame, fm, _log, _dir) = create_frame();
        let formatter = |payload: &mut [u8]| payload[0] = 0x7F;

        let block = {
            let swap = frame.lock_swap();
            frame.assign_to_new(&swap, "t.tbl", &formatter).unwrap()
        };
        assert_eq!(block, BlockId::new("t.tbl", 0));
        assert!(frame.is_fresh());
        assert!(!frame.is_dirty());

        frame.flush().unwrap();
        assert!(!frame.is_fresh());

        let mut raw = vec![0u8; BLOCK_SIZE];
        fm.read(&block, &mut raw).unwrap();
        assert_eq!(raw[LSN_HEADER_SIZE], 0x7F);
    }

    #[test]
    fn test_assign_to_new_appends_sequentially() {
        let (frame, _fm, _log, _dir) = create_frame();
        let swap = frame.lock_swap();

        let b0 = frame.assign_to_new(&swap, "t.tbl", &ZeroFormatter).unwrap();
        let b1 = frame.assign_to_new(&swap, "t.tbl", &ZeroFormatter).unwrap();
        assert_eq!(b0.number(), 0);
        assert_eq!(b1.number(), 1);
    }

    #[test]
    #[should_panic(expected = "cannot reassign pinned")]
    fn test_reassign_pinned_frame_panics() {
        let (frame, fm, _log, _dir) = create_frame();
        let block = fm.append("t.tbl").unwrap();
        frame.pin();
        let swap = frame.lock_swap();
        let _ = frame.assign_to_block(&swap, &block);
    }

    #[test]
    #[should_panic(expected = "used before being assigned a block")]
    fn test_unassigned_frame_identity_panics() {
        let (frame, _fm, _log, _dir) = create_frame();
        let _ = frame.assigned_block();
    }

    #[test]
    fn test_frame_concurrent_readers_and_writer() {
        use std::thread;

        let (frame, _fm, _log, _dir) = create_frame();
        let frame = Arc::new(frame);
        frame.write(0, &FieldValue::Long(0)).unwrap();

        let writer = {
            let frame = Arc::clone(&frame);
            thread::spawn(move || {
                for i in 1..=200i64 {
                    frame.write(0, &FieldValue::Long(i * 1_000_001)).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let frame = Arc::clone(&frame);
                thread::spawn(move || {
                    for _ in 0..200 {
                        // A torn write would break divisibility
                        let v = frame.get_i64(0).unwrap();
                        assert_eq!(v % 1_000_001, 0);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
