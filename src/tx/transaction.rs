use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::{debug, info};

use crate::buffer::{FieldType, FieldValue, Frame, PinCoordinator, TxBuffers};
use crate::common::{BlockId, LockTarget, Lsn, RecordId, Result, StrataError, TxId, INVALID_LSN};
use crate::concurrency::{strategy_for, ConcurrencyStrategy, IsolationLevel, LockTable};
use crate::storage::file::FileManager;
use crate::storage::log::WriteAheadLog;
use crate::storage::page::PageFormatter;

/// Transaction ties one transaction's frames and locks together.
///
/// Reads and writes go through the concurrency strategy before touching a
/// frame, and every write is logged before it is applied. Commit and
/// rollback release every frame and every lock; dropping an unfinished
/// transaction rolls it back.
///
/// Rollback releases resources only. Changes already applied to frames
/// are not undone.
pub struct Transaction {
    id: TxId,
    strategy: Box<dyn ConcurrencyStrategy>,
    buffers: TxBuffers,
    log: Arc<dyn WriteAheadLog>,
    file_manager: Arc<FileManager>,
    /// Position of the last log record this transaction wrote
    last_lsn: Lsn,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(
        id: TxId,
        isolation: IsolationLevel,
        coordinator: Arc<PinCoordinator>,
        locks: Arc<LockTable>,
        log: Arc<dyn WriteAheadLog>,
    ) -> Self {
        let file_manager = Arc::clone(coordinator.pool().file_manager());
        debug!(tx = %id, %isolation, "transaction started");
        Self {
            id,
            strategy: strategy_for(isolation, id, locks),
            buffers: TxBuffers::new(id, coordinator),
            log,
            file_manager,
            last_lsn: INVALID_LSN,
            finished: false,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.strategy.isolation()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The lock intents of this transaction, for record and index code.
    pub fn concurrency(&self) -> &dyn ConcurrencyStrategy {
        self.strategy.as_ref()
    }

    pub fn pin(&mut self, block: &BlockId) -> Result<Arc<Frame>> {
        self.ensure_active()?;
        self.buffers.pin(block)
    }

    /// Drops one pin on `block`.
    ///
    /// # Panics
    /// Panics if this transaction does not hold `block`.
    pub fn unpin(&mut self, block: &BlockId) {
        self.buffers.unpin(block);
    }

    /// Returns the frame currently holding a pinned block.
    ///
    /// Frames can move after a starvation break, so callers should look
    /// them up here rather than keep them across pins.
    pub fn frame(&self, block: &BlockId) -> Option<Arc<Frame>> {
        self.buffers.frame(block)
    }

    /// Appends a new block to `file`, pins it and locks it exclusively.
    ///
    /// The new block stays pinned by this transaction until it is unpinned
    /// or the transaction ends.
    pub fn append(&mut self, file: &str, formatter: &dyn PageFormatter) -> Result<BlockId> {
        self.ensure_active()?;
        let locks = self.strategy.lock_table();
        locks.ix_lock(&LockTarget::file(file), self.id)?;

        let frame = self.buffers.pin_new(file, formatter)?;
        let block = frame.assigned_block();
        locks.x_lock(&LockTarget::Block(block.clone()), self.id)?;
        Ok(block)
    }

    /// Number of blocks in `file`.
    pub fn size(&self, file: &str) -> Result<u64> {
        self.ensure_active()?;
        self.strategy.read_file(file)?;
        self.file_manager.length(file)
    }

    /// Reads a value of `rid` at payload `offset` of its pinned block.
    pub fn read(&self, rid: &RecordId, offset: usize, ty: FieldType) -> Result<FieldValue> {
        self.ensure_active()?;
        self.strategy.read_record(rid)?;
        self.pinned(&rid.block).read(offset, ty)
    }

    pub fn get_i32(&self, rid: &RecordId, offset: usize) -> Result<i32> {
        match self.read(rid, offset, FieldType::Int)? {
            FieldValue::Int(v) => Ok(v),
            _ => unreachable!("decode returns the requested type"),
        }
    }

    pub fn get_string(&self, rid: &RecordId, offset: usize) -> Result<String> {
        match self.read(rid, offset, FieldType::Str)? {
            FieldValue::Str(v) => Ok(v),
            _ => unreachable!("decode returns the requested type"),
        }
    }

    /// Logs and applies a write of `value` for `rid` at payload `offset`.
    pub fn write(&mut self, rid: &RecordId, offset: usize, value: impl Into<FieldValue>) -> Result<()> {
        self.ensure_active()?;
        let value = value.into();
        self.strategy.modify_record(rid)?;

        let frame = self.pinned(&rid.block);
        let len = value.encoded_len();
        let size = frame.capacity();
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(StrataError::OutOfBounds { offset, len, size });
        }

        let lsn = self.log.append(&self.update_record(&rid.block, offset, &value))?;
        frame.write_logged(offset, &value, self.id, lsn)?;
        self.last_lsn = lsn;
        Ok(())
    }

    /// Ends the current statement, letting the isolation level drop
    /// statement-scoped locks.
    pub fn end_statement(&self) {
        self.strategy.end_statement();
    }

    /// Makes this transaction's changes durable, then releases its frames
    /// and locks.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.buffers.flush_mine()?;
        if self.last_lsn != INVALID_LSN {
            self.log.flush(self.last_lsn)?;
        }

        self.release();
        info!(tx = %self.id, lsn = self.last_lsn, "transaction committed");
        Ok(())
    }

    /// Releases every frame and lock without making anything durable.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.release();
        info!(tx = %self.id, "transaction rolled back");
        Ok(())
    }

    fn release(&mut self) {
        self.buffers.release_all();
        self.strategy.release_all();
        self.finished = true;
    }

    fn ensure_active(&self) -> Result<()> {
        if self.finished {
            return Err(StrataError::TransactionFinished(self.id));
        }
        Ok(())
    }

    fn pinned(&self, block: &BlockId) -> Arc<Frame> {
        self.buffers
            .frame(block)
            .unwrap_or_else(|| panic!("{} accessed {} without pinning it", self.id, block))
    }

    /// Encodes an update log record: tx id, block, offset, new value.
    fn update_record(&self, block: &BlockId, offset: usize, value: &FieldValue) -> BytesMut {
        let mut record = BytesMut::with_capacity(32 + block.file().len() + value.encoded_len());
        record.put_u64(self.id.as_u64());
        record.put_u32(block.file().len() as u32);
        record.put_slice(block.file().as_bytes());
        record.put_u64(block.number());
        record.put_u32(offset as u32);

        let start = record.len();
        record.resize(start + value.encoded_len(), 0);
        value.encode_into(&mut record[start..]);
        record
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(tx = %self.id, "dropping unfinished transaction");
            self.release();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation", &self.isolation())
            .field("buffers", &self.buffers)
            .field("finished", &self.finished)
            .finish()
    }
}
