use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::buffer::{BufferPool, PinCoordinator};
use crate::common::{EngineConfig, Result, TxId};
use crate::concurrency::{IsolationLevel, LockTable};
use crate::storage::file::FileManager;
use crate::storage::log::{MemoryLog, WriteAheadLog};
use crate::tx::Transaction;

/// Engine owns the process-wide pieces and hands out transactions.
///
/// One engine is shared by reference across every transaction thread:
/// the buffer pool, the pin coordinator and the lock table all live here.
pub struct Engine {
    config: EngineConfig,
    file_manager: Arc<FileManager>,
    log: Arc<dyn WriteAheadLog>,
    coordinator: Arc<PinCoordinator>,
    locks: Arc<LockTable>,
    next_tx: AtomicU64,
}

impl Engine {
    /// Opens an engine over the files in `db_dir` with an in-memory log.
    pub fn open<P: AsRef<Path>>(db_dir: P, config: EngineConfig) -> Result<Self> {
        Self::with_log(db_dir, config, Arc::new(MemoryLog::new()))
    }

    /// Opens an engine that writes its log records to `log`.
    pub fn with_log<P: AsRef<Path>>(
        db_dir: P,
        config: EngineConfig,
        log: Arc<dyn WriteAheadLog>,
    ) -> Result<Self> {
        let file_manager = Arc::new(FileManager::new(db_dir, config.block_size)?);
        let pool = Arc::new(BufferPool::new(
            config.pool_size,
            config.latch_stripes,
            Arc::clone(&file_manager),
            Arc::clone(&log),
        ));
        let coordinator = Arc::new(PinCoordinator::new(
            pool,
            config.max_wait,
            config.wait_epsilon,
        ));
        let locks = Arc::new(LockTable::new(
            config.lock_anchors,
            config.max_wait,
            config.notify_queue_capacity,
        ));

        debug!(
            db_dir = %file_manager.db_dir().display(),
            pool_size = config.pool_size,
            block_size = config.block_size,
            "engine opened"
        );

        Ok(Self {
            config,
            file_manager,
            log,
            coordinator,
            locks,
            next_tx: AtomicU64::new(1),
        })
    }

    /// Starts a transaction with a fresh, strictly increasing id.
    pub fn begin(&self, isolation: IsolationLevel) -> Transaction {
        let id = TxId::new(self.next_tx.fetch_add(1, Ordering::Relaxed));
        Transaction::new(
            id,
            isolation,
            Arc::clone(&self.coordinator),
            Arc::clone(&self.locks),
            Arc::clone(&self.log),
        )
    }

    /// Writes back every dirty frame.
    pub fn flush_all(&self) -> Result<()> {
        self.coordinator.pool().flush_all()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        self.coordinator.pool()
    }

    pub fn coordinator(&self) -> &Arc<PinCoordinator> {
        &self.coordinator
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    pub fn log(&self) -> &Arc<dyn WriteAheadLog> {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FieldValue;
    use crate::common::{BlockId, RecordId, SlotId, StrataError};
    use crate::storage::page::ZeroFormatter;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn open_engine(pool_size: usize) -> (Engine, TempDir) {
        let dir = tempdir().unwrap();
        let config = EngineConfig::default()
            .with_pool_size(pool_size)
            .with_block_size(256)
            .with_max_wait(Duration::from_millis(100))
            .with_wait_epsilon(Duration::from_millis(5));
        (Engine::open(dir.path(), config).unwrap(), dir)
    }

    #[test]
    fn test_transaction_ids_increase() {
        let (engine, _dir) = open_engine(4);
        let a = engine.begin(IsolationLevel::ReadCommitted);
        let b = engine.begin(IsolationLevel::RepeatableRead);
        assert_eq!(a.id(), TxId::new(1));
        assert!(a.id().is_older_than(b.id()));
        assert_eq!(b.isolation(), IsolationLevel::RepeatableRead);
    }

    #[test]
    fn test_write_commit_reopen() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::default().with_pool_size(4).with_block_size(256);
        let block;
        {
            let engine = Engine::open(dir.path(), config.clone()).unwrap();
            let mut tx = engine.begin(IsolationLevel::RepeatableRead);
            block = tx.append("users.tbl", &ZeroFormatter).unwrap();
            let rid = RecordId::new(block.clone(), SlotId::new(0));
            tx.write(&rid, 0, FieldValue::Int(41)).unwrap();
            tx.write(&rid, 4, "alice").unwrap();
            tx.commit().unwrap();

            assert!(engine.log().durable_lsn() >= 2);
            assert_eq!(engine.pool().available(), 4);
            assert_eq!(engine.lock_table().target_count(), 0);
        }

        let engine = Engine::open(dir.path(), config).unwrap();
        let mut tx = engine.begin(IsolationLevel::ReadCommitted);
        assert_eq!(tx.size("users.tbl").unwrap(), 1);
        tx.pin(&block).unwrap();
        let rid = RecordId::new(block.clone(), SlotId::new(0));
        assert_eq!(tx.get_i32(&rid, 0).unwrap(), 41);
        assert_eq!(tx.get_string(&rid, 4).unwrap(), "alice");
        // The header carries the log position of the last write
        assert_eq!(tx.frame(&block).unwrap().lsn(), 2);
    }

    #[test]
    fn test_finished_transaction_rejects_work() {
        let (engine, _dir) = open_engine(2);
        let mut tx = engine.begin(IsolationLevel::ReadCommitted);
        tx.rollback().unwrap();

        let err = tx.pin(&BlockId::new("f", 0)).unwrap_err();
        assert!(matches!(err, StrataError::TransactionFinished(_)));
        assert!(tx.commit().is_err());
        assert!(tx.is_finished());
    }

    #[test]
    fn test_drop_rolls_back() {
        let (engine, _dir) = open_engine(2);
        {
            let mut tx = engine.begin(IsolationLevel::RepeatableRead);
            let block = tx.append("f", &ZeroFormatter).unwrap();
            tx.pin(&block).unwrap();
            assert_eq!(engine.pool().available(), 1);
        }
        assert_eq!(engine.pool().available(), 2);
        assert_eq!(engine.lock_table().target_count(), 0);
    }
}
