use std::fmt;
use std::sync::Arc;

use crate::common::{BlockId, LockTarget, RecordId, Result, TxId};

use super::{LockMode, LockTable};

/// Isolation level a transaction runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    ReadCommitted,
    #[default]
    RepeatableRead,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => f.write_str("read committed"),
            IsolationLevel::RepeatableRead => f.write_str("repeatable read"),
        }
    }
}

/// Lock intents used by the record and index layers, one strategy per
/// transaction.
///
/// Callers must lock coarse to fine: file, then block, then record or
/// leaf block.
///
/// The write side is shared by every isolation level and provided here:
/// IX on each coarser ancestor, X on the target, held until
/// [`ConcurrencyStrategy::release_all`]. Implementations decide how long
/// read locks live.
pub trait ConcurrencyStrategy: Send {
    fn isolation(&self) -> IsolationLevel;

    fn tx(&self) -> TxId;

    fn lock_table(&self) -> &LockTable;

    fn read_file(&self, file: &str) -> Result<()>;

    fn read_block(&self, block: &BlockId) -> Result<()>;

    fn read_record(&self, rid: &RecordId) -> Result<()>;

    fn read_index(&self, index_file: &str) -> Result<()>;

    fn read_leaf_block(&self, block: &BlockId) -> Result<()>;

    /// Takes the index-file intent and S on a directory node. The node lock
    /// may be dropped early with [`ConcurrencyStrategy::release_directory_block`].
    fn read_directory_block(&self, block: &BlockId) -> Result<()>;

    /// Called when a statement completes.
    fn end_statement(&self);

    fn modify_file(&self, file: &str) -> Result<()> {
        self.lock_table().x_lock(&LockTarget::file(file), self.tx())
    }

    fn modify_block(&self, block: &BlockId) -> Result<()> {
        let locks = self.lock_table();
        locks.ix_lock(&LockTarget::file(block.file()), self.tx())?;
        locks.x_lock(&LockTarget::Block(block.clone()), self.tx())
    }

    fn modify_record(&self, rid: &RecordId) -> Result<()> {
        let locks = self.lock_table();
        locks.ix_lock(&LockTarget::file(rid.block.file()), self.tx())?;
        locks.ix_lock(&LockTarget::Block(rid.block.clone()), self.tx())?;
        locks.x_lock(&LockTarget::Record(rid.clone()), self.tx())
    }

    fn modify_index(&self, index_file: &str) -> Result<()> {
        self.modify_file(index_file)
    }

    fn modify_leaf_block(&self, block: &BlockId) -> Result<()> {
        self.modify_block(block)
    }

    fn modify_directory_block(&self, block: &BlockId) -> Result<()> {
        self.modify_block(block)
    }

    /// Drops the node lock taken by `read_directory_block` or
    /// `modify_directory_block` once the child is locked.
    fn release_directory_block(&self, block: &BlockId) {
        let node = LockTarget::Block(block.clone());
        let locks = self.lock_table();
        locks.release(&node, self.tx(), LockMode::Shared);
        locks.release(&node, self.tx(), LockMode::Exclusive);
    }

    /// Releases every lock; run on commit and rollback.
    fn release_all(&self) {
        self.lock_table().release_all(self.tx(), false);
    }
}

/// Builds the strategy for `isolation`.
pub fn strategy_for(
    isolation: IsolationLevel,
    tx: TxId,
    locks: Arc<LockTable>,
) -> Box<dyn ConcurrencyStrategy> {
    match isolation {
        IsolationLevel::ReadCommitted => Box::new(ReadCommitted::new(tx, locks)),
        IsolationLevel::RepeatableRead => Box::new(RepeatableRead::new(tx, locks)),
    }
}

/// Read-committed: coarse read intents are asserted and dropped at once,
/// content S locks live until the end of the current statement.
pub struct ReadCommitted {
    tx: TxId,
    locks: Arc<LockTable>,
}

impl ReadCommitted {
    pub fn new(tx: TxId, locks: Arc<LockTable>) -> Self {
        Self { tx, locks }
    }

    /// Waits until `mode` could be granted, then gives it back.
    fn assert_lock(&self, target: &LockTarget, mode: LockMode) -> Result<()> {
        let already_held = self.locks.held_modes(target, self.tx).contains(&mode);
        self.locks.lock(target, self.tx, mode)?;
        if !already_held {
            self.locks.release(target, self.tx, mode);
        }
        Ok(())
    }
}

impl ConcurrencyStrategy for ReadCommitted {
    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::ReadCommitted
    }

    fn tx(&self) -> TxId {
        self.tx
    }

    fn lock_table(&self) -> &LockTable {
        &self.locks
    }

    fn read_file(&self, file: &str) -> Result<()> {
        self.assert_lock(&LockTarget::file(file), LockMode::IntentionShared)
    }

    fn read_block(&self, block: &BlockId) -> Result<()> {
        self.read_file(block.file())?;
        self.assert_lock(&LockTarget::Block(block.clone()), LockMode::IntentionShared)
    }

    fn read_record(&self, rid: &RecordId) -> Result<()> {
        self.read_block(&rid.block)?;
        self.locks.s_lock(&LockTarget::Record(rid.clone()), self.tx)
    }

    fn read_index(&self, index_file: &str) -> Result<()> {
        self.read_file(index_file)
    }

    fn read_leaf_block(&self, block: &BlockId) -> Result<()> {
        self.read_file(block.file())?;
        self.locks.s_lock(&LockTarget::Block(block.clone()), self.tx)
    }

    fn read_directory_block(&self, block: &BlockId) -> Result<()> {
        self.read_file(block.file())?;
        self.locks.s_lock(&LockTarget::Block(block.clone()), self.tx)
    }

    fn end_statement(&self) {
        self.locks.release_all(self.tx, true);
    }
}

/// Repeatable-read: every lock is held to the end of the transaction.
pub struct RepeatableRead {
    tx: TxId,
    locks: Arc<LockTable>,
}

impl RepeatableRead {
    pub fn new(tx: TxId, locks: Arc<LockTable>) -> Self {
        Self { tx, locks }
    }
}

impl ConcurrencyStrategy for RepeatableRead {
    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::RepeatableRead
    }

    fn tx(&self) -> TxId {
        self.tx
    }

    fn lock_table(&self) -> &LockTable {
        &self.locks
    }

    fn read_file(&self, file: &str) -> Result<()> {
        self.locks.is_lock(&LockTarget::file(file), self.tx)
    }

    fn read_block(&self, block: &BlockId) -> Result<()> {
        self.read_file(block.file())?;
        self.locks.is_lock(&LockTarget::Block(block.clone()), self.tx)
    }

    fn read_record(&self, rid: &RecordId) -> Result<()> {
        self.read_block(&rid.block)?;
        self.locks.s_lock(&LockTarget::Record(rid.clone()), self.tx)
    }

    fn read_index(&self, index_file: &str) -> Result<()> {
        self.read_file(index_file)
    }

    fn read_leaf_block(&self, block: &BlockId) -> Result<()> {
        self.read_file(block.file())?;
        self.locks.s_lock(&LockTarget::Block(block.clone()), self.tx)
    }

    fn read_directory_block(&self, block: &BlockId) -> Result<()> {
        self.read_file(block.file())?;
        self.locks.s_lock(&LockTarget::Block(block.clone()), self.tx)
    }

    fn end_statement(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{SlotId, StrataError};
    use std::thread;
    use std::time::Duration;

    fn lock_table() -> Arc<LockTable> {
        Arc::new(LockTable::new(16, Duration::from_millis(50), 64))
    }

    fn rid(block: u64, slot: u16) -> RecordId {
        RecordId::new(BlockId::new("t.tbl", block), SlotId::new(slot))
    }

    fn file() -> LockTarget {
        LockTarget::file("t.tbl")
    }

    #[test]
    fn test_write_takes_intents_on_ancestors() {
        let locks = lock_table();
        for isolation in [IsolationLevel::ReadCommitted, IsolationLevel::RepeatableRead] {
            let tx = TxId::new(1);
            let strategy = strategy_for(isolation, tx, Arc::clone(&locks));
            strategy.modify_record(&rid(0, 1)).unwrap();

            let block = LockTarget::Block(BlockId::new("t.tbl", 0));
            assert_eq!(locks.held_modes(&file(), tx), vec![LockMode::IntentionExclusive]);
            assert_eq!(locks.held_modes(&block, tx), vec![LockMode::IntentionExclusive]);
            assert!(locks.holds(&LockTarget::Record(rid(0, 1)), tx, LockMode::Exclusive));

            // Writes survive the statement boundary
            strategy.end_statement();
            assert!(locks.holds(&LockTarget::Record(rid(0, 1)), tx, LockMode::Exclusive));

            strategy.release_all();
            assert_eq!(locks.target_count(), 0);
        }
    }

    #[test]
    fn test_read_committed_statement_scope() {
        let locks = lock_table();
        let tx = TxId::new(1);
        let strategy = strategy_for(IsolationLevel::ReadCommitted, tx, Arc::clone(&locks));

        strategy.read_record(&rid(0, 1)).unwrap();
        // Coarse intents were only asserted
        assert!(locks.held_modes(&file(), tx).is_empty());
        assert_eq!(locks.locked_targets(tx), vec![LockTarget::Record(rid(0, 1))]);

        strategy.end_statement();
        assert!(locks.locked_targets(tx).is_empty());
    }

    #[test]
    fn test_read_committed_sees_new_writer_after_statement() {
        let locks = lock_table();
        let reader = strategy_for(IsolationLevel::ReadCommitted, TxId::new(1), Arc::clone(&locks));
        reader.read_record(&rid(0, 1)).unwrap();
        reader.end_statement();

        // A younger writer is not blocked once the statement ended
        let writer = strategy_for(IsolationLevel::RepeatableRead, TxId::new(2), Arc::clone(&locks));
        writer.modify_record(&rid(0, 1)).unwrap();
    }

    #[test]
    fn test_repeatable_read_holds_to_end() {
        let locks = lock_table();
        let tx = TxId::new(1);
        let strategy = strategy_for(IsolationLevel::RepeatableRead, tx, Arc::clone(&locks));

        strategy.read_record(&rid(0, 1)).unwrap();
        strategy.end_statement();
        assert!(locks.holds(&file(), tx, LockMode::IntentionShared));
        assert!(locks.holds(&LockTarget::Record(rid(0, 1)), tx, LockMode::Shared));

        let writer = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let writer = strategy_for(IsolationLevel::RepeatableRead, TxId::new(2), locks);
                let result = writer.modify_record(&rid(0, 1));
                writer.release_all();
                result
            })
        };
        let err = writer.join().unwrap().unwrap_err();
        assert!(matches!(err, StrataError::LockTimeout { .. }));

        strategy.release_all();
        assert_eq!(locks.target_count(), 0);
    }

    #[test]
    fn test_read_committed_keeps_existing_intent() {
        let locks = lock_table();
        let tx = TxId::new(1);
        let strategy = strategy_for(IsolationLevel::ReadCommitted, tx, Arc::clone(&locks));

        strategy.modify_record(&rid(0, 1)).unwrap();
        strategy.read_record(&rid(0, 2)).unwrap();
        assert_eq!(locks.held_modes(&file(), tx), vec![LockMode::IntentionExclusive]);
    }

    #[test]
    fn test_directory_crabbing() {
        let locks = lock_table();
        let tx = TxId::new(1);
        let strategy = strategy_for(IsolationLevel::RepeatableRead, tx, Arc::clone(&locks));
        let root = BlockId::new("idx", 0);
        let child = BlockId::new("idx", 1);

        strategy.read_directory_block(&root).unwrap();
        strategy.read_directory_block(&child).unwrap();
        strategy.release_directory_block(&root);

        assert!(!locks.holds(&LockTarget::Block(root.clone()), tx, LockMode::Shared));
        assert!(locks.holds(&LockTarget::Block(child), tx, LockMode::Shared));
        assert!(locks.holds(&LockTarget::file("idx"), tx, LockMode::IntentionShared));

        strategy.modify_directory_block(&root).unwrap();
        assert!(locks.holds(&LockTarget::file("idx"), tx, LockMode::IntentionExclusive));
        strategy.release_directory_block(&root);
        assert!(locks.held_modes(&LockTarget::Block(root), tx).is_empty());
    }

    #[test]
    fn test_leaf_reads_follow_isolation() {
        let locks = lock_table();
        let leaf = BlockId::new("idx", 4);
        let leaf_target = LockTarget::Block(leaf.clone());

        let rc = strategy_for(IsolationLevel::ReadCommitted, TxId::new(1), Arc::clone(&locks));
        rc.read_leaf_block(&leaf).unwrap();
        assert!(locks.holds(&leaf_target, TxId::new(1), LockMode::Shared));
        rc.end_statement();
        assert!(!locks.holds(&leaf_target, TxId::new(1), LockMode::Shared));

        let rr = strategy_for(IsolationLevel::RepeatableRead, TxId::new(2), Arc::clone(&locks));
        rr.read_leaf_block(&leaf).unwrap();
        rr.end_statement();
        assert!(locks.holds(&leaf_target, TxId::new(2), LockMode::Shared));
    }

    #[test]
    fn test_modify_index_takes_file_exclusive() {
        let locks = lock_table();
        let strategy = strategy_for(IsolationLevel::ReadCommitted, TxId::new(3), Arc::clone(&locks));
        strategy.modify_index("idx").unwrap();
        assert!(locks.holds(&LockTarget::file("idx"), TxId::new(3), LockMode::Exclusive));
        assert_eq!(strategy.isolation(), IsolationLevel::ReadCommitted);
    }
}
