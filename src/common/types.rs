use std::fmt;
use std::sync::Arc;

/// Identifies a fixed-size block of persistent storage: a file name plus a
/// block number within that file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    file: Arc<str>,
    number: u64,
}

impl BlockId {
    pub fn new(file: impl Into<Arc<str>>, number: u64) -> Self {
        Self {
            file: file.into(),
            number,
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn number(&self) -> u64 {
        self.number
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[file {}, block {}]", self.file, self.number)
    }
}

/// Frame identifier type - identifies a buffer frame in the buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}

/// Transaction identifier. A numerically smaller id is an older transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub u64);

impl TxId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true if `self` started before `other`.
    pub fn is_older_than(&self, other: TxId) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Slot identifier within a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u16);

impl SlotId {
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

/// Record identifier - combination of block ID and slot ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub block: BlockId,
    pub slot: SlotId,
}

impl RecordId {
    pub fn new(block: BlockId, slot: SlotId) -> Self {
        Self { block, slot }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.block, self.slot.0)
    }
}

/// Anything the lock table can lock, from coarsest to finest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockTarget {
    File(Arc<str>),
    Block(BlockId),
    Record(RecordId),
}

impl LockTarget {
    pub fn file(name: impl Into<Arc<str>>) -> Self {
        LockTarget::File(name.into())
    }
}

impl From<BlockId> for LockTarget {
    fn from(block: BlockId) -> Self {
        LockTarget::Block(block)
    }
}

impl From<RecordId> for LockTarget {
    fn from(rid: RecordId) -> Self {
        LockTarget::Record(rid)
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::File(name) => write!(f, "file {}", name),
            LockTarget::Block(block) => write!(f, "block {}", block),
            LockTarget::Record(rid) => write!(f, "record {}", rid),
        }
    }
}

/// Log sequence number. Real positions start at 1.
pub type Lsn = u64;

/// Invalid LSN constant, meaning "no log position applied yet"
pub const INVALID_LSN: Lsn = 0;
