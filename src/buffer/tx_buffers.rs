use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::{BlockId, FrameId, Result, StrataError, TxId};
use crate::storage::page::PageFormatter;

use super::{Frame, PinCoordinator};

struct PinnedBlock {
    frame: Arc<Frame>,
    refs: u32,
}

/// TxBuffers is one transaction's view of the buffer pool.
///
/// Repeated pins of the same block are counted locally and reach the pool
/// only once. When the pool is saturated the transaction queues on the
/// shared [`PinCoordinator`]; if it stays starved past `max_wait` it gives
/// up every frame it holds, lets the queue drain, and pins them again.
///
/// Everything still held is released when the value is dropped.
pub struct TxBuffers {
    tx: TxId,
    coordinator: Arc<PinCoordinator>,
    pins: HashMap<BlockId, PinnedBlock>,
    /// Every frame this transaction has pinned, for commit-time flush
    touched: HashMap<FrameId, Arc<Frame>>,
}

impl TxBuffers {
    pub fn new(tx: TxId, coordinator: Arc<PinCoordinator>) -> Self {
        Self {
            tx,
            coordinator,
            pins: HashMap::new(),
            touched: HashMap::new(),
        }
    }

    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// Pins `block`, waiting for a frame if the pool is saturated.
    ///
    /// Fails with `ResourceExhausted` if this transaction already holds as
    /// many blocks as the pool has frames, or if the starvation breaker
    /// could not get the frames back.
    pub fn pin(&mut self, block: &BlockId) -> Result<Arc<Frame>> {
        if let Some(pinned) = self.pins.get_mut(block) {
            pinned.refs += 1;
            return Ok(Arc::clone(&pinned.frame));
        }

        let target = block.to_string();
        self.check_monopoly(&target)?;

        let pool = Arc::clone(self.coordinator.pool());
        let frame = self.acquire(&target, || pool.pin(block))?;
        self.record(block.clone(), Arc::clone(&frame), 1);
        Ok(frame)
    }

    /// Appends a block to `file` and pins it, with the same waiting
    /// protocol as [`TxBuffers::pin`].
    pub fn pin_new(&mut self, file: &str, formatter: &dyn PageFormatter) -> Result<Arc<Frame>> {
        let target = format!("a new block of file {}", file);
        self.check_monopoly(&target)?;

        let pool = Arc::clone(self.coordinator.pool());
        let frame = self.acquire(&target, || pool.pin_new(file, formatter))?;
        self.record(frame.assigned_block(), Arc::clone(&frame), 1);
        Ok(frame)
    }

    /// Drops one local pin on `block`; the pool is unpinned at zero.
    ///
    /// # Panics
    /// Panics if this transaction does not hold `block`.
    pub fn unpin(&mut self, block: &BlockId) {
        match self.pins.entry(block.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().refs -= 1;
                if entry.get().refs == 0 {
                    let pinned = entry.remove();
                    self.release_frame(&pinned.frame);
                }
            }
            Entry::Vacant(entry) => {
                panic!("{} unpinned {} which it does not hold", self.tx, entry.key())
            }
        }
    }

    /// Returns the frame currently holding `block` for this transaction.
    pub fn frame(&self, block: &BlockId) -> Option<Arc<Frame>> {
        self.pins.get(block).map(|p| Arc::clone(&p.frame))
    }

    /// Local pin count of `block`, 0 if not held.
    pub fn ref_count(&self, block: &BlockId) -> u32 {
        self.pins.get(block).map_or(0, |p| p.refs)
    }

    /// Blocks currently held, in order.
    pub fn held_blocks(&self) -> Vec<BlockId> {
        let mut blocks: Vec<_> = self.pins.keys().cloned().collect();
        blocks.sort();
        blocks
    }

    /// Writes back every touched frame this transaction last modified.
    pub fn flush_mine(&self) -> Result<()> {
        for frame in self.touched.values() {
            if frame.modified_by() == Some(self.tx) {
                frame.flush()?;
            }
        }
        Ok(())
    }

    /// Unpins every held block regardless of its local count.
    pub fn release_all(&mut self) {
        if self.pins.is_empty() {
            return;
        }
        let pool = self.coordinator.pool();
        for (_, pinned) in self.pins.drain() {
            pool.unpin(&pinned.frame);
        }
        self.touched.clear();
        if self.coordinator.has_waiters() {
            self.coordinator.wake_head();
        }
    }

    fn check_monopoly(&self, target: &str) -> Result<()> {
        let pool_size = self.coordinator.pool().pool_size();
        if self.pins.len() >= pool_size {
            warn!(tx = %self.tx, target, pool_size, "transaction would monopolize the pool");
            return Err(self.exhausted(target));
        }
        Ok(())
    }

    fn acquire<F>(&mut self, target: &str, mut attempt: F) -> Result<Arc<Frame>>
    where
        F: FnMut() -> Result<Option<Arc<Frame>>>,
    {
        if let Some(frame) = attempt()? {
            return Ok(frame);
        }

        debug!(tx = %self.tx, target, "pool saturated, queueing for a frame");
        let max_wait = self.coordinator.max_wait();
        if let Some(frame) = self.coordinator.wait_for(max_wait, &mut attempt)? {
            return Ok(frame);
        }

        self.break_starvation(target, attempt)
    }

    /// Releases every held frame, waits one window, then pins the held
    /// blocks again followed by the requested one.
    fn break_starvation<F>(&mut self, target: &str, mut attempt: F) -> Result<Arc<Frame>>
    where
        F: FnMut() -> Result<Option<Arc<Frame>>>,
    {
        warn!(
            tx = %self.tx,
            target,
            held = self.pins.len(),
            "starved for a frame, releasing held blocks"
        );

        let pool = Arc::clone(self.coordinator.pool());
        let mut held: Vec<(BlockId, u32)> = self
            .pins
            .drain()
            .map(|(block, pinned)| {
                pool.unpin(&pinned.frame);
                (block, pinned.refs)
            })
            .collect();
        held.sort();

        self.coordinator.wake_head();
        self.coordinator.pause();

        let max_wait = self.coordinator.max_wait();
        for (block, refs) in held {
            match self.coordinator.wait_for(max_wait, || pool.pin(&block))? {
                Some(frame) => self.record(block, frame, refs),
                None => return Err(self.exhausted(&block.to_string())),
            }
        }

        match self.coordinator.wait_for(max_wait, &mut attempt)? {
            Some(frame) => {
                debug!(tx = %self.tx, target, "starvation breaker recovered");
                Ok(frame)
            }
            None => Err(self.exhausted(target)),
        }
    }

    fn record(&mut self, block: BlockId, frame: Arc<Frame>, refs: u32) {
        self.touched.insert(frame.frame_id(), Arc::clone(&frame));
        self.pins.insert(block, PinnedBlock { frame, refs });
    }

    fn release_frame(&self, frame: &Frame) {
        self.coordinator.pool().unpin(frame);
        if self.coordinator.has_waiters() {
            self.coordinator.wake_head();
        }
    }

    fn exhausted(&self, target: &str) -> StrataError {
        StrataError::ResourceExhausted {
            tx: self.tx,
            target: target.to_string(),
        }
    }
}

impl Drop for TxBuffers {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for TxBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxBuffers")
            .field("tx", &self.tx)
            .field("held", &self.held_blocks())
            .finish()
    }
}
