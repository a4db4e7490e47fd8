use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::common::{BlockId, FrameId, Result, TxId};
use crate::storage::file::FileManager;
use crate::storage::log::WriteAheadLog;
use crate::storage::page::PageFormatter;

use super::frame::SwapGuard;
use super::Frame;

/// What a claimed victim frame should be bound to.
enum Binding<'a> {
    Existing(&'a BlockId),
    New(&'a str, &'a dyn PageFormatter),
}

/// BufferPool owns a fixed array of frames and maps blocks onto them.
///
/// It never blocks waiting for a frame: when every frame is pinned, `pin`
/// and `pin_new` return `Ok(None)` and the caller decides how to wait.
///
/// # Thread Safety
/// - `block_table`: `RwLock`, written only while a frame changes identity
/// - `block_stripes`: serialize the first pin of a block, selected by hash
/// - `file_stripes`: serialize `pin_new` per file, selected by hash
/// - each frame's swap lock guards its identity and pin transitions
pub struct BufferPool {
    /// The buffer pool frames
    frames: Vec<Arc<Frame>>,
    /// Maps block IDs to frame indexes
    block_table: RwLock<HashMap<BlockId, usize>>,
    /// Number of unpinned frames
    available: AtomicUsize,
    /// Index of the most recently evicted frame
    last_evicted: AtomicUsize,
    block_stripes: Vec<Mutex<()>>,
    file_stripes: Vec<Mutex<()>>,
    file_manager: Arc<FileManager>,
}

impl BufferPool {
    /// Creates a pool of `pool_size` frames sized to the file manager's blocks.
    ///
    /// # Panics
    /// Panics if `pool_size` or `stripes` is 0.
    pub fn new(
        pool_size: usize,
        stripes: usize,
        file_manager: Arc<FileManager>,
        log: Arc<dyn WriteAheadLog>,
    ) -> Self {
        assert!(pool_size > 0, "pool_size must be > 0");
        assert!(stripes > 0, "stripes must be > 0");

        let block_size = file_manager.block_size();
        let frames = (0..pool_size)
            .map(|i| {
                Arc::new(Frame::new(
                    FrameId::new(i as u32),
                    block_size,
                    Arc::clone(&file_manager),
                    Arc::clone(&log),
                ))
            })
            .collect();

        Self {
            frames,
            block_table: RwLock::new(HashMap::new()),
            available: AtomicUsize::new(pool_size),
            last_evicted: AtomicUsize::new(pool_size - 1),
            block_stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
            file_stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
            file_manager,
        }
    }

    /// Pins the frame holding `block`, loading it if necessary.
    ///
    /// Returns `Ok(None)` when every frame is pinned or busy.
    pub fn pin(&self, block: &BlockId) -> Result<Option<Arc<Frame>>> {
        loop {
            let stripe = self.block_stripes[stripe_index(block, self.block_stripes.len())].lock();

            let mapped = self.block_table.read().get(block).copied();
            let idx = match mapped {
                Some(idx) => idx,
                None => {
                    let frame = self.claim_victim(Binding::Existing(block))?;
                    drop(stripe);
                    return Ok(frame);
                }
            };

            let frame = &self.frames[idx];
            let swap = frame.lock_swap();
            // Later pinners of a mapped block only need the frame's own lock
            drop(stripe);

            if frame.block().as_ref() != Some(block) {
                // Evicted between the lookup and the swap lock
                drop(swap);
                continue;
            }

            if frame.pin() == 1 {
                self.available.fetch_sub(1, Ordering::AcqRel);
            }
            return Ok(Some(Arc::clone(frame)));
        }
    }

    /// Appends a new block to `file`, formats it and returns its pinned frame.
    ///
    /// Returns `Ok(None)` when every frame is pinned or busy.
    pub fn pin_new(
        &self,
        file: &str,
        formatter: &dyn PageFormatter,
    ) -> Result<Option<Arc<Frame>>> {
        let _stripe = self.file_stripes[stripe_index(file, self.file_stripes.len())].lock();
        self.claim_victim(Binding::New(file, formatter))
    }

    /// Releases one pin on `frame`.
    ///
    /// # Panics
    /// Panics if the frame is not pinned.
    pub fn unpin(&self, frame: &Frame) {
        let _swap = frame.lock_swap();
        let remaining = frame
            .unpin()
            .unwrap_or_else(|| panic!("unpin of unpinned {}", frame.frame_id()));
        if remaining == 0 {
            self.available.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Number of frames that are not pinned.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Writes back every dirty or fresh frame.
    pub fn flush_all(&self) -> Result<()> {
        for frame in &self.frames {
            frame.flush()?;
        }
        Ok(())
    }

    /// Writes back every frame last modified by `tx`.
    pub fn flush_all_for(&self, tx: TxId) -> Result<()> {
        for frame in &self.frames {
            if frame.modified_by() == Some(tx) {
                frame.flush()?;
            }
        }
        Ok(())
    }

    /// Returns the pool size.
    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    /// Returns the pin count of the frame holding `block`, if it is cached.
    pub fn pin_count(&self, block: &BlockId) -> Option<u32> {
        let idx = self.block_table.read().get(block).copied()?;
        Some(self.frames[idx].pin_count())
    }

    /// Returns true if `block` currently has a frame.
    pub fn contains(&self, block: &BlockId) -> bool {
        self.block_table.read().contains_key(block)
    }

    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    /// Scans circularly from just after the last evicted frame for an
    /// unpinned frame whose second-chance bit is clear, binds it and pins it.
    ///
    /// Two laps are made so that frames whose bit was cleared on the first
    /// lap can still be chosen.
    fn claim_victim(&self, binding: Binding<'_>) -> Result<Option<Arc<Frame>>> {
        let n = self.frames.len();
        let start = (self.last_evicted.load(Ordering::Acquire) + 1) % n;

        for step in 0..2 * n {
            let idx = (start + step) % n;
            let frame = &self.frames[idx];

            let swap = match frame.try_lock_swap() {
                Some(swap) => swap,
                None => continue,
            };
            if frame.is_pinned() || frame.take_recently_pinned() {
                continue;
            }

            self.rebind(idx, frame, &swap, &binding)?;

            frame.pin();
            self.available.fetch_sub(1, Ordering::AcqRel);
            self.last_evicted.store(idx, Ordering::Release);
            return Ok(Some(Arc::clone(frame)));
        }

        debug!(pool_size = n, "no evictable frame found");
        Ok(None)
    }

    fn rebind(
        &self,
        idx: usize,
        frame: &Frame,
        swap: &SwapGuard<'_>,
        binding: &Binding<'_>,
    ) -> Result<()> {
        let old = frame.block();

        let assigned = match binding {
            Binding::Existing(block) => frame.assign_to_block(swap, block).map(|()| (*block).clone()),
            Binding::New(file, formatter) => frame.assign_to_new(swap, file, *formatter),
        };

        let mut table = self.block_table.write();
        match assigned {
            Ok(block) => {
                if let Some(old) = &old {
                    table.remove(old);
                }
                trace!(frame = idx, old = ?old, new = %block, "frame rebound");
                table.insert(block, idx);
                Ok(())
            }
            Err(e) => {
                // A failed load leaves the frame unassigned
                if frame.block().is_none() {
                    if let Some(old) = &old {
                        table.remove(old);
                    }
                }
                Err(e)
            }
        }
    }
}

fn stripe_index<K: Hash + ?Sized>(key: &K, stripes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % stripes
}

#[cfg(test)]
impl BufferPool {
    fn lock_block_stripe(&self, block: &BlockId) -> parking_lot::MutexGuard<'_, ()> {
        self.block_stripes[stripe_index(block, self.block_stripes.len())].lock()
    }
}
