use std::time::Duration;

/// Size of a block in bytes (4 KB)
pub const PAGE_SIZE: usize = 4096;

/// Bytes reserved at the start of every block for the last-applied LSN
pub const LSN_HEADER_SIZE: usize = 8;

/// Default buffer pool size (number of frames)
pub const DEFAULT_POOL_SIZE: usize = 64;

/// Default upper bound on how long a pin or lock request may wait
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

/// Default length of one wait slice between re-checks
pub const DEFAULT_WAIT_EPSILON: Duration = Duration::from_millis(50);

/// Default number of striped first-touch latches in the buffer pool
pub const DEFAULT_LATCH_STRIPES: usize = 16;

/// Default number of mutex/condvar anchors in the lock table
pub const DEFAULT_LOCK_ANCHORS: usize = 64;

/// Default capacity of the wound notification queue
pub const DEFAULT_NOTIFY_QUEUE_CAPACITY: usize = 1024;

/// Tunables shared by the buffer pool and the lock table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of frames in the pool
    pub pool_size: usize,
    /// Block size used by the file manager and every frame
    pub block_size: usize,
    /// Longest a pin (before the starvation breaker) or a lock request may wait
    pub max_wait: Duration,
    /// Length of one wait slice between re-checks
    pub wait_epsilon: Duration,
    /// Number of striped first-touch latches
    pub latch_stripes: usize,
    /// Number of lock table anchors
    pub lock_anchors: usize,
    /// Capacity of the wound notification queue
    pub notify_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            block_size: PAGE_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
            wait_epsilon: DEFAULT_WAIT_EPSILON,
            latch_stripes: DEFAULT_LATCH_STRIPES,
            lock_anchors: DEFAULT_LOCK_ANCHORS,
            notify_queue_capacity: DEFAULT_NOTIFY_QUEUE_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_wait_epsilon(mut self, wait_epsilon: Duration) -> Self {
        self.wait_epsilon = wait_epsilon;
        self
    }

    pub fn with_latch_stripes(mut self, latch_stripes: usize) -> Self {
        self.latch_stripes = latch_stripes;
        self
    }

    pub fn with_lock_anchors(mut self, lock_anchors: usize) -> Self {
        self.lock_anchors = lock_anchors;
        self
    }

    pub fn with_notify_queue_capacity(mut self, capacity: usize) -> Self {
        self.notify_queue_capacity = capacity;
        self
    }
}
