use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::common::Result;

use super::BufferPool;

struct Waiter {
    ticket: u64,
    signal: Sender<()>,
}

/// PinCoordinator is the process-wide half of the pool front-end.
///
/// Transactions that find the pool saturated queue up here. Every waiter
/// owns a single-slot signal; only the waiter at the head of the queue
/// retries the pool when woken, so a freed frame never triggers a stampede.
pub struct PinCoordinator {
    pool: Arc<BufferPool>,
    waiters: Mutex<VecDeque<Waiter>>,
    /// Mirrors `waiters.len()` so unpinners can skip the queue lock
    waiting: AtomicUsize,
    next_ticket: AtomicU64,
    max_wait: Duration,
    wait_epsilon: Duration,
}

impl PinCoordinator {
    pub fn new(pool: Arc<BufferPool>, max_wait: Duration, wait_epsilon: Duration) -> Self {
        Self {
            pool,
            waiters: Mutex::new(VecDeque::new()),
            waiting: AtomicUsize::new(0),
            next_ticket: AtomicU64::new(0),
            max_wait,
            wait_epsilon,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn wait_epsilon(&self) -> Duration {
        self.wait_epsilon
    }

    /// Returns true if at least one transaction is queued for a frame.
    pub fn has_waiters(&self) -> bool {
        self.waiting.load(Ordering::Acquire) > 0
    }

    /// Number of queued transactions.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Signals the waiter at the head of the queue, if any.
    pub fn wake_head(&self) {
        let waiters = self.waiters.lock();
        if let Some(head) = waiters.front() {
            // A full slot already carries a pending wakeup
            let _ = head.signal.try_send(());
        }
    }

    /// Sleeps for one notification window.
    pub(crate) fn pause(&self) {
        thread::sleep(self.wait_epsilon);
    }

    /// Queues the caller and runs `attempt` each time it is at the head of
    /// the queue, until `attempt` yields a value, fails, or `budget` runs out.
    ///
    /// Returns `Ok(None)` if the budget was exhausted. The next head is
    /// signalled on the way out whatever the outcome.
    pub(crate) fn wait_for<T, F>(&self, budget: Duration, mut attempt: F) -> Result<Option<T>>
    where
        F: FnMut() -> Result<Option<T>>,
    {
        let (signal, wakeup) = crossbeam_channel::bounded(1);
        let ticket = self.enqueue(signal);
        let result = self.wait_loop(ticket, &wakeup, budget, &mut attempt);
        self.leave(ticket);
        self.wake_head();
        result
    }

    fn wait_loop<T, F>(
        &self,
        ticket: u64,
        wakeup: &Receiver<()>,
        budget: Duration,
        attempt: &mut F,
    ) -> Result<Option<T>>
    where
        F: FnMut() -> Result<Option<T>>,
    {
        let deadline = Instant::now() + budget;
        loop {
            if self.is_head(ticket) {
                if let Some(value) = attempt()? {
                    return Ok(Some(value));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = self.wait_epsilon.min(deadline - now);
            // Timeouts double as periodic rechecks
            let _ = wakeup.recv_timeout(slice);
        }
    }

    fn enqueue(&self, signal: Sender<()>) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut waiters = self.waiters.lock();
        waiters.push_back(Waiter { ticket, signal });
        self.waiting.store(waiters.len(), Ordering::Release);
        ticket
    }

    fn leave(&self, ticket: u64) {
        let mut waiters = self.waiters.lock();
        waiters.retain(|w| w.ticket != ticket);
        self.waiting.store(waiters.len(), Ordering::Release);
    }

    fn is_head(&self, ticket: u64) -> bool {
        self.waiters
            .lock()
            .front()
            .map_or(false, |head| head.ticket == ticket)
    }
}
