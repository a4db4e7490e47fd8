use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{trace, warn};

use crate::common::TxId;

/// WakeupNotifier delivers wound notifications off the critical path.
///
/// A background worker drains a bounded queue of transaction ids and runs
/// the wake callback for each one. Enqueueing never blocks: when the queue
/// is full the wakeup is dropped and the victim notices its doomed mark at
/// its next bounded-wait recheck.
pub struct WakeupNotifier {
    sender: Sender<TxId>,
    /// Flag to signal shutdown
    shutdown: Arc<AtomicBool>,
    /// Handle to the background worker thread
    worker_handle: Option<JoinHandle<()>>,
}

impl WakeupNotifier {
    pub fn new<F>(capacity: usize, wake: F) -> Self
    where
        F: Fn(TxId) + Send + 'static,
    {
        let (sender, receiver) = bounded::<TxId>(capacity);
        let shutdown = Arc::new(AtomicBool::new(false));

        let shutdown_clone = Arc::clone(&shutdown);
        let worker_handle = thread::spawn(move || {
            Self::start_worker_thread(receiver, shutdown_clone, wake);
        });

        Self {
            sender,
            shutdown,
            worker_handle: Some(worker_handle),
        }
    }

    /// Queues a wakeup for `tx`. Returns false if it was dropped.
    pub fn notify(&self, tx: TxId) -> bool {
        match self.sender.try_send(tx) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%tx, "wakeup queue full, dropping notification");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(%tx, "wakeup worker gone, dropping notification");
                false
            }
        }
    }

    /// Number of queued, undelivered wakeups.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    fn start_worker_thread<F>(receiver: Receiver<TxId>, shutdown: Arc<AtomicBool>, wake: F)
    where
        F: Fn(TxId),
    {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                while let Ok(tx) = receiver.try_recv() {
                    wake(tx);
                }
                break;
            }

            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(tx) => {
                    trace!(%tx, "delivering wakeup");
                    wake(tx);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

impl Drop for WakeupNotifier {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}
