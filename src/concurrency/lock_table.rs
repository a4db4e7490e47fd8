use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::common::{LockTarget, Result, StrataError, TxId};

use super::{LockMode, WakeupNotifier};

/// Holder and waiter state of one lock target.
#[derive(Debug, Default)]
struct Lockers {
    is: HashSet<TxId>,
    ix: HashSet<TxId>,
    s: HashSet<TxId>,
    six: Option<TxId>,
    x: Option<TxId>,
    waiting: HashSet<TxId>,
}

impl Lockers {
    fn modes_of(&self, tx: TxId) -> Vec<LockMode> {
        let mut modes = Vec::new();
        if self.is.contains(&tx) {
            modes.push(LockMode::IntentionShared);
        }
        if self.ix.contains(&tx) {
            modes.push(LockMode::IntentionExclusive);
        }
        if self.s.contains(&tx) {
            modes.push(LockMode::Shared);
        }
        if self.six == Some(tx) {
            modes.push(LockMode::SharedIntentionExclusive);
        }
        if self.x == Some(tx) {
            modes.push(LockMode::Exclusive);
        }
        modes
    }

    fn covers(&self, tx: TxId, mode: LockMode) -> bool {
        self.modes_of(tx).into_iter().any(|held| held.covers(mode))
    }

    /// Other transactions whose holdings keep `mode` from being granted
    /// to `tx`.
    fn blockers(&self, tx: TxId, mode: LockMode) -> Vec<TxId> {
        let mut out = Vec::new();
        let mut others = |set: &HashSet<TxId>| out.extend(set.iter().copied().filter(|&t| t != tx));
        match mode {
            LockMode::IntentionShared => {}
            LockMode::IntentionExclusive => others(&self.s),
            LockMode::Shared => others(&self.ix),
            LockMode::SharedIntentionExclusive => {
                others(&self.ix);
                others(&self.s);
            }
            LockMode::Exclusive => {
                others(&self.is);
                others(&self.ix);
                others(&self.s);
            }
        }

        // IS tolerates a SIX holder; every mode conflicts with X
        if mode != LockMode::IntentionShared {
            out.extend(self.six.filter(|&t| t != tx));
        }
        out.extend(self.x.filter(|&t| t != tx));

        out.sort();
        out.dedup();
        out
    }

    fn grant(&mut self, tx: TxId, mode: LockMode) {
        match mode {
            LockMode::IntentionShared => {
                self.is.insert(tx);
            }
            LockMode::IntentionExclusive => {
                self.ix.insert(tx);
            }
            LockMode::Shared => {
                self.s.insert(tx);
            }
            LockMode::SharedIntentionExclusive => self.six = Some(tx),
            LockMode::Exclusive => self.x = Some(tx),
        }
    }

    fn revoke(&mut self, tx: TxId, mode: LockMode) {
        match mode {
            LockMode::IntentionShared => {
                self.is.remove(&tx);
            }
            LockMode::IntentionExclusive => {
                self.ix.remove(&tx);
            }
            LockMode::Shared => {
                self.s.remove(&tx);
            }
            LockMode::SharedIntentionExclusive => {
                if self.six == Some(tx) {
                    self.six = None;
                }
            }
            LockMode::Exclusive => {
                if self.x == Some(tx) {
                    self.x = None;
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.is.is_empty()
            && self.ix.is_empty()
            && self.s.is_empty()
            && self.six.is_none()
            && self.x.is_none()
            && self.waiting.is_empty()
    }
}

/// One striped anchor: the lockers of every target hashed here, plus the
/// condition their waiters park on.
#[derive(Default)]
struct Anchor {
    lockers: Mutex<HashMap<LockTarget, Lockers>>,
    wakeup: Condvar,
}

/// State shared with the wakeup worker.
struct Anchors {
    anchors: Vec<Anchor>,
    /// Anchor each transaction last parked on
    wait_anchor: Mutex<HashMap<TxId, usize>>,
}

impl Anchors {
    fn index_of(&self, target: &LockTarget) -> usize {
        let mut hasher = DefaultHasher::new();
        target.hash(&mut hasher);
        (hasher.finish() as usize) % self.anchors.len()
    }

    /// Wakes every waiter on the anchor `tx` last parked on.
    fn wake(&self, tx: TxId) {
        let idx = self.wait_anchor.lock().get(&tx).copied();
        if let Some(idx) = idx {
            let anchor = &self.anchors[idx];
            // Taking the mutex orders the notify after the victim has parked
            let _lockers = anchor.lockers.lock();
            anchor.wakeup.notify_all();
        }
    }
}

/// LockTable grants multi-granularity locks to transactions.
///
/// Conflicts are resolved with wound-wait: an older requester marks every
/// younger conflicting holder doomed and waits; a younger requester simply
/// waits. A doomed transaction fails with `Wounded` the next time it has
/// to wait for a lock. Every wait is bounded by `max_wait`, after which the
/// request fails with `LockTimeout`.
///
/// # Thread Safety
/// - `anchors`: striped mutex + condvar pairs, selected by target hash
/// - `doomed`, `held`: short critical sections, never held across a wait
/// - lock order is anchor, then `doomed` / `held` / `wait_anchor`
pub struct LockTable {
    shared: Arc<Anchors>,
    doomed: Mutex<HashSet<TxId>>,
    /// Targets each transaction holds at least one mode on
    held: Mutex<HashMap<TxId, HashSet<LockTarget>>>,
    notifier: WakeupNotifier,
    max_wait: Duration,
}

impl LockTable {
    /// Creates a lock table with `anchors` striped anchors.
    ///
    /// # Panics
    /// Panics if `anchors` is 0.
    pub fn new(anchors: usize, max_wait: Duration, notify_capacity: usize) -> Self {
        assert!(anchors > 0, "anchors must be > 0");

        let shared = Arc::new(Anchors {
            anchors: (0..anchors).map(|_| Anchor::default()).collect(),
            wait_anchor: Mutex::new(HashMap::new()),
        });
        let worker_shared = Arc::clone(&shared);
        let notifier = WakeupNotifier::new(notify_capacity, move |tx| worker_shared.wake(tx));

        Self {
            shared,
            doomed: Mutex::new(HashSet::new()),
            held: Mutex::new(HashMap::new()),
            notifier,
            max_wait,
        }
    }

    pub fn is_lock(&self, target: &LockTarget, tx: TxId) -> Result<()> {
        self.lock(target, tx, LockMode::IntentionShared)
    }

    pub fn ix_lock(&self, target: &LockTarget, tx: TxId) -> Result<()> {
        self.lock(target, tx, LockMode::IntentionExclusive)
    }

    pub fn s_lock(&self, target: &LockTarget, tx: TxId) -> Result<()> {
        self.lock(target, tx, LockMode::Shared)
    }

    pub fn six_lock(&self, target: &LockTarget, tx: TxId) -> Result<()> {
        self.lock(target, tx, LockMode::SharedIntentionExclusive)
    }

    pub fn x_lock(&self, target: &LockTarget, tx: TxId) -> Result<()> {
        self.lock(target, tx, LockMode::Exclusive)
    }

    /// Acquires `mode` on `target` for `tx`, waiting if necessary.
    ///
    /// A request covered by a mode `tx` already holds returns at once.
    pub fn lock(&self, target: &LockTarget, tx: TxId, mode: LockMode) -> Result<()> {
        let idx = self.shared.index_of(target);
        let anchor = &self.shared.anchors[idx];
        let mut lockers = anchor.lockers.lock();
        let deadline = Instant::now() + self.max_wait;
        let mut waited = false;

        loop {
            let entry = lockers.entry(target.clone()).or_default();
            if entry.covers(tx, mode) {
                entry.waiting.remove(&tx);
                break;
            }

            let blockers = entry.blockers(tx, mode);
            if blockers.is_empty() {
                entry.grant(tx, mode);
                entry.waiting.remove(&tx);
                break;
            }

            self.shared.wait_anchor.lock().insert(tx, idx);
            if self.is_doomed(tx) {
                debug!(%tx, %target, %mode, "wounded transaction reached a lock wait");
                Self::stop_waiting(&mut lockers, target, tx);
                return Err(StrataError::Wounded { tx });
            }

            for holder in blockers.into_iter().filter(|&h| tx.is_older_than(h)) {
                self.wound(holder, tx, target);
            }

            if Instant::now() >= deadline {
                debug!(%tx, %target, %mode, "lock wait timed out");
                Self::stop_waiting(&mut lockers, target, tx);
                return Err(StrataError::LockTimeout {
                    tx,
                    target: target.clone(),
                });
            }

            if let Some(entry) = lockers.get_mut(target) {
                entry.waiting.insert(tx);
            }
            if !waited {
                trace!(%tx, %target, %mode, "waiting for lock");
                waited = true;
            }
            anchor.wakeup.wait_until(&mut lockers, deadline);
        }
        drop(lockers);

        if waited {
            self.shared.wait_anchor.lock().remove(&tx);
        }
        self.held
            .lock()
            .entry(tx)
            .or_default()
            .insert(target.clone());
        Ok(())
    }

    /// Releases `mode` on `target` held by `tx` and wakes the target's
    /// waiters.
    pub fn release(&self, target: &LockTarget, tx: TxId, mode: LockMode) {
        let still_held = self.revoke_modes(target, tx, |m| m == mode);
        if !still_held {
            self.forget_target(tx, target);
        }
    }

    /// Releases every lock `tx` holds. With `shared_only`, only IS and S
    /// are released and the exclusive and intention-exclusive modes stay.
    pub fn release_all(&self, tx: TxId, shared_only: bool) {
        let targets: Vec<LockTarget> = match self.held.lock().get(&tx) {
            Some(targets) => targets.iter().cloned().collect(),
            None => Vec::new(),
        };

        for target in &targets {
            let still_held = self.revoke_modes(target, tx, |m| !shared_only || m.is_shared());
            if !still_held {
                self.forget_target(tx, target);
            }
        }

        if !shared_only {
            self.held.lock().remove(&tx);
            self.doomed.lock().remove(&tx);
            self.shared.wait_anchor.lock().remove(&tx);
        }
        trace!(%tx, shared_only, targets = targets.len(), "released locks");
    }

    /// Returns true if `tx` holds a mode on `target` that covers `mode`.
    pub fn holds(&self, target: &LockTarget, tx: TxId, mode: LockMode) -> bool {
        let anchor = &self.shared.anchors[self.shared.index_of(target)];
        let lockers = anchor.lockers.lock();
        lockers
            .get(target)
            .map_or(false, |entry| entry.covers(tx, mode))
    }

    /// Modes `tx` holds on `target`, weakest first.
    pub fn held_modes(&self, target: &LockTarget, tx: TxId) -> Vec<LockMode> {
        let anchor = &self.shared.anchors[self.shared.index_of(target)];
        let lockers = anchor.lockers.lock();
        lockers
            .get(target)
            .map_or_else(Vec::new, |entry| entry.modes_of(tx))
    }

    /// Targets `tx` holds at least one mode on.
    pub fn locked_targets(&self, tx: TxId) -> Vec<LockTarget> {
        let mut targets: Vec<_> = self
            .held
            .lock()
            .get(&tx)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        targets
    }

    pub fn is_doomed(&self, tx: TxId) -> bool {
        self.doomed.lock().contains(&tx)
    }

    /// Number of targets with live holder or waiter state.
    pub fn target_count(&self) -> usize {
        self.shared
            .anchors
            .iter()
            .map(|anchor| anchor.lockers.lock().len())
            .sum()
    }

    fn wound(&self, victim: TxId, by: TxId, target: &LockTarget) {
        if !self.doomed.lock().insert(victim) {
            return;
        }
        debug!(%victim, %by, %target, "wounding younger holder");
        self.notifier.notify(victim);
    }

    /// Revokes the modes selected by `filter`, wakes the anchor and drops
    /// idle state. Returns true if `tx` still holds something on `target`.
    fn revoke_modes<F>(&self, target: &LockTarget, tx: TxId, filter: F) -> bool
    where
        F: Fn(LockMode) -> bool,
    {
        let anchor = &self.shared.anchors[self.shared.index_of(target)];
        let mut lockers = anchor.lockers.lock();
        let still_held = match lockers.get_mut(target) {
            Some(entry) => {
                for mode in LockMode::ALL.into_iter().filter(|&m| filter(m)) {
                    entry.revoke(tx, mode);
                }
                let still_held = !entry.modes_of(tx).is_empty();
                if entry.is_idle() {
                    lockers.remove(target);
                }
                still_held
            }
            None => false,
        };
        anchor.wakeup.notify_all();
        still_held
    }

    fn forget_target(&self, tx: TxId, target: &LockTarget) {
        let mut held = self.held.lock();
        if let Some(targets) = held.get_mut(&tx) {
            targets.remove(target);
            if targets.is_empty() {
                held.remove(&tx);
            }
        }
    }

    fn stop_waiting(lockers: &mut HashMap<LockTarget, Lockers>, target: &LockTarget, tx: TxId) {
        if let Some(entry) = lockers.get_mut(target) {
            entry.waiting.remove(&tx);
            if entry.is_idle() {
                lockers.remove(target);
            }
        }
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("anchors", &self.shared.anchors.len())
            .field("targets", &self.target_count())
            .field("max_wait", &self.max_wait)
            .finish()
    }
}
