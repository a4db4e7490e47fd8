//! Integration tests for the lock table

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use strata::common::{BlockId, LockTarget, RecordId, SlotId, StrataError, TxId};
use strata::concurrency::{LockMode, LockTable};

fn lock_table(max_wait: Duration) -> Arc<LockTable> {
    Arc::new(LockTable::new(16, max_wait, 128))
}

fn block(n: u64) -> LockTarget {
    LockTarget::Block(BlockId::new("accounts.tbl", n))
}

/// Starts a request on another thread and returns a flag that flips once
/// it has been granted.
fn request_in_background(
    table: &Arc<LockTable>,
    target: LockTarget,
    tx: TxId,
    mode: LockMode,
) -> (Arc<AtomicBool>, thread::JoinHandle<strata::Result<()>>) {
    let granted = Arc::new(AtomicBool::new(false));
    let handle = {
        let table = Arc::clone(table);
        let granted = Arc::clone(&granted);
        thread::spawn(move || {
            let result = table.lock(&target, tx, mode);
            granted.store(result.is_ok(), Ordering::Release);
            result
        })
    };
    (granted, handle)
}

#[test]
fn test_shared_locks_never_block() {
    let table = lock_table(Duration::from_millis(50));
    let handles: Vec<_> = (1..=8)
        .map(|id| {
            let table = Arc::clone(&table);
            thread::spawn(move || table.s_lock(&block(0), TxId::new(id)))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
}

#[test]
fn test_intention_locks_coexist() {
    let table = lock_table(Duration::from_millis(50));
    table.is_lock(&block(0), TxId::new(1)).unwrap();
    table.ix_lock(&block(0), TxId::new(2)).unwrap();
    table.ix_lock(&block(0), TxId::new(3)).unwrap();
}

#[test]
fn test_exclusive_blocks_until_release() {
    for (held, requested) in [
        (LockMode::Shared, LockMode::Exclusive),
        (LockMode::Exclusive, LockMode::Shared),
        (LockMode::Exclusive, LockMode::Exclusive),
    ] {
        let table = lock_table(Duration::from_secs(5));
        table.lock(&block(0), TxId::new(1), held).unwrap();

        let (granted, handle) = request_in_background(&table, block(0), TxId::new(2), requested);
        thread::sleep(Duration::from_millis(50));
        assert!(!granted.load(Ordering::Acquire), "{} granted over {}", requested, held);

        table.release(&block(0), TxId::new(1), held);
        handle.join().unwrap().unwrap();
        assert!(table.holds(&block(0), TxId::new(2), requested));
    }
}

#[test]
fn test_six_excludes_other_writers_and_readers() {
    let table = lock_table(Duration::from_millis(40));
    table.six_lock(&block(0), TxId::new(1)).unwrap();

    for mode in [
        LockMode::Shared,
        LockMode::IntentionExclusive,
        LockMode::SharedIntentionExclusive,
        LockMode::Exclusive,
    ] {
        let (_, handle) = request_in_background(&table, block(0), TxId::new(2), mode);
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, StrataError::LockTimeout { .. }), "{} was granted", mode);
    }

    table.is_lock(&block(0), TxId::new(2)).unwrap();
}

#[test]
fn test_younger_requester_cannot_wound_older_holder() {
    let table = lock_table(Duration::from_millis(60));
    let older = TxId::new(1);
    let younger = TxId::new(2);

    table.s_lock(&block(0), older).unwrap();
    let start = Instant::now();
    let err = table.x_lock(&block(0), younger).unwrap_err();

    assert!(matches!(err, StrataError::LockTimeout { tx, .. } if tx == younger));
    assert!(start.elapsed() >= Duration::from_millis(60));
    assert!(!table.is_doomed(older));
    // The older holder carries on without waiting
    table.x_lock(&block(0), older).unwrap();
}

#[test]
fn test_older_requester_wounds_and_waits() {
    let table = lock_table(Duration::from_millis(60));
    let older = TxId::new(1);
    let younger = TxId::new(2);

    table.s_lock(&block(0), younger).unwrap();
    let err = table.x_lock(&block(0), older).unwrap_err();
    assert!(matches!(err, StrataError::LockTimeout { tx, .. } if tx == older));

    // Wounding is lazy: the victim still holds its lock and is only told
    // at its next lock wait
    assert!(table.is_doomed(younger));
    assert!(table.holds(&block(0), younger, LockMode::Shared));

    table.x_lock(&block(1), older).unwrap();
    let err = table.s_lock(&block(1), younger).unwrap_err();
    assert!(matches!(err, StrataError::Wounded { tx } if tx == younger));

    table.release_all(younger, false);
    assert!(!table.is_doomed(younger));
    table.x_lock(&block(0), older).unwrap();
}

#[test]
fn test_release_all_forgets_transaction() {
    let table = lock_table(Duration::from_millis(50));
    let tx = TxId::new(4);
    let targets = [
        LockTarget::file("accounts.tbl"),
        block(2),
        LockTarget::Record(RecordId::new(BlockId::new("accounts.tbl", 2), SlotId::new(1))),
    ];

    table.ix_lock(&targets[0], tx).unwrap();
    table.six_lock(&targets[1], tx).unwrap();
    table.x_lock(&targets[2], tx).unwrap();
    table.release_all(tx, false);

    assert_eq!(table.target_count(), 0);
    for target in &targets {
        assert!(table.held_modes(target, tx).is_empty());
        table.x_lock(target, TxId::new(9)).unwrap();
    }
}

#[test]
fn test_commit_wakes_blocked_reader() {
    let table = lock_table(Duration::from_secs(5));
    let writer = TxId::new(1);
    let reader = TxId::new(2);

    table.x_lock(&block(7), writer).unwrap();
    let (granted, handle) = request_in_background(&table, block(7), reader, LockMode::Shared);
    thread::sleep(Duration::from_millis(30));
    assert!(!granted.load(Ordering::Acquire));

    let start = Instant::now();
    table.release_all(writer, false);
    handle.join().unwrap().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(table.holds(&block(7), reader, LockMode::Shared));
}

#[test]
fn test_wound_interrupts_parked_victim() {
    let table = lock_table(Duration::from_secs(5));
    let oldest = TxId::new(1);
    let victim = TxId::new(5);
    let blocker = TxId::new(3);

    table.s_lock(&block(0), victim).unwrap();
    table.x_lock(&block(1), blocker).unwrap();

    // The victim parks behind an older transaction on another target
    let (_, parked) = request_in_background(&table, block(1), victim, LockMode::Shared);
    thread::sleep(Duration::from_millis(30));

    let start = Instant::now();
    let (granted, wounder) = request_in_background(&table, block(0), oldest, LockMode::Exclusive);
    let err = parked.join().unwrap().unwrap_err();
    assert!(matches!(err, StrataError::Wounded { .. }));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(!granted.load(Ordering::Acquire));

    table.release_all(victim, false);
    wounder.join().unwrap().unwrap();
    assert!(!table.is_doomed(blocker));
}
