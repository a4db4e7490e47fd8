use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strata::buffer::FieldValue;
use strata::common::{EngineConfig, RecordId, SlotId};
use strata::concurrency::IsolationLevel;
use strata::storage::page::ZeroFormatter;
use strata::Engine;

fn main() {
    println!("Strata - a concurrent page cache and lock manager in Rust");
    println!("==========================================================\n");

    let db_dir = "strata_demo";
    let config = EngineConfig::default()
        .with_pool_size(8)
        .with_max_wait(Duration::from_secs(2));

    let engine = Arc::new(Engine::open(db_dir, config).expect("Failed to open engine"));
    println!(
        "Opened engine in {} with {} frames\n",
        db_dir,
        engine.pool().pool_size()
    );

    // Create a block holding one counter
    let rid = {
        let mut tx = engine.begin(IsolationLevel::RepeatableRead);
        let block = tx
            .append("counters.tbl", &ZeroFormatter)
            .expect("Failed to append block");
        let rid = RecordId::new(block, SlotId::new(0));
        tx.write(&rid, 0, FieldValue::Int(0))
            .expect("Failed to initialize counter");
        tx.commit().expect("Failed to commit");
        println!("Created counter at {}", rid);
        rid
    };

    // Four threads increment the counter, retrying whenever they are aborted
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let engine = Arc::clone(&engine);
            let rid = rid.clone();
            thread::spawn(move || {
                let mut aborts = 0;
                for _ in 0..25 {
                    loop {
                        let mut tx = engine.begin(IsolationLevel::RepeatableRead);
                        let attempt = tx.pin(&rid.block).and_then(|_| {
                            let value = tx.get_i32(&rid, 0)?;
                            tx.write(&rid, 0, FieldValue::Int(value + 1))?;
                            tx.commit()
                        });
                        match attempt {
                            Ok(()) => break,
                            Err(e) if e.is_abort() => {
                                aborts += 1;
                                tx.rollback().ok();
                            }
                            Err(e) => panic!("worker {} failed: {}", worker, e),
                        }
                    }
                }
                aborts
            })
        })
        .collect();

    for (worker, handle) in handles.into_iter().enumerate() {
        let aborts = handle.join().expect("Worker panicked");
        println!("Worker {} finished after {} aborted attempts", worker, aborts);
    }

    let mut tx = engine.begin(IsolationLevel::ReadCommitted);
    tx.pin(&rid.block).expect("Failed to pin block");
    let total = tx.get_i32(&rid, 0).expect("Failed to read counter");
    tx.commit().expect("Failed to commit");

    println!("\nFinal counter value: {}", total);
    println!("Frames available: {}", engine.pool().available());

    drop(engine);
    std::fs::remove_dir_all(db_dir).ok();
    println!("\nDemo completed successfully!");
}
