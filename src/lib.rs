//! Strata - a concurrent page cache and multi-granularity lock manager
//!
//! This crate provides the core of a relational storage engine: a fixed-size
//! buffer pool that many transaction threads share safely, and a lock table
//! that orders their access to files, blocks and records.
//!
//! # Architecture
//!
//! The system is organized into several layers:
//!
//! - **Storage** (`storage`): Block I/O and the services the core consumes
//!   - `FileManager`: Reads, writes and appends fixed-size blocks
//!   - `WriteAheadLog`: Log service contract, with an in-memory `MemoryLog`
//!   - `PageFormatter`: Formats freshly appended blocks
//!
//! - **Buffer Pool** (`buffer`): Memory management for disk blocks
//!   - `Frame`: One cached block with its pin count, dirty flag and LSN
//!   - `BufferPool`: Maps blocks onto frames with second-chance eviction
//!   - `PinCoordinator`: FIFO queue for transactions waiting on a full pool
//!   - `TxBuffers`: Per-transaction pins with the starvation breaker
//!
//! - **Concurrency** (`concurrency`): Locking
//!   - `LockTable`: IS/IX/S/SIX/X locks with wound-wait and bounded waits
//!   - `ConcurrencyStrategy`: Read-committed and repeatable-read intents
//!
//! - **Transactions** (`tx`, `engine`): Wiring and lifecycle
//!
//! # Example
//!
//! ```rust,no_run
//! use strata::buffer::FieldValue;
//! use strata::common::{EngineConfig, RecordId, SlotId};
//! use strata::concurrency::IsolationLevel;
//! use strata::storage::page::ZeroFormatter;
//! use strata::Engine;
//!
//! let engine = Engine::open("demo_db", EngineConfig::default()).unwrap();
//!
//! let mut tx = engine.begin(IsolationLevel::RepeatableRead);
//! let block = tx.append("users.tbl", &ZeroFormatter).unwrap();
//! let rid = RecordId::new(block, SlotId::new(0));
//! tx.write(&rid, 0, FieldValue::Int(42)).unwrap();
//! tx.commit().unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod engine;
pub mod storage;
pub mod tx;

pub use common::{BlockId, EngineConfig, LockTarget, RecordId, Result, SlotId, StrataError, TxId};
pub use engine::Engine;
pub use tx::Transaction;
