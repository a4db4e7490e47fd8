mod field;
mod frame;
mod pool;
mod tx_buffers;
mod wait_queue;

pub use field::*;
pub use frame::Frame;
pub use pool::*;
pub use tx_buffers::*;
pub use wait_queue::*;
