mod lock_mode;
mod lock_table;
mod notifier;
mod strategy;

pub use lock_mode::*;
pub use lock_table::*;
pub use notifier::*;
pub use strategy::*;
