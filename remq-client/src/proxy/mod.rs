//! Distributed data structure proxies.

mod blocking_queue;
mod script;
pub mod scripts;

pub use blocking_queue::{hash_tag, BlockingQueue, QueueOperation};
pub use script::{Script, ScriptService};
