//! Task providers hosted by the runtime.

pub mod kv;

pub use kv::{KvProvider, KvStore};
