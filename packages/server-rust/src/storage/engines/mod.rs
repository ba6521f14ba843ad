//! Storage engine implementations.

pub mod memory;

pub use memory::{MemoryConnection, MemoryStore};
