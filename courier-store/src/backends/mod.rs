//! Backend storage implementations
//!
//! - `memory`: In-memory storage for testing and development
//! - `test`: Memory storage with failure injection and synchronization helpers
//! - `file`: File-based storage for production use

pub mod file;
pub mod memory;

pub use file::{FileStateStore, FileStateStoreBuilder};
pub use memory::MemoryStateStore;
pub use test::TestStateStore;
