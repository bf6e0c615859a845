//! State management module for the converge engine.
//!
//! This module provides persistent storage of the last-applied state of each
//! resource, plus the state lock and run history.

mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo};
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{
    DeposedObject, RunHistoryEntry, RunOperation, StateRecord, StateSnapshot, MAX_HISTORY,
};
