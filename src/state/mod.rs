//! State management.
//!
//! This module provides persistent per-stack state: the last known state of
//! every resource, exported outputs and run history, plus the lock that
//! serializes runs against the same stack.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    HistoryOperation, ResourceState, ResourceStatus, RunHistoryEntry, STATE_VERSION, StackState,
};
