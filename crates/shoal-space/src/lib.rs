//! Space engine
//!
//! Storage cleanup (orphaned work files, stray EC artifacts, orphan
//! chunks, misplaced replicas) and LRU eviction, both running as
//! per-mountpath joggers under one xaction. Cleanup goes first; LRU runs
//! only when capacity is still above the low watermark.

pub mod cleanup;
pub mod lru;
pub mod trigger;

pub use cleanup::{run_cleanup, CleanupArgs};
pub use lru::{run_lru, LruArgs};
pub use trigger::SpaceTrigger;
