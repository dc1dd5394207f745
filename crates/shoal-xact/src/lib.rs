//! Extended actions (xactions)
//!
//! Every long-running job — rebalance, resilver, copy, prefetch, cleanup,
//! LRU, archive — shares one lifecycle: `pending → running ⇄ idle →
//! finished | aborted`, with progress counters, a bounded error log, an
//! abort channel and terminal notifications. The registry enforces a
//! single renewable instance per `(kind, bucket)` or `(kind, uuid)`.

pub mod base;
pub mod registry;

pub use base::{Snap, XactBase, XactState};
pub use registry::{RenewRes, XactRegistry};

/// Xaction kinds.
pub mod kind {
    pub const REBALANCE: &str = "rebalance";
    pub const RESILVER: &str = "resilver";
    pub const CLEANUP: &str = "cleanup-store";
    pub const LRU: &str = "lru";
    pub const TCB: &str = "copy-bck";
    pub const TCO: &str = "copy-listrange";
    pub const PREFETCH: &str = "prefetch-listrange";
    pub const ARCHIVE: &str = "archive";
    pub const DELETE: &str = "delete-listrange";
    pub const EVICT: &str = "evict-listrange";
    pub const LIST: &str = "list";
    pub const MV_BCK: &str = "mv-bck";

    /// Preemptible kinds: renewing aborts the running predecessor.
    #[must_use]
    pub fn is_preemptible(kind: &str) -> bool {
        kind == RESILVER
    }
}
