//! Target-core: LOM lifecycle, name locking, typed content files and the
//! workfile→rename write protocol.
//!
//! The LOM cache is not authoritative — disk is. Every mutation happens
//! under the striped name-locker, and every write lands in a work file
//! that is atomically renamed into its final FQN (or removed).

pub mod ct;
pub mod lmeta;
pub mod locker;
pub mod lom;
pub mod manifest;
pub mod pool;
pub mod save;
pub mod tcore;

pub use ct::Ct;
pub use lmeta::LomMd;
pub use locker::NameLocker;
pub use lom::{alloc_lom, free_lom, Lom};
pub use manifest::ChunkManifest;
pub use tcore::Tcore;
