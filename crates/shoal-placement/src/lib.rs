//! Consistent-hash (highest-random-weight) placement
//!
//! Maps `(bucket, object)` unames to their owning target and, within a
//! target, to their home mountpath. Stable under membership churn: adding
//! or removing one of N nodes remaps ~1/N of the keys.

pub mod hrw;
pub mod smap;

pub use hrw::{hrw_digest, hrw_select};
pub use smap::{Smap, TargetInfo};
