//! Filesystem layer: mountpath registry, typed on-disk layout, walking,
//! capacity tracking and disk-utilization throttling.
//!
//! Every file under a mountpath lives in a content-type subtree:
//! `<mpath>/<ct>/<provider>/@<ns>/<bucket>/<object-path>`, with the last
//! path segment ("ubase") carrying type-specific suffix encoding where
//! needed (work files, chunks, chunk manifests).

pub mod capacity;
pub mod content;
pub mod fqn;
pub mod mountpath;
pub mod throttle;
pub mod walk;

pub use capacity::{cap_refresh, CapStatus, Capacity};
pub use content::{ContentInfo, ContentType};
pub use fqn::ParsedFqn;
pub use mountpath::{Mountpath, MountpathRegistry};
pub use throttle::DiskUtilProbe;
pub use walk::{walk_bck, WalkEntry};
