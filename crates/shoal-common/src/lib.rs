//! Common foundation for shoal: bucket and object types, checksums,
//! the error taxonomy, cluster configuration and control-message shapes.

pub mod bmd;
pub mod cksum;
pub mod config;
pub mod error;
pub mod msg;
pub mod template;
pub mod types;

// Re-exports
pub use bmd::Bmd;
pub use cksum::{Cksum, CksumHash, CksumType};
pub use config::Config;
pub use error::{Error, Result};
pub use types::{custom, Bck, BckProps, BpropsToSet, ObjAttrs, ObjVersion, Provider, WritePolicy};
