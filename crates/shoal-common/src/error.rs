//! Error taxonomy shared by every shoal crate
//!
//! Backend drivers normalize provider-native failures into these kinds;
//! higher layers wrap operation context (bucket/object/fqn) as the error
//! propagates. Transient kinds (rate-limited, unavailable) feed adaptive
//! backoff; everything unclassified surfaces as `Fatal`.

use crate::types::Bck;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bucket {0} does not exist")]
    BckNotFound(Bck),

    #[error("object {0} does not exist")]
    ObjNotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("requested range is not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("{0}: object metadata missing")]
    MetadataMissing(String),

    #[error("{0}: object metadata corrupted")]
    MetadataCorrupted(String),

    #[error("{0}")]
    BadDataCksum(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("cluster membership changes: {0}")]
    MembershipChanges(String),

    #[error("xaction already running: {0}")]
    XactUsePrev(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("no mountpaths available")]
    NoMountpaths,

    #[error("{ctx}: {source}")]
    Io {
        ctx: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Fatal(String),
}

impl Error {
    pub fn io(ctx: impl Into<String>, source: std::io::Error) -> Self {
        if source.raw_os_error() == Some(libc_enospc()) {
            return Self::OutOfSpace(ctx.into());
        }
        Self::Io {
            ctx: ctx.into(),
            source,
        }
    }

    /// Checksum mismatch on a validating read.
    pub fn bad_cksum(cname: &str, expected: &str, computed: &str) -> Self {
        Self::BadDataCksum(format!(
            "{cname}: bad data checksum: expected {expected}, computed {computed}"
        ))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BckNotFound(_) | Self::ObjNotFound(_))
    }

    /// Transient failures are retried locally with bounded backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Unavailable(_))
    }

    /// Both metadata fault kinds authorize removal of the main replica
    /// on the cleanup path.
    #[must_use]
    pub fn is_lmeta_fault(&self) -> bool {
        matches!(self, Self::MetadataMissing(_) | Self::MetadataCorrupted(_))
    }

    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BckNotFound(_) | Self::ObjNotFound(_) | Self::MetadataMissing(_) => 404,
            Self::AlreadyExists(_) | Self::XactUsePrev(_) => 409,
            Self::RangeNotSatisfiable(_) => 416,
            Self::RateLimited(_) => 429,
            Self::Unavailable(_) => 503,
            Self::AuthFailed(_) => 401,
            Self::OutOfSpace(_) => 507,
            Self::Aborted(_) => 410,
            _ => 500,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::io("io", e)
    }
}

const fn libc_enospc() -> i32 {
    // ENOSPC is 28 on every unix shoal targets
    28
}
