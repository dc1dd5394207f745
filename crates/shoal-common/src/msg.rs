//! Control-message shapes consumed by the target
//!
//! Multi-object selection (`ListRange`), prefetch/archive/copy messages and
//! the list-objects (LSO) request/response types.

use crate::cksum::Cksum;
use crate::error::{Error, Result};
use crate::template::ObjTemplate;
use serde::{Deserialize, Serialize};

/// List of object names _or_ a brace-expansion template.
/// Empty means "the entire bucket".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRange {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objnames: Vec<String>,
}

impl ListRange {
    #[must_use]
    pub fn is_list(&self) -> bool {
        !self.objnames.is_empty()
    }

    #[must_use]
    pub fn has_template(&self) -> bool {
        !self.template.is_empty()
    }

    #[must_use]
    pub fn is_entire_bucket(&self) -> bool {
        !self.is_list() && !self.has_template()
    }

    /// Expand into concrete object names; errors on an empty selection.
    pub fn names(&self) -> Result<Vec<String>> {
        if self.is_list() {
            return Ok(self.objnames.clone());
        }
        if self.has_template() {
            return Ok(ObjTemplate::parse(&self.template)?.iter().collect());
        }
        Err(Error::Fatal("empty list-range: expected names or template".into()))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PrefetchMsg {
    #[serde(flatten)]
    pub list_range: ListRange,
    /// Above this size the blob (chunked) download path is used.
    #[serde(default)]
    pub blob_threshold: u64,
    /// 0 = one worker per mountpath; -1 = serial.
    #[serde(default)]
    pub num_workers: i32,
    #[serde(default, rename = "coer")]
    pub continue_on_error: bool,
    /// Check with the remote whether the object was deleted or its
    /// version changed before using the cached copy.
    #[serde(default)]
    pub latest_ver: bool,
}

/// Archive multiple objects as one TAR/TGZ/ZIP/TAR.LZ4 shard.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ArchiveMsg {
    pub archname: String,
    #[serde(default)]
    pub mime: String,
    #[serde(flatten)]
    pub list_range: ListRange,
    /// Archive under base names only.
    #[serde(default, rename = "bnonly")]
    pub base_name_only: bool,
    /// Prefix archived names with the source bucket name.
    #[serde(default, rename = "isbn")]
    pub incl_src_bname: bool,
    #[serde(default, rename = "aate")]
    pub append_if_exists: bool,
    #[serde(default, rename = "coer")]
    pub continue_on_error: bool,
}

/// Copy/transform bucket (TCB) options, shared with TCO.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TcbMsg {
    /// ETL pipeline: empty = plain copy, one entry = single transform.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etl: Vec<String>,
    #[serde(default)]
    pub prefix: String,
    /// Destination name prefix.
    #[serde(default)]
    pub prepend: String,
    #[serde(default)]
    pub dry_run: bool,
    /// HEAD the remote source first and re-fetch when the version changed.
    #[serde(default)]
    pub latest_ver: bool,
    /// Propagate source deletions to the destination (implies all objects).
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub num_workers: i32,
    #[serde(default, rename = "coer")]
    pub continue_on_error: bool,
}

/// Multi-object copy/transform (TCO).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TcoMsg {
    #[serde(flatten)]
    pub tcb: TcbMsg,
    #[serde(flatten)]
    pub list_range: ListRange,
}

/// LSO request flags
pub mod lso_flags {
    /// In-cluster objects only.
    pub const CACHED: u64 = 1 << 0;
    /// Return names only (fastest).
    pub const NAME_ONLY: u64 = 1 << 1;
    pub const NAME_SIZE: u64 = 1 << 2;
    /// Compare remote versions against cached copies.
    pub const DIFF: u64 = 1 << 3;
    /// Buckets present in the cluster only.
    pub const BCK_PRESENT: u64 = 1 << 4;
    /// S3-compatible listing (multipart ETag synthesis).
    pub const IS_S3: u64 = 1 << 5;
    /// Include misplaced and copies.
    pub const ALL: u64 = 1 << 6;
}

/// LSO requested-property bits
pub mod lso_props {
    pub const SIZE: u32 = 1 << 0;
    pub const CHECKSUM: u32 = 1 << 1;
    pub const ATIME: u32 = 1 << 2;
    pub const VERSION: u32 = 1 << 3;
    pub const CUSTOM: u32 = 1 << 4;
    pub const STATUS: u32 = 1 << 5;
    pub const COPIES: u32 = 1 << 6;
    pub const DEFAULT: u32 = SIZE | CHECKSUM | ATIME | VERSION;
}

pub const LSO_PAGE_SIZE_DFLT: usize = 1000;

/// List-objects request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LsoMsg {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub continuation_token: String,
    #[serde(default)]
    pub page_size: usize,
    #[serde(default = "default_props")]
    pub props: u32,
    #[serde(default)]
    pub flags: u64,
    /// Strftime-style format for atime rendering; empty = RFC 3339.
    #[serde(default)]
    pub time_format: String,
}

fn default_props() -> u32 {
    lso_props::DEFAULT
}

impl Default for LsoMsg {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            continuation_token: String::new(),
            page_size: 0,
            props: lso_props::DEFAULT,
            flags: 0,
            time_format: String::new(),
        }
    }
}

impl LsoMsg {
    #[must_use]
    pub fn wants(&self, prop: u32) -> bool {
        self.props & prop != 0
    }

    #[must_use]
    pub fn is(&self, flag: u64) -> bool {
        self.flags & flag != 0
    }

    #[must_use]
    pub fn effective_page_size(&self) -> usize {
        if self.page_size == 0 || self.page_size > LSO_PAGE_SIZE_DFLT {
            LSO_PAGE_SIZE_DFLT
        } else {
            self.page_size
        }
    }
}

/// LSO entry status/flag bits
pub mod entry_flags {
    pub const IS_CACHED: u16 = 1 << 0;
    pub const IS_MISPLACED: u16 = 1 << 1;
    pub const IS_COPY: u16 = 1 << 2;
    /// Remote version differs from the cached one (`DIFF` listings).
    pub const VERSION_CHANGED: u16 = 1 << 3;
    /// Deleted remotely but still cached (`DIFF` listings).
    pub const DELETED: u16 = 1 << 4;
}

/// One list-objects result entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsoEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Cksum>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub atime: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom: String,
    #[serde(default)]
    pub flags: u16,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub copies: u16,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

impl LsoEntry {
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.flags & entry_flags::IS_CACHED != 0
    }
}

/// List-objects result page; entries append across backend calls.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LsoResult {
    pub uuid: String,
    pub continuation_token: String,
    pub entries: Vec<LsoEntry>,
}
