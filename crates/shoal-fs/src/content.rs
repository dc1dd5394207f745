//! On-disk content types and their filename ("ubase") encoding
//!
//! The subtree directory already identifies the content type; the ubase
//! suffix carries per-type extras: work files embed pid+timestamp, chunks
//! embed `(upload-id, chunk-number)`, partial chunk manifests embed the
//! upload id.

use shoal_common::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Work files older than this are garbage regardless of anything else.
pub const OLD_WORK_AGE: Duration = Duration::from_secs(3600);

/// Length of upload ids as produced by `new_upload_id` (hex, no dashes).
pub const UPLOAD_ID_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentType {
    /// Object body
    Obj,
    /// Ephemeral work file
    Work,
    /// EC data/parity slice
    EcSlice,
    /// EC metafile
    EcMeta,
    /// Chunk body
    Chunk,
    /// Chunk manifest (completed or partial)
    ChunkMeta,
}

impl ContentType {
    pub const ALL: [ContentType; 6] = [
        ContentType::Obj,
        ContentType::Work,
        ContentType::EcSlice,
        ContentType::EcMeta,
        ContentType::Chunk,
        ContentType::ChunkMeta,
    ];

    /// Subtree directory name under the mountpath.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Obj => "obj",
            Self::Work => "work",
            Self::EcSlice => "ecs",
            Self::EcMeta => "ecm",
            Self::Chunk => "chk",
            Self::ChunkMeta => "chm",
        }
    }
}

impl FromStr for ContentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "obj" => Ok(Self::Obj),
            "work" => Ok(Self::Work),
            "ecs" => Ok(Self::EcSlice),
            "ecm" => Ok(Self::EcMeta),
            "chk" => Ok(Self::Chunk),
            "chm" => Ok(Self::ChunkMeta),
            _ => Err(Error::Fatal(format!("invalid content type {s:?}"))),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of parsing a ubase back into its parts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentInfo {
    pub ok: bool,
    /// Safe to garbage-collect.
    pub old: bool,
    pub base: String,
    pub extras: Vec<String>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl ContentType {
    /// Encode a ubase for this content type.
    ///
    /// Extras: `Work` takes none (pid+timestamp are implicit); `Chunk`
    /// takes `[upload-id, chunk-number]`; `ChunkMeta` takes `[]` for a
    /// completed manifest or `[upload-id]` for a partial one.
    #[must_use]
    pub fn make_ubase(&self, base: &str, extras: &[&str]) -> String {
        match self {
            Self::Obj | Self::EcSlice | Self::EcMeta => base.to_string(),
            Self::Work => {
                format!("{base}.{:x}.{:x}.wk", now_unix(), std::process::id())
            }
            Self::Chunk => {
                debug_assert_eq!(extras.len(), 2);
                format!("{base}.{}.{:0>6}.ck", extras[0], extras[1])
            }
            Self::ChunkMeta => match extras {
                [] => format!("{base}.mt"),
                [upload_id] => format!("{base}.{upload_id}.mt"),
                _ => unreachable!("chunk manifest takes at most one extra"),
            },
        }
    }

    /// Decode a ubase produced by [`Self::make_ubase`].
    #[must_use]
    pub fn parse_ubase(&self, ubase: &str) -> ContentInfo {
        match self {
            Self::Obj | Self::EcSlice | Self::EcMeta => ContentInfo {
                ok: true,
                old: false,
                base: ubase.to_string(),
                extras: Vec::new(),
            },
            Self::Work => parse_work(ubase),
            Self::Chunk => parse_chunk(ubase),
            Self::ChunkMeta => parse_chunk_meta(ubase),
        }
    }
}

fn parse_work(ubase: &str) -> ContentInfo {
    let Some(rest) = ubase.strip_suffix(".wk") else {
        return ContentInfo::default();
    };
    let mut it = rest.rsplitn(3, '.');
    let (Some(pid_s), Some(ts_s), Some(base)) = (it.next(), it.next(), it.next()) else {
        return ContentInfo::default();
    };
    let (Ok(pid), Ok(ts)) = (u32::from_str_radix(pid_s, 16), u64::from_str_radix(ts_s, 16))
    else {
        return ContentInfo::default();
    };
    let old = pid != std::process::id() || ts + OLD_WORK_AGE.as_secs() < now_unix();
    ContentInfo {
        ok: true,
        old,
        base: base.to_string(),
        extras: Vec::new(),
    }
}

fn parse_chunk(ubase: &str) -> ContentInfo {
    let Some(rest) = ubase.strip_suffix(".ck") else {
        return ContentInfo::default();
    };
    let mut it = rest.rsplitn(3, '.');
    let (Some(num), Some(upload_id), Some(base)) = (it.next(), it.next(), it.next()) else {
        return ContentInfo::default();
    };
    if upload_id.len() != UPLOAD_ID_LEN || num.parse::<u32>().is_err() {
        return ContentInfo::default();
    }
    let mut num = num.trim_start_matches('0');
    if num.is_empty() {
        num = "0";
    }
    ContentInfo {
        ok: true,
        old: false,
        base: base.to_string(),
        extras: vec![upload_id.to_string(), num.to_string()],
    }
}

fn parse_chunk_meta(ubase: &str) -> ContentInfo {
    let Some(rest) = ubase.strip_suffix(".mt") else {
        return ContentInfo::default();
    };
    // partial manifests carry a fixed-width hex upload id
    if let Some((base, tail)) = rest.rsplit_once('.') {
        if tail.len() == UPLOAD_ID_LEN && tail.bytes().all(|b| b.is_ascii_hexdigit()) {
            return ContentInfo {
                ok: true,
                old: false,
                base: base.to_string(),
                extras: vec![tail.to_string()],
            };
        }
    }
    ContentInfo {
        ok: true,
        old: false,
        base: rest.to_string(),
        extras: Vec::new(),
    }
}

/// Generate a fresh upload id.
#[must_use]
pub fn new_upload_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Quick check whether a directory-entry name looks like content rather
/// than layout (used when pruning empty directories).
#[must_use]
pub fn likely_ct(name: &str) -> bool {
    ContentType::ALL.iter().any(|ct| ct.as_str() == name)
}
