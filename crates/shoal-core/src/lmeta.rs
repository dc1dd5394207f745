//! Persistent LOM metadata
//!
//! Lives in a `user.` extended attribute on the object file:
//! `[magic u16][version u8][xxh64-of-payload u64][payload]` with a
//! serde_json payload. Faults classify as metadata-missing (no xattr),
//! metadata-corrupted (bad magic/checksum/payload) or io-error.

use serde::{Deserialize, Serialize};
use shoal_common::{Error, ObjAttrs, Result};
use std::collections::BTreeSet;
use std::path::Path;
use xxhash_rust::xxh64::xxh64;

pub const XATTR_LMETA: &str = "user.shoal.lmeta";

const LMETA_MAGIC: u16 = 0x5348;
const LMETA_VERSION: u8 = 1;
const LMETA_HDR_LEN: usize = 2 + 1 + 8;

/// Object flag: body is chunked (a completed manifest pins the chunks).
pub const LOM_FLAG_CHUNKED: u32 = 1 << 0;

/// Everything the LOM persists about one object replica.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LomMd {
    pub attrs: ObjAttrs,
    #[serde(default)]
    pub mtime_ns: i64,
    /// Full mirror set (all replica FQNs, main included) when n-way > 1.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub copies: BTreeSet<String>,
    #[serde(default)]
    pub flags: u32,
    /// Completed-manifest id for chunked objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
}

impl LomMd {
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.flags & LOM_FLAG_CHUNKED != 0
    }
}

pub fn store_lmeta(fqn: &Path, md: &LomMd) -> Result<()> {
    let payload = serde_json::to_vec(md)
        .map_err(|e| Error::Fatal(format!("encode lmeta {}: {e}", fqn.display())))?;
    let mut buf = Vec::with_capacity(LMETA_HDR_LEN + payload.len());
    buf.extend_from_slice(&LMETA_MAGIC.to_be_bytes());
    buf.push(LMETA_VERSION);
    buf.extend_from_slice(&xxh64(&payload, 0).to_be_bytes());
    buf.extend_from_slice(&payload);
    xattr::set(fqn, XATTR_LMETA, &buf)
        .map_err(|e| Error::io(format!("set lmeta {}", fqn.display()), e))
}

pub fn load_lmeta(fqn: &Path) -> Result<LomMd> {
    let cname = fqn.display();
    let raw = xattr::get(fqn, XATTR_LMETA)
        .map_err(|e| Error::io(format!("get lmeta {cname}"), e))?
        .ok_or_else(|| Error::MetadataMissing(cname.to_string()))?;
    if raw.len() < LMETA_HDR_LEN {
        return Err(Error::MetadataCorrupted(cname.to_string()));
    }
    let magic = u16::from_be_bytes([raw[0], raw[1]]);
    let version = raw[2];
    if magic != LMETA_MAGIC || version != LMETA_VERSION {
        return Err(Error::MetadataCorrupted(cname.to_string()));
    }
    let stored = u64::from_be_bytes(raw[3..11].try_into().unwrap());
    let payload = &raw[LMETA_HDR_LEN..];
    if xxh64(payload, 0) != stored {
        return Err(Error::MetadataCorrupted(cname.to_string()));
    }
    serde_json::from_slice(payload).map_err(|_| Error::MetadataCorrupted(cname.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::{custom, Cksum, CksumType, ObjVersion};
    use tempfile::tempdir;

    fn sample_md() -> LomMd {
        let mut md = LomMd {
            attrs: ObjAttrs {
                size: 4096,
                atime_ns: 1_700_000_000_000_000_000,
                cksum: Cksum::compute(CksumType::XXHash, b"body"),
                version: Some(ObjVersion::Local(3)),
                ..Default::default()
            },
            mtime_ns: 1_700_000_000_000_000_001,
            ..Default::default()
        };
        md.attrs.set_custom(custom::SOURCE, "s3");
        md
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let fqn = dir.path().join("obj");
        std::fs::write(&fqn, b"body").unwrap();

        let md = sample_md();
        store_lmeta(&fqn, &md).unwrap();
        let loaded = load_lmeta(&fqn).unwrap();
        assert_eq!(loaded, md);
    }

    #[test]
    fn test_missing_vs_corrupted() {
        let dir = tempdir().unwrap();
        let fqn = dir.path().join("obj");
        std::fs::write(&fqn, b"body").unwrap();

        assert!(matches!(
            load_lmeta(&fqn),
            Err(Error::MetadataMissing(_))
        ));

        xattr::set(&fqn, XATTR_LMETA, b"garbage-bytes").unwrap();
        assert!(matches!(
            load_lmeta(&fqn),
            Err(Error::MetadataCorrupted(_))
        ));
    }

    #[test]
    fn test_flipped_payload_bit_detected() {
        let dir = tempdir().unwrap();
        let fqn = dir.path().join("obj");
        std::fs::write(&fqn, b"body").unwrap();
        store_lmeta(&fqn, &sample_md()).unwrap();

        let mut raw = xattr::get(&fqn, XATTR_LMETA).unwrap().unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x40;
        xattr::set(&fqn, XATTR_LMETA, &raw).unwrap();
        assert!(matches!(
            load_lmeta(&fqn),
            Err(Error::MetadataCorrupted(_))
        ));
    }
}
