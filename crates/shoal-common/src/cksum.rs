//! Object checksums
//!
//! One configured algorithm per bucket; streaming computation on the write
//! path and on validating reads.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use xxhash_rust::xxh64::Xxh64;

/// Checksum algorithm, configured per bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CksumType {
    None,
    #[default]
    XXHash,
    Crc32c,
    Md5,
    Sha256,
}

impl CksumType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::XXHash => "xxhash",
            Self::Crc32c => "crc32c",
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for CksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A computed checksum: algorithm plus lowercase-hex value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cksum {
    #[serde(rename = "type")]
    pub ty: CksumType,
    pub value: String,
}

impl Cksum {
    #[must_use]
    pub fn new(ty: CksumType, value: impl Into<String>) -> Self {
        Self {
            ty,
            value: value.into(),
        }
    }

    /// One-shot computation; `None` for [`CksumType::None`].
    #[must_use]
    pub fn compute(ty: CksumType, data: &[u8]) -> Option<Self> {
        let mut h = CksumHash::new(ty);
        h.update(data);
        h.finalize()
    }
}

impl fmt::Display for Cksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.ty, self.value)
    }
}

impl fmt::Debug for Cksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cksum({self})")
    }
}

/// Streaming checksum calculator for the configured algorithm.
pub enum CksumHash {
    None,
    XXHash(Xxh64),
    Crc32c(u32),
    Md5(Box<Md5>),
    Sha256(Box<Sha256>),
}

impl CksumHash {
    #[must_use]
    pub fn new(ty: CksumType) -> Self {
        match ty {
            CksumType::None => Self::None,
            CksumType::XXHash => Self::XXHash(Xxh64::new(0)),
            CksumType::Crc32c => Self::Crc32c(0),
            CksumType::Md5 => Self::Md5(Box::new(Md5::new())),
            CksumType::Sha256 => Self::Sha256(Box::new(Sha256::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::None => {}
            Self::XXHash(h) => h.update(data),
            Self::Crc32c(c) => *c = crc32c::crc32c_append(*c, data),
            Self::Md5(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    #[must_use]
    pub fn finalize(self) -> Option<Cksum> {
        match self {
            Self::None => None,
            Self::XXHash(h) => Some(Cksum::new(
                CksumType::XXHash,
                hex_encode(&h.digest().to_be_bytes()),
            )),
            Self::Crc32c(c) => Some(Cksum::new(CksumType::Crc32c, hex_encode(&c.to_be_bytes()))),
            Self::Md5(h) => Some(Cksum::new(CksumType::Md5, hex_encode(&h.finalize()))),
            Self::Sha256(h) => Some(Cksum::new(CksumType::Sha256, hex_encode(&h.finalize()))),
        }
    }
}

/// Hex encode bytes (lowercase)
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut result = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        result.push(HEX_CHARS[(byte >> 4) as usize] as char);
        result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    result
}

/// Compute MD5 (remote ETag compatibility)
#[must_use]
pub fn compute_md5(data: &[u8]) -> [u8; 16] {
    let mut h = Md5::new();
    h.update(data);
    h.finalize().into()
}
