//! Core type definitions for shoal
//!
//! Buckets, object attributes, bucket properties and the present?-per-field
//! property overlay used by set-props.

use crate::cksum::{Cksum, CksumType};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Well-known custom metadata keys carried by remote-backed objects.
pub mod custom {
    pub const SOURCE: &str = "source";
    pub const ETAG: &str = "etag";
    pub const MD5: &str = "md5";
    pub const CRC32C: &str = "crc32c";
    pub const LAST_MODIFIED: &str = "last-modified";
    pub const CONTENT_TYPE: &str = "content-type";
}

/// Storage backend provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Native (cluster-owned) bucket
    Ais,
    /// Amazon S3 and S3-compatible endpoints
    S3,
    /// Google Cloud Storage
    Gs,
    /// Azure Blob Storage
    Az,
    /// Oracle Cloud Infrastructure Object Storage
    Oci,
    /// Plain HTTP(S), read-only
    Ht,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::Ais,
        Provider::S3,
        Provider::Gs,
        Provider::Az,
        Provider::Oci,
        Provider::Ht,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ais => "ais",
            Self::S3 => "s3",
            Self::Gs => "gs",
            Self::Az => "az",
            Self::Oci => "oci",
            Self::Ht => "ht",
        }
    }

    /// All providers except `ais` are remote.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        !matches!(self, Self::Ais)
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ais" => Ok(Self::Ais),
            "s3" | "aws" => Ok(Self::S3),
            "gs" | "gcp" => Ok(Self::Gs),
            "az" | "azure" => Ok(Self::Az),
            "oci" => Ok(Self::Oci),
            "ht" => Ok(Self::Ht),
            _ => Err(Error::Fatal(format!("invalid backend provider {s:?}"))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket: `{provider, namespace, name}`
///
/// The namespace is empty for the global namespace. The uname
/// `provider/@ns/name/objname` is the cluster-wide placement key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bck {
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ns: String,
    pub name: String,
}

impl Default for Bck {
    fn default() -> Self {
        Self::ais("")
    }
}

impl Bck {
    pub fn new(provider: Provider, name: impl Into<String>) -> Self {
        Self {
            provider,
            ns: String::new(),
            name: name.into(),
        }
    }

    pub fn ais(name: impl Into<String>) -> Self {
        Self::new(Provider::Ais, name)
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.provider.is_remote()
    }

    #[must_use]
    pub fn is_ais(&self) -> bool {
        self.provider == Provider::Ais
    }

    /// Unified name: the placement key of one object in this bucket.
    #[must_use]
    pub fn make_uname(&self, obj_name: &str) -> String {
        let mut s = String::with_capacity(
            self.provider.as_str().len() + self.ns.len() + self.name.len() + obj_name.len() + 4,
        );
        s.push_str(self.provider.as_str());
        s.push('/');
        s.push('@');
        s.push_str(&self.ns);
        s.push('/');
        s.push_str(&self.name);
        s.push('/');
        s.push_str(obj_name);
        s
    }

    /// Human-readable `provider://[@ns/]bucket/object`.
    #[must_use]
    pub fn cname(&self, obj_name: &str) -> String {
        if obj_name.is_empty() {
            return self.to_string();
        }
        format!("{self}/{obj_name}")
    }

    /// Validate the bucket name (S3-compatible naming rules).
    pub fn validate_name(name: &str) -> Result<()> {
        let err = |why: &str| Err(Error::Fatal(format!("invalid bucket name {name:?}: {why}")));
        if name.len() < 3 {
            return err("must be at least 3 characters");
        }
        if name.len() > 63 {
            return err("must be at most 63 characters");
        }
        let first = name.chars().next().unwrap();
        let last = name.chars().last().unwrap();
        if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
            return err("must start with a lowercase letter or number");
        }
        if !last.is_ascii_lowercase() && !last.is_ascii_digit() {
            return err("must end with a lowercase letter or number");
        }
        for c in name.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '.' {
                return err("contains an invalid character");
            }
        }
        if name.contains("..") {
            return err("cannot contain consecutive periods");
        }
        if name.parse::<std::net::Ipv4Addr>().is_ok() {
            return err("cannot be formatted as an IP address");
        }
        Ok(())
    }
}

impl fmt::Display for Bck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ns.is_empty() {
            write!(f, "{}://{}", self.provider, self.name)
        } else {
            write!(f, "{}://@{}/{}", self.provider, self.ns, self.name)
        }
    }
}

impl fmt::Debug for Bck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bck({self})")
    }
}

/// Object version: a local monotonic counter for ais buckets, the remote
/// ETag or VersionID otherwise. The two kinds never mix silently.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjVersion {
    Local(u64),
    Remote(String),
}

impl ObjVersion {
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl fmt::Display for ObjVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(v) => write!(f, "{v}"),
            Self::Remote(v) => f.write_str(v),
        }
    }
}

/// Logical object attributes, as loaded from (or about to be persisted to)
/// the object's local metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjAttrs {
    pub size: u64,
    #[serde(default)]
    pub atime_ns: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cksum: Option<Cksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<ObjVersion>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

impl ObjAttrs {
    pub fn set_custom(&mut self, key: &str, value: impl Into<String>) {
        self.custom.insert(key.to_string(), value.into());
    }

    #[must_use]
    pub fn get_custom(&self, key: &str) -> Option<&str> {
        self.custom.get(key).map(String::as_str)
    }

    /// Version-changed detection: compare remote-identifying attributes
    /// in decreasing order of authority (version, ETag, MD5, size).
    pub fn check_eq(&self, remote: &ObjAttrs) -> Result<()> {
        let ne = |what: &str, a: &dyn fmt::Display, b: &dyn fmt::Display| {
            Err(Error::Fatal(format!("{what} differs: {a} vs {b}")))
        };
        match (&self.version, &remote.version) {
            (Some(a), Some(b)) => {
                if a != b {
                    return ne("version", a, b);
                }
                return Ok(());
            }
            (_, _) => {}
        }
        for key in [custom::ETAG, custom::MD5] {
            if let (Some(a), Some(b)) = (self.get_custom(key), remote.get_custom(key)) {
                if a.trim_matches('"') != b.trim_matches('"') {
                    return ne(key, &a, &b);
                }
                return Ok(());
            }
        }
        if remote.size != 0 && self.size != remote.size {
            return ne("size", &self.size, &remote.size);
        }
        Ok(())
    }
}

/// Persistence timing for object data and metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    #[default]
    Immediate,
    Delayed,
    Never,
}

/// Bucket access permission bits.
pub mod access {
    pub const GET: u64 = 1 << 0;
    pub const HEAD: u64 = 1 << 1;
    pub const PUT: u64 = 1 << 2;
    pub const DELETE: u64 = 1 << 3;
    pub const LIST: u64 = 1 << 4;
    pub const PATCH: u64 = 1 << 5;
    pub const DESTROY: u64 = 1 << 6;
    pub const ALL: u64 = GET | HEAD | PUT | DELETE | LIST | PATCH | DESTROY;
    pub const RO: u64 = GET | HEAD | LIST;
}

/// Checksum section of bucket properties
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CksumConf {
    #[serde(rename = "type")]
    pub ty: CksumType,
    pub validate_cold_get: bool,
    pub validate_warm_get: bool,
}

impl Default for CksumConf {
    fn default() -> Self {
        Self {
            ty: CksumType::XXHash,
            validate_cold_get: true,
            validate_warm_get: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersioningConf {
    pub enabled: bool,
    /// When true, warm GET double-checks the remote version.
    pub validate_warm_get: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConf {
    pub enabled: bool,
    pub copies: u32,
}

impl Default for MirrorConf {
    fn default() -> Self {
        Self {
            enabled: false,
            copies: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcConf {
    pub enabled: bool,
    pub data_slices: u32,
    pub parity_slices: u32,
    /// Objects smaller than this are replicated rather than sliced.
    pub obj_size_limit: u64,
}

impl Default for EcConf {
    fn default() -> Self {
        Self {
            enabled: false,
            data_slices: 2,
            parity_slices: 2,
            obj_size_limit: 256 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConf {
    pub enabled: bool,
    pub chunk_size: u64,
}

impl Default for ChunkConf {
    fn default() -> Self {
        Self {
            enabled: false,
            chunk_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LruBckConf {
    pub enabled: bool,
}

impl Default for LruBckConf {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePolicyConf {
    pub data: WritePolicy,
    pub md: WritePolicy,
}

/// Token-bucket rate limit; `per_sec == 0` disables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConf {
    pub enabled: bool,
    pub burst: u32,
    pub per_sec: u32,
}

/// Bucket properties (persisted via BMD, inherited from cluster defaults)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BckProps {
    #[serde(default)]
    pub cksum: CksumConf,
    #[serde(default)]
    pub versioning: VersioningConf,
    #[serde(default)]
    pub mirror: MirrorConf,
    #[serde(default)]
    pub ec: EcConf,
    #[serde(default)]
    pub chunk: ChunkConf,
    #[serde(default)]
    pub lru: LruBckConf,
    #[serde(default)]
    pub write_policy: WritePolicyConf,
    #[serde(default)]
    pub rate_limit: RateLimitConf,
    #[serde(default = "default_access")]
    pub access: u64,
    #[serde(default)]
    pub features: u64,
    /// An ais bucket fronted by a remote one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_bck: Option<Bck>,
}

fn default_access() -> u64 {
    access::ALL
}

impl BckProps {
    #[must_use]
    pub fn with_access(access: u64) -> Self {
        Self {
            access,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn allows(&self, bit: u64) -> bool {
        self.access & bit == bit
    }
}

/// "null means keep": explicit present?-per-field overlay applied by
/// set-props on top of existing bucket properties.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BpropsToSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cksum: Option<CksumConfToSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versioning: Option<VersioningConfToSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<MirrorConfToSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ec: Option<EcConfToSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lru_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_policy: Option<WritePolicyConfToSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CksumConfToSet {
    #[serde(rename = "type")]
    pub ty: Option<CksumType>,
    pub validate_cold_get: Option<bool>,
    pub validate_warm_get: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersioningConfToSet {
    pub enabled: Option<bool>,
    pub validate_warm_get: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfToSet {
    pub enabled: Option<bool>,
    pub copies: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcConfToSet {
    pub enabled: Option<bool>,
    pub data_slices: Option<u32>,
    pub parity_slices: Option<u32>,
    pub obj_size_limit: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePolicyConfToSet {
    pub data: Option<WritePolicy>,
    pub md: Option<WritePolicy>,
}

macro_rules! set_if {
    ($dst:expr, $src:expr) => {
        if let Some(v) = $src {
            $dst = v;
        }
    };
}

impl BckProps {
    /// Apply a present?-per-field overlay.
    pub fn apply(&mut self, t: &BpropsToSet) {
        if let Some(c) = &t.cksum {
            set_if!(self.cksum.ty, c.ty);
            set_if!(self.cksum.validate_cold_get, c.validate_cold_get);
            set_if!(self.cksum.validate_warm_get, c.validate_warm_get);
        }
        if let Some(v) = &t.versioning {
            set_if!(self.versioning.enabled, v.enabled);
            set_if!(self.versioning.validate_warm_get, v.validate_warm_get);
        }
        if let Some(m) = &t.mirror {
            set_if!(self.mirror.enabled, m.enabled);
            set_if!(self.mirror.copies, m.copies);
        }
        if let Some(e) = &t.ec {
            set_if!(self.ec.enabled, e.enabled);
            set_if!(self.ec.data_slices, e.data_slices);
            set_if!(self.ec.parity_slices, e.parity_slices);
            set_if!(self.ec.obj_size_limit, e.obj_size_limit);
        }
        set_if!(self.lru.enabled, t.lru_enabled);
        if let Some(w) = &t.write_policy {
            set_if!(self.write_policy.data, w.data);
            set_if!(self.write_policy.md, w.md);
        }
        set_if!(self.access, t.access);
        set_if!(self.features, t.features);
    }
}
