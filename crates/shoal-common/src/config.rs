//! Cluster/node configuration
//!
//! Plain serde sections with per-section defaults; loaded from a JSON file
//! by the target binary, overridable per bucket where noted.

use crate::error::{Error, Result};
use crate::types::BckProps;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub space: SpaceConf,
    #[serde(default)]
    pub lru: LruConf,
    #[serde(default)]
    pub disk: DiskConf,
    #[serde(default)]
    pub transport: TransportConf,
    #[serde(default)]
    pub timeout: TimeoutConf,
    #[serde(default)]
    pub net: NetConf,
    #[serde(default)]
    pub log: LogConf,
    #[serde(default)]
    pub backend: BackendConf,
    /// Cluster-level bucket property defaults, inherited on create.
    #[serde(default)]
    pub bprops: BckProps,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| Error::io(format!("read config {}", path.display()), e))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::Fatal(format!("parse config {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        self.space.validate()?;
        if self.transport.burst == 0 {
            return Err(Error::Fatal("transport.burst must be positive".into()));
        }
        Ok(())
    }
}

/// Capacity watermarks and cleanup knobs.
///
/// Invariant: `cleanup_wm < low_wm < high_wm < oos`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpaceConf {
    pub cleanup_wm: u32,
    pub low_wm: u32,
    pub high_wm: u32,
    pub oos: u32,
    /// Files younger than this are never touched by cleanup (seconds).
    pub dont_cleanup_time: u64,
    /// Batch size for leftover removal; clamped to `BATCH_SIZE_MIN`.
    pub batch_size: usize,
}

pub const BATCH_SIZE_MIN: usize = 16;

impl Default for SpaceConf {
    fn default() -> Self {
        Self {
            cleanup_wm: 65,
            low_wm: 75,
            high_wm: 90,
            oos: 95,
            dont_cleanup_time: 2 * 3600,
            batch_size: 128,
        }
    }
}

impl SpaceConf {
    pub fn validate(&self) -> Result<()> {
        if !(self.cleanup_wm < self.low_wm && self.low_wm < self.high_wm && self.high_wm < self.oos)
        {
            return Err(Error::Fatal(format!(
                "invalid space watermarks: must be cleanup {} < low {} < high {} < oos {}",
                self.cleanup_wm, self.low_wm, self.high_wm, self.oos
            )));
        }
        if self.oos > 100 {
            return Err(Error::Fatal("space.oos cannot exceed 100%".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn dont_cleanup(&self) -> Duration {
        Duration::from_secs(self.dont_cleanup_time)
    }

    #[must_use]
    pub fn batch(&self) -> usize {
        self.batch_size.max(BATCH_SIZE_MIN)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LruConf {
    pub enabled: bool,
    /// Objects accessed within this window are never evicted (seconds).
    pub dont_evict_time: u64,
}

impl Default for LruConf {
    fn default() -> Self {
        Self {
            enabled: true,
            dont_evict_time: 2 * 3600,
        }
    }
}

impl LruConf {
    #[must_use]
    pub fn dont_evict(&self) -> Duration {
        Duration::from_secs(self.dont_evict_time)
    }
}

/// Disk-utilization throttling for mountpath walkers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskConf {
    /// Joggers sleep when utilization reaches this percentage.
    pub max_throttle_pct: u32,
    /// Probe utilization every N-th visited file.
    pub throttle_walk_every: u64,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            max_throttle_pct: 90,
            throttle_walk_every: 32,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Never,
    Always,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConf {
    /// Streams per destination.
    pub multiplier: usize,
    /// Bounded send-queue depth per stream.
    pub burst: usize,
    /// Max encoded header size, bytes.
    pub max_hdr_size: usize,
    /// PDU size for unsized payloads, bytes.
    pub size_pdu: usize,
    pub compression: Compression,
    /// Idle receiver eviction interval for the shared demux (seconds).
    pub sdm_idle_evict_time: u64,
}

impl Default for TransportConf {
    fn default() -> Self {
        Self {
            multiplier: 1,
            burst: 128,
            max_hdr_size: 4 * 1024,
            size_pdu: 128 * 1024,
            compression: Compression::Never,
            sdm_idle_evict_time: 10 * 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConf {
    /// Upper bound for transport send retries (seconds).
    pub max_keepalive: u64,
    /// Sentinel: abort when a peer reports no progress for this long (seconds).
    pub progress: u64,
    /// Default quiescence window (seconds).
    pub quiesce: u64,
    /// Cold GET per-object deadline (seconds).
    pub cold_get: u64,
}

impl Default for TimeoutConf {
    fn default() -> Self {
        Self {
            max_keepalive: 4,
            progress: 60,
            quiesce: 20,
            cold_get: 120,
        }
    }
}

impl TimeoutConf {
    #[must_use]
    pub fn progress_d(&self) -> Duration {
        Duration::from_secs(self.progress)
    }

    #[must_use]
    pub fn quiesce_d(&self) -> Duration {
        Duration::from_secs(self.quiesce)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetConf {
    /// Intra-cluster control/data HTTP API.
    pub listen: String,
    /// Long-lived inter-target streams.
    pub stream_listen: String,
}

impl Default for NetConf {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8081".to_string(),
            stream_listen: "0.0.0.0:8082".to_string(),
        }
    }
}

/// Remote-backend endpoints and credentials.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackendConf {
    #[serde(default)]
    pub s3: S3BackendConf,
    #[serde(default)]
    pub gs: GsBackendConf,
    #[serde(default)]
    pub az: AzBackendConf,
    #[serde(default)]
    pub oci: OciBackendConf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S3BackendConf {
    pub endpoint: String,
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
}

impl Default for S3BackendConf {
    fn default() -> Self {
        Self {
            endpoint: "https://s3.amazonaws.com".to_string(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GsBackendConf {
    pub endpoint: String,
    /// Pre-issued OAuth bearer token.
    #[serde(default)]
    pub token: String,
}

impl Default for GsBackendConf {
    fn default() -> Self {
        Self {
            endpoint: "https://storage.googleapis.com".to_string(),
            token: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AzBackendConf {
    /// `https://<account>.blob.core.windows.net`
    pub endpoint: String,
    /// Shared-access-signature query string (without the leading `?`).
    #[serde(default)]
    pub sas_token: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OciBackendConf {
    /// `https://objectstorage.<region>.oraclecloud.com`
    pub endpoint: String,
    pub namespace: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConf {
    pub dir: PathBuf,
    /// Rotate when the current file exceeds this size, bytes.
    pub max_size: u64,
    pub level: String,
}

impl Default for LogConf {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/log/shoal"),
            max_size: 64 * 1024 * 1024,
            level: "info".to_string(),
        }
    }
}
