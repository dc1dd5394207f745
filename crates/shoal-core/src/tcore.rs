//! Per-target core context
//!
//! Shared by every subsystem on the node: mountpath registry, bucket
//! metadata, cluster-map snapshot, the name-locker, the LOM cache and the
//! stats tracker. Cheap to clone (Arc), passed explicitly.

use crate::lmeta::LomMd;
use crate::locker::NameLocker;
use parking_lot::RwLock;
use shoal_common::{Bck, BckProps, Bmd, Config, Error, Result};
use shoal_fs::{DiskUtilProbe, Mountpath, MountpathRegistry};
use shoal_placement::Smap;
use shoal_stats::Tracker;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Mountpath io-error threshold before the path is disabled.
const FSHC_MAX_ERRORS: u32 = 8;

pub struct Tcore {
    pub tid: String,
    pub mfs: MountpathRegistry,
    pub bmd: RwLock<Bmd>,
    smap: RwLock<Arc<Smap>>,
    pub locker: NameLocker,
    pub lcache: LomCache,
    pub config: RwLock<Arc<Config>>,
    pub stats: Arc<Tracker>,
    pub disk_util: DiskUtilProbe,
    fshc_errors: RwLock<HashMap<String, AtomicU32>>,
}

impl Tcore {
    pub fn new(tid: impl Into<String>, config: Config, mpaths: &[PathBuf]) -> Result<Arc<Self>> {
        let t = Arc::new(Self {
            tid: tid.into(),
            mfs: MountpathRegistry::new(),
            bmd: RwLock::new(Bmd::default()),
            smap: RwLock::new(Arc::new(Smap::default())),
            locker: NameLocker::new(),
            lcache: LomCache::new(),
            config: RwLock::new(Arc::new(config)),
            stats: Arc::new(Tracker::new()),
            disk_util: DiskUtilProbe::new(),
            fshc_errors: RwLock::new(HashMap::new()),
        });
        for mp in mpaths {
            t.mfs.add(mp)?;
        }
        Ok(t)
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read())
    }

    pub fn set_config(&self, config: Config) {
        *self.config.write() = Arc::new(config);
    }

    #[must_use]
    pub fn smap(&self) -> Arc<Smap> {
        Arc::clone(&self.smap.read())
    }

    pub fn set_smap(&self, smap: Smap) {
        *self.smap.write() = Arc::new(smap);
    }

    /// Whether this target is the HRW owner of the uname. A single-node
    /// map (or an empty one, when running standalone) always owns.
    #[must_use]
    pub fn is_local_owner(&self, uname: &str) -> bool {
        let smap = self.smap();
        if smap.count_active() <= 1 {
            return true;
        }
        smap.hrw_target(uname).map(|ti| ti.tid == self.tid).unwrap_or(true)
    }

    /// Resolve bucket properties; remote buckets are added to the BMD on
    /// first touch, ais buckets must have been created.
    pub fn init_bck(&self, bck: &Bck) -> Result<Arc<BckProps>> {
        if let Some(props) = self.bmd.read().lookup(bck) {
            return Ok(props);
        }
        if !bck.is_remote() {
            return Err(Error::BckNotFound(bck.clone()));
        }
        let defaults = self.config().bprops.clone();
        Ok(self.bmd.write().add_remote(bck.clone(), defaults))
    }

    /// Filesystem-health escalation: io-errors against a mountpath count
    /// toward disabling it.
    pub fn fshc(&self, err: &Error, mi: &Mountpath) {
        if !matches!(err, Error::Io { .. }) {
            return;
        }
        error!(%mi, %err, "mountpath io-error");
        self.stats.set_flag(shoal_stats::alert::DISK_FAULT);
        let hit = {
            let m = self.fshc_errors.read();
            m.get(&mi.mpid)
                .map(|c| c.fetch_add(1, Ordering::Relaxed) + 1)
        };
        let n = match hit {
            Some(n) => n,
            None => {
                self.fshc_errors
                    .write()
                    .entry(mi.mpid.clone())
                    .or_insert_with(|| AtomicU32::new(0))
                    .fetch_add(1, Ordering::Relaxed)
                    + 1
            }
        };
        if n >= FSHC_MAX_ERRORS {
            warn!(%mi, errors = n, "disabling faulted mountpath");
            let _ = self.mfs.set_enabled(&mi.mpid, false);
        }
    }
}

/// In-memory LOM metadata cache, keyed by the uname digest.
///
/// Never authoritative: entries may be absent or stale, and
/// reload-under-lock reconciles against disk.
pub struct LomCache {
    shards: Vec<RwLock<HashMap<u64, Arc<LomMd>>>>,
}

const LCACHE_SHARDS: usize = 64;

impl Default for LomCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LomCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..LCACHE_SHARDS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, digest: u64) -> &RwLock<HashMap<u64, Arc<LomMd>>> {
        &self.shards[(digest as usize) & (LCACHE_SHARDS - 1)]
    }

    #[must_use]
    pub fn get(&self, digest: u64) -> Option<Arc<LomMd>> {
        self.shard(digest).read().get(&digest).cloned()
    }

    pub fn put(&self, digest: u64, md: LomMd) {
        self.shard(digest).write().insert(digest, Arc::new(md));
    }

    pub fn invalidate(&self, digest: u64) {
        self.shard(digest).write().remove(&digest);
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::Provider;
    use tempfile::tempdir;

    #[test]
    fn test_remote_bucket_on_first_touch() {
        let dir = tempdir().unwrap();
        let t = Tcore::new("t1", Config::default(), &[dir.path().to_path_buf()]).unwrap();

        let ais = Bck::ais("nope");
        assert!(matches!(t.init_bck(&ais), Err(Error::BckNotFound(_))));

        let s3 = Bck::new(Provider::S3, "remote-bucket");
        let props = t.init_bck(&s3).unwrap();
        assert!(props.allows(shoal_common::types::access::GET));
        assert!(t.bmd.read().exists(&s3));
    }

    #[test]
    fn test_lcache() {
        let cache = LomCache::new();
        assert!(cache.get(1).is_none());
        cache.put(1, LomMd::default());
        assert!(cache.get(1).is_some());
        cache.invalidate(1);
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn test_single_node_owns_everything() {
        let dir = tempdir().unwrap();
        let t = Tcore::new("t1", Config::default(), &[dir.path().to_path_buf()]).unwrap();
        assert!(t.is_local_owner("ais/@/b/any"));
    }
}
