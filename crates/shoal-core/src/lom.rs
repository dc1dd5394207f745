//! Local Object Metadata (LOM)
//!
//! The in-memory handle for one object replica on one mountpath. Handles
//! are pool-allocated; `init` resolves placement without touching disk;
//! `load` reconciles against the on-disk metadata; all mutations happen
//! under the striped name-locker.

use crate::lmeta::{load_lmeta, store_lmeta, LomMd, LOM_FLAG_CHUNKED};
use crate::pool::Pool;
use crate::tcore::Tcore;
use shoal_common::{Bck, BckProps, Cksum, Error, ObjAttrs, ObjVersion, Result, WritePolicy};
use shoal_fs::fqn::resolve_fqn;
use shoal_fs::{ContentType, Mountpath};
use shoal_placement::hrw_digest;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Default)]
pub struct Lom {
    t: Option<Arc<Tcore>>,
    bck: Bck,
    bprops: Option<Arc<BckProps>>,
    obj_name: String,
    fqn: PathBuf,
    mi: Option<Arc<Mountpath>>,
    digest: u64,
    pub md: LomMd,
    loaded: bool,
}

static LOM_POOL: OnceLock<Pool<Lom>> = OnceLock::new();

fn pool() -> &'static Pool<Lom> {
    LOM_POOL.get_or_init(|| Pool::new(1024))
}

/// Acquire a pooled handle. Pair with [`free_lom`] on every return path.
#[must_use]
pub fn alloc_lom() -> Box<Lom> {
    pool().alloc()
}

/// Reset and return a handle to the pool.
pub fn free_lom(lom: Box<Lom>) {
    pool().free(lom, |l| *l = Lom::default());
}

impl Lom {
    /// Forward resolution: bucket + name → mountpath (HRW) + FQN.
    /// Does not touch disk.
    pub fn init(&mut self, t: &Arc<Tcore>, bck: &Bck, obj_name: &str) -> Result<()> {
        if obj_name.is_empty() {
            return Err(Error::Fatal("empty object name".into()));
        }
        let bprops = t.init_bck(bck)?;
        let uname = bck.make_uname(obj_name);
        let mi = t.mfs.select_hrw(&uname)?;
        self.fqn = mi.make_fqn(ContentType::Obj, bck, obj_name);
        self.t = Some(Arc::clone(t));
        self.bck = bck.clone();
        self.bprops = Some(bprops);
        self.obj_name = obj_name.to_string();
        self.mi = Some(mi);
        self.digest = hrw_digest(&uname);
        self.md = LomMd::default();
        self.loaded = false;
        Ok(())
    }

    /// Reverse resolution: parse provider/bucket/object out of an FQN and
    /// validate the mountpath. The parsed location may be non-HRW.
    pub fn init_fqn(&mut self, t: &Arc<Tcore>, fqn: &Path) -> Result<()> {
        let parsed = resolve_fqn(&t.mfs, fqn)?;
        if parsed.ct != ContentType::Obj {
            return Err(Error::Fatal(format!(
                "{}: expected an object body, found {}",
                fqn.display(),
                parsed.ct
            )));
        }
        let bprops = t.init_bck(&parsed.bck)?;
        let uname = parsed.bck.make_uname(&parsed.obj_name);
        self.fqn = fqn.to_path_buf();
        self.t = Some(Arc::clone(t));
        self.bck = parsed.bck;
        self.bprops = Some(bprops);
        self.obj_name = parsed.obj_name;
        self.mi = Some(parsed.mpath);
        self.digest = hrw_digest(&uname);
        self.md = LomMd::default();
        self.loaded = false;
        Ok(())
    }

    //
    // accessors
    //

    fn t(&self) -> &Arc<Tcore> {
        self.t.as_ref().expect("uninitialized LOM")
    }

    #[must_use]
    pub fn bck(&self) -> &Bck {
        &self.bck
    }

    #[must_use]
    pub fn obj_name(&self) -> &str {
        &self.obj_name
    }

    #[must_use]
    pub fn fqn(&self) -> &Path {
        &self.fqn
    }

    #[must_use]
    pub fn mountpath(&self) -> &Arc<Mountpath> {
        self.mi.as_ref().expect("uninitialized LOM")
    }

    #[must_use]
    pub fn digest(&self) -> u64 {
        self.digest
    }

    /// Whether metadata has been (re)loaded since init.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[must_use]
    pub fn uname(&self) -> String {
        self.bck.make_uname(&self.obj_name)
    }

    #[must_use]
    pub fn cname(&self) -> String {
        self.bck.cname(&self.obj_name)
    }

    #[must_use]
    pub fn bprops(&self) -> &Arc<BckProps> {
        self.bprops.as_ref().expect("uninitialized LOM")
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.md.attrs.size
    }

    #[must_use]
    pub fn atime_ns(&self) -> i64 {
        self.md.attrs.atime_ns
    }

    #[must_use]
    pub fn cksum(&self) -> Option<&Cksum> {
        self.md.attrs.cksum.as_ref()
    }

    #[must_use]
    pub fn version(&self) -> Option<&ObjVersion> {
        self.md.attrs.version.as_ref()
    }

    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.md.is_chunked()
    }

    #[must_use]
    pub fn ec_enabled(&self) -> bool {
        self.bprops().ec.enabled
    }

    /// The mountpath-level HRW FQN of this object on this target.
    pub fn hrw_fqn(&self) -> Result<PathBuf> {
        let mi = self.t().mfs.select_hrw(&self.uname())?;
        Ok(mi.make_fqn(ContentType::Obj, &self.bck, &self.obj_name))
    }

    /// Whether this replica sits on its HRW mountpath.
    #[must_use]
    pub fn is_hrw(&self) -> bool {
        match self.t().mfs.select_hrw(&self.uname()) {
            Ok(mi) => mi.mpid == self.mountpath().mpid,
            Err(_) => false,
        }
    }

    /// A non-HRW replica that the mirror set knows about is a copy;
    /// a non-HRW replica nobody references is misplaced.
    #[must_use]
    pub fn is_copy(&self) -> bool {
        !self.is_hrw() && self.md.copies.contains(&self.fqn.to_string_lossy().into_owned())
    }

    #[must_use]
    pub fn has_copies(&self) -> bool {
        self.md.copies.len() > 1
    }

    //
    // locking
    //

    pub fn lock(&self, exclusive: bool) {
        self.t().locker.lock(self.digest, exclusive);
    }

    pub fn try_lock(&self, exclusive: bool) -> bool {
        self.t().locker.try_lock(self.digest, exclusive)
    }

    pub fn unlock(&self, exclusive: bool) {
        self.t().locker.unlock(self.digest, exclusive);
    }

    //
    // load / persist
    //

    /// Load metadata, cache-first. `locked` means the caller holds the
    /// name-lock and the cached entry may be trusted as current.
    pub fn load(&mut self, cache_it: bool, locked: bool) -> Result<()> {
        let t = Arc::clone(self.t());
        if locked {
            if let Some(cached) = t.lcache.get(self.digest) {
                self.md = (*cached).clone();
                self.loaded = true;
                return Ok(());
            }
        }
        self.load_from_fs()?;
        if cache_it {
            t.lcache.put(self.digest, self.md.clone());
        }
        Ok(())
    }

    /// Bypass the cache and read straight from disk.
    pub fn load_from_fs(&mut self) -> Result<()> {
        let meta = match std::fs::metadata(&self.fqn) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ObjNotFound(self.cname()));
            }
            Err(e) => {
                let err = Error::io(format!("stat {}", self.fqn.display()), e);
                self.t().fshc(&err, self.mountpath());
                return Err(err);
            }
        };
        let md = match load_lmeta(&self.fqn) {
            Ok(md) => md,
            Err(err @ Error::Io { .. }) => {
                self.t().fshc(&err, self.mountpath());
                return Err(err);
            }
            Err(e) => return Err(e),
        };
        // disk is authoritative: a size disagreement means the metadata
        // no longer describes these bytes
        if !md.is_chunked() && md.attrs.size != meta.len() {
            return Err(Error::MetadataCorrupted(format!(
                "{}: size {} vs on-disk {}",
                self.cname(),
                md.attrs.size,
                meta.len()
            )));
        }
        self.md = md;
        self.loaded = true;
        Ok(())
    }

    /// Persist metadata per the bucket's metadata write policy and
    /// refresh the cache.
    pub fn persist(&self) -> Result<()> {
        match self.bprops().write_policy.md {
            WritePolicy::Never => {}
            WritePolicy::Immediate | WritePolicy::Delayed => {
                store_lmeta(&self.fqn, &self.md)?;
            }
        }
        self.t().lcache.put(self.digest, self.md.clone());
        Ok(())
    }

    /// Record an access; cached immediately, persisted lazily.
    pub fn touch_atime(&mut self) {
        self.md.attrs.atime_ns = now_ns();
        self.t().lcache.put(self.digest, self.md.clone());
    }

    pub fn set_attrs_from(&mut self, attrs: &ObjAttrs) {
        self.md.attrs = attrs.clone();
        if self.md.attrs.atime_ns == 0 {
            self.md.attrs.atime_ns = now_ns();
        }
        self.md.mtime_ns = now_ns();
    }

    /// Next version: bump the local counter for ais buckets, overwrite
    /// the remote string otherwise.
    pub fn set_version_next(&mut self, remote: Option<String>) {
        let next = match (remote, self.md.attrs.version.take()) {
            (Some(v), _) => ObjVersion::Remote(v),
            (None, Some(ObjVersion::Local(n))) => ObjVersion::Local(n + 1),
            (None, _) => ObjVersion::Local(1),
        };
        self.md.attrs.version = Some(next);
    }

    pub fn set_chunked(&mut self, upload_id: String) {
        self.md.flags |= LOM_FLAG_CHUNKED;
        self.md.upload_id = Some(upload_id);
    }

    /// Version-changed detection against freshly HEADed remote attrs.
    pub fn check_eq(&self, remote: &ObjAttrs) -> Result<()> {
        self.md.attrs.check_eq(remote)
    }

    //
    // mutations
    //

    /// Remove the main replica and invalidate the cache. Copies, slices
    /// and manifests are the caller's (or the space engine's) business.
    pub fn remove_main(&self) -> Result<()> {
        match std::fs::remove_file(&self.fqn) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(format!("rm {}", self.fqn.display()), e)),
        }
        self.t().lcache.invalidate(self.digest);
        Ok(())
    }

    /// Remove main plus every known mirror copy.
    pub fn remove_all(&self) -> Result<()> {
        for fqn in &self.md.copies {
            if Path::new(fqn) != self.fqn {
                let _ = std::fs::remove_file(fqn);
            }
        }
        self.remove_main()
    }

    /// Drop mirror copies beyond the configured n-way count (or a single
    /// named one). Returns the number of files removed.
    pub fn del_extra_copies(&mut self, only: Option<&Path>) -> Result<usize> {
        let main = self.fqn.to_string_lossy().into_owned();
        let configured = if self.bprops().mirror.enabled {
            self.bprops().mirror.copies.max(1) as usize
        } else {
            1
        };
        let mut removed = 0;
        let extras: Vec<String> = self
            .md
            .copies
            .iter()
            .filter(|c| c.as_str() != main)
            .cloned()
            .collect();
        for (i, copy) in extras.iter().enumerate() {
            let victim = match only {
                Some(p) => p.to_string_lossy() == copy.as_str(),
                // keep main + (configured-1) copies
                None => i + 1 >= configured,
            };
            if !victim {
                continue;
            }
            match std::fs::remove_file(copy) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(format!("rm copy {copy}"), e)),
            }
            self.md.copies.remove(copy);
        }
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Add a mirror copy location (both main and copy lmeta carry the
    /// full set).
    pub fn add_copy(&mut self, copy_fqn: &Path) {
        if self.md.copies.is_empty() {
            self.md
                .copies
                .insert(self.fqn.to_string_lossy().into_owned());
        }
        self.md
            .copies
            .insert(copy_fqn.to_string_lossy().into_owned());
    }

    //
    // clone helpers for the space engine
    //

    /// Detached snapshot of identity + metadata (for deferred batches).
    #[must_use]
    pub fn snap_identity(&self) -> LomIdentity {
        LomIdentity {
            bck: self.bck.clone(),
            obj_name: self.obj_name.clone(),
            fqn: self.fqn.clone(),
            size: self.md.attrs.size,
        }
    }
}

/// Where-and-what of one replica, detached from the pooled handle.
#[derive(Clone, Debug)]
pub struct LomIdentity {
    pub bck: Bck,
    pub obj_name: String,
    pub fqn: PathBuf,
    pub size: u64,
}

#[must_use]
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::{BckProps, CksumType, Config};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn test_tcore(nmp: usize) -> (Arc<Tcore>, Vec<TempDir>) {
        let dirs: Vec<TempDir> = (0..nmp).map(|_| TempDir::new().unwrap()).collect();
        let paths: Vec<PathBuf> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let t = Tcore::new("t1", Config::default(), &paths).unwrap();
        t.bmd
            .write()
            .add(Bck::ais("data"), BckProps::default())
            .unwrap();
        (t, dirs)
    }

    fn put_obj(t: &Arc<Tcore>, name: &str, body: &[u8]) -> Box<Lom> {
        let mut lom = alloc_lom();
        lom.init(t, &Bck::ais("data"), name).unwrap();
        lom.lock(true);
        let (size, cksum) = crate::save::save_reader(
            lom.fqn(),
            &mut Cursor::new(body.to_vec()),
            CksumType::XXHash,
            false,
        )
        .unwrap();
        lom.md.attrs.size = size;
        lom.md.attrs.cksum = cksum;
        lom.md.attrs.atime_ns = now_ns();
        lom.set_version_next(None);
        lom.persist().unwrap();
        lom.unlock(true);
        lom
    }

    #[test]
    fn test_init_does_not_touch_disk() {
        let (t, _dirs) = test_tcore(2);
        let mut lom = alloc_lom();
        lom.init(&t, &Bck::ais("data"), "never/written").unwrap();
        assert!(!lom.fqn().exists());
        assert!(matches!(
            lom.load(false, false),
            Err(Error::ObjNotFound(_))
        ));
        free_lom(lom);
    }

    #[test]
    fn test_roundtrip_via_init_and_fqn() {
        let (t, _dirs) = test_tcore(2);
        let lom = put_obj(&t, "a/b/obj1", b"0123456789");

        // forward
        let mut lom2 = alloc_lom();
        lom2.init(&t, &Bck::ais("data"), "a/b/obj1").unwrap();
        lom2.load(true, false).unwrap();
        assert_eq!(lom2.size(), 10);
        assert_eq!(lom2.version(), Some(&ObjVersion::Local(1)));
        assert_eq!(lom2.cksum(), lom.cksum());

        // reverse
        let mut lom3 = alloc_lom();
        lom3.init_fqn(&t, lom.fqn()).unwrap();
        assert_eq!(lom3.bck(), &Bck::ais("data"));
        assert_eq!(lom3.obj_name(), "a/b/obj1");
        assert!(lom3.is_hrw());

        free_lom(lom3);
        free_lom(lom2);
        free_lom(lom);
    }

    #[test]
    fn test_version_bumps_monotonically() {
        let (t, _dirs) = test_tcore(1);
        let mut lom = put_obj(&t, "versioned", b"v1");
        lom.set_version_next(None);
        assert_eq!(lom.version(), Some(&ObjVersion::Local(2)));
        lom.set_version_next(Some("etag-7".into()));
        assert_eq!(lom.version(), Some(&ObjVersion::Remote("etag-7".into())));
        free_lom(lom);
    }

    #[test]
    fn test_size_mismatch_is_corruption() {
        let (t, _dirs) = test_tcore(1);
        let lom = put_obj(&t, "short", b"12345");
        std::fs::write(lom.fqn(), b"1234567890ab").unwrap();

        let mut lom2 = alloc_lom();
        lom2.init(&t, &Bck::ais("data"), "short").unwrap();
        assert!(matches!(
            lom2.load_from_fs(),
            Err(Error::MetadataCorrupted(_))
        ));
        free_lom(lom2);
        free_lom(lom);
    }

    #[test]
    fn test_remove_main_invalidates_cache() {
        let (t, _dirs) = test_tcore(1);
        let mut lom = put_obj(&t, "goner", b"bye");
        lom.load(true, false).unwrap();
        assert!(t.lcache.get(lom.digest()).is_some());
        lom.remove_main().unwrap();
        assert!(t.lcache.get(lom.digest()).is_none());
        assert!(!lom.fqn().exists());
        free_lom(lom);
    }

    #[test]
    fn test_del_extra_copies() {
        let (t, dirs) = test_tcore(2);
        let mut lom = put_obj(&t, "mirrored", b"data");
        let copy_fqn = dirs[0].path().join("copyfile");
        std::fs::write(&copy_fqn, b"data").unwrap();
        lom.add_copy(&copy_fqn);
        assert!(lom.has_copies());

        let removed = lom.del_extra_copies(None).unwrap();
        assert_eq!(removed, 1);
        assert!(!copy_fqn.exists());
        assert!(!lom.has_copies());
        free_lom(lom);
    }
}
