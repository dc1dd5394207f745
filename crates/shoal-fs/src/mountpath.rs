//! Mountpath registry
//!
//! One filesystem per disk; the registry partitions local storage and is
//! read on the hot path (RW-lock, writes only on add/remove/disable).

use crate::capacity::Capacity;
use crate::content::ContentType;
use parking_lot::RwLock;
use shoal_common::{Bck, Error, Result};
use shoal_placement::hrw_select;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Subdirectory collecting destroyed-bucket trees until cleanup purges them.
pub const DELETED_DIR: &str = "$deleted";

#[derive(Debug)]
pub struct Mountpath {
    /// Filesystem root dedicated to this target.
    pub path: PathBuf,
    /// Stable id; doubles as the HRW weight input.
    pub mpid: String,
    enabled: AtomicBool,
}

impl Mountpath {
    pub fn new(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let meta = std::fs::metadata(&path)
            .map_err(|e| Error::io(format!("mountpath {}", path.display()), e))?;
        if !meta.is_dir() {
            return Err(Error::Fatal(format!(
                "mountpath {} is not a directory",
                path.display()
            )));
        }
        let mpid = path.to_string_lossy().into_owned();
        Ok(Arc::new(Self {
            path,
            mpid,
            enabled: AtomicBool::new(true),
        }))
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    /// Root of one content-type subtree.
    #[must_use]
    pub fn make_path_ct(&self, ct: ContentType) -> PathBuf {
        self.path.join(ct.as_str())
    }

    /// Bucket directory within a content-type subtree.
    #[must_use]
    pub fn make_path_bck(&self, ct: ContentType, bck: &Bck) -> PathBuf {
        let mut p = self.make_path_ct(ct);
        p.push(bck.provider.as_str());
        p.push(format!("@{}", bck.ns));
        p.push(&bck.name);
        p
    }

    /// Full FQN for an (already ubase-encoded) object path.
    #[must_use]
    pub fn make_fqn(&self, ct: ContentType, bck: &Bck, obj_name: &str) -> PathBuf {
        let mut p = self.make_path_bck(ct, bck);
        p.push(obj_name);
        p
    }

    #[must_use]
    pub fn deleted_dir(&self) -> PathBuf {
        self.path.join(DELETED_DIR)
    }

    /// Atomically retire a directory tree into `$deleted` for deferred
    /// removal (bucket destroy).
    pub fn move_to_deleted(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        let trash = self.deleted_dir();
        std::fs::create_dir_all(&trash)
            .map_err(|e| Error::io(format!("mkdir {}", trash.display()), e))?;
        let unique = format!(
            "{}.{}",
            dir.file_name().unwrap_or_default().to_string_lossy(),
            uuid::Uuid::new_v4().simple()
        );
        let dst = trash.join(unique);
        std::fs::rename(dir, &dst).map_err(|e| {
            Error::io(
                format!("rename {} -> {}", dir.display(), dst.display()),
                e,
            )
        })
    }

    /// Purge everything previously moved to `$deleted`.
    pub fn remove_deleted(&self) -> Result<()> {
        let trash = self.deleted_dir();
        match std::fs::read_dir(&trash) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("read {}", trash.display()), e)),
            Ok(entries) => {
                for entry in entries.flatten() {
                    let p = entry.path();
                    let res = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        std::fs::remove_dir_all(&p)
                    } else {
                        std::fs::remove_file(&p)
                    };
                    res.map_err(|e| Error::io(format!("purge {}", p.display()), e))?;
                }
                Ok(())
            }
        }
    }

    pub fn capacity(&self) -> Result<Capacity> {
        Capacity::probe(&self.path)
    }
}

impl std::fmt::Display for Mountpath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mp[{}]", self.path.display())
    }
}

/// Registry of this target's mountpaths.
#[derive(Debug, Default)]
pub struct MountpathRegistry {
    inner: RwLock<BTreeMap<String, Arc<Mountpath>>>,
}

impl MountpathRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: impl Into<PathBuf>) -> Result<Arc<Mountpath>> {
        let mi = Mountpath::new(path)?;
        let mut inner = self.inner.write();
        if inner.contains_key(&mi.mpid) {
            return Err(Error::AlreadyExists(mi.mpid.clone()));
        }
        info!(%mi, "attached mountpath");
        inner.insert(mi.mpid.clone(), Arc::clone(&mi));
        Ok(mi)
    }

    pub fn remove(&self, mpid: &str) -> Result<Arc<Mountpath>> {
        self.inner
            .write()
            .remove(mpid)
            .ok_or_else(|| Error::Fatal(format!("unknown mountpath {mpid:?}")))
    }

    pub fn get(&self, mpid: &str) -> Option<Arc<Mountpath>> {
        self.inner.read().get(mpid).cloned()
    }

    pub fn set_enabled(&self, mpid: &str, on: bool) -> Result<()> {
        let inner = self.inner.read();
        let mi = inner
            .get(mpid)
            .ok_or_else(|| Error::Fatal(format!("unknown mountpath {mpid:?}")))?;
        mi.set_enabled(on);
        Ok(())
    }

    /// Enabled mountpaths, in stable (id) order.
    #[must_use]
    pub fn available(&self) -> Vec<Arc<Mountpath>> {
        self.inner
            .read()
            .values()
            .filter(|m| m.is_enabled())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// HRW-select the home mountpath for a uname.
    pub fn select_hrw(&self, uname: &str) -> Result<Arc<Mountpath>> {
        let inner = self.inner.read();
        let mpid = hrw_select(
            uname,
            inner
                .values()
                .filter(|m| m.is_enabled())
                .map(|m| m.mpid.as_str()),
        )
        .ok_or(Error::NoMountpaths)?;
        Ok(Arc::clone(&inner[mpid]))
    }

    /// Longest-prefix match of an absolute path to its owning mountpath.
    pub fn resolve(&self, fqn: &Path) -> Result<Arc<Mountpath>> {
        let inner = self.inner.read();
        inner
            .values()
            .filter(|m| fqn.starts_with(&m.path))
            .max_by_key(|m| m.path.as_os_str().len())
            .cloned()
            .ok_or_else(|| Error::Fatal(format!("{} is not on any mountpath", fqn.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::Provider;
    use tempfile::tempdir;

    #[test]
    fn test_layout_paths() {
        let dir = tempdir().unwrap();
        let mi = Mountpath::new(dir.path()).unwrap();
        let bck = Bck::new(Provider::S3, "buck");
        let fqn = mi.make_fqn(ContentType::Obj, &bck, "a/b/c");
        assert!(fqn.ends_with("obj/s3/@/buck/a/b/c"));
    }

    #[test]
    fn test_registry_hrw_is_stable() {
        let d1 = tempdir().unwrap();
        let d2 = tempdir().unwrap();
        let reg = MountpathRegistry::new();
        reg.add(d1.path()).unwrap();
        reg.add(d2.path()).unwrap();
        let a = reg.select_hrw("ais/@/b/o").unwrap();
        let b = reg.select_hrw("ais/@/b/o").unwrap();
        assert_eq!(a.mpid, b.mpid);
    }

    #[test]
    fn test_disable_excludes_from_selection() {
        let d1 = tempdir().unwrap();
        let d2 = tempdir().unwrap();
        let reg = MountpathRegistry::new();
        let m1 = reg.add(d1.path()).unwrap();
        reg.add(d2.path()).unwrap();
        reg.set_enabled(&m1.mpid, false).unwrap();
        for i in 0..50 {
            let sel = reg.select_hrw(&format!("ais/@/b/o{i}")).unwrap();
            assert_ne!(sel.mpid, m1.mpid);
        }
    }

    #[test]
    fn test_move_to_deleted_and_purge() {
        let dir = tempdir().unwrap();
        let mi = Mountpath::new(dir.path()).unwrap();
        let bdir = mi.make_path_bck(ContentType::Obj, &Bck::ais("gone"));
        std::fs::create_dir_all(bdir.join("sub")).unwrap();
        std::fs::write(bdir.join("sub/f"), b"x").unwrap();

        mi.move_to_deleted(&bdir).unwrap();
        assert!(!bdir.exists());
        assert!(mi.deleted_dir().exists());

        mi.remove_deleted().unwrap();
        assert_eq!(std::fs::read_dir(mi.deleted_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_resolve_prefix() {
        let dir = tempdir().unwrap();
        let reg = MountpathRegistry::new();
        let mi = reg.add(dir.path()).unwrap();
        let fqn = mi.make_fqn(ContentType::Work, &Bck::ais("b"), "o");
        assert_eq!(reg.resolve(&fqn).unwrap().mpid, mi.mpid);
        assert!(reg.resolve(Path::new("/nonexistent/x")).is_err());
    }
}
