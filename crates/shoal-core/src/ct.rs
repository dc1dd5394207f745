//! Typed content file handle (CT)
//!
//! One file of any content type — work file, EC slice/metafile, chunk or
//! manifest — addressed the same way LOMs are: by bucket, object name and
//! HRW mountpath. Used to derive sibling FQNs (`obj` → `work`, `ecs` →
//! `ecm`, …) and to write through the workfile protocol.

use crate::save::{rename_atomic, save_reader};
use crate::tcore::Tcore;
use shoal_common::{Bck, CksumType, Error, Result};
use shoal_fs::fqn::resolve_fqn;
use shoal_fs::{ContentType, Mountpath};
use shoal_placement::hrw_digest;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone)]
pub struct Ct {
    bck: Bck,
    /// Decoded object name (bucket-relative, ubase decoded).
    obj_name: String,
    ct: ContentType,
    fqn: PathBuf,
    mi: Arc<Mountpath>,
    digest: u64,
    size: u64,
    mtime_ns: i64,
}

impl Ct {
    /// Forward: place a content file of the given type on the object's
    /// HRW mountpath. `extras` are type-specific (chunk number etc.).
    pub fn new(
        t: &Arc<Tcore>,
        bck: &Bck,
        obj_name: &str,
        ct: ContentType,
        extras: &[&str],
    ) -> Result<Self> {
        t.init_bck(bck)?;
        let uname = bck.make_uname(obj_name);
        let mi = t.mfs.select_hrw(&uname)?;
        Ok(Self::from_parts(bck.clone(), obj_name, ct, mi, extras))
    }

    /// Reverse: parse an existing FQN.
    pub fn from_fqn(t: &Arc<Tcore>, fqn: &Path) -> Result<Self> {
        let parsed = resolve_fqn(&t.mfs, fqn)?;
        let obj_name = parsed.base_name();
        let digest = hrw_digest(&parsed.bck.make_uname(&obj_name));
        Ok(Self {
            bck: parsed.bck,
            obj_name,
            ct: parsed.ct,
            fqn: fqn.to_path_buf(),
            mi: parsed.mpath,
            digest,
            size: 0,
            mtime_ns: 0,
        })
    }

    fn from_parts(
        bck: Bck,
        obj_name: &str,
        ct: ContentType,
        mi: Arc<Mountpath>,
        extras: &[&str],
    ) -> Self {
        let encoded = encode_name(ct, obj_name, extras);
        let fqn = mi.make_fqn(ct, &bck, &encoded);
        let digest = hrw_digest(&bck.make_uname(obj_name));
        Self {
            bck,
            obj_name: obj_name.to_string(),
            ct,
            fqn,
            mi,
            digest,
            size: 0,
            mtime_ns: 0,
        }
    }

    /// Sibling of the same object with a different content type.
    #[must_use]
    pub fn clone_as(&self, ct: ContentType, extras: &[&str]) -> Self {
        Self::from_parts(self.bck.clone(), &self.obj_name, ct, Arc::clone(&self.mi), extras)
    }

    /// Just the sibling FQN (same mountpath, different subtree).
    #[must_use]
    pub fn make(&self, ct: ContentType, extras: &[&str]) -> PathBuf {
        let encoded = encode_name(ct, &self.obj_name, extras);
        self.mi.make_fqn(ct, &self.bck, &encoded)
    }

    #[must_use]
    pub fn fqn(&self) -> &Path {
        &self.fqn
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
    pub fn content_type(&self) -> ContentType {
        self.ct
    }

    #[must_use]
    pub fn mountpath(&self) -> &Arc<Mountpath> {
        &self.mi
    }

    #[must_use]
    pub fn cname(&self) -> String {
        self.bck.cname(&self.obj_name)
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn mtime_ns(&self) -> i64 {
        self.mtime_ns
    }

    /// Stat the file, populating size and mtime.
    pub fn load_from_fs(&mut self) -> Result<()> {
        let meta = std::fs::metadata(&self.fqn)
            .map_err(|e| Error::io(format!("stat {}", self.fqn.display()), e))?;
        self.size = meta.len();
        self.mtime_ns = meta
            .modified()
            .ok()
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Ok(())
    }

    pub fn lock(&self, t: &Tcore, exclusive: bool) {
        t.locker.lock(self.digest, exclusive);
    }

    pub fn unlock(&self, t: &Tcore, exclusive: bool) {
        t.locker.unlock(self.digest, exclusive);
    }

    /// Save through a work file when one is given, else write directly.
    pub fn write<R: Read + ?Sized>(&self, reader: &mut R, work_fqn: Option<&Path>) -> Result<u64> {
        match work_fqn {
            None => {
                let (n, _) = save_reader(&self.fqn, reader, CksumType::None, false)?;
                Ok(n)
            }
            Some(work) => {
                let (n, _) = save_reader(work, reader, CksumType::None, false)?;
                rename_atomic(work, &self.fqn)?;
                Ok(n)
            }
        }
    }
}

impl std::fmt::Display for Ct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ct[{}, {}]", self.ct, self.cname())
    }
}

fn encode_name(ct: ContentType, obj_name: &str, extras: &[&str]) -> String {
    match obj_name.rsplit_once('/') {
        Some((dir, base)) => format!("{dir}/{}", ct.make_ubase(base, extras)),
        None => ct.make_ubase(obj_name, extras),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::{BckProps, Config};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn test_tcore() -> (Arc<Tcore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let t = Tcore::new("t1", Config::default(), &[dir.path().to_path_buf()]).unwrap();
        t.bmd
            .write()
            .add(Bck::ais("b"), BckProps::default())
            .unwrap();
        (t, dir)
    }

    #[test]
    fn test_sibling_fqns_share_layout() {
        let (t, _dir) = test_tcore();
        let ct = Ct::new(&t, &Bck::ais("b"), "dir/obj", ContentType::Obj, &[]).unwrap();
        let meta_fqn = ct.make(ContentType::EcMeta, &[]);
        assert!(ct.fqn().to_string_lossy().contains("/obj/"));
        assert!(meta_fqn.to_string_lossy().contains("/ecm/"));
        assert!(meta_fqn.to_string_lossy().ends_with("dir/obj"));
    }

    #[test]
    fn test_write_via_workfile() {
        let (t, _dir) = test_tcore();
        let ct = Ct::new(&t, &Bck::ais("b"), "payload", ContentType::Obj, &[]).unwrap();
        let work = ct.make(ContentType::Work, &[]);
        let n = ct
            .write(&mut Cursor::new(b"twelve bytes".to_vec()), Some(&work))
            .unwrap();
        assert_eq!(n, 12);
        assert!(ct.fqn().exists());
        assert!(!work.exists());
    }

    #[test]
    fn test_from_fqn_decodes_workfile() {
        let (t, _dir) = test_tcore();
        let ct = Ct::new(&t, &Bck::ais("b"), "x/data", ContentType::Work, &[]).unwrap();
        std::fs::create_dir_all(ct.fqn().parent().unwrap()).unwrap();
        std::fs::write(ct.fqn(), b"wip").unwrap();

        let mut parsed = Ct::from_fqn(&t, ct.fqn()).unwrap();
        assert_eq!(parsed.content_type(), ContentType::Work);
        assert_eq!(parsed.obj_name(), "x/data");
        parsed.load_from_fs().unwrap();
        assert_eq!(parsed.size(), 3);
    }

    #[test]
    fn test_chunk_extras() {
        let (t, _dir) = test_tcore();
        let upload = shoal_fs::content::new_upload_id();
        let ct = Ct::new(&t, &Bck::ais("b"), "big", ContentType::Chunk, &[&upload, "3"]).unwrap();
        let info = ContentType::Chunk.parse_ubase(
            ct.fqn().file_name().unwrap().to_str().unwrap(),
        );
        assert!(info.ok);
        assert_eq!(info.extras, vec![upload, "3".to_string()]);
    }
}
