//! Target data path
//!
//! Warm reads come off the mountpaths; cold reads stream from the
//! bucket's backend into a work file and commit by rename. Writes follow
//! the same workfile protocol. Everything object-scoped runs under the
//! name-locker.

pub mod lso;

use bytes::Bytes;
use shoal_backend::{Backend, Backends};
use shoal_common::types::custom;
use shoal_common::{Bck, CksumHash, Error, ObjAttrs, ObjVersion, Result};
use shoal_core::lom::{alloc_lom, free_lom, now_ns, Lom};
use shoal_core::save::{rename_atomic, save_reader};
use shoal_core::{Ct, Tcore};
use shoal_fs::ContentType;
use shoal_stats::named;
use shoal_xact::XactRegistry;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Finalization mode for received/written payloads: an ordinary PUT
/// bumps versions, a migrated replica keeps what it carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Owt {
    #[default]
    Put,
    Migrate,
}

#[derive(Clone)]
pub struct Target {
    pub t: Arc<Tcore>,
    pub backends: Arc<Backends>,
    pub reg: Arc<XactRegistry>,
}

impl Target {
    #[must_use]
    pub fn new(t: Arc<Tcore>, backends: Backends, reg: Arc<XactRegistry>) -> Self {
        Self {
            t,
            backends: Arc::new(backends),
            reg,
        }
    }

    /// The bucket actually holding remote data: either the bucket itself
    /// or its `backend_bck` indirection.
    pub fn remote_bck(&self, bck: &Bck) -> Result<Option<Bck>> {
        let props = self.t.init_bck(bck)?;
        if let Some(real) = &props.backend_bck {
            return Ok(Some(real.clone()));
        }
        if bck.is_remote() {
            return Ok(Some(bck.clone()));
        }
        Ok(None)
    }

    pub fn backend(&self, remote: &Bck) -> Result<Arc<dyn Backend>> {
        self.backends.get(remote.provider)
    }

    fn lom(&self, bck: &Bck, name: &str) -> Result<Box<Lom>> {
        let mut lom = alloc_lom();
        if let Err(e) = lom.init(&self.t, bck, name) {
            free_lom(lom);
            return Err(e);
        }
        Ok(lom)
    }

    //
    // GET
    //

    /// Warm-or-cold read of the whole object. `validate` re-checksums
    /// the bytes against the stored checksum.
    pub async fn get_object(
        &self,
        bck: &Bck,
        name: &str,
        validate: bool,
        latest_ver: bool,
    ) -> Result<(Bytes, ObjAttrs)> {
        let started = Instant::now();
        let remote = self.remote_bck(bck)?;

        if latest_ver {
            if let Some(rbck) = &remote {
                self.refresh_if_version_changed(bck, name, rbck).await?;
            }
        }

        match self.read_local(bck, name, validate).await {
            Ok(found) => {
                self.t.stats.inc(named::GET_COUNT);
                self.t.stats.add(named::GET_SIZE, found.0.len() as i64);
                self.t.stats.add_latency(named::GET_LATENCY, started.elapsed());
                Ok(found)
            }
            Err(e) if e.is_not_found() || e.is_lmeta_fault() => {
                let Some(rbck) = remote else {
                    self.t.stats.inc_err("get");
                    return Err(Error::ObjNotFound(bck.cname(name)));
                };
                self.cold_get(bck, name, &rbck).await?;
                let found = self.read_local(bck, name, validate).await?;
                self.t.stats.inc(named::GET_COUNT);
                self.t.stats.add_latency(named::GET_LATENCY, started.elapsed());
                Ok(found)
            }
            Err(e) => {
                self.t.stats.inc_err("get");
                Err(e)
            }
        }
    }

    async fn read_local(&self, bck: &Bck, name: &str, validate: bool) -> Result<(Bytes, ObjAttrs)> {
        let this = self.clone();
        let bck = bck.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            let mut lom = this.lom(&bck, &name)?;
            lom.lock(false);
            let res = (|| {
                lom.load(true, true)?;
                let data = std::fs::read(lom.fqn())
                    .map_err(|e| Error::io(format!("read {}", lom.fqn().display()), e))?;
                if validate {
                    if let Some(cksum) = lom.cksum() {
                        shoal_core::save::validate(&data, cksum, &lom.cname())?;
                    }
                }
                lom.touch_atime();
                Ok((Bytes::from(data), lom.md.attrs.clone()))
            })();
            lom.unlock(false);
            free_lom(lom);
            res
        })
        .await
        .map_err(|e| Error::Fatal(format!("read task: {e}")))?
    }

    /// Download from the backend and persist via workfile+rename.
    pub async fn cold_get(&self, bck: &Bck, name: &str, rbck: &Bck) -> Result<ObjAttrs> {
        let backend = self.backend(rbck)?;
        let mut reader = backend.get_obj_reader(rbck, name, 0, None).await?;

        // stream into the work file, checksumming on the way
        let props = self.t.init_bck(bck)?;
        let work_ct = {
            let this = self.clone();
            let (bck, name) = (bck.clone(), name.to_string());
            tokio::task::spawn_blocking(move || {
                Ct::new(&this.t, &bck, &name, ContentType::Work, &[])
            })
            .await
            .map_err(|e| Error::Fatal(format!("work-fqn task: {e}")))??
        };
        if let Some(parent) = work_ct.fqn().parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(format!("mkdir {}", parent.display()), e))?;
        }
        let mut file = tokio::fs::File::create(work_ct.fqn())
            .await
            .map_err(|e| Error::io(format!("create {}", work_ct.fqn().display()), e))?;
        let mut hash = CksumHash::new(props.cksum.ty);
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = reader
                .stream
                .read(&mut buf)
                .await
                .map_err(|e| Error::io(format!("cold get {}", bck.cname(name)), e))?;
            if n == 0 {
                break;
            }
            hash.update(&buf[..n]);
            file.write_all(&buf[..n])
                .await
                .map_err(|e| Error::io(format!("write {}", work_ct.fqn().display()), e))?;
            size += n as u64;
        }
        file.sync_all()
            .await
            .map_err(|e| Error::io("fsync cold get", e))?;
        drop(file);

        let computed = hash.finalize();
        if props.cksum.validate_cold_get {
            if let (Some(got), Some(md5)) = (&computed, reader.attrs.get_custom(custom::MD5)) {
                if got.ty == shoal_common::CksumType::Md5 && got.value != md5.to_lowercase() {
                    let _ = std::fs::remove_file(work_ct.fqn());
                    return Err(Error::bad_cksum(&bck.cname(name), md5, &got.value));
                }
            }
        }

        // finalize: rename + persist metadata under the exclusive lock
        let this = self.clone();
        let (bck2, name2) = (bck.clone(), name.to_string());
        let mut attrs = reader.attrs.clone();
        attrs.size = size;
        attrs.cksum = computed;
        let out = attrs.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut lom = this.lom(&bck2, &name2)?;
            lom.lock(true);
            let res = (|| {
                rename_atomic(work_ct.fqn(), lom.fqn())?;
                lom.set_attrs_from(&attrs);
                lom.persist()
            })();
            lom.unlock(true);
            free_lom(lom);
            res
        })
        .await
        .map_err(|e| Error::Fatal(format!("cold-get finalize task: {e}")))??;

        self.t.stats.inc(named::COLD_GET_COUNT);
        self.t.stats.add(named::COLD_GET_SIZE, size as i64);
        debug!(cname = %bck.cname(name), size, "cold get");
        Ok(out)
    }

    /// `latest_ver` support: HEAD the remote and drop the cached copy
    /// when the version changed (or the object is gone).
    async fn refresh_if_version_changed(&self, bck: &Bck, name: &str, rbck: &Bck) -> Result<()> {
        let backend = self.backend(rbck)?;
        let remote_attrs = match backend.head_obj(rbck, name).await {
            Ok(a) => a,
            Err(e) if e.is_not_found() => {
                self.delete_object(bck, name, true).await.ok();
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let this = self.clone();
        let (bck2, name2) = (bck.clone(), name.to_string());
        let changed = tokio::task::spawn_blocking(move || {
            let mut lom = match this.lom(&bck2, &name2) {
                Ok(l) => l,
                Err(_) => return false,
            };
            lom.lock(false);
            let changed = match lom.load(true, true) {
                Ok(()) => lom.check_eq(&remote_attrs).is_err(),
                Err(_) => false,
            };
            lom.unlock(false);
            free_lom(lom);
            changed
        })
        .await
        .unwrap_or(false);
        if changed {
            self.t.stats.inc(named::VERSION_CHANGED_COUNT);
            info!(cname = %bck.cname(name), "remote version changed, invalidating cached copy");
            self.delete_object(bck, name, true).await.ok();
        }
        Ok(())
    }

    //
    // PUT
    //

    /// Write the whole object: workfile → checksum → rename → metadata.
    /// Remote buckets are written through first; the remote version wins.
    pub async fn put_object(&self, bck: &Bck, name: &str, body: Bytes, owt: Owt) -> Result<ObjVersion> {
        let started = Instant::now();
        let props = self.t.init_bck(bck)?;
        if !props.allows(shoal_common::types::access::PUT) {
            return Err(Error::AuthFailed(format!("{bck}: PUT access denied")));
        }
        let mut remote_version = None;
        if owt == Owt::Put {
            if let Some(rbck) = self.remote_bck(bck)? {
                let backend = self.backend(&rbck)?;
                remote_version = backend
                    .put_obj(&rbck, name, body.clone(), &ObjAttrs::default())
                    .await?;
            }
        }

        let this = self.clone();
        let (bck2, name2) = (bck.clone(), name.to_string());
        let cksum_ty = props.cksum.ty;
        let nbytes = body.len() as i64;
        let fsync = props.write_policy.data == shoal_common::WritePolicy::Immediate;
        let version = tokio::task::spawn_blocking(move || -> Result<ObjVersion> {
            let mut lom = this.lom(&bck2, &name2)?;
            let work = Ct::new(&this.t, &bck2, &name2, ContentType::Work, &[])?;
            let (size, cksum) =
                save_reader(work.fqn(), &mut std::io::Cursor::new(&body[..]), cksum_ty, fsync)?;

            lom.lock(true);
            let res = (|| -> Result<ObjVersion> {
                // the previous version carries forward across overwrites
                let prev_version = match lom.load(false, true) {
                    Ok(()) => lom.md.attrs.version.take(),
                    Err(_) => None,
                };
                rename_atomic(work.fqn(), lom.fqn())?;
                lom.md = Default::default();
                lom.md.attrs.version = prev_version;
                lom.md.attrs.size = size;
                lom.md.attrs.cksum = cksum;
                lom.md.attrs.atime_ns = now_ns();
                lom.md.mtime_ns = now_ns();
                lom.set_version_next(remote_version);
                lom.persist()?;
                Ok(lom.version().cloned().expect("version set on every put"))
            })();
            lom.unlock(true);
            free_lom(lom);
            res
        })
        .await
        .map_err(|e| Error::Fatal(format!("put task: {e}")))??;

        self.t.stats.inc(named::PUT_COUNT);
        self.t.stats.add(named::PUT_SIZE, nbytes);
        self.t.stats.add_latency(named::PUT_LATENCY, started.elapsed());
        Ok(version)
    }

    //
    // HEAD / DELETE
    //

    /// Local attributes when present, remote HEAD otherwise.
    pub async fn head_object(&self, bck: &Bck, name: &str) -> Result<ObjAttrs> {
        let this = self.clone();
        let (bck2, name2) = (bck.clone(), name.to_string());
        let local = tokio::task::spawn_blocking(move || -> Result<ObjAttrs> {
            let mut lom = this.lom(&bck2, &name2)?;
            lom.lock(false);
            let res = lom.load(true, true).map(|()| lom.md.attrs.clone());
            lom.unlock(false);
            free_lom(lom);
            res
        })
        .await
        .map_err(|e| Error::Fatal(format!("head task: {e}")))?;
        match local {
            Ok(attrs) => Ok(attrs),
            Err(e) if e.is_not_found() || e.is_lmeta_fault() => match self.remote_bck(bck)? {
                Some(rbck) => self.backend(&rbck)?.head_obj(&rbck, name).await,
                None => Err(Error::ObjNotFound(bck.cname(name))),
            },
            Err(e) => Err(e),
        }
    }

    /// Evict removes the local replica only; delete also forwards to the
    /// backend.
    pub async fn delete_object(&self, bck: &Bck, name: &str, evict: bool) -> Result<()> {
        let this = self.clone();
        let (bck2, name2) = (bck.clone(), name.to_string());
        let existed_locally = tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut lom = this.lom(&bck2, &name2)?;
            lom.lock(true);
            let res = (|| -> Result<bool> {
                let existed = match lom.load(false, true) {
                    Ok(()) => true,
                    Err(e) if e.is_not_found() => false,
                    Err(e) if e.is_lmeta_fault() => true,
                    Err(e) => return Err(e),
                };
                lom.remove_all()?;
                Ok(existed)
            })();
            lom.unlock(true);
            free_lom(lom);
            res
        })
        .await
        .map_err(|e| Error::Fatal(format!("delete task: {e}")))??;

        let mut existed = existed_locally;
        if !evict {
            if let Some(rbck) = self.remote_bck(bck)? {
                match self.backend(&rbck)?.delete_obj(&rbck, name).await {
                    Ok(()) => existed = true,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        if !existed {
            return Err(Error::ObjNotFound(bck.cname(name)));
        }
        self.t.stats.inc(named::DELETE_COUNT);
        Ok(())
    }

    /// Local rename within a bucket (used by bucket rename to move
    /// every object into the destination bucket's tree).
    pub fn rename_local(&self, src_bck: &Bck, dst_bck: &Bck, name: &str) -> Result<()> {
        let mut src = self.lom(src_bck, name)?;
        let mut dst = self.lom(dst_bck, name)?;
        src.lock(true);
        let res = (|| -> Result<()> {
            src.load(false, true)?;
            rename_atomic(src.fqn(), dst.fqn())?;
            dst.md = src.md.clone();
            dst.persist()?;
            src.remove_main()
        })();
        src.unlock(true);
        free_lom(dst);
        free_lom(src);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_backend::mem::MemBackend;
    use shoal_common::types::BckProps;
    use shoal_common::{CksumType, Config, Provider};
    use tempfile::TempDir;

    async fn test_target(nmp: usize) -> (Target, Arc<MemBackend>, Vec<TempDir>) {
        let dirs: Vec<TempDir> = (0..nmp).map(|_| TempDir::new().unwrap()).collect();
        let paths: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let t = Tcore::new("t1", Config::default(), &paths).unwrap();
        t.bmd
            .write()
            .add(Bck::ais("t1-bck"), BckProps::default())
            .unwrap();
        let mem = Arc::new(MemBackend::new(Provider::S3));
        let mut backends = Backends::default();
        backends.register(mem.clone());
        (
            Target::new(t, backends, Arc::new(XactRegistry::new())),
            mem,
            dirs,
        )
    }

    #[tokio::test]
    async fn test_put_get_delete_roundtrip() {
        let (tgt, _mem, _dirs) = test_target(2).await;
        let bck = Bck::ais("t1-bck");
        let body = Bytes::from(vec![0u8; 4096]);

        let v = tgt.put_object(&bck, "k1", body.clone(), Owt::Put).await.unwrap();
        assert_eq!(v, ObjVersion::Local(1));

        let (got, attrs) = tgt.get_object(&bck, "k1", true, false).await.unwrap();
        assert_eq!(got, body);
        assert_eq!(attrs.size, 4096);
        assert_eq!(attrs.cksum.as_ref().unwrap().ty, CksumType::XXHash);

        tgt.delete_object(&bck, "k1", false).await.unwrap();
        assert!(matches!(
            tgt.head_object(&bck, "k1").await,
            Err(Error::ObjNotFound(_))
        ));
        assert!(matches!(
            tgt.delete_object(&bck, "k1", false).await,
            Err(Error::ObjNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_overwrite_bumps_local_version() {
        let (tgt, _mem, _dirs) = test_target(1).await;
        let bck = Bck::ais("t1-bck");
        let v1 = tgt
            .put_object(&bck, "k", Bytes::from_static(b"one"), Owt::Put)
            .await
            .unwrap();
        let v2 = tgt
            .put_object(&bck, "k", Bytes::from_static(b"two"), Owt::Put)
            .await
            .unwrap();
        assert_eq!(v1, ObjVersion::Local(1));
        assert_eq!(v2, ObjVersion::Local(2));
    }

    #[tokio::test]
    async fn test_corrupted_get_with_validation() {
        let (tgt, _mem, _dirs) = test_target(1).await;
        let bck = Bck::ais("t1-bck");
        let body: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
        tgt.put_object(&bck, "k2", Bytes::from(body), Owt::Put).await.unwrap();

        // clobber the on-disk body behind the LOM's back
        let mut lom = alloc_lom();
        lom.init(&tgt.t, &bck, "k2").unwrap();
        std::fs::write(lom.fqn(), b"this file has been corrupted").unwrap();
        free_lom(lom);

        let err = tgt.get_object(&bck, "k2", true, false).await.unwrap_err();
        assert!(err.to_string().contains("checksum"), "{err}");

        let (bytes, _) = tgt.get_object(&bck, "k2", false, false).await.unwrap();
        assert_eq!(&bytes[..], b"this file has been corrupted");
    }

    #[tokio::test]
    async fn test_cold_get_from_remote() {
        let (tgt, mem, _dirs) = test_target(2).await;
        mem.create_bucket("remote");
        mem.put_direct("remote", "obj-1", b"remote-bytes".to_vec());
        let bck = Bck::new(Provider::S3, "remote");

        let (bytes, attrs) = tgt.get_object(&bck, "obj-1", true, false).await.unwrap();
        assert_eq!(&bytes[..], b"remote-bytes");
        assert!(matches!(attrs.version, Some(ObjVersion::Remote(_))));
        assert_eq!(tgt.t.stats.get(named::COLD_GET_COUNT), 1);

        // warm now: no second cold get
        let _ = tgt.get_object(&bck, "obj-1", true, false).await.unwrap();
        assert_eq!(tgt.t.stats.get(named::COLD_GET_COUNT), 1);
    }

    #[tokio::test]
    async fn test_evict_keeps_remote() {
        let (tgt, mem, _dirs) = test_target(1).await;
        mem.create_bucket("remote");
        mem.put_direct("remote", "obj", b"stays-remote".to_vec());
        let bck = Bck::new(Provider::S3, "remote");

        tgt.get_object(&bck, "obj", false, false).await.unwrap();
        tgt.delete_object(&bck, "obj", true).await.unwrap();
        assert_eq!(mem.object_count("remote"), 1, "evict never reaches the backend");

        tgt.delete_object(&bck, "obj", false).await.unwrap();
        assert_eq!(mem.object_count("remote"), 0, "delete does");
    }

    #[tokio::test]
    async fn test_latest_ver_detects_change() {
        let (tgt, mem, _dirs) = test_target(1).await;
        mem.create_bucket("remote");
        mem.put_direct("remote", "obj", b"v1".to_vec());
        let bck = Bck::new(Provider::S3, "remote");

        let (b1, _) = tgt.get_object(&bck, "obj", false, true).await.unwrap();
        assert_eq!(&b1[..], b"v1");

        mem.put_direct("remote", "obj", b"v2-longer".to_vec());
        let (b2, _) = tgt.get_object(&bck, "obj", false, true).await.unwrap();
        assert_eq!(&b2[..], b"v2-longer", "version change re-fetches");
        assert_eq!(tgt.t.stats.get(named::VERSION_CHANGED_COUNT), 1);
    }
}
