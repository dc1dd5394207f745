//! Bucket-level operations: create, destroy, rename, property updates

use crate::Node;
use shoal_common::msg::{lso_flags, LsoMsg};
use shoal_common::{Bck, BpropsToSet, Error, Result};
use shoal_fs::ContentType;
use shoal_tgt::lso::lso_local;
use shoal_xact::{kind, RenewRes};
use std::sync::Arc;
use tracing::info;

impl Node {
    pub fn create_bucket(&self, bck: &Bck, to_set: Option<&BpropsToSet>) -> Result<()> {
        if bck.is_remote() {
            return Err(Error::Fatal(format!(
                "{bck}: remote buckets are added on first touch, not created"
            )));
        }
        let mut props = self.tgt.t.config().bprops.clone();
        if let Some(t) = to_set {
            props.apply(t);
        }
        self.tgt.t.bmd.write().add(bck.clone(), props)?;
        info!(%bck, "bucket created");
        Ok(())
    }

    /// Destroy: the bucket's subtrees retire atomically into each
    /// mountpath's `$deleted` area; cleanup purges them later.
    pub fn destroy_bucket(&self, bck: &Bck) -> Result<()> {
        self.tgt.t.bmd.write().remove(bck)?;
        for mi in self.tgt.t.mfs.available() {
            for ct in ContentType::ALL {
                let dir = mi.make_path_bck(ct, bck);
                mi.move_to_deleted(&dir)?;
            }
        }
        self.tgt.t.lcache.clear();
        info!(%bck, "bucket destroyed");
        Ok(())
    }

    pub fn set_bucket_props(&self, bck: &Bck, to_set: &BpropsToSet) -> Result<()> {
        self.tgt.t.bmd.write().set_props(bck, to_set)?;
        Ok(())
    }

    /// Rename src→dst: create dst with src's properties, move every
    /// object, then drop src. Synchronous (`wait=true` semantics); the
    /// registry still tracks it as an xaction.
    pub async fn rename_bucket(&self, src: &Bck, dst: &Bck) -> Result<String> {
        if !src.is_ais() || !dst.is_ais() {
            return Err(Error::Fatal("rename applies to ais buckets only".into()));
        }
        let props = self
            .tgt
            .t
            .bmd
            .read()
            .lookup(src)
            .ok_or_else(|| Error::BckNotFound(src.clone()))?;
        let x = match self
            .tgt
            .reg
            .renew(kind::MV_BCK, Some(src), "", &format!("{src} => {dst}"))
        {
            RenewRes::New(x) => x,
            RenewRes::UsePrev(prev) => {
                return Err(Error::XactUsePrev(prev.name()));
            }
            RenewRes::Refused(why) => {
                return Err(Error::Fatal(format!("renewal refused: {why}")));
            }
        };
        x.run();
        {
            let mut bmd = self.tgt.t.bmd.write();
            if bmd.exists(dst) {
                let e = Error::AlreadyExists(dst.to_string());
                x.abort(e.to_string());
                return Err(e);
            }
            bmd.add(dst.clone(), (*props).clone())?;
        }

        let res = self.rename_all_objects(src, dst, &x).await;
        match res {
            Ok(moved) => {
                self.tgt.t.bmd.write().remove(src)?;
                self.tgt.t.lcache.clear();
                x.finish();
                info!(%src, %dst, moved, "bucket renamed");
                Ok(x.uuid().to_string())
            }
            Err(e) => {
                x.abort(e.to_string());
                Err(e)
            }
        }
    }

    async fn rename_all_objects(
        &self,
        src: &Bck,
        dst: &Bck,
        x: &Arc<shoal_xact::XactBase>,
    ) -> Result<u64> {
        let mut moved = 0u64;
        let mut msg = LsoMsg {
            flags: lso_flags::NAME_ONLY,
            ..Default::default()
        };
        loop {
            let out = lso_local(&self.tgt, src, &msg)?;
            let token = out.continuation_token.clone();
            for entry in out.entries {
                let tgt = self.tgt.clone();
                let (src2, dst2) = (src.clone(), dst.clone());
                let name = entry.name.clone();
                tokio::task::spawn_blocking(move || tgt.rename_local(&src2, &dst2, &name))
                    .await
                    .map_err(|e| Error::Fatal(format!("rename task: {e}")))??;
                moved += 1;
                x.objs_add(1, 0);
            }
            if token.is_empty() {
                return Ok(moved);
            }
            msg.continuation_token = token;
        }
    }
}
