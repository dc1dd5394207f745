//! Copy / transform: whole bucket (TCB) and multi-object (TCO)
//!
//! One worker pool either walks the source bucket or iterates a
//! `ListRange`; each object is read, optionally piped through the ETL
//! pipeline, and written to the destination under `prepend + name`.

use crate::etl::EtlPipeline;
use crate::ratelim::{AdaptiveLim, TokenBucket};
use crate::{effective_workers, on_obj_err};
use shoal_common::msg::{lso_flags, LsoMsg, TcbMsg, TcoMsg};
use shoal_common::{Bck, Result};
use shoal_tgt::lso::lso_local;
use shoal_tgt::{Owt, Target};
use shoal_xact::XactBase;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

/// Copy/transform the entire source bucket.
pub async fn run_tcb(
    tgt: &Target,
    x: &Arc<XactBase>,
    src: &Bck,
    dst: &Bck,
    msg: &TcbMsg,
    etl: EtlPipeline,
) -> Result<()> {
    x.run();
    ensure_dst(tgt, src, dst)?;

    // page through the (cached) source listing
    let mut names = Vec::new();
    let mut lso = LsoMsg {
        prefix: msg.prefix.clone(),
        flags: lso_flags::CACHED,
        ..Default::default()
    };
    loop {
        let out = lso_local(tgt, src, &lso)?;
        names.extend(out.entries.into_iter().map(|e| e.name));
        if out.continuation_token.is_empty() {
            break;
        }
        lso.continuation_token = out.continuation_token;
    }

    copy_list(tgt, x, src, dst, msg, etl, names.clone()).await?;

    if msg.sync && !x.is_aborted() {
        sync_deletions(tgt, x, dst, msg, &names).await;
    }
    x.finish();
    Ok(())
}

/// Copy/transform a fixed multi-object selection.
pub async fn run_tco(
    tgt: &Target,
    x: &Arc<XactBase>,
    src: &Bck,
    dst: &Bck,
    msg: &TcoMsg,
    etl: EtlPipeline,
) -> Result<()> {
    x.run();
    ensure_dst(tgt, src, dst)?;
    let names = msg.list_range.names()?;
    copy_list(tgt, x, src, dst, &msg.tcb, etl, names).await?;
    x.finish();
    Ok(())
}

fn ensure_dst(tgt: &Target, src: &Bck, dst: &Bck) -> Result<()> {
    if !dst.is_ais() || tgt.t.bmd.read().exists(dst) {
        return Ok(());
    }
    // auto-create, inheriting the source properties
    let props = tgt
        .t
        .bmd
        .read()
        .lookup(src)
        .map(|p| (*p).clone())
        .unwrap_or_default();
    let mut bmd = tgt.t.bmd.write();
    if !bmd.exists(dst) {
        bmd.add(dst.clone(), props)?;
    }
    Ok(())
}

async fn copy_list(
    tgt: &Target,
    x: &Arc<XactBase>,
    src: &Bck,
    dst: &Bck,
    msg: &TcbMsg,
    etl: EtlPipeline,
    names: Vec<String>,
) -> Result<()> {
    let workers = effective_workers(msg.num_workers, tgt.t.mfs.len());
    let sem = Arc::new(Semaphore::new(workers));
    let front_lim = tgt
        .t
        .bmd
        .read()
        .lookup(src)
        .and_then(|p| TokenBucket::from_conf(&p.rate_limit))
        .map(Arc::new);
    let back_lim = Arc::new(AdaptiveLim::new());
    info!(name = %x.name(), n = names.len(), workers, "copy: starting");

    let mut tasks = Vec::new();
    for name in names {
        if x.is_aborted() {
            break;
        }
        let permit = sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closes");
        let (tgt, x, src, dst, msg, etl) = (
            tgt.clone(),
            Arc::clone(x),
            src.clone(),
            dst.clone(),
            msg.clone(),
            etl.clone(),
        );
        let front_lim = front_lim.clone();
        let back_lim = Arc::clone(&back_lim);
        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            if let Some(tb) = front_lim.as_deref() {
                let wait = tb.acquire();
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
            copy_one(&tgt, &x, &src, &dst, &msg, &etl, &back_lim, &name).await;
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn copy_one(
    tgt: &Target,
    x: &Arc<XactBase>,
    src: &Bck,
    dst: &Bck,
    msg: &TcbMsg,
    etl: &EtlPipeline,
    back_lim: &AdaptiveLim,
    name: &str,
) {
    if x.is_aborted() {
        return;
    }
    back_lim.pace().await;
    let got = tgt.get_object(src, name, false, msg.latest_ver).await;
    let (bytes, _attrs) = match got {
        Ok(v) => {
            back_lim.on_ok();
            v
        }
        Err(e) => {
            if e.is_transient() {
                back_lim.on_transient_err();
            }
            on_obj_err(x, &src.cname(name), &e, msg.continue_on_error);
            return;
        }
    };
    let size = bytes.len() as i64;
    x.objs_in_add(1, size);

    let out = match etl.transform(name, bytes).await {
        Ok(out) => out,
        Err(e) => {
            on_obj_err(x, &src.cname(name), &e, msg.continue_on_error);
            return;
        }
    };
    if msg.dry_run {
        x.objs_add(1, size);
        return;
    }
    let dst_name = format!("{}{name}", msg.prepend);
    match tgt.put_object(dst, &dst_name, out, Owt::Put).await {
        Ok(_) => {
            x.objs_out_add(1, size);
            x.objs_add(1, size);
        }
        Err(e) => {
            on_obj_err(x, &dst.cname(&dst_name), &e, msg.continue_on_error);
        }
    }
}

/// `sync`: destination objects with no source counterpart are deleted.
async fn sync_deletions(tgt: &Target, x: &Arc<XactBase>, dst: &Bck, msg: &TcbMsg, src_names: &[String]) {
    let Ok(out) = lso_local(
        tgt,
        dst,
        &LsoMsg {
            flags: lso_flags::NAME_ONLY,
            page_size: 0,
            ..Default::default()
        },
    ) else {
        return;
    };
    for entry in out.entries {
        let src_equiv = entry
            .name
            .strip_prefix(&msg.prepend)
            .unwrap_or(&entry.name)
            .to_string();
        if !src_names.contains(&src_equiv) {
            if let Err(e) = tgt.delete_object(dst, &entry.name, false).await {
                x.add_err(format!("sync {}: {e}", dst.cname(&entry.name)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shoal_backend::Backends;
    use shoal_common::types::BckProps;
    use shoal_common::Config;
    use shoal_core::Tcore;
    use shoal_xact::{kind, XactRegistry};
    use tempfile::TempDir;

    async fn seeded(n: usize) -> (Target, Bck, Vec<TempDir>) {
        let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
        let paths: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let t = Tcore::new("t1", Config::default(), &paths).unwrap();
        let src = Bck::ais("src");
        t.bmd.write().add(src.clone(), BckProps::default()).unwrap();
        let tgt = Target::new(t, Backends::default(), Arc::new(XactRegistry::new()));
        for i in 0..n {
            tgt.put_object(&src, &format!("obj-{i:03}"), Bytes::from(format!("payload-{i}")), Owt::Put)
                .await
                .unwrap();
        }
        (tgt, src, dirs)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tcb_copies_whole_bucket() {
        let (tgt, src, _dirs) = seeded(25).await;
        let dst = Bck::ais("dst");
        let x = XactBase::new("", kind::TCB, Some(dst.clone()), "");
        run_tcb(&tgt, &x, &src, &dst, &TcbMsg::default(), EtlPipeline::identity())
            .await
            .unwrap();
        assert!(x.finished());
        assert_eq!(x.snap().objs_added, 25);
        assert!(tgt.t.bmd.read().exists(&dst), "destination auto-created");

        let (bytes, _) = tgt.get_object(&dst, "obj-013", true, false).await.unwrap();
        assert_eq!(&bytes[..], b"payload-13");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tco_template_with_prepend() {
        let (tgt, src, _dirs) = seeded(20).await;
        let dst = Bck::ais("dst");
        let msg = TcoMsg {
            tcb: TcbMsg {
                prepend: "copied/".into(),
                num_workers: 4,
                ..Default::default()
            },
            list_range: shoal_common::msg::ListRange {
                template: "obj-{005..009}".into(),
                objnames: vec![],
            },
        };
        let x = XactBase::new("", kind::TCO, Some(dst.clone()), "");
        run_tco(&tgt, &x, &src, &dst, &msg, EtlPipeline::identity())
            .await
            .unwrap();
        assert_eq!(x.snap().objs_added, 5);
        let (bytes, _) = tgt
            .get_object(&dst, "copied/obj-007", true, false)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"payload-7");
        assert!(tgt.get_object(&dst, "copied/obj-004", false, false).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_source_nonfatal() {
        let (tgt, src, _dirs) = seeded(2).await;
        let dst = Bck::ais("dst");
        let msg = TcoMsg {
            list_range: shoal_common::msg::ListRange {
                objnames: vec!["obj-000".into(), "ghost".into(), "obj-001".into()],
                template: String::new(),
            },
            ..Default::default()
        };
        let x = XactBase::new("", kind::TCO, Some(dst.clone()), "");
        run_tco(&tgt, &x, &src, &dst, &msg, EtlPipeline::identity())
            .await
            .unwrap();
        assert!(x.finished(), "not-found never aborts");
        assert_eq!(x.snap().objs_added, 2);
        assert_eq!(x.snap().errs.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dry_run_writes_nothing() {
        let (tgt, src, _dirs) = seeded(3).await;
        let dst = Bck::ais("dst");
        let msg = TcbMsg {
            dry_run: true,
            ..Default::default()
        };
        let x = XactBase::new("", kind::TCB, Some(dst.clone()), "");
        run_tcb(&tgt, &x, &src, &dst, &msg, EtlPipeline::identity())
            .await
            .unwrap();
        assert_eq!(x.snap().objs_added, 3);
        assert!(tgt.get_object(&dst, "obj-000", false, false).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_propagates_deletions() {
        let (tgt, src, _dirs) = seeded(3).await;
        let dst = Bck::ais("dst");

        // first copy, then remove one source object and re-run with sync
        let x = XactBase::new("", kind::TCB, Some(dst.clone()), "");
        run_tcb(&tgt, &x, &src, &dst, &TcbMsg::default(), EtlPipeline::identity())
            .await
            .unwrap();
        tgt.delete_object(&src, "obj-001", false).await.unwrap();

        let msg = TcbMsg {
            sync: true,
            ..Default::default()
        };
        let x = XactBase::new("", kind::TCB, Some(dst.clone()), "");
        run_tcb(&tgt, &x, &src, &dst, &msg, EtlPipeline::identity())
            .await
            .unwrap();
        assert!(tgt.get_object(&dst, "obj-001", false, false).await.is_err());
        assert!(tgt.get_object(&dst, "obj-000", false, false).await.is_ok());
    }
}
