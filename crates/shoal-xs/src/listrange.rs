//! Multi-object delete and evict
//!
//! Deletion removes the object everywhere (cluster and backend); evict
//! drops the local replica only. Selection is a `ListRange`; empty means
//! the entire bucket.

use crate::{effective_workers, on_obj_err};
use shoal_common::msg::{lso_flags, ListRange, LsoMsg};
use shoal_common::{Bck, Result};
use shoal_tgt::lso::lso_local;
use shoal_tgt::Target;
use shoal_xact::XactBase;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

pub async fn run_delete_evict(
    tgt: &Target,
    x: &Arc<XactBase>,
    bck: &Bck,
    lr: &ListRange,
    evict: bool,
    continue_on_error: bool,
) -> Result<()> {
    x.run();
    let names = if lr.is_entire_bucket() {
        let mut names = Vec::new();
        let mut msg = LsoMsg {
            flags: lso_flags::NAME_ONLY | lso_flags::CACHED,
            ..Default::default()
        };
        loop {
            let out = lso_local(tgt, bck, &msg)?;
            names.extend(out.entries.into_iter().map(|e| e.name));
            if out.continuation_token.is_empty() {
                break;
            }
            msg.continuation_token = out.continuation_token;
        }
        names
    } else {
        lr.names()?
    };

    let workers = effective_workers(0, tgt.t.mfs.len());
    let sem = Arc::new(Semaphore::new(workers));
    info!(name = %x.name(), n = names.len(), evict, "delete/evict: starting");

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
        let (tgt, x, bck) = (tgt.clone(), Arc::clone(x), bck.clone());
        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            match tgt.delete_object(&bck, &name, evict).await {
                Ok(()) => x.objs_add(1, 0),
                Err(e) => {
                    on_obj_err(&x, &bck.cname(&name), &e, continue_on_error);
                }
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
    if !x.is_aborted() {
        x.finish();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shoal_backend::mem::MemBackend;
    use shoal_backend::Backends;
    use shoal_common::types::BckProps;
    use shoal_common::{Config, Provider};
    use shoal_core::Tcore;
    use shoal_tgt::Owt;
    use shoal_xact::{kind, XactRegistry};
    use tempfile::TempDir;

    async fn seeded() -> (Target, Bck, Vec<TempDir>) {
        let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
        let paths: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let t = Tcore::new("t1", Config::default(), &paths).unwrap();
        let bck = Bck::ais("data");
        t.bmd.write().add(bck.clone(), BckProps::default()).unwrap();
        let tgt = Target::new(t, Backends::default(), Arc::new(XactRegistry::new()));
        for i in 0..100 {
            tgt.put_object(&bck, &format!("tstf-{i:04}"), Bytes::from_static(b"x"), Owt::Put)
                .await
                .unwrap();
        }
        (tgt, bck, dirs)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_template_range() {
        let (tgt, bck, _dirs) = seeded().await;
        let lr = ListRange {
            template: "tstf-{0025..0033}".into(),
            objnames: vec![],
        };
        let x = XactBase::new("", kind::DELETE, Some(bck.clone()), "");
        run_delete_evict(&tgt, &x, &bck, &lr, false, false).await.unwrap();
        assert!(x.finished());
        assert_eq!(x.snap().objs_added, 9);

        let out = lso_local(&tgt, &bck, &LsoMsg::default()).unwrap();
        assert_eq!(out.entries.len(), 91);
        for i in 25..=33 {
            let name = format!("tstf-{i:04}");
            assert!(!out.entries.iter().any(|e| e.name == name), "{name} must be gone");
        }
        assert!(out.entries.iter().any(|e| e.name == "tstf-0024"));
        assert!(out.entries.iter().any(|e| e.name == "tstf-0034"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_evict_keeps_backend_copy() {
        let dirs: Vec<TempDir> = (0..1).map(|_| TempDir::new().unwrap()).collect();
        let paths: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let t = Tcore::new("t1", Config::default(), &paths).unwrap();
        let mem = Arc::new(MemBackend::new(Provider::S3));
        mem.create_bucket("rem");
        for i in 0..6 {
            mem.put_direct("rem", &format!("o{i}"), b"r".to_vec());
        }
        let mut backends = Backends::default();
        backends.register(mem.clone());
        let tgt = Target::new(t, backends, Arc::new(XactRegistry::new()));
        let bck = Bck::new(Provider::S3, "rem");
        for i in 0..6 {
            tgt.get_object(&bck, &format!("o{i}"), false, false).await.unwrap();
        }

        let x = XactBase::new("", kind::EVICT, Some(bck.clone()), "");
        run_delete_evict(&tgt, &x, &bck, &ListRange::default(), true, false)
            .await
            .unwrap();
        assert_eq!(x.snap().objs_added, 6);
        assert_eq!(mem.object_count("rem"), 6, "evict leaves the backend intact");
        let out = lso_local(&tgt, &bck, &LsoMsg::default()).unwrap();
        assert!(out.entries.is_empty(), "local copies are gone");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_objects_reported_nonfatal() {
        let (tgt, bck, _dirs) = seeded().await;
        let lr = ListRange {
            objnames: vec!["tstf-0000".into(), "never-existed".into()],
            template: String::new(),
        };
        let x = XactBase::new("", kind::DELETE, Some(bck.clone()), "");
        run_delete_evict(&tgt, &x, &bck, &lr, false, false).await.unwrap();
        assert!(x.finished());
        assert_eq!(x.snap().objs_added, 1);
        assert_eq!(x.snap().errs.len(), 1);
    }
}
