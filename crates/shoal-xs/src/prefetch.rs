//! Prefetch: warm the cluster with remote objects
//!
//! A worker pool cold-GETs every selected object that is not already
//! cached. Objects at or above `blob_threshold` take the blob path:
//! ranged reads assembled into the work file, sized by the bucket's
//! chunk configuration.

use crate::ratelim::AdaptiveLim;
use crate::{effective_workers, on_obj_err};
use shoal_common::msg::{LsoMsg, PrefetchMsg};
use shoal_common::{Bck, Error, Result};
use shoal_core::lom::{alloc_lom, free_lom, now_ns};
use shoal_core::save::rename_atomic;
use shoal_core::{Ct, Tcore};
use shoal_fs::ContentType;
use shoal_stats::named;
use shoal_tgt::Target;
use shoal_xact::XactBase;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tracing::{debug, info};

pub async fn run_prefetch(
    tgt: &Target,
    x: &Arc<XactBase>,
    bck: &Bck,
    msg: &PrefetchMsg,
) -> Result<()> {
    x.run();
    let Some(rbck) = tgt.remote_bck(bck)? else {
        let e = Error::Fatal(format!("{bck}: prefetch requires a remote backend"));
        x.abort(e.to_string());
        return Err(e);
    };

    let names = if msg.list_range.is_entire_bucket() {
        list_remote_names(tgt, &rbck).await?
    } else {
        msg.list_range.names()?
    };
    let workers = effective_workers(msg.num_workers, tgt.t.mfs.len());
    let sem = Arc::new(Semaphore::new(workers));
    let lim = Arc::new(AdaptiveLim::new());
    info!(name = %x.name(), n = names.len(), workers, "prefetch: starting");

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
        let (tgt, x, bck, rbck, msg) =
            (tgt.clone(), Arc::clone(x), bck.clone(), rbck.clone(), msg.clone());
        let lim = Arc::clone(&lim);
        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            prefetch_one(&tgt, &x, &bck, &rbck, &msg, &lim, &name).await;
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

async fn list_remote_names(tgt: &Target, rbck: &Bck) -> Result<Vec<String>> {
    let backend = tgt.backend(rbck)?;
    let mut names = Vec::new();
    let mut msg = LsoMsg::default();
    loop {
        let mut out = shoal_common::msg::LsoResult::default();
        backend.list_objects(rbck, &msg, &mut out).await?;
        names.extend(out.entries.into_iter().map(|e| e.name));
        if out.continuation_token.is_empty() {
            return Ok(names);
        }
        msg.continuation_token = out.continuation_token;
    }
}

async fn prefetch_one(
    tgt: &Target,
    x: &Arc<XactBase>,
    bck: &Bck,
    rbck: &Bck,
    msg: &PrefetchMsg,
    lim: &AdaptiveLim,
    name: &str,
) {
    if x.is_aborted() {
        return;
    }
    // already cached (and current, unless latest-ver re-checks)?
    if !msg.latest_ver && is_cached(&tgt.t, bck, name) {
        return;
    }
    lim.pace().await;

    let res = async {
        let remote_attrs = tgt.backend(rbck)?.head_obj(rbck, name).await?;
        if msg.latest_ver && cached_matches(&tgt.t, bck, name, &remote_attrs) {
            return Ok(0u64);
        }
        if msg.blob_threshold > 0 && remote_attrs.size >= msg.blob_threshold {
            blob_download(tgt, bck, rbck, name, remote_attrs.size).await
        } else {
            tgt.cold_get(bck, name, rbck).await.map(|a| a.size)
        }
    }
    .await;

    match res {
        Ok(size) => {
            lim.on_ok();
            if size > 0 {
                tgt.t.stats.inc(named::PREFETCH_COUNT);
                tgt.t.stats.add(named::PREFETCH_SIZE, size as i64);
                x.objs_add(1, size as i64);
            }
        }
        Err(e) => {
            if e.is_transient() {
                lim.on_transient_err();
            }
            on_obj_err(x, &bck.cname(name), &e, msg.continue_on_error);
        }
    }
}

fn is_cached(t: &Arc<Tcore>, bck: &Bck, name: &str) -> bool {
    let mut lom = alloc_lom();
    let cached = lom.init(t, bck, name).is_ok() && lom.load(true, false).is_ok();
    free_lom(lom);
    cached
}

fn cached_matches(t: &Arc<Tcore>, bck: &Bck, name: &str, remote: &shoal_common::ObjAttrs) -> bool {
    let mut lom = alloc_lom();
    let same = lom.init(t, bck, name).is_ok()
        && lom.load(true, false).is_ok()
        && lom.check_eq(remote).is_ok();
    free_lom(lom);
    same
}

/// Ranged download assembled into one work file, committed by rename.
async fn blob_download(
    tgt: &Target,
    bck: &Bck,
    rbck: &Bck,
    name: &str,
    total: u64,
) -> Result<u64> {
    let props = tgt.t.init_bck(bck)?;
    let chunk = props.chunk.chunk_size.max(1024 * 1024);
    let backend = tgt.backend(rbck)?;

    let work = Ct::new(&tgt.t, bck, name, ContentType::Work, &[])?;
    if let Some(parent) = work.fqn().parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(format!("mkdir {}", parent.display()), e))?;
    }
    let mut file = tokio::fs::File::create(work.fqn())
        .await
        .map_err(|e| Error::io(format!("create {}", work.fqn().display()), e))?;
    let mut hash = shoal_common::CksumHash::new(props.cksum.ty);
    let mut offset = 0u64;
    let mut attrs = None;
    while offset < total {
        let want = chunk.min(total - offset);
        let mut reader = backend.get_obj_reader(rbck, name, offset, Some(want)).await?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader
                .stream
                .read(&mut buf)
                .await
                .map_err(|e| Error::io(format!("blob range {}", bck.cname(name)), e))?;
            if n == 0 {
                break;
            }
            hash.update(&buf[..n]);
            tokio::io::AsyncWriteExt::write_all(&mut file, &buf[..n])
                .await
                .map_err(|e| Error::io("write blob chunk", e))?;
            offset += n as u64;
        }
        attrs.get_or_insert(reader.attrs);
    }
    file.sync_all()
        .await
        .map_err(|e| Error::io("fsync blob", e))?;
    drop(file);
    debug!(cname = %bck.cname(name), total, "blob download complete");

    let this = tgt.clone();
    let (bck2, name2) = (bck.clone(), name.to_string());
    let cksum = hash.finalize();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut lom = alloc_lom();
        let res = (|| {
            lom.init(&this.t, &bck2, &name2)?;
            lom.lock(true);
            let inner = (|| {
                rename_atomic(work.fqn(), lom.fqn())?;
                if let Some(a) = attrs {
                    lom.md.attrs = a;
                }
                lom.md.attrs.size = total;
                lom.md.attrs.cksum = cksum;
                lom.md.attrs.atime_ns = now_ns();
                lom.persist()
            })();
            lom.unlock(true);
            inner
        })();
        free_lom(lom);
        res
    })
    .await
    .map_err(|e| Error::Fatal(format!("blob finalize task: {e}")))??;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_backend::mem::MemBackend;
    use shoal_backend::Backends;
    use shoal_common::msg::{lso_flags, ListRange};
    use shoal_common::{Config, Provider};
    use shoal_tgt::lso::lso_local;
    use shoal_xact::{kind, XactRegistry};
    use tempfile::TempDir;

    async fn remote_env(n: usize) -> (Target, Arc<MemBackend>, Bck, Vec<TempDir>) {
        let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
        let paths: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let t = Tcore::new("t1", Config::default(), &paths).unwrap();
        let mem = Arc::new(MemBackend::new(Provider::S3));
        mem.create_bucket("rem");
        for i in 0..n {
            mem.put_direct("rem", &format!("obj-{i}"), format!("body-{i}").into_bytes());
        }
        let mut backends = Backends::default();
        backends.register(mem.clone());
        let tgt = Target::new(t, backends, Arc::new(XactRegistry::new()));
        (tgt, mem, Bck::new(Provider::S3, "rem"), dirs)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prefetch_template_range() {
        let (tgt, _mem, bck, _dirs) = remote_env(200).await;
        let msg = PrefetchMsg {
            list_range: ListRange {
                template: "obj-{1..150}".into(),
                objnames: vec![],
            },
            num_workers: 8,
            ..Default::default()
        };
        let x = XactBase::new("", kind::PREFETCH, Some(bck.clone()), "");
        run_prefetch(&tgt, &x, &bck, &msg).await.unwrap();
        assert!(x.finished());
        assert_eq!(x.snap().objs_added, 150);

        // cached listing returns exactly the prefetched range
        let out = lso_local(
            &tgt,
            &bck,
            &LsoMsg {
                flags: lso_flags::CACHED,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(out.entries.len(), 150);
        for e in &out.entries {
            let n: u64 = e.name.strip_prefix("obj-").unwrap().parse().unwrap();
            assert!((1..=150).contains(&n));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prefetch_skips_cached() {
        let (tgt, _mem, bck, _dirs) = remote_env(5).await;
        let msg = PrefetchMsg {
            list_range: ListRange {
                objnames: vec!["obj-0".into(), "obj-1".into()],
                template: String::new(),
            },
            ..Default::default()
        };
        let x = XactBase::new("", kind::PREFETCH, Some(bck.clone()), "");
        run_prefetch(&tgt, &x, &bck, &msg).await.unwrap();
        assert_eq!(x.snap().objs_added, 2);

        let x2 = XactBase::new("", kind::PREFETCH, Some(bck.clone()), "");
        run_prefetch(&tgt, &x2, &bck, &msg).await.unwrap();
        assert_eq!(x2.snap().objs_added, 0, "second prefetch finds all cached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blob_threshold_path() {
        let (tgt, mem, bck, _dirs) = remote_env(0).await;
        let big: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
        mem.put_direct("rem", "big-blob", big.clone());

        let msg = PrefetchMsg {
            list_range: ListRange {
                objnames: vec!["big-blob".into()],
                template: String::new(),
            },
            blob_threshold: 1_000_000,
            ..Default::default()
        };
        let x = XactBase::new("", kind::PREFETCH, Some(bck.clone()), "");
        run_prefetch(&tgt, &x, &bck, &msg).await.unwrap();
        assert_eq!(x.snap().bytes_added, 3_000_000);

        let (bytes, _) = tgt.get_object(&bck, "big-blob", true, false).await.unwrap();
        assert_eq!(&bytes[..], &big[..], "ranged assembly is byte-exact");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_entire_bucket_prefetch() {
        let (tgt, _mem, bck, _dirs) = remote_env(7).await;
        let msg = PrefetchMsg::default();
        let x = XactBase::new("", kind::PREFETCH, Some(bck.clone()), "");
        run_prefetch(&tgt, &x, &bck, &msg).await.unwrap();
        assert_eq!(x.snap().objs_added, 7);
    }
}
