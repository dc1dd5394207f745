//! Rebalance: restore HRW placement across targets
//!
//! Each target walks its mountpaths and streams every object it no
//! longer owns to the new owner over the bundle; the receiver persists
//! with migrate semantics (attributes travel in the header, versions are
//! kept). Termination is sentinel-driven: local walk done → broadcast
//! `DONE`; quiescence completes when every peer reported done; progress
//! pings keep slow peers alive and stalled peers abort the job.

use crate::sentinel::Sentinel;
use async_trait::async_trait;
use shoal_common::{Bck, Error, Provider, Result};
use shoal_core::lom::{alloc_lom, free_lom};
use shoal_core::save::rename_atomic;
use shoal_core::Tcore;
use shoal_fs::walk::{all_mpath_bcks, walk_bck, WalkEntry};
use shoal_fs::ContentType;
use shoal_placement::Smap;
use shoal_transport::pdu::ObjReader;
use shoal_transport::{opcode, Bundle, Demux, ObjHdr, Peer, QuiRes, Receiver, SendObj, StreamOpts};
use shoal_xact::XactBase;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tracing::info;

const QUIESCE_TICK: Duration = Duration::from_millis(250);

/// Receive side: persists migrated objects and feeds the sentinel.
pub struct RebReceiver {
    t: Arc<Tcore>,
    x: Arc<XactBase>,
    sentinel: Arc<Sentinel>,
    bundle: OnceLock<Arc<Bundle>>,
}

impl RebReceiver {
    #[must_use]
    pub fn new(t: Arc<Tcore>, x: Arc<XactBase>, sentinel: Arc<Sentinel>) -> Arc<Self> {
        Arc::new(Self {
            t,
            x,
            sentinel,
            bundle: OnceLock::new(),
        })
    }

    pub fn attach_bundle(&self, bundle: Arc<Bundle>) {
        let _ = self.bundle.set(bundle);
    }
}

#[async_trait]
impl Receiver for RebReceiver {
    async fn recv_obj(
        &self,
        hdr: ObjHdr,
        reader: &mut ObjReader<'_, BufReader<tokio::net::tcp::OwnedReadHalf>>,
    ) -> Result<()> {
        let body = reader.read_to_end().await?;
        let bck = hdr.bck()?;
        let attrs = hdr.attrs(!bck.is_remote());
        let size = body.len() as i64;
        let t = Arc::clone(&self.t);
        let name = hdr.obj_name.clone();
        tokio::task::spawn_blocking(move || persist_migrated(&t, &bck, &name, &body, attrs))
            .await
            .map_err(|e| Error::Fatal(format!("migrate persist task: {e}")))??;
        self.x.objs_in_add(1, size);
        Ok(())
    }

    async fn recv_ctrl(&self, hdr: ObjHdr) -> Result<()> {
        if let Some(bundle) = self.bundle.get() {
            self.sentinel.on_ctrl(bundle, &hdr).await;
        }
        Ok(())
    }
}

fn persist_migrated(
    t: &Arc<Tcore>,
    bck: &Bck,
    name: &str,
    body: &[u8],
    attrs: shoal_common::ObjAttrs,
) -> Result<()> {
    let mut lom = alloc_lom();
    let res = (|| -> Result<()> {
        lom.init(t, bck, name)?;
        let work_ubase = ContentType::Work.make_ubase(name.rsplit('/').next().unwrap_or(name), &[]);
        let work = lom
            .mountpath()
            .make_fqn(ContentType::Work, bck, &work_ubase);
        shoal_core::save::save_reader(
            &work,
            &mut std::io::Cursor::new(body),
            shoal_common::CksumType::None,
            false,
        )?;
        lom.lock(true);
        let inner = (|| -> Result<()> {
            rename_atomic(&work, lom.fqn())?;
            lom.md.attrs = attrs;
            lom.md.attrs.size = body.len() as u64;
            if lom.md.attrs.atime_ns == 0 {
                lom.md.attrs.atime_ns = shoal_core::lom::now_ns();
            }
            lom.persist()
        })();
        lom.unlock(true);
        inner
    })();
    free_lom(lom);
    res
}

/// Drive a full rebalance on this target. Returns when the cluster-wide
/// xaction terminates (finished or aborted).
pub async fn run_rebalance(
    t: &Arc<Tcore>,
    x: &Arc<XactBase>,
    demux: &Arc<Demux>,
    opts: &StreamOpts,
) -> Result<()> {
    let smap = t.smap();
    x.run();

    let peers: Vec<Peer> = smap
        .targets
        .values()
        .filter(|ti| ti.is_active() && ti.tid != t.tid)
        .map(|ti| Peer {
            tid: ti.tid.clone(),
            addr: ti.data_addr.clone(),
        })
        .collect();
    if peers.is_empty() {
        info!(name = %x.name(), "single-target cluster, nothing to move");
        x.finish();
        return Ok(());
    }

    let sentinel = Sentinel::new(Arc::clone(x), &smap, &t.tid);
    let recv = RebReceiver::new(Arc::clone(t), Arc::clone(x), Arc::clone(&sentinel));
    let trname = format!("reb-{}", x.uuid());
    demux.handle(&trname, recv.clone())?;
    let mut stream_opts = opts.clone();
    stream_opts.trname = trname.clone();
    let bundle = Arc::new(Bundle::open(&peers, 1, &stream_opts));
    recv.attach_bundle(Arc::clone(&bundle));

    // phase 1: walk and ship
    let moved = ship_misplaced(t, x, &smap, &bundle).await;
    if let Err(e) = &moved {
        x.abort(e.to_string());
    }

    // phase 2: sentinel handshake
    if moved.is_ok() {
        sentinel.set_local_done();
    }
    sentinel
        .bcast(&bundle, x.snap().abort_err.as_deref())
        .await;
    let config = t.config();
    let progress_timeout = config.timeout.progress_d();
    let total = progress_timeout * 4;
    let mut elapsed = Duration::ZERO;
    while !x.state().is_terminal() {
        if elapsed >= total {
            x.abort(format!("{}: quiescence timed out", x.name()));
            break;
        }
        let res = sentinel
            .qcb(&bundle, &t.smap(), elapsed, Duration::from_secs(1), progress_timeout)
            .await;
        match res {
            QuiRes::Done => {
                x.finish();
                break;
            }
            QuiRes::Aborted | QuiRes::Timeout => break,
            QuiRes::Active | QuiRes::Inactive => {}
        }
        tokio::time::sleep(QUIESCE_TICK).await;
        elapsed += QUIESCE_TICK;
    }
    if x.is_aborted() {
        sentinel
            .bcast(&bundle, x.snap().abort_err.as_deref())
            .await;
    }

    // teardown: the demux registration outlives the bundle so that late
    // peer control frames still land
    tokio::time::sleep(QUIESCE_TICK).await;
    let _ = demux.unhandle(&trname);
    moved.map(|_| ())
}

async fn ship_misplaced(
    t: &Arc<Tcore>,
    x: &Arc<XactBase>,
    smap: &Smap,
    bundle: &Arc<Bundle>,
) -> Result<u64> {
    // collect on the blocking side first
    let t2 = Arc::clone(t);
    let x2 = Arc::clone(x);
    let smap2 = smap.clone();
    let to_move: Vec<(PathBuf, String, Bck)> = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        for mi in t2.mfs.available() {
            let mut bcks: Vec<Bck> = Vec::new();
            for provider in Provider::ALL {
                if let Ok(mut more) = all_mpath_bcks(&mi, provider) {
                    bcks.append(&mut more);
                }
            }
            for bck in bcks {
                let _ = walk_bck(&mi, &bck, &[ContentType::Obj], &mut |entry| {
                    if x2.is_aborted() {
                        return Err(Error::Aborted(x2.name()));
                    }
                    if let WalkEntry::File { fqn, .. } = entry {
                        if let Ok(parsed) = shoal_fs::fqn::resolve_fqn(&t2.mfs, fqn) {
                            let uname = parsed.bck.make_uname(&parsed.obj_name);
                            if let Ok(owner) = smap2.hrw_target(&uname) {
                                if owner.tid != t2.tid {
                                    out.push((
                                        fqn.to_path_buf(),
                                        owner.tid.clone(),
                                        parsed.bck.clone(),
                                    ));
                                }
                            }
                        }
                    }
                    Ok(())
                });
            }
        }
        out
    })
    .await
    .map_err(|e| Error::Fatal(format!("rebalance walk task: {e}")))?;

    info!(name = %x.name(), n = to_move.len(), "rebalance: shipping misplaced objects");
    let mut shipped = 0u64;
    for (fqn, dst_tid, bck) in to_move {
        if x.is_aborted() {
            break;
        }
        match ship_one(t, x, bundle, &fqn, &dst_tid, &bck).await {
            Ok(size) => {
                shipped += 1;
                x.objs_out_add(1, size as i64);
                x.objs_add(1, size as i64); // num-visited, for peer progress
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                x.add_err(format!("{}: {e}", fqn.display()));
            }
        }
    }
    Ok(shipped)
}

async fn ship_one(
    t: &Arc<Tcore>,
    _x: &Arc<XactBase>,
    bundle: &Arc<Bundle>,
    fqn: &std::path::Path,
    dst_tid: &str,
    _bck: &Bck,
) -> Result<u64> {
    // load identity + attrs
    let t2 = Arc::clone(t);
    let fqn2 = fqn.to_path_buf();
    let (hdr, size) = tokio::task::spawn_blocking(move || -> Result<(ObjHdr, u64)> {
        let mut lom = alloc_lom();
        let res = (|| -> Result<(ObjHdr, u64)> {
            lom.init_fqn(&t2, &fqn2)?;
            lom.lock(false);
            let inner = lom.load(false, true);
            lom.unlock(false);
            inner?;
            let mut hdr = ObjHdr {
                opcode: opcode::OBJ,
                obj_name: lom.obj_name().to_string(),
                size: lom.size() as i64,
                ..Default::default()
            };
            hdr.set_bck(lom.bck());
            hdr.set_attrs(&lom.md.attrs);
            Ok((hdr, lom.size()))
        })();
        free_lom(lom);
        res
    })
    .await
    .map_err(|e| Error::Fatal(format!("rebalance load task: {e}")))??;

    let file = tokio::fs::File::open(fqn)
        .await
        .map_err(|e| Error::io(format!("open {}", fqn.display()), e))?;
    let (done_tx, done_rx) = oneshot::channel();
    bundle
        .send(
            dst_tid,
            SendObj {
                hdr,
                roc: Some(Box::new(file)),
                on_done: Some(done_tx),
            },
        )
        .await?;
    match done_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(Error::Unavailable("stream closed mid-send".into())),
    }

    // delivered: drop the local replica
    let t3 = Arc::clone(t);
    let fqn3 = fqn.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut lom = alloc_lom();
        let res = (|| -> Result<()> {
            lom.init_fqn(&t3, &fqn3)?;
            lom.lock(true);
            let inner = lom.remove_main();
            lom.unlock(true);
            inner
        })();
        free_lom(lom);
        res
    })
    .await
    .map_err(|e| Error::Fatal(format!("rebalance rm task: {e}")))??;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::types::BckProps;
    use shoal_common::{CksumType, Config};
    use shoal_placement::TargetInfo;
    use shoal_stats::Tracker;
    use shoal_xact::kind;
    use std::io::Cursor;
    use tempfile::TempDir;

    struct Node {
        t: Arc<Tcore>,
        demux: Arc<Demux>,
        opts: StreamOpts,
        _dirs: Vec<TempDir>,
    }

    async fn node(tid: &str) -> Node {
        let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
        let paths: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let t = Tcore::new(tid, Config::default(), &paths).unwrap();
        t.bmd
            .write()
            .add(Bck::ais("reb"), BckProps::default())
            .unwrap();
        let stats = Arc::new(Tracker::new());
        let demux = Demux::new(stats.clone(), 4096);
        let opts = StreamOpts::new("reb", tid, stats);
        Node {
            t,
            demux,
            opts,
            _dirs: dirs,
        }
    }

    fn put_obj(t: &Arc<Tcore>, name: &str, body: &[u8]) {
        let mut lom = alloc_lom();
        lom.init(t, &Bck::ais("reb"), name).unwrap();
        let (size, cksum) = shoal_core::save::save_reader(
            lom.fqn(),
            &mut Cursor::new(body.to_vec()),
            CksumType::XXHash,
            false,
        )
        .unwrap();
        lom.md.attrs.size = size;
        lom.md.attrs.cksum = cksum;
        lom.md.attrs.atime_ns = shoal_core::lom::now_ns();
        lom.set_version_next(None);
        lom.persist().unwrap();
        free_lom(lom);
    }

    fn count_local(t: &Arc<Tcore>) -> usize {
        let mut n = 0;
        for mi in t.mfs.available() {
            let _ = walk_bck(&mi, &Bck::ais("reb"), &[ContentType::Obj], &mut |e| {
                if matches!(e, WalkEntry::File { .. }) {
                    n += 1;
                }
                Ok(())
            });
        }
        n
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_target_convergence() {
        let n1 = node("t1").await;
        let n2 = node("t2").await;
        let a1 = n1.demux.serve("127.0.0.1:0").await.unwrap();
        let a2 = n2.demux.serve("127.0.0.1:0").await.unwrap();

        let mut smap = Smap::default();
        smap.upsert(TargetInfo {
            tid: "t1".into(),
            data_addr: a1.to_string(),
            ..Default::default()
        });
        smap.upsert(TargetInfo {
            tid: "t2".into(),
            data_addr: a2.to_string(),
            ..Default::default()
        });
        n1.t.set_smap(smap.clone());
        n2.t.set_smap(smap.clone());

        // seed everything on t1, regardless of ownership
        let total = 40;
        for i in 0..total {
            put_obj(&n1.t, &format!("obj-{i:03}"), format!("bytes-{i}").as_bytes());
        }
        let owned_by_t2 = (0..total)
            .filter(|i| {
                let uname = Bck::ais("reb").make_uname(&format!("obj-{i:03}"));
                smap.hrw_target(&uname).unwrap().tid == "t2"
            })
            .count();
        assert!(owned_by_t2 > 0, "hash spread puts some keys on t2");

        // the same (cluster-unique) xaction uuid on both targets
        let x1 = XactBase::new("g1", kind::REBALANCE, None, "");
        let x2 = XactBase::new("g1", kind::REBALANCE, None, "");
        let (r1, r2) = tokio::join!(
            run_rebalance(&n1.t, &x1, &n1.demux, &n1.opts),
            run_rebalance(&n2.t, &x2, &n2.demux, &n2.opts),
        );
        r1.unwrap();
        r2.unwrap();
        assert!(x1.finished(), "{:?}", x1.snap());
        assert!(x2.finished(), "{:?}", x2.snap());

        // convergence: every object sits with its HRW owner, none lost
        assert_eq!(count_local(&n1.t), total - owned_by_t2);
        assert_eq!(count_local(&n2.t), owned_by_t2);

        // spot-check data + metadata integrity on the receiving side
        for i in 0..total {
            let name = format!("obj-{i:03}");
            let uname = Bck::ais("reb").make_uname(&name);
            if smap.hrw_target(&uname).unwrap().tid != "t2" {
                continue;
            }
            let mut lom = alloc_lom();
            lom.init(&n2.t, &Bck::ais("reb"), &name).unwrap();
            lom.load(false, false).unwrap();
            assert_eq!(
                std::fs::read(lom.fqn()).unwrap(),
                format!("bytes-{i}").into_bytes()
            );
            assert!(lom.cksum().is_some(), "attrs travel in the header");
            free_lom(lom);
        }
    }
}
