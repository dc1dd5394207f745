//! Storage cleanup
//!
//! One jogger per mountpath walks every bucket's content subtrees and
//! reconciles what it finds: old work files go, EC slices without
//! metafiles and metafiles without slice-or-replica go, orphan chunks
//! go, misplaced replicas go (only when no rebalance/resilver is running
//! or interrupted, unless forced). Removals happen in batches.

use shoal_common::{Bck, Error, Provider};
use shoal_core::lom::{alloc_lom, free_lom, LomIdentity};
use shoal_core::{Ct, Tcore};
use shoal_fs::capacity::{cap_refresh, CapStatus};
use shoal_fs::throttle::{is_throttle_walk, THROTTLE_10MS, THROTTLE_1MS};
use shoal_fs::walk::{all_mpath_bcks, walk_bck, WalkEntry};
use shoal_fs::{content, ContentType, Mountpath};
use shoal_stats::named;
use shoal_xact::{XactBase, XactRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const SPARSE_ORPHAN_LOG: u64 = 100;

const RM_OLD_WORK: u32 = 1 << 0;
const RM_MISPLACED_LOMS: u32 = 1 << 1;
const RM_MISPLACED_EC: u32 = 1 << 2;
const RM_ALL: u32 = RM_OLD_WORK | RM_MISPLACED_LOMS | RM_MISPLACED_EC;

#[derive(Clone, Debug, Default)]
pub struct CleanupArgs {
    /// Remove misplaced objects even when rebalance state says not to.
    pub force: bool,
    /// Also delete zero-size objects (cluster and remote).
    pub rm_zero_size: bool,
    /// Restrict to these buckets; empty = all local buckets.
    pub buckets: Vec<Bck>,
}

/// Run the cleanup xaction to completion. Joggers run in parallel, one
/// per mountpath; returns the refreshed capacity.
pub fn run_cleanup(
    t: &Arc<Tcore>,
    reg: &Arc<XactRegistry>,
    xcln: &Arc<XactBase>,
    args: &CleanupArgs,
) -> CapStatus {
    let avail = t.mfs.available();
    if avail.is_empty() {
        xcln.add_err(Error::NoMountpaths.to_string());
        xcln.finish();
        return CapStatus::default();
    }
    xcln.run();
    let config = t.config();
    info!(name = %xcln.name(), mountpaths = avail.len(), "cleanup: starting");

    std::thread::scope(|scope| {
        for mi in &avail {
            let mut jogger = ClnJogger {
                t: Arc::clone(t),
                reg: Arc::clone(reg),
                xcln: Arc::clone(xcln),
                args: args.clone(),
                mi: Arc::clone(mi),
                dont: config.space.dont_cleanup(),
                batch: config.space.batch(),
                throttle_every: config.disk.throttle_walk_every,
                max_throttle_pct: config.disk.max_throttle_pct,
                now: SystemTime::now(),
                bck: Bck::default(),
                old_work: Vec::with_capacity(64),
                misplaced_loms: Vec::with_capacity(64),
                misplaced_ec: Vec::with_capacity(64),
                nvisits: 0,
                norphan: 0,
            };
            scope.spawn(move || jogger.jog());
        }
    });

    let cs = match cap_refresh(&t.mfs, &t.config().space) {
        Ok(cs) => cs,
        Err(e) => {
            xcln.add_err(e.to_string());
            CapStatus::default()
        }
    };
    if let Some(errcap) = cs.err() {
        xcln.add_err(errcap.to_string());
        warn!(name = %xcln.name(), %cs, "cleanup: finished, capacity still critical");
    }
    xcln.finish();
    cs
}

struct ClnJogger {
    t: Arc<Tcore>,
    reg: Arc<XactRegistry>,
    xcln: Arc<XactBase>,
    args: CleanupArgs,
    mi: Arc<Mountpath>,
    dont: Duration,
    batch: usize,
    throttle_every: u64,
    max_throttle_pct: u32,
    now: SystemTime,
    bck: Bck,
    old_work: Vec<PathBuf>,
    misplaced_loms: Vec<LomIdentity>,
    misplaced_ec: Vec<Ct>,
    nvisits: u64,
    norphan: u64,
}

impl ClnJogger {
    fn jog(&mut self) {
        if let Err(e) = self.mi.remove_deleted() {
            self.xcln.add_err(e.to_string());
        }
        let buckets = if self.args.buckets.is_empty() {
            let mut all = Vec::new();
            for provider in Provider::ALL {
                match all_mpath_bcks(&self.mi, provider) {
                    Ok(mut bcks) => all.append(&mut bcks),
                    Err(e) => self.xcln.add_err(e.to_string()),
                }
            }
            all
        } else {
            self.args.buckets.clone()
        };
        for bck in buckets {
            self.bck = bck;
            self.jog_bck();
            if self.xcln.is_aborted() {
                return;
            }
        }
        self.rm_leftovers(RM_ALL);
        if self.norphan > 0 {
            warn!(mi = %self.mi, n = self.norphan, "cleanup: removed orphan chunks");
        }
    }

    fn jog_bck(&mut self) {
        let bck = self.bck.clone();
        let cts = [
            ContentType::Work,
            ContentType::Obj,
            ContentType::EcSlice,
            ContentType::EcMeta,
            ContentType::Chunk,
            ContentType::ChunkMeta,
        ];
        let mi = Arc::clone(&self.mi);
        let res = walk_bck(&mi, &bck, &cts, &mut |entry| {
            match entry {
                WalkEntry::Dir { path } => self.rm_empty_dir(path),
                WalkEntry::File { fqn, ct, meta } => {
                    if self.xcln.is_aborted() {
                        return Err(Error::Aborted(self.xcln.name()));
                    }
                    self.visit(fqn, ct, meta);
                    self.nvisits += 1;
                    if is_throttle_walk(self.nvisits, self.throttle_every)
                        && self.t.disk_util.pct() >= self.max_throttle_pct
                    {
                        std::thread::sleep(THROTTLE_1MS);
                    }
                }
            }
            Ok(())
        });
        if let Err(e) = res {
            if !matches!(e, Error::Aborted(_)) {
                self.xcln.add_err(e.to_string());
            }
        }
    }

    fn too_early(&self, mtime: SystemTime) -> bool {
        match self.now.duration_since(mtime) {
            Ok(age) => age < self.dont,
            Err(_) => true, // clock skew; leave it alone
        }
    }

    fn visit(&mut self, fqn: &Path, ct: ContentType, meta: &std::fs::Metadata) {
        if let Ok(mtime) = meta.modified() {
            if self.too_early(mtime) {
                return;
            }
        }
        match ct {
            ContentType::Obj => self.visit_obj(fqn),
            _ => self.visit_ct(fqn, ct),
        }
    }

    fn ubase_of(fqn: &Path) -> &str {
        fqn.file_name().and_then(|n| n.to_str()).unwrap_or("")
    }

    fn visit_ct(&mut self, fqn: &Path, ct: ContentType) {
        match ct {
            ContentType::Work => {
                let info = ct.parse_ubase(Self::ubase_of(fqn));
                if info.ok && info.old {
                    self.old_work.push(fqn.to_path_buf());
                    self.rm_any_batch(RM_OLD_WORK);
                }
            }
            ContentType::EcSlice => {
                // EC disabled: every slice is garbage. Enabled: a slice
                // without its metafile is stray (saving is two-step,
                // slice first, so the age window above protects the gap)
                let Ok(mut slice) = Ct::from_fqn(&self.t, fqn) else {
                    self.old_work.push(fqn.to_path_buf());
                    self.rm_any_batch(RM_OLD_WORK);
                    return;
                };
                let ec_enabled = self
                    .t
                    .bmd
                    .read()
                    .lookup(&self.bck)
                    .map(|p| p.ec.enabled)
                    .unwrap_or(false);
                if !ec_enabled {
                    self.old_work.push(fqn.to_path_buf());
                    self.rm_any_batch(RM_OLD_WORK);
                    return;
                }
                if slice.load_from_fs().is_err() {
                    return;
                }
                let meta_fqn = slice.make(ContentType::EcMeta, &[]);
                if !meta_fqn.exists() {
                    self.misplaced_ec.push(slice);
                    self.rm_any_batch(RM_MISPLACED_EC);
                }
            }
            ContentType::EcMeta => {
                let Ok(ct_meta) = Ct::from_fqn(&self.t, fqn) else {
                    self.old_work.push(fqn.to_path_buf());
                    self.rm_any_batch(RM_OLD_WORK);
                    return;
                };
                let ec_enabled = self
                    .t
                    .bmd
                    .read()
                    .lookup(&self.bck)
                    .map(|p| p.ec.enabled)
                    .unwrap_or(false);
                if !ec_enabled {
                    self.old_work.push(fqn.to_path_buf());
                    self.rm_any_batch(RM_OLD_WORK);
                    return;
                }
                // the metafile is pinned by its slice or by a whole
                // replica; with neither present it is stray
                if ct_meta.make(ContentType::EcSlice, &[]).exists() {
                    return;
                }
                if ct_meta.make(ContentType::Obj, &[]).exists() {
                    return;
                }
                self.old_work.push(fqn.to_path_buf());
                self.rm_any_batch(RM_OLD_WORK);
            }
            ContentType::Chunk => {
                let info = ct.parse_ubase(Self::ubase_of(fqn));
                if !info.ok {
                    self.old_work.push(fqn.to_path_buf());
                    self.rm_any_batch(RM_OLD_WORK);
                    return;
                }
                let upload_id = info.extras[0].clone();
                self.visit_chunk(fqn, &info.base, &upload_id);
            }
            ContentType::ChunkMeta => {
                let info = ct.parse_ubase(Self::ubase_of(fqn));
                if !info.ok {
                    // unparseable name: old work
                    self.old_work.push(fqn.to_path_buf());
                    self.rm_any_batch(RM_OLD_WORK);
                    return;
                }
                if info.extras.is_empty() {
                    // completed manifest: owned by its (chunked) object
                    return;
                }
                // partial manifest past the age window
                warn!(mi = %self.mi, fqn = %fqn.display(), "cleanup: removing old partial manifest");
                self.old_work.push(fqn.to_path_buf());
                self.rm_any_batch(RM_OLD_WORK);
            }
            ContentType::Obj => unreachable!("objects are visited separately"),
        }
    }

    /// Chunk reconciliation: a completed manifest pins its chunks; a
    /// fresh partial manifest defers; everything else is an orphan.
    fn visit_chunk(&mut self, chunk_fqn: &Path, base: &str, upload_id: &str) {
        let mut lom = alloc_lom();
        let obj_name = match Ct::from_fqn(&self.t, chunk_fqn) {
            Ok(ct) => ct.obj_name().to_string(),
            Err(_) => base.to_string(),
        };
        if lom.init(&self.t, &self.bck.clone(), &obj_name).is_err() {
            free_lom(lom);
            return;
        }
        lom.lock(false);
        let completed_id = if lom.load(false, true).is_ok() && lom.is_chunked() {
            lom.md.upload_id.clone()
        } else {
            None
        };
        lom.unlock(false);

        if let Some(id) = completed_id {
            if id != upload_id {
                // a completed manifest exists and does not reference
                // this chunk
                self.old_work.push(chunk_fqn.to_path_buf());
                self.rm_any_batch(RM_OLD_WORK);
            }
            free_lom(lom);
            return;
        }

        // no completed manifest: check for a (young) partial one
        let ct = Ct::new(
            &self.t,
            &self.bck.clone(),
            &obj_name,
            ContentType::ChunkMeta,
            &[upload_id],
        );
        if let Ok(partial) = ct {
            if let Ok(meta) = std::fs::metadata(partial.fqn()) {
                if meta.modified().map(|m| self.too_early(m)).unwrap_or(true) {
                    free_lom(lom);
                    return;
                }
                warn!(mi = %self.mi, fqn = %partial.fqn().display(), "cleanup: stale partial manifest");
                self.old_work.push(chunk_fqn.to_path_buf());
                self.rm_any_batch(RM_OLD_WORK);
                free_lom(lom);
                return;
            }
        }

        // orphan: old enough (checked on entry) and referenced by nothing
        self.norphan += 1;
        if self.norphan % SPARSE_ORPHAN_LOG == 1 {
            warn!(
                mi = %self.mi,
                fqn = %chunk_fqn.display(),
                total = self.norphan,
                "cleanup: removing orphan chunk"
            );
        }
        self.old_work.push(chunk_fqn.to_path_buf());
        self.rm_any_batch(RM_OLD_WORK);
        free_lom(lom);
    }

    fn visit_obj(&mut self, fqn: &Path) {
        let mut lom = alloc_lom();
        if let Err(e) = lom.init_fqn(&self.t, fqn) {
            if matches!(e, Error::BckNotFound(_)) {
                warn!(mi = %self.mi, %e, "cleanup: bucket gone, retiring its tree");
                let bdir = self.mi.make_path_bck(ContentType::Obj, &self.bck);
                if let Err(e) = self.mi.move_to_deleted(&bdir) {
                    self.xcln.add_err(e.to_string());
                }
            } else {
                self.xcln.add_err(e.to_string());
            }
            free_lom(lom);
            return;
        }
        match lom.load(false, false) {
            Err(e) if e.is_lmeta_fault() => {
                // both metadata-missing and -corrupted authorize removal
                match lom.remove_main() {
                    Ok(()) => warn!(cname = %lom.cname(), %e, "cleanup: removed object with broken metadata"),
                    Err(rme) => self.xcln.add_err(format!("{e} (nested: {rme})")),
                }
                free_lom(lom);
                return;
            }
            Err(_) => {
                free_lom(lom);
                return;
            }
            Ok(()) => {}
        }
        let atime = SystemTime::UNIX_EPOCH + Duration::from_nanos(lom.atime_ns().max(0) as u64);
        if self.too_early(atime) {
            free_lom(lom);
            return;
        }
        if lom.is_hrw() {
            if lom.has_copies() {
                self.rm_extra_copies(&mut lom);
            }
            if lom.size() == 0 && self.args.rm_zero_size {
                match lom.remove_all() {
                    Ok(()) => {
                        warn!(cname = %lom.cname(), "cleanup: removed zero-size object");
                        self.t.stats.inc(named::CLEANUP_STORE_COUNT);
                    }
                    Err(e) => self.xcln.add_err(e.to_string()),
                }
            }
            free_lom(lom);
            return;
        }
        if lom.is_copy() {
            // visited via its main replica
            free_lom(lom);
            return;
        }
        if lom.ec_enabled() {
            if let Ok(ct) = Ct::from_fqn(&self.t, fqn) {
                if !ct.make(ContentType::EcMeta, &[]).exists() {
                    self.misplaced_ec.push(ct);
                    self.rm_any_batch(RM_MISPLACED_EC);
                }
            }
        } else {
            self.misplaced_loms.push(lom.snap_identity());
            self.rm_any_batch(RM_MISPLACED_LOMS);
        }
        free_lom(lom);
    }

    fn rm_extra_copies(&mut self, lom: &mut Box<shoal_core::Lom>) {
        if !lom.try_lock(true) {
            return; // busy
        }
        // reload under lock and re-check the age
        let res = lom.load(false, true);
        let mut ok = res.is_ok();
        if ok {
            let atime =
                SystemTime::UNIX_EPOCH + Duration::from_nanos(lom.atime_ns().max(0) as u64);
            ok = !self.too_early(atime) && !lom.is_copy();
        }
        if ok {
            if let Err(e) = lom.del_extra_copies(None) {
                self.xcln
                    .add_err(format!("failed to drop redundant copies of {}: {e}", lom.cname()));
            }
        }
        lom.unlock(true);
    }

    fn rm_empty_dir(&mut self, dir: &Path) {
        let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if content::likely_ct(name) || name.starts_with('@') {
            return;
        }
        // non-recursive by design: a parent emptied here is caught on
        // the next run
        match std::fs::read_dir(dir) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    let _ = std::fs::remove_dir(dir);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                let err = Error::io(format!("check-empty-dir {}", dir.display()), e);
                self.t.fshc(&err, &self.mi);
                self.xcln.add_err(err.to_string());
            }
        }
    }

    fn rm_any_batch(&mut self, which: u32) {
        let over = match which {
            RM_OLD_WORK => self.old_work.len() >= self.batch,
            RM_MISPLACED_LOMS => self.misplaced_loms.len() >= self.batch,
            RM_MISPLACED_EC => self.misplaced_ec.len() >= self.batch,
            _ => false,
        };
        if over {
            self.rm_leftovers(which);
        }
    }

    fn rm_leftovers(&mut self, which: u32) {
        let mut nfiles: i64 = 0;
        let mut nbytes: i64 = 0;
        let mut nremoved: u64 = 0;

        // 1. old work files and stray artifacts
        if which & RM_OLD_WORK != 0 {
            for fqn in std::mem::take(&mut self.old_work) {
                match std::fs::metadata(&fqn) {
                    Err(_) => continue,
                    Ok(meta) => {
                        if std::fs::remove_file(&fqn).is_ok() {
                            nfiles += 1;
                            nbytes += meta.len() as i64;
                        } else {
                            self.xcln
                                .add_err(format!("rm old work {}", fqn.display()));
                        }
                    }
                }
            }
            self.now = SystemTime::now();
        }

        // 2. misplaced objects, gated on rebalance/resilver state
        if which & RM_MISPLACED_LOMS != 0 {
            let allowed = self.reg.safe_to_rm_misplaced() || self.args.force;
            if !allowed && !self.misplaced_loms.is_empty() {
                warn!(
                    mi = %self.mi,
                    n = self.misplaced_loms.len(),
                    "cleanup: not removing misplaced objects (rebalance/resilver state)"
                );
                self.misplaced_loms.clear();
            }
            for ident in std::mem::take(&mut self.misplaced_loms) {
                if std::fs::remove_file(&ident.fqn).is_ok() {
                    nfiles += 1;
                    nbytes += ident.size as i64;
                    nremoved += 1;
                    self.throttle_bulk(nremoved);
                } else if ident.fqn.exists() {
                    self.xcln
                        .add_err(format!("rm misplaced {}", ident.fqn.display()));
                }
                if self.xcln.is_aborted() {
                    return;
                }
            }
            self.now = SystemTime::now();
        }

        // 3. EC artifacts still missing their metafile
        if which & RM_MISPLACED_EC != 0 {
            for ct in std::mem::take(&mut self.misplaced_ec) {
                if ct.make(ContentType::EcMeta, &[]).exists() {
                    continue; // the metafile caught up
                }
                if std::fs::remove_file(ct.fqn()).is_ok() {
                    nfiles += 1;
                    nbytes += ct.size() as i64;
                    nremoved += 1;
                    self.throttle_bulk(nremoved);
                }
                if self.xcln.is_aborted() {
                    return;
                }
            }
            self.now = SystemTime::now();
        }

        if nfiles > 0 {
            self.t.stats.add(named::CLEANUP_STORE_COUNT, nfiles);
            self.t.stats.add(named::CLEANUP_STORE_SIZE, nbytes);
            self.xcln.objs_add(nfiles, nbytes);
        }
    }

    fn throttle_bulk(&self, n: u64) {
        if is_throttle_walk(n, self.throttle_every)
            && self.t.disk_util.pct() >= self.max_throttle_pct
        {
            std::thread::sleep(THROTTLE_10MS);
        }
    }
}
