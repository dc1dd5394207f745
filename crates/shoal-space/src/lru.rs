//! LRU eviction
//!
//! Runs after cleanup, and only when capacity is still above the low
//! watermark. Each mountpath jogger enumerates present objects with
//! their access times, sorts coldest-first and evicts until the
//! per-mountpath byte target is met, honoring `dont_evict_time`.
//! Remote-backed objects lose the local replica only.

use shoal_common::{Bck, Provider};
use shoal_core::lom::{alloc_lom, free_lom};
use shoal_core::Tcore;
use shoal_fs::walk::{all_mpath_bcks, walk_bck, WalkEntry};
use shoal_fs::{ContentType, Mountpath};
use shoal_stats::named;
use shoal_xact::XactBase;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

#[derive(Clone, Debug, Default)]
pub struct LruArgs {
    /// Evict even when below the low watermark.
    pub force: bool,
    /// Explicit per-mountpath byte target; 0 derives it from the
    /// watermark configuration.
    pub target_bytes: u64,
    pub buckets: Vec<Bck>,
}

/// Run LRU eviction to completion.
pub fn run_lru(t: &Arc<Tcore>, xlru: &Arc<XactBase>, args: &LruArgs) {
    let avail = t.mfs.available();
    if avail.is_empty() {
        xlru.add_err("no mountpaths".to_string());
        xlru.finish();
        return;
    }
    xlru.run();
    std::thread::scope(|scope| {
        for mi in &avail {
            let jogger = LruJogger {
                t: Arc::clone(t),
                xlru: Arc::clone(xlru),
                args: args.clone(),
                mi: Arc::clone(mi),
                now: SystemTime::now(),
            };
            scope.spawn(move || jogger.jog());
        }
    });
    xlru.finish();
}

struct Candidate {
    atime_ns: i64,
    size: u64,
    fqn: std::path::PathBuf,
}

struct LruJogger {
    t: Arc<Tcore>,
    xlru: Arc<XactBase>,
    args: LruArgs,
    mi: Arc<Mountpath>,
    now: SystemTime,
}

impl LruJogger {
    fn jog(&self) {
        let to_evict = match self.bytes_to_evict() {
            Some(n) if n > 0 => n,
            _ => {
                info!(mi = %self.mi, "lru: below low watermark, nothing to do");
                return;
            }
        };
        let mut heap = self.collect();
        heap.sort_by_key(|c| c.atime_ns); // coldest first
        info!(mi = %self.mi, candidates = heap.len(), to_evict, "lru: evicting");

        let mut freed = 0u64;
        for cand in heap {
            if freed >= to_evict || self.xlru.is_aborted() {
                break;
            }
            freed += self.evict_one(&cand);
        }
    }

    fn bytes_to_evict(&self) -> Option<u64> {
        if self.args.target_bytes > 0 {
            return Some(self.args.target_bytes);
        }
        let cap = self.mi.capacity().ok()?;
        let low_wm = self.t.config().space.low_wm;
        if cap.used_pct <= low_wm && !self.args.force {
            return None;
        }
        let excess_pct = cap.used_pct.saturating_sub(low_wm).max(1);
        Some(cap.total * u64::from(excess_pct) / 100)
    }

    fn collect(&self) -> Vec<Candidate> {
        let dont_evict = self.t.config().lru.dont_evict();
        let mut out = Vec::new();
        let buckets = if self.args.buckets.is_empty() {
            let mut all = Vec::new();
            for provider in Provider::ALL {
                if let Ok(mut bcks) = all_mpath_bcks(&self.mi, provider) {
                    all.append(&mut bcks);
                }
            }
            all
        } else {
            self.args.buckets.clone()
        };
        for bck in buckets {
            let lru_enabled = self
                .t
                .bmd
                .read()
                .lookup(&bck)
                .map(|p| p.lru.enabled)
                .unwrap_or(false);
            if !lru_enabled {
                continue;
            }
            let _ = walk_bck(&self.mi, &bck, &[ContentType::Obj], &mut |entry| {
                let WalkEntry::File { fqn, .. } = entry else {
                    return Ok(());
                };
                let mut lom = alloc_lom();
                if lom.init_fqn(&self.t, fqn).is_ok() && lom.load(false, false).is_ok() {
                    let atime = SystemTime::UNIX_EPOCH
                        + Duration::from_nanos(lom.atime_ns().max(0) as u64);
                    let young = self
                        .now
                        .duration_since(atime)
                        .map(|age| age < dont_evict)
                        .unwrap_or(true);
                    if !young && lom.is_hrw() {
                        out.push(Candidate {
                            atime_ns: lom.atime_ns(),
                            size: lom.size(),
                            fqn: fqn.to_path_buf(),
                        });
                    }
                }
                free_lom(lom);
                Ok(())
            });
        }
        out
    }

    fn evict_one(&self, cand: &Candidate) -> u64 {
        let mut lom = alloc_lom();
        let mut freed = 0;
        if lom.init_fqn(&self.t, &cand.fqn).is_ok() && lom.try_lock(true) {
            // reload under lock; skip if it got touched meanwhile
            if lom.load(false, true).is_ok() && lom.atime_ns() <= cand.atime_ns {
                match lom.remove_all() {
                    Ok(()) => {
                        freed = cand.size;
                        self.t.stats.inc(named::LRU_EVICT_COUNT);
                        self.t.stats.add(named::LRU_EVICT_SIZE, cand.size as i64);
                        self.xlru.objs_add(1, cand.size as i64);
                    }
                    Err(e) => {
                        warn!(fqn = %cand.fqn.display(), %e, "lru: eviction failed");
                        self.xlru.add_err(e.to_string());
                    }
                }
            }
            lom.unlock(true);
        }
        free_lom(lom);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::types::{BckProps, LruBckConf};
    use shoal_common::{CksumType, Config};
    use shoal_core::Lom;
    use shoal_xact::kind;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn test_env() -> (Arc<Tcore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.lru.dont_evict_time = 0;
        let t = Tcore::new("t1", config, &[dir.path().to_path_buf()]).unwrap();
        t.bmd
            .write()
            .add(Bck::ais("data"), BckProps::default())
            .unwrap();
        t.bmd
            .write()
            .add(
                Bck::ais("pinned"),
                BckProps {
                    lru: LruBckConf { enabled: false },
                    ..Default::default()
                },
            )
            .unwrap();
        (t, dir)
    }

    fn put_obj(t: &Arc<Tcore>, bck: &Bck, name: &str, body: &[u8], atime_ns: i64) -> Box<Lom> {
        let mut lom = alloc_lom();
        lom.init(t, bck, name).unwrap();
        let (size, cksum) = shoal_core::save::save_reader(
            lom.fqn(),
            &mut Cursor::new(body.to_vec()),
            CksumType::XXHash,
            false,
        )
        .unwrap();
        lom.md.attrs.size = size;
        lom.md.attrs.cksum = cksum;
        lom.md.attrs.atime_ns = atime_ns;
        lom.persist().unwrap();
        lom
    }

    #[test]
    fn test_coldest_evicted_first() {
        let (t, _dir) = test_env();
        let bck = Bck::ais("data");
        let cold = put_obj(&t, &bck, "cold", &[1u8; 1000], 1_000);
        let warm = put_obj(&t, &bck, "warm", &[2u8; 1000], 2_000_000_000);
        let hot = put_obj(&t, &bck, "hot", &[3u8; 1000], i64::MAX / 2);

        let x = XactBase::new("", kind::LRU, None, "");
        run_lru(
            &t,
            &x,
            &LruArgs {
                target_bytes: 1500,
                ..Default::default()
            },
        );
        assert!(!cold.fqn().exists());
        assert!(!warm.fqn().exists(), "two evictions reach the 1500B target");
        assert!(hot.fqn().exists());
        assert_eq!(x.snap().objs_added, 2);
        free_lom(hot);
        free_lom(warm);
        free_lom(cold);
    }

    #[test]
    fn test_lru_disabled_bucket_is_skipped() {
        let (t, _dir) = test_env();
        let kept = put_obj(&t, &Bck::ais("pinned"), "precious", &[0u8; 100], 1);
        let x = XactBase::new("", kind::LRU, None, "");
        run_lru(
            &t,
            &x,
            &LruArgs {
                target_bytes: 10_000,
                ..Default::default()
            },
        );
        assert!(kept.fqn().exists());
        free_lom(kept);
    }

    #[test]
    fn test_below_watermark_noop() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.lru.dont_evict_time = 0;
        // push the low watermark out of reach of any sane test box
        config.space.cleanup_wm = 96;
        config.space.low_wm = 98;
        config.space.high_wm = 99;
        config.space.oos = 100;
        let t = Tcore::new("t1", config, &[dir.path().to_path_buf()]).unwrap();
        let bck = Bck::ais("data");
        t.bmd
            .write()
            .add(bck.clone(), BckProps::default())
            .unwrap();
        let lom = put_obj(&t, &bck, "obj", &[0u8; 100], 1);
        let x = XactBase::new("", kind::LRU, None, "");
        // no explicit target and a near-empty filesystem: nothing moves
        run_lru(&t, &x, &LruArgs::default());
        assert!(lom.fqn().exists());
        assert_eq!(x.snap().objs_added, 0);
        free_lom(lom);
    }
}
