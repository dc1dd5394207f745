//! The storage target node
//!
//! Wires the core together — data path, backends, transport demux,
//! shared data mover, xaction registry, housekeeper — and exposes the
//! intra-cluster HTTP API.

pub mod bucket;
pub mod dpq;
pub mod hk;
pub mod http;

use hk::Housekeeper;
use shoal_backend::Backends;
use shoal_common::{Config, Result};
use shoal_core::Tcore;
use shoal_space::{run_cleanup, run_lru, CleanupArgs, LruArgs, SpaceTrigger};
use shoal_stats::Tracker;
use shoal_tgt::Target;
use shoal_transport::{Demux, SharedDm, StreamOpts, SDM_TRNAME};
use shoal_xact::{kind, RenewRes, XactRegistry};
use shoal_xs::etl::EtlRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Node {
    pub tgt: Target,
    pub demux: Arc<Demux>,
    pub sdm: Arc<SharedDm>,
    pub etls: Arc<EtlRegistry>,
    pub trigger: Arc<SpaceTrigger>,
    pub hk: Arc<Housekeeper>,
}

impl Node {
    pub fn new(tid: &str, config: Config, mountpaths: &[PathBuf]) -> Result<Arc<Self>> {
        let t = Tcore::new(tid, config, mountpaths)?;
        let backends = Backends::from_config(&t.config());
        Self::with_parts(t, backends)
    }

    /// Assembly seam: tests inject their own backends (e.g. in-memory).
    pub fn with_parts(t: Arc<Tcore>, backends: Backends) -> Result<Arc<Self>> {
        let reg = Arc::new(XactRegistry::new());
        let tgt = Target::new(Arc::clone(&t), backends, Arc::clone(&reg));
        let demux = Demux::new(Arc::clone(&t.stats), t.config().transport.max_hdr_size);
        let sdm = Arc::new(SharedDm::new());
        demux.handle(SDM_TRNAME, Arc::clone(&sdm) as _)?;

        let node = Arc::new(Self {
            tgt,
            demux,
            sdm,
            etls: EtlRegistry::new(),
            trigger: Arc::new(SpaceTrigger::default()),
            hk: Housekeeper::new(),
        });
        node.register_hk_tasks();
        Ok(node)
    }

    fn register_hk_tasks(self: &Arc<Self>) {
        let config = self.tgt.t.config();

        let stats = Arc::clone(&self.tgt.t.stats);
        self.hk
            .register("stats-flush", Duration::from_secs(10), move || {
                stats.flush();
            });

        let sdm = Arc::clone(&self.sdm);
        let idle = Duration::from_secs(config.transport.sdm_idle_evict_time);
        self.hk
            .register("sdm-idle-evict", Duration::from_secs(60), move || {
                sdm.evict_idle(idle);
            });

        let reg = Arc::clone(&self.tgt.reg);
        self.hk
            .register("xreg-gc", Duration::from_secs(30), move || {
                reg.gc();
            });

        let t = Arc::clone(&self.tgt.t);
        self.hk
            .register("disk-util", Duration::from_secs(2), move || {
                t.disk_util.refresh(Duration::from_secs(2));
            });

        let node = Arc::clone(self);
        self.hk
            .register("cap-poll", Duration::from_secs(30), move || {
                node.poll_capacity();
            });
    }

    /// Capacity watchdog: OOS / near-OOS auto-runs cleanup, then LRU
    /// when cleanup did not bring usage below the low watermark.
    fn poll_capacity(self: &Arc<Self>) {
        let t = &self.tgt.t;
        let cs = match shoal_fs::cap_refresh(&t.mfs, &t.config().space) {
            Ok(cs) => cs,
            Err(e) => {
                warn!(%e, "capacity refresh failed");
                return;
            }
        };
        if !self.trigger.should_run(&cs, &t.stats) {
            return;
        }
        warn!(%cs, "space pressure: auto-running store cleanup");
        let node = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            node.run_space_cleanup(&CleanupArgs::default(), true);
        });
    }

    /// Cleanup, serialized via the registry; optionally LRU after.
    pub fn run_space_cleanup(&self, args: &CleanupArgs, lru_after: bool) {
        let t = &self.tgt.t;
        let x = match self.tgt.reg.renew(kind::CLEANUP, None, "", "") {
            RenewRes::New(x) => x,
            RenewRes::UsePrev(prev) => {
                info!(name = %prev.name(), "cleanup already running");
                return;
            }
            RenewRes::Refused(why) => {
                warn!(%why, "cleanup renewal refused");
                return;
            }
        };
        let cs = run_cleanup(t, &self.tgt.reg, &x, args);
        if !lru_after || !t.config().lru.enabled {
            return;
        }
        if cs.err().is_none() && !cs.high_wm {
            return;
        }
        warn!(%cs, "still above watermarks, running LRU eviction");
        match self.tgt.reg.renew(kind::LRU, None, "", "") {
            RenewRes::New(xlru) => run_lru(t, &xlru, &LruArgs::default()),
            RenewRes::UsePrev(prev) => info!(name = %prev.name(), "lru already running"),
            RenewRes::Refused(why) => warn!(%why, "lru renewal refused"),
        }
    }

    /// Bring up the inter-target stream listener.
    pub async fn serve_streams(&self, listen: &str) -> Result<SocketAddr> {
        self.demux.serve(listen).await
    }

    /// Stream options for outbound bundles, from the current config.
    #[must_use]
    pub fn stream_opts(&self) -> StreamOpts {
        let config = self.tgt.t.config();
        let mut opts = StreamOpts::new("", &self.tgt.t.tid, Arc::clone(&self.tgt.t.stats));
        opts.burst = config.transport.burst;
        opts.max_hdr_size = config.transport.max_hdr_size;
        opts.size_pdu = config.transport.size_pdu;
        opts.compress = matches!(
            config.transport.compression,
            shoal_common::config::Compression::Always
        );
        opts.max_backoff = Duration::from_secs(config.timeout.max_keepalive);
        opts
    }

    /// Mountpath attach/detach trigger resilver (and the caller kicks
    /// rebalance when cluster membership changed too).
    pub fn on_mountpath_change(self: &Arc<Self>) {
        let x = match self.tgt.reg.renew(kind::RESILVER, None, "", "") {
            RenewRes::New(x) => x,
            _ => unreachable!("resilver preempts"),
        };
        let t = Arc::clone(&self.tgt.t);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = shoal_xs::run_resilver(&t, &x) {
                warn!(%e, "resilver failed");
            }
        });
    }

    pub fn stats(&self) -> &Arc<Tracker> {
        &self.tgt.t.stats
    }
}
