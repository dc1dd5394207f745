//! Sentinel: cross-target termination protocol
//!
//! Each target broadcasts `DONE` when locally finished; periodic
//! `REQUEST`/`RESPONSE` exchanges carry per-peer progress (num visited).
//! A peer that stops advancing past the progress timeout aborts the
//! whole xaction, as does any cluster-map change and any received
//! `ABORT`.

use parking_lot::Mutex;
use shoal_common::{Error, Result};
use shoal_placement::Smap;
use shoal_transport::{opcode, Bundle, ObjHdr, QuiRes, SendObj};
use shoal_xact::XactBase;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const APAIR_DELETED: i64 = -1;

struct Apair {
    /// Last progress update, ms since the sentinel's epoch;
    /// `APAIR_DELETED` once the peer reported done.
    last_ms: AtomicI64,
    progress: AtomicI64,
}

pub struct Sentinel {
    x: Arc<XactBase>,
    epoch: Instant,
    pend: Mutex<HashMap<String, Arc<Apair>>>,
    /// Number of active targets at start.
    nat: usize,
    qi: AtomicI64,
    /// Local work complete; progress requests are answered with `DONE`
    /// from here on, so a lost initial broadcast self-heals.
    local_done: AtomicBool,
}

impl Sentinel {
    #[must_use]
    pub fn new(x: Arc<XactBase>, smap: &Smap, self_tid: &str) -> Arc<Self> {
        let epoch = Instant::now();
        let mut pend = HashMap::new();
        for tid in smap.active_tids() {
            if tid != self_tid {
                pend.insert(
                    tid.to_string(),
                    Arc::new(Apair {
                        last_ms: AtomicI64::new(0),
                        progress: AtomicI64::new(0),
                    }),
                );
            }
        }
        Arc::new(Self {
            x,
            epoch,
            pend: Mutex::new(pend),
            nat: smap.count_active(),
            qi: AtomicI64::new(0),
            local_done: AtomicBool::new(false),
        })
    }

    pub fn set_local_done(&self) {
        self.local_done.store(true, Ordering::Release);
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Local completion (or abort): tell every peer.
    pub async fn bcast(&self, bundle: &Bundle, abort_err: Option<&str>) {
        let mut hdr = ObjHdr::control(opcode::DONE);
        hdr.demux_id = self.x.uuid().to_string();
        if let Some(err) = abort_err {
            hdr.opcode = opcode::ABORT;
            hdr.obj_name = err.to_string();
        }
        if let Err(e) = bundle.bcast(&hdr).await {
            warn!(name = %self.x.name(), %e, "sentinel broadcast failed");
        }
    }

    /// Names of peers not yet done.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        self.pend
            .lock()
            .iter()
            .filter(|(_, ap)| ap.last_ms.load(Ordering::Relaxed) != APAIR_DELETED)
            .map(|(tid, _)| tid.clone())
            .collect()
    }

    /// Quiescence callback: decides done/active/abort once per poll
    /// interval, requesting peer progress while pending.
    pub async fn qcb(
        &self,
        bundle: &Bundle,
        smap: &Smap,
        elapsed: Duration,
        ival: Duration,
        progress_timeout: Duration,
    ) -> QuiRes {
        let i = (elapsed.as_millis() / ival.as_millis().max(1)) as i64;
        if i <= self.qi.load(Ordering::Relaxed) {
            return QuiRes::Active;
        }
        self.qi.store(i, Ordering::Relaxed);

        let pending = self.pending();
        if self.x.err_count() > 0 {
            warn!(name = %self.x.name(), ?elapsed, errs = self.x.err_count(), ?pending, "quiescing");
        } else {
            info!(name = %self.x.name(), ?elapsed, ?pending, "quiescing");
        }
        if pending.is_empty() {
            return QuiRes::Done;
        }

        // membership change aborts
        if let Err(e) = self.check_smap(smap, &pending) {
            self.x.abort(e.to_string());
            return QuiRes::Aborted;
        }

        // progress timeout aborts
        let now = self.now_ms();
        for (tid, ap) in self.pend.lock().iter() {
            let last = ap.last_ms.load(Ordering::Relaxed);
            if last == APAIR_DELETED || last == 0 {
                continue;
            }
            let since = Duration::from_millis((now - last).max(0) as u64);
            if since > progress_timeout {
                let err = format!(
                    "{}: timed out waiting for {tid} [{since:?} without progress]",
                    self.x.name()
                );
                self.x.abort(err.clone());
                warn!(%err, "sentinel");
                return QuiRes::Aborted;
            }
        }

        // ask for progress
        let mut hdr = ObjHdr::control(opcode::REQUEST);
        hdr.demux_id = self.x.uuid().to_string();
        if let Err(e) = bundle.bcast(&hdr).await {
            warn!(name = %self.x.name(), %e, "sentinel progress request failed");
            self.x.abort(e.to_string());
            return QuiRes::Aborted;
        }
        QuiRes::Active
    }

    pub fn check_smap(&self, smap: &Smap, pending: &[String]) -> Result<()> {
        if smap.count_active() != self.nat {
            return Err(Error::MembershipChanges(format!(
                "{}: {} active targets vs {} at start",
                self.x.name(),
                smap.count_active(),
                self.nat
            )));
        }
        for tid in pending {
            if smap.in_maint_or_decomm(tid) {
                return Err(Error::MembershipChanges(format!(
                    "{}: target {tid} left or entered maintenance",
                    self.x.name()
                )));
            }
        }
        Ok(())
    }

    //
    // receive side
    //

    pub fn rx_done(&self, hdr: &ObjHdr) {
        if self.x.state().is_terminal() {
            return;
        }
        let Some(ap) = self.pend.lock().get(&hdr.sid).cloned() else {
            warn!(sid = %hdr.sid, "sentinel: 'done' from an unknown peer");
            return;
        };
        ap.last_ms.store(APAIR_DELETED, Ordering::Relaxed);
        info!(name = %self.x.name(), from = %hdr.sid, "sentinel: peer done");
    }

    pub fn rx_abort(&self, hdr: &ObjHdr) {
        if self.x.state().is_terminal() {
            return;
        }
        let why = if hdr.obj_name.is_empty() {
            format!("received abort from {}", hdr.sid)
        } else {
            format!("received abort from {}: {}", hdr.sid, hdr.obj_name)
        };
        self.x.abort(why);
    }

    /// Progress response carrying the peer's num-visited in `opaque`.
    pub fn rx_progress(&self, hdr: &ObjHdr) {
        let numvis = hdr
            .opaque
            .as_slice()
            .try_into()
            .map(i64::from_be_bytes)
            .unwrap_or(0);
        let Some(ap) = self.pend.lock().get(&hdr.sid).cloned() else {
            return;
        };
        let prev = ap.progress.swap(numvis, Ordering::Relaxed);
        if prev != numvis {
            // the peer is moving
            ap.last_ms.store(self.now_ms(), Ordering::Relaxed);
        }
    }

    /// Answer a `REQUEST` with our own num-visited — or with `DONE` once
    /// local work has completed.
    pub async fn respond(&self, bundle: &Bundle, to_tid: &str) {
        let op = if self.local_done.load(Ordering::Acquire) {
            opcode::DONE
        } else {
            opcode::RESPONSE
        };
        let mut hdr = ObjHdr::control(op);
        hdr.demux_id = self.x.uuid().to_string();
        hdr.opaque = self.x.objs_done().to_be_bytes().to_vec();
        let obj = SendObj {
            hdr,
            roc: None,
            on_done: None,
        };
        if let Err(e) = bundle.send(to_tid, obj).await {
            warn!(name = %self.x.name(), %e, "sentinel response failed");
        }
    }

    /// Dispatch one inbound control frame.
    pub async fn on_ctrl(&self, bundle: &Bundle, hdr: &ObjHdr) {
        match hdr.opcode {
            opcode::DONE => self.rx_done(hdr),
            opcode::ABORT => self.rx_abort(hdr),
            opcode::RESPONSE => self.rx_progress(hdr),
            opcode::REQUEST => self.respond(bundle, &hdr.sid).await,
            _ => {}
        }
    }
}
