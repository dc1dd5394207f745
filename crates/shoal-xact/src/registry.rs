//! Xaction registry: renew-or-reuse semantics
//!
//! One renewable entry per `(kind, bucket)` or `(kind, uuid)`. Renewal
//! of a running non-preemptible xaction reuses it; preemptible kinds
//! (resilver) abort the predecessor. Interruption of rebalance/resilver
//! leaves a marker that gates misplaced-object removal.

use crate::base::{XactBase, XactState};
use crate::kind;
use parking_lot::Mutex;
use shoal_common::Bck;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub enum RenewRes {
    /// Fresh instance; the caller drives it.
    New(Arc<XactBase>),
    /// A previous instance is still running; use it.
    UsePrev(Arc<XactBase>),
    /// A previous instance is running and cannot be reused or preempted
    /// (conflicting control message); the caller must back off.
    Refused(String),
}

impl RenewRes {
    /// The renewed (or reused) entry; panics on a refused renewal.
    #[must_use]
    pub fn entry(&self) -> &Arc<XactBase> {
        match self {
            Self::New(x) | Self::UsePrev(x) => x,
            Self::Refused(why) => panic!("renewal refused: {why}"),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::UsePrev(_))
    }

    #[must_use]
    pub fn is_refused(&self) -> bool {
        matches!(self, Self::Refused(_))
    }
}

#[derive(Default)]
pub struct XactRegistry {
    entries: Mutex<HashMap<String, Arc<XactBase>>>,
    /// Kinds whose last instance terminated without finishing.
    interrupted: Mutex<HashSet<&'static str>>,
}

fn key(kind: &str, bck: Option<&Bck>, uuid: &str) -> String {
    match bck {
        Some(bck) => format!("{kind}/{bck}"),
        None if !uuid.is_empty() => format!("{kind}/{uuid}"),
        None => kind.to_string(),
    }
}

impl XactRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Renew the entry for `(kind, bck | uuid)`. A running predecessor
    /// is reused when the control message matches, preempted for
    /// preemptible kinds, and refused otherwise.
    pub fn renew(
        &self,
        xkind: &'static str,
        bck: Option<&Bck>,
        uuid: &str,
        ctlmsg: &str,
    ) -> RenewRes {
        let k = key(xkind, bck, uuid);
        let mut entries = self.entries.lock();
        if let Some(prev) = entries.get(&k) {
            if !prev.state().is_terminal() {
                if kind::is_preemptible(xkind) {
                    prev.abort("preempted by renewal");
                } else if prev.ctlmsg() == ctlmsg {
                    return RenewRes::UsePrev(Arc::clone(prev));
                } else {
                    return RenewRes::Refused(format!(
                        "{} is running with {:?}, requested {ctlmsg:?}",
                        prev.name(),
                        prev.ctlmsg()
                    ));
                }
            }
        }
        let x = XactBase::new(uuid, xkind, bck.cloned(), ctlmsg);
        entries.insert(k, Arc::clone(&x));
        RenewRes::New(x)
    }

    #[must_use]
    pub fn get_by_uuid(&self, uuid: &str) -> Option<Arc<XactBase>> {
        self.entries
            .lock()
            .values()
            .find(|x| x.uuid() == uuid)
            .cloned()
    }

    /// The (single) non-terminal instance of a kind, if any.
    #[must_use]
    pub fn get_running(&self, xkind: &str) -> Option<Arc<XactBase>> {
        self.entries
            .lock()
            .values()
            .find(|x| x.kind() == xkind && !x.state().is_terminal())
            .cloned()
    }

    pub fn abort_all(&self, err: &str) {
        for x in self.entries.lock().values() {
            x.abort(err);
        }
    }

    #[must_use]
    pub fn snaps(&self) -> Vec<crate::base::Snap> {
        let mut snaps: Vec<_> = self.entries.lock().values().map(|x| x.snap()).collect();
        snaps.sort_by(|a, b| a.start_ns.cmp(&b.start_ns));
        snaps
    }

    /// Drop terminal entries (periodic housekeeping).
    pub fn gc(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, x| {
            if x.state() == XactState::Aborted
                && matches!(x.kind(), kind::REBALANCE | kind::RESILVER)
            {
                self.interrupted.lock().insert(x.kind());
            }
            !x.state().is_terminal()
        });
        before - entries.len()
    }

    /// Mark rebalance/resilver as interrupted (set on abort or on
    /// finding a stale restart marker).
    pub fn mark_interrupted(&self, xkind: &'static str) {
        self.interrupted.lock().insert(xkind);
    }

    pub fn clear_interrupted(&self, xkind: &str) {
        self.interrupted.lock().remove(xkind);
    }

    #[must_use]
    pub fn is_interrupted(&self, xkind: &str) -> bool {
        self.interrupted.lock().contains(xkind)
    }

    /// Gate for misplaced-object removal: no rebalance/resilver running
    /// or interrupted.
    #[must_use]
    pub fn safe_to_rm_misplaced(&self) -> bool {
        self.get_running(kind::REBALANCE).is_none()
            && self.get_running(kind::RESILVER).is_none()
            && !self.is_interrupted(kind::REBALANCE)
            && !self.is_interrupted(kind::RESILVER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renew_reuses_running() {
        let reg = XactRegistry::new();
        let bck = Bck::ais("b");
        let r1 = reg.renew(kind::CLEANUP, Some(&bck), "", "");
        assert!(!r1.is_running());
        r1.entry().run();

        let r2 = reg.renew(kind::CLEANUP, Some(&bck), "", "");
        assert!(r2.is_running());
        assert_eq!(r2.entry().uuid(), r1.entry().uuid());

        r1.entry().finish();
        let r3 = reg.renew(kind::CLEANUP, Some(&bck), "", "");
        assert!(!r3.is_running());
        assert_ne!(r3.entry().uuid(), r1.entry().uuid());
    }

    #[test]
    fn test_conflicting_ctlmsg_refused() {
        let reg = XactRegistry::new();
        let bck = Bck::ais("b");
        let r1 = reg.renew(kind::TCB, Some(&bck), "", "etl=to-upper");
        r1.entry().run();

        // same job, same control message: reuse
        let r2 = reg.renew(kind::TCB, Some(&bck), "", "etl=to-upper");
        assert!(r2.is_running());

        // same job, different control message: neither reuse nor preempt
        let r3 = reg.renew(kind::TCB, Some(&bck), "", "etl=gzip");
        assert!(r3.is_refused());
        match r3 {
            RenewRes::Refused(why) => {
                assert!(why.contains("etl=to-upper"), "{why}");
                assert!(why.contains("etl=gzip"), "{why}");
            }
            _ => unreachable!(),
        }
        assert!(!r1.entry().state().is_terminal(), "running instance untouched");

        // once the predecessor finishes, the conflicting renewal goes through
        r1.entry().finish();
        let r4 = reg.renew(kind::TCB, Some(&bck), "", "etl=gzip");
        assert!(!r4.is_running() && !r4.is_refused());
    }

    #[test]
    fn test_resilver_preempts() {
        let reg = XactRegistry::new();
        let r1 = reg.renew(kind::RESILVER, None, "", "");
        r1.entry().run();
        let r2 = reg.renew(kind::RESILVER, None, "", "");
        assert!(!r2.is_running(), "resilver is always preempted");
        assert!(r1.entry().is_aborted());
        assert!(!r2.entry().state().is_terminal());
    }

    #[test]
    fn test_interrupted_marker_gates_misplaced() {
        let reg = XactRegistry::new();
        assert!(reg.safe_to_rm_misplaced());

        let r = reg.renew(kind::REBALANCE, None, "g1", "");
        r.entry().run();
        assert!(!reg.safe_to_rm_misplaced(), "rebalance is running");

        r.entry().abort("node lost");
        reg.gc();
        assert!(
            !reg.safe_to_rm_misplaced(),
            "aborted rebalance leaves the interrupted marker"
        );

        reg.clear_interrupted(kind::REBALANCE);
        assert!(reg.safe_to_rm_misplaced());
    }

    #[test]
    fn test_gc_drops_terminal() {
        let reg = XactRegistry::new();
        let r = reg.renew(kind::LRU, None, "", "");
        r.entry().run();
        assert_eq!(reg.gc(), 0);
        r.entry().finish();
        assert_eq!(reg.gc(), 1);
        assert!(reg.get_running(kind::LRU).is_none());
    }

    #[test]
    fn test_uuid_scoped_entries() {
        let reg = XactRegistry::new();
        let a = reg.renew(kind::TCO, None, "job-1", "");
        let b = reg.renew(kind::TCO, None, "job-2", "");
        a.entry().run();
        b.entry().run();
        assert!(reg.get_by_uuid("job-1").is_some());
        assert!(reg.get_by_uuid("job-2").is_some());
        assert_ne!(a.entry().uuid(), b.entry().uuid());
    }
}
