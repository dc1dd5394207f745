//! Shared xaction state machine and progress accounting

use parking_lot::Mutex;
use serde::Serialize;
use shoal_common::Bck;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{info, warn};

const MAX_ERRS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum XactState {
    Pending,
    Running,
    /// Waiting for more input; distinct from finished.
    Idle,
    Aborted,
    Finished,
}

impl XactState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Idle,
            3 => Self::Aborted,
            _ => Self::Finished,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted | Self::Finished)
    }
}

/// Immutable point-in-time record of one xaction.
#[derive(Clone, Debug, Serialize)]
pub struct Snap {
    pub uuid: String,
    pub kind: String,
    pub bck: Option<Bck>,
    pub ctlmsg: String,
    pub state: XactState,
    pub start_ns: i64,
    pub end_ns: i64,
    pub objs_in: i64,
    pub bytes_in: i64,
    pub objs_out: i64,
    pub bytes_out: i64,
    pub objs_added: i64,
    pub bytes_added: i64,
    pub errs: Vec<String>,
    pub abort_err: Option<String>,
}

impl Snap {
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == XactState::Idle
    }
}

type Listener = Arc<dyn Fn(&Snap) + Send + Sync>;

pub struct XactBase {
    uuid: String,
    kind: &'static str,
    bck: Option<Bck>,
    ctlmsg: String,
    state: AtomicU8,
    start_ns: AtomicI64,
    end_ns: AtomicI64,
    objs_in: AtomicI64,
    bytes_in: AtomicI64,
    objs_out: AtomicI64,
    bytes_out: AtomicI64,
    objs_added: AtomicI64,
    bytes_added: AtomicI64,
    errs: Mutex<Vec<String>>,
    abort_err: Mutex<Option<String>>,
    abort_tx: watch::Sender<bool>,
    listeners: Mutex<Vec<Listener>>,
}

impl XactBase {
    #[must_use]
    pub fn new(uuid: &str, kind: &'static str, bck: Option<Bck>, ctlmsg: &str) -> Arc<Self> {
        let uuid = if uuid.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            uuid.to_string()
        };
        let (abort_tx, _) = watch::channel(false);
        Arc::new(Self {
            uuid,
            kind,
            bck,
            ctlmsg: ctlmsg.to_string(),
            state: AtomicU8::new(XactState::Pending as u8),
            start_ns: AtomicI64::new(0),
            end_ns: AtomicI64::new(0),
            objs_in: AtomicI64::new(0),
            bytes_in: AtomicI64::new(0),
            objs_out: AtomicI64::new(0),
            bytes_out: AtomicI64::new(0),
            objs_added: AtomicI64::new(0),
            bytes_added: AtomicI64::new(0),
            errs: Mutex::new(Vec::new()),
            abort_err: Mutex::new(None),
            abort_tx,
            listeners: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    #[must_use]
    pub fn bck(&self) -> Option<&Bck> {
        self.bck.as_ref()
    }

    #[must_use]
    pub fn ctlmsg(&self) -> &str {
        &self.ctlmsg
    }

    #[must_use]
    pub fn name(&self) -> String {
        match &self.bck {
            Some(bck) => format!("x-{}[{}]-{bck}", self.kind, self.uuid),
            None => format!("x-{}[{}]", self.kind, self.uuid),
        }
    }

    #[must_use]
    pub fn state(&self) -> XactState {
        XactState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn run(&self) {
        self.start_ns.store(now_ns(), Ordering::Relaxed);
        self.state
            .store(XactState::Running as u8, Ordering::Release);
        info!(name = %self.name(), ctlmsg = %self.ctlmsg, "xaction started");
    }

    /// Running → idle (job types that wait for more input).
    pub fn mark_idle(&self) {
        let _ = self.state.compare_exchange(
            XactState::Running as u8,
            XactState::Idle as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Idle → running on new input.
    pub fn mark_active(&self) {
        let _ = self.state.compare_exchange(
            XactState::Idle as u8,
            XactState::Running as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// First abort wins; repeated aborts are no-ops. Returns whether this
    /// call performed the transition.
    pub fn abort(&self, err: impl Into<String>) -> bool {
        let state = self.state.load(Ordering::Acquire);
        if XactState::from_u8(state).is_terminal() {
            return false;
        }
        let err = err.into();
        {
            let mut slot = self.abort_err.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(err.clone());
        }
        self.state
            .store(XactState::Aborted as u8, Ordering::Release);
        self.end_ns.store(now_ns(), Ordering::Relaxed);
        let _ = self.abort_tx.send(true);
        warn!(name = %self.name(), %err, "xaction aborted");
        self.notify();
        true
    }

    pub fn finish(&self) {
        let state = self.state.load(Ordering::Acquire);
        if XactState::from_u8(state).is_terminal() {
            return;
        }
        self.state
            .store(XactState::Finished as u8, Ordering::Release);
        self.end_ns.store(now_ns(), Ordering::Relaxed);
        let _ = self.abort_tx.send(true);
        info!(name = %self.name(), "xaction finished");
        self.notify();
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state() == XactState::Aborted
    }

    #[must_use]
    pub fn finished(&self) -> bool {
        self.state() == XactState::Finished
    }

    /// Watch channel that fires on any terminal transition.
    #[must_use]
    pub fn abort_watch(&self) -> watch::Receiver<bool> {
        self.abort_tx.subscribe()
    }

    pub fn add_err(&self, err: impl Into<String>) {
        let mut errs = self.errs.lock();
        if errs.len() < MAX_ERRS {
            errs.push(err.into());
        }
    }

    #[must_use]
    pub fn err_count(&self) -> usize {
        self.errs.lock().len()
    }

    pub fn objs_in_add(&self, n: i64, bytes: i64) {
        self.objs_in.fetch_add(n, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn objs_out_add(&self, n: i64, bytes: i64) {
        self.objs_out.fetch_add(n, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn objs_add(&self, n: i64, bytes: i64) {
        self.objs_added.fetch_add(n, Ordering::Relaxed);
        self.bytes_added.fetch_add(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn objs_done(&self) -> i64 {
        self.objs_added.load(Ordering::Relaxed)
    }

    /// Register a terminal-transition listener (typically the notifier
    /// that pings the information-center gateways).
    pub fn on_terminated(&self, listener: Listener) {
        self.listeners.lock().push(listener);
    }

    fn notify(&self) {
        let snap = self.snap();
        for listener in self.listeners.lock().iter() {
            listener(&snap);
        }
    }

    #[must_use]
    pub fn snap(&self) -> Snap {
        Snap {
            uuid: self.uuid.clone(),
            kind: self.kind.to_string(),
            bck: self.bck.clone(),
            ctlmsg: self.ctlmsg.clone(),
            state: self.state(),
            start_ns: self.start_ns.load(Ordering::Relaxed),
            end_ns: self.end_ns.load(Ordering::Relaxed),
            objs_in: self.objs_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            objs_out: self.objs_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            objs_added: self.objs_added.load(Ordering::Relaxed),
            bytes_added: self.bytes_added.load(Ordering::Relaxed),
            errs: self.errs.lock().clone(),
            abort_err: self.abort_err.lock().clone(),
        }
    }
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_lifecycle() {
        let x = XactBase::new("", crate::kind::CLEANUP, None, "");
        assert_eq!(x.state(), XactState::Pending);
        x.run();
        assert_eq!(x.state(), XactState::Running);
        x.mark_idle();
        assert_eq!(x.state(), XactState::Idle);
        x.mark_active();
        x.finish();
        assert!(x.finished());
        // terminal is sticky
        assert!(!x.abort("late"));
        assert!(x.finished());
    }

    #[test]
    fn test_first_abort_wins() {
        let x = XactBase::new("u1", crate::kind::REBALANCE, None, "");
        x.run();
        assert!(x.abort("cause-1"));
        assert!(!x.abort("cause-2"));
        let snap = x.snap();
        assert_eq!(snap.state, XactState::Aborted);
        assert_eq!(snap.abort_err.as_deref(), Some("cause-1"));
    }

    #[test]
    fn test_counters_and_errs() {
        let x = XactBase::new("", crate::kind::TCB, Some(Bck::ais("b")), "etl=pipeline");
        x.run();
        x.objs_in_add(2, 100);
        x.objs_out_add(1, 50);
        x.objs_add(3, 300);
        for i in 0..100 {
            x.add_err(format!("e{i}"));
        }
        let snap = x.snap();
        assert_eq!(snap.objs_in, 2);
        assert_eq!(snap.bytes_out, 50);
        assert_eq!(snap.objs_added, 3);
        assert_eq!(snap.errs.len(), MAX_ERRS, "error log is bounded");
        assert_eq!(snap.ctlmsg, "etl=pipeline");
    }

    #[test]
    fn test_notification_on_terminal() {
        let x = XactBase::new("", crate::kind::LRU, None, "");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        x.on_terminated(Arc::new(move |snap| {
            assert!(snap.state.is_terminal());
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        x.run();
        x.finish();
        x.finish();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_watch() {
        let x = XactBase::new("", crate::kind::PREFETCH, None, "");
        let mut watch = x.abort_watch();
        assert!(!*watch.borrow());
        x.abort("go away");
        watch.changed().await.unwrap();
        assert!(*watch.borrow());
    }
}
