//! Sender side: one long-lived flow with a single-writer loop
//!
//! Callers enqueue onto a bounded work channel — the API never blocks the
//! data path silently: a full channel bumps the `chan-full.n` counter
//! before the awaited enqueue. The writer task owns the socket.

use crate::hdr::{ObjHdr, SIZE_UNKNOWN};
use crate::opcode;
use crate::pdu::write_pdus;
use shoal_common::{Error, Result};
use shoal_stats::{named, Tracker};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Payload source: anything streamable. `None` for header-only frames.
pub type Roc = Box<dyn AsyncRead + Send + Unpin>;

pub struct SendObj {
    pub hdr: ObjHdr,
    pub roc: Option<Roc>,
    /// Completion notification (delivery to the socket, not the peer).
    pub on_done: Option<oneshot::Sender<Result<()>>>,
}

impl SendObj {
    #[must_use]
    pub fn control(op: i32) -> Self {
        Self {
            hdr: ObjHdr::control(op),
            roc: None,
            on_done: None,
        }
    }
}

#[derive(Clone)]
pub struct StreamOpts {
    pub trname: String,
    pub sid: String,
    pub burst: usize,
    pub max_hdr_size: usize,
    pub size_pdu: usize,
    pub compress: bool,
    /// Upper bound for connect/retry backoff.
    pub max_backoff: Duration,
    pub stats: Arc<Tracker>,
}

impl StreamOpts {
    #[must_use]
    pub fn new(trname: &str, sid: &str, stats: Arc<Tracker>) -> Self {
        Self {
            trname: trname.to_string(),
            sid: sid.to_string(),
            burst: 128,
            max_hdr_size: 4 * 1024,
            size_pdu: 128 * 1024,
            compress: false,
            max_backoff: Duration::from_secs(4),
            stats,
        }
    }
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

enum Item {
    Obj(Box<SendObj>),
    Fin,
}

/// One sender flow to one destination.
pub struct Stream {
    tx: mpsc::Sender<Item>,
    pub sess_id: u64,
    dst: String,
    stats: Arc<Tracker>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Stream {
    /// Open a stream; the connection is established (and re-established)
    /// by the writer task with bounded exponential backoff.
    #[must_use]
    pub fn new(dst_addr: &str, opts: StreamOpts) -> Self {
        let sess_id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(opts.burst.max(1));
        let dst = dst_addr.to_string();
        let stats = Arc::clone(&opts.stats);
        let task = tokio::spawn(writer_loop(dst.clone(), sess_id, opts, rx));
        Self {
            tx,
            sess_id,
            dst,
            stats,
            task: Some(task),
        }
    }

    /// Enqueue; a full channel is observable via `chan-full.n` and then
    /// awaits capacity.
    pub async fn send(&self, obj: SendObj) -> Result<()> {
        let mut item = Item::Obj(Box::new(obj));
        match self.tx.try_send(item) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Full(back)) => {
                self.stats.inc(named::CHAN_FULL_COUNT);
                item = back;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(Error::Unavailable(format!("stream to {} is closed", self.dst)));
            }
        }
        self.tx
            .send(item)
            .await
            .map_err(|_| Error::Unavailable(format!("stream to {} is closed", self.dst)))
    }

    /// Graceful close: FIN then drain.
    pub async fn fin(&mut self) {
        let _ = self.tx.send(Item::Fin).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    #[must_use]
    pub fn dst(&self) -> &str {
        &self.dst
    }
}

async fn connect(dst: &str, max_backoff: Duration) -> Result<TcpStream> {
    let mut backoff = Duration::from_millis(100);
    let mut attempt = 0u32;
    loop {
        match TcpStream::connect(dst).await {
            Ok(sock) => {
                sock.set_nodelay(true).ok();
                return Ok(sock);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= 6 {
                    return Err(Error::Unavailable(format!("connect {dst}: {e}")));
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

async fn writer_loop(dst: String, sess_id: u64, opts: StreamOpts, mut rx: mpsc::Receiver<Item>) {
    let mut conn: Option<BufWriter<TcpStream>> = None;
    while let Some(item) = rx.recv().await {
        match item {
            Item::Fin => {
                if let Some(mut w) = conn.take() {
                    let mut fin = ObjHdr::control(opcode::FIN);
                    fin.sid = opts.sid.clone();
                    fin.sess_id = sess_id;
                    let _ = fin.write_to(&mut w, opts.max_hdr_size).await;
                    let _ = w.flush().await;
                    let _ = w.into_inner().shutdown().await;
                }
                return;
            }
            Item::Obj(mut obj) => {
                let res = transmit(&dst, sess_id, &opts, &mut conn, &mut obj).await;
                if let Err(err) = &res {
                    warn!(%dst, %err, "stream transmit failed");
                    opts.stats.inc(&named::err("stream-out"));
                    conn = None;
                }
                if let Some(done) = obj.on_done.take() {
                    let _ = done.send(res);
                }
            }
        }
    }
    // channel dropped without FIN
    if let Some(mut w) = conn.take() {
        let _ = w.flush().await;
    }
}

async fn transmit(
    dst: &str,
    sess_id: u64,
    opts: &StreamOpts,
    conn: &mut Option<BufWriter<TcpStream>>,
    obj: &mut SendObj,
) -> Result<()> {
    if conn.is_none() {
        let sock = connect(dst, opts.max_backoff).await?;
        let mut w = BufWriter::new(sock);
        // handshake: a control frame naming the transport endpoint
        let mut hello = ObjHdr::control(opcode::HELLO);
        hello.sid = opts.sid.clone();
        hello.sess_id = sess_id;
        hello.obj_name = opts.trname.clone();
        hello.write_to(&mut w, opts.max_hdr_size).await?;
        w.flush().await.map_err(|e| Error::io("flush handshake", e))?;
        debug!(%dst, trname = %opts.trname, sess_id, "stream connected");
        *conn = Some(w);
    }
    let w = conn.as_mut().unwrap();

    obj.hdr.sid = opts.sid.clone();
    obj.hdr.sess_id = sess_id;
    if obj.roc.is_some() && (opts.compress || obj.hdr.size < 0) {
        obj.hdr.compressed = opts.compress;
        obj.hdr.size = SIZE_UNKNOWN;
    }
    obj.hdr.write_to(w, opts.max_hdr_size).await?;

    if let Some(roc) = obj.roc.as_mut() {
        let (raw, _wire) = if obj.hdr.size >= 0 {
            let n = tokio::io::copy(roc, w)
                .await
                .map_err(|e| Error::io("copy payload", e))?;
            if n != obj.hdr.size as u64 {
                return Err(Error::Fatal(format!(
                    "{}: payload is {n}B, header declared {}B",
                    obj.hdr.obj_name, obj.hdr.size
                )));
            }
            (n, n)
        } else {
            write_pdus(roc.as_mut(), w, opts.size_pdu, opts.compress).await?
        };
        opts.stats.inc(named::STREAM_OUT_COUNT);
        opts.stats.add(named::STREAM_OUT_SIZE, raw as i64);
    }
    w.flush().await.map_err(|e| Error::io("flush frame", e))?;
    Ok(())
}
