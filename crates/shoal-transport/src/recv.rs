//! Receiver side: accept loop and per-connection demux
//!
//! Handlers register under a transport name; the connection handshake
//! binds each inbound flow to one name. Whatever payload a handler leaves
//! unread is drained by the loop, so one sloppy receiver cannot corrupt
//! the framing for the frames behind it.

use crate::hdr::ObjHdr;
use crate::opcode;
use crate::pdu::ObjReader;
use async_trait::async_trait;
use parking_lot::RwLock;
use shoal_common::{Error, Result};
use shoal_stats::{named, Tracker};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// One registered receive endpoint.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// An object frame; `reader` must be fully drained (the demux loop
    /// finishes the job if the handler bails early).
    async fn recv_obj(
        &self,
        hdr: ObjHdr,
        reader: &mut ObjReader<'_, BufReader<tokio::net::tcp::OwnedReadHalf>>,
    ) -> Result<()>;

    /// A header-only control frame (FIN and the sentinel opcodes).
    async fn recv_ctrl(&self, hdr: ObjHdr) -> Result<()> {
        let _ = hdr;
        Ok(())
    }
}

/// Transport-name → receiver registry plus the accept loop.
pub struct Demux {
    handlers: RwLock<HashMap<String, Arc<dyn Receiver>>>,
    stats: Arc<Tracker>,
    max_hdr_size: usize,
}

impl Demux {
    #[must_use]
    pub fn new(stats: Arc<Tracker>, max_hdr_size: usize) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            stats,
            max_hdr_size,
        })
    }

    /// Register; duplicate names are refused.
    pub fn handle(&self, trname: &str, receiver: Arc<dyn Receiver>) -> Result<()> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(trname) {
            return Err(Error::AlreadyExists(format!("transport endpoint {trname:?}")));
        }
        handlers.insert(trname.to_string(), receiver);
        Ok(())
    }

    pub fn unhandle(&self, trname: &str) -> Result<()> {
        self.handlers
            .write()
            .remove(trname)
            .map(|_| ())
            .ok_or_else(|| Error::Fatal(format!("unknown transport endpoint {trname:?}")))
    }

    fn lookup(&self, trname: &str) -> Option<Arc<dyn Receiver>> {
        self.handlers.read().get(trname).cloned()
    }

    /// Bind and serve until the task is dropped. Returns the bound
    /// address (useful with port 0).
    pub async fn serve(self: &Arc<Self>, listen: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| Error::io(format!("bind {listen}"), e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::io("local addr", e))?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((sock, peer)) => {
                        let this = Arc::clone(&this);
                        tokio::spawn(async move {
                            if let Err(err) = this.serve_conn(sock).await {
                                warn!(%peer, %err, "inbound stream terminated");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        Ok(addr)
    }

    async fn serve_conn(&self, sock: TcpStream) -> Result<()> {
        sock.set_nodelay(true).ok();
        let (rd, _wr) = sock.into_split();
        let mut rd = BufReader::new(rd);

        // handshake binds this flow to a transport name
        let hello = ObjHdr::read_from(&mut rd, self.max_hdr_size)
            .await?
            .ok_or_else(|| Error::Fatal("connection closed before handshake".into()))?;
        if hello.opcode != opcode::HELLO {
            return Err(Error::Fatal(format!(
                "expected handshake, got opcode {}",
                hello.opcode
            )));
        }
        let trname = hello.obj_name.clone();
        let handler = self
            .lookup(&trname)
            .ok_or_else(|| Error::Fatal(format!("unknown transport endpoint {trname:?}")))?;
        debug!(%trname, sid = %hello.sid, sess_id = hello.sess_id, "inbound stream");

        loop {
            let Some(hdr) = ObjHdr::read_from(&mut rd, self.max_hdr_size).await? else {
                return Ok(());
            };
            match hdr.opcode {
                opcode::FIN => return Ok(()),
                opcode::OBJ => {
                    let size = hdr.size;
                    let compressed = hdr.compressed;
                    let mut reader = ObjReader::new(&mut rd, size, compressed);
                    let res = handler.recv_obj(hdr, &mut reader).await;
                    // framing integrity first, handler verdict second
                    reader.drain().await?;
                    self.stats.inc(named::STREAM_IN_COUNT);
                    if let Err(err) = res {
                        self.stats.inc(&named::err("stream-in"));
                        warn!(%err, "receive handler failed");
                    }
                }
                _ => {
                    if let Err(err) = handler.recv_ctrl(hdr).await {
                        warn!(%err, "control handler failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{SendObj, Stream, StreamOpts};
    use parking_lot::Mutex;

    struct Capture {
        objs: Mutex<Vec<(String, Vec<u8>)>>,
        ctrls: Mutex<Vec<i32>>,
    }

    #[async_trait]
    impl Receiver for Capture {
        async fn recv_obj(
            &self,
            hdr: ObjHdr,
            reader: &mut ObjReader<'_, BufReader<tokio::net::tcp::OwnedReadHalf>>,
        ) -> Result<()> {
            let body = reader.read_to_end().await?;
            self.objs.lock().push((hdr.obj_name, body));
            Ok(())
        }

        async fn recv_ctrl(&self, hdr: ObjHdr) -> Result<()> {
            self.ctrls.lock().push(hdr.opcode);
            Ok(())
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_framing_sized_pdu_and_control() {
        let stats = Arc::new(Tracker::new());
        let demux = Demux::new(Arc::clone(&stats), 4096);
        let capture = Arc::new(Capture {
            objs: Mutex::new(Vec::new()),
            ctrls: Mutex::new(Vec::new()),
        });
        demux.handle("test-ep", capture.clone()).unwrap();
        let addr = demux.serve("127.0.0.1:0").await.unwrap();

        let opts = StreamOpts::new("test-ep", "t-sender", Arc::clone(&stats));
        let mut stream = Stream::new(&addr.to_string(), opts);

        // sized frame
        let payload = vec![3u8; 10_000];
        let mut hdr = ObjHdr::default();
        hdr.obj_name = "sized".into();
        hdr.size = payload.len() as i64;
        stream
            .send(
                SendObj {
                    hdr,
                    roc: Some(Box::new(std::io::Cursor::new(payload.clone()))),
                    on_done: None,
                })
            .await
            .unwrap();

        // unsized (PDU) frame
        let mut hdr = ObjHdr::default();
        hdr.obj_name = "unsized".into();
        hdr.size = -1;
        stream
            .send(
                SendObj {
                    hdr,
                    roc: Some(Box::new(std::io::Cursor::new(b"streaming-compose".to_vec()))),
                    on_done: None,
                })
            .await
            .unwrap();

        // control frame
        stream
            .send(SendObj::control(crate::opcode::DONE))
            .await
            .unwrap();

        wait_until(|| capture.objs.lock().len() == 2 && capture.ctrls.lock().len() == 1).await;
        let objs = capture.objs.lock();
        assert_eq!(objs[0].0, "sized");
        assert_eq!(objs[0].1, payload);
        assert_eq!(objs[1].0, "unsized");
        assert_eq!(objs[1].1, b"streaming-compose");
        assert_eq!(capture.ctrls.lock()[0], crate::opcode::DONE);

        stream.fin().await;
    }

    #[tokio::test]
    async fn test_compressed_stream() {
        let stats = Arc::new(Tracker::new());
        let demux = Demux::new(Arc::clone(&stats), 4096);
        let capture = Arc::new(Capture {
            objs: Mutex::new(Vec::new()),
            ctrls: Mutex::new(Vec::new()),
        });
        demux.handle("lz4-ep", capture.clone()).unwrap();
        let addr = demux.serve("127.0.0.1:0").await.unwrap();

        let mut opts = StreamOpts::new("lz4-ep", "t-sender", Arc::clone(&stats));
        opts.compress = true;
        let mut stream = Stream::new(&addr.to_string(), opts);

        let payload = vec![9u8; 300_000];
        let mut hdr = ObjHdr::default();
        hdr.obj_name = "big".into();
        hdr.size = payload.len() as i64;
        stream
            .send(
                SendObj {
                    hdr,
                    roc: Some(Box::new(std::io::Cursor::new(payload.clone()))),
                    on_done: None,
                })
            .await
            .unwrap();

        wait_until(|| !capture.objs.lock().is_empty()).await;
        assert_eq!(capture.objs.lock()[0].1, payload);
        stream.fin().await;
    }

    #[tokio::test]
    async fn test_sloppy_receiver_does_not_break_framing() {
        struct Sloppy {
            names: Mutex<Vec<String>>,
        }
        #[async_trait]
        impl Receiver for Sloppy {
            async fn recv_obj(
                &self,
                hdr: ObjHdr,
                _reader: &mut ObjReader<'_, BufReader<tokio::net::tcp::OwnedReadHalf>>,
            ) -> Result<()> {
                // never reads the payload
                self.names.lock().push(hdr.obj_name);
                Ok(())
            }
        }

        let stats = Arc::new(Tracker::new());
        let demux = Demux::new(Arc::clone(&stats), 4096);
        let sloppy = Arc::new(Sloppy {
            names: Mutex::new(Vec::new()),
        });
        demux.handle("sloppy-ep", sloppy.clone()).unwrap();
        let addr = demux.serve("127.0.0.1:0").await.unwrap();

        let opts = StreamOpts::new("sloppy-ep", "t", Arc::clone(&stats));
        let mut stream = Stream::new(&addr.to_string(), opts);
        for i in 0..3 {
            let mut hdr = ObjHdr::default();
            hdr.obj_name = format!("o{i}");
            hdr.size = 1000;
            stream
                .send(SendObj {
                    hdr,
                    roc: Some(Box::new(std::io::Cursor::new(vec![i as u8; 1000]))),
                    on_done: None,
                })
                .await
                .unwrap();
        }
        wait_until(|| sloppy.names.lock().len() == 3).await;
        assert_eq!(*sloppy.names.lock(), vec!["o0", "o1", "o2"]);
        stream.fin().await;
    }

    #[tokio::test]
    async fn test_duplicate_registration_refused() {
        let stats = Arc::new(Tracker::new());
        let demux = Demux::new(stats, 4096);
        let capture = Arc::new(Capture {
            objs: Mutex::new(Vec::new()),
            ctrls: Mutex::new(Vec::new()),
        });
        demux.handle("dup", capture.clone()).unwrap();
        assert!(demux.handle("dup", capture.clone()).is_err());
        demux.unhandle("dup").unwrap();
        assert!(demux.unhandle("dup").is_err());
    }
}
