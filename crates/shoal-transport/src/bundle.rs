//! Stream bundles and the data mover (DM)
//!
//! A bundle is `multiplier` streams per destination; the DM pairs a data
//! bundle with an optional ACK/control sub-bundle and owns the receive
//! registration. Cluster-map changes rebuild the bundle — streams are
//! immutable once opened.

use crate::recv::{Demux, Receiver};
use crate::stream::{SendObj, Stream, StreamOpts};
use crate::{hdr::ObjHdr, opcode};
use shoal_common::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// One destination target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub tid: String,
    pub addr: String,
}

pub struct Bundle {
    streams: HashMap<String, Vec<Stream>>,
    rr: AtomicUsize,
}

impl Bundle {
    /// Open `multiplier` streams to every peer.
    #[must_use]
    pub fn open(peers: &[Peer], multiplier: usize, opts: &StreamOpts) -> Self {
        let mult = multiplier.max(1);
        let mut streams = HashMap::with_capacity(peers.len());
        for peer in peers {
            let flows = (0..mult)
                .map(|_| Stream::new(&peer.addr, opts.clone()))
                .collect();
            streams.insert(peer.tid.clone(), flows);
        }
        Self {
            streams,
            rr: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn peers(&self) -> Vec<&str> {
        self.streams.keys().map(String::as_str).collect()
    }

    /// Send one object to one destination (round-robin across the
    /// destination's streams).
    pub async fn send(&self, dst_tid: &str, obj: SendObj) -> Result<()> {
        let flows = self
            .streams
            .get(dst_tid)
            .ok_or_else(|| Error::Fatal(format!("no stream to target {dst_tid}")))?;
        let i = self.rr.fetch_add(1, Ordering::Relaxed) % flows.len();
        flows[i].send(obj).await
    }

    /// Header-only broadcast to every peer.
    pub async fn bcast(&self, hdr: &ObjHdr) -> Result<()> {
        let mut first_err = None;
        for flows in self.streams.values() {
            let obj = SendObj {
                hdr: hdr.clone(),
                roc: None,
                on_done: None,
            };
            if let Err(e) = flows[0].send(obj).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// FIN and drain every stream.
    pub async fn close(&mut self) {
        for flows in self.streams.values_mut() {
            for stream in flows.iter_mut() {
                stream.fin().await;
            }
        }
    }
}

/// Data mover: a registered receive endpoint plus its outbound bundle(s).
pub struct Dm {
    pub trname: String,
    pub data: Bundle,
    pub ack: Option<Bundle>,
    demux: Arc<Demux>,
}

impl Dm {
    /// Register the receive side and open the outbound flows.
    pub fn new(
        demux: &Arc<Demux>,
        trname: &str,
        recv: Arc<dyn Receiver>,
        recv_ack: Option<Arc<dyn Receiver>>,
        peers: &[Peer],
        multiplier: usize,
        opts: &StreamOpts,
    ) -> Result<Self> {
        demux.handle(trname, recv)?;
        let ack_trname = format!("ack.{trname}");
        let ack = match recv_ack {
            None => None,
            Some(r) => {
                if let Err(e) = demux.handle(&ack_trname, r) {
                    let _ = demux.unhandle(trname);
                    return Err(e);
                }
                let mut ack_opts = opts.clone();
                ack_opts.trname = ack_trname;
                Some(Bundle::open(peers, 1, &ack_opts))
            }
        };
        let mut data_opts = opts.clone();
        data_opts.trname = trname.to_string();
        info!(trname, npeers = peers.len(), multiplier, "data mover open");
        Ok(Self {
            trname: trname.to_string(),
            data: Bundle::open(peers, multiplier, &data_opts),
            ack,
            demux: Arc::clone(demux),
        })
    }

    /// Graceful close: FIN everything, then drop the registrations.
    pub async fn close(&mut self, graceful_fin: bool) {
        if graceful_fin {
            let _ = self.data.bcast(&ObjHdr::control(opcode::FIN)).await;
        }
        self.data.close().await;
        if let Some(ack) = self.ack.as_mut() {
            ack.close().await;
        }
        let _ = self.demux.unhandle(&self.trname);
        let _ = self.demux.unhandle(&format!("ack.{}", self.trname));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::ObjReader;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use shoal_stats::Tracker;
    use tokio::io::BufReader;

    struct Count {
        objs: Mutex<Vec<String>>,
        ctrl: Mutex<Vec<i32>>,
    }

    #[async_trait]
    impl Receiver for Count {
        async fn recv_obj(
            &self,
            hdr: ObjHdr,
            reader: &mut ObjReader<'_, BufReader<tokio::net::tcp::OwnedReadHalf>>,
        ) -> shoal_common::Result<()> {
            reader.drain().await?;
            self.objs.lock().push(hdr.obj_name);
            Ok(())
        }

        async fn recv_ctrl(&self, hdr: ObjHdr) -> shoal_common::Result<()> {
            self.ctrl.lock().push(hdr.opcode);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dm_send_and_bcast() {
        let stats = Arc::new(Tracker::new());
        let demux = Demux::new(Arc::clone(&stats), 4096);
        let count = Arc::new(Count {
            objs: Mutex::new(Vec::new()),
            ctrl: Mutex::new(Vec::new()),
        });
        let addr = demux.serve("127.0.0.1:0").await.unwrap();

        let peers = vec![Peer {
            tid: "self".into(),
            addr: addr.to_string(),
        }];
        let opts = StreamOpts::new("reb-dm", "self", Arc::clone(&stats));
        let mut dm = Dm::new(&demux, "reb-dm", count.clone(), None, &peers, 2, &opts).unwrap();

        for i in 0..4 {
            let mut hdr = ObjHdr::default();
            hdr.obj_name = format!("o{i}");
            hdr.size = 4;
            dm.data
                .send(
                    "self",
                    SendObj {
                        hdr,
                        roc: Some(Box::new(std::io::Cursor::new(b"data".to_vec()))),
                        on_done: None,
                    },
                )
                .await
                .unwrap();
        }
        dm.data.bcast(&ObjHdr::control(opcode::DONE)).await.unwrap();

        for _ in 0..200 {
            if count.objs.lock().len() == 4 && !count.ctrl.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(count.objs.lock().len(), 4);
        assert!(count.ctrl.lock().contains(&opcode::DONE));

        dm.close(false).await;
        // trname is free again
        demux.handle("reb-dm", count.clone()).unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let stats = Arc::new(Tracker::new());
        let opts = StreamOpts::new("x", "self", stats);
        let bundle = Bundle::open(&[], 1, &opts);
        let res = bundle.send("ghost", SendObj::control(opcode::DONE)).await;
        assert!(res.is_err());
    }
}
