//! Shared demux (SDM)
//!
//! One process-wide data mover under the `shared-dm` transport name;
//! xactions register receivers keyed by their UUID and inbound frames
//! route on the header's demux id. Receivers that stop seeing traffic
//! age out on the housekeeper tick.

use crate::hdr::ObjHdr;
use crate::pdu::ObjReader;
use crate::recv::Receiver;
use async_trait::async_trait;
use parking_lot::RwLock;
use shoal_common::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tracing::warn;

/// Default idle-receiver eviction age.
pub const SDM_IDLE_EVICT: Duration = Duration::from_secs(10 * 60);

struct SdmEntry {
    recv: Arc<dyn Receiver>,
    /// Milliseconds since the SDM's epoch.
    last_active_ms: AtomicU64,
}

pub struct SharedDm {
    entries: RwLock<HashMap<String, Arc<SdmEntry>>>,
    epoch: Instant,
}

impl Default for SharedDm {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDm {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn register(&self, uuid: &str, recv: Arc<dyn Receiver>) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(uuid) {
            return Err(Error::AlreadyExists(format!("sdm receiver {uuid}")));
        }
        entries.insert(
            uuid.to_string(),
            Arc::new(SdmEntry {
                recv,
                last_active_ms: AtomicU64::new(self.now_ms()),
            }),
        );
        Ok(())
    }

    pub fn unregister(&self, uuid: &str) {
        self.entries.write().remove(uuid);
    }

    #[must_use]
    pub fn is_registered(&self, uuid: &str) -> bool {
        self.entries.read().contains_key(uuid)
    }

    fn route(&self, uuid: &str) -> Option<Arc<SdmEntry>> {
        let entry = self.entries.read().get(uuid).cloned()?;
        entry.last_active_ms.store(self.now_ms(), Ordering::Relaxed);
        Some(entry)
    }

    /// Housekeeper tick: drop receivers idle past `max_idle`.
    /// Returns how many were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.now_ms();
        let max_ms = max_idle.as_millis() as u64;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|uuid, e| {
            let idle = now.saturating_sub(e.last_active_ms.load(Ordering::Relaxed));
            if idle > max_ms {
                warn!(uuid, idle_ms = idle, "evicting idle sdm receiver");
                false
            } else {
                true
            }
        });
        before - entries.len()
    }
}

#[async_trait]
impl Receiver for SharedDm {
    async fn recv_obj(
        &self,
        hdr: ObjHdr,
        reader: &mut ObjReader<'_, BufReader<tokio::net::tcp::OwnedReadHalf>>,
    ) -> Result<()> {
        match self.route(&hdr.demux_id) {
            Some(entry) => entry.recv.recv_obj(hdr, reader).await,
            None => {
                // drain and drop: the xaction is gone (or not yet here)
                reader.drain().await?;
                Err(Error::Fatal(format!(
                    "sdm: no receiver for demux id {:?}",
                    hdr.demux_id
                )))
            }
        }
    }

    async fn recv_ctrl(&self, hdr: ObjHdr) -> Result<()> {
        match self.route(&hdr.demux_id) {
            Some(entry) => entry.recv.recv_ctrl(hdr).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Sink {
        got: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Receiver for Sink {
        async fn recv_obj(
            &self,
            _hdr: ObjHdr,
            _reader: &mut ObjReader<'_, BufReader<tokio::net::tcp::OwnedReadHalf>>,
        ) -> Result<()> {
            Ok(())
        }

        async fn recv_ctrl(&self, hdr: ObjHdr) -> Result<()> {
            self.got.lock().push(hdr.demux_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_route_unregister() {
        let sdm = SharedDm::new();
        let sink = Arc::new(Sink {
            got: Mutex::new(Vec::new()),
        });
        sdm.register("xact-1", sink.clone()).unwrap();
        assert!(sdm.register("xact-1", sink.clone()).is_err());
        assert!(sdm.is_registered("xact-1"));

        let mut hdr = ObjHdr::control(crate::opcode::DONE);
        hdr.demux_id = "xact-1".into();
        sdm.recv_ctrl(hdr).await.unwrap();
        assert_eq!(*sink.got.lock(), vec!["xact-1"]);

        // unknown ids are dropped silently for control frames
        let mut hdr = ObjHdr::control(crate::opcode::DONE);
        hdr.demux_id = "ghost".into();
        sdm.recv_ctrl(hdr).await.unwrap();

        sdm.unregister("xact-1");
        assert!(!sdm.is_registered("xact-1"));
    }

    #[tokio::test]
    async fn test_idle_eviction() {
        let sdm = SharedDm::new();
        let sink = Arc::new(Sink {
            got: Mutex::new(Vec::new()),
        });
        sdm.register("old", sink.clone()).unwrap();
        assert_eq!(sdm.evict_idle(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sdm.evict_idle(Duration::ZERO), 1);
        assert!(!sdm.is_registered("old"));
    }
}
