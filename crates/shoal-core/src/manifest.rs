//! Chunk manifests
//!
//! A chunked object's body is a sequence of chunk files pinned by a
//! completed manifest; while an upload is in flight the manifest is
//! partial (keyed by upload id). Manifests live in the `chm` subtree.

use crate::ct::Ct;
use crate::lom::Lom;
use crate::save::{rename_atomic, save_reader};
use crate::tcore::Tcore;
use serde::{Deserialize, Serialize};
use shoal_common::{CksumType, Error, Result};
use shoal_fs::ContentType;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub num: u32,
    pub size: u64,
    /// Hex MD5 of the chunk (multipart-ETag synthesis input).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub upload_id: String,
    pub total_size: u64,
    pub chunks: Vec<ChunkEntry>,
    #[serde(default)]
    pub completed: bool,
}

impl ChunkManifest {
    #[must_use]
    pub fn new(upload_id: String) -> Self {
        Self {
            upload_id,
            ..Default::default()
        }
    }

    pub fn add_chunk(&mut self, num: u32, size: u64, md5: Option<String>) {
        self.chunks.push(ChunkEntry { num, size, md5 });
        self.total_size += size;
    }

    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Multipart-style ETag: `<md5-of-concatenated-chunk-md5s>-<n>`.
    #[must_use]
    pub fn etag(&self) -> Option<String> {
        let mut concat = Vec::new();
        for c in &self.chunks {
            let hex = c.md5.as_deref()?;
            let mut raw = Vec::with_capacity(hex.len() / 2);
            for pair in hex.as_bytes().chunks(2) {
                let s = std::str::from_utf8(pair).ok()?;
                raw.push(u8::from_str_radix(s, 16).ok()?);
            }
            concat.extend_from_slice(&raw);
        }
        let digest = shoal_common::cksum::compute_md5(&concat);
        Some(format!(
            "{}-{}",
            shoal_common::cksum::hex_encode(&digest),
            self.chunks.len()
        ))
    }

    fn fqn(&self, t: &Arc<Tcore>, lom: &Lom, partial: bool) -> Result<PathBuf> {
        let ct = Ct::new(t, lom.bck(), lom.obj_name(), ContentType::ChunkMeta, &[])?;
        Ok(if partial {
            ct.make(ContentType::ChunkMeta, &[&self.upload_id])
        } else {
            ct.fqn().to_path_buf()
        })
    }

    /// Persist; a partial manifest is keyed by its upload id, a completed
    /// one replaces the bare manifest atomically.
    pub fn store(&self, t: &Arc<Tcore>, lom: &Lom) -> Result<()> {
        let raw = serde_json::to_vec(self)
            .map_err(|e| Error::Fatal(format!("encode manifest {}: {e}", lom.cname())))?;
        let fqn = self.fqn(t, lom, !self.completed)?;
        if self.completed {
            let work = Ct::new(t, lom.bck(), lom.obj_name(), ContentType::Work, &[])?;
            save_reader(work.fqn(), &mut Cursor::new(raw), CksumType::None, true)?;
            rename_atomic(work.fqn(), &fqn)?;
            // the partial predecessor is garbage now
            let partial = self.fqn(t, lom, true)?;
            let _ = std::fs::remove_file(partial);
        } else {
            save_reader(&fqn, &mut Cursor::new(raw), CksumType::None, false)?;
        }
        Ok(())
    }

    /// Load the completed manifest that a chunked LOM promises exists.
    pub fn load_completed(t: &Arc<Tcore>, lom: &Lom) -> Result<Self> {
        let ct = Ct::new(t, lom.bck(), lom.obj_name(), ContentType::ChunkMeta, &[])?;
        let raw = std::fs::read(ct.fqn()).map_err(|e| {
            Error::io(format!("read completed manifest {}", ct.fqn().display()), e)
        })?;
        let m: Self = serde_json::from_slice(&raw)
            .map_err(|_| Error::MetadataCorrupted(format!("manifest {}", lom.cname())))?;
        if !m.completed {
            return Err(Error::MetadataCorrupted(format!(
                "manifest {} is not completed",
                lom.cname()
            )));
        }
        Ok(m)
    }

    /// FQN of chunk `num` of this object.
    pub fn chunk_fqn(&self, t: &Arc<Tcore>, lom: &Lom, num: u32) -> Result<PathBuf> {
        let ct = Ct::new(t, lom.bck(), lom.obj_name(), ContentType::Obj, &[])?;
        Ok(ct.make(ContentType::Chunk, &[&self.upload_id, &num.to_string()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lom::{alloc_lom, free_lom};
    use shoal_common::{Bck, BckProps, Config};
    use shoal_fs::content::new_upload_id;
    use tempfile::TempDir;

    fn test_env() -> (Arc<Tcore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let t = Tcore::new("t1", Config::default(), &[dir.path().to_path_buf()]).unwrap();
        t.bmd
            .write()
            .add(Bck::ais("b"), BckProps::default())
            .unwrap();
        (t, dir)
    }

    #[test]
    fn test_partial_then_completed() {
        let (t, _dir) = test_env();
        let mut lom = alloc_lom();
        lom.init(&t, &Bck::ais("b"), "big/object").unwrap();

        let mut m = ChunkManifest::new(new_upload_id());
        m.add_chunk(1, 100, None);
        m.store(&t, &lom).unwrap();

        // partial exists, completed does not
        assert!(ChunkManifest::load_completed(&t, &lom).is_err());

        m.add_chunk(2, 50, None);
        m.completed = true;
        m.store(&t, &lom).unwrap();

        let loaded = ChunkManifest::load_completed(&t, &lom).unwrap();
        assert_eq!(loaded.num_chunks(), 2);
        assert_eq!(loaded.total_size, 150);
        assert_eq!(loaded.upload_id, m.upload_id);
        free_lom(lom);
    }

    #[test]
    fn test_multipart_etag_shape() {
        let mut m = ChunkManifest::new(new_upload_id());
        m.add_chunk(1, 10, Some("d41d8cd98f00b204e9800998ecf8427e".into()));
        m.add_chunk(2, 10, Some("9e107d9d372bb6826bd81d3542a419d6".into()));
        let etag = m.etag().unwrap();
        assert!(etag.ends_with("-2"));
        assert_eq!(etag.len(), 32 + 1 + 1);

        let mut no_md5 = ChunkManifest::new(new_upload_id());
        no_md5.add_chunk(1, 10, None);
        assert!(no_md5.etag().is_none());
    }
}
