//! Object header: the per-frame wire metadata
//!
//! Encoded with prost behind a u32 length prefix. `size == -1` announces
//! a PDU-framed payload of unknown length.

use prost::Message;
use shoal_common::{Bck, Cksum, CksumType, Error, ObjAttrs, ObjVersion, Provider, Result};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Payload length announcing PDU framing.
pub const SIZE_UNKNOWN: i64 = -1;

#[derive(Clone, PartialEq, prost::Message)]
pub struct ObjHdr {
    /// Sender target id.
    #[prost(string, tag = "1")]
    pub sid: String,
    #[prost(uint64, tag = "2")]
    pub sess_id: u64,
    #[prost(int32, tag = "3")]
    pub opcode: i32,
    /// Routes the frame to a registered receiver on the shared DM.
    #[prost(string, tag = "4")]
    pub demux_id: String,
    #[prost(string, tag = "5")]
    pub provider: String,
    #[prost(string, tag = "6")]
    pub ns: String,
    #[prost(string, tag = "7")]
    pub bck_name: String,
    #[prost(string, tag = "8")]
    pub obj_name: String,
    #[prost(int64, tag = "9")]
    pub size: i64,
    #[prost(bytes = "vec", tag = "10")]
    pub opaque: Vec<u8>,
    #[prost(string, tag = "11")]
    pub cksum_type: String,
    #[prost(string, tag = "12")]
    pub cksum_value: String,
    #[prost(string, tag = "13")]
    pub version: String,
    #[prost(map = "string, string", tag = "14")]
    pub custom: HashMap<String, String>,
    #[prost(bool, tag = "15")]
    pub compressed: bool,
}

impl ObjHdr {
    #[must_use]
    pub fn control(opcode: i32) -> Self {
        Self {
            opcode,
            size: 0,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn is_control(&self) -> bool {
        self.opcode != crate::opcode::OBJ
    }

    #[must_use]
    pub fn is_unsized(&self) -> bool {
        self.size < 0
    }

    pub fn set_bck(&mut self, bck: &Bck) {
        self.provider = bck.provider.as_str().to_string();
        self.ns = bck.ns.clone();
        self.bck_name = bck.name.clone();
    }

    pub fn bck(&self) -> Result<Bck> {
        Ok(Bck {
            provider: Provider::from_str(&self.provider)?,
            ns: self.ns.clone(),
            name: self.bck_name.clone(),
        })
    }

    pub fn set_attrs(&mut self, attrs: &ObjAttrs) {
        if self.size >= 0 {
            self.size = attrs.size as i64;
        }
        if let Some(cksum) = &attrs.cksum {
            self.cksum_type = cksum.ty.as_str().to_string();
            self.cksum_value = cksum.value.clone();
        }
        if let Some(v) = &attrs.version {
            self.version = v.to_string();
        }
        self.custom = attrs.custom.clone().into_iter().collect();
    }

    /// Reassemble attributes on the receiving side. Remote-versus-local
    /// version kind travels implicitly: local counters are numeric.
    #[must_use]
    pub fn attrs(&self, version_is_local: bool) -> ObjAttrs {
        let version = if self.version.is_empty() {
            None
        } else if version_is_local {
            self.version.parse().ok().map(ObjVersion::Local)
        } else {
            Some(ObjVersion::Remote(self.version.clone()))
        };
        let cksum = if self.cksum_value.is_empty() {
            None
        } else {
            CksumType::from_name(&self.cksum_type).map(|ty| Cksum::new(ty, self.cksum_value.clone()))
        };
        ObjAttrs {
            size: self.size.max(0) as u64,
            atime_ns: 0,
            cksum,
            version,
            custom: self.custom.clone().into_iter().collect(),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W, max_hdr: usize) -> Result<()> {
        let raw = self.encode_to_vec();
        if raw.len() > max_hdr {
            return Err(Error::Fatal(format!(
                "encoded header {}B exceeds the {max_hdr}B limit",
                raw.len()
            )));
        }
        w.write_u32(raw.len() as u32)
            .await
            .map_err(|e| Error::io("write hdr len", e))?;
        w.write_all(&raw)
            .await
            .map_err(|e| Error::io("write hdr", e))?;
        Ok(())
    }

    /// `Ok(None)` on clean EOF at a frame boundary.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R, max_hdr: usize) -> Result<Option<Self>> {
        let len = match r.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::io("read hdr len", e)),
        };
        if len > max_hdr {
            return Err(Error::Fatal(format!(
                "inbound header {len}B exceeds the {max_hdr}B limit"
            )));
        }
        let mut raw = vec![0u8; len];
        r.read_exact(&mut raw)
            .await
            .map_err(|e| Error::io("read hdr", e))?;
        let hdr = Self::decode(raw.as_slice())
            .map_err(|e| Error::Fatal(format!("decode header: {e}")))?;
        Ok(Some(hdr))
    }
}

trait CksumTypeExt {
    fn from_name(name: &str) -> Option<CksumType>;
}

impl CksumTypeExt for CksumType {
    fn from_name(name: &str) -> Option<CksumType> {
        match name {
            "xxhash" => Some(CksumType::XXHash),
            "crc32c" => Some(CksumType::Crc32c),
            "md5" => Some(CksumType::Md5),
            "sha256" => Some(CksumType::Sha256),
            _ => None,
        }
    }
}
