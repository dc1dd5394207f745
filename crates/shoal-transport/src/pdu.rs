//! PDU framing
//!
//! Used when the payload size is unknown up front (streaming compose) and
//! whenever compression is on (compressed lengths are only known per
//! block). Each PDU is `[u32: len | EOB-bit][bytes]`; the final PDU
//! carries the EOB bit.

use shoal_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const EOB_FLAG: u32 = 1 << 31;
const LEN_MASK: u32 = EOB_FLAG - 1;

/// Cut `reader` into PDUs of at most `pdu_size` raw bytes and write them
/// to `w`. Returns `(raw bytes, wire bytes)` for separate accounting.
pub async fn write_pdus<R, W>(
    reader: &mut R,
    w: &mut W,
    pdu_size: usize,
    compress: bool,
) -> Result<(u64, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; pdu_size.max(1)];
    let mut raw_total = 0u64;
    let mut wire_total = 0u64;
    loop {
        let n = fill(reader, &mut buf).await?;
        if n == 0 {
            w.write_u32(EOB_FLAG)
                .await
                .map_err(|e| Error::io("write eob", e))?;
            wire_total += 4;
            return Ok((raw_total, wire_total));
        }
        raw_total += n as u64;
        let out: &[u8];
        let compressed_block;
        if compress {
            compressed_block = lz4_flex::compress_prepend_size(&buf[..n]);
            out = &compressed_block;
        } else {
            out = &buf[..n];
        }
        w.write_u32(out.len() as u32)
            .await
            .map_err(|e| Error::io("write pdu len", e))?;
        w.write_all(out)
            .await
            .map_err(|e| Error::io("write pdu", e))?;
        wire_total += 4 + out.len() as u64;
    }
}

/// Read until `buf` is full or EOF; short reads only at the end.
async fn fill<R: AsyncRead + Unpin + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r
            .read(&mut buf[filled..])
            .await
            .map_err(|e| Error::io("read payload", e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Reader for one inbound frame's payload. The demux loop hands this to
/// the handler and drains whatever the handler leaves behind, so framing
/// survives sloppy receivers.
pub enum ObjReader<'a, R: AsyncRead + Unpin> {
    /// Exactly `remaining` bytes follow.
    Sized { r: &'a mut R, remaining: u64 },
    /// PDU sequence until EOB.
    Pdu {
        r: &'a mut R,
        compressed: bool,
        done: bool,
    },
}

impl<'a, R: AsyncRead + Unpin> ObjReader<'a, R> {
    #[must_use]
    pub fn new(r: &'a mut R, size: i64, compressed: bool) -> Self {
        if size >= 0 && !compressed {
            Self::Sized {
                r,
                remaining: size as u64,
            }
        } else {
            Self::Pdu {
                r,
                compressed,
                done: false,
            }
        }
    }

    /// Next chunk of payload; `None` when the frame is fully consumed.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Sized { r, remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let want = (*remaining).min(64 * 1024) as usize;
                let mut buf = vec![0u8; want];
                let n = fill(&mut **r, &mut buf).await?;
                if n == 0 {
                    return Err(Error::Fatal(format!(
                        "truncated payload: {remaining} bytes short"
                    )));
                }
                buf.truncate(n);
                *remaining -= n as u64;
                Ok(Some(buf))
            }
            Self::Pdu { r, compressed, done } => {
                if *done {
                    return Ok(None);
                }
                let word = r
                    .read_u32()
                    .await
                    .map_err(|e| Error::io("read pdu len", e))?;
                if word & EOB_FLAG != 0 {
                    *done = true;
                    let tail = (word & LEN_MASK) as usize;
                    if tail != 0 {
                        return Err(Error::Fatal("eob pdu carries payload".into()));
                    }
                    return Ok(None);
                }
                let len = (word & LEN_MASK) as usize;
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf)
                    .await
                    .map_err(|e| Error::io("read pdu", e))?;
                if *compressed {
                    let raw = lz4_flex::decompress_size_prepended(&buf)
                        .map_err(|e| Error::Fatal(format!("lz4 decompress: {e}")))?;
                    return Ok(Some(raw));
                }
                Ok(Some(buf))
            }
        }
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, w: &mut W) -> Result<u64> {
        let mut total = 0u64;
        while let Some(chunk) = self.next_chunk().await? {
            w.write_all(&chunk)
                .await
                .map_err(|e| Error::io("copy payload", e))?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    /// Consume whatever is left of the frame.
    pub async fn drain(&mut self) -> Result<()> {
        while self.next_chunk().await?.is_some() {}
        Ok(())
    }
}
