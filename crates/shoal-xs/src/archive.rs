//! Archive (shard) creation
//!
//! Streams a multi-object selection into one TAR/TGZ/ZIP/TAR.LZ4 object
//! at the destination, written like any other object (workfile+rename
//! inside the PUT path). Appending to an existing TAR shard re-composes
//! it with the new members.

use crate::on_obj_err;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use shoal_common::msg::{lso_flags, ArchiveMsg, LsoMsg};
use shoal_common::{Bck, Error, Result};
use shoal_tgt::lso::lso_local;
use shoal_tgt::{Owt, Target};
use shoal_xact::XactBase;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use tracing::info;

/// Supported shard formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mime {
    Tar,
    Tgz,
    Zip,
    TarLz4,
}

impl Mime {
    /// User-specified mime wins; the archive-name extension otherwise.
    pub fn detect(archname: &str, mime: &str) -> Result<Self> {
        let probe = if mime.is_empty() { archname } else { mime };
        let lower = probe.to_lowercase();
        if lower.ends_with(".tar.lz4") || lower == "tar.lz4" {
            Ok(Self::TarLz4)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") || lower == "tgz" {
            Ok(Self::Tgz)
        } else if lower.ends_with(".zip") || lower == "zip" {
            Ok(Self::Zip)
        } else if lower.ends_with(".tar") || lower == "tar" {
            Ok(Self::Tar)
        } else {
            Err(Error::Fatal(format!(
                "unsupported archive format {probe:?} (tar, tgz, zip, tar.lz4)"
            )))
        }
    }
}

pub async fn run_archive(
    tgt: &Target,
    x: &Arc<XactBase>,
    src: &Bck,
    dst: &Bck,
    msg: &ArchiveMsg,
) -> Result<()> {
    x.run();
    let mime = match Mime::detect(&msg.archname, &msg.mime) {
        Ok(m) => m,
        Err(e) => {
            x.abort(e.to_string());
            return Err(e);
        }
    };
    let names = if msg.list_range.is_entire_bucket() {
        lso_local(
            tgt,
            src,
            &LsoMsg {
                flags: lso_flags::NAME_ONLY,
                ..Default::default()
            },
        )?
        .entries
        .into_iter()
        .map(|e| e.name)
        .collect()
    } else {
        msg.list_range.names()?
    };
    info!(name = %x.name(), n = names.len(), ?mime, archname = %msg.archname, "archive: starting");

    // gather members
    let mut members: Vec<(String, Bytes)> = Vec::with_capacity(names.len());
    for name in names {
        if x.is_aborted() {
            return Ok(());
        }
        match tgt.get_object(src, &name, false, false).await {
            Ok((bytes, _)) => {
                x.objs_in_add(1, bytes.len() as i64);
                members.push((archived_name(src, &name, msg), bytes));
            }
            Err(e) => {
                if !on_obj_err(x, &src.cname(&name), &e, msg.continue_on_error) {
                    return Ok(());
                }
            }
        }
    }

    // appending to an existing tar shard re-composes it
    if msg.append_if_exists {
        if let Ok((existing, _)) = tgt.get_object(dst, &msg.archname, false, false).await {
            let mut old = list_members(&existing, mime)?;
            old.extend(members);
            members = old;
        }
    }

    let shard = tokio::task::spawn_blocking(move || build(&members, mime))
        .await
        .map_err(|e| Error::Fatal(format!("archive build task: {e}")))??;
    let total = shard.len() as i64;
    tgt.put_object(dst, &msg.archname, shard, Owt::Put).await?;
    x.objs_out_add(1, total);
    x.objs_add(1, total);
    x.finish();
    Ok(())
}

fn archived_name(src: &Bck, name: &str, msg: &ArchiveMsg) -> String {
    let base = if msg.base_name_only {
        name.rsplit_once('/').map_or(name, |(_, b)| b)
    } else {
        name
    };
    if msg.incl_src_bname {
        format!("{}/{base}", src.name)
    } else {
        base.to_string()
    }
}

fn build(members: &[(String, Bytes)], mime: Mime) -> Result<Bytes> {
    match mime {
        Mime::Tar => {
            let raw = build_tar(members)?;
            Ok(Bytes::from(raw))
        }
        Mime::Tgz => {
            let raw = build_tar(members)?;
            let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(&raw)
                .and_then(|()| enc.finish())
                .map(Bytes::from)
                .map_err(|e| Error::io("gzip shard", e))
        }
        Mime::TarLz4 => {
            let raw = build_tar(members)?;
            let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
            enc.write_all(&raw)
                .map_err(|e| Error::io("lz4 shard", e))?;
            enc.finish()
                .map(Bytes::from)
                .map_err(|e| Error::Fatal(format!("lz4 shard: {e}")))
        }
        Mime::Zip => {
            let mut zw = zip::ZipWriter::new(Cursor::new(Vec::new()));
            let opts = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for (name, data) in members {
                zw.start_file(name.clone(), opts)
                    .map_err(|e| Error::Fatal(format!("zip {name}: {e}")))?;
                zw.write_all(data).map_err(|e| Error::io("zip shard", e))?;
            }
            zw.finish()
                .map(|c| Bytes::from(c.into_inner()))
                .map_err(|e| Error::Fatal(format!("zip shard: {e}")))
        }
    }
}

fn build_tar(members: &[(String, Bytes)]) -> Result<Vec<u8>> {
    let mut tb = tar::Builder::new(Vec::new());
    for (name, data) in members {
        let mut hdr = tar::Header::new_gnu();
        hdr.set_size(data.len() as u64);
        hdr.set_mode(0o644);
        hdr.set_mtime(0);
        hdr.set_cksum();
        tb.append_data(&mut hdr, name, &data[..])
            .map_err(|e| Error::io(format!("tar member {name}"), e))?;
    }
    tb.into_inner().map_err(|e| Error::io("tar shard", e))
}

/// Member `(name, bytes)` pairs of an existing shard.
pub fn list_members(shard: &[u8], mime: Mime) -> Result<Vec<(String, Bytes)>> {
    match mime {
        Mime::Tar => read_tar(shard),
        Mime::Tgz => {
            let mut raw = Vec::new();
            GzDecoder::new(shard)
                .read_to_end(&mut raw)
                .map_err(|e| Error::io("gunzip shard", e))?;
            read_tar(&raw)
        }
        Mime::TarLz4 => {
            let mut raw = Vec::new();
            lz4_flex::frame::FrameDecoder::new(shard)
                .read_to_end(&mut raw)
                .map_err(|e| Error::io("un-lz4 shard", e))?;
            read_tar(&raw)
        }
        Mime::Zip => {
            let mut za = zip::ZipArchive::new(Cursor::new(shard))
                .map_err(|e| Error::Fatal(format!("open zip shard: {e}")))?;
            let mut out = Vec::with_capacity(za.len());
            for i in 0..za.len() {
                let mut f = za
                    .by_index(i)
                    .map_err(|e| Error::Fatal(format!("zip member {i}: {e}")))?;
                let mut data = Vec::with_capacity(f.size() as usize);
                f.read_to_end(&mut data)
                    .map_err(|e| Error::io("read zip member", e))?;
                out.push((f.name().to_string(), Bytes::from(data)));
            }
            Ok(out)
        }
    }
}

/// Member names only (archive inspection / `HEAD` with archpath).
pub fn list_names(shard: &[u8], mime: Mime) -> Result<Vec<String>> {
    Ok(list_members(shard, mime)?.into_iter().map(|(n, _)| n).collect())
}

fn read_tar(raw: &[u8]) -> Result<Vec<(String, Bytes)>> {
    let mut ar = tar::Archive::new(raw);
    let mut out = Vec::new();
    for entry in ar.entries().map_err(|e| Error::io("read tar shard", e))? {
        let mut entry = entry.map_err(|e| Error::io("read tar member", e))?;
        let name = entry
            .path()
            .map_err(|e| Error::io("tar member path", e))?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| Error::io("read tar member", e))?;
        out.push((name, Bytes::from(data)));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_backend::Backends;
    use shoal_common::msg::ListRange;
    use shoal_common::types::BckProps;
    use shoal_common::Config;
    use shoal_core::Tcore;
    use shoal_xact::{kind, XactRegistry};
    use tempfile::TempDir;

    async fn seeded(n: usize) -> (Target, Bck, Vec<TempDir>) {
        let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
        let paths: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let t = Tcore::new("t1", Config::default(), &paths).unwrap();
        let bck = Bck::ais("src");
        t.bmd.write().add(bck.clone(), BckProps::default()).unwrap();
        t.bmd
            .write()
            .add(Bck::ais("shards"), BckProps::default())
            .unwrap();
        let tgt = Target::new(t, Backends::default(), Arc::new(XactRegistry::new()));
        for i in 0..n {
            tgt.put_object(
                &bck,
                &format!("obj-{i:02}"),
                Bytes::from(format!("member-{i}")),
                Owt::Put,
            )
            .await
            .unwrap();
        }
        (tgt, bck, dirs)
    }

    #[test]
    fn test_mime_detection() {
        assert_eq!(Mime::detect("out.tar", "").unwrap(), Mime::Tar);
        assert_eq!(Mime::detect("out.tar.gz", "").unwrap(), Mime::Tgz);
        assert_eq!(Mime::detect("out.tgz", "").unwrap(), Mime::Tgz);
        assert_eq!(Mime::detect("out.zip", "").unwrap(), Mime::Zip);
        assert_eq!(Mime::detect("out.tar.lz4", "").unwrap(), Mime::TarLz4);
        // explicit mime beats the extension
        assert_eq!(Mime::detect("weird-name", "tar").unwrap(), Mime::Tar);
        assert!(Mime::detect("out.rar", "").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tar_shard_roundtrip() {
        let (tgt, src, _dirs) = seeded(10).await;
        let dst = Bck::ais("shards");
        let msg = ArchiveMsg {
            archname: "out.tar".into(),
            list_range: ListRange {
                template: "obj-{00..09}".into(),
                objnames: vec![],
            },
            ..Default::default()
        };
        let x = XactBase::new("", kind::ARCHIVE, Some(dst.clone()), "");
        run_archive(&tgt, &x, &src, &dst, &msg).await.unwrap();
        assert!(x.finished());

        let attrs = tgt.head_object(&dst, "out.tar").await.unwrap();
        assert!(attrs.size > 0);

        let (shard, _) = tgt.get_object(&dst, "out.tar", true, false).await.unwrap();
        let names = list_names(&shard, Mime::Tar).unwrap();
        assert_eq!(names.len(), 10);
        for i in 0..10 {
            assert!(names.contains(&format!("obj-{i:02}")));
        }
        let members = list_members(&shard, Mime::Tar).unwrap();
        let (_, bytes) = members.iter().find(|(n, _)| n == "obj-03").unwrap();
        assert_eq!(&bytes[..], b"member-3");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_all_formats_roundtrip() {
        let (tgt, src, _dirs) = seeded(4).await;
        let dst = Bck::ais("shards");
        for (archname, mime) in [
            ("a.tar", Mime::Tar),
            ("a.tgz", Mime::Tgz),
            ("a.zip", Mime::Zip),
            ("a.tar.lz4", Mime::TarLz4),
        ] {
            let msg = ArchiveMsg {
                archname: archname.into(),
                ..Default::default()
            };
            let x = XactBase::new("", kind::ARCHIVE, Some(dst.clone()), "");
            run_archive(&tgt, &x, &src, &dst, &msg).await.unwrap();
            let (shard, _) = tgt.get_object(&dst, archname, true, false).await.unwrap();
            let names = list_names(&shard, mime).unwrap();
            assert_eq!(names.len(), 4, "{archname}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_append_and_naming_options() {
        let (tgt, src, _dirs) = seeded(4).await;
        let dst = Bck::ais("shards");
        let first = ArchiveMsg {
            archname: "grow.tar".into(),
            list_range: ListRange {
                objnames: vec!["obj-00".into(), "obj-01".into()],
                template: String::new(),
            },
            incl_src_bname: true,
            ..Default::default()
        };
        let x = XactBase::new("", kind::ARCHIVE, Some(dst.clone()), "");
        run_archive(&tgt, &x, &src, &dst, &first).await.unwrap();

        let second = ArchiveMsg {
            archname: "grow.tar".into(),
            list_range: ListRange {
                objnames: vec!["obj-02".into()],
                template: String::new(),
            },
            incl_src_bname: true,
            append_if_exists: true,
            ..Default::default()
        };
        let x = XactBase::new("", kind::ARCHIVE, Some(dst.clone()), "");
        run_archive(&tgt, &x, &src, &dst, &second).await.unwrap();

        let (shard, _) = tgt.get_object(&dst, "grow.tar", true, false).await.unwrap();
        let names = list_names(&shard, Mime::Tar).unwrap();
        assert_eq!(names, ["src/obj-00", "src/obj-01", "src/obj-02"]);
    }
}
