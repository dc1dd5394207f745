//! Local list-objects (LSO)
//!
//! Walks the bucket's object subtrees across all mountpaths, merges and
//! sorts, then serves one page honoring prefix, continuation token and
//! the requested property set. Remote listings (and `DIFF` comparisons)
//! are layered on top of this by the node.

use crate::Target;
use shoal_common::msg::{entry_flags, lso_flags, lso_props, LsoEntry, LsoMsg, LsoResult};
use shoal_common::{Bck, Result};
use shoal_core::lom::{alloc_lom, free_lom};
use shoal_core::ChunkManifest;
use shoal_fs::walk::{walk_bck, WalkEntry};
use shoal_fs::ContentType;
use std::collections::BTreeSet;

/// One page of the local listing.
pub fn lso_local(tgt: &Target, bck: &Bck, msg: &LsoMsg) -> Result<LsoResult> {
    tgt.t.init_bck(bck)?;
    let page = msg.effective_page_size();

    // names first: merged, de-duped, ordered
    let mut names: BTreeSet<String> = BTreeSet::new();
    for mi in tgt.t.mfs.available() {
        walk_bck(&mi, bck, &[ContentType::Obj], &mut |entry| {
            if let WalkEntry::File { fqn, .. } = entry {
                if let Ok(parsed) = shoal_fs::fqn::resolve_fqn(&tgt.t.mfs, fqn) {
                    let name = parsed.obj_name;
                    if name.starts_with(&msg.prefix)
                        && (msg.continuation_token.is_empty() || name > msg.continuation_token)
                    {
                        names.insert(name);
                    }
                }
            }
            Ok(())
        })?;
    }

    let mut out = LsoResult::default();
    let total = names.len();
    for (i, name) in names.into_iter().enumerate() {
        if i == page {
            break;
        }
        let entry = if msg.is(lso_flags::NAME_ONLY) {
            LsoEntry {
                name,
                flags: entry_flags::IS_CACHED,
                ..Default::default()
            }
        } else {
            load_entry(tgt, bck, name, msg)
        };
        out.entries.push(entry);
    }
    out.continuation_token = if total > page {
        out.entries.last().map(|e| e.name.clone()).unwrap_or_default()
    } else {
        String::new()
    };
    Ok(out)
}

fn load_entry(tgt: &Target, bck: &Bck, name: String, msg: &LsoMsg) -> LsoEntry {
    let mut entry = LsoEntry {
        name,
        flags: entry_flags::IS_CACHED,
        ..Default::default()
    };
    let mut lom = alloc_lom();
    if lom.init(&tgt.t, bck, &entry.name).is_ok() && lom.load(true, false).is_ok() {
        if msg.wants(lso_props::SIZE) || msg.is(lso_flags::NAME_SIZE) {
            entry.size = lom.size();
        }
        if msg.is(lso_flags::NAME_SIZE) {
            free_lom(lom);
            return entry;
        }
        if msg.wants(lso_props::CHECKSUM) {
            entry.checksum = lom.cksum().cloned();
        }
        if msg.wants(lso_props::ATIME) {
            entry.atime = fmt_atime(lom.atime_ns(), &msg.time_format);
        }
        if msg.wants(lso_props::VERSION) {
            if msg.is(lso_flags::IS_S3) && lom.is_chunked() {
                // multipart-style ETag for chunked objects
                if let Ok(manifest) = ChunkManifest::load_completed(&tgt.t, &lom) {
                    if let Some(etag) = manifest.etag() {
                        entry.version = etag;
                    }
                }
            }
            if entry.version.is_empty() {
                entry.version = lom
                    .version()
                    .map(ToString::to_string)
                    .unwrap_or_default();
            }
        }
        if msg.wants(lso_props::CUSTOM) {
            entry.custom = lom
                .md
                .attrs
                .custom
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
        }
        if msg.wants(lso_props::COPIES) {
            entry.copies = lom.md.copies.len().max(1) as u16;
        }
        if !lom.is_hrw() {
            entry.flags |= entry_flags::IS_MISPLACED;
        }
    }
    free_lom(lom);
    entry
}

fn fmt_atime(atime_ns: i64, time_format: &str) -> String {
    if atime_ns <= 0 {
        return String::new();
    }
    let Some(dt) = chrono::DateTime::from_timestamp(
        atime_ns / 1_000_000_000,
        (atime_ns % 1_000_000_000) as u32,
    ) else {
        return String::new();
    };
    if time_format.is_empty() {
        dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    } else {
        dt.format(time_format).to_string()
    }
}

/// Detect remote-versus-cached differences for `DIFF` listings: marks
/// entries whose cached version no longer matches the remote one.
pub fn mark_version_changes(tgt: &Target, bck: &Bck, entries: &mut [LsoEntry]) {
    for entry in entries.iter_mut() {
        let mut lom = alloc_lom();
        if lom.init(&tgt.t, bck, &entry.name).is_ok() {
            match lom.load(true, false) {
                Ok(()) => {
                    entry.flags |= entry_flags::IS_CACHED;
                    let cached = lom
                        .version()
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    if !entry.version.is_empty() && cached != entry.version {
                        entry.flags |= entry_flags::VERSION_CHANGED;
                    }
                }
                Err(_) => {
                    entry.flags &= !entry_flags::IS_CACHED;
                }
            }
        }
        free_lom(lom);
    }
}
