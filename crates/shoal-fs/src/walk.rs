//! Bucket-tree walking
//!
//! Depth-first traversal of selected content-type subtrees of one bucket
//! on one mountpath. Files are visited in-order; directories are reported
//! post-order so callers can prune freshly emptied leaves.

use crate::content::ContentType;
use crate::mountpath::Mountpath;
use shoal_common::{Bck, Error, Result};
use std::fs;
use std::path::Path;

pub enum WalkEntry<'a> {
    File {
        fqn: &'a Path,
        ct: ContentType,
        meta: &'a fs::Metadata,
    },
    /// Post-order; never the bucket root itself.
    Dir { path: &'a Path },
}

/// Walk the bucket's subtrees for the given content types.
/// The callback may return `Error::Aborted` to stop the walk early.
pub fn walk_bck<F>(mi: &Mountpath, bck: &Bck, cts: &[ContentType], cb: &mut F) -> Result<()>
where
    F: FnMut(WalkEntry<'_>) -> Result<()>,
{
    for &ct in cts {
        let root = mi.make_path_bck(ct, bck);
        if !root.exists() {
            continue;
        }
        walk_dir(&root, ct, cb)?;
    }
    Ok(())
}

fn walk_dir<F>(dir: &Path, ct: ContentType, cb: &mut F) -> Result<()>
where
    F: FnMut(WalkEntry<'_>) -> Result<()>,
{
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        // raced with a concurrent removal
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(format!("read dir {}", dir.display()), e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(format!("read dir {}", dir.display()), e))?;
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::io(format!("stat {}", path.display()), e)),
        };
        if meta.is_dir() {
            walk_dir(&path, ct, cb)?;
            cb(WalkEntry::Dir { path: &path })?;
        } else if meta.is_file() {
            cb(WalkEntry::File {
                fqn: &path,
                ct,
                meta: &meta,
            })?;
        }
    }
    Ok(())
}

/// Enumerate the buckets that have any on-disk presence on this mountpath
/// under the given provider, across all content-type subtrees.
pub fn all_mpath_bcks(mi: &Mountpath, provider: shoal_common::Provider) -> Result<Vec<Bck>> {
    let mut out: Vec<Bck> = Vec::new();
    for ct in ContentType::ALL {
        let pdir = mi.make_path_ct(ct).join(provider.as_str());
        let ns_entries = match fs::read_dir(&pdir) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::io(format!("read dir {}", pdir.display()), e)),
            Ok(e) => e,
        };
        for ns_entry in ns_entries.flatten() {
            let ns_name = ns_entry.file_name().to_string_lossy().into_owned();
            let Some(ns) = ns_name.strip_prefix('@') else {
                continue;
            };
            let bck_entries = match fs::read_dir(ns_entry.path()) {
                Err(_) => continue,
                Ok(e) => e,
            };
            for bck_entry in bck_entries.flatten() {
                if !bck_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let bck = Bck {
                    provider,
                    ns: ns.to_string(),
                    name: bck_entry.file_name().to_string_lossy().into_owned(),
                };
                if !out.contains(&bck) {
                    out.push(bck);
                }
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::Provider;
    use tempfile::tempdir;

    fn put_file(p: &Path, data: &[u8]) {
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, data).unwrap();
    }

    #[test]
    fn test_walk_visits_selected_cts() {
        let dir = tempdir().unwrap();
        let mi = Mountpath::new(dir.path()).unwrap();
        let bck = Bck::ais("b");
        put_file(&mi.make_fqn(ContentType::Obj, &bck, "a/x"), b"1");
        put_file(&mi.make_fqn(ContentType::Obj, &bck, "y"), b"2");
        put_file(&mi.make_fqn(ContentType::Work, &bck, "w"), b"3");

        let mut files = Vec::new();
        let mut dirs = 0;
        walk_bck(&mi, &bck, &[ContentType::Obj], &mut |e| {
            match e {
                WalkEntry::File { fqn, ct, .. } => {
                    assert_eq!(ct, ContentType::Obj);
                    files.push(fqn.to_path_buf());
                }
                WalkEntry::Dir { .. } => dirs += 1,
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(files.len(), 2, "workfile must not be visited");
        assert_eq!(dirs, 1, "only the `a` subdirectory reports");
    }

    #[test]
    fn test_walk_abort_stops() {
        let dir = tempdir().unwrap();
        let mi = Mountpath::new(dir.path()).unwrap();
        let bck = Bck::ais("b");
        for i in 0..10 {
            put_file(&mi.make_fqn(ContentType::Obj, &bck, &format!("o{i}")), b"x");
        }
        let mut seen = 0;
        let res = walk_bck(&mi, &bck, &[ContentType::Obj], &mut |_| {
            seen += 1;
            if seen == 3 {
                return Err(Error::Aborted("enough".into()));
            }
            Ok(())
        });
        assert!(matches!(res, Err(Error::Aborted(_))));
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_all_mpath_bcks() {
        let dir = tempdir().unwrap();
        let mi = Mountpath::new(dir.path()).unwrap();
        put_file(&mi.make_fqn(ContentType::Obj, &Bck::ais("b1"), "o"), b"x");
        put_file(&mi.make_fqn(ContentType::Work, &Bck::ais("b2"), "w"), b"x");
        let bcks = all_mpath_bcks(&mi, Provider::Ais).unwrap();
        let names: Vec<&str> = bcks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["b1", "b2"]);
        assert!(all_mpath_bcks(&mi, Provider::S3).unwrap().is_empty());
    }
}
