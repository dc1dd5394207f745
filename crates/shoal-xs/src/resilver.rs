//! Resilver: local reshuffle after mountpath add/remove
//!
//! Walks every mountpath and moves each object that no longer sits on
//! its HRW mountpath to where it belongs (copy + rename + metadata,
//! then remove the source). Preemptible: a newer resilver aborts an
//! older one via the registry.

use shoal_common::{Bck, Error, Provider, Result};
use shoal_core::lom::{alloc_lom, free_lom};
use shoal_core::save::{rename_atomic, save_reader};
use shoal_core::{lmeta, Tcore};
use shoal_fs::walk::{all_mpath_bcks, walk_bck, WalkEntry};
use shoal_fs::{ContentType, Mountpath};
use shoal_xact::XactBase;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub fn run_resilver(t: &Arc<Tcore>, x: &Arc<XactBase>) -> Result<()> {
    let avail = t.mfs.available();
    if avail.is_empty() {
        x.abort(Error::NoMountpaths.to_string());
        return Err(Error::NoMountpaths);
    }
    x.run();
    std::thread::scope(|scope| {
        for mi in &avail {
            let (t, x, mi) = (Arc::clone(t), Arc::clone(x), Arc::clone(mi));
            scope.spawn(move || jog(&t, &x, &mi));
        }
    });
    if !x.is_aborted() {
        x.finish();
    }
    Ok(())
}

fn jog(t: &Arc<Tcore>, x: &Arc<XactBase>, mi: &Arc<Mountpath>) {
    let mut bcks: Vec<Bck> = Vec::new();
    for provider in Provider::ALL {
        match all_mpath_bcks(mi, provider) {
            Ok(mut more) => bcks.append(&mut more),
            Err(e) => x.add_err(e.to_string()),
        }
    }
    for bck in bcks {
        let res = walk_bck(mi, &bck, &[ContentType::Obj], &mut |entry| {
            if x.is_aborted() {
                return Err(Error::Aborted(x.name()));
            }
            if let WalkEntry::File { fqn, .. } = entry {
                visit(t, x, fqn);
            }
            Ok(())
        });
        if let Err(e) = res {
            if !matches!(e, Error::Aborted(_)) {
                x.add_err(e.to_string());
            }
            return;
        }
    }
}

fn visit(t: &Arc<Tcore>, x: &Arc<XactBase>, fqn: &Path) {
    let mut lom = alloc_lom();
    let moved = (|| -> Result<bool> {
        lom.init_fqn(t, fqn)?;
        if lom.is_hrw() || lom.is_copy() {
            return Ok(false);
        }
        lom.lock(true);
        let res = (|| -> Result<bool> {
            lom.load(false, true)?;
            if lom.is_hrw() {
                return Ok(false); // mountpath set changed under us
            }
            let hrw_fqn = lom.hrw_fqn()?;
            // copy through a work file on the destination mountpath
            let dst_mi = t.mfs.select_hrw(&lom.uname())?;
            let work_ubase = ContentType::Work.make_ubase(
                fqn.file_name().and_then(|n| n.to_str()).unwrap_or("obj"),
                &[],
            );
            let work = dst_mi.make_fqn(ContentType::Work, lom.bck(), &work_ubase);
            let mut src = std::fs::File::open(fqn)
                .map_err(|e| Error::io(format!("open {}", fqn.display()), e))?;
            save_reader(&work, &mut src, shoal_common::CksumType::None, false)?;
            rename_atomic(&work, &hrw_fqn)?;
            lmeta::store_lmeta(&hrw_fqn, &lom.md)?;
            lom.remove_main()?;
            Ok(true)
        })();
        lom.unlock(true);
        res
    })();
    match moved {
        Ok(true) => {
            x.objs_add(1, lom.size() as i64);
        }
        Ok(false) => {}
        Err(e) if e.is_not_found() || e.is_lmeta_fault() => {}
        Err(e) => {
            warn!(fqn = %fqn.display(), %e, "resilver: move failed");
            x.add_err(e.to_string());
        }
    }
    free_lom(lom);
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_common::types::BckProps;
    use shoal_common::{CksumType, Config};
    use shoal_core::lom::now_ns;
    use shoal_xact::kind;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_misplaced_objects_move_home() {
        let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
        let paths: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let t = Tcore::new("t1", Config::default(), &paths).unwrap();
        let bck = Bck::ais("data");
        t.bmd.write().add(bck.clone(), BckProps::default()).unwrap();

        // place every object on a deliberately wrong mountpath
        let mut planted = Vec::new();
        for i in 0..12 {
            let name = format!("obj-{i}");
            let mut lom = alloc_lom();
            lom.init(&t, &bck, &name).unwrap();
            let hrw_mpid = lom.mountpath().mpid.clone();
            let wrong = t
                .mfs
                .available()
                .into_iter()
                .find(|m| m.mpid != hrw_mpid)
                .unwrap();
            let wrong_fqn = wrong.make_fqn(ContentType::Obj, &bck, &name);
            let body = format!("payload-{i}");
            let (size, cksum) = save_reader(
                &wrong_fqn,
                &mut Cursor::new(body.clone().into_bytes()),
                CksumType::XXHash,
                false,
            )
            .unwrap();
            lom.md.attrs.size = size;
            lom.md.attrs.cksum = cksum;
            lom.md.attrs.atime_ns = now_ns();
            lmeta::store_lmeta(&wrong_fqn, &lom.md).unwrap();
            planted.push((name, body, lom.fqn().to_path_buf(), wrong_fqn));
            free_lom(lom);
        }

        let x = XactBase::new("", kind::RESILVER, None, "");
        run_resilver(&t, &x).unwrap();
        assert!(x.finished());
        assert_eq!(x.snap().objs_added, 12);

        for (name, body, home_fqn, wrong_fqn) in planted {
            assert!(home_fqn.exists(), "{name} must live on its HRW mountpath");
            assert!(!wrong_fqn.exists(), "{name} must leave the wrong mountpath");
            assert_eq!(std::fs::read(&home_fqn).unwrap(), body.into_bytes());
            let md = lmeta::load_lmeta(&home_fqn).unwrap();
            assert!(md.attrs.cksum.is_some(), "metadata traveled with {name}");
        }
    }

    #[test]
    fn test_resilver_is_idempotent() {
        let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
        let paths: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let t = Tcore::new("t1", Config::default(), &paths).unwrap();
        let bck = Bck::ais("data");
        t.bmd.write().add(bck.clone(), BckProps::default()).unwrap();

        let mut lom = alloc_lom();
        lom.init(&t, &bck, "already-home").unwrap();
        let (size, cksum) = save_reader(
            lom.fqn(),
            &mut Cursor::new(b"fine".to_vec()),
            CksumType::XXHash,
            false,
        )
        .unwrap();
        lom.md.attrs.size = size;
        lom.md.attrs.cksum = cksum;
        lom.md.attrs.atime_ns = now_ns();
        lom.persist().unwrap();
        free_lom(lom);

        let x = XactBase::new("", kind::RESILVER, None, "");
        run_resilver(&t, &x).unwrap();
        assert_eq!(x.snap().objs_added, 0, "well-placed objects never move");
    }
}
