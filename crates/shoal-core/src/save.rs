//! Workfile→rename write protocol
//!
//! Every write lands in a work file first; the rename into the final FQN
//! is the commit point. A crash mid-write leaves only the work file,
//! which the cleanup jogger garbage-collects.

use shoal_common::{Cksum, CksumHash, CksumType, Error, Result};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Stream `reader` into `fqn`, computing the checksum on the way.
/// Returns `(bytes written, checksum)`.
pub fn save_reader<R: Read + ?Sized>(
    fqn: &Path,
    reader: &mut R,
    cksum_ty: CksumType,
    fsync: bool,
) -> Result<(u64, Option<Cksum>)> {
    if let Some(parent) = fqn.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("mkdir {}", parent.display()), e))?;
    }
    let mut file =
        File::create(fqn).map_err(|e| Error::io(format!("create {}", fqn.display()), e))?;
    let mut hash = CksumHash::new(cksum_ty);
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| Error::io(format!("read into {}", fqn.display()), e))?;
        if n == 0 {
            break;
        }
        hash.update(&buf[..n]);
        file.write_all(&buf[..n])
            .map_err(|e| Error::io(format!("write {}", fqn.display()), e))?;
        written += n as u64;
    }
    if fsync {
        file.sync_all()
            .map_err(|e| Error::io(format!("fsync {}", fqn.display()), e))?;
    }
    Ok((written, hash.finalize()))
}

/// Commit a work file into its final FQN. On rename failure the work file
/// is removed so nothing half-written survives under the final name.
pub fn rename_atomic(work_fqn: &Path, final_fqn: &Path) -> Result<()> {
    if let Some(parent) = final_fqn.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("mkdir {}", parent.display()), e))?;
    }
    fs::rename(work_fqn, final_fqn).map_err(|e| {
        let _ = fs::remove_file(work_fqn);
        Error::io(
            format!(
                "rename {} -> {}",
                work_fqn.display(),
                final_fqn.display()
            ),
            e,
        )
    })
}

/// Read a file while verifying its checksum against `expected`.
pub fn read_with_validation(fqn: &Path, expected: &Cksum, cname: &str) -> Result<Vec<u8>> {
    let data = fs::read(fqn).map_err(|e| Error::io(format!("read {}", fqn.display()), e))?;
    validate(&data, expected, cname)?;
    Ok(data)
}

pub fn validate(data: &[u8], expected: &Cksum, cname: &str) -> Result<()> {
    let computed = Cksum::compute(expected.ty, data);
    match computed {
        Some(c) if c.value == expected.value => Ok(()),
        Some(c) => Err(Error::bad_cksum(cname, &expected.value, &c.value)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_rename() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work/obj.wk");
        let fin = dir.path().join("obj/final");

        let payload = vec![7u8; 10_000];
        let (n, cksum) =
            save_reader(&work, &mut Cursor::new(&payload), CksumType::XXHash, true).unwrap();
        assert_eq!(n, 10_000);
        let cksum = cksum.unwrap();

        rename_atomic(&work, &fin).unwrap();
        assert!(!work.exists());
        let got = read_with_validation(&fin, &cksum, "test").unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn test_validation_catches_corruption() {
        let dir = tempdir().unwrap();
        let fqn = dir.path().join("obj");
        let (_, cksum) =
            save_reader(&fqn, &mut Cursor::new(b"original".to_vec()), CksumType::XXHash, false)
                .unwrap();
        std::fs::write(&fqn, b"this file has been corrupted").unwrap();
        let err = read_with_validation(&fqn, &cksum.unwrap(), "test").unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_failed_rename_removes_work() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("w");
        std::fs::write(&work, b"x").unwrap();
        // destination is a non-empty directory, so the rename must fail
        let dst = dir.path().join("dst");
        std::fs::create_dir(&dst).unwrap();
        std::fs::write(dst.join("occupant"), b"f").unwrap();
        let res = rename_atomic(&work, &dst);
        assert!(res.is_err());
        assert!(!work.exists(), "work file cleaned up on failed commit");
    }
}
