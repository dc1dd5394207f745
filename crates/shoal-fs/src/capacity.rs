//! Mountpath capacity and the cluster-facing capacity status
//!
//! Watermarks: `cleanup < low < high < OOS` (percent used). `CapStatus`
//! aggregates across mountpaths; its `err()` is what turns an ordinary
//! PUT into an out-of-space failure.

use crate::mountpath::MountpathRegistry;
use shoal_common::config::SpaceConf;
use shoal_common::{Error, Result};
use std::fmt;
use std::path::Path;

/// One filesystem's capacity snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct Capacity {
    pub total: u64,
    pub avail: u64,
    pub used_pct: u32,
}

impl Capacity {
    pub fn probe(path: &Path) -> Result<Self> {
        let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::Fatal(format!("bad mountpath path {}", path.display())))?;
        let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut vfs) };
        if rc != 0 {
            return Err(Error::io(
                format!("statvfs {}", path.display()),
                std::io::Error::last_os_error(),
            ));
        }
        let frsize = vfs.f_frsize as u64;
        let total = vfs.f_blocks as u64 * frsize;
        let avail = vfs.f_bavail as u64 * frsize;
        let used_pct = if total == 0 {
            0
        } else {
            (((total - avail) * 100) / total) as u32
        };
        Ok(Self {
            total,
            avail,
            used_pct,
        })
    }
}

/// Aggregated capacity across all available mountpaths.
#[derive(Clone, Copy, Debug, Default)]
pub struct CapStatus {
    pub total_used: u64,
    pub total_avail: u64,
    /// Highest used% across mountpaths; watermarks compare against this.
    pub pct_max: u32,
    pub pct_avg: u32,
    pub oos: bool,
    pub high_wm: bool,
    pub above_cleanup_wm: bool,
}

impl CapStatus {
    /// Out-of-space turns into a hard error; high watermark is advisory.
    #[must_use]
    pub fn err(&self) -> Option<Error> {
        if self.oos {
            return Some(Error::OutOfSpace(format!(
                "max used {}%, avail {}B",
                self.pct_max, self.total_avail
            )));
        }
        None
    }

    #[must_use]
    pub fn needs_cleanup(&self) -> bool {
        self.above_cleanup_wm
    }
}

impl fmt::Display for CapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cap(used-max {}%, used-avg {}%, oos {})",
            self.pct_max, self.pct_avg, self.oos
        )
    }
}

/// Re-probe every available mountpath and aggregate.
pub fn cap_refresh(reg: &MountpathRegistry, space: &SpaceConf) -> Result<CapStatus> {
    let avail = reg.available();
    if avail.is_empty() {
        return Err(Error::NoMountpaths);
    }
    let mut cs = CapStatus::default();
    let mut pct_sum = 0u64;
    for mi in &avail {
        let c = mi.capacity()?;
        cs.total_used += c.total - c.avail;
        cs.total_avail += c.avail;
        cs.pct_max = cs.pct_max.max(c.used_pct);
        pct_sum += u64::from(c.used_pct);
    }
    cs.pct_avg = (pct_sum / avail.len() as u64) as u32;
    cs.oos = cs.pct_max >= space.oos;
    cs.high_wm = cs.pct_max >= space.high_wm;
    cs.above_cleanup_wm = cs.pct_max >= space.cleanup_wm;
    Ok(cs)
}
