//! Cluster map snapshot
//!
//! The target consumes versioned `Smap` snapshots produced by the gateway
//! layer; only the placement-relevant subset lives here.

use crate::hrw::hrw_select;
use serde::{Deserialize, Serialize};
use shoal_common::{Error, Result};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub tid: String,
    /// Intra-cluster API endpoint, `host:port`.
    pub ctrl_addr: String,
    /// Long-lived stream endpoint, `host:port`.
    pub data_addr: String,
    #[serde(default)]
    pub in_maintenance: bool,
    #[serde(default)]
    pub decommissioning: bool,
}

impl TargetInfo {
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.in_maintenance && !self.decommissioning
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Smap {
    pub version: u64,
    pub targets: BTreeMap<String, TargetInfo>,
}

impl Smap {
    #[must_use]
    pub fn get(&self, tid: &str) -> Option<&TargetInfo> {
        self.targets.get(tid)
    }

    pub fn active_tids(&self) -> impl Iterator<Item = &str> {
        self.targets
            .values()
            .filter(|t| t.is_active())
            .map(|t| t.tid.as_str())
    }

    /// Number of active (placement-participating) targets.
    #[must_use]
    pub fn count_active(&self) -> usize {
        self.targets.values().filter(|t| t.is_active()).count()
    }

    #[must_use]
    pub fn in_maint_or_decomm(&self, tid: &str) -> bool {
        self.targets.get(tid).is_none_or(|t| !t.is_active())
    }

    /// HRW owner of the given uname among active targets.
    pub fn hrw_target(&self, uname: &str) -> Result<&TargetInfo> {
        let tid =
            hrw_select(uname, self.active_tids()).ok_or_else(|| Error::Fatal("empty cluster map".into()))?;
        Ok(&self.targets[tid])
    }

    pub fn upsert(&mut self, ti: TargetInfo) {
        self.targets.insert(ti.tid.clone(), ti);
        self.version += 1;
    }

    pub fn remove(&mut self, tid: &str) -> Option<TargetInfo> {
        let prev = self.targets.remove(tid);
        if prev.is_some() {
            self.version += 1;
        }
        prev
    }
}
