//! Bucket metadata (BMD): the versioned collection of buckets known to
//! the cluster, with their properties.
//!
//! Consensus-driven replication of this structure is out of scope here;
//! the target treats the BMD as an owned snapshot, and remote buckets get
//! added on first touch.

use crate::error::{Error, Result};
use crate::types::{Bck, BckProps, BpropsToSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Bmd {
    pub version: u64,
    buckets: BTreeMap<Bck, Arc<BckProps>>,
}

impl Bmd {
    #[must_use]
    pub fn lookup(&self, bck: &Bck) -> Option<Arc<BckProps>> {
        self.buckets.get(bck).cloned()
    }

    #[must_use]
    pub fn exists(&self, bck: &Bck) -> bool {
        self.buckets.contains_key(bck)
    }

    pub fn add(&mut self, bck: Bck, props: BckProps) -> Result<()> {
        if self.buckets.contains_key(&bck) {
            return Err(Error::AlreadyExists(bck.to_string()));
        }
        Bck::validate_name(&bck.name)?;
        self.buckets.insert(bck, Arc::new(props));
        self.version += 1;
        Ok(())
    }

    /// Add-on-first-touch for remote buckets: no conflict, no validation
    /// beyond what the remote already enforced.
    pub fn add_remote(&mut self, bck: Bck, props: BckProps) -> Arc<BckProps> {
        let props = Arc::new(props);
        self.buckets.insert(bck, Arc::clone(&props));
        self.version += 1;
        props
    }

    pub fn remove(&mut self, bck: &Bck) -> Result<()> {
        if self.buckets.remove(bck).is_none() {
            return Err(Error::BckNotFound(bck.clone()));
        }
        self.version += 1;
        Ok(())
    }

    pub fn set_props(&mut self, bck: &Bck, to_set: &BpropsToSet) -> Result<Arc<BckProps>> {
        let cur = self
            .buckets
            .get(bck)
            .ok_or_else(|| Error::BckNotFound(bck.clone()))?;
        let mut props = (**cur).clone();
        props.apply(to_set);
        let props = Arc::new(props);
        self.buckets.insert(bck.clone(), Arc::clone(&props));
        self.version += 1;
        Ok(props)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bck, &Arc<BckProps>)> {
        self.buckets.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
