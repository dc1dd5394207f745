//! In-memory backend
//!
//! A fully functional driver holding objects in process memory. Stands in
//! for a remote provider in integration suites (prefetch, copy, evict,
//! version-changed) and mirrors real pagination semantics.

use crate::{Backend, GetReader};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use shoal_common::msg::{lso_props, LsoEntry, LsoMsg, LsoResult};
use shoal_common::types::custom;
use shoal_common::{Bck, Error, ObjAttrs, ObjVersion, Provider, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

struct MemObj {
    data: Bytes,
    attrs: ObjAttrs,
}

#[derive(Default)]
pub struct MemBackend {
    provider: Option<Provider>,
    buckets: RwLock<BTreeMap<String, BTreeMap<String, MemObj>>>,
    versions: AtomicU64,
}

impl MemBackend {
    /// Pose as the given provider (default: s3).
    #[must_use]
    pub fn new(provider: Provider) -> Self {
        Self {
            provider: Some(provider),
            ..Default::default()
        }
    }

    pub fn create_bucket(&self, name: &str) {
        self.buckets
            .write()
            .entry(name.to_string())
            .or_default();
    }

    /// Seed one object directly (test setup).
    pub fn put_direct(&self, bck_name: &str, name: &str, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let version = format!("v{}", self.versions.fetch_add(1, Ordering::Relaxed) + 1);
        let mut attrs = ObjAttrs {
            size: data.len() as u64,
            version: Some(ObjVersion::Remote(version.clone())),
            ..Default::default()
        };
        attrs.set_custom(custom::ETAG, version.clone());
        let mut buckets = self.buckets.write();
        buckets
            .entry(bck_name.to_string())
            .or_default()
            .insert(name.to_string(), MemObj { data, attrs });
        version
    }

    #[must_use]
    pub fn object_count(&self, bck_name: &str) -> usize {
        self.buckets
            .read()
            .get(bck_name)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl Backend for MemBackend {
    fn provider(&self) -> Provider {
        self.provider.unwrap_or(Provider::S3)
    }

    async fn head_bucket(&self, bck: &Bck) -> Result<BTreeMap<String, String>> {
        if !self.buckets.read().contains_key(&bck.name) {
            return Err(Error::BckNotFound(bck.clone()));
        }
        let mut props = BTreeMap::new();
        props.insert("provider".to_string(), self.provider().to_string());
        props.insert("versioning-enabled".to_string(), "true".to_string());
        Ok(props)
    }

    async fn list_buckets(&self) -> Result<Vec<Bck>> {
        Ok(self
            .buckets
            .read()
            .keys()
            .map(|name| Bck::new(self.provider(), name.clone()))
            .collect())
    }

    async fn list_objects(&self, bck: &Bck, msg: &LsoMsg, out: &mut LsoResult) -> Result<()> {
        let buckets = self.buckets.read();
        let objs = buckets
            .get(&bck.name)
            .ok_or_else(|| Error::BckNotFound(bck.clone()))?;
        let page = msg.effective_page_size();
        let mut n = 0;
        let mut last: Option<&str> = None;
        for (name, obj) in objs.range(msg.continuation_token.clone()..) {
            // the token is exclusive: it names the last key of the
            // previous page
            if !msg.continuation_token.is_empty() && name == &msg.continuation_token {
                continue;
            }
            if !name.starts_with(&msg.prefix) {
                if !msg.prefix.is_empty() && name.as_str() > msg.prefix.as_str() {
                    break;
                }
                continue;
            }
            if n == page {
                out.continuation_token = last.unwrap_or_default().to_string();
                return Ok(());
            }
            let mut entry = LsoEntry {
                name: name.clone(),
                ..Default::default()
            };
            if msg.wants(lso_props::SIZE) {
                entry.size = obj.attrs.size;
            }
            if msg.wants(lso_props::VERSION) {
                entry.version = obj
                    .attrs
                    .version
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
            }
            out.entries.push(entry);
            last = Some(name);
            n += 1;
        }
        out.continuation_token = String::new();
        Ok(())
    }

    async fn head_obj(&self, bck: &Bck, name: &str) -> Result<ObjAttrs> {
        let buckets = self.buckets.read();
        let objs = buckets
            .get(&bck.name)
            .ok_or_else(|| Error::BckNotFound(bck.clone()))?;
        objs.get(name)
            .map(|o| o.attrs.clone())
            .ok_or_else(|| Error::ObjNotFound(bck.cname(name)))
    }

    async fn get_obj_reader(
        &self,
        bck: &Bck,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<GetReader> {
        let buckets = self.buckets.read();
        let objs = buckets
            .get(&bck.name)
            .ok_or_else(|| Error::BckNotFound(bck.clone()))?;
        let obj = objs
            .get(name)
            .ok_or_else(|| Error::ObjNotFound(bck.cname(name)))?;
        let total = obj.data.len() as u64;
        if offset > total {
            return Err(Error::RangeNotSatisfiable(format!(
                "{}: offset {offset} past size {total}",
                bck.cname(name)
            )));
        }
        let end = match length {
            Some(len) => (offset + len).min(total),
            None => total,
        };
        let slice = obj.data.slice(offset as usize..end as usize);
        Ok(GetReader {
            attrs: obj.attrs.clone(),
            stream: Box::new(std::io::Cursor::new(slice.to_vec())),
        })
    }

    async fn put_obj(
        &self,
        bck: &Bck,
        name: &str,
        body: Bytes,
        attrs: &ObjAttrs,
    ) -> Result<Option<String>> {
        if !self.buckets.read().contains_key(&bck.name) {
            return Err(Error::BckNotFound(bck.clone()));
        }
        let version = format!("v{}", self.versions.fetch_add(1, Ordering::Relaxed) + 1);
        let mut stored = attrs.clone();
        stored.size = body.len() as u64;
        stored.version = Some(ObjVersion::Remote(version.clone()));
        stored.set_custom(custom::ETAG, version.clone());
        self.buckets
            .write()
            .get_mut(&bck.name)
            .unwrap()
            .insert(name.to_string(), MemObj { data: body, attrs: stored });
        Ok(Some(version))
    }

    async fn delete_obj(&self, bck: &Bck, name: &str) -> Result<()> {
        let mut buckets = self.buckets.write();
        let objs = buckets
            .get_mut(&bck.name)
            .ok_or_else(|| Error::BckNotFound(bck.clone()))?;
        objs.remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::ObjNotFound(bck.cname(name)))
    }
}
