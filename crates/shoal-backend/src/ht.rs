//! Plain HTTP(S) driver, read-only
//!
//! Backs `ht://` buckets: the bucket name doubles as a registered base
//! URL; objects are fetched from `<base>/<name>`. Nothing can be listed,
//! put or deleted.

use crate::normalize::{normalize, transport_err, Scope};
use crate::{attrs_from_headers, stream_of, Backend, GetReader};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use shoal_common::msg::{LsoMsg, LsoResult};
use shoal_common::types::custom;
use shoal_common::{Bck, Error, ObjAttrs, Provider, Result};
use std::collections::BTreeMap;

pub struct HtBackend {
    client: reqwest::Client,
    /// bucket name → origin base URL, registered on first data-path touch.
    origins: RwLock<BTreeMap<String, String>>,
}

impl Default for HtBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HtBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            origins: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register_origin(&self, bck_name: &str, base_url: &str) {
        self.origins
            .write()
            .insert(bck_name.to_string(), base_url.trim_end_matches('/').to_string());
    }

    fn origin(&self, bck: &Bck) -> Result<String> {
        self.origins
            .read()
            .get(&bck.name)
            .cloned()
            .ok_or_else(|| Error::BckNotFound(bck.clone()))
    }
}

#[async_trait]
impl Backend for HtBackend {
    fn provider(&self) -> Provider {
        Provider::Ht
    }

    async fn head_bucket(&self, bck: &Bck) -> Result<BTreeMap<String, String>> {
        self.origin(bck)?;
        let mut props = BTreeMap::new();
        props.insert("provider".to_string(), "ht".to_string());
        props.insert("versioning-enabled".to_string(), "false".to_string());
        Ok(props)
    }

    async fn list_buckets(&self) -> Result<Vec<Bck>> {
        Ok(self
            .origins
            .read()
            .keys()
            .map(|name| Bck::new(Provider::Ht, name.clone()))
            .collect())
    }

    async fn list_objects(&self, bck: &Bck, _msg: &LsoMsg, _out: &mut LsoResult) -> Result<()> {
        Err(Error::Fatal(format!("{bck}: ht buckets cannot be listed remotely")))
    }

    async fn head_obj(&self, bck: &Bck, name: &str) -> Result<ObjAttrs> {
        let url = format!("{}/{name}", self.origin(bck)?);
        let resp = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| transport_err(&e, bck, name))?;
        if !resp.status().is_success() {
            return Err(normalize(resp.status().as_u16(), Scope::Object, bck, name, ""));
        }
        let mut attrs = attrs_from_headers(resp.headers(), None);
        attrs.set_custom(custom::SOURCE, "ht");
        Ok(attrs)
    }

    async fn get_obj_reader(
        &self,
        bck: &Bck,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<GetReader> {
        let url = format!("{}/{name}", self.origin(bck)?);
        let mut req = self.client.get(&url);
        if offset > 0 || length.is_some() {
            let range = match length {
                Some(len) => format!("bytes={offset}-{}", offset + len - 1),
                None => format!("bytes={offset}-"),
            };
            req = req.header("range", range);
        }
        let resp = req.send().await.map_err(|e| transport_err(&e, bck, name))?;
        if !resp.status().is_success() {
            return Err(normalize(resp.status().as_u16(), Scope::Object, bck, name, ""));
        }
        let mut attrs = attrs_from_headers(resp.headers(), None);
        attrs.set_custom(custom::SOURCE, "ht");
        Ok(GetReader {
            attrs,
            stream: stream_of(resp),
        })
    }

    async fn put_obj(
        &self,
        bck: &Bck,
        name: &str,
        _body: Bytes,
        _attrs: &ObjAttrs,
    ) -> Result<Option<String>> {
        Err(Error::Fatal(format!("{}: ht buckets are read-only", bck.cname(name))))
    }

    async fn delete_obj(&self, bck: &Bck, name: &str) -> Result<()> {
        Err(Error::Fatal(format!("{}: ht buckets are read-only", bck.cname(name))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unregistered_origin() {
        let be = HtBackend::new();
        let bck = Bck::new(Provider::Ht, "unknown");
        assert!(matches!(
            be.head_obj(&bck, "x").await,
            Err(Error::BckNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_only() {
        let be = HtBackend::new();
        be.register_origin("site", "http://127.0.0.1:1/base/");
        let bck = Bck::new(Provider::Ht, "site");
        assert!(be.head_bucket(&bck).await.is_ok());
        assert!(be.put_obj(&bck, "x", Bytes::new(), &ObjAttrs::default()).await.is_err());
        assert!(be.delete_obj(&bck, "x").await.is_err());
        let names = be.list_buckets().await.unwrap();
        assert_eq!(names.len(), 1);
    }
}
