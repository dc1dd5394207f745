//! Oracle Cloud Infrastructure Object Storage driver (REST)

use crate::normalize::{normalize, transport_err, Scope};
use crate::{attrs_from_headers, stream_of, Backend, GetReader};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use shoal_common::config::OciBackendConf;
use shoal_common::msg::{lso_props, LsoEntry, LsoMsg, LsoResult};
use shoal_common::types::custom;
use shoal_common::{Bck, Error, ObjAttrs, ObjVersion, Provider, Result};
use std::collections::BTreeMap;

pub struct OciBackend {
    conf: OciBackendConf,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OciObject {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default, rename = "timeModified")]
    time_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OciListResponse {
    #[serde(default)]
    objects: Vec<OciObject>,
    #[serde(default, rename = "nextStartWith")]
    next_start_with: Option<String>,
}

impl OciBackend {
    #[must_use]
    pub fn new(conf: OciBackendConf) -> Self {
        Self {
            conf,
            client: reqwest::Client::new(),
        }
    }

    fn base(&self, bck: &Bck) -> String {
        format!(
            "{}/n/{}/b/{}",
            self.conf.endpoint, self.conf.namespace, bck.name
        )
    }

    fn req(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut r = self.client.request(method, url);
        if !self.conf.token.is_empty() {
            r = r.bearer_auth(&self.conf.token);
        }
        r
    }
}

#[async_trait]
impl Backend for OciBackend {
    fn provider(&self) -> Provider {
        Provider::Oci
    }

    async fn head_bucket(&self, bck: &Bck) -> Result<BTreeMap<String, String>> {
        let url = self.base(bck);
        let resp = self
            .req(reqwest::Method::HEAD, &url)
            .send()
            .await
            .map_err(|e| transport_err(&e, bck, ""))?;
        if !resp.status().is_success() {
            return Err(normalize(resp.status().as_u16(), Scope::Bucket, bck, "", ""));
        }
        let mut props = BTreeMap::new();
        props.insert("provider".to_string(), "oci".to_string());
        props.insert("versioning-enabled".to_string(), "false".to_string());
        Ok(props)
    }

    async fn list_buckets(&self) -> Result<Vec<Bck>> {
        // compartment-scoped; requires an OCI identity, not a data-path call
        Err(Error::Fatal(
            "oci: list-buckets requires compartment-scoped credentials".into(),
        ))
    }

    async fn list_objects(&self, bck: &Bck, msg: &LsoMsg, out: &mut LsoResult) -> Result<()> {
        let mut url = format!(
            "{}/o?limit={}&fields=name,size,etag,timeModified",
            self.base(bck),
            msg.effective_page_size()
        );
        if !msg.prefix.is_empty() {
            url.push_str("&prefix=");
            url.push_str(&msg.prefix);
        }
        if !msg.continuation_token.is_empty() {
            url.push_str("&start=");
            url.push_str(&msg.continuation_token);
        }
        let resp = self
            .req(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| transport_err(&e, bck, ""))?;
        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(normalize(status, Scope::Bucket, bck, "", &body));
        }
        let parsed: OciListResponse = resp
            .json()
            .await
            .map_err(|e| Error::Fatal(format!("parse {bck} listing: {e}")))?;
        for obj in parsed.objects {
            let mut entry = LsoEntry {
                name: obj.name,
                ..Default::default()
            };
            if msg.wants(lso_props::SIZE) {
                entry.size = obj.size.unwrap_or(0);
            }
            if msg.wants(lso_props::VERSION) {
                entry.version = obj.etag.unwrap_or_default();
            }
            if msg.wants(lso_props::ATIME) {
                entry.atime = obj.time_modified.unwrap_or_default();
            }
            out.entries.push(entry);
        }
        out.continuation_token = parsed.next_start_with.unwrap_or_default();
        Ok(())
    }

    async fn head_obj(&self, bck: &Bck, name: &str) -> Result<ObjAttrs> {
        let url = format!("{}/o/{name}", self.base(bck));
        let resp = self
            .req(reqwest::Method::HEAD, &url)
            .send()
            .await
            .map_err(|e| transport_err(&e, bck, name))?;
        if !resp.status().is_success() {
            return Err(normalize(resp.status().as_u16(), Scope::Object, bck, name, ""));
        }
        let version = resp
            .headers()
            .get("version-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut attrs = attrs_from_headers(resp.headers(), version);
        attrs.set_custom(custom::SOURCE, "oci");
        if let Some(md5) = resp
            .headers()
            .get("opc-content-md5")
            .and_then(|v| v.to_str().ok())
        {
            attrs.set_custom(custom::MD5, md5);
        }
        Ok(attrs)
    }

    async fn get_obj_reader(
        &self,
        bck: &Bck,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<GetReader> {
        let url = format!("{}/o/{name}", self.base(bck));
        let mut req = self.req(reqwest::Method::GET, &url);
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
        attrs.set_custom(custom::SOURCE, "oci");
        Ok(GetReader {
            attrs,
            stream: stream_of(resp),
        })
    }

    async fn put_obj(
        &self,
        bck: &Bck,
        name: &str,
        body: Bytes,
        _attrs: &ObjAttrs,
    ) -> Result<Option<String>> {
        let url = format!("{}/o/{name}", self.base(bck));
        let resp = self
            .req(reqwest::Method::PUT, &url)
            .body(body)
            .send()
            .await
            .map_err(|e| transport_err(&e, bck, name))?;
        if !resp.status().is_success() {
            return Err(normalize(resp.status().as_u16(), Scope::Object, bck, name, ""));
        }
        Ok(resp
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }

    async fn delete_obj(&self, bck: &Bck, name: &str) -> Result<()> {
        let url = format!("{}/o/{name}", self.base(bck));
        let resp = self
            .req(reqwest::Method::DELETE, &url)
            .send()
            .await
            .map_err(|e| transport_err(&e, bck, name))?;
        match resp.status().as_u16() {
            200 | 204 | 404 => Ok(()),
            s => Err(normalize(s, Scope::Object, bck, name, "")),
        }
    }
}
