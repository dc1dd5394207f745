//! Azure Blob Storage driver (REST, SAS auth)

use crate::normalize::{normalize, transport_err, Scope};
use crate::{attrs_from_headers, stream_of, Backend, GetReader};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use shoal_common::config::AzBackendConf;
use shoal_common::msg::{lso_props, LsoEntry, LsoMsg, LsoResult};
use shoal_common::types::custom;
use shoal_common::{Bck, Error, ObjAttrs, Provider, Result};
use std::collections::BTreeMap;

pub struct AzureBackend {
    conf: AzBackendConf,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobsNode,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobsNode {
    #[serde(default)]
    blob: Vec<BlobNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobNode {
    name: String,
    #[serde(default)]
    properties: Option<BlobProps>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobProps {
    #[serde(default, rename = "Content-Length")]
    content_length: Option<u64>,
    #[serde(default, rename = "Etag")]
    etag: Option<String>,
    #[serde(default, rename = "Last-Modified")]
    last_modified: Option<String>,
}

impl AzureBackend {
    #[must_use]
    pub fn new(conf: AzBackendConf) -> Self {
        Self {
            conf,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str, query: &str) -> String {
        let mut url = format!("{}{path}", self.conf.endpoint);
        let mut sep = '?';
        if !query.is_empty() {
            url.push(sep);
            url.push_str(query);
            sep = '&';
        }
        if !self.conf.sas_token.is_empty() {
            url.push(sep);
            url.push_str(&self.conf.sas_token);
        }
        url
    }
}

#[async_trait]
impl Backend for AzureBackend {
    fn provider(&self) -> Provider {
        Provider::Az
    }

    async fn head_bucket(&self, bck: &Bck) -> Result<BTreeMap<String, String>> {
        let url = self.url(&format!("/{}", bck.name), "restype=container");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_err(&e, bck, ""))?;
        if !resp.status().is_success() {
            return Err(normalize(resp.status().as_u16(), Scope::Bucket, bck, "", ""));
        }
        let mut props = BTreeMap::new();
        props.insert("provider".to_string(), "az".to_string());
        // blob-level versioning is an account property; not visible here
        props.insert("versioning-enabled".to_string(), "false".to_string());
        Ok(props)
    }

    async fn list_buckets(&self) -> Result<Vec<Bck>> {
        let url = self.url("/", "comp=list");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_err(&e, &Bck::new(Provider::Az, "-"), ""))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        if status != 200 {
            return Err(normalize(
                status,
                Scope::Bucket,
                &Bck::new(Provider::Az, "-"),
                "",
                &body,
            ));
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct ContainersResult {
            #[serde(default)]
            containers: ContainersNode,
        }
        #[derive(Default, Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct ContainersNode {
            #[serde(default)]
            container: Vec<ContainerNode>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct ContainerNode {
            name: String,
        }
        let parsed: ContainersResult = quick_xml::de::from_str(&body)
            .map_err(|e| Error::Fatal(format!("parse container listing: {e}")))?;
        Ok(parsed
            .containers
            .container
            .into_iter()
            .map(|c| Bck::new(Provider::Az, c.name))
            .collect())
    }

    async fn list_objects(&self, bck: &Bck, msg: &LsoMsg, out: &mut LsoResult) -> Result<()> {
        let mut query = format!(
            "restype=container&comp=list&maxresults={}",
            msg.effective_page_size()
        );
        if !msg.prefix.is_empty() {
            query.push_str("&prefix=");
            query.push_str(&msg.prefix);
        }
        if !msg.continuation_token.is_empty() {
            query.push_str("&marker=");
            query.push_str(&msg.continuation_token);
        }
        let url = self.url(&format!("/{}", bck.name), &query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_err(&e, bck, ""))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        if status != 200 {
            return Err(normalize(status, Scope::Bucket, bck, "", &body));
        }
        let parsed: EnumerationResults = quick_xml::de::from_str(&body)
            .map_err(|e| Error::Fatal(format!("parse {bck} listing: {e}")))?;
        for blob in parsed.blobs.blob {
            let props = blob.properties.unwrap_or_default();
            let mut entry = LsoEntry {
                name: blob.name,
                ..Default::default()
            };
            if msg.wants(lso_props::SIZE) {
                entry.size = props.content_length.unwrap_or(0);
            }
            if msg.wants(lso_props::VERSION) {
                entry.version = props
                    .etag
                    .map(|e| e.trim_matches('"').to_string())
                    .unwrap_or_default();
            }
            if msg.wants(lso_props::ATIME) {
                entry.atime = props.last_modified.unwrap_or_default();
            }
            out.entries.push(entry);
        }
        out.continuation_token = parsed.next_marker.unwrap_or_default();
        Ok(())
    }

    async fn head_obj(&self, bck: &Bck, name: &str) -> Result<ObjAttrs> {
        let url = self.url(&format!("/{}/{name}", bck.name), "");
        let resp = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| transport_err(&e, bck, name))?;
        if !resp.status().is_success() {
            return Err(normalize(resp.status().as_u16(), Scope::Object, bck, name, ""));
        }
        let version = resp
            .headers()
            .get("x-ms-version-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut attrs = attrs_from_headers(resp.headers(), version);
        attrs.set_custom(custom::SOURCE, "az");
        Ok(attrs)
    }

    async fn get_obj_reader(
        &self,
        bck: &Bck,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<GetReader> {
        let url = self.url(&format!("/{}/{name}", bck.name), "");
        let mut req = self.client.get(&url);
        if offset > 0 || length.is_some() {
            let range = match length {
                Some(len) => format!("bytes={offset}-{}", offset + len - 1),
                None => format!("bytes={offset}-"),
            };
            req = req.header("x-ms-range", range);
        }
        let resp = req.send().await.map_err(|e| transport_err(&e, bck, name))?;
        if !resp.status().is_success() {
            return Err(normalize(resp.status().as_u16(), Scope::Object, bck, name, ""));
        }
        let mut attrs = attrs_from_headers(resp.headers(), None);
        attrs.set_custom(custom::SOURCE, "az");
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
        let url = self.url(&format!("/{}/{name}", bck.name), "");
        let resp = self
            .client
            .put(&url)
            .header("x-ms-blob-type", "BlockBlob")
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
            .map(|s| s.trim_matches('"').to_string()))
    }

    async fn delete_obj(&self, bck: &Bck, name: &str) -> Result<()> {
        let url = self.url(&format!("/{}/{name}", bck.name), "");
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| transport_err(&e, bck, name))?;
        match resp.status().as_u16() {
            200 | 202 | 204 | 404 => Ok(()),
            s => Err(normalize(s, Scope::Object, bck, name, "")),
        }
    }
}
