//! S3-compatible driver (AWS and S3-clone endpoints)
//!
//! Path-style REST with SigV4 signing; listing via ListObjectsV2.

use crate::normalize::{normalize, transport_err, Scope};
use crate::sigv4::{uri_encode_path, SigV4Signer, UNSIGNED_PAYLOAD};
use crate::{attrs_from_headers, stream_of, Backend, GetReader};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use shoal_common::config::S3BackendConf;
use shoal_common::msg::{lso_props, LsoEntry, LsoMsg, LsoResult};
use shoal_common::types::custom;
use shoal_common::{Bck, Error, ObjAttrs, Provider, Result};
use std::collections::BTreeMap;
use tracing::debug;

pub struct S3Backend {
    conf: S3BackendConf,
    client: reqwest::Client,
    signer: SigV4Signer,
}

impl S3Backend {
    #[must_use]
    pub fn new(conf: S3BackendConf) -> Self {
        let signer = SigV4Signer::new(
            conf.access_key.clone(),
            conf.secret_key.clone(),
            conf.region.clone(),
        );
        Self {
            conf,
            client: reqwest::Client::new(),
            signer,
        }
    }

    fn host(&self) -> &str {
        self.conf
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
    }

    /// Build, sign and send one request. `query` must be pre-sorted.
    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response> {
        let canonical_path = uri_encode_path(path);
        let mut url = format!("{}{canonical_path}", self.conf.endpoint);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        let mut req = self.client.request(method.clone(), &url);
        if !self.signer.is_anonymous() {
            let signed = self
                .signer
                .sign(method.as_str(), self.host(), &canonical_path, query, UNSIGNED_PAYLOAD);
            req = req
                .header("authorization", signed.authorization)
                .header("x-amz-date", signed.amz_date)
                .header("x-amz-content-sha256", signed.amz_content_sha256);
        }
        if let Some(b) = body {
            req = req.body(b);
        }
        req.send()
            .await
            .map_err(|e| transport_err(&e, &Bck::new(Provider::S3, "-"), path))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<Contents>,
    #[serde(default)]
    next_continuation_token: Option<String>,
    #[serde(default)]
    is_truncated: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Contents {
    key: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    e_tag: Option<String>,
    #[serde(default)]
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListAllMyBucketsResult {
    #[serde(default)]
    buckets: BucketsNode,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BucketsNode {
    #[serde(default)]
    bucket: Vec<BucketNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BucketNode {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersioningConfiguration {
    #[serde(default)]
    status: Option<String>,
}

fn urlencode_query_val(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for b in v.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[async_trait]
impl Backend for S3Backend {
    fn provider(&self) -> Provider {
        Provider::S3
    }

    async fn head_bucket(&self, bck: &Bck) -> Result<BTreeMap<String, String>> {
        let path = format!("/{}", bck.name);
        let resp = self.send(reqwest::Method::HEAD, &path, "", None).await?;
        if !resp.status().is_success() {
            return Err(normalize(resp.status().as_u16(), Scope::Bucket, bck, "", ""));
        }
        let mut props = BTreeMap::new();
        props.insert("provider".to_string(), "s3".to_string());

        // versioning status comes from a separate GET
        let resp = self
            .send(reqwest::Method::GET, &path, "versioning=", None)
            .await?;
        let enabled = if resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            quick_xml::de::from_str::<VersioningConfiguration>(&body)
                .map(|v| v.status.as_deref() == Some("Enabled"))
                .unwrap_or(false)
        } else {
            false
        };
        props.insert("versioning-enabled".to_string(), enabled.to_string());
        Ok(props)
    }

    async fn list_buckets(&self) -> Result<Vec<Bck>> {
        let resp = self.send(reqwest::Method::GET, "/", "", None).await?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        if status != 200 {
            return Err(normalize(
                status,
                Scope::Bucket,
                &Bck::new(Provider::S3, "-"),
                "",
                &body,
            ));
        }
        let parsed: ListAllMyBucketsResult = quick_xml::de::from_str(&body)
            .map_err(|e| Error::Fatal(format!("parse list-buckets response: {e}")))?;
        Ok(parsed
            .buckets
            .bucket
            .into_iter()
            .map(|b| Bck::new(Provider::S3, b.name))
            .collect())
    }

    async fn list_objects(&self, bck: &Bck, msg: &LsoMsg, out: &mut LsoResult) -> Result<()> {
        let mut query = format!("list-type=2&max-keys={}", msg.effective_page_size());
        if !msg.continuation_token.is_empty() {
            query.push_str("&continuation-token=");
            query.push_str(&urlencode_query_val(&msg.continuation_token));
        }
        if !msg.prefix.is_empty() {
            query.push_str("&prefix=");
            query.push_str(&urlencode_query_val(&msg.prefix));
        }
        // canonical query must be sorted for the signature
        let mut parts: Vec<&str> = query.split('&').collect();
        parts.sort_unstable();
        let query = parts.join("&");

        let path = format!("/{}", bck.name);
        let resp = self.send(reqwest::Method::GET, &path, &query, None).await?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        if status != 200 {
            return Err(normalize(status, Scope::Bucket, bck, "", &body));
        }
        let parsed: ListBucketResult = quick_xml::de::from_str(&body)
            .map_err(|e| Error::Fatal(format!("parse {bck} listing: {e}")))?;
        debug!(%bck, n = parsed.contents.len(), "s3 list page");
        for c in parsed.contents {
            let mut entry = LsoEntry {
                name: c.key,
                ..Default::default()
            };
            if msg.wants(lso_props::SIZE) {
                entry.size = c.size;
            }
            if msg.wants(lso_props::VERSION) {
                if let Some(etag) = &c.e_tag {
                    entry.version = etag.trim_matches('"').to_string();
                }
            }
            if msg.wants(lso_props::ATIME) {
                if let Some(lm) = c.last_modified {
                    entry.atime = lm;
                }
            }
            out.entries.push(entry);
        }
        out.continuation_token = if parsed.is_truncated {
            parsed.next_continuation_token.unwrap_or_default()
        } else {
            String::new()
        };
        Ok(())
    }

    async fn head_obj(&self, bck: &Bck, name: &str) -> Result<ObjAttrs> {
        let path = format!("/{}/{name}", bck.name);
        let resp = self.send(reqwest::Method::HEAD, &path, "", None).await?;
        if !resp.status().is_success() {
            return Err(normalize(resp.status().as_u16(), Scope::Object, bck, name, ""));
        }
        let version = resp
            .headers()
            .get("x-amz-version-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut attrs = attrs_from_headers(resp.headers(), version);
        attrs.set_custom(custom::SOURCE, "s3");
        Ok(attrs)
    }

    async fn get_obj_reader(
        &self,
        bck: &Bck,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<GetReader> {
        let path = format!("/{}/{name}", bck.name);
        let canonical_path = uri_encode_path(&path);
        let url = format!("{}{canonical_path}", self.conf.endpoint);
        let mut req = self.client.get(&url);
        if offset > 0 || length.is_some() {
            let range = match length {
                Some(len) => format!("bytes={offset}-{}", offset + len - 1),
                None => format!("bytes={offset}-"),
            };
            req = req.header("range", range);
        }
        if !self.signer.is_anonymous() {
            let signed = self
                .signer
                .sign("GET", self.host(), &canonical_path, "", UNSIGNED_PAYLOAD);
            req = req
                .header("authorization", signed.authorization)
                .header("x-amz-date", signed.amz_date)
                .header("x-amz-content-sha256", signed.amz_content_sha256);
        }
        let resp = req.send().await.map_err(|e| transport_err(&e, bck, name))?;
        if !resp.status().is_success() {
            return Err(normalize(resp.status().as_u16(), Scope::Object, bck, name, ""));
        }
        let mut attrs = attrs_from_headers(resp.headers(), None);
        attrs.set_custom(custom::SOURCE, "s3");
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
        let path = format!("/{}/{name}", bck.name);
        let resp = self
            .send(reqwest::Method::PUT, &path, "", Some(body))
            .await?;
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
        let path = format!("/{}/{name}", bck.name);
        let resp = self.send(reqwest::Method::DELETE, &path, "", None).await?;
        match resp.status().as_u16() {
            200 | 204 | 404 => Ok(()),
            s => Err(normalize(s, Scope::Object, bck, name, "")),
        }
    }
}
