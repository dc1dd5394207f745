//! Backend abstraction
//!
//! Every provider driver implements the same narrow contract; callers
//! never see provider-native errors, only the shared taxonomy. Cold GET
//! persistence (workfile+rename) happens above this layer.

pub mod azure;
pub mod gcs;
pub mod ht;
pub mod mem;
pub mod normalize;
pub mod oci;
pub mod s3;
pub mod sigv4;

use async_trait::async_trait;
use bytes::Bytes;
use shoal_common::msg::{LsoMsg, LsoResult};
use shoal_common::{Bck, Config, Error, ObjAttrs, Provider, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Streamed object body plus the attributes that came with it.
pub struct GetReader {
    pub attrs: ObjAttrs,
    pub stream: Box<dyn AsyncRead + Send + Unpin>,
}

/// The uniform per-provider contract.
#[async_trait]
pub trait Backend: Send + Sync {
    fn provider(&self) -> Provider;

    /// Bucket properties; minimally `provider` and `versioning-enabled`.
    async fn head_bucket(&self, bck: &Bck) -> Result<BTreeMap<String, String>>;

    async fn list_buckets(&self) -> Result<Vec<Bck>>;

    /// One page; entries append to `out`, and an empty continuation token
    /// in `out` means the listing is done.
    async fn list_objects(&self, bck: &Bck, msg: &LsoMsg, out: &mut LsoResult) -> Result<()>;

    async fn head_obj(&self, bck: &Bck, name: &str) -> Result<ObjAttrs>;

    /// Byte range: `length == None` streams to the end.
    async fn get_obj_reader(
        &self,
        bck: &Bck,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<GetReader>;

    /// Returns the remote version (ETag / VersionID) when the provider
    /// reports one.
    async fn put_obj(&self, bck: &Bck, name: &str, body: Bytes, attrs: &ObjAttrs)
        -> Result<Option<String>>;

    async fn delete_obj(&self, bck: &Bck, name: &str) -> Result<()>;
}

pub(crate) fn stream_of(resp: reqwest::Response) -> Box<dyn AsyncRead + Send + Unpin> {
    use futures::TryStreamExt;
    let stream = resp
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    Box::new(tokio_util::io::StreamReader::new(stream))
}

/// Object attributes from standard response headers.
pub(crate) fn attrs_from_headers(
    headers: &reqwest::header::HeaderMap,
    version: Option<String>,
) -> ObjAttrs {
    use shoal_common::types::custom;
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let mut attrs = ObjAttrs {
        size: get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        version: version.map(shoal_common::ObjVersion::Remote),
        ..Default::default()
    };
    if let Some(etag) = get("etag") {
        let trimmed = etag.trim_matches('"').to_string();
        if attrs.version.is_none() {
            attrs.version = Some(shoal_common::ObjVersion::Remote(trimmed.clone()));
        }
        attrs.set_custom(custom::ETAG, trimmed);
    }
    if let Some(lm) = get("last-modified") {
        attrs.set_custom(custom::LAST_MODIFIED, lm);
    }
    if let Some(ct) = get("content-type") {
        attrs.set_custom(custom::CONTENT_TYPE, ct);
    }
    attrs
}

/// Per-provider driver registry for one target.
#[derive(Default)]
pub struct Backends {
    drivers: BTreeMap<Provider, Arc<dyn Backend>>,
}

impl Backends {
    /// Wire the full provider set from config.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut b = Self::default();
        b.register(Arc::new(s3::S3Backend::new(config.backend.s3.clone())));
        b.register(Arc::new(gcs::GcsBackend::new(config.backend.gs.clone())));
        b.register(Arc::new(azure::AzureBackend::new(config.backend.az.clone())));
        b.register(Arc::new(oci::OciBackend::new(config.backend.oci.clone())));
        b.register(Arc::new(ht::HtBackend::new()));
        b
    }

    pub fn register(&mut self, driver: Arc<dyn Backend>) {
        self.drivers.insert(driver.provider(), driver);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn Backend>> {
        self.drivers
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::Fatal(format!("no backend driver for provider {provider}")))
    }
}
