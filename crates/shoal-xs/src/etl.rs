//! ETL-in-path
//!
//! A transform is a pipeline of one or more stage webservers; the
//! per-object path POSTs the bytes through each stage in order and
//! persists whatever the last stage returns. Stage endpoints are
//! resolved at job begin-time from the registered ETL names.

use bytes::Bytes;
use parking_lot::RwLock;
use shoal_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Registered ETL stages: name → webserver base URL.
#[derive(Default)]
pub struct EtlRegistry {
    stages: RwLock<HashMap<String, String>>,
}

impl EtlRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: &str, url: &str) {
        self.stages
            .write()
            .insert(name.to_string(), url.trim_end_matches('/').to_string());
    }

    pub fn unregister(&self, name: &str) {
        self.stages.write().remove(name);
    }

    /// Resolve a pipeline (array of names) into a ready transform.
    /// An empty pipeline is the identity.
    pub fn pipeline(&self, names: &[String]) -> Result<EtlPipeline> {
        let stages = self.stages.read();
        let mut urls = Vec::with_capacity(names.len());
        for name in names {
            let url = stages
                .get(name)
                .ok_or_else(|| Error::Fatal(format!("unknown etl {name:?}")))?;
            urls.push(url.clone());
        }
        Ok(EtlPipeline {
            urls,
            client: reqwest::Client::new(),
        })
    }
}

#[derive(Clone)]
pub struct EtlPipeline {
    urls: Vec<String>,
    client: reqwest::Client,
}

impl EtlPipeline {
    /// Identity transform (plain copy).
    #[must_use]
    pub fn identity() -> Self {
        Self {
            urls: Vec::new(),
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.urls.is_empty()
    }

    /// Pipe the object bytes through every stage in order.
    pub async fn transform(&self, obj_name: &str, mut body: Bytes) -> Result<Bytes> {
        for url in &self.urls {
            let resp = self
                .client
                .post(format!("{url}/{obj_name}"))
                .body(body.clone())
                .send()
                .await
                .map_err(|e| Error::Unavailable(format!("etl stage {url}: {e}")))?;
            let status = resp.status().as_u16();
            if status != 200 {
                return Err(Error::Fatal(format!(
                    "etl stage {url}: {obj_name}: http {status}"
                )));
            }
            body = resp
                .bytes()
                .await
                .map_err(|e| Error::Fatal(format!("etl stage {url}: {e}")))?;
        }
        Ok(body)
    }
}
