//! End-to-end scenarios against the node's HTTP surface
//!
//! A single-process target with temp-dir mountpaths; the in-memory
//! backend stands in for a remote provider where one is needed.

use bytes::Bytes;
use serde_json::{json, Value};
use shoal_backend::mem::MemBackend;
use shoal_backend::Backends;
use shoal_common::{Bck, Config, Provider};
use shoal_core::lom::{alloc_lom, free_lom};
use shoal_core::Tcore;
use shoal_node::{http, Node};
use shoal_tgt::Owt;
use std::sync::Arc;
use tempfile::TempDir;

struct Env {
    node: Arc<Node>,
    base: String,
    client: reqwest::Client,
    mem: Arc<MemBackend>,
    _dirs: Vec<TempDir>,
}

async fn spawn_env() -> Env {
    let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
    let paths: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();
    let t = Tcore::new("t1", Config::default(), &paths).unwrap();
    let mem = Arc::new(MemBackend::new(Provider::S3));
    let mut backends = Backends::default();
    backends.register(mem.clone());
    let node = Node::with_parts(t, backends).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = http::router(Arc::clone(&node));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Env {
        node,
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        mem,
        _dirs: dirs,
    }
}

impl Env {
    async fn create_bucket(&self, name: &str) {
        let resp = self
            .client
            .post(format!("{}/v1/buckets/{name}", self.base))
            .json(&json!({"action": "create"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    }

    async fn bucket_action(&self, name: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/v1/buckets/{name}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn list(&self, bucket: &str, value: Value) -> Value {
        let resp = self
            .bucket_action(bucket, json!({"action": "list-objects", "value": value}))
            .await;
        assert_eq!(resp.status().as_u16(), 200);
        resp.json().await.unwrap()
    }

    async fn wait_xaction(&self, uuid: &str) {
        for _ in 0..600 {
            let snaps: Value = self
                .client
                .get(format!("{}/v1/xactions", self.base))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            let done = snaps.as_array().unwrap().iter().any(|s| {
                s["uuid"] == uuid && (s["state"] == "finished" || s["state"] == "aborted")
            });
            if done {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("xaction {uuid} never finished");
    }
}

/// S1: single PUT/GET/DELETE with checksum verification.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_put_get_delete() {
    let env = spawn_env().await;
    env.create_bucket("t1-bck").await;

    let body = vec![0u8; 4096];
    let resp = env
        .client
        .put(format!("{}/v1/objects/t1-bck/k1", env.base))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["x-shoal-version"], "1");

    let resp = env
        .client
        .get(format!("{}/v1/objects/t1-bck/k1?validate-cksum=true", env.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["x-shoal-cksum-type"], "xxhash");
    let got = resp.bytes().await.unwrap();
    assert_eq!(got.len(), 4096);
    assert_eq!(&got[..], &body[..]);

    let resp = env
        .client
        .delete(format!("{}/v1/objects/t1-bck/k1", env.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    let resp = env
        .client
        .head(format!("{}/v1/objects/t1-bck/k1", env.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

/// S2: list pagination — exactly five 200-entry pages over 1000 objects.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_list_pagination() {
    let env = spawn_env().await;
    env.create_bucket("paged").await;
    let bck = Bck::ais("paged");
    for i in 0..1000 {
        env.node
            .tgt
            .put_object(&bck, &format!("obj-{i:04}"), Bytes::from_static(b"x"), Owt::Put)
            .await
            .unwrap();
    }

    let mut token = String::new();
    let mut pages = 0;
    let mut total = 0;
    loop {
        let out = env
            .list("paged", json!({"page_size": 200, "continuation_token": token}))
            .await;
        let entries = out["entries"].as_array().unwrap();
        pages += 1;
        total += entries.len();
        token = out["continuation_token"].as_str().unwrap().to_string();
        if token.is_empty() {
            break;
        }
        assert!(pages < 5, "non-empty token only on the first four pages");
    }
    assert_eq!(pages, 5);
    assert_eq!(total, 1000);
}

/// S3: corrupted on-disk body — validated GET fails, plain GET serves
/// the corrupted bytes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_corrupted_get() {
    let env = spawn_env().await;
    env.create_bucket("t1-bck").await;
    let body: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 256) as u8).collect();
    env.client
        .put(format!("{}/v1/objects/t1-bck/k2", env.base))
        .body(body)
        .send()
        .await
        .unwrap();

    // clobber the final FQN behind the target's back
    let mut lom = alloc_lom();
    lom.init(&env.node.tgt.t, &Bck::ais("t1-bck"), "k2").unwrap();
    std::fs::write(lom.fqn(), b"this file has been corrupted").unwrap();
    free_lom(lom);

    let resp = env
        .client
        .get(format!("{}/v1/objects/t1-bck/k2?validate-cksum=true", env.base))
        .send()
        .await
        .unwrap();
    assert_ne!(resp.status().as_u16(), 200);
    let msg = resp.text().await.unwrap();
    assert!(msg.contains("checksum") || msg.contains("corrupted"), "{msg}");

    let resp = env
        .client
        .get(format!("{}/v1/objects/t1-bck/k2", env.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(&resp.bytes().await.unwrap()[..], b"this file has been corrupted");
}

/// S4: multi-object delete driven by a brace template.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_delete_template() {
    let env = spawn_env().await;
    env.create_bucket("tmpl").await;
    let bck = Bck::ais("tmpl");
    for i in 0..100 {
        env.node
            .tgt
            .put_object(&bck, &format!("tstf-{i:04}"), Bytes::from_static(b"d"), Owt::Put)
            .await
            .unwrap();
    }

    let resp = env
        .bucket_action(
            "tmpl",
            json!({"action": "delete", "value": {"template": "tstf-{0025..0033}"}}),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    let out = env.list("tmpl", json!({})).await;
    let names: Vec<&str> = out["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names.len(), 91);
    for i in 25..=33 {
        assert!(!names.contains(&format!("tstf-{i:04}").as_str()));
    }
    assert!(names.contains(&"tstf-0024"));
    assert!(names.contains(&"tstf-0034"));
}

/// S5: evict-then-prefetch a template range from a remote bucket.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_prefetch_range() {
    let env = spawn_env().await;
    env.mem.create_bucket("rem");
    for i in 0..200 {
        env.mem.put_direct("rem", &format!("obj-{i}"), vec![1u8; 64]);
    }
    // cold-GET a few, then evict everything local
    for i in 0..10 {
        let url = format!("{}/v1/objects/rem/obj-{i}?provider=s3", env.base);
        assert_eq!(env.client.get(url).send().await.unwrap().status().as_u16(), 200);
    }
    let resp = env
        .client
        .post(format!("{}/v1/buckets/rem?provider=s3", env.base))
        .json(&json!({"action": "evict", "value": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = env
        .client
        .post(format!("{}/v1/buckets/rem?provider=s3", env.base))
        .json(&json!({"action": "prefetch", "value": {"template": "obj-{1..150}"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let started: Value = resp.json().await.unwrap();
    env.wait_xaction(started["uuid"].as_str().unwrap()).await;

    let out = env
        .list(
            "rem?provider=s3",
            json!({"flags": shoal_common::msg::lso_flags::CACHED, "page_size": 1000}),
        )
        .await;
    let entries = out["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 150);
    for e in entries {
        let n: u64 = e["name"]
            .as_str()
            .unwrap()
            .strip_prefix("obj-")
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=150).contains(&n));
    }
}

/// S6: bucket rename with wait=true.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_rename_bucket() {
    let env = spawn_env().await;
    env.create_bucket("src").await;
    let bck = Bck::ais("src");
    let total = 2036;
    for i in 0..total {
        env.node
            .tgt
            .put_object(&bck, &format!("obj-{i}"), Bytes::from(vec![(i % 251) as u8; 1024]), Owt::Put)
            .await
            .unwrap();
    }

    let resp = env
        .bucket_action(
            "src",
            json!({"action": "rename", "value": {"to_bck": {"provider": "ais", "name": "dst"}}}),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    let mut count = 0;
    let mut token = String::new();
    loop {
        let out = env
            .list("dst", json!({"flags": 2, "continuation_token": token}))
            .await;
        count += out["entries"].as_array().unwrap().len();
        token = out["continuation_token"].as_str().unwrap().to_string();
        if token.is_empty() {
            break;
        }
    }
    assert_eq!(count, total);

    // src is gone
    let resp = env
        .client
        .get(format!("{}/v1/buckets/src", env.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    // random spot-check
    let k = 1234;
    let resp = env
        .client
        .get(format!("{}/v1/objects/dst/obj-{k}", env.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(&resp.bytes().await.unwrap()[..], &vec![(k % 251) as u8; 1024][..]);
}

/// S7: archive ten objects into one TAR shard.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_archive_tar() {
    let env = spawn_env().await;
    env.create_bucket("src").await;
    env.create_bucket("shards").await;
    let bck = Bck::ais("src");
    for i in 0..10 {
        env.node
            .tgt
            .put_object(&bck, &format!("obj-{i:02}"), Bytes::from(format!("m{i}")), Owt::Put)
            .await
            .unwrap();
    }

    let resp = env
        .bucket_action(
            "src",
            json!({"action": "archive", "value": {
                "to_bck": {"provider": "ais", "name": "shards"},
                "archname": "out.tar",
                "template": "obj-{00..09}"
            }}),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    let resp = env
        .client
        .head(format!("{}/v1/objects/shards/out.tar", env.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let shard = env
        .client
        .get(format!("{}/v1/objects/shards/out.tar", env.base))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let names = shoal_xs::archive::list_names(&shard, shoal_xs::archive::Mime::Tar).unwrap();
    assert_eq!(names.len(), 10);
    for i in 0..10 {
        assert!(names.contains(&format!("obj-{i:02}")));
    }
}

/// Unknown fast-path query keys are fatal.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_unknown_query_key_rejected() {
    let env = spawn_env().await;
    env.create_bucket("t1-bck").await;
    let resp = env
        .client
        .get(format!("{}/v1/objects/t1-bck/k?nonsense=1", env.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}
