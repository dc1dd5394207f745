//! Intra-cluster HTTP API
//!
//! Bucket operations ride a JSON `{action, value}` body; the object data
//! path parses its query params with the fast parser and rejects unknown
//! keys outright.

use crate::dpq::Dpq;
use crate::Node;
use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, on, MethodFilter};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shoal_common::msg::{
    lso_flags, ArchiveMsg, ListRange, LsoMsg, LsoResult, PrefetchMsg, TcoMsg,
};
use shoal_common::types::custom;
use shoal_common::{Bck, BpropsToSet, Error, Provider, Result};
use shoal_tgt::lso::{lso_local, mark_version_changes};
use shoal_tgt::Owt;
use shoal_xact::{kind, RenewRes};
use shoal_xs::etl::EtlPipeline;
use std::sync::Arc;
use tracing::debug;

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route(
            "/v1/objects/{bucket}/{*name}",
            on(MethodFilter::GET, get_object)
                .on(MethodFilter::HEAD, head_object)
                .on(MethodFilter::PUT, put_object)
                .on(MethodFilter::DELETE, delete_object),
        )
        .route(
            "/v1/buckets/{name}",
            get(head_bucket)
                .post(bucket_action)
                .patch(patch_bucket)
                .delete(delete_bucket),
        )
        .route("/v1/daemon/stats", get(daemon_stats))
        .route("/v1/daemon/state", get(daemon_state))
        .route("/v1/daemon/mountpaths", axum::routing::put(mountpath_action))
        .route("/v1/daemon/smap", axum::routing::put(set_smap))
        .route("/v1/xactions", get(xaction_snaps).put(xaction_action))
        .with_state(node)
}

/// Single-line error body; the full detail lives in the logs.
struct ApiErr {
    status: StatusCode,
    msg: String,
}

impl ApiErr {
    fn bad_request(msg: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            msg,
        }
    }
}

impl From<Error> for ApiErr {
    fn from(e: Error) -> Self {
        Self {
            status: StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            msg: e.to_string(),
        }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> Response {
        (self.status, self.msg).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiErr>;

fn parse_dpq(query: Option<String>) -> ApiResult<Dpq> {
    Dpq::parse(query.as_deref().unwrap_or("")).map_err(|e| ApiErr::bad_request(e.to_string()))
}

fn bck_of(name: &str, dpq: &Dpq) -> Bck {
    Bck {
        provider: dpq.provider_or(Provider::Ais),
        ns: dpq.namespace.clone(),
        name: name.to_string(),
    }
}

//
// objects
//

async fn get_object(
    State(node): State<Arc<Node>>,
    Path((bucket, name)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> ApiResult<Response> {
    let dpq = parse_dpq(query)?;
    let bck = bck_of(&bucket, &dpq);
    let validate = dpq.validate_cksum
        || node
            .tgt
            .t
            .init_bck(&bck)
            .map(|p| p.cksum.validate_warm_get)
            .unwrap_or(false);
    let (bytes, attrs) = node
        .tgt
        .get_object(&bck, &name, validate, dpq.latest_ver && !dpq.skip_vc)
        .await?;
    let mut headers = HeaderMap::new();
    attr_headers(&mut headers, &attrs);
    Ok((headers, bytes).into_response())
}

async fn put_object(
    State(node): State<Arc<Node>>,
    Path((bucket, name)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> ApiResult<Response> {
    let dpq = parse_dpq(query)?;
    let bck = bck_of(&bucket, &dpq);
    let owt = if dpq.owt == "migrate" { Owt::Migrate } else { Owt::Put };
    let body = if dpq.etl_name.is_empty() {
        body
    } else {
        let pipeline = node
            .etls
            .pipeline(&[dpq.etl_name.clone()])
            .map_err(ApiErr::from)?;
        pipeline.transform(&name, body).await?
    };
    let version = node.tgt.put_object(&bck, &name, body, owt).await?;
    let mut headers = HeaderMap::new();
    if let Ok(v) = version.to_string().parse() {
        headers.insert("x-shoal-version", v);
    }
    Ok((StatusCode::OK, headers).into_response())
}

async fn head_object(
    State(node): State<Arc<Node>>,
    Path((bucket, name)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> ApiResult<Response> {
    let dpq = parse_dpq(query)?;
    let bck = bck_of(&bucket, &dpq);
    let attrs = node.tgt.head_object(&bck, &name).await?;
    let mut headers = HeaderMap::new();
    attr_headers(&mut headers, &attrs);
    headers.insert("content-length", attrs.size.into());
    Ok((StatusCode::OK, headers).into_response())
}

async fn delete_object(
    State(node): State<Arc<Node>>,
    Path((bucket, name)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> ApiResult<StatusCode> {
    let dpq = parse_dpq(query)?;
    let bck = bck_of(&bucket, &dpq);
    node.tgt.delete_object(&bck, &name, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn attr_headers(headers: &mut HeaderMap, attrs: &shoal_common::ObjAttrs) {
    if let Some(v) = &attrs.version {
        if let Ok(hv) = v.to_string().parse() {
            headers.insert("x-shoal-version", hv);
        }
    }
    if let Some(cksum) = &attrs.cksum {
        if let Ok(hv) = cksum.value.parse() {
            headers.insert("x-shoal-cksum-value", hv);
        }
        if let Ok(hv) = cksum.ty.as_str().parse() {
            headers.insert("x-shoal-cksum-type", hv);
        }
    }
    if let Some(ct) = attrs.get_custom(custom::CONTENT_TYPE) {
        if let Ok(hv) = ct.parse() {
            headers.insert("content-type", hv);
        }
    }
}

//
// buckets
//

#[derive(Debug, Deserialize)]
struct ActionMsg {
    action: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ToBckMsg {
    to_bck: Bck,
    #[serde(flatten)]
    rest: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct XactStarted {
    uuid: String,
}

async fn head_bucket(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
) -> ApiResult<Response> {
    let dpq = parse_dpq(query)?;
    let bck = bck_of(&name, &dpq);
    let props = node.tgt.t.init_bck(&bck)?;
    if let Some(rbck) = node.tgt.remote_bck(&bck)? {
        // confirm existence with the backend on first touch
        let backend = node.tgt.backend(&rbck)?;
        let remote_props = backend.head_bucket(&rbck).await?;
        debug!(%bck, ?remote_props, "remote bucket verified");
    }
    Ok(Json(&*props).into_response())
}

async fn bucket_action(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    Json(msg): Json<ActionMsg>,
) -> ApiResult<Response> {
    let dpq = parse_dpq(query)?;
    let bck = bck_of(&name, &dpq);
    match msg.action.as_str() {
        "create" => {
            let to_set: Option<BpropsToSet> = from_value_opt(msg.value)?;
            node.create_bucket(&bck, to_set.as_ref())?;
            Ok(StatusCode::OK.into_response())
        }
        "destroy" => {
            node.destroy_bucket(&bck)?;
            Ok(StatusCode::OK.into_response())
        }
        "set-props" => {
            let to_set: BpropsToSet = from_value(msg.value)?;
            node.set_bucket_props(&bck, &to_set)?;
            Ok(StatusCode::OK.into_response())
        }
        "make-ncopies" => {
            let copies: u32 = from_value(msg.value)?;
            let to_set = BpropsToSet {
                mirror: Some(shoal_common::types::MirrorConfToSet {
                    enabled: Some(copies > 1),
                    copies: Some(copies),
                }),
                ..Default::default()
            };
            node.set_bucket_props(&bck, &to_set)?;
            Ok(StatusCode::OK.into_response())
        }
        "ec-encode" => {
            let to_set = BpropsToSet {
                ec: Some(shoal_common::types::EcConfToSet {
                    enabled: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            };
            node.set_bucket_props(&bck, &to_set)?;
            Ok(StatusCode::OK.into_response())
        }
        "list-objects" => {
            let lso: LsoMsg = from_value_or_default(msg.value)?;
            let out = list_objects(&node, &bck, lso).await?;
            Ok(Json(out).into_response())
        }
        "prefetch" => {
            let pmsg: PrefetchMsg = from_value_or_default(msg.value)?;
            let x = renew_or_conflict(&node, kind::PREFETCH, &bck, "")?;
            let uuid = x.uuid().to_string();
            let tgt = node.tgt.clone();
            let bck2 = bck.clone();
            tokio::spawn(async move {
                let _ = shoal_xs::run_prefetch(&tgt, &x, &bck2, &pmsg).await;
            });
            Ok(Json(XactStarted { uuid }).into_response())
        }
        "delete" | "evict" => {
            let lr: ListRange = from_value_or_default(msg.value)?;
            let evict = msg.action == "evict";
            let x = renew_or_conflict(
                &node,
                if evict { kind::EVICT } else { kind::DELETE },
                &bck,
                "",
            )?;
            // multi-object removal completes before replying (callers
            // list right after)
            shoal_xs::run_delete_evict(&node.tgt, &x, &bck, &lr, evict, true).await?;
            Ok(Json(XactStarted {
                uuid: x.uuid().to_string(),
            })
            .into_response())
        }
        "copy" => {
            let to: ToBckMsg = from_value(msg.value)?;
            let tcb: shoal_common::msg::TcbMsg = from_value_or_default(to.rest)?;
            let etl = resolve_etl(&node, &tcb.etl)?;
            let x = renew_or_conflict(&node, kind::TCB, &bck, "")?;
            shoal_xs::run_tcb(&node.tgt, &x, &bck, &to.to_bck, &tcb, etl).await?;
            Ok(Json(XactStarted {
                uuid: x.uuid().to_string(),
            })
            .into_response())
        }
        "copy-listrange" => {
            let to: ToBckMsg = from_value(msg.value)?;
            let tco: TcoMsg = from_value_or_default(to.rest)?;
            let etl = resolve_etl(&node, &tco.tcb.etl)?;
            let x = renew_or_conflict(&node, kind::TCO, &bck, "")?;
            shoal_xs::run_tco(&node.tgt, &x, &bck, &to.to_bck, &tco, etl).await?;
            Ok(Json(XactStarted {
                uuid: x.uuid().to_string(),
            })
            .into_response())
        }
        "archive" => {
            let to: ToBckMsg = from_value(msg.value)?;
            let amsg: ArchiveMsg = from_value(to.rest)?;
            let x = renew_or_conflict(&node, kind::ARCHIVE, &to.to_bck, &amsg.archname)?;
            shoal_xs::archive::run_archive(&node.tgt, &x, &bck, &to.to_bck, &amsg).await?;
            Ok(Json(XactStarted {
                uuid: x.uuid().to_string(),
            })
            .into_response())
        }
        "rename" => {
            let to: ToBckMsg = from_value(msg.value)?;
            let uuid = node.rename_bucket(&bck, &to.to_bck).await?;
            Ok(Json(XactStarted { uuid }).into_response())
        }
        other => Err(ApiErr::bad_request(format!("unknown bucket action {other:?}"))),
    }
}

async fn patch_bucket(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    Json(to_set): Json<BpropsToSet>,
) -> ApiResult<StatusCode> {
    let dpq = parse_dpq(query)?;
    node.set_bucket_props(&bck_of(&name, &dpq), &to_set)?;
    Ok(StatusCode::OK)
}

async fn delete_bucket(
    State(node): State<Arc<Node>>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
) -> ApiResult<StatusCode> {
    let dpq = parse_dpq(query)?;
    node.destroy_bucket(&bck_of(&name, &dpq))?;
    Ok(StatusCode::OK)
}

async fn list_objects(node: &Arc<Node>, bck: &Bck, lso: LsoMsg) -> Result<LsoResult> {
    let remote = node.tgt.remote_bck(bck)?;
    if remote.is_none() || lso.is(lso_flags::CACHED) {
        return lso_local(&node.tgt, bck, &lso);
    }
    let rbck = remote.unwrap();
    let backend = node.tgt.backend(&rbck)?;
    let mut out = LsoResult::default();
    backend.list_objects(&rbck, &lso, &mut out).await?;
    if lso.is(lso_flags::DIFF) {
        mark_version_changes(&node.tgt, bck, &mut out.entries);
    }
    Ok(out)
}

fn resolve_etl(node: &Arc<Node>, names: &[String]) -> Result<EtlPipeline> {
    if names.is_empty() {
        Ok(EtlPipeline::identity())
    } else {
        node.etls.pipeline(names)
    }
}

fn renew_or_conflict(
    node: &Arc<Node>,
    xkind: &'static str,
    bck: &Bck,
    ctlmsg: &str,
) -> Result<Arc<shoal_xact::XactBase>> {
    match node.tgt.reg.renew(xkind, Some(bck), "", ctlmsg) {
        RenewRes::New(x) => Ok(x),
        RenewRes::UsePrev(prev) => Err(Error::XactUsePrev(prev.name())),
        RenewRes::Refused(why) => Err(Error::Fatal(format!("renewal refused: {why}"))),
    }
}

fn from_value<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> ApiResult<T> {
    serde_json::from_value(v).map_err(|e| ApiErr::bad_request(format!("bad action value: {e}")))
}

fn from_value_opt<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> ApiResult<Option<T>> {
    if v.is_null() {
        return Ok(None);
    }
    from_value(v).map(Some)
}

fn from_value_or_default<T: serde::de::DeserializeOwned + Default>(
    v: serde_json::Value,
) -> ApiResult<T> {
    if v.is_null() {
        return Ok(T::default());
    }
    from_value(v)
}

//
// daemon
//

async fn daemon_stats(State(node): State<Arc<Node>>) -> Response {
    Json(node.stats().snapshot()).into_response()
}

async fn daemon_state(State(node): State<Arc<Node>>) -> Response {
    let t = &node.tgt.t;
    let mpaths: Vec<_> = t
        .mfs
        .available()
        .iter()
        .map(|m| m.path.display().to_string())
        .collect();
    Json(json!({
        "tid": t.tid,
        "smap_version": t.smap().version,
        "bmd_version": t.bmd.read().version,
        "alerts": shoal_stats::alert::render(t.stats.flags()),
        "mountpaths": mpaths,
        "hk_tasks": node.hk.task_names(),
    }))
    .into_response()
}

async fn mountpath_action(
    State(node): State<Arc<Node>>,
    Json(msg): Json<ActionMsg>,
) -> ApiResult<StatusCode> {
    let path: String = from_value(msg.value)?;
    let t = &node.tgt.t;
    match msg.action.as_str() {
        "add" => {
            t.mfs.add(&path)?;
            node.on_mountpath_change();
        }
        "remove" => {
            t.mfs.remove(&path)?;
            node.on_mountpath_change();
        }
        "enable" => t.mfs.set_enabled(&path, true)?,
        "disable" => t.mfs.set_enabled(&path, false)?,
        other => return Err(ApiErr::bad_request(format!("unknown mountpath action {other:?}"))),
    }
    Ok(StatusCode::OK)
}

/// Cluster-map updates arrive from the gateway layer. A membership
/// change mid-xaction is every running job's problem (the sentinel
/// aborts on it); starting the rebalance is the caller's next move.
async fn set_smap(
    State(node): State<Arc<Node>>,
    Json(smap): Json<shoal_placement::Smap>,
) -> ApiResult<StatusCode> {
    let prev = node.tgt.t.smap();
    if smap.version < prev.version {
        return Err(ApiErr::from(Error::Fatal(format!(
            "stale cluster map: v{} < v{}",
            smap.version, prev.version
        ))));
    }
    node.tgt.t.set_smap(smap);
    Ok(StatusCode::OK)
}

//
// xactions
//

async fn xaction_snaps(State(node): State<Arc<Node>>) -> Response {
    Json(node.tgt.reg.snaps()).into_response()
}

#[derive(Debug, Deserialize)]
struct XactCtl {
    action: String,
    #[serde(default)]
    uuid: String,
}

async fn xaction_action(
    State(node): State<Arc<Node>>,
    Json(msg): Json<XactCtl>,
) -> ApiResult<StatusCode> {
    match msg.action.as_str() {
        "abort" => {
            match node.tgt.reg.get_by_uuid(&msg.uuid) {
                Some(x) => {
                    x.abort("aborted by request");
                    Ok(StatusCode::OK)
                }
                None => Err(ApiErr::from(Error::Fatal(format!(
                    "xaction {:?} not found",
                    msg.uuid
                )))),
            }
        }
        "cleanup" => {
            let node2 = Arc::clone(&node);
            tokio::task::spawn_blocking(move || {
                node2.run_space_cleanup(&Default::default(), false);
            });
            Ok(StatusCode::OK)
        }
        "rebalance" => {
            let x = match node.tgt.reg.renew(kind::REBALANCE, None, &msg.uuid, "") {
                RenewRes::New(x) => x,
                RenewRes::UsePrev(prev) => {
                    return Err(ApiErr::from(Error::XactUsePrev(prev.name())));
                }
                RenewRes::Refused(why) => {
                    return Err(ApiErr::from(Error::Fatal(format!(
                        "renewal refused: {why}"
                    ))));
                }
            };
            let node2 = Arc::clone(&node);
            let opts = node.stream_opts();
            tokio::spawn(async move {
                let _ =
                    shoal_xs::run_rebalance(&node2.tgt.t, &x, &node2.demux, &opts).await;
            });
            Ok(StatusCode::OK)
        }
        "resilver" => {
            node.on_mountpath_change();
            Ok(StatusCode::OK)
        }
        other => Err(ApiErr::bad_request(format!("unknown xaction action {other:?}"))),
    }
}
