use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use vds::{MapMutation, MapRef, MapTreeHead};

use crate::api::{api_error, authorize, bad_request, parse_hash, ApiFailure, ApiResult, LeafDataResp, LeafHashResp, ValueReq};
use crate::auth::Permission;
use crate::service_exec::with_service_blocking;
use crate::state::SharedState;

fn object_name(name: &str) -> String {
    format!("map/{name}")
}

fn parse_key(hex_key: &str) -> Result<Vec<u8>, ApiFailure> {
    hex::decode(hex_key).map_err(|e| bad_request(format!("bad hex key: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct SetValueReq {
    #[serde(flatten)]
    pub value: ValueReq,
    /// When present the write only lands if the key's current leaf hash matches
    #[serde(default)]
    pub previous_leaf_hash: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MapValueResp {
    pub tree_size: u64,
    pub value: LeafDataResp,
    pub audit_path: Vec<Option<String>>,
}

pub async fn put_value(
    State(st): State<SharedState>,
    headers: HeaderMap,
    Path((name, hex_key)): Path<(String, String)>,
    Json(req): Json<SetValueReq>,
) -> Result<(StatusCode, Json<LeafHashResp>), ApiFailure> {
    authorize(&st, &headers, &object_name(&name), Permission::Write)?;
    let key = parse_key(&hex_key)?;
    let previous = req.previous_leaf_hash.as_deref().map(parse_hash).transpose()?;
    let value = req.value.into_leaf_data()?;
    let mutation = match previous {
        Some(prev) => MapMutation::update(key, value, prev),
        None => MapMutation::set(key, value),
    };
    let lh = st
        .service
        .map_set_value(&MapRef::new(name), mutation)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(LeafHashResp { leaf_hash: hex::encode(lh) })))
}

pub async fn delete_value(
    State(st): State<SharedState>,
    headers: HeaderMap,
    Path((name, hex_key)): Path<(String, String)>,
) -> Result<(StatusCode, Json<LeafHashResp>), ApiFailure> {
    authorize(&st, &headers, &object_name(&name), Permission::Write)?;
    let key = parse_key(&hex_key)?;
    let lh = st
        .service
        .map_set_value(&MapRef::new(name), MapMutation::delete(key))
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(LeafHashResp { leaf_hash: hex::encode(lh) })))
}

pub async fn get_value(
    State(st): State<SharedState>,
    headers: HeaderMap,
    Path((name, size, hex_key)): Path<(String, u64, String)>,
) -> ApiResult<MapValueResp> {
    authorize(&st, &headers, &object_name(&name), Permission::Read)?;
    let key = parse_key(&hex_key)?;
    let resp = with_service_blocking(st.service.clone(), move |svc| {
        svc.map_get_value(&MapRef::new(name), &key, size)
    })
    .await
    .map_err(api_error)?;
    Ok(Json(MapValueResp {
        tree_size: resp.proof.tree_size,
        value: resp.value.into(),
        audit_path: resp
            .proof
            .audit_path
            .iter()
            .map(|h| h.as_ref().map(hex::encode))
            .collect(),
    }))
}

pub async fn get_tree(
    State(st): State<SharedState>,
    headers: HeaderMap,
    Path((name, size)): Path<(String, u64)>,
) -> ApiResult<MapTreeHead> {
    authorize(&st, &headers, &object_name(&name), Permission::Read)?;
    let head = with_service_blocking(st.service.clone(), move |svc| {
        svc.map_tree_hash(&MapRef::new(name), size)
    })
    .await
    .map_err(api_error)?;
    Ok(Json(head))
}
