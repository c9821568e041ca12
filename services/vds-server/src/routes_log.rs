use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use vds::{LeafLocator, LogRef, LogTreeHead};

use crate::api::{api_error, authorize, parse_hash, ApiFailure, ApiResult, AuditPathResp, LeafDataResp, LeafHashResp, ValueReq};
use crate::auth::Permission;
use crate::service_exec::with_service_blocking;
use crate::state::SharedState;

fn object_name(name: &str) -> String {
    format!("log/{name}")
}

pub async fn post_entry(
    State(st): State<SharedState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(req): Json<ValueReq>,
) -> Result<(StatusCode, Json<LeafHashResp>), ApiFailure> {
    authorize(&st, &headers, &object_name(&name), Permission::Write)?;
    let value = req.into_leaf_data()?;
    let lh = st
        .service
        .log_add_entry(&LogRef::user(name), value)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(LeafHashResp { leaf_hash: hex::encode(lh) })))
}

pub async fn get_tree(
    State(st): State<SharedState>,
    headers: HeaderMap,
    Path((name, size)): Path<(String, u64)>,
) -> ApiResult<LogTreeHead> {
    authorize(&st, &headers, &object_name(&name), Permission::Read)?;
    let head = with_service_blocking(st.service.clone(), move |svc| {
        svc.log_tree_hash(&LogRef::user(name), size)
    })
    .await
    .map_err(api_error)?;
    Ok(Json(head))
}

async fn inclusion(st: SharedState, name: String, size: u64, leaf: LeafLocator) -> ApiResult<AuditPathResp> {
    let proof = with_service_blocking(st.service.clone(), move |svc| {
        svc.log_inclusion_proof(&LogRef::user(name), size, leaf)
    })
    .await
    .map_err(api_error)?;
    Ok(Json(AuditPathResp {
        leaf_index: Some(proof.leaf_index),
        from_size: None,
        tree_size: proof.tree_size,
        audit_path: proof.audit_path.iter().map(hex::encode).collect(),
    }))
}

pub async fn get_inclusion_by_index(
    State(st): State<SharedState>,
    headers: HeaderMap,
    Path((name, size, index)): Path<(String, u64, u64)>,
) -> ApiResult<AuditPathResp> {
    authorize(&st, &headers, &object_name(&name), Permission::Read)?;
    inclusion(st, name, size, LeafLocator::Index(index)).await
}

pub async fn get_inclusion_by_hash(
    State(st): State<SharedState>,
    headers: HeaderMap,
    Path((name, size, leaf_hash)): Path<(String, u64, String)>,
) -> ApiResult<AuditPathResp> {
    authorize(&st, &headers, &object_name(&name), Permission::Read)?;
    let lh = parse_hash(&leaf_hash)?;
    inclusion(st, name, size, LeafLocator::LeafHash(lh)).await
}

pub async fn get_consistency(
    State(st): State<SharedState>,
    headers: HeaderMap,
    Path((name, size, from)): Path<(String, u64, u64)>,
) -> ApiResult<AuditPathResp> {
    authorize(&st, &headers, &object_name(&name), Permission::Read)?;
    let proof = with_service_blocking(st.service.clone(), move |svc| {
        svc.log_consistency_proof(&LogRef::user(name), from, size)
    })
    .await
    .map_err(api_error)?;
    Ok(Json(AuditPathResp {
        leaf_index: None,
        from_size: Some(proof.from_size),
        tree_size: proof.tree_size,
        audit_path: proof.audit_path.iter().map(hex::encode).collect(),
    }))
}

/// Entries `[first, last)`; `last` 0 means up to the current head
pub async fn get_entries(
    State(st): State<SharedState>,
    headers: HeaderMap,
    Path((name, first, last)): Path<(String, u64, u64)>,
) -> ApiResult<Vec<LeafDataResp>> {
    authorize(&st, &headers, &object_name(&name), Permission::Read)?;
    let entries = with_service_blocking(st.service.clone(), move |svc| {
        svc.log_fetch_entries(&LogRef::user(name), first, last)
    })
    .await
    .map_err(api_error)?;
    Ok(Json(entries.into_iter().map(LeafDataResp::from).collect()))
}
