use axum::{http::HeaderMap, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use vds::{DataFormat, Hash32, LeafData, VdsError};

use crate::auth::Permission;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

pub type ApiFailure = (StatusCode, Json<ApiError>);
pub type ApiResult<T> = Result<Json<T>, ApiFailure>;

pub fn status_for(e: &VdsError) -> StatusCode {
    match e {
        VdsError::NotFound | VdsError::NoSuchKey => StatusCode::NOT_FOUND,
        VdsError::InvalidRequest(_) | VdsError::InvalidTreeRange => StatusCode::BAD_REQUEST,
        VdsError::NotAuthorized => StatusCode::FORBIDDEN,
        VdsError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn api_error(e: VdsError) -> ApiFailure {
    let status = status_for(&e);
    if status.is_server_error() {
        tracing::error!("request failed: {e}");
    }
    (status, Json(ApiError { error: e.to_string() }))
}

pub fn bad_request(msg: impl Into<String>) -> ApiFailure {
    api_error(VdsError::InvalidRequest(msg.into()))
}

pub fn authorize(st: &AppState, headers: &HeaderMap, object_name: &str, permission: Permission) -> Result<(), ApiFailure> {
    let api_key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    st.oracle
        .verify_allowed(api_key, object_name, permission)
        .map_err(api_error)
}

pub fn parse_hash(s: &str) -> Result<Hash32, ApiFailure> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out).map_err(|e| bad_request(format!("bad hash `{s}`: {e}")))?;
    Ok(out)
}

/// A value supplied by a client: either hex-encoded raw bytes or a JSON document.
#[derive(Debug, Deserialize)]
pub struct ValueReq {
    #[serde(default)]
    pub hex: Option<String>,
    #[serde(default)]
    pub json: Option<serde_json::Value>,
}

impl ValueReq {
    pub fn into_leaf_data(self) -> Result<LeafData, ApiFailure> {
        match (self.hex, self.json) {
            (Some(h), None) => {
                let bytes = hex::decode(&h).map_err(|e| bad_request(format!("bad hex value: {e}")))?;
                Ok(LeafData::raw(bytes))
            }
            (None, Some(doc)) => LeafData::json_from(&doc).map_err(api_error),
            _ => Err(bad_request("exactly one of `hex` or `json` is required")),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LeafDataResp {
    pub leaf_input: String,
    pub extra_data: String,
    pub format: DataFormat,
}

impl From<LeafData> for LeafDataResp {
    fn from(d: LeafData) -> Self {
        Self {
            leaf_input: hex::encode(d.leaf_input),
            extra_data: hex::encode(d.extra_data),
            format: d.format,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LeafHashResp {
    pub leaf_hash: String,
}

#[derive(Debug, Serialize)]
pub struct AuditPathResp {
    pub leaf_index: Option<u64>,
    pub from_size: Option<u64>,
    pub tree_size: u64,
    pub audit_path: Vec<String>,
}
