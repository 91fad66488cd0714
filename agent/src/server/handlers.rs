//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    response::IntoResponse,
    Json,
};
use http::{header, HeaderMap, StatusCode};
use serde::Serialize;
use tracing::{error, warn};

use crate::deploy::report::log_run_result;
use crate::intake::event::{Delivery, DELIVERY_ID_HEADER, EVENT_KIND_HEADER};
use crate::intake::signature::SIGNATURE_HEADER;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Webhook handler.
///
/// Always answers 200 with an empty body: the sender learns nothing about
/// whether the delivery was authentic, eligible or deployed.
pub async fn webhook_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> StatusCode {
    let body = body.unwrap_or_else(|rejection| {
        warn!("Could not read request body: {}", rejection);
        Bytes::new()
    });
    let delivery = delivery_from(&headers, body);

    match state.intake.admit(&delivery) {
        Ok(job) => {
            if let Err(e) = state.queue.submit(job) {
                error!("Failed to queue deployment: {}", e);
            }
        }
        Err(result) => log_run_result(&result),
    }

    StatusCode::OK
}

fn delivery_from(headers: &HeaderMap, body: Bytes) -> Delivery {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    Delivery {
        body,
        signature: header(SIGNATURE_HEADER),
        event_kind: header(EVENT_KIND_HEADER),
        content_type: header(header::CONTENT_TYPE.as_str()),
        delivery_id: header(DELIVERY_ID_HEADER),
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}
