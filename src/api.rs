use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::auth::{bearer_token, client_ip};
use crate::codec;
use crate::error::{ApiError, ApiResult, CredError};
use crate::state::AppState;
use crate::types::{FailureReason, RegisterKeyRequest, VerificationResult};
use crate::verifier::Verifier;

/// Registrations per client and window
const REGISTER_LIMIT: u32 = 10;
/// Lookups per client and window
const LOOKUP_LIMIT: u32 = 120;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/v1/health", get(health))
        .route("/v1/keys", post(register_key))
        .route("/v1/keys/:username", get(get_key))
        .route("/v1/verify", post(verify))
        .with_state(state)
}

fn throttle(state: &AppState, headers: &HeaderMap, endpoint: &str, limit: Option<u32>) -> ApiResult<()> {
    let ip = client_ip(headers);
    let allowed = match limit {
        Some(limit) => state.limiter.check_with_limit(&ip, endpoint, limit),
        None => state.limiter.check(&ip, endpoint),
    };
    if allowed {
        Ok(())
    } else {
        tracing::debug!("Rate limited {} on {}", ip, endpoint);
        Err(ApiError::RateLimited)
    }
}

// ============ Service Endpoints ============

async fn index(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "name": "AgentCred API",
        "version": state.config.version,
        "description": "Human accountability protocol for AI agents",
        "endpoints": {
            "health": "GET /v1/health",
            "register": "POST /v1/keys",
            "lookup": "GET /v1/keys/:username",
            "verify": "POST /v1/verify",
        },
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

// ============ Key Endpoints ============

async fn register_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<RegisterKeyRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    throttle(&state, &headers, "POST:/v1/keys", Some(REGISTER_LIMIT))?;

    let token = bearer_token(&headers).ok_or_else(|| {
        ApiError::Unauthorized("Missing or invalid Authorization header".into())
    })?;
    let Json(req) = body.map_err(|e| {
        ApiError::bad_request_with_hint("Invalid request body", e.body_text())
    })?;

    let registration = state.register_key(token, req).await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

async fn get_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    throttle(&state, &headers, "GET:/v1/keys", Some(LOOKUP_LIMIT))?;
    Ok(Json(state.lookup(&username)?))
}

// ============ Verification ============

/// Accepts a bare envelope or `{"envelope": ...}`
async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    throttle(&state, &headers, "POST:/v1/verify", None)?;

    let Json(body) = body.map_err(|_| ApiError::BadRequest("Invalid JSON body".into()))?;
    let envelope_value = match body.get("envelope") {
        Some(inner) => inner,
        None => &body,
    };

    let envelope = match codec::decode_value(envelope_value) {
        Ok(envelope) => envelope,
        Err(e) => {
            let err = CredError::from(e);
            tracing::debug!("Rejected envelope: {}", err);
            let result = VerificationResult::failure(FailureReason::MalformedEnvelope, err.to_string());
            return Ok((StatusCode::BAD_REQUEST, Json(result)));
        }
    };

    let verifier = Verifier::new(Arc::clone(&state)).with_max_clock_skew(state.config.max_clock_skew);
    let result = verifier.verify(&envelope).await;

    let status = match result.reason {
        None => StatusCode::OK,
        Some(FailureReason::UnknownIdentity) => StatusCode::NOT_FOUND,
        Some(FailureReason::Unavailable) => StatusCode::SERVICE_UNAVAILABLE,
        Some(_) => StatusCode::BAD_REQUEST,
    };
    Ok((status, Json(result)))
}
