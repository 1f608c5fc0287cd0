//! HTTP handlers: lead submission, lead status, health.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::ingest::{self, IngestError, LeadSubmission, RequestEnvelope};
use crate::models::LeadStatus;
use crate::store::now_ms;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubmitLeadRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub postal_code: Option<String>,
    pub source: Option<String>,
    pub source_key: Option<String>,
    pub idempotency_key: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub region_code: Option<String>,
    pub message: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub consent: Option<bool>,
    pub gdpr_consent: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct LeadAcceptedResponse {
    pub lead_id: i64,
    pub status: LeadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer_id: Option<i64>,
    pub source_id: i64,
    pub offer_id: i64,
    pub market_id: i64,
    pub vertical_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

pub async fn submit_lead(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Json(request): Json<SubmitLeadRequest>,
) -> Result<(StatusCode, Json<LeadAcceptedResponse>), ApiError> {
    let source_id = match headers.get("source_id") {
        None => None,
        Some(value) => {
            let parsed = value.to_str().ok().and_then(|v| v.trim().parse::<i64>().ok());
            match parsed {
                Some(id) => Some(id),
                // A source_id header that is not a number can never resolve.
                None => return Err(IngestError::InvalidSource.into()),
            }
        }
    };

    let envelope = RequestEnvelope {
        source_id,
        host: headers
            .get(axum::http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(String::from),
        path: uri.path().to_string(),
    };

    let submission = LeadSubmission {
        name: request.name.unwrap_or_default(),
        email: request.email.unwrap_or_default(),
        phone: request.phone.unwrap_or_default(),
        postal_code: request.postal_code.unwrap_or_default(),
        source: request.source,
        source_key: request.source_key,
        idempotency_key: request.idempotency_key,
        country_code: request.country_code,
        city: request.city,
        region_code: request.region_code,
        message: request.message,
        utm_source: request.utm_source,
        utm_medium: request.utm_medium,
        utm_campaign: request.utm_campaign,
        consent: request.consent,
        gdpr_consent: request.gdpr_consent,
    };

    let db = state.db.clone();
    let policies = state.policies.clone();
    let deadline = Duration::from_secs(state.config.request_timeout_secs);

    let work = tokio::task::spawn_blocking(move || {
        ingest::ingest(&db, &policies, &submission, &envelope, now_ms())
    });

    let accepted = match tokio::time::timeout(deadline, work).await {
        Err(_) => return Err(IngestError::RequestTimeout.into()),
        Ok(Err(join_err)) => {
            return Err(ApiError::internal(format!("ingest task failed: {}", join_err)))
        }
        Ok(Ok(result)) => result?,
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(LeadAcceptedResponse {
            lead_id: accepted.lead_id,
            status: accepted.status,
            buyer_id: accepted.buyer_id,
            source_id: accepted.source_id,
            offer_id: accepted.offer_id,
            market_id: accepted.market_id,
            vertical_id: accepted.vertical_id,
            price: accepted.price,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct LeadDetailResponse {
    pub lead_id: i64,
    pub status: LeadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer_id: Option<i64>,
    pub is_duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_reason: Option<String>,
    pub attempt_count: i64,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<String>,
}

/// Replayed clients poll this to watch a lead move through the pipeline.
pub async fn get_lead(
    State(state): State<AppState>,
    Path(lead_id): Path<i64>,
) -> Result<Json<LeadDetailResponse>, ApiError> {
    let lead = state
        .db
        .lead(lead_id)
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("lead_not_found", "no lead with that id"))?;

    let attempt_count = state
        .db
        .attempt_count(lead_id)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let iso = |ms: i64| {
        chrono::DateTime::<Utc>::from_timestamp_millis(ms)
            .unwrap_or_else(Utc::now)
            .to_rfc3339()
    };

    Ok(Json(LeadDetailResponse {
        lead_id: lead.id,
        status: lead.status,
        buyer_id: lead.buyer_id,
        is_duplicate: lead.is_duplicate,
        duplicate_of: lead.duplicate_of,
        validation_reason: lead.validation_reason.clone(),
        attempt_count,
        created_at: iso(lead.created_at_ms),
        delivered_at: lead.delivered_at_ms.map(iso),
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub time: String,
    pub queue_depth: i64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue_depth = state.db.delivery_queue_depth().unwrap_or(-1);
    Json(HealthResponse {
        status: "healthy",
        time: Utc::now().to_rfc3339(),
        queue_depth,
    })
}
