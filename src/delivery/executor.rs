//! Webhook delivery execution.
//!
//! One call processes one claimed job: re-read the lead, resolve the
//! effective delivery channel, POST, record the attempt, then either flip
//! `routed → delivered` (guarded), reschedule, or give up. Correct under
//! at-least-once job delivery because every decision re-reads committed
//! lead state and every transition is conditional.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::delivery::payload::{
    self, EVENT_LEAD_DELIVERED, HEADER_DELIVERY_ID, HEADER_EVENT, HEADER_SIGNATURE, USER_AGENT,
};
use crate::models::AttemptOutcome;
use crate::store::queue::DeliveryJob;
use crate::store::Db;

/// Delivery tuning lifted from the application config.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub max_attempts: i64,
    pub backoff_secs: Vec<u64>,
}

impl DeliverySettings {
    /// Delay before the next attempt, given how many attempts exist already.
    fn backoff_ms(&self, attempts_so_far: i64) -> i64 {
        let idx = attempts_so_far.max(0) as usize;
        let secs = self
            .backoff_secs
            .get(idx)
            .or(self.backoff_secs.last())
            .copied()
            .unwrap_or(0);
        (secs as i64) * 1000
    }
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

/// Raw result of one POST, before outcome classification.
#[derive(Debug, Clone)]
pub enum TransportOutcome {
    Status(u16),
    TimedOut(String),
    Failed(String),
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, request: &OutboundRequest) -> TransportOutcome;
}

/// Production transport over reqwest with explicit connect and total timeouts.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout_secs: u64, total_timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .timeout(std::time::Duration::from_secs(total_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn post(&self, request: &OutboundRequest) -> TransportOutcome {
        let mut builder = self
            .client
            .post(&request.url)
            .header("Content-Type", "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        match builder.body(request.body.clone()).send().await {
            Ok(response) => TransportOutcome::Status(response.status().as_u16()),
            Err(e) if e.is_timeout() => TransportOutcome::TimedOut(sanitize_error(&e.to_string())),
            Err(e) => TransportOutcome::Failed(sanitize_error(&e.to_string())),
        }
    }
}

/// Error text stored on attempt rows: bounded, never the payload or secrets.
fn sanitize_error(raw: &str) -> String {
    raw.chars().take(200).collect()
}

pub fn classify(outcome: &TransportOutcome) -> (AttemptOutcome, Option<i64>, Option<String>) {
    match outcome {
        TransportOutcome::Status(code) => {
            let status = Some(*code as i64);
            match code {
                200..=299 => (AttemptOutcome::Success, status, None),
                408 | 429 | 500..=599 => (
                    AttemptOutcome::TransientFailure,
                    status,
                    Some(format!("http status {}", code)),
                ),
                _ => (
                    AttemptOutcome::PermanentFailure,
                    status,
                    Some(format!("http status {}", code)),
                ),
            }
        }
        TransportOutcome::TimedOut(detail) => {
            (AttemptOutcome::Timeout, None, Some(sanitize_error(detail)))
        }
        TransportOutcome::Failed(detail) => (
            AttemptOutcome::TransientFailure,
            None,
            Some(sanitize_error(detail)),
        ),
    }
}

/// How a processed job was resolved. Acking happens inside `process_job`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResolution {
    /// The guarded `routed → delivered` transition fired (or another worker
    /// had already fired it).
    Delivered,
    /// Lead already terminal or out-of-band; nothing attempted.
    Skipped,
    Retried { delay_ms: i64 },
    Exhausted,
    PermanentFailure,
    NoChannel,
}

pub async fn process_job(
    db: &Db,
    transport: &dyn WebhookTransport,
    settings: &DeliverySettings,
    job: &DeliveryJob,
    now_ms: i64,
) -> Result<JobResolution> {
    let Some(lead) = db.lead(job.lead_id)? else {
        warn!(lead_id = job.lead_id, "delivery job for unknown lead, dropping");
        db.ack_delivery(job.id)?;
        return Ok(JobResolution::Skipped);
    };

    if lead.status.is_delivery_terminal() {
        db.ack_delivery(job.id)?;
        return Ok(JobResolution::Skipped);
    }
    let Some(buyer_id) = lead.buyer_id.filter(|_| lead.status == crate::models::LeadStatus::Routed)
    else {
        // Out-of-band state; not this worker's concern.
        db.ack_delivery(job.id)?;
        return Ok(JobResolution::Skipped);
    };

    let buyer = db
        .buyer_by_id(buyer_id)?
        .with_context(|| format!("buyer {} missing for lead {}", buyer_id, lead.id))?;
    let enrollment = db.buyer_offer(buyer_id, lead.offer_id)?;

    // Per-offer overrides beat buyer defaults.
    let webhook_url = enrollment
        .as_ref()
        .and_then(|bo| bo.webhook_url.clone())
        .or(buyer.webhook_url.clone());
    let webhook_secret = enrollment
        .as_ref()
        .and_then(|bo| bo.webhook_secret.clone())
        .or(buyer.webhook_secret.clone());

    let Some(url) = webhook_url.filter(|u| !u.trim().is_empty()) else {
        db.record_attempt(
            lead.id,
            AttemptOutcome::PermanentFailure,
            None,
            Some("no_channel"),
            now_ms,
        )?;
        db.record_lead_event(lead.id, "no_channel", Some(buyer_id), None, now_ms)?;
        db.ack_delivery(job.id)?;
        warn!(lead_id = lead.id, buyer_id, "no webhook channel configured");
        return Ok(JobResolution::NoChannel);
    };

    let source_key = db.source_key_for(lead.source_id)?;
    let body = payload::build_body(&lead, buyer_id, source_key, now_ms)?;

    let mut headers = vec![
        (HEADER_DELIVERY_ID.to_string(), Uuid::new_v4().to_string()),
        (HEADER_EVENT.to_string(), EVENT_LEAD_DELIVERED.to_string()),
    ];
    if let Some(secret) = webhook_secret.as_deref().filter(|s| !s.is_empty()) {
        headers.push((HEADER_SIGNATURE.to_string(), payload::sign_body(secret, &body)?));
    }

    let outcome = transport
        .post(&OutboundRequest {
            url,
            body,
            headers,
        })
        .await;
    let (attempt_outcome, http_status, error) = classify(&outcome);

    let attempt_number = db.record_attempt(
        lead.id,
        attempt_outcome,
        http_status,
        error.as_deref(),
        now_ms,
    )?;

    match attempt_outcome {
        AttemptOutcome::Success => {
            // Zero rows here means another worker already won; still ack.
            let transitioned = db.mark_delivered(lead.id, now_ms)?;
            db.ack_delivery(job.id)?;
            info!(
                lead_id = lead.id,
                buyer_id, attempt_number, transitioned, "lead delivered"
            );
            Ok(JobResolution::Delivered)
        }
        AttemptOutcome::TransientFailure | AttemptOutcome::Timeout => {
            if attempt_number < settings.max_attempts {
                let delay_ms = settings.backoff_ms(attempt_number);
                db.nack_delivery(job.id, delay_ms, now_ms)?;
                debug!(
                    lead_id = lead.id,
                    attempt_number, delay_ms, "transient delivery failure, rescheduled"
                );
                Ok(JobResolution::Retried { delay_ms })
            } else {
                db.record_lead_event(
                    lead.id,
                    "retry_exhausted",
                    Some(buyer_id),
                    error.as_deref(),
                    now_ms,
                )?;
                db.ack_delivery(job.id)?;
                warn!(
                    lead_id = lead.id,
                    buyer_id, attempt_number, "delivery retries exhausted; lead stays routed"
                );
                Ok(JobResolution::Exhausted)
            }
        }
        AttemptOutcome::PermanentFailure => {
            db.ack_delivery(job.id)?;
            warn!(
                lead_id = lead.id,
                buyer_id,
                attempt_number,
                status = ?http_status,
                "permanent delivery failure"
            );
            Ok(JobResolution::PermanentFailure)
        }
    }
}
