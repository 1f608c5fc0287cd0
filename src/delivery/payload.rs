//! Outbound webhook wire format and signing.
//!
//! The payload is built deterministically from lead fields. The body-level
//! `idempotency` is the lead's ingestion key (buyers dedupe on it); the
//! per-attempt delivery id travels in a header so operators can trace
//! individual attempts without breaking buyer-side dedup.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::models::Lead;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_LEAD_DELIVERED: &str = "lead.delivered";

pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";
pub const HEADER_DELIVERY_ID: &str = "X-LeadGen-Delivery-Id";
pub const HEADER_EVENT: &str = "X-LeadGen-Event";
pub const USER_AGENT: &str = "LeadGen/1.0";

#[derive(Debug, Serialize)]
pub struct WebhookEnvelope {
    pub event: &'static str,
    pub data: WebhookData,
}

#[derive(Debug, Serialize)]
pub struct WebhookData {
    pub lead_id: i64,
    pub received_at: String,
    pub delivered_at: String,
    pub idempotency: String,
    pub contact: Contact,
    pub details: Details,
    pub metadata: Metadata,
}

#[derive(Debug, Serialize)]
pub struct Contact {
    pub name: String,
    pub phone: String,
    pub email: String,
    pub postal_code: String,
}

#[derive(Debug, Serialize)]
pub struct Details {
    pub message: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    pub price: Option<f64>,
    pub buyer_id: i64,
}

fn iso8601(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

/// Serialize the delivery body for a routed lead.
pub fn build_body(
    lead: &Lead,
    buyer_id: i64,
    source_key: Option<String>,
    delivered_at_ms: i64,
) -> anyhow::Result<String> {
    let envelope = WebhookEnvelope {
        event: EVENT_LEAD_DELIVERED,
        data: WebhookData {
            lead_id: lead.id,
            received_at: iso8601(lead.created_at_ms),
            delivered_at: iso8601(delivered_at_ms),
            idempotency: lead.idempotency_key.clone(),
            contact: Contact {
                name: lead.name.clone(),
                phone: lead.phone.clone(),
                email: lead.email.clone(),
                postal_code: lead.postal_code.clone(),
            },
            details: Details {
                message: lead.message.clone(),
                source: source_key,
            },
            metadata: Metadata {
                price: lead.price,
                buyer_id,
            },
        },
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Hex HMAC-SHA256 of the exact body bytes.
pub fn sign_body(secret: &str, body: &str) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("HMAC key error: {}", e))?;
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
