//! The ingestion pipeline: classify, acquire an idempotency key, insert,
//! dedupe, validate, route, enqueue delivery.
//!
//! Failures before the insert never create a lead row and surface
//! synchronously. Everything after the insert is recorded on the lead and
//! reported with a 202: an idempotent replay must always get the lead's
//! identity and current status back, never an error.

pub mod classifier;
pub mod dedupe;
pub mod idempotency;
pub mod normalize;
pub mod validator;

use anyhow::Result;
use std::fmt;
use tracing::{info, warn};

use crate::models::{Lead, LeadStatus};
use crate::policy_cache::{PolicyCache, PolicyError};
use crate::routing;
use crate::store::leads::NewLead;
use crate::store::Db;

use classifier::{Classification, ClassifyInput};
use dedupe::DedupeOutcome;
use idempotency::DerivationInput;
use validator::{ValidationRules, Verdict};

/// Everything the pipeline can refuse synchronously.
#[derive(Debug)]
pub enum IngestError {
    MissingField(&'static str),
    InvalidSource,
    InvalidSourceKey,
    InvalidSourceKeyFormat,
    UnmappedSource,
    AmbiguousSourceMapping,
    MissingHostHeader,
    InvalidIdempotencyKeyFormat,
    IdempotencyDerivationFailed,
    PolicyMisconfigured(String),
    RequestTimeout,
    Internal(anyhow::Error),
}

impl IngestError {
    pub fn internal(e: anyhow::Error) -> Self {
        IngestError::Internal(e)
    }

    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> String {
        match self {
            IngestError::MissingField(f) => format!("missing_required_field:{}", f),
            IngestError::InvalidSource => "invalid_source".into(),
            IngestError::InvalidSourceKey => "invalid_source_key".into(),
            IngestError::InvalidSourceKeyFormat => "invalid_source_key_format".into(),
            IngestError::UnmappedSource => "unmapped_source".into(),
            IngestError::AmbiguousSourceMapping => "ambiguous_source_mapping".into(),
            IngestError::MissingHostHeader => "missing_host_header".into(),
            IngestError::InvalidIdempotencyKeyFormat => "invalid_idempotency_key_format".into(),
            IngestError::IdempotencyDerivationFailed => "idempotency_derivation_failed".into(),
            IngestError::PolicyMisconfigured(_) => "policy_misconfigured".into(),
            IngestError::RequestTimeout => "request_timeout".into(),
            IngestError::Internal(_) => "internal_error".into(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            IngestError::AmbiguousSourceMapping => 409,
            IngestError::PolicyMisconfigured(_) => 500,
            IngestError::Internal(_) => 500,
            IngestError::RequestTimeout => 503,
            _ => 400,
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::MissingField(field) => write!(f, "required field is missing: {}", field),
            IngestError::InvalidSource => write!(f, "no active source with that id"),
            IngestError::InvalidSourceKey => write!(f, "no active source with that key"),
            IngestError::InvalidSourceKeyFormat => write!(f, "source key is malformed"),
            IngestError::UnmappedSource => write!(f, "no source mapping for this host and path"),
            IngestError::AmbiguousSourceMapping => {
                write!(f, "more than one source maps to this host and path")
            }
            IngestError::MissingHostHeader => write!(f, "Host header is required"),
            IngestError::InvalidIdempotencyKeyFormat => {
                write!(f, "idempotency key is malformed")
            }
            IngestError::IdempotencyDerivationFailed => write!(
                f,
                "email, phone and postal_code are required to derive an idempotency key"
            ),
            IngestError::PolicyMisconfigured(detail) => {
                write!(f, "policy misconfigured: {}", detail)
            }
            IngestError::RequestTimeout => write!(f, "request deadline exceeded"),
            IngestError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

/// Parsed submission body, exactly as the client sent it.
#[derive(Debug, Clone, Default)]
pub struct LeadSubmission {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub postal_code: String,
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

/// HTTP envelope pieces the classifier needs.
#[derive(Debug, Clone, Default)]
pub struct RequestEnvelope {
    /// Admin-only numeric `source_id` header.
    pub source_id: Option<i64>,
    pub host: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct IngestAccepted {
    pub lead_id: i64,
    pub status: LeadStatus,
    pub buyer_id: Option<i64>,
    pub source_id: i64,
    pub offer_id: i64,
    pub market_id: i64,
    pub vertical_id: i64,
    pub price: Option<f64>,
    pub replay: bool,
}

fn accepted_from(lead: &Lead, replay: bool) -> IngestAccepted {
    IngestAccepted {
        lead_id: lead.id,
        status: lead.status,
        buyer_id: lead.buyer_id,
        source_id: lead.source_id,
        offer_id: lead.offer_id,
        market_id: lead.market_id,
        vertical_id: lead.vertical_id,
        price: lead.price,
        replay,
    }
}

/// Run the full pipeline for one submission.
pub fn ingest(
    db: &Db,
    policies: &PolicyCache,
    submission: &LeadSubmission,
    envelope: &RequestEnvelope,
    now_ms: i64,
) -> Result<IngestAccepted, IngestError> {
    for (field, value) in [
        ("name", &submission.name),
        ("email", &submission.email),
        ("phone", &submission.phone),
        ("postal_code", &submission.postal_code),
    ] {
        if value.trim().is_empty() {
            return Err(IngestError::MissingField(field));
        }
    }

    // `source_key` wins over the landing-page `source` alias.
    let key_candidate = submission
        .source_key
        .as_deref()
        .or(submission.source.as_deref())
        .filter(|s| !s.trim().is_empty());

    let classification = classifier::classify(
        db,
        &ClassifyInput {
            source_id: envelope.source_id,
            source_key: key_candidate,
            host: envelope.host.as_deref(),
            path: &envelope.path,
        },
    )?;

    let country_code = submission
        .country_code
        .as_deref()
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "US".to_string());

    let idempotency_key = match submission.idempotency_key.as_deref() {
        Some(raw) if !raw.trim().is_empty() => idempotency::validate_client_key(raw)?,
        _ => idempotency::derive_key(&DerivationInput {
            source_id: classification.source_id,
            name: &submission.name,
            email: &submission.email,
            phone: &submission.phone,
            country_code: &country_code,
            postal_code: &submission.postal_code,
            message: submission.message.as_deref().unwrap_or(""),
        })?,
    };

    let (lead, created) =
        insert_lead(db, submission, &classification, &idempotency_key, &country_code, now_ms)?;
    if !created {
        info!(lead_id = lead.id, "ingest replay, returning existing lead");
        return Ok(accepted_from(&lead, true));
    }

    // Validation rules (and the duplicate policy they carry).
    let offer = db
        .offer_by_id(lead.offer_id)
        .map_err(IngestError::internal)?
        .ok_or_else(|| IngestError::internal(anyhow::anyhow!("offer vanished mid-ingest")))?;
    let rules = match offer.validation_policy_id {
        None => std::sync::Arc::new(ValidationRules::default()),
        Some(policy_id) => match policies.validation_rules(db, policy_id) {
            Ok(rules) => rules,
            Err(PolicyError::Db(e)) => return Err(IngestError::Internal(e)),
            Err(PolicyError::NotFound) => {
                warn!(lead_id = lead.id, policy_id, "validation policy missing");
                return Err(IngestError::PolicyMisconfigured(format!(
                    "validation policy {} missing or inactive",
                    policy_id
                )));
            }
            Err(PolicyError::Misconfigured(detail)) => {
                warn!(lead_id = lead.id, policy_id, %detail, "validation policy rejected");
                return Err(IngestError::PolicyMisconfigured(detail));
            }
        },
    };

    // Duplicate detection runs between insert and the terminal transition.
    if let Some(dedupe_cfg) = &rules.dedupe {
        match dedupe::run_dedupe(db, &lead, dedupe_cfg, now_ms).map_err(IngestError::internal)? {
            DedupeOutcome::Matched { rejected: true, .. } => {
                let lead = reload(db, lead.id)?;
                return Ok(accepted_from(&lead, false));
            }
            _ => {}
        }
    }

    match validator::evaluate(&rules, &lead) {
        Verdict::Reject(reason) => {
            db.mark_rejected(lead.id, &reason, now_ms)
                .map_err(IngestError::internal)?;
            let lead = reload(db, lead.id)?;
            return Ok(accepted_from(&lead, false));
        }
        Verdict::Pass => {
            db.mark_validated(lead.id).map_err(IngestError::internal)?;
        }
    }

    // Routing failures are lead-state, not request errors.
    if let Err(e) = routing::route_lead(db, policies, lead.id, now_ms) {
        warn!(lead_id = lead.id, error = %e, "routing failed; lead stays validated");
    }

    let lead = reload(db, lead.id)?;
    Ok(accepted_from(&lead, false))
}

fn insert_lead(
    db: &Db,
    submission: &LeadSubmission,
    classification: &Classification,
    idempotency_key: &str,
    country_code: &str,
    now_ms: i64,
) -> Result<(Lead, bool), IngestError> {
    let normalized_email = normalize::normalize_email(&submission.email);
    let normalized_phone = normalize::normalize_phone(&submission.phone);

    let new_lead = NewLead {
        source_id: classification.source_id,
        offer_id: classification.offer_id,
        market_id: classification.market_id,
        vertical_id: classification.vertical_id,
        idempotency_key: idempotency_key.to_string(),
        name: submission.name.trim().to_string(),
        email: submission.email.trim().to_string(),
        phone: submission.phone.trim().to_string(),
        postal_code: normalize::normalize_postal(&submission.postal_code),
        country_code: country_code.to_string(),
        city: submission.city.clone().filter(|c| !c.trim().is_empty()),
        region_code: submission.region_code.clone(),
        message: submission.message.clone(),
        utm_source: submission.utm_source.clone(),
        utm_medium: submission.utm_medium.clone(),
        utm_campaign: submission.utm_campaign.clone(),
        consent: submission.consent,
        gdpr_consent: submission.gdpr_consent,
        normalized_email,
        normalized_phone,
        created_at_ms: now_ms,
    };

    let (id, created) = db
        .insert_lead_idempotent(&new_lead)
        .map_err(IngestError::internal)?;
    let lead = reload(db, id)?;
    Ok((lead, created))
}

fn reload(db: &Db, id: i64) -> Result<Lead, IngestError> {
    db.lead(id)
        .map_err(IngestError::internal)?
        .ok_or_else(|| IngestError::internal(anyhow::anyhow!("lead {} vanished", id)))
}
