use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lead lifecycle states.
///
/// `received → validated → routed → delivered → accepted` is monotonic;
/// `rejected` is terminal and absorbing from `received` or `validated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Received,
    Validated,
    Routed,
    Delivered,
    Accepted,
    Rejected,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Received => "received",
            LeadStatus::Validated => "validated",
            LeadStatus::Routed => "routed",
            LeadStatus::Delivered => "delivered",
            LeadStatus::Accepted => "accepted",
            LeadStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "received" => Some(LeadStatus::Received),
            "validated" => Some(LeadStatus::Validated),
            "routed" => Some(LeadStatus::Routed),
            "delivered" => Some(LeadStatus::Delivered),
            "accepted" => Some(LeadStatus::Accepted),
            "rejected" => Some(LeadStatus::Rejected),
            _ => None,
        }
    }

    /// Position in the forward chain. `rejected` has no rank: it is terminal.
    pub fn rank(&self) -> Option<u8> {
        match self {
            LeadStatus::Received => Some(0),
            LeadStatus::Validated => Some(1),
            LeadStatus::Routed => Some(2),
            LeadStatus::Delivered => Some(3),
            LeadStatus::Accepted => Some(4),
            LeadStatus::Rejected => None,
        }
    }

    /// States a delivery worker treats as "nothing left to do".
    pub fn is_delivery_terminal(&self) -> bool {
        matches!(
            self,
            LeadStatus::Delivered | LeadStatus::Accepted | LeadStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Pending,
    Billed,
    Paid,
    Disputed,
    Refunded,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Pending => "pending",
            BillingStatus::Billed => "billed",
            BillingStatus::Paid => "paid",
            BillingStatus::Disputed => "disputed",
            BillingStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BillingStatus::Pending),
            "billed" => Some(BillingStatus::Billed),
            "paid" => Some(BillingStatus::Paid),
            "disputed" => Some(BillingStatus::Disputed),
            "refunded" => Some(BillingStatus::Refunded),
            _ => None,
        }
    }
}

/// Ingress channel a source represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    LandingPage,
    PartnerApi,
    EmbedForm,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::LandingPage => "landing_page",
            SourceKind::PartnerApi => "partner_api",
            SourceKind::EmbedForm => "embed_form",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "landing_page" => Some(SourceKind::LandingPage),
            "partner_api" => Some(SourceKind::PartnerApi),
            "embed_form" => Some(SourceKind::EmbedForm),
            _ => None,
        }
    }
}

/// Geographic scope used by service areas and exclusivity grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    PostalCode,
    City,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::PostalCode => "postal_code",
            ScopeType::City => "city",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "postal_code" => Some(ScopeType::PostalCode),
            "city" => Some(ScopeType::City),
            _ => None,
        }
    }
}

/// Outcome of one outbound webhook attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
    Timeout,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::TransientFailure => "transient_failure",
            AttemptOutcome::PermanentFailure => "permanent_failure",
            AttemptOutcome::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AttemptOutcome::Success),
            "transient_failure" => Some(AttemptOutcome::TransientFailure),
            "permanent_failure" => Some(AttemptOutcome::PermanentFailure),
            "timeout" => Some(AttemptOutcome::Timeout),
            _ => None,
        }
    }

    /// Timeouts retry on the same schedule as transient failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::TransientFailure | AttemptOutcome::Timeout
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: i64,
    pub name: String,
    pub timezone: String,
    pub currency: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vertical {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: i64,
    pub market_id: i64,
    pub vertical_id: i64,
    pub name: String,
    pub validation_policy_id: Option<i64>,
    pub routing_policy_id: Option<i64>,
    pub default_price: Option<f64>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub offer_id: i64,
    pub source_key: String,
    pub kind: SourceKind,
    pub hostname: Option<String>,
    pub path_prefix: Option<String>,
    pub api_key_hash: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buyer {
    pub id: i64,
    pub name: String,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub active: bool,
    pub balance: f64,
    pub credit_limit: Option<f64>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub notify_email: bool,
    pub notify_sms: bool,
}

/// Buyer enrollment into an offer, with per-offer overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerOffer {
    pub id: i64,
    pub buyer_id: i64,
    pub offer_id: i64,
    pub active: bool,
    pub routing_priority: i64,
    pub capacity_per_day: Option<i64>,
    pub capacity_per_hour: Option<i64>,
    pub price: Option<f64>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub notify_email: Option<bool>,
    pub notify_sms: Option<bool>,
    pub min_balance_required: Option<f64>,
    pub pause_until_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerServiceArea {
    pub id: i64,
    pub buyer_id: i64,
    pub market_id: i64,
    pub scope_type: ScopeType,
    pub scope_value: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferExclusivity {
    pub id: i64,
    pub offer_id: i64,
    pub buyer_id: i64,
    pub scope_type: ScopeType,
    pub scope_value: String,
    pub active: bool,
}

/// A lead row as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub source_id: i64,
    pub offer_id: i64,
    pub market_id: i64,
    pub vertical_id: i64,
    pub idempotency_key: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub postal_code: String,
    pub country_code: String,
    pub city: Option<String>,
    pub region_code: Option<String>,
    pub message: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub consent: Option<bool>,
    pub gdpr_consent: Option<bool>,
    pub normalized_email: Option<String>,
    pub normalized_phone: Option<String>,
    pub status: LeadStatus,
    pub billing_status: BillingStatus,
    pub buyer_id: Option<i64>,
    pub price: Option<f64>,
    pub is_duplicate: bool,
    pub duplicate_of: Option<i64>,
    pub validation_reason: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at_ms: i64,
    pub routed_at_ms: Option<i64>,
    pub delivered_at_ms: Option<i64>,
    pub accepted_at_ms: Option<i64>,
    pub rejected_at_ms: Option<i64>,
}

impl Lead {
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.created_at_ms).unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: i64,
    pub lead_id: i64,
    pub attempt_number: i64,
    pub outcome: AttemptOutcome,
    pub http_status: Option<i64>,
    pub error: Option<String>,
    pub created_at_ms: i64,
}

/// Application configuration, loaded once at startup. The pipeline itself
/// never reads the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub delivery_workers: usize,
    pub webhook_max_attempts: i64,
    pub webhook_backoff_secs: Vec<u64>,
    pub webhook_connect_timeout_secs: u64,
    pub webhook_total_timeout_secs: u64,
    pub queue_visibility_timeout_secs: u64,
    pub queue_poll_interval_ms: u64,
    pub policy_cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub seed_path: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./leadgen.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let delivery_workers = std::env::var("DELIVERY_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(4);

        let webhook_max_attempts = std::env::var("WEBHOOK_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(3);

        let webhook_backoff_secs: Vec<u64> = std::env::var("WEBHOOK_BACKOFF_SCHEDULE")
            .unwrap_or_else(|_| "0,5,15".to_string())
            .split(',')
            .filter_map(|s| s.trim().parse::<u64>().ok())
            .collect();
        let webhook_backoff_secs = if webhook_backoff_secs.is_empty() {
            vec![0, 5, 15]
        } else {
            webhook_backoff_secs
        };

        let webhook_connect_timeout_secs = std::env::var("WEBHOOK_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let webhook_total_timeout_secs = std::env::var("WEBHOOK_TOTAL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        // The visibility window must outlive a full attempt, with margin.
        let min_visibility = webhook_connect_timeout_secs + webhook_total_timeout_secs + 5;
        let queue_visibility_timeout_secs = std::env::var("QUEUE_VISIBILITY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30)
            .max(min_visibility);

        let queue_poll_interval_ms = std::env::var("QUEUE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(250);

        let policy_cache_ttl_secs = std::env::var("POLICY_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let request_timeout_secs = std::env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let seed_path = std::env::var("SEED_PATH").ok().filter(|p| !p.is_empty());

        Ok(Self {
            database_path,
            port,
            delivery_workers,
            webhook_max_attempts,
            webhook_backoff_secs,
            webhook_connect_timeout_secs,
            webhook_total_timeout_secs,
            queue_visibility_timeout_secs,
            queue_poll_interval_ms,
            policy_cache_ttl_secs,
            request_timeout_secs,
            seed_path,
        })
    }
}
