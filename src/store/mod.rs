//! SQLite persistence layer.
//!
//! The database is the single source of truth for lead state. Every status
//! transition is a conditional UPDATE whose WHERE clause names the expected
//! prior state, which is what makes retries and concurrent workers safe.

pub mod audit;
pub mod catalog;
pub mod leads;
pub mod queue;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS markets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    timezone TEXT NOT NULL,
    currency TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS verticals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS validation_policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL DEFAULT 1,
    rules TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS routing_policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL DEFAULT 1,
    config TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS offers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    vertical_id INTEGER NOT NULL REFERENCES verticals(id),
    name TEXT NOT NULL,
    validation_policy_id INTEGER REFERENCES validation_policies(id),
    routing_policy_id INTEGER REFERENCES routing_policies(id),
    default_price REAL,
    active INTEGER NOT NULL DEFAULT 1,
    UNIQUE(market_id, vertical_id, name)
);

CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    offer_id INTEGER NOT NULL REFERENCES offers(id),
    source_key TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL CHECK (kind IN ('landing_page','partner_api','embed_form')),
    hostname TEXT,
    path_prefix TEXT,
    api_key_hash TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    CHECK (path_prefix IS NULL OR hostname IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS idx_sources_hostname
    ON sources(hostname, active) WHERE hostname IS NOT NULL;

CREATE TABLE IF NOT EXISTS buyers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    contact_email TEXT,
    contact_phone TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    balance REAL NOT NULL DEFAULT 0 CHECK (balance >= 0),
    credit_limit REAL,
    webhook_url TEXT,
    webhook_secret TEXT,
    notify_email INTEGER NOT NULL DEFAULT 0,
    notify_sms INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS buyer_offers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    buyer_id INTEGER NOT NULL REFERENCES buyers(id),
    offer_id INTEGER NOT NULL REFERENCES offers(id),
    active INTEGER NOT NULL DEFAULT 1,
    routing_priority INTEGER NOT NULL DEFAULT 1 CHECK (routing_priority >= 1),
    capacity_per_day INTEGER,
    capacity_per_hour INTEGER,
    price REAL,
    webhook_url TEXT,
    webhook_secret TEXT,
    notify_email INTEGER,
    notify_sms INTEGER,
    min_balance_required REAL,
    pause_until INTEGER,
    UNIQUE(buyer_id, offer_id)
);

CREATE TABLE IF NOT EXISTS buyer_service_areas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    buyer_id INTEGER NOT NULL REFERENCES buyers(id),
    market_id INTEGER NOT NULL REFERENCES markets(id),
    scope_type TEXT NOT NULL CHECK (scope_type IN ('postal_code','city')),
    scope_value TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    UNIQUE(buyer_id, market_id, scope_type, scope_value)
);

CREATE TABLE IF NOT EXISTS offer_exclusivity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    offer_id INTEGER NOT NULL REFERENCES offers(id),
    buyer_id INTEGER NOT NULL REFERENCES buyers(id),
    scope_type TEXT NOT NULL CHECK (scope_type IN ('postal_code','city')),
    scope_value TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    UNIQUE(offer_id, scope_type, scope_value)
);

CREATE TABLE IF NOT EXISTS leads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES sources(id),
    offer_id INTEGER NOT NULL REFERENCES offers(id),
    market_id INTEGER NOT NULL REFERENCES markets(id),
    vertical_id INTEGER NOT NULL REFERENCES verticals(id),
    idempotency_key TEXT NOT NULL,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    phone TEXT NOT NULL,
    postal_code TEXT NOT NULL,
    country_code TEXT NOT NULL DEFAULT 'US',
    city TEXT,
    region_code TEXT,
    message TEXT,
    utm_source TEXT,
    utm_medium TEXT,
    utm_campaign TEXT,
    consent INTEGER,
    gdpr_consent INTEGER,
    normalized_email TEXT,
    normalized_phone TEXT,
    status TEXT NOT NULL DEFAULT 'received'
        CHECK (status IN ('received','validated','routed','delivered','accepted','rejected')),
    billing_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (billing_status IN ('pending','billed','paid','disputed','refunded')),
    buyer_id INTEGER REFERENCES buyers(id),
    price REAL,
    is_duplicate INTEGER NOT NULL DEFAULT 0,
    duplicate_of INTEGER REFERENCES leads(id),
    validation_reason TEXT,
    rejection_reason TEXT,
    created_at INTEGER NOT NULL,
    routed_at INTEGER,
    delivered_at INTEGER,
    accepted_at INTEGER,
    rejected_at INTEGER,
    UNIQUE(source_id, idempotency_key)
);

-- Partial indexes backing the duplicate engine's window lookups
CREATE INDEX IF NOT EXISTS idx_leads_dup_phone
    ON leads(offer_id, normalized_phone, created_at DESC)
    WHERE normalized_phone IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_leads_dup_email
    ON leads(offer_id, normalized_email, created_at DESC)
    WHERE normalized_email IS NOT NULL;

-- Capacity counters and rotation recency
CREATE INDEX IF NOT EXISTS idx_leads_buyer_delivered
    ON leads(buyer_id, offer_id, delivered_at)
    WHERE delivered_at IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_leads_status
    ON leads(status, created_at DESC);

CREATE TABLE IF NOT EXISTS delivery_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lead_id INTEGER NOT NULL REFERENCES leads(id),
    attempt_number INTEGER NOT NULL,
    outcome TEXT NOT NULL
        CHECK (outcome IN ('success','transient_failure','permanent_failure','timeout')),
    http_status INTEGER,
    error TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE(lead_id, attempt_number)
);

CREATE TABLE IF NOT EXISTS duplicate_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lead_id INTEGER NOT NULL REFERENCES leads(id),
    matched_lead_id INTEGER NOT NULL REFERENCES leads(id),
    match_keys TEXT NOT NULL,
    window_hours INTEGER NOT NULL,
    match_mode TEXT NOT NULL,
    include_sources TEXT NOT NULL,
    action TEXT NOT NULL,
    reason_code TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS lead_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lead_id INTEGER NOT NULL REFERENCES leads(id),
    outcome TEXT NOT NULL,
    buyer_id INTEGER,
    detail TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lead_events_lead
    ON lead_events(lead_id, created_at);

-- Durable delivery queue. Claiming sets claimed_until; ack deletes the row;
-- nack clears the claim and pushes available_at forward per the backoff
-- schedule. An expired claim makes the job claimable again (crash recovery).
CREATE TABLE IF NOT EXISTS delivery_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lead_id INTEGER NOT NULL REFERENCES leads(id),
    attempt_hint INTEGER NOT NULL DEFAULT 0,
    available_at INTEGER NOT NULL,
    claimed_until INTEGER NOT NULL DEFAULT 0,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_delivery_jobs_ready
    ON delivery_jobs(available_at, claimed_until);
"#;

/// Shared database handle. Cheap to clone; all access is serialized through
/// one connection so the conditional-UPDATE guards observe a consistent view.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("Database initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Milliseconds since the Unix epoch. All persisted timestamps use this.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
