//! Lead rows: race-safe idempotent insert, guarded status transitions, and
//! the lookups backing duplicate detection and routing.
//!
//! Transitions never SET a status without naming the expected prior status in
//! the WHERE clause. A zero-row update means another caller already advanced
//! the lead; callers treat that as a no-op, not an error.

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, types::Value, OptionalExtension, Row};
use std::collections::HashMap;

use crate::models::{BillingStatus, Lead, LeadStatus};
use crate::store::Db;

/// Fields persisted at ingest. Classification is immutable after insert.
#[derive(Debug, Clone)]
pub struct NewLead {
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
    pub created_at_ms: i64,
}

/// Candidate buyer pulled by the eligibility join. Capacity, pause and
/// balance filters are applied by the router according to its policy flags.
#[derive(Debug, Clone)]
pub struct RoutingCandidate {
    pub buyer_id: i64,
    pub routing_priority: i64,
    pub capacity_per_day: Option<i64>,
    pub capacity_per_hour: Option<i64>,
    pub min_balance_required: Option<f64>,
    pub pause_until_ms: Option<i64>,
    pub balance: f64,
}

/// Parameters for the duplicate engine's window lookup.
#[derive(Debug, Clone)]
pub struct DuplicateQuery<'a> {
    pub offer_id: i64,
    pub current_lead_id: i64,
    pub current_created_at_ms: i64,
    pub since_ms: i64,
    pub source_id: i64,
    pub same_source_only: bool,
    pub phone: Option<&'a str>,
    pub email: Option<&'a str>,
    /// true = all provided keys must match, false = any single key matches
    pub match_all: bool,
    pub exclude_statuses: &'a [LeadStatus],
}

const LEAD_COLS: &str = "id, source_id, offer_id, market_id, vertical_id, idempotency_key, \
     name, email, phone, postal_code, country_code, city, region_code, message, \
     utm_source, utm_medium, utm_campaign, consent, gdpr_consent, \
     normalized_email, normalized_phone, status, billing_status, buyer_id, price, \
     is_duplicate, duplicate_of, validation_reason, rejection_reason, \
     created_at, routed_at, delivered_at, accepted_at, rejected_at";

fn row_to_lead(row: &Row<'_>) -> rusqlite::Result<Lead> {
    let status: String = row.get(21)?;
    let billing: String = row.get(22)?;
    Ok(Lead {
        id: row.get(0)?,
        source_id: row.get(1)?,
        offer_id: row.get(2)?,
        market_id: row.get(3)?,
        vertical_id: row.get(4)?,
        idempotency_key: row.get(5)?,
        name: row.get(6)?,
        email: row.get(7)?,
        phone: row.get(8)?,
        postal_code: row.get(9)?,
        country_code: row.get(10)?,
        city: row.get(11)?,
        region_code: row.get(12)?,
        message: row.get(13)?,
        utm_source: row.get(14)?,
        utm_medium: row.get(15)?,
        utm_campaign: row.get(16)?,
        consent: row.get(17)?,
        gdpr_consent: row.get(18)?,
        normalized_email: row.get(19)?,
        normalized_phone: row.get(20)?,
        status: LeadStatus::from_str(&status).unwrap_or(LeadStatus::Received),
        billing_status: BillingStatus::from_str(&billing).unwrap_or(BillingStatus::Pending),
        buyer_id: row.get(23)?,
        price: row.get(24)?,
        is_duplicate: row.get(25)?,
        duplicate_of: row.get(26)?,
        validation_reason: row.get(27)?,
        rejection_reason: row.get(28)?,
        created_at_ms: row.get(29)?,
        routed_at_ms: row.get(30)?,
        delivered_at_ms: row.get(31)?,
        accepted_at_ms: row.get(32)?,
        rejected_at_ms: row.get(33)?,
    })
}

impl Db {
    /// Insert a lead, or return the existing row for the same
    /// `(source_id, idempotency_key)`. Exactly one physical row is ever
    /// created for a given key; the bool reports whether this call won.
    pub fn insert_lead_idempotent(&self, lead: &NewLead) -> Result<(i64, bool)> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT INTO leads (source_id, offer_id, market_id, vertical_id, idempotency_key,
                    name, email, phone, postal_code, country_code, city, region_code, message,
                    utm_source, utm_medium, utm_campaign, consent, gdpr_consent,
                    normalized_email, normalized_phone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21)
             ON CONFLICT(source_id, idempotency_key) DO NOTHING",
            params![
                lead.source_id,
                lead.offer_id,
                lead.market_id,
                lead.vertical_id,
                lead.idempotency_key,
                lead.name,
                lead.email,
                lead.phone,
                lead.postal_code,
                lead.country_code,
                lead.city,
                lead.region_code,
                lead.message,
                lead.utm_source,
                lead.utm_medium,
                lead.utm_campaign,
                lead.consent,
                lead.gdpr_consent,
                lead.normalized_email,
                lead.normalized_phone,
                lead.created_at_ms,
            ],
        )?;

        if inserted == 1 {
            return Ok((conn.last_insert_rowid(), true));
        }

        let id = conn
            .query_row(
                "SELECT id FROM leads WHERE source_id = ?1 AND idempotency_key = ?2",
                params![lead.source_id, lead.idempotency_key],
                |row| row.get(0),
            )
            .context("Conflicting lead row vanished")?;
        Ok((id, false))
    }

    pub fn lead(&self, id: i64) -> Result<Option<Lead>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {LEAD_COLS} FROM leads WHERE id = ?1"),
            params![id],
            row_to_lead,
        )
        .optional()
        .context("Failed to query lead")
    }

    pub fn lead_status(&self, id: i64) -> Result<Option<LeadStatus>> {
        let conn = self.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM leads WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.and_then(|s| LeadStatus::from_str(&s)))
    }

    // ---- guarded transitions -------------------------------------------

    /// `received → validated`. Returns false if the lead already moved on.
    pub fn mark_validated(&self, id: i64) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE leads SET status = 'validated' WHERE id = ?1 AND status = 'received'",
            params![id],
        )?;
        Ok(n == 1)
    }

    /// `received|validated → rejected` with a validation reason.
    pub fn mark_rejected(&self, id: i64, reason: &str, now_ms: i64) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE leads SET status = 'rejected', validation_reason = ?2, rejected_at = ?3
             WHERE id = ?1 AND status IN ('received', 'validated')",
            params![id, reason, now_ms],
        )?;
        Ok(n == 1)
    }

    /// Duplicate `reject` action: terminal rejection plus the duplicate link.
    pub fn mark_rejected_duplicate(
        &self,
        id: i64,
        reason: &str,
        duplicate_of: i64,
        now_ms: i64,
    ) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE leads SET status = 'rejected', validation_reason = ?2,
                    is_duplicate = 1, duplicate_of = ?3, rejected_at = ?4
             WHERE id = ?1 AND status = 'received'",
            params![id, reason, duplicate_of, now_ms],
        )?;
        Ok(n == 1)
    }

    /// Duplicate `flag` action: mark and link, status untouched.
    pub fn flag_duplicate(&self, id: i64, duplicate_of: i64) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE leads SET is_duplicate = 1, duplicate_of = ?2
             WHERE id = ?1 AND duplicate_of IS NULL",
            params![id, duplicate_of],
        )?;
        Ok(n == 1)
    }

    /// Duplicate `accept` action: persist the back-reference only.
    pub fn note_duplicate_of(&self, id: i64, duplicate_of: i64) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE leads SET duplicate_of = ?2 WHERE id = ?1 AND duplicate_of IS NULL",
            params![id, duplicate_of],
        )?;
        Ok(n == 1)
    }

    /// `validated → routed`, assigning the winning buyer. The
    /// `buyer_id IS NULL` guard is the sole defense against double
    /// assignment under concurrent routers.
    pub fn assign_buyer(
        &self,
        id: i64,
        buyer_id: i64,
        price: Option<f64>,
        now_ms: i64,
    ) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE leads SET status = 'routed', buyer_id = ?2, price = ?3, routed_at = ?4
             WHERE id = ?1 AND status = 'validated' AND buyer_id IS NULL",
            params![id, buyer_id, price, now_ms],
        )?;
        Ok(n == 1)
    }

    /// `routed → delivered`. Losing a race here is fine: someone delivered.
    pub fn mark_delivered(&self, id: i64, now_ms: i64) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE leads SET status = 'delivered', delivered_at = ?2
             WHERE id = ?1 AND status = 'routed'",
            params![id, now_ms],
        )?;
        Ok(n == 1)
    }

    // ---- duplicate engine lookup ---------------------------------------

    /// Best matching prior lead in the window, or None. Candidates are
    /// strictly older than the current lead (same-instant rows break the
    /// tie by id) so `duplicate_of` can never form a cycle. Deterministic
    /// winner: newest `created_at`, then highest id.
    pub fn find_duplicate(&self, q: &DuplicateQuery<'_>) -> Result<Option<(i64, i64)>> {
        let phone = q.phone.filter(|p| !p.is_empty());
        let email = q.email.filter(|e| !e.is_empty());
        if phone.is_none() && email.is_none() {
            return Ok(None);
        }

        let mut sql = String::from(
            "SELECT id, created_at FROM leads
             WHERE offer_id = ?1 AND created_at >= ?2
               AND (created_at < ?3 OR (created_at = ?3 AND id < ?4))",
        );
        let mut args: Vec<Value> = vec![
            Value::Integer(q.offer_id),
            Value::Integer(q.since_ms),
            Value::Integer(q.current_created_at_ms),
            Value::Integer(q.current_lead_id),
        ];

        let mut key_clauses = Vec::new();
        if let Some(p) = phone {
            args.push(Value::Text(p.to_string()));
            key_clauses.push(format!("normalized_phone = ?{}", args.len()));
        }
        if let Some(e) = email {
            args.push(Value::Text(e.to_string()));
            key_clauses.push(format!("normalized_email = ?{}", args.len()));
        }
        let joiner = if q.match_all { " AND " } else { " OR " };
        sql.push_str(&format!(" AND ({})", key_clauses.join(joiner)));

        if q.same_source_only {
            args.push(Value::Integer(q.source_id));
            sql.push_str(&format!(" AND source_id = ?{}", args.len()));
        }

        if !q.exclude_statuses.is_empty() {
            let mut placeholders = Vec::new();
            for status in q.exclude_statuses {
                args.push(Value::Text(status.as_str().to_string()));
                placeholders.push(format!("?{}", args.len()));
            }
            sql.push_str(&format!(" AND status NOT IN ({})", placeholders.join(", ")));
        }

        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT 1");

        let conn = self.lock();
        conn.query_row(&sql, params_from_iter(args), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()
        .context("Failed to run duplicate lookup")
    }

    // ---- routing support -----------------------------------------------

    /// Buyers enrolled in the offer, active, with an active service area
    /// covering the lead's market and location. Ordered by buyer id for
    /// deterministic downstream tie-breaking.
    pub fn routing_candidates(
        &self,
        offer_id: i64,
        market_id: i64,
        postal_code: &str,
        city: Option<&str>,
    ) -> Result<Vec<RoutingCandidate>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT bo.buyer_id, bo.routing_priority, bo.capacity_per_day,
                    bo.capacity_per_hour, bo.min_balance_required, bo.pause_until, b.balance
             FROM buyer_offers bo
             JOIN buyers b ON b.id = bo.buyer_id AND b.active = 1
             JOIN buyer_service_areas sa
               ON sa.buyer_id = bo.buyer_id AND sa.market_id = ?2 AND sa.active = 1
              AND ((sa.scope_type = 'postal_code' AND sa.scope_value = ?3)
                OR (sa.scope_type = 'city' AND ?4 IS NOT NULL
                    AND sa.scope_value = ?4 COLLATE NOCASE))
             WHERE bo.offer_id = ?1 AND bo.active = 1
             ORDER BY bo.buyer_id ASC",
        )?;
        let rows = stmt.query_map(params![offer_id, market_id, postal_code, city], |row| {
            Ok(RoutingCandidate {
                buyer_id: row.get(0)?,
                routing_priority: row.get(1)?,
                capacity_per_day: row.get(2)?,
                capacity_per_hour: row.get(3)?,
                min_balance_required: row.get(4)?,
                pause_until_ms: row.get(5)?,
                balance: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delivered-lead counts per buyer for this offer since the given UTC
    /// day and hour starts. Feeds the capacity filters.
    pub fn delivered_counts(
        &self,
        offer_id: i64,
        day_start_ms: i64,
        hour_start_ms: i64,
    ) -> Result<HashMap<i64, (i64, i64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT buyer_id,
                    SUM(CASE WHEN delivered_at >= ?2 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN delivered_at >= ?3 THEN 1 ELSE 0 END)
             FROM leads
             WHERE offer_id = ?1 AND buyer_id IS NOT NULL AND delivered_at IS NOT NULL
             GROUP BY buyer_id",
        )?;
        let rows = stmt.query_map(params![offer_id, day_start_ms, hour_start_ms], |row| {
            Ok((row.get::<_, i64>(0)?, (row.get(1)?, row.get(2)?)))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (buyer, counts) = row?;
            out.insert(buyer, counts);
        }
        Ok(out)
    }

    /// Most recent delivered-lead time per buyer for this offer. Buyers
    /// that never took a delivery are simply absent. Feeds `rotation`.
    pub fn last_delivered_ms(&self, offer_id: i64) -> Result<HashMap<i64, i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT buyer_id, MAX(delivered_at)
             FROM leads
             WHERE offer_id = ?1 AND buyer_id IS NOT NULL AND delivered_at IS NOT NULL
             GROUP BY buyer_id",
        )?;
        let rows = stmt.query_map(params![offer_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (buyer, ts) = row?;
            out.insert(buyer, ts);
        }
        Ok(out)
    }

    pub fn lead_count(&self) -> Result<i64> {
        let conn = self.lock();
        conn.query_row("SELECT COUNT(*) FROM leads", [], |row| row.get(0))
            .context("Failed to count leads")
    }

    // ---- operator replay -----------------------------------------------

    /// Routed leads with no successful attempt and no queued job. These are
    /// the ones delivery gave up on (retry_exhausted or a crashed worker
    /// whose job was acked); the replay tool re-enqueues them.
    pub fn routed_undelivered(&self, limit: i64) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT l.id FROM leads l
             WHERE l.status = 'routed'
               AND NOT EXISTS (SELECT 1 FROM delivery_attempts a
                               WHERE a.lead_id = l.id AND a.outcome = 'success')
               AND NOT EXISTS (SELECT 1 FROM delivery_jobs j WHERE j.lead_id = l.id)
             ORDER BY l.id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::catalog::{NewBuyer, NewMarket, NewOffer, NewSource, NewVertical};
    use crate::models::SourceKind;

    fn setup() -> (Db, i64, i64, i64, i64) {
        let db = Db::open_in_memory().unwrap();
        let market = db
            .upsert_market(&NewMarket {
                name: "austin".into(),
                timezone: "America/Chicago".into(),
                currency: "USD".into(),
                active: true,
            })
            .unwrap();
        let vertical = db
            .upsert_vertical(&NewVertical {
                name: "Plumbing".into(),
                slug: "plumbing".into(),
                active: true,
            })
            .unwrap();
        let offer = db
            .upsert_offer(&NewOffer {
                market_id: market,
                vertical_id: vertical,
                name: "plumbing-austin".into(),
                validation_policy_id: None,
                routing_policy_id: None,
                default_price: None,
                active: true,
            })
            .unwrap();
        let source = db
            .upsert_source(&NewSource {
                offer_id: offer,
                source_key: "aus-plb-v1".into(),
                kind: SourceKind::LandingPage,
                hostname: None,
                path_prefix: None,
                api_key_hash: None,
                active: true,
            })
            .unwrap();
        (db, market, vertical, offer, source)
    }

    fn new_lead(
        source: i64,
        offer: i64,
        market: i64,
        vertical: i64,
        key: &str,
        created_at_ms: i64,
    ) -> NewLead {
        NewLead {
            source_id: source,
            offer_id: offer,
            market_id: market,
            vertical_id: vertical,
            idempotency_key: key.to_string(),
            name: "Jane".into(),
            email: "j@x.com".into(),
            phone: "+15125550123".into(),
            postal_code: "78701".into(),
            country_code: "US".into(),
            city: None,
            region_code: None,
            message: None,
            utm_source: None,
            utm_medium: None,
            utm_campaign: None,
            consent: None,
            gdpr_consent: None,
            normalized_email: Some("j@x.com".into()),
            normalized_phone: Some("+15125550123".into()),
            created_at_ms,
        }
    }

    #[test]
    fn idempotent_insert_returns_same_row() {
        let (db, market, vertical, offer, source) = setup();
        let lead = new_lead(source, offer, market, vertical, "key-0123456789abcdef", 1_000);

        let (id1, created1) = db.insert_lead_idempotent(&lead).unwrap();
        let (id2, created2) = db.insert_lead_idempotent(&lead).unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(id1, id2);
    }

    #[test]
    fn transitions_are_guarded() {
        let (db, market, vertical, offer, source) = setup();
        let lead = new_lead(source, offer, market, vertical, "key-0123456789abcdef", 1_000);
        let (id, _) = db.insert_lead_idempotent(&lead).unwrap();

        let buyer_a = db
            .upsert_buyer(&NewBuyer {
                name: "buyer-a".into(),
                contact_email: None,
                contact_phone: None,
                active: true,
                balance: 0.0,
                credit_limit: None,
                webhook_url: None,
                webhook_secret: None,
                notify_email: false,
                notify_sms: false,
            })
            .unwrap();
        let buyer_b = db
            .upsert_buyer(&NewBuyer {
                name: "buyer-b".into(),
                contact_email: None,
                contact_phone: None,
                active: true,
                balance: 0.0,
                credit_limit: None,
                webhook_url: None,
                webhook_secret: None,
                notify_email: false,
                notify_sms: false,
            })
            .unwrap();

        assert!(db.mark_validated(id).unwrap());
        // Second validation attempt is a no-op, not an error.
        assert!(!db.mark_validated(id).unwrap());

        assert!(db.assign_buyer(id, buyer_a, Some(42.0), 2_000).unwrap());
        // Racing router loses cleanly.
        assert!(!db.assign_buyer(id, buyer_b, Some(42.0), 2_001).unwrap());

        let row = db.lead(id).unwrap().unwrap();
        assert_eq!(row.status, LeadStatus::Routed);
        assert_eq!(row.buyer_id, Some(buyer_a));

        assert!(db.mark_delivered(id, 3_000).unwrap());
        assert!(!db.mark_delivered(id, 3_001).unwrap());
        assert_eq!(
            db.lead_status(id).unwrap().unwrap(),
            LeadStatus::Delivered
        );

        // Rejection cannot claw back a delivered lead.
        assert!(!db.mark_rejected(id, "too_late", 4_000).unwrap());
    }

    #[test]
    fn duplicate_lookup_respects_window_and_order() {
        let (db, market, vertical, offer, source) = setup();
        let older = new_lead(source, offer, market, vertical, "key-aaaaaaaaaaaaaaaa", 1_000);
        let newer = new_lead(source, offer, market, vertical, "key-bbbbbbbbbbbbbbbb", 5_000);
        let current = new_lead(source, offer, market, vertical, "key-cccccccccccccccc", 9_000);
        let (older_id, _) = db.insert_lead_idempotent(&older).unwrap();
        let (newer_id, _) = db.insert_lead_idempotent(&newer).unwrap();
        let (cur_id, _) = db.insert_lead_idempotent(&current).unwrap();
        let _ = older_id;

        let q = DuplicateQuery {
            offer_id: offer,
            current_lead_id: cur_id,
            current_created_at_ms: 9_000,
            since_ms: 0,
            source_id: source,
            same_source_only: false,
            phone: Some("+15125550123"),
            email: None,
            match_all: false,
            exclude_statuses: &[],
        };

        // Newest prior lead wins the tie-break.
        let hit = db.find_duplicate(&q).unwrap().unwrap();
        assert_eq!(hit.0, newer_id);

        // Window excludes everything before 6_000.
        let hit = db
            .find_duplicate(&DuplicateQuery { since_ms: 6_000, ..q.clone() })
            .unwrap();
        assert!(hit.is_none());
    }

    #[test]
    fn duplicate_lookup_excludes_statuses() {
        let (db, market, vertical, offer, source) = setup();
        let first = new_lead(source, offer, market, vertical, "key-aaaaaaaaaaaaaaaa", 1_000);
        let second = new_lead(source, offer, market, vertical, "key-bbbbbbbbbbbbbbbb", 2_000);
        let (first_id, _) = db.insert_lead_idempotent(&first).unwrap();
        let (second_id, _) = db.insert_lead_idempotent(&second).unwrap();
        db.mark_rejected(first_id, "spam", 1_500).unwrap();

        let q = DuplicateQuery {
            offer_id: offer,
            current_lead_id: second_id,
            current_created_at_ms: 2_000,
            since_ms: 0,
            source_id: source,
            same_source_only: false,
            phone: Some("+15125550123"),
            email: None,
            match_all: false,
            exclude_statuses: &[LeadStatus::Rejected],
        };
        assert!(db.find_duplicate(&q).unwrap().is_none());
    }
}
