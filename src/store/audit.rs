//! Append-only audit records: delivery attempts, duplicate events, and
//! routing events. Attempt numbering is derived here so it stays a gap-free
//! 1..N prefix per lead no matter how many workers write.

use anyhow::{Context, Result};
use rusqlite::params;

use crate::models::{AttemptOutcome, DeliveryAttempt};
use crate::store::Db;

#[derive(Debug, Clone)]
pub struct DuplicateEventRecord {
    pub lead_id: i64,
    pub matched_lead_id: i64,
    pub match_keys: Vec<String>,
    pub window_hours: i64,
    pub match_mode: String,
    pub include_sources: String,
    pub action: String,
    pub reason_code: String,
}

#[derive(Debug, Clone)]
pub struct LeadEvent {
    pub id: i64,
    pub lead_id: i64,
    pub outcome: String,
    pub buyer_id: Option<i64>,
    pub detail: Option<String>,
    pub created_at_ms: i64,
}

impl Db {
    /// Persist one delivery attempt and return its number. The number is
    /// computed inside the INSERT so two workers recording concurrently
    /// still produce consecutive values.
    pub fn record_attempt(
        &self,
        lead_id: i64,
        outcome: AttemptOutcome,
        http_status: Option<i64>,
        error: Option<&str>,
        now_ms: i64,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "INSERT INTO delivery_attempts (lead_id, attempt_number, outcome, http_status, error, created_at)
             SELECT ?1, COALESCE(MAX(attempt_number), 0) + 1, ?2, ?3, ?4, ?5
             FROM delivery_attempts WHERE lead_id = ?1
             RETURNING attempt_number",
            params![lead_id, outcome.as_str(), http_status, error, now_ms],
            |row| row.get(0),
        )
        .context("Failed to record delivery attempt")
    }

    pub fn attempts_for(&self, lead_id: i64) -> Result<Vec<DeliveryAttempt>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, lead_id, attempt_number, outcome, http_status, error, created_at
             FROM delivery_attempts WHERE lead_id = ?1
             ORDER BY attempt_number ASC",
        )?;
        let rows = stmt.query_map(params![lead_id], |row| {
            let outcome: String = row.get(3)?;
            Ok(DeliveryAttempt {
                id: row.get(0)?,
                lead_id: row.get(1)?,
                attempt_number: row.get(2)?,
                outcome: AttemptOutcome::from_str(&outcome)
                    .unwrap_or(AttemptOutcome::TransientFailure),
                http_status: row.get(4)?,
                error: row.get(5)?,
                created_at_ms: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn attempt_count(&self, lead_id: i64) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM delivery_attempts WHERE lead_id = ?1",
            params![lead_id],
            |row| row.get(0),
        )
        .context("Failed to count attempts")
    }

    pub fn record_duplicate_event(&self, ev: &DuplicateEventRecord, now_ms: i64) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO duplicate_events (lead_id, matched_lead_id, match_keys, window_hours,
                    match_mode, include_sources, action, reason_code, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ev.lead_id,
                ev.matched_lead_id,
                ev.match_keys.join(","),
                ev.window_hours,
                ev.match_mode,
                ev.include_sources,
                ev.action,
                ev.reason_code,
                now_ms
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn duplicate_event_count(&self, lead_id: i64) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM duplicate_events WHERE lead_id = ?1",
            params![lead_id],
            |row| row.get(0),
        )
        .context("Failed to count duplicate events")
    }

    pub fn record_lead_event(
        &self,
        lead_id: i64,
        outcome: &str,
        buyer_id: Option<i64>,
        detail: Option<&str>,
        now_ms: i64,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO lead_events (lead_id, outcome, buyer_id, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![lead_id, outcome, buyer_id, detail, now_ms],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn lead_events_for(&self, lead_id: i64) -> Result<Vec<LeadEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, lead_id, outcome, buyer_id, detail, created_at
             FROM lead_events WHERE lead_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![lead_id], |row| {
            Ok(LeadEvent {
                id: row.get(0)?,
                lead_id: row.get(1)?,
                outcome: row.get(2)?,
                buyer_id: row.get(3)?,
                detail: row.get(4)?,
                created_at_ms: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
