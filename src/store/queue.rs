//! Durable delivery queue over the `delivery_jobs` table.
//!
//! At-least-once semantics: a claim sets `claimed_until` and makes the job
//! invisible for the visibility window; ack deletes the row; nack clears the
//! claim and reschedules. A worker crash simply lets the claim expire, after
//! which the job is claimable again. The executor must therefore tolerate
//! seeing the same job twice, which it does by re-reading lead state.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use crate::store::Db;

/// One unit of delivery work. Carries no mutable lead data; the executor
/// re-reads authoritative state from the leads table.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub id: i64,
    pub lead_id: i64,
    pub attempt_hint: i64,
}

impl Db {
    /// Enqueue delivery work for a lead, visible after `delay_ms`.
    pub fn enqueue_delivery(&self, lead_id: i64, delay_ms: i64, now_ms: i64) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO delivery_jobs (lead_id, attempt_hint, available_at, enqueued_at)
             VALUES (?1, 0, ?2, ?3)",
            params![lead_id, now_ms + delay_ms, now_ms],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim the next ready job for `visibility_ms`, or None if the queue is
    /// drained. The claim is a single conditional UPDATE so two workers can
    /// never hold the same job inside one visibility window.
    pub fn claim_delivery(&self, now_ms: i64, visibility_ms: i64) -> Result<Option<DeliveryJob>> {
        let conn = self.lock();
        conn.query_row(
            "UPDATE delivery_jobs SET claimed_until = ?1 + ?2
             WHERE id = (SELECT id FROM delivery_jobs
                         WHERE available_at <= ?1 AND claimed_until <= ?1
                         ORDER BY available_at ASC, id ASC
                         LIMIT 1)
               AND claimed_until <= ?1
             RETURNING id, lead_id, attempt_hint",
            params![now_ms, visibility_ms],
            |row| {
                Ok(DeliveryJob {
                    id: row.get(0)?,
                    lead_id: row.get(1)?,
                    attempt_hint: row.get(2)?,
                })
            },
        )
        .optional()
        .context("Failed to claim delivery job")
    }

    /// Successful (or terminally failed) processing removes the job.
    pub fn ack_delivery(&self, job_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM delivery_jobs WHERE id = ?1", params![job_id])?;
        Ok(())
    }

    /// Return the job to the queue, visible again after `delay_ms`.
    pub fn nack_delivery(&self, job_id: i64, delay_ms: i64, now_ms: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE delivery_jobs
             SET available_at = ?2 + ?3, claimed_until = 0, attempt_hint = attempt_hint + 1
             WHERE id = ?1",
            params![job_id, now_ms, delay_ms],
        )?;
        Ok(())
    }

    pub fn delivery_queue_depth(&self) -> Result<i64> {
        let conn = self.lock();
        conn.query_row("SELECT COUNT(*) FROM delivery_jobs", [], |row| row.get(0))
            .context("Failed to count delivery jobs")
    }

    pub fn has_pending_delivery(&self, lead_id: i64) -> Result<bool> {
        let conn = self.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM delivery_jobs WHERE lead_id = ?1",
            params![lead_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }
}
