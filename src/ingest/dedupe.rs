//! Duplicate detection.
//!
//! Runs after the lead row exists and before the validator's terminal
//! transition. Matching reads committed rows only; two in-flight leads
//! cannot see each other, which the window policy tolerates.

use anyhow::Result;
use serde::Deserialize;

use crate::models::{Lead, LeadStatus};
use crate::store::audit::DuplicateEventRecord;
use crate::store::leads::DuplicateQuery;
use crate::store::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupKey {
    Phone,
    Email,
}

impl DupKey {
    fn as_str(&self) -> &'static str {
        match self {
            DupKey::Phone => "phone",
            DupKey::Email => "email",
        }
    }

    fn parse(s: &str) -> Result<Self, String> {
        match s {
            "phone" => Ok(DupKey::Phone),
            "email" => Ok(DupKey::Email),
            other => Err(format!("unknown duplicate key: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Any,
    All,
}

impl MatchMode {
    fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Any => "any",
            MatchMode::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeSources {
    Any,
    SameSourceOnly,
}

impl IncludeSources {
    fn as_str(&self) -> &'static str {
        match self {
            IncludeSources::Any => "any",
            IncludeSources::SameSourceOnly => "same_source_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupAction {
    Reject,
    Flag,
    Accept,
}

impl DupAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DupAction::Reject => "reject",
            DupAction::Flag => "flag",
            DupAction::Accept => "accept",
        }
    }
}

/// The `duplicate_detection` object as it appears inside validation policy
/// JSON. `normalize` is accepted for documentation value and ignored; the
/// normalizers are fixed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RawDuplicatePolicy {
    pub enabled: bool,
    pub window_hours: Option<i64>,
    pub scope: Option<String>,
    pub keys: Vec<String>,
    pub match_mode: Option<String>,
    pub exclude_statuses: Vec<String>,
    pub include_sources: Option<String>,
    pub action: Option<String>,
    pub reason_code: Option<String>,
    pub min_fields: Vec<String>,
    pub normalize: Option<serde_json::Value>,
}

/// Validated duplicate-detection settings. Only built when `enabled`.
#[derive(Debug, Clone)]
pub struct DedupeConfig {
    pub window_hours: i64,
    pub keys: Vec<DupKey>,
    pub match_mode: MatchMode,
    pub exclude_statuses: Vec<LeadStatus>,
    pub include_sources: IncludeSources,
    pub action: DupAction,
    pub reason_code: String,
    pub min_fields: Vec<DupKey>,
}

impl DedupeConfig {
    /// Returns Ok(None) when detection is disabled. Any malformed field is a
    /// policy misconfiguration, reported via the error string.
    pub fn from_raw(raw: RawDuplicatePolicy) -> Result<Option<Self>, String> {
        if !raw.enabled {
            return Ok(None);
        }

        let window_hours = raw
            .window_hours
            .ok_or_else(|| "duplicate_detection.window_hours is required".to_string())?;
        if !(1..=8760).contains(&window_hours) {
            return Err(format!(
                "duplicate_detection.window_hours out of range: {}",
                window_hours
            ));
        }

        match raw.scope.as_deref() {
            Some("offer") => {}
            Some(other) => {
                return Err(format!("unsupported duplicate_detection.scope: {}", other))
            }
            None => return Err("duplicate_detection.scope is required".to_string()),
        }

        if raw.keys.is_empty() {
            return Err("duplicate_detection.keys must not be empty".to_string());
        }
        let keys = raw
            .keys
            .iter()
            .map(|k| DupKey::parse(k))
            .collect::<Result<Vec<_>, _>>()?;

        let match_mode = match raw.match_mode.as_deref() {
            None | Some("any") => MatchMode::Any,
            Some("all") => MatchMode::All,
            Some(other) => return Err(format!("unknown match_mode: {}", other)),
        };

        let exclude_statuses = raw
            .exclude_statuses
            .iter()
            .map(|s| {
                LeadStatus::from_str(s).ok_or_else(|| format!("unknown exclude status: {}", s))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let include_sources = match raw.include_sources.as_deref() {
            None | Some("any") => IncludeSources::Any,
            Some("same_source_only") => IncludeSources::SameSourceOnly,
            Some(other) => return Err(format!("unknown include_sources: {}", other)),
        };

        let action = match raw.action.as_deref() {
            Some("reject") => DupAction::Reject,
            Some("flag") => DupAction::Flag,
            Some("accept") => DupAction::Accept,
            Some(other) => return Err(format!("unknown duplicate action: {}", other)),
            None => return Err("duplicate_detection.action is required".to_string()),
        };

        let min_fields = raw
            .min_fields
            .iter()
            .map(|k| DupKey::parse(k))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Self {
            window_hours,
            keys,
            match_mode,
            exclude_statuses,
            include_sources,
            action,
            reason_code: raw.reason_code.unwrap_or_else(|| "duplicate".to_string()),
            min_fields,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupeOutcome {
    /// A min-field had no normalized value; detection did not run.
    Skipped,
    NoMatch,
    Matched {
        duplicate_of: i64,
        action: DupAction,
        rejected: bool,
        reason_code: String,
    },
}

fn key_value<'a>(lead: &'a Lead, key: DupKey) -> Option<&'a str> {
    let v = match key {
        DupKey::Phone => lead.normalized_phone.as_deref(),
        DupKey::Email => lead.normalized_email.as_deref(),
    };
    v.filter(|s| !s.is_empty())
}

/// Run detection for one lead. Safe to re-run: every mutation is guarded, and
/// the audit event is written only when its mutation actually applied.
pub fn run_dedupe(
    db: &Db,
    lead: &Lead,
    cfg: &DedupeConfig,
    now_ms: i64,
) -> Result<DedupeOutcome> {
    for min in &cfg.min_fields {
        if key_value(lead, *min).is_none() {
            return Ok(DedupeOutcome::Skipped);
        }
    }

    let phone = cfg
        .keys
        .contains(&DupKey::Phone)
        .then(|| key_value(lead, DupKey::Phone))
        .flatten();
    let email = cfg
        .keys
        .contains(&DupKey::Email)
        .then(|| key_value(lead, DupKey::Email))
        .flatten();

    match cfg.match_mode {
        // `all` cannot be satisfied if any configured key has no value.
        MatchMode::All => {
            let missing = (cfg.keys.contains(&DupKey::Phone) && phone.is_none())
                || (cfg.keys.contains(&DupKey::Email) && email.is_none());
            if missing {
                return Ok(DedupeOutcome::NoMatch);
            }
        }
        MatchMode::Any => {
            if phone.is_none() && email.is_none() {
                return Ok(DedupeOutcome::NoMatch);
            }
        }
    }

    let since_ms = now_ms - cfg.window_hours * 3_600_000;
    let hit = db.find_duplicate(&DuplicateQuery {
        offer_id: lead.offer_id,
        current_lead_id: lead.id,
        current_created_at_ms: lead.created_at_ms,
        since_ms,
        source_id: lead.source_id,
        same_source_only: cfg.include_sources == IncludeSources::SameSourceOnly,
        phone,
        email,
        match_all: cfg.match_mode == MatchMode::All,
        exclude_statuses: &cfg.exclude_statuses,
    })?;

    let Some((dup_id, _dup_created)) = hit else {
        return Ok(DedupeOutcome::NoMatch);
    };

    let applied = match cfg.action {
        DupAction::Reject => {
            db.mark_rejected_duplicate(lead.id, &cfg.reason_code, dup_id, now_ms)?
        }
        DupAction::Flag => db.flag_duplicate(lead.id, dup_id)?,
        DupAction::Accept => db.note_duplicate_of(lead.id, dup_id)?,
    };

    if applied {
        db.record_duplicate_event(
            &DuplicateEventRecord {
                lead_id: lead.id,
                matched_lead_id: dup_id,
                match_keys: cfg.keys.iter().map(|k| k.as_str().to_string()).collect(),
                window_hours: cfg.window_hours,
                match_mode: cfg.match_mode.as_str().to_string(),
                include_sources: cfg.include_sources.as_str().to_string(),
                action: cfg.action.as_str().to_string(),
                reason_code: cfg.reason_code.clone(),
            },
            now_ms,
        )?;
    }

    Ok(DedupeOutcome::Matched {
        duplicate_of: dup_id,
        action: cfg.action,
        rejected: cfg.action == DupAction::Reject && applied,
        reason_code: cfg.reason_code.clone(),
    })
}
