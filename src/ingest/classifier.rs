//! Source resolution: map an inbound request to `(source, offer, market,
//! vertical)`.
//!
//! Strict priority: explicit source id, then source key, then Host/path
//! mapping. Resolution depends only on the sources and offers tables, never
//! on validation or routing configuration.

use anyhow::Result;

use crate::ingest::IngestError;
use crate::models::Source;
use crate::store::Db;

/// Resolved classification tuple. Immutable on the lead after insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub source_id: i64,
    pub offer_id: i64,
    pub market_id: i64,
    pub vertical_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ClassifyInput<'a> {
    pub source_id: Option<i64>,
    pub source_key: Option<&'a str>,
    pub host: Option<&'a str>,
    pub path: &'a str,
}

pub fn classify(db: &Db, input: &ClassifyInput<'_>) -> Result<Classification, IngestError> {
    if let Some(id) = input.source_id {
        let source = db
            .active_source_by_id(id)
            .map_err(IngestError::internal)?
            .ok_or(IngestError::InvalidSource)?;
        return finish(db, source, IngestError::InvalidSource);
    }

    if let Some(raw_key) = input.source_key {
        let key = raw_key.trim();
        if !is_valid_source_key(key) {
            return Err(IngestError::InvalidSourceKeyFormat);
        }
        let source = db
            .active_source_by_key(key)
            .map_err(IngestError::internal)?
            .ok_or(IngestError::InvalidSourceKey)?;
        return finish(db, source, IngestError::InvalidSourceKey);
    }

    let Some(raw_host) = input.host else {
        return Err(IngestError::MissingHostHeader);
    };
    let host = normalize_hostname(raw_host);
    let path = normalize_path(input.path);

    let ranked = db
        .active_sources_by_hostname(&host)
        .map_err(IngestError::internal)?;
    let matching: Vec<&Source> = ranked
        .iter()
        .filter(|s| match s.path_prefix.as_deref() {
            Some(prefix) => path.starts_with(prefix),
            None => true,
        })
        .collect();

    match matching.as_slice() {
        [] => Err(IngestError::UnmappedSource),
        [only] => finish(db, (*only).clone(), IngestError::UnmappedSource),
        [first, second, ..] => {
            if prefix_len(first) == prefix_len(second) {
                return Err(IngestError::AmbiguousSourceMapping);
            }
            finish(db, (*first).clone(), IngestError::UnmappedSource)
        }
    }
}

/// Attach the offer's market/vertical. An inactive or missing offer is the
/// same as not finding the source at all, reported with the path's own code.
fn finish(db: &Db, source: Source, miss: IngestError) -> Result<Classification, IngestError> {
    let offer = db
        .offer_by_id(source.offer_id)
        .map_err(IngestError::internal)?
        .filter(|o| o.active)
        .ok_or(miss)?;
    Ok(Classification {
        source_id: source.id,
        offer_id: offer.id,
        market_id: offer.market_id,
        vertical_id: offer.vertical_id,
    })
}

fn prefix_len(s: &Source) -> usize {
    s.path_prefix.as_deref().map(str::len).unwrap_or(0)
}

/// `[A-Za-z0-9][A-Za-z0-9._:-]{1,127}` — alnum head, 2..=128 total.
pub fn is_valid_source_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    let rest: Vec<char> = chars.collect();
    (1..=127).contains(&rest.len())
        && rest
            .iter()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
}

/// Lowercase and strip any port, keeping IPv6 literals intact.
pub fn normalize_hostname(raw: &str) -> String {
    let host = raw.trim();
    let host = if host.starts_with('[') {
        // "[::1]:8080" → "[::1]"
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rfind(':') {
            Some(idx) => &host[..idx],
            None => host,
        }
    };
    host.to_lowercase()
}

pub fn normalize_path(raw: &str) -> String {
    let path = raw.trim();
    if path.is_empty() {
        return "/".to_string();
    }
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}
