//! TTL-bounded, read-only cache of parsed policy objects.
//!
//! Policies are versioned and read-mostly; a short TTL bounds staleness.
//! Only successful parses are cached, so a fixed policy takes effect at the
//! next lookup rather than after the TTL.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ingest::validator::{parse_validation_rules, ValidationRules};
use crate::routing::policy::{parse_routing_config, RoutingConfig};
use crate::store::Db;

#[derive(Debug)]
pub enum PolicyError {
    NotFound,
    Misconfigured(String),
    Db(anyhow::Error),
}

struct CacheEntry<T> {
    fetched: Instant,
    value: Arc<T>,
}

impl<T> CacheEntry<T> {
    fn fresh(&self, ttl: Duration) -> bool {
        self.fetched.elapsed() < ttl
    }
}

pub struct PolicyCache {
    ttl: Duration,
    validation: RwLock<HashMap<i64, CacheEntry<ValidationRules>>>,
    routing: RwLock<HashMap<i64, CacheEntry<RoutingConfig>>>,
}

impl PolicyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            validation: RwLock::new(HashMap::new()),
            routing: RwLock::new(HashMap::new()),
        }
    }

    pub fn validation_rules(
        &self,
        db: &Db,
        policy_id: i64,
    ) -> Result<Arc<ValidationRules>, PolicyError> {
        if let Some(entry) = self.validation.read().get(&policy_id) {
            if entry.fresh(self.ttl) {
                return Ok(entry.value.clone());
            }
        }

        let json = db
            .validation_policy_rules(policy_id)
            .map_err(PolicyError::Db)?
            .ok_or(PolicyError::NotFound)?;
        let rules = parse_validation_rules(&json).map_err(PolicyError::Misconfigured)?;
        let value = Arc::new(rules);
        self.validation.write().insert(
            policy_id,
            CacheEntry {
                fetched: Instant::now(),
                value: value.clone(),
            },
        );
        Ok(value)
    }

    pub fn routing_config(
        &self,
        db: &Db,
        policy_id: i64,
    ) -> Result<Arc<RoutingConfig>, PolicyError> {
        if let Some(entry) = self.routing.read().get(&policy_id) {
            if entry.fresh(self.ttl) {
                return Ok(entry.value.clone());
            }
        }

        let json = db
            .routing_policy_config(policy_id)
            .map_err(PolicyError::Db)?
            .ok_or(PolicyError::NotFound)?;
        let config = parse_routing_config(&json).map_err(PolicyError::Misconfigured)?;
        let value = Arc::new(config);
        self.routing.write().insert(
            policy_id,
            CacheEntry {
                fetched: Instant::now(),
                value: value.clone(),
            },
        );
        Ok(value)
    }
}
