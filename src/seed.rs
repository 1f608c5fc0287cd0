//! Catalog seeding from a JSON document (`SEED_PATH`).
//!
//! The seed is applied idempotently: entities upsert by their natural keys,
//! so restarting with the same file changes nothing. This is the external
//! admin interface in file form; the pipeline itself never writes here.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;

use crate::models::{BuyerServiceArea, OfferExclusivity, ScopeType, SourceKind};
use crate::store::catalog::{
    NewBuyer, NewBuyerOffer, NewMarket, NewOffer, NewSource, NewVertical,
};
use crate::store::Db;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeedDocument {
    pub markets: Vec<NewMarket>,
    pub verticals: Vec<NewVertical>,
    pub offers: Vec<SeedOffer>,
    pub buyers: Vec<SeedBuyer>,
    pub exclusivity: Vec<SeedExclusivity>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedOffer {
    pub market: String,
    pub vertical: String,
    pub name: String,
    #[serde(default)]
    pub default_price: Option<f64>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Raw validation policy rules, stored verbatim on the policy row.
    #[serde(default)]
    pub validation_rules: Option<serde_json::Value>,
    /// Raw routing policy config, stored verbatim on the policy row.
    #[serde(default)]
    pub routing_config: Option<serde_json::Value>,
    #[serde(default)]
    pub sources: Vec<SeedSource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedSource {
    pub source_key: String,
    pub kind: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

// No deny_unknown_fields here: serde cannot combine it with flatten.
#[derive(Debug, Deserialize)]
pub struct SeedBuyer {
    #[serde(flatten)]
    pub buyer: NewBuyer,
    #[serde(default)]
    pub enrollments: Vec<SeedEnrollment>,
    #[serde(default)]
    pub service_areas: Vec<SeedServiceArea>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedEnrollment {
    pub offer: String,
    #[serde(default = "default_priority")]
    pub routing_priority: i64,
    #[serde(default)]
    pub capacity_per_day: Option<i64>,
    #[serde(default)]
    pub capacity_per_hour: Option<i64>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub min_balance_required: Option<f64>,
    #[serde(default)]
    pub pause_until_ms: Option<i64>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedServiceArea {
    pub market: String,
    pub scope_type: String,
    pub scope_value: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedExclusivity {
    pub offer: String,
    pub buyer: String,
    pub scope_type: String,
    pub scope_value: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i64 {
    1
}

fn parse_scope(s: &str) -> Result<ScopeType> {
    ScopeType::from_str(s).with_context(|| format!("unknown scope_type: {}", s))
}

pub fn apply_seed_file(db: &Db, path: &str) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file {}", path))?;
    let doc: SeedDocument =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse seed file {}", path))?;
    apply_seed(db, &doc)
}

pub fn apply_seed(db: &Db, doc: &SeedDocument) -> Result<()> {
    let mut market_ids = HashMap::new();
    for market in &doc.markets {
        let id = db.upsert_market(market)?;
        market_ids.insert(market.name.clone(), id);
    }

    let mut vertical_ids = HashMap::new();
    for vertical in &doc.verticals {
        let id = db.upsert_vertical(vertical)?;
        vertical_ids.insert(vertical.slug.clone(), id);
    }

    let mut offer_ids = HashMap::new();
    for offer in &doc.offers {
        let market_id = *market_ids
            .get(&offer.market)
            .with_context(|| format!("offer {} references unknown market {}", offer.name, offer.market))?;
        let vertical_id = *vertical_ids
            .get(&offer.vertical)
            .with_context(|| format!("offer {} references unknown vertical {}", offer.name, offer.vertical))?;

        // Policies ride along with their offer: update in place when the
        // offer already has one, otherwise create a fresh row.
        let existing = db.offer_by_name(market_id, vertical_id, &offer.name)?;
        let validation_policy_id = match &offer.validation_rules {
            None => existing.as_ref().and_then(|o| o.validation_policy_id),
            Some(rules) => {
                let json = serde_json::to_string(rules)?;
                match existing.as_ref().and_then(|o| o.validation_policy_id) {
                    Some(id) => {
                        db.update_validation_policy(id, &json)?;
                        Some(id)
                    }
                    None => Some(db.create_validation_policy(&json, 1)?),
                }
            }
        };
        let routing_policy_id = match &offer.routing_config {
            None => existing.as_ref().and_then(|o| o.routing_policy_id),
            Some(config) => {
                let json = serde_json::to_string(config)?;
                match existing.as_ref().and_then(|o| o.routing_policy_id) {
                    Some(id) => {
                        db.update_routing_policy(id, &json)?;
                        Some(id)
                    }
                    None => Some(db.create_routing_policy(&json, 1)?),
                }
            }
        };

        let offer_id = db.upsert_offer(&NewOffer {
            market_id,
            vertical_id,
            name: offer.name.clone(),
            validation_policy_id,
            routing_policy_id,
            default_price: offer.default_price,
            active: offer.active,
        })?;
        offer_ids.insert(offer.name.clone(), offer_id);

        for source in &offer.sources {
            let kind = SourceKind::from_str(&source.kind)
                .with_context(|| format!("unknown source kind: {}", source.kind))?;
            db.upsert_source(&NewSource {
                offer_id,
                source_key: source.source_key.clone(),
                kind,
                hostname: source.hostname.clone(),
                path_prefix: source.path_prefix.clone(),
                api_key_hash: None,
                active: source.active,
            })?;
        }
    }

    let mut buyer_ids = HashMap::new();
    for entry in &doc.buyers {
        let buyer_id = db.upsert_buyer(&entry.buyer)?;
        buyer_ids.insert(entry.buyer.name.clone(), buyer_id);

        for enrollment in &entry.enrollments {
            let offer_id = *offer_ids.get(&enrollment.offer).with_context(|| {
                format!(
                    "buyer {} enrolls in unknown offer {}",
                    entry.buyer.name, enrollment.offer
                )
            })?;
            db.upsert_buyer_offer(&NewBuyerOffer {
                buyer_id,
                offer_id,
                active: enrollment.active,
                routing_priority: enrollment.routing_priority,
                capacity_per_day: enrollment.capacity_per_day,
                capacity_per_hour: enrollment.capacity_per_hour,
                price: enrollment.price,
                webhook_url: enrollment.webhook_url.clone(),
                webhook_secret: enrollment.webhook_secret.clone(),
                min_balance_required: enrollment.min_balance_required,
                pause_until_ms: enrollment.pause_until_ms,
            })?;
        }

        for area in &entry.service_areas {
            let market_id = *market_ids.get(&area.market).with_context(|| {
                format!(
                    "buyer {} covers unknown market {}",
                    entry.buyer.name, area.market
                )
            })?;
            db.upsert_service_area(&BuyerServiceArea {
                id: 0,
                buyer_id,
                market_id,
                scope_type: parse_scope(&area.scope_type)?,
                scope_value: area.scope_value.clone(),
                active: area.active,
            })?;
        }
    }

    for grant in &doc.exclusivity {
        let offer_id = *offer_ids
            .get(&grant.offer)
            .with_context(|| format!("exclusivity references unknown offer {}", grant.offer))?;
        let buyer_id = *buyer_ids
            .get(&grant.buyer)
            .with_context(|| format!("exclusivity references unknown buyer {}", grant.buyer))?;
        db.grant_exclusivity(&OfferExclusivity {
            id: 0,
            offer_id,
            buyer_id,
            scope_type: parse_scope(&grant.scope_type)?,
            scope_value: grant.scope_value.clone(),
            active: grant.active,
        })?;
    }

    info!(
        markets = doc.markets.len(),
        verticals = doc.verticals.len(),
        offers = doc.offers.len(),
        buyers = doc.buyers.len(),
        "catalog seed applied"
    );
    Ok(())
}
