//! Reference data: markets, verticals, offers, sources, policies, buyers,
//! enrollments, service areas, exclusivity grants.
//!
//! The pipeline only reads these tables. Writes exist for the seed loader
//! and admin tooling; buyer balances are mutated by the billing collaborator,
//! never by the distribution core.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::Deserialize;

use crate::models::{
    Buyer, BuyerOffer, BuyerServiceArea, Market, Offer, OfferExclusivity, ScopeType, Source,
    SourceKind, Vertical,
};
use crate::store::Db;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMarket {
    pub name: String,
    pub timezone: String,
    pub currency: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewVertical {
    pub name: String,
    pub slug: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct NewOffer {
    pub market_id: i64,
    pub vertical_id: i64,
    pub name: String,
    pub validation_policy_id: Option<i64>,
    pub routing_policy_id: Option<i64>,
    pub default_price: Option<f64>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct NewSource {
    pub offer_id: i64,
    pub source_key: String,
    pub kind: SourceKind,
    pub hostname: Option<String>,
    pub path_prefix: Option<String>,
    pub api_key_hash: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBuyer {
    pub name: String,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub credit_limit: Option<f64>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub notify_email: bool,
    #[serde(default)]
    pub notify_sms: bool,
}

#[derive(Debug, Clone)]
pub struct NewBuyerOffer {
    pub buyer_id: i64,
    pub offer_id: i64,
    pub active: bool,
    pub routing_priority: i64,
    pub capacity_per_day: Option<i64>,
    pub capacity_per_hour: Option<i64>,
    pub price: Option<f64>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub min_balance_required: Option<f64>,
    pub pause_until_ms: Option<i64>,
}

impl NewBuyerOffer {
    pub fn new(buyer_id: i64, offer_id: i64, routing_priority: i64) -> Self {
        Self {
            buyer_id,
            offer_id,
            active: true,
            routing_priority,
            capacity_per_day: None,
            capacity_per_hour: None,
            price: None,
            webhook_url: None,
            webhook_secret: None,
            min_balance_required: None,
            pause_until_ms: None,
        }
    }
}

fn row_to_source(row: &Row<'_>) -> rusqlite::Result<Source> {
    let kind: String = row.get(3)?;
    Ok(Source {
        id: row.get(0)?,
        offer_id: row.get(1)?,
        source_key: row.get(2)?,
        kind: SourceKind::from_str(&kind).unwrap_or(SourceKind::LandingPage),
        hostname: row.get(4)?,
        path_prefix: row.get(5)?,
        api_key_hash: row.get(6)?,
        active: row.get(7)?,
    })
}

const SOURCE_COLS: &str =
    "id, offer_id, source_key, kind, hostname, path_prefix, api_key_hash, active";

fn row_to_buyer(row: &Row<'_>) -> rusqlite::Result<Buyer> {
    Ok(Buyer {
        id: row.get(0)?,
        name: row.get(1)?,
        contact_email: row.get(2)?,
        contact_phone: row.get(3)?,
        active: row.get(4)?,
        balance: row.get(5)?,
        credit_limit: row.get(6)?,
        webhook_url: row.get(7)?,
        webhook_secret: row.get(8)?,
        notify_email: row.get(9)?,
        notify_sms: row.get(10)?,
    })
}

const BUYER_COLS: &str = "id, name, contact_email, contact_phone, active, balance, credit_limit, \
     webhook_url, webhook_secret, notify_email, notify_sms";

impl Db {
    // ---- markets / verticals -------------------------------------------

    pub fn upsert_market(&self, m: &NewMarket) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "INSERT INTO markets (name, timezone, currency, active) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET timezone = ?2, currency = ?3, active = ?4
             RETURNING id",
            params![m.name, m.timezone, m.currency, m.active],
            |row| row.get(0),
        )
        .context("Failed to upsert market")
    }

    pub fn upsert_vertical(&self, v: &NewVertical) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "INSERT INTO verticals (name, slug, active) VALUES (?1, ?2, ?3)
             ON CONFLICT(slug) DO UPDATE SET name = ?1, active = ?3
             RETURNING id",
            params![v.name, v.slug, v.active],
            |row| row.get(0),
        )
        .context("Failed to upsert vertical")
    }

    pub fn market_by_name(&self, name: &str) -> Result<Option<Market>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, timezone, currency, active FROM markets WHERE name = ?1",
            params![name],
            |row| {
                Ok(Market {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    timezone: row.get(2)?,
                    currency: row.get(3)?,
                    active: row.get(4)?,
                })
            },
        )
        .optional()
        .context("Failed to query market")
    }

    pub fn vertical_by_slug(&self, slug: &str) -> Result<Option<Vertical>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, slug, active FROM verticals WHERE slug = ?1",
            params![slug],
            |row| {
                Ok(Vertical {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    slug: row.get(2)?,
                    active: row.get(3)?,
                })
            },
        )
        .optional()
        .context("Failed to query vertical")
    }

    // ---- policies ------------------------------------------------------

    pub fn create_validation_policy(&self, rules_json: &str, version: i64) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO validation_policies (version, rules) VALUES (?1, ?2)",
            params![version, rules_json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_validation_policy(&self, id: i64, rules_json: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE validation_policies SET rules = ?2, version = version + 1 WHERE id = ?1",
            params![id, rules_json],
        )?;
        Ok(())
    }

    pub fn validation_policy_rules(&self, id: i64) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT rules FROM validation_policies WHERE id = ?1 AND active = 1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query validation policy")
    }

    pub fn create_routing_policy(&self, config_json: &str, version: i64) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO routing_policies (version, config) VALUES (?1, ?2)",
            params![version, config_json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_routing_policy(&self, id: i64, config_json: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE routing_policies SET config = ?2, version = version + 1 WHERE id = ?1",
            params![id, config_json],
        )?;
        Ok(())
    }

    pub fn routing_policy_config(&self, id: i64) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT config FROM routing_policies WHERE id = ?1 AND active = 1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query routing policy")
    }

    // ---- offers / sources ----------------------------------------------

    pub fn upsert_offer(&self, o: &NewOffer) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "INSERT INTO offers (market_id, vertical_id, name, validation_policy_id,
                                 routing_policy_id, default_price, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(market_id, vertical_id, name) DO UPDATE SET
                 validation_policy_id = ?4, routing_policy_id = ?5,
                 default_price = ?6, active = ?7
             RETURNING id",
            params![
                o.market_id,
                o.vertical_id,
                o.name,
                o.validation_policy_id,
                o.routing_policy_id,
                o.default_price,
                o.active
            ],
            |row| row.get(0),
        )
        .context("Failed to upsert offer")
    }

    pub fn offer_by_name(
        &self,
        market_id: i64,
        vertical_id: i64,
        name: &str,
    ) -> Result<Option<Offer>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, market_id, vertical_id, name, validation_policy_id,
                    routing_policy_id, default_price, active
             FROM offers WHERE market_id = ?1 AND vertical_id = ?2 AND name = ?3",
            params![market_id, vertical_id, name],
            |row| {
                Ok(Offer {
                    id: row.get(0)?,
                    market_id: row.get(1)?,
                    vertical_id: row.get(2)?,
                    name: row.get(3)?,
                    validation_policy_id: row.get(4)?,
                    routing_policy_id: row.get(5)?,
                    default_price: row.get(6)?,
                    active: row.get(7)?,
                })
            },
        )
        .optional()
        .context("Failed to query offer by name")
    }

    pub fn offer_by_id(&self, id: i64) -> Result<Option<Offer>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, market_id, vertical_id, name, validation_policy_id,
                    routing_policy_id, default_price, active
             FROM offers WHERE id = ?1",
            params![id],
            |row| {
                Ok(Offer {
                    id: row.get(0)?,
                    market_id: row.get(1)?,
                    vertical_id: row.get(2)?,
                    name: row.get(3)?,
                    validation_policy_id: row.get(4)?,
                    routing_policy_id: row.get(5)?,
                    default_price: row.get(6)?,
                    active: row.get(7)?,
                })
            },
        )
        .optional()
        .context("Failed to query offer")
    }

    pub fn upsert_source(&self, s: &NewSource) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "INSERT INTO sources (offer_id, source_key, kind, hostname, path_prefix,
                                  api_key_hash, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(source_key) DO UPDATE SET
                 offer_id = ?1, kind = ?3, hostname = ?4, path_prefix = ?5,
                 api_key_hash = ?6, active = ?7
             RETURNING id",
            params![
                s.offer_id,
                s.source_key,
                s.kind.as_str(),
                s.hostname,
                s.path_prefix,
                s.api_key_hash,
                s.active
            ],
            |row| row.get(0),
        )
        .context("Failed to upsert source")
    }

    pub fn active_source_by_id(&self, id: i64) -> Result<Option<Source>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {SOURCE_COLS} FROM sources WHERE id = ?1 AND active = 1"),
            params![id],
            row_to_source,
        )
        .optional()
        .context("Failed to query source by id")
    }

    pub fn active_source_by_key(&self, key: &str) -> Result<Option<Source>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {SOURCE_COLS} FROM sources WHERE source_key = ?1 AND active = 1"),
            params![key],
            row_to_source,
        )
        .optional()
        .context("Failed to query source by key")
    }

    /// Source key regardless of active flag; deliveries of already-ingested
    /// leads must not break because a source was retired.
    pub fn source_key_for(&self, source_id: i64) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT source_key FROM sources WHERE id = ?1",
            params![source_id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query source key")
    }

    /// Active sources bound to a hostname, longest `path_prefix` first.
    /// NULL prefixes sort last so an exact-prefix mapping beats a bare host.
    pub fn active_sources_by_hostname(&self, hostname: &str) -> Result<Vec<Source>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SOURCE_COLS} FROM sources
             WHERE hostname = ?1 AND active = 1
             ORDER BY LENGTH(COALESCE(path_prefix, '')) DESC, id ASC"
        ))?;
        let rows = stmt.query_map(params![hostname], row_to_source)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- buyers --------------------------------------------------------

    pub fn upsert_buyer(&self, b: &NewBuyer) -> Result<i64> {
        let conn = self.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM buyers WHERE name = ?1",
                params![b.name],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE buyers SET contact_email = ?2, contact_phone = ?3, active = ?4,
                            balance = ?5, credit_limit = ?6, webhook_url = ?7,
                            webhook_secret = ?8, notify_email = ?9, notify_sms = ?10
                     WHERE id = ?1",
                    params![
                        id,
                        b.contact_email,
                        b.contact_phone,
                        b.active,
                        b.balance,
                        b.credit_limit,
                        b.webhook_url,
                        b.webhook_secret,
                        b.notify_email,
                        b.notify_sms
                    ],
                )?;
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO buyers (name, contact_email, contact_phone, active, balance,
                            credit_limit, webhook_url, webhook_secret, notify_email, notify_sms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        b.name,
                        b.contact_email,
                        b.contact_phone,
                        b.active,
                        b.balance,
                        b.credit_limit,
                        b.webhook_url,
                        b.webhook_secret,
                        b.notify_email,
                        b.notify_sms
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    pub fn buyer_by_id(&self, id: i64) -> Result<Option<Buyer>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {BUYER_COLS} FROM buyers WHERE id = ?1"),
            params![id],
            row_to_buyer,
        )
        .optional()
        .context("Failed to query buyer")
    }

    /// Billing collaborator interface. The core itself never calls this.
    pub fn set_buyer_balance(&self, buyer_id: i64, balance: f64) -> Result<()> {
        anyhow::ensure!(balance >= 0.0, "buyer balance must stay non-negative");
        let conn = self.lock();
        conn.execute(
            "UPDATE buyers SET balance = ?2 WHERE id = ?1",
            params![buyer_id, balance],
        )?;
        Ok(())
    }

    pub fn upsert_buyer_offer(&self, bo: &NewBuyerOffer) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "INSERT INTO buyer_offers (buyer_id, offer_id, active, routing_priority,
                    capacity_per_day, capacity_per_hour, price, webhook_url, webhook_secret,
                    min_balance_required, pause_until)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(buyer_id, offer_id) DO UPDATE SET
                 active = ?3, routing_priority = ?4, capacity_per_day = ?5,
                 capacity_per_hour = ?6, price = ?7, webhook_url = ?8,
                 webhook_secret = ?9, min_balance_required = ?10, pause_until = ?11
             RETURNING id",
            params![
                bo.buyer_id,
                bo.offer_id,
                bo.active,
                bo.routing_priority,
                bo.capacity_per_day,
                bo.capacity_per_hour,
                bo.price,
                bo.webhook_url,
                bo.webhook_secret,
                bo.min_balance_required,
                bo.pause_until_ms
            ],
            |row| row.get(0),
        )
        .context("Failed to upsert buyer offer")
    }

    pub fn buyer_offer(&self, buyer_id: i64, offer_id: i64) -> Result<Option<BuyerOffer>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, buyer_id, offer_id, active, routing_priority, capacity_per_day,
                    capacity_per_hour, price, webhook_url, webhook_secret, notify_email,
                    notify_sms, min_balance_required, pause_until
             FROM buyer_offers WHERE buyer_id = ?1 AND offer_id = ?2",
            params![buyer_id, offer_id],
            |row| {
                Ok(BuyerOffer {
                    id: row.get(0)?,
                    buyer_id: row.get(1)?,
                    offer_id: row.get(2)?,
                    active: row.get(3)?,
                    routing_priority: row.get(4)?,
                    capacity_per_day: row.get(5)?,
                    capacity_per_hour: row.get(6)?,
                    price: row.get(7)?,
                    webhook_url: row.get(8)?,
                    webhook_secret: row.get(9)?,
                    notify_email: row.get(10)?,
                    notify_sms: row.get(11)?,
                    min_balance_required: row.get(12)?,
                    pause_until_ms: row.get(13)?,
                })
            },
        )
        .optional()
        .context("Failed to query buyer offer")
    }

    pub fn upsert_service_area(&self, a: &BuyerServiceArea) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "INSERT INTO buyer_service_areas (buyer_id, market_id, scope_type, scope_value, active)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(buyer_id, market_id, scope_type, scope_value) DO UPDATE SET active = ?5
             RETURNING id",
            params![
                a.buyer_id,
                a.market_id,
                a.scope_type.as_str(),
                a.scope_value,
                a.active
            ],
            |row| row.get(0),
        )
        .context("Failed to upsert service area")
    }

    /// At most one grant per (offer, scope); the unique index enforces it.
    pub fn grant_exclusivity(&self, g: &OfferExclusivity) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "INSERT INTO offer_exclusivity (offer_id, buyer_id, scope_type, scope_value, active)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(offer_id, scope_type, scope_value) DO UPDATE SET
                 buyer_id = ?2, active = ?5
             RETURNING id",
            params![
                g.offer_id,
                g.buyer_id,
                g.scope_type.as_str(),
                g.scope_value,
                g.active
            ],
            |row| row.get(0),
        )
        .context("Failed to grant exclusivity")
    }

    /// Find the exclusivity grant covering a lead's location, if any.
    /// A postal grant is more specific than a city grant and wins when both exist.
    pub fn exclusivity_for(
        &self,
        offer_id: i64,
        postal_code: &str,
        city: Option<&str>,
    ) -> Result<Option<OfferExclusivity>> {
        let conn = self.lock();
        let map = |row: &Row<'_>| -> rusqlite::Result<OfferExclusivity> {
            let scope: String = row.get(3)?;
            Ok(OfferExclusivity {
                id: row.get(0)?,
                offer_id: row.get(1)?,
                buyer_id: row.get(2)?,
                scope_type: ScopeType::from_str(&scope).unwrap_or(ScopeType::PostalCode),
                scope_value: row.get(4)?,
                active: row.get(5)?,
            })
        };

        let by_postal = conn
            .query_row(
                "SELECT id, offer_id, buyer_id, scope_type, scope_value, active
                 FROM offer_exclusivity
                 WHERE offer_id = ?1 AND scope_type = 'postal_code'
                   AND scope_value = ?2 AND active = 1",
                params![offer_id, postal_code],
                map,
            )
            .optional()?;
        if by_postal.is_some() {
            return Ok(by_postal);
        }

        let Some(city) = city else { return Ok(None) };
        conn.query_row(
            "SELECT id, offer_id, buyer_id, scope_type, scope_value, active
             FROM offer_exclusivity
             WHERE offer_id = ?1 AND scope_type = 'city'
               AND scope_value = ?2 COLLATE NOCASE AND active = 1",
            params![offer_id, city],
            map,
        )
        .optional()
        .context("Failed to query exclusivity")
    }
}
