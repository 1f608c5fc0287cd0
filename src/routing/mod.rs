//! Buyer selection and the guarded `validated → routed` transition.
//!
//! The router computes an eligible set, honors exclusivity grants, applies
//! the policy's strategy, then attempts the conditional assignment. Losing
//! that UPDATE is the expected outcome for every racer but one.

pub mod policy;

use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::models::LeadStatus;
use crate::policy_cache::{PolicyCache, PolicyError};
use crate::routing::policy::{ExclusivityBehavior, RoutingConfig, Strategy, TieBreaker};
use crate::store::leads::RoutingCandidate;
use crate::store::Db;

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Routed { buyer_id: i64, price: Option<f64> },
    /// Another worker won the assignment race, or the lead moved on already.
    AlreadyRouted,
    NoRoute,
    NoRouteExclusiveFailClosed,
    /// The lead is not in `validated`; nothing to do here.
    NotRoutable(LeadStatus),
    PolicyMisconfigured(String),
}

pub fn route_lead(
    db: &Db,
    policies: &PolicyCache,
    lead_id: i64,
    now_ms: i64,
) -> Result<RouteOutcome> {
    let Some(lead) = db.lead(lead_id)? else {
        anyhow::bail!("lead {} not found", lead_id);
    };

    match lead.status {
        LeadStatus::Validated => {}
        LeadStatus::Routed | LeadStatus::Delivered | LeadStatus::Accepted => {
            db.record_lead_event(lead_id, "already_routed", lead.buyer_id, None, now_ms)?;
            return Ok(RouteOutcome::AlreadyRouted);
        }
        other => return Ok(RouteOutcome::NotRoutable(other)),
    }

    let Some(offer) = db.offer_by_id(lead.offer_id)? else {
        anyhow::bail!("offer {} not found for lead {}", lead.offer_id, lead_id);
    };

    let config = match offer.routing_policy_id {
        None => RoutingConfig::default(),
        Some(policy_id) => match policies.routing_config(db, policy_id) {
            Ok(cfg) => (*cfg).clone(),
            Err(PolicyError::Db(e)) => return Err(e),
            Err(PolicyError::NotFound) => {
                let detail = format!("routing policy {} missing or inactive", policy_id);
                db.record_lead_event(
                    lead_id,
                    "policy_misconfigured",
                    None,
                    Some(&detail),
                    now_ms,
                )?;
                return Ok(RouteOutcome::PolicyMisconfigured(detail));
            }
            Err(PolicyError::Misconfigured(detail)) => {
                warn!(lead_id, %detail, "routing policy failed to parse");
                db.record_lead_event(
                    lead_id,
                    "policy_misconfigured",
                    None,
                    Some(&detail),
                    now_ms,
                )?;
                return Ok(RouteOutcome::PolicyMisconfigured(detail));
            }
        },
    };

    let candidates =
        db.routing_candidates(lead.offer_id, lead.market_id, &lead.postal_code, lead.city.as_deref())?;

    let counts = if config.respect_capacity {
        let day_start = now_ms - now_ms.rem_euclid(86_400_000);
        let hour_start = now_ms - now_ms.rem_euclid(3_600_000);
        db.delivered_counts(lead.offer_id, day_start, hour_start)?
    } else {
        HashMap::new()
    };

    let mut eligible: Vec<RoutingCandidate> = candidates
        .into_iter()
        .filter(|c| {
            if config.respect_pause {
                if let Some(pause_until) = c.pause_until_ms {
                    if pause_until > now_ms {
                        return false;
                    }
                }
            }
            if let Some(min) = c.min_balance_required {
                if c.balance < min {
                    return false;
                }
            }
            if config.respect_capacity {
                let (day, hour) = counts.get(&c.buyer_id).copied().unwrap_or((0, 0));
                if let Some(cap) = c.capacity_per_day {
                    if day >= cap {
                        return false;
                    }
                }
                if let Some(cap) = c.capacity_per_hour {
                    if hour >= cap {
                        return false;
                    }
                }
            }
            true
        })
        .collect();

    if let Some(grant) = db.exclusivity_for(lead.offer_id, &lead.postal_code, lead.city.as_deref())? {
        if let Some(winner) = eligible.iter().find(|c| c.buyer_id == grant.buyer_id) {
            eligible = vec![winner.clone()];
        } else if config.exclusivity_behavior == ExclusivityBehavior::FailClosed {
            db.record_lead_event(
                lead_id,
                "no_route_exclusive_fail_closed",
                Some(grant.buyer_id),
                None,
                now_ms,
            )?;
            return Ok(RouteOutcome::NoRouteExclusiveFailClosed);
        }
        // fallback_allowed: the full eligible set stays in play.
    }

    if eligible.is_empty() {
        db.record_lead_event(lead_id, "no_route", None, None, now_ms)?;
        return Ok(RouteOutcome::NoRoute);
    }

    let winner = match config.strategy {
        Strategy::Priority => select_priority(&mut eligible, &config.tie_breakers),
        Strategy::Rotation => {
            let recency = db.last_delivered_ms(lead.offer_id)?;
            select_rotation(&mut eligible, &config.tie_breakers, &recency)
        }
        Strategy::Weighted => select_weighted(&mut eligible, lead_id),
    };

    let price = db
        .buyer_offer(winner, lead.offer_id)?
        .and_then(|bo| bo.price)
        .or(offer.default_price);

    if db.assign_buyer(lead_id, winner, price, now_ms)? {
        db.enqueue_delivery(lead_id, 0, now_ms)?;
        db.record_lead_event(lead_id, "routed", Some(winner), None, now_ms)?;
        debug!(lead_id, buyer_id = winner, "lead routed");
        Ok(RouteOutcome::Routed {
            buyer_id: winner,
            price,
        })
    } else {
        db.record_lead_event(lead_id, "already_routed", None, None, now_ms)?;
        Ok(RouteOutcome::AlreadyRouted)
    }
}

fn tie_break(a: &RoutingCandidate, b: &RoutingCandidate, breakers: &[TieBreaker]) -> Ordering {
    for tb in breakers {
        let ord = match tb {
            TieBreaker::RoutingPriorityDesc => b.routing_priority.cmp(&a.routing_priority),
            TieBreaker::BuyerIdAsc => a.buyer_id.cmp(&b.buyer_id),
            TieBreaker::BuyerIdDesc => b.buyer_id.cmp(&a.buyer_id),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    // Last-resort determinism regardless of configured breakers.
    a.buyer_id.cmp(&b.buyer_id)
}

fn select_priority(eligible: &mut [RoutingCandidate], breakers: &[TieBreaker]) -> i64 {
    eligible.sort_by(|a, b| {
        b.routing_priority
            .cmp(&a.routing_priority)
            .then_with(|| tie_break(a, b, breakers))
    });
    eligible[0].buyer_id
}

/// Within the top priority tier, least-recently-delivered first. Buyers with
/// no delivery yet sort ahead of everyone.
fn select_rotation(
    eligible: &mut [RoutingCandidate],
    breakers: &[TieBreaker],
    recency: &HashMap<i64, i64>,
) -> i64 {
    let top = eligible
        .iter()
        .map(|c| c.routing_priority)
        .max()
        .unwrap_or(1);
    let mut tier: Vec<&RoutingCandidate> = eligible
        .iter()
        .filter(|c| c.routing_priority == top)
        .collect();
    tier.sort_by(|a, b| {
        let ra = recency.get(&a.buyer_id);
        let rb = recency.get(&b.buyer_id);
        match (ra, rb) {
            (None, None) => tie_break(a, b, breakers),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(ta), Some(tb)) => ta.cmp(tb).then_with(|| tie_break(a, b, breakers)),
        }
    });
    tier[0].buyer_id
}

/// Priority acts as a weight. The RNG is seeded with the lead id, so
/// replaying the same lead always lands on the same buyer.
fn select_weighted(eligible: &mut [RoutingCandidate], lead_id: i64) -> i64 {
    eligible.sort_by_key(|c| c.buyer_id);
    let total: i64 = eligible.iter().map(|c| c.routing_priority.max(1)).sum();
    let mut rng = ChaCha8Rng::seed_from_u64(lead_id as u64);
    let mut pick = rng.gen_range(0..total);
    for c in eligible.iter() {
        pick -= c.routing_priority.max(1);
        if pick < 0 {
            return c.buyer_id;
        }
    }
    eligible[eligible.len() - 1].buyer_id
}
