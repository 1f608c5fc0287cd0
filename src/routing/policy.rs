//! Routing policy objects.
//!
//! Parsed once into tagged variants; unknown keys or values are rejected at
//! parse time so behavior stays reviewable as data.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Priority,
    Rotation,
    Weighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusivityBehavior {
    FailClosed,
    FallbackAllowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreaker {
    RoutingPriorityDesc,
    BuyerIdAsc,
    BuyerIdDesc,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawRoutingConfig {
    strategy: Option<String>,
    exclusivity_behavior: Option<String>,
    tie_breakers: Option<Vec<String>>,
    respect_capacity: Option<bool>,
    respect_pause: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub strategy: Strategy,
    pub exclusivity_behavior: ExclusivityBehavior,
    pub tie_breakers: Vec<TieBreaker>,
    pub respect_capacity: bool,
    pub respect_pause: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Priority,
            exclusivity_behavior: ExclusivityBehavior::FailClosed,
            tie_breakers: vec![TieBreaker::RoutingPriorityDesc, TieBreaker::BuyerIdAsc],
            respect_capacity: true,
            respect_pause: true,
        }
    }
}

pub fn parse_routing_config(json: &str) -> Result<RoutingConfig, String> {
    let raw: RawRoutingConfig =
        serde_json::from_str(json).map_err(|e| format!("invalid routing config: {}", e))?;

    let strategy = match raw.strategy.as_deref() {
        None | Some("priority") => Strategy::Priority,
        Some("rotation") => Strategy::Rotation,
        Some("weighted") => Strategy::Weighted,
        Some(other) => return Err(format!("unknown strategy: {}", other)),
    };

    let exclusivity_behavior = match raw.exclusivity_behavior.as_deref() {
        None | Some("fail_closed") => ExclusivityBehavior::FailClosed,
        Some("fallback_allowed") => ExclusivityBehavior::FallbackAllowed,
        Some(other) => return Err(format!("unknown exclusivity_behavior: {}", other)),
    };

    let tie_breakers = match raw.tie_breakers {
        None => vec![TieBreaker::RoutingPriorityDesc, TieBreaker::BuyerIdAsc],
        Some(names) => {
            let mut parsed = Vec::with_capacity(names.len());
            for name in &names {
                parsed.push(match name.as_str() {
                    "routing_priority_desc" => TieBreaker::RoutingPriorityDesc,
                    "buyer_id_asc" => TieBreaker::BuyerIdAsc,
                    "buyer_id_desc" => TieBreaker::BuyerIdDesc,
                    other => return Err(format!("unknown tie breaker: {}", other)),
                });
            }
            parsed
        }
    };

    Ok(RoutingConfig {
        strategy,
        exclusivity_behavior,
        tie_breakers,
        respect_capacity: raw.respect_capacity.unwrap_or(true),
        respect_pause: raw.respect_pause.unwrap_or(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = parse_routing_config("{}").unwrap();
        assert_eq!(cfg.strategy, Strategy::Priority);
        assert_eq!(cfg.exclusivity_behavior, ExclusivityBehavior::FailClosed);
        assert_eq!(
            cfg.tie_breakers,
            vec![TieBreaker::RoutingPriorityDesc, TieBreaker::BuyerIdAsc]
        );
        assert!(cfg.respect_capacity);
        assert!(cfg.respect_pause);
    }

    #[test]
    fn full_config() {
        let cfg = parse_routing_config(
            r#"{"strategy": "weighted", "exclusivity_behavior": "fallback_allowed",
                "tie_breakers": ["buyer_id_desc"], "respect_capacity": false,
                "respect_pause": false}"#,
        )
        .unwrap();
        assert_eq!(cfg.strategy, Strategy::Weighted);
        assert_eq!(cfg.exclusivity_behavior, ExclusivityBehavior::FallbackAllowed);
        assert_eq!(cfg.tie_breakers, vec![TieBreaker::BuyerIdDesc]);
        assert!(!cfg.respect_capacity);
        assert!(!cfg.respect_pause);
    }

    #[test]
    fn unknown_values_fail_loudly() {
        assert!(parse_routing_config(r#"{"strategy": "lottery"}"#).is_err());
        assert!(parse_routing_config(r#"{"tie_breakers": ["coin_flip"]}"#).is_err());
        assert!(parse_routing_config(r#"{"surprise_key": true}"#).is_err());
    }
}
