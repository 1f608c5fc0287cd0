//! Policy-driven field validation.
//!
//! Rules arrive as JSON on the offer's validation policy and are parsed into
//! a typed object up front. Parsing is fail-closed: a policy that does not
//! deserialize cleanly (unknown keys included) halts the lead with
//! `policy_misconfigured` instead of guessing.

use serde::Deserialize;

use crate::ingest::dedupe::{DedupeConfig, RawDuplicatePolicy};
use crate::models::Lead;

/// Field names `required_fields` may reference.
const KNOWN_FIELDS: &[&str] = &[
    "name",
    "email",
    "phone",
    "postal_code",
    "country_code",
    "city",
    "region_code",
    "message",
];

/// Domains serving throwaway inboxes. Checked only when the policy opts in.
const DISPOSABLE_EMAIL_DOMAINS: &[&str] = &[
    "10minutemail.com",
    "dispostable.com",
    "fakeinbox.com",
    "getnada.com",
    "guerrillamail.com",
    "guerrillamail.net",
    "mailinator.com",
    "maildrop.cc",
    "mintemail.com",
    "mytemp.email",
    "sharklasers.com",
    "spamgourmet.com",
    "tempmail.com",
    "temp-mail.org",
    "throwawaymail.com",
    "trashmail.com",
    "yopmail.com",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RawValidationRules {
    pub required_fields: Option<Vec<String>>,
    pub allowed_postal_codes: Option<Vec<String>>,
    pub allowed_cities: Option<Vec<String>>,
    pub phone_region: Option<String>,
    pub allowed_country_codes: Option<Vec<String>>,
    pub disposable_email_blocklist_enabled: bool,
    pub duplicate_detection: Option<RawDuplicatePolicy>,
}

/// Parsed, validated policy ready to evaluate.
#[derive(Debug, Clone, Default)]
pub struct ValidationRules {
    pub required_fields: Vec<String>,
    pub allowed_postal_codes: Vec<String>,
    pub allowed_cities: Vec<String>,
    pub allowed_country_codes: Vec<String>,
    pub disposable_email_blocklist_enabled: bool,
    pub dedupe: Option<DedupeConfig>,
}

/// Parse policy JSON. The error string is the misconfiguration detail; the
/// caller surfaces it as `policy_misconfigured` and leaves the lead alone.
pub fn parse_validation_rules(json: &str) -> Result<ValidationRules, String> {
    let raw: RawValidationRules =
        serde_json::from_str(json).map_err(|e| format!("invalid validation rules: {}", e))?;

    let required_fields = raw.required_fields.unwrap_or_default();
    for field in &required_fields {
        if !KNOWN_FIELDS.contains(&field.as_str()) {
            return Err(format!("unknown required field: {}", field));
        }
    }

    // phone_region is the single-country spelling of allowed_country_codes.
    let mut allowed_country_codes: Vec<String> = raw
        .allowed_country_codes
        .unwrap_or_default()
        .into_iter()
        .map(|c| c.trim().to_uppercase())
        .collect();
    if let Some(region) = raw.phone_region {
        let region = region.trim().to_uppercase();
        if !region.is_empty() && !allowed_country_codes.contains(&region) {
            allowed_country_codes.push(region);
        }
    }

    let dedupe = match raw.duplicate_detection {
        Some(raw_policy) => DedupeConfig::from_raw(raw_policy)?,
        None => None,
    };

    Ok(ValidationRules {
        required_fields,
        allowed_postal_codes: raw
            .allowed_postal_codes
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.trim().to_uppercase())
            .collect(),
        allowed_cities: raw
            .allowed_cities
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.trim().to_lowercase())
            .collect(),
        allowed_country_codes,
        disposable_email_blocklist_enabled: raw.disposable_email_blocklist_enabled,
        dedupe,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Reject(String),
}

/// Evaluate the rules against a lead row. Pure; the caller owns the guarded
/// transition that makes the verdict stick.
pub fn evaluate(rules: &ValidationRules, lead: &Lead) -> Verdict {
    for field in &rules.required_fields {
        if field_value(lead, field).map_or(true, |v| v.trim().is_empty()) {
            return Verdict::Reject(format!("missing_required_field:{}", field));
        }
    }

    if !rules.allowed_postal_codes.is_empty() {
        let postal = lead.postal_code.trim().to_uppercase();
        if !rules.allowed_postal_codes.contains(&postal) {
            return Verdict::Reject("postal_not_allowed".to_string());
        }
    }

    if !rules.allowed_cities.is_empty() {
        let city = lead
            .city
            .as_deref()
            .map(|c| c.trim().to_lowercase())
            .unwrap_or_default();
        if !rules.allowed_cities.contains(&city) {
            return Verdict::Reject("city_not_allowed".to_string());
        }
    }

    if !rules.allowed_country_codes.is_empty() {
        let country = lead.country_code.trim().to_uppercase();
        if !rules.allowed_country_codes.contains(&country) {
            return Verdict::Reject("country_not_allowed".to_string());
        }
    }

    if rules.disposable_email_blocklist_enabled {
        if let Some(domain) = lead
            .normalized_email
            .as_deref()
            .and_then(|e| e.split_once('@'))
            .map(|(_, d)| d)
        {
            if DISPOSABLE_EMAIL_DOMAINS.contains(&domain) {
                return Verdict::Reject("disposable_email".to_string());
            }
        }
    }

    Verdict::Pass
}

fn field_value<'a>(lead: &'a Lead, field: &str) -> Option<&'a str> {
    match field {
        "name" => Some(lead.name.as_str()),
        "email" => Some(lead.email.as_str()),
        "phone" => Some(lead.phone.as_str()),
        "postal_code" => Some(lead.postal_code.as_str()),
        "country_code" => Some(lead.country_code.as_str()),
        "city" => lead.city.as_deref(),
        "region_code" => lead.region_code.as_deref(),
        "message" => lead.message.as_deref(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingStatus, LeadStatus};

    fn lead() -> Lead {
        Lead {
            id: 1,
            source_id: 1,
            offer_id: 1,
            market_id: 1,
            vertical_id: 1,
            idempotency_key: "key-0123456789abcdef".into(),
            name: "Jane".into(),
            email: "j@x.com".into(),
            phone: "+15125550123".into(),
            postal_code: "78701".into(),
            country_code: "US".into(),
            city: Some("Austin".into()),
            region_code: None,
            message: None,
            utm_source: None,
            utm_medium: None,
            utm_campaign: None,
            consent: None,
            gdpr_consent: None,
            normalized_email: Some("j@x.com".into()),
            normalized_phone: Some("+15125550123".into()),
            status: LeadStatus::Received,
            billing_status: BillingStatus::Pending,
            buyer_id: None,
            price: None,
            is_duplicate: false,
            duplicate_of: None,
            validation_reason: None,
            rejection_reason: None,
            created_at_ms: 1_000,
            routed_at_ms: None,
            delivered_at_ms: None,
            accepted_at_ms: None,
            rejected_at_ms: None,
        }
    }

    #[test]
    fn empty_policy_passes_everything() {
        let rules = parse_validation_rules("{}").unwrap();
        assert_eq!(evaluate(&rules, &lead()), Verdict::Pass);
    }

    #[test]
    fn unknown_policy_key_fails_closed() {
        assert!(parse_validation_rules(r#"{"requird_fields": ["name"]}"#).is_err());
        assert!(parse_validation_rules("not json").is_err());
    }

    #[test]
    fn unknown_required_field_fails_closed() {
        assert!(parse_validation_rules(r#"{"required_fields": ["shoe_size"]}"#).is_err());
    }

    #[test]
    fn required_field_missing() {
        let rules = parse_validation_rules(r#"{"required_fields": ["name", "message"]}"#).unwrap();
        let verdict = evaluate(&rules, &lead());
        assert_eq!(
            verdict,
            Verdict::Reject("missing_required_field:message".to_string())
        );
    }

    #[test]
    fn postal_allowlist() {
        let rules =
            parse_validation_rules(r#"{"allowed_postal_codes": ["78701", "78702"]}"#).unwrap();
        assert_eq!(evaluate(&rules, &lead()), Verdict::Pass);

        let mut wrong = lead();
        wrong.postal_code = "10001".into();
        assert_eq!(
            evaluate(&rules, &wrong),
            Verdict::Reject("postal_not_allowed".to_string())
        );
    }

    #[test]
    fn city_allowlist_is_case_insensitive() {
        let rules = parse_validation_rules(r#"{"allowed_cities": ["AUSTIN"]}"#).unwrap();
        assert_eq!(evaluate(&rules, &lead()), Verdict::Pass);

        let mut wrong = lead();
        wrong.city = Some("Dallas".into());
        assert_eq!(
            evaluate(&rules, &wrong),
            Verdict::Reject("city_not_allowed".to_string())
        );
    }

    #[test]
    fn phone_region_joins_country_allowlist() {
        let rules = parse_validation_rules(r#"{"phone_region": "us"}"#).unwrap();
        assert_eq!(evaluate(&rules, &lead()), Verdict::Pass);

        let mut wrong = lead();
        wrong.country_code = "DE".into();
        assert_eq!(
            evaluate(&rules, &wrong),
            Verdict::Reject("country_not_allowed".to_string())
        );
    }

    #[test]
    fn disposable_email_blocklist() {
        let rules =
            parse_validation_rules(r#"{"disposable_email_blocklist_enabled": true}"#).unwrap();
        assert_eq!(evaluate(&rules, &lead()), Verdict::Pass);

        let mut throwaway = lead();
        throwaway.normalized_email = Some("x@mailinator.com".into());
        assert_eq!(
            evaluate(&rules, &throwaway),
            Verdict::Reject("disposable_email".to_string())
        );
    }
}
