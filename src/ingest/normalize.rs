//! Contact-field canonicalizers.
//!
//! The same functions feed ingest-time hashing and duplicate detection, so a
//! lead always matches itself no matter which path computed the key.

/// Trim + lowercase, then require a minimal `local@domain.tld` shape.
/// Anything else normalizes to None rather than a guess.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() || email.chars().any(char::is_whitespace) {
        return None;
    }
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    // Domain needs an interior dot: "x@y" and "x@y." are not deliverable.
    let (host, tld) = domain.rsplit_once('.')?;
    if host.is_empty() || tld.is_empty() {
        return None;
    }
    Some(email)
}

/// E.164-looking values pass through untouched; everything else keeps its
/// digits only. Fewer than 7 digits is not a phone number.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if is_e164(trimmed) {
        return Some(trimmed.to_string());
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return None;
    }
    Some(digits)
}

fn is_e164(s: &str) -> bool {
    let Some(rest) = s.strip_prefix('+') else {
        return false;
    };
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if ('1'..='9').contains(&c) => {}
        _ => return false,
    }
    let tail: Vec<char> = chars.collect();
    (7..=15).contains(&tail.len()) && tail.iter().all(|c| c.is_ascii_digit())
}

pub fn normalize_postal(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_canonical_form() {
        assert_eq!(
            normalize_email("  Jane.Doe@Example.COM "),
            Some("jane.doe@example.com".to_string())
        );
        assert_eq!(normalize_email("j@x.com"), Some("j@x.com".to_string()));
    }

    #[test]
    fn email_rejects_malformed() {
        for bad in [
            "",
            "   ",
            "plainaddress",
            "no domain@x.com",
            "@x.com",
            "x@",
            "x@y",
            "x@.com",
            "x@y.",
            "a@b@c.com",
        ] {
            assert_eq!(normalize_email(bad), None, "expected None for {:?}", bad);
        }
    }

    #[test]
    fn phone_keeps_e164() {
        assert_eq!(
            normalize_phone("+15125550123"),
            Some("+15125550123".to_string())
        );
    }

    #[test]
    fn phone_strips_formatting() {
        assert_eq!(
            normalize_phone("(512) 555-0123"),
            Some("5125550123".to_string())
        );
        assert_eq!(normalize_phone(" 512.555.0123 "), Some("5125550123".to_string()));
    }

    #[test]
    fn phone_too_short_is_none() {
        assert_eq!(normalize_phone("555-0"), None);
        assert_eq!(normalize_phone("+1555"), None);
        assert_eq!(normalize_phone(""), None);
    }

    #[test]
    fn e164_bounds() {
        // 16 digits total is the ceiling.
        assert_eq!(
            normalize_phone("+1234567890123456"),
            Some("+1234567890123456".to_string())
        );
        // One more digit falls back to digit-stripping.
        assert_eq!(
            normalize_phone("+12345678901234567"),
            Some("12345678901234567".to_string())
        );
        // Leading zero country code is not E.164.
        assert_eq!(normalize_phone("+0123456789"), Some("0123456789".to_string()));
    }

    #[test]
    fn postal_uppercases() {
        assert_eq!(normalize_postal("  78701 "), "78701");
        assert_eq!(normalize_postal("sw1a 1aa"), "SW1A 1AA");
    }
}
