//! Ingestion idempotency keys.
//!
//! A client-supplied key is validated and used as-is. Without one, a
//! deterministic key is derived from the submission's identifying fields so
//! retried posts of the same payload land on the same lead row.

use sha2::{Digest, Sha256};

use crate::ingest::IngestError;

/// `[A-Za-z0-9._:-]{16,128}` after trimming.
pub fn validate_client_key(raw: &str) -> Result<String, IngestError> {
    let key = raw.trim();
    let ok = (16..=128).contains(&key.len())
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
    if !ok {
        return Err(IngestError::InvalidIdempotencyKeyFormat);
    }
    Ok(key.to_string())
}

/// Fields participating in server-side derivation, already in submission
/// shape. Derivation needs email, phone and postal code to be present;
/// a payload too sparse to identify gets rejected instead of a weak key.
#[derive(Debug, Clone)]
pub struct DerivationInput<'a> {
    pub source_id: i64,
    pub name: &'a str,
    pub email: &'a str,
    pub phone: &'a str,
    pub country_code: &'a str,
    pub postal_code: &'a str,
    pub message: &'a str,
}

pub fn derive_key(input: &DerivationInput<'_>) -> Result<String, IngestError> {
    let email = input.email.trim().to_lowercase();
    let phone: String = input
        .phone
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let postal = input.postal_code.trim().to_uppercase();
    if email.is_empty() || phone.is_empty() || postal.is_empty() {
        return Err(IngestError::IdempotencyDerivationFailed);
    }

    let material = [
        input.source_id.to_string(),
        input.name.trim().to_string(),
        email,
        phone,
        input.country_code.trim().to_uppercase(),
        postal,
        input.message.trim().to_string(),
    ]
    .join("|");

    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>() -> DerivationInput<'a> {
        DerivationInput {
            source_id: 7,
            name: "Jane",
            email: "J@X.com",
            phone: "+1 512 555 0123",
            country_code: "us",
            postal_code: "78701",
            message: "call me",
        }
    }

    #[test]
    fn client_key_bounds() {
        assert!(validate_client_key("0123456789abcdef").is_ok());
        assert!(validate_client_key(&"k".repeat(128)).is_ok());
        assert!(validate_client_key("  0123456789abcdef  ").is_ok());

        assert!(validate_client_key("short").is_err());
        assert!(validate_client_key(&"k".repeat(129)).is_err());
        assert!(validate_client_key("0123456789abcde!").is_err());
        assert!(validate_client_key("").is_err());
    }

    #[test]
    fn derivation_is_stable_and_hex() {
        let key = derive_key(&input()).unwrap();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(derive_key(&input()).unwrap(), key);
    }

    #[test]
    fn derivation_canonicalizes_fields() {
        let mut other = input();
        other.email = "  j@x.COM ";
        other.country_code = "US";
        assert_eq!(derive_key(&input()).unwrap(), derive_key(&other).unwrap());

        // Different phone spacing still collapses to the same key.
        let mut spaced = input();
        spaced.phone = "+15125550123";
        assert_eq!(derive_key(&input()).unwrap(), derive_key(&spaced).unwrap());
    }

    #[test]
    fn derivation_distinguishes_sources() {
        let mut other = input();
        other.source_id = 8;
        assert_ne!(derive_key(&input()).unwrap(), derive_key(&other).unwrap());
    }

    #[test]
    fn derivation_requires_contact_fields() {
        for field in ["email", "phone", "postal"] {
            let mut sparse = input();
            match field {
                "email" => sparse.email = "  ",
                "phone" => sparse.phone = "",
                _ => sparse.postal_code = " ",
            }
            assert!(matches!(
                derive_key(&sparse),
                Err(IngestError::IdempotencyDerivationFailed)
            ));
        }
    }
}
