use crate::error::ValidationError;
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;

/// Centralized validation and normalization of the keys the engine tracks.
///
/// Every store keys its state by a normalized string, so the same identifier,
/// IP or rate key always lands on the same entry regardless of how a caller
/// spelled it.
const MAX_IDENTIFIER_LEN: usize = 254;
const MAX_KEY_LEN: usize = 256;
const MAX_ACTOR_LEN: usize = 128;

/// Rate limit keys are printable, whitespace-free tokens such as `ip:10.0.0.1`
/// or `actor:usr_abc`.
static RATE_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._:@+/\-\[\]%]+$").expect("Invalid rate key regex pattern")
});

/// Normalizes a login identifier (email, username or IP) by trimming and lower-casing.
///
/// # Examples
///
/// ```rust
/// use rampart_core::validation::normalize_identifier;
///
/// assert_eq!(normalize_identifier("  A@X.com ").unwrap(), "a@x.com");
/// assert!(normalize_identifier("   ").is_err());
/// ```
pub fn normalize_identifier(identifier: &str) -> Result<String, ValidationError> {
    let trimmed = identifier.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::MissingField(
            "Identifier is required".to_string(),
        ));
    }

    if trimmed.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::InvalidIdentifier(
            "Identifier is too long".to_string(),
        ));
    }

    if trimmed.chars().any(char::is_control) {
        return Err(ValidationError::InvalidIdentifier(
            "Identifier contains control characters".to_string(),
        ));
    }

    Ok(trimmed.to_lowercase())
}

/// Parses and canonicalizes an IP address.
///
/// IPv4-mapped IPv6 addresses are folded to their IPv4 form so that
/// `::ffff:1.2.3.4` and `1.2.3.4` share one reputation entry.
pub fn normalize_ip(ip: &str) -> Result<String, ValidationError> {
    let trimmed = ip.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::MissingField(
            "IP address is required".to_string(),
        ));
    }

    let parsed: IpAddr = trimmed
        .parse()
        .map_err(|_| ValidationError::InvalidIp(trimmed.to_string()))?;

    let canonical = match parsed {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };

    Ok(canonical.to_string())
}

/// Best-effort canonical form used for lookups: valid addresses are
/// canonicalized, anything else is passed through trimmed.
pub fn lookup_ip(ip: &str) -> String {
    normalize_ip(ip).unwrap_or_else(|_| ip.trim().to_string())
}

pub fn validate_rate_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::MissingField(
            "Rate limit key is required".to_string(),
        ));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(ValidationError::InvalidKey("Key is too long".to_string()));
    }

    if RATE_KEY_REGEX.is_match(key) {
        Ok(())
    } else {
        Err(ValidationError::InvalidKey(format!(
            "Invalid rate limit key: {key}"
        )))
    }
}

/// Extracts the IP a rate limit key refers to, if any.
///
/// Keys of the form `ip:<addr>` and bare addresses resolve; anything else
/// (e.g. `actor:usr_1`) does not.
pub fn ip_from_rate_key(key: &str) -> Option<String> {
    let candidate = key.strip_prefix("ip:").unwrap_or(key);
    normalize_ip(candidate).ok()
}

pub fn validate_actor_id(actor_id: &str) -> Result<(), ValidationError> {
    let trimmed = actor_id.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::MissingField(
            "Actor ID is required".to_string(),
        ));
    }

    if trimmed.len() > MAX_ACTOR_LEN {
        return Err(ValidationError::InvalidIdentifier(
            "Actor ID is too long".to_string(),
        ));
    }

    Ok(())
}
