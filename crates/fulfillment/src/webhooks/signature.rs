//! Webhook authentication: payment provider signatures and shared tokens.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payment webhook, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: u64 = 300;

/// Why a webhook failed authentication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing signature")]
    Missing,
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies a `t=<unix>,v1=<hex>` signature header.
///
/// The signed payload is `"{t}.{body}"`. Any of several `v1` entries may
/// match (the provider sends more than one while rotating secrets).
pub fn verify_signature(
    header: &str,
    body: &[u8],
    secret: &str,
    now_unix: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if now_unix.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Expired);
    }

    let mac = signed_mac(secret, timestamp, body);
    let matched = candidates.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|expected| mac.clone().verify_slice(&expected).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Produces the header value the provider would send for `body`.
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let digest = signed_mac(secret, timestamp, body).finalize().into_bytes();
    format!("t={timestamp},v1={}", hex::encode(digest))
}

fn signed_mac(secret: &str, timestamp: i64, body: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac key of any length is valid"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Compares a presented token with the configured one in constant time.
///
/// An empty configured token never matches.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    if expected.is_empty() || presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"id":"evt_1"}"#;

    #[test]
    fn test_valid_signature() {
        let header = sign(SECRET, 1_700_000_000, BODY);
        assert_eq!(verify_signature(&header, BODY, SECRET, 1_700_000_010), Ok(()));
    }

    #[test]
    fn test_any_v1_may_match() {
        let good = sign(SECRET, 1_700_000_000, BODY);
        let v1 = good.split_once(",v1=").unwrap().1;
        let header = format!("t=1700000000,v1=deadbeef,v1={v1}");
        assert_eq!(verify_signature(&header, BODY, SECRET, 1_700_000_000), Ok(()));
    }

    #[test]
    fn test_tampered_body() {
        let header = sign(SECRET, 1_700_000_000, BODY);
        assert_eq!(
            verify_signature(&header, br#"{"id":"evt_2"}"#, SECRET, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret() {
        let header = sign("whsec_other", 1_700_000_000, BODY);
        assert_eq!(
            verify_signature(&header, BODY, SECRET, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_expired_timestamp() {
        let header = sign(SECRET, 1_700_000_000, BODY);
        assert_eq!(
            verify_signature(&header, BODY, SECRET, 1_700_000_301),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_extreme_timestamps_are_expired() {
        for t in [i64::MIN, i64::MAX] {
            let header = format!("t={t},v1=00");
            assert_eq!(
                verify_signature(&header, BODY, SECRET, 1_700_000_000),
                Err(SignatureError::Expired)
            );
        }
        let header = sign(SECRET, 0, BODY);
        assert_eq!(
            verify_signature(&header, BODY, SECRET, i64::MIN),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_malformed_header() {
        assert_eq!(
            verify_signature("garbage", BODY, SECRET, 0),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature("t=1700000000", BODY, SECRET, 1_700_000_000),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("abc123", "abc123"));
        assert!(!token_matches("abc124", "abc123"));
        assert!(!token_matches("abc", "abc123"));
        assert!(!token_matches("", ""));
    }
}
