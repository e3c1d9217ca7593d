//! Time-based one-time passwords (RFC 6238)
//!
//! Bind passwords of users with an OTP secret carry a trailing 6 digit code.
//! Codes are HMAC-SHA1 over a 30 second counter, accepted one step either side
//! of the current one.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

/// Number of digits in a code
pub const DIGITS: usize = 6;
/// Counter step in seconds
pub const PERIOD: u64 = 30;
/// Steps accepted before and after the current one
pub const SKEW: u64 = 1;

/// Decode a base32 secret, ignoring case, whitespace and padding
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        return None;
    }
    BASE32_NOPAD.decode(normalized.as_bytes()).ok()
}

/// HOTP value for `counter`, zero padded to [`DIGITS`]
pub fn hotp(key: &[u8], counter: u64) -> String {
    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let code = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    format!("{:0width$}", code % 10u32.pow(DIGITS as u32), width = DIGITS)
}

/// TOTP value at a unix timestamp
pub fn totp_at(key: &[u8], unix_secs: u64) -> String {
    hotp(key, unix_secs / PERIOD)
}

/// Check `code` against a base32 `secret` at a unix timestamp
pub fn validate_at(code: &str, secret: &str, unix_secs: u64) -> bool {
    if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let key = match decode_secret(secret) {
        Some(key) => key,
        None => return false,
    };

    let current = unix_secs / PERIOD;
    let first = current.saturating_sub(SKEW);
    let last = current.saturating_add(SKEW);
    // Check every step so timing does not reveal which one matched
    let mut matched = false;
    for counter in first..=last {
        matched |= constant_time_eq(code.as_bytes(), hotp(&key, counter).as_bytes());
    }
    matched
}

/// Check `code` against a base32 `secret` at the current time
pub fn validate(code: &str, secret: &str) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    validate_at(code, secret, now)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B seed, base32 encoded
    const SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_decode_secret() {
        assert_eq!(decode_secret(SECRET).unwrap(), b"12345678901234567890");
        assert_eq!(
            decode_secret("gezd gnbv gy3t qojq gezd gnbv gy3t qojq").unwrap(),
            b"12345678901234567890"
        );
        assert!(decode_secret("").is_none());
        assert!(decode_secret("not base32!").is_none());
    }

    #[test]
    fn test_rfc6238_vectors() {
        let key = decode_secret(SECRET).unwrap();
        assert_eq!(totp_at(&key, 59), "287082");
        assert_eq!(totp_at(&key, 1111111109), "081804");
        assert_eq!(totp_at(&key, 1234567890), "005924");
        assert_eq!(totp_at(&key, 2000000000), "279037");
    }

    #[test]
    fn test_validate_accepts_one_step_skew() {
        assert!(validate_at("005924", SECRET, 1234567890));
        assert!(validate_at("005924", SECRET, 1234567890 + PERIOD));
        assert!(validate_at("005924", SECRET, 1234567890 - PERIOD));
        assert!(!validate_at("005924", SECRET, 1234567890 + 3 * PERIOD));
    }

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(!validate_at("00592", SECRET, 1234567890));
        assert!(!validate_at("00592a", SECRET, 1234567890));
        assert!(!validate_at("005924", "", 1234567890));
    }

    #[test]
    fn test_validate_current_time() {
        let key = decode_secret(SECRET).unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert!(validate(&totp_at(&key, now), SECRET));
    }
}
