//! Bearer-token authentication for the WebSocket upgrade.
//!
//! A token is `base64( ts || HMAC-SHA256(key, client_id || ts) )` where
//! `ts` is the unix time in seconds as 8 big-endian bytes. The key is the
//! per-session material handed out at Join/Watch time.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between client and server.
const VALID_WINDOW_SECS: i64 = 300;

const TS_LEN: usize = 8;
const MAC_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed auth data")]
    Malformed,
    #[error("auth data expired or from the future")]
    Expired,
    #[error("auth data verification failed")]
    Verification,
}

pub fn generate_auth_data(key: &str, client_id: &str) -> String {
    generate_auth_data_at(key, client_id, Utc::now().timestamp())
}

fn generate_auth_data_at(key: &str, client_id: &str, ts: i64) -> String {
    let ts_bytes = ts.to_be_bytes();
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(client_id.as_bytes());
    mac.update(&ts_bytes);

    let mut raw = Vec::with_capacity(TS_LEN + MAC_LEN);
    raw.extend_from_slice(&ts_bytes);
    raw.extend_from_slice(&mac.finalize().into_bytes());
    BASE64.encode(raw)
}

/// Verifies a bearer token. The MAC comparison is constant-time.
pub fn valid_auth_data(key: &str, client_id: &str, bearer: &str) -> Result<(), AuthError> {
    let raw = BASE64.decode(bearer).map_err(|_| AuthError::Malformed)?;
    if raw.len() != TS_LEN + MAC_LEN {
        return Err(AuthError::Malformed);
    }

    let mut ts_bytes = [0u8; TS_LEN];
    ts_bytes.copy_from_slice(&raw[..TS_LEN]);
    let ts = i64::from_be_bytes(ts_bytes);
    if (Utc::now().timestamp() - ts).abs() > VALID_WINDOW_SECS {
        return Err(AuthError::Expired);
    }

    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| AuthError::Verification)?;
    mac.update(client_id.as_bytes());
    mac.update(&ts_bytes);
    mac.verify_slice(&raw[TS_LEN..])
        .map_err(|_| AuthError::Verification)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_verifies() {
        let token = generate_auth_data("secret", "user-1");
        assert!(valid_auth_data("secret", "user-1", &token).is_ok());
    }

    #[test]
    fn wrong_key_fails() {
        let token = generate_auth_data("secret", "user-1");
        assert!(matches!(
            valid_auth_data("other", "user-1", &token),
            Err(AuthError::Verification)
        ));
    }

    #[test]
    fn wrong_user_fails() {
        let token = generate_auth_data("secret", "user-1");
        assert!(matches!(
            valid_auth_data("secret", "user-2", &token),
            Err(AuthError::Verification)
        ));
    }

    #[test]
    fn stale_timestamp_fails() {
        let token = generate_auth_data_at("secret", "user-1", Utc::now().timestamp() - 3600);
        assert!(matches!(
            valid_auth_data("secret", "user-1", &token),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            valid_auth_data("secret", "user-1", "not-base64!!"),
            Err(AuthError::Malformed)
        ));
        assert!(matches!(
            valid_auth_data("secret", "user-1", &BASE64.encode(b"short")),
            Err(AuthError::Malformed)
        ));
    }

    #[test]
    fn tampered_timestamp_fails_verification() {
        let token = generate_auth_data("secret", "user-1");
        let mut raw = BASE64.decode(token).unwrap();
        raw[7] ^= 1;
        let tampered = BASE64.encode(raw);
        assert!(valid_auth_data("secret", "user-1", &tampered).is_err());
    }
}
