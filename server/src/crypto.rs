//! Relay token and TURN credential helpers for Hearth Server
//!
//! Relay tokens have the form `<user_id>.<expires_at>.<hex hmac-sha256>` and
//! are only checked when a shared secret is configured.

use base64::Engine as _;
use chrono::Utc;
use ring::hmac;

fn token_payload(user_id: &str, expires_at: i64) -> String {
    format!("{}.{}", user_id, expires_at)
}

/// Issue a relay token valid for `ttl_hours`.
pub fn issue_token(user_id: &str, secret: &str, ttl_hours: u64) -> String {
    let expires_at = Utc::now().timestamp() + (ttl_hours * 3600) as i64;
    let payload = token_payload(user_id, expires_at);
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let signature = hmac::sign(&key, payload.as_bytes());
    format!("{}.{}", payload, hex::encode(signature.as_ref()))
}

/// Verify a relay token and return the user id it was issued for.
pub fn verify_token(token: &str, secret: &str) -> Option<String> {
    let mut parts = token.rsplitn(3, '.');
    let signature = hex::decode(parts.next()?).ok()?;
    let expires_at: i64 = parts.next()?.parse().ok()?;
    let user_id = parts.next()?;
    if user_id.is_empty() || expires_at < Utc::now().timestamp() {
        return None;
    }

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, token_payload(user_id, expires_at).as_bytes(), &signature).ok()?;
    Some(user_id.to_string())
}

/// Generate TURN credentials with time-limited validity
pub fn generate_turn_credentials(username: &str, secret: &str, ttl_seconds: u64) -> (String, String) {
    let timestamp = Utc::now().timestamp() as u64 + ttl_seconds;
    let turn_username = format!("{}:{}", timestamp, username);

    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret.as_bytes());
    let signature = hmac::sign(&key, turn_username.as_bytes());
    let turn_credential = base64::engine::general_purpose::STANDARD.encode(signature.as_ref());

    (turn_username, turn_credential)
}
