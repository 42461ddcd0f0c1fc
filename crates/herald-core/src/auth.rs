//! Request signatures.
//!
//! Private and presence subscriptions, user sign-in and REST calls are all
//! authorized with a hex HMAC-SHA256 of a well-known string, keyed with the
//! app secret.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::app::App;

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew accepted on REST requests, in seconds.
pub const MAX_TIMESTAMP_SKEW: u64 = 600;

/// Signature errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No signature was supplied.
    #[error("Missing auth signature")]
    MissingSignature,

    /// The signature is not of the form `key:signature`.
    #[error("Malformed auth signature")]
    Malformed,

    /// The signature was produced for another app.
    #[error("Auth key does not match the application")]
    KeyMismatch,

    /// The signature does not match.
    #[error("Invalid signature")]
    InvalidSignature,

    /// A required REST parameter is missing.
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    /// The REST request timestamp is too far from now.
    #[error("Timestamp expired")]
    Expired,

    /// The body does not match `body_md5`.
    #[error("Body checksum mismatch")]
    BodyMismatch,
}

fn mac(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length")
}

/// Sign a string with a secret, returning the lowercase hex digest.
#[must_use]
pub fn sign(secret: &str, string_to_sign: &str) -> String {
    let mut mac = mac(secret);
    mac.update(string_to_sign.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature in constant time.
#[must_use]
pub fn verify(secret: &str, string_to_sign: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac = mac(secret);
    mac.update(string_to_sign.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// The string signed for a channel subscription.
///
/// `channel_data` is only part of the string for presence channels.
#[must_use]
pub fn channel_string_to_sign(socket_id: &str, channel: &str, channel_data: Option<&str>) -> String {
    match channel_data {
        Some(data) => format!("{socket_id}:{channel}:{data}"),
        None => format!("{socket_id}:{channel}"),
    }
}

/// The string signed for a user sign-in.
#[must_use]
pub fn user_string_to_sign(socket_id: &str, user_data: &str) -> String {
    format!("{socket_id}::user::{user_data}")
}

/// Produce a `key:signature` token for a channel subscription.
///
/// This is what an application backend hands to its clients.
#[must_use]
pub fn sign_channel(app: &App, socket_id: &str, channel: &str, channel_data: Option<&str>) -> String {
    let signature = sign(&app.secret, &channel_string_to_sign(socket_id, channel, channel_data));
    format!("{}:{signature}", app.key)
}

/// Produce a `key:signature` token for a user sign-in.
#[must_use]
pub fn sign_user(app: &App, socket_id: &str, user_data: &str) -> String {
    let signature = sign(&app.secret, &user_string_to_sign(socket_id, user_data));
    format!("{}:{signature}", app.key)
}

/// Check a `key:signature` token against a string.
fn verify_token(app: &App, string_to_sign: &str, token: Option<&str>) -> Result<(), AuthError> {
    let token = token.ok_or(AuthError::MissingSignature)?;
    let (key, signature) = token.split_once(':').ok_or(AuthError::Malformed)?;
    if key != app.key {
        return Err(AuthError::KeyMismatch);
    }
    if !verify(&app.secret, string_to_sign, signature) {
        return Err(AuthError::InvalidSignature);
    }
    Ok(())
}

/// Verify a private or presence subscription.
///
/// # Errors
///
/// Returns an error if the token is missing, malformed or does not match.
pub fn verify_channel_auth(
    app: &App,
    socket_id: &str,
    channel: &str,
    channel_data: Option<&str>,
    auth: Option<&str>,
) -> Result<(), AuthError> {
    verify_token(app, &channel_string_to_sign(socket_id, channel, channel_data), auth)
}

/// Verify a user sign-in.
///
/// # Errors
///
/// Returns an error if the token is malformed or does not match.
pub fn verify_user_auth(
    app: &App,
    socket_id: &str,
    user_data: &str,
    auth: &str,
) -> Result<(), AuthError> {
    verify_token(app, &user_string_to_sign(socket_id, user_data), Some(auth))
}

/// The string signed for a REST request.
///
/// Parameter names are lowercased and sorted; `auth_signature` is left out.
#[must_use]
pub fn api_string_to_sign(method: &str, path: &str, params: &BTreeMap<String, String>) -> String {
    let sorted: BTreeMap<String, &str> = params
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .filter(|(k, _)| k != "auth_signature")
        .collect();
    let query = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}\n{path}\n{query}", method.to_ascii_uppercase())
}

/// Hex MD5 of a request body, as sent in `body_md5`.
#[must_use]
pub fn body_md5(body: &[u8]) -> String {
    hex::encode(Md5::digest(body))
}

/// Sign a REST request, returning the parameters to send with it.
#[must_use]
pub fn sign_api_request(
    app: &App,
    method: &str,
    path: &str,
    body: &[u8],
    timestamp: u64,
) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("auth_key".to_string(), app.key.clone());
    params.insert("auth_timestamp".to_string(), timestamp.to_string());
    params.insert("auth_version".to_string(), "1.0".to_string());
    if !body.is_empty() {
        params.insert("body_md5".to_string(), body_md5(body));
    }
    let signature = sign(&app.secret, &api_string_to_sign(method, path, &params));
    params.insert("auth_signature".to_string(), signature);
    params
}

/// Verify a signed REST request.
///
/// # Errors
///
/// Returns an error if a parameter is missing, the timestamp is stale, the
/// body checksum differs or the signature does not match.
pub fn verify_api_request(
    app: &App,
    method: &str,
    path: &str,
    params: &BTreeMap<String, String>,
    body: &[u8],
    now_secs: u64,
) -> Result<(), AuthError> {
    let key = params
        .get("auth_key")
        .ok_or(AuthError::MissingParameter("auth_key"))?;
    if *key != app.key {
        return Err(AuthError::KeyMismatch);
    }

    let timestamp: u64 = params
        .get("auth_timestamp")
        .ok_or(AuthError::MissingParameter("auth_timestamp"))?
        .parse()
        .map_err(|_| AuthError::Expired)?;
    if now_secs.abs_diff(timestamp) > MAX_TIMESTAMP_SKEW {
        return Err(AuthError::Expired);
    }

    if !body.is_empty() {
        let expected = params
            .get("body_md5")
            .ok_or(AuthError::MissingParameter("body_md5"))?;
        if !expected.eq_ignore_ascii_case(&body_md5(body)) {
            return Err(AuthError::BodyMismatch);
        }
    }

    let signature = params
        .get("auth_signature")
        .ok_or(AuthError::MissingParameter("auth_signature"))?;
    if !verify(&app.secret, &api_string_to_sign(method, path, params), signature) {
        return Err(AuthError::InvalidSignature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> App {
        App::new("1234", "TestKey", "TestSecret")
    }

    #[test]
    fn test_sign_matches_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        assert_eq!(
            sign("key", "The quick brown fox jumps over the lazy dog"),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_verify() {
        let signature = sign("secret", "1234.1234:private-channel");
        assert!(verify("secret", "1234.1234:private-channel", &signature));
        assert!(!verify("other", "1234.1234:private-channel", &signature));
        assert!(!verify("secret", "1234.1234:private-channel", "not-hex"));
    }

    #[test]
    fn test_channel_auth() {
        let app = app();
        let token = sign_channel(&app, "1.1", "private-channel", None);
        assert!(token.starts_with("TestKey:"));
        assert!(verify_channel_auth(&app, "1.1", "private-channel", None, Some(&token)).is_ok());

        // Bound to the socket.
        assert_eq!(
            verify_channel_auth(&app, "2.2", "private-channel", None, Some(&token)),
            Err(AuthError::InvalidSignature)
        );
        assert_eq!(
            verify_channel_auth(&app, "1.1", "private-channel", None, None),
            Err(AuthError::MissingSignature)
        );
        assert_eq!(
            verify_channel_auth(&app, "1.1", "private-channel", None, Some("nocolon")),
            Err(AuthError::Malformed)
        );
    }

    #[test]
    fn test_channel_auth_wrong_secret() {
        let app = app();
        let forged = App::new("1234", "TestKey", "InvalidSecret");
        let token = sign_channel(&forged, "1.1", "private-x", None);
        assert_eq!(
            verify_channel_auth(&app, "1.1", "private-x", None, Some(&token)),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_presence_auth_covers_channel_data() {
        let app = app();
        let data = r#"{"user_id":1,"user_info":{"name":"Rick"}}"#;
        let token = sign_channel(&app, "1.1", "presence-channel", Some(data));
        assert!(verify_channel_auth(&app, "1.1", "presence-channel", Some(data), Some(&token)).is_ok());

        let tampered = r#"{"user_id":2,"user_info":{"name":"Rick"}}"#;
        assert!(
            verify_channel_auth(&app, "1.1", "presence-channel", Some(tampered), Some(&token))
                .is_err()
        );
    }

    #[test]
    fn test_user_auth() {
        let app = app();
        let user_data = r#"{"id":"rick"}"#;
        assert_eq!(user_string_to_sign("1.1", user_data), r#"1.1::user::{"id":"rick"}"#);

        let token = sign_user(&app, "1.1", user_data);
        assert!(verify_user_auth(&app, "1.1", user_data, &token).is_ok());
        assert!(verify_user_auth(&app, "1.2", user_data, &token).is_err());
    }

    #[test]
    fn test_api_string_to_sign() {
        let mut params = BTreeMap::new();
        params.insert("auth_key".into(), "TestKey".into());
        params.insert("Auth_Timestamp".into(), "1353088179".into());
        params.insert("auth_signature".into(), "ignored".into());
        assert_eq!(
            api_string_to_sign("post", "/apps/1234/events", &params),
            "POST\n/apps/1234/events\nauth_key=TestKey&auth_timestamp=1353088179"
        );
    }

    #[test]
    fn test_api_request_roundtrip() {
        let app = app();
        let body = br#"{"name":"foo","channels":["project-3"],"data":"{}"}"#;
        let params = sign_api_request(&app, "POST", "/apps/1234/events", body, 1_000);

        assert!(verify_api_request(&app, "POST", "/apps/1234/events", &params, body, 1_100).is_ok());
        assert_eq!(
            verify_api_request(&app, "POST", "/apps/1234/events", &params, body, 5_000),
            Err(AuthError::Expired)
        );
        assert_eq!(
            verify_api_request(&app, "POST", "/apps/1234/events", &params, b"{}", 1_000),
            Err(AuthError::BodyMismatch)
        );
        assert_eq!(
            verify_api_request(&app, "POST", "/apps/1234/batch_events", &params, body, 1_000),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_api_request_missing_key() {
        let app = app();
        let params = BTreeMap::new();
        assert_eq!(
            verify_api_request(&app, "GET", "/apps/1234/channels", &params, b"", 0),
            Err(AuthError::MissingParameter("auth_key"))
        );
    }

    #[test]
    fn test_body_md5() {
        assert_eq!(body_md5(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
