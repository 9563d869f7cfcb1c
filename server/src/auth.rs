//! Token and API-key validation.
//!
//! The core never issues credentials; it only answers two questions:
//! who does this JWT belong to, and who does this API key belong to plus
//! what limits are stamped on it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use tunlink_shared::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Claims layout of an accepted JWT.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id.
    sub: String,
    exp: i64,
    #[serde(default)]
    iat: i64,
}

/// Limits baked into an API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiKeyPayload {
    user_id: String,
    per_minute: u32,
    per_day: u32,
}

/// Validates the two credential kinds admission accepts.
pub trait TokenValidator: Send + Sync {
    /// JWT -> user id.
    fn validate_token(&self, token: &str) -> Result<String>;

    /// API key -> (user id, per-minute, per-day).
    fn validate_api_key(&self, key: &str) -> Result<(String, u32, u32)>;
}

/// Secret-based validator: HS256 for JWTs, HMAC-SHA256 tags for API keys.
/// A missing secret rejects that credential kind outright.
pub struct SecretValidator {
    jwt_key: Option<DecodingKey>,
    api_key_secret: Option<String>,
}

impl SecretValidator {
    pub fn new(jwt_secret: Option<&str>, api_key_secret: Option<&str>) -> Self {
        Self {
            jwt_key: jwt_secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            api_key_secret: api_key_secret.map(String::from),
        }
    }
}

impl TokenValidator for SecretValidator {
    fn validate_token(&self, token: &str) -> Result<String> {
        let key = self
            .jwt_key
            .as_ref()
            .ok_or_else(|| Error::AdmissionRejected("token auth not configured".into()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let data = decode::<Claims>(token, key, &validation)
            .map_err(|e| Error::AdmissionRejected(format!("invalid token: {e}")))?;
        Ok(data.claims.sub)
    }

    fn validate_api_key(&self, key: &str) -> Result<(String, u32, u32)> {
        let secret = self
            .api_key_secret
            .as_ref()
            .ok_or_else(|| Error::AdmissionRejected("api-key auth not configured".into()))?;

        // Key shape: base64url(payload).hex(hmac-sha256(secret, payload)).
        let (payload_b64, tag_hex) = key
            .split_once('.')
            .ok_or_else(|| Error::AdmissionRejected("malformed api key".into()))?;

        let tag = hex::decode(tag_hex)
            .map_err(|_| Error::AdmissionRejected("malformed api key".into()))?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| Error::AdmissionRejected("api-key auth not configured".into()))?;
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&tag)
            .map_err(|_| Error::AdmissionRejected("invalid api key".into()))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| Error::AdmissionRejected("malformed api key".into()))?;
        let payload: ApiKeyPayload = serde_json::from_slice(&payload)
            .map_err(|_| Error::AdmissionRejected("malformed api key".into()))?;

        Ok((payload.user_id, payload.per_minute, payload.per_day))
    }
}
