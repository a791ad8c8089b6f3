//! Credential resolution: signed key/secret triples and OAuth bearer tokens.
//!
//! Only the refresh token is long-lived. Bearer tokens obtained here are held
//! for the duration of one fetch and never written back to the store.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use pulse_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use sha2::Sha256;
use tracing::debug;

use crate::AdapterError;

type HmacSha256 = Hmac<Sha256>;

/// Required non-empty string field of a credential blob.
pub(crate) fn required_str(blob: &JsonValue, field: &str) -> Result<String, AdapterError> {
    let object = blob
        .as_object()
        .ok_or_else(|| AdapterError::Credential("credential blob must be a JSON object".into()))?;
    match object.get(field) {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        // Account ids are sometimes stored as numbers.
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(AdapterError::Credential(format!(
            "credential field `{field}` must be a non-empty string"
        ))),
        None => Err(AdapterError::Credential(format!(
            "missing credential field `{field}`"
        ))),
    }
}

pub(crate) fn optional_str(blob: &JsonValue, field: &str) -> Option<String> {
    blob.get(field)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// API key + secret + customer id, used to sign each request.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedKeyCredentials {
    pub api_key: String,
    pub secret_key: String,
    pub customer_id: String,
}

impl fmt::Debug for SignedKeyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedKeyCredentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"<redacted>")
            .field("customer_id", &self.customer_id)
            .finish()
    }
}

impl SignedKeyCredentials {
    pub fn from_blob(blob: &JsonValue) -> Result<Self, AdapterError> {
        Ok(Self {
            api_key: required_str(blob, "api_key")?,
            secret_key: required_str(blob, "secret_key")?,
            customer_id: required_str(blob, "customer_id")?,
        })
    }

    /// Signature over `timestamp.method.path`.
    pub fn sign(&self, timestamp_ms: i64, method: &str, path: &str) -> Result<String, AdapterError> {
        hmac_sha256_base64(&self.secret_key, &signing_message(timestamp_ms, method, path))
    }
}

pub fn signing_message(timestamp_ms: i64, method: &str, path: &str) -> String {
    format!("{timestamp_ms}.{method}.{path}")
}

pub fn hmac_sha256_base64(secret: &str, message: &str) -> Result<String, AdapterError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| AdapterError::Credential(format!("unusable secret key: {err}")))?;
    mac.update(message.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[derive(Clone, PartialEq, Eq)]
pub enum OAuthGrant {
    /// Exchanged at call time for a short-lived bearer token.
    RefreshToken {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    /// Long-lived token issued out of band, used as the bearer directly.
    AccessToken(String),
}

impl fmt::Debug for OAuthGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RefreshToken { client_id, .. } => f
                .debug_struct("RefreshToken")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            Self::AccessToken(_) => f.write_str("AccessToken(<redacted>)"),
        }
    }
}

impl OAuthGrant {
    pub fn from_blob(blob: &JsonValue) -> Result<Self, AdapterError> {
        if blob.get("refresh_token").is_some() {
            return Ok(Self::RefreshToken {
                client_id: required_str(blob, "client_id")?,
                client_secret: required_str(blob, "client_secret")?,
                refresh_token: required_str(blob, "refresh_token")?,
            });
        }
        if blob.get("access_token").is_some() {
            return Ok(Self::AccessToken(required_str(blob, "access_token")?));
        }
        Err(AdapterError::Credential(
            "credential blob needs either `refresh_token` or `access_token`".into(),
        ))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

/// Resolve a bearer token for one fetch, exchanging the refresh token when
/// the grant carries one.
pub async fn bearer_token(
    http: &HttpFetcher,
    token_url: &str,
    account_key: &str,
    grant: &OAuthGrant,
) -> Result<BearerToken, AdapterError> {
    let (client_id, client_secret, refresh_token) = match grant {
        OAuthGrant::AccessToken(token) => return Ok(BearerToken(token.clone())),
        OAuthGrant::RefreshToken {
            client_id,
            client_secret,
            refresh_token,
        } => (client_id, client_secret, refresh_token),
    };

    let request = http.client().post(token_url).form(&[
        ("grant_type", "refresh_token"),
        ("client_id", client_id.as_str()),
        ("client_secret", client_secret.as_str()),
        ("refresh_token", refresh_token.as_str()),
    ]);
    let body = http.send_json(account_key, request).await?;
    let token = body
        .get("access_token")
        .and_then(JsonValue::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AdapterError::payload("token response missing `access_token`"))?;
    debug!(account_key, "refreshed oauth bearer token");
    Ok(BearerToken(token.to_string()))
}
