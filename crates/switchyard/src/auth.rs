//! # Service Account Credentials
//!
//! Self-signed JWT credentials derived from a Google service-account key.
//! Pub/Sub accepts these directly as bearer tokens, so no token exchange
//! with the OAuth endpoint is needed.

use crate::{BrokerError, BrokerResult};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Audience of tokens used for publishing
pub const PUBLISHER_AUDIENCE: &str = "https://pubsub.googleapis.com/google.pubsub.v1.Publisher";

/// Audience of tokens used for pulling and acknowledging
pub const SUBSCRIBER_AUDIENCE: &str = "https://pubsub.googleapis.com/google.pubsub.v1.Subscriber";

const TOKEN_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN_SECS: i64 = 300;

/// Service-account key file as downloaded from the Cloud console
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type", default)]
    pub key_type: Option<String>,

    #[serde(default)]
    pub project_id: Option<String>,

    pub private_key_id: String,

    pub private_key: String,

    pub client_email: String,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub token_uri: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
}

struct CachedToken {
    token: String,
    expires_at: i64,
}

/// Bearer token source for one audience
pub struct JwtCredentials {
    encoding_key: EncodingKey,
    key_id: String,
    client_email: String,
    audience: String,
    cached: Mutex<Option<CachedToken>>,
}

impl JwtCredentials {
    pub fn from_service_account(key: &ServiceAccountKey, audience: &str) -> BrokerResult<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| BrokerError::AuthError(format!("invalid private key: {}", e)))?;

        Ok(Self {
            encoding_key,
            key_id: key.private_key_id.clone(),
            client_email: key.client_email.clone(),
            audience: audience.to_string(),
            cached: Mutex::new(None),
        })
    }

    /// Same signer, different audience
    pub fn with_audience(&self, audience: &str) -> Self {
        Self {
            encoding_key: self.encoding_key.clone(),
            key_id: self.key_id.clone(),
            client_email: self.client_email.clone(),
            audience: audience.to_string(),
            cached: Mutex::new(None),
        }
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    /// Current token, re-signed when it is within five minutes of expiry
    pub fn token(&self) -> BrokerResult<String> {
        let now = chrono::Utc::now().timestamp();
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| BrokerError::AuthError("credential cache poisoned".to_string()))?;

        if let Some(current) = cached.as_ref() {
            if current.expires_at - REFRESH_MARGIN_SECS > now {
                return Ok(current.token.clone());
            }
        }

        let fresh = self.sign(now)?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        tracing::debug!("Signed new token for audience {}", self.audience);
        Ok(token)
    }

    fn sign(&self, now: i64) -> BrokerResult<CachedToken> {
        let expires_at = now + TOKEN_LIFETIME_SECS;
        let claims = JwtClaims {
            iss: self.client_email.clone(),
            sub: self.client_email.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp: expires_at,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());

        let token = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| BrokerError::AuthError(format!("failed to sign JWT: {}", e)))?;

        Ok(CachedToken { token, expires_at })
    }
}

impl std::fmt::Debug for JwtCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtCredentials")
            .field("client_email", &self.client_email)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}
