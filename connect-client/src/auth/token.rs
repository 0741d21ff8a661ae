//! Access and refresh tokens
//!
//! Tokens are JWTs issued by the OAuth token endpoint. The client only reads
//! their claims to decide whether a token is still usable; signatures are
//! verified by the server, never here.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::error::AuthError;
use crate::storage::KeyValueStore;

/// Fixed key of the durable refresh token slot
pub const REFRESH_TOKEN_KEY: &str = "connect.refreshToken";

/// Claims the client cares about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Everything else in the payload
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An encoded token plus its decoded claims
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    token: String,
    claims: Claims,
}

impl AccessToken {
    /// Decode a token, reading claims without verifying the signature
    pub fn parse(token: impl Into<String>) -> Result<Self, AuthError> {
        let token = token.into();
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = decode::<Claims>(&token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| AuthError::MalformedToken(e.to_string()))?
            .claims;

        Ok(Self { token, claims })
    }

    /// The encoded token as sent in headers and grant requests
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Not yet expired
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_secs())
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        self.claims.exp > now
    }

    /// Seconds until expiry, negative once expired
    pub fn expires_in(&self) -> i64 {
        self.claims.exp as i64 - now_secs() as i64
    }
}

/// Refresh tokens share the access token format
pub type RefreshToken = AccessToken;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Successful token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// OAuth error body of a rejected grant
#[derive(Debug, Clone, Deserialize)]
pub struct TokenErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Tokens currently held by the client
#[derive(Debug, Clone, Default)]
pub struct AuthTokens {
    pub access_token: Option<AccessToken>,
    pub refresh_token: Option<RefreshToken>,
}

impl AuthTokens {
    pub fn from_response(response: &TokenResponse) -> Result<Self, AuthError> {
        let access_token = AccessToken::parse(response.access_token.as_str())?;
        let refresh_token = response
            .refresh_token
            .as_deref()
            .map(RefreshToken::parse)
            .transpose()?;
        Ok(Self {
            access_token: Some(access_token),
            refresh_token,
        })
    }

    /// Load the refresh token from the durable slot.
    ///
    /// A slot that cannot be read or decoded is treated as empty.
    pub fn restore(store: &KeyValueStore) -> Self {
        let stored = match store.get(REFRESH_TOKEN_KEY) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to read stored refresh token");
                None
            }
        };
        let refresh_token = stored.and_then(|token| match RefreshToken::parse(token) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed stored refresh token");
                None
            }
        });
        Self {
            access_token: None,
            refresh_token,
        }
    }

    /// Write the refresh token to the durable slot, clearing it when absent
    pub fn save(&self, store: &KeyValueStore) -> Result<(), AuthError> {
        let result = match &self.refresh_token {
            Some(token) => store.set(REFRESH_TOKEN_KEY, token.token()),
            None => store.remove(REFRESH_TOKEN_KEY),
        };
        result.map_err(|e| AuthError::Storage(e.to_string()))
    }

    /// Access token, if present and not expired
    pub fn valid_access_token(&self) -> Option<&AccessToken> {
        self.access_token.as_ref().filter(|t| t.is_valid())
    }

    /// Refresh token, if present and not expired
    pub fn valid_refresh_token(&self) -> Option<&RefreshToken> {
        self.refresh_token.as_ref().filter(|t| t.is_valid())
    }
}
