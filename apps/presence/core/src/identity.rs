use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Role granted by the auth service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Worker,
}

/// Claims carried by the bearer token a client presents when opening the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub role: Role,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl IdentityClaims {
    /// Builds a new claims object valid for `ttl` from now.
    pub fn new(subject_id: impl Into<String>, role: Role, ttl: Duration) -> Self {
        let issued_at = OffsetDateTime::now_utc();
        Self {
            subject_id: subject_id.into(),
            display_name: None,
            role,
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Returns `Ok(())` if the claims have not yet expired.
    pub fn ensure_not_expired(&self, now: OffsetDateTime) -> Result<(), TokenValidationError> {
        if now > self.expires_at {
            Err(TokenValidationError::Expired)
        } else {
            Ok(())
        }
    }

    /// Unpadded URL-safe base64 of the JSON claims. Used by dev tooling and
    /// tests; production tokens come from the auth service.
    pub fn encode(&self) -> Result<String, ClaimsDecodeError> {
        let json = serde_json::to_vec(self).map_err(ClaimsDecodeError::InvalidJson)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self, ClaimsDecodeError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(ClaimsDecodeError::InvalidBase64)?;
        serde_json::from_slice(&bytes).map_err(ClaimsDecodeError::InvalidJson)
    }
}

#[derive(Debug, Error)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,
}

#[derive(Debug, Error)]
pub enum ClaimsDecodeError {
    #[error("invalid base64 token: {0}")]
    InvalidBase64(base64::DecodeError),
    #[error("invalid token payload: {0}")]
    InvalidJson(serde_json::Error),
}
