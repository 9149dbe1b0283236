use thiserror::Error;
use time::OffsetDateTime;
use tripteller_presence_core::{ClaimsDecodeError, IdentityClaims, Role, TokenValidationError};

/// Caller identity resolved from the token presented when the socket opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: String,
    pub display_name: Option<String>,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }
}

impl From<IdentityClaims> for Identity {
    fn from(claims: IdentityClaims) -> Self {
        Self {
            subject_id: claims.subject_id,
            display_name: claims.display_name,
            role: claims.role,
        }
    }
}

/// Resolves bearer tokens into identities. Token issuance lives in the auth
/// service; the presence server only checks what it is handed.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, IdentityError>;
}

/// Accepts the unpadded base64 claims tokens minted by the auth service.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaimsTokenVerifier;

impl IdentityVerifier for ClaimsTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, IdentityError> {
        let claims = IdentityClaims::decode(token)?;
        claims.ensure_not_expired(OffsetDateTime::now_utc())?;
        if claims.subject_id.trim().is_empty() {
            return Err(IdentityError::MissingSubject);
        }
        Ok(claims.into())
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(transparent)]
    Decode(#[from] ClaimsDecodeError),
    #[error("token expired")]
    Expired(#[from] TokenValidationError),
    #[error("token carries no subject")]
    MissingSubject,
}

impl IdentityError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            IdentityError::Decode(ClaimsDecodeError::InvalidBase64(_)) => "invalid_base64",
            IdentityError::Decode(ClaimsDecodeError::InvalidJson(_)) => "invalid_json",
            IdentityError::Expired(_) => "token_expired",
            IdentityError::MissingSubject => "missing_subject",
        }
    }
}
