//! Bearer-token signing and verification for agent admission
//!
//! Tokens are HS256 JWTs signed with the edge's server secret. The payload
//! carries a single fixed verification claim; a token is accepted when its
//! signature checks out against the secret and the claim equals the value
//! the edge was configured with.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by a tunnel admission token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelClaims {
    /// The fixed verification claim; must match the edge's configured value.
    pub token: String,
    /// Issued-at timestamp.
    pub iat: i64,
}

impl TunnelClaims {
    pub fn new(verify_token: impl Into<String>) -> Self {
        Self {
            token: verify_token.into(),
            iat: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token signing error: {0}")]
    Signing(jsonwebtoken::errors::Error),

    #[error("Authentication error")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),

    #[error("Authentication error")]
    ClaimMismatch,
}

/// Sign an admission token with the server secret.
pub fn sign_token(secret: &[u8], claims: &TunnelClaims) -> Result<String, AuthError> {
    let header = Header::new(Algorithm::HS256);
    encode(&header, claims, &EncodingKey::from_secret(secret)).map_err(AuthError::Signing)
}

/// Verifies admission tokens against the server secret and the fixed
/// verification claim.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    verify_token: String,
}

impl TokenVerifier {
    pub fn new(secret: &[u8], verify_token: impl Into<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Admission tokens have no expiry; only the signature and the
        // verification claim are checked.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            verify_token: verify_token.into(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<TunnelClaims, AuthError> {
        let data = decode::<TunnelClaims>(token, &self.decoding_key, &self.validation)
            .map_err(AuthError::InvalidToken)?;

        if data.claims.token != self.verify_token {
            return Err(AuthError::ClaimMismatch);
        }

        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"edge_server_secret_0123456789";

    #[test]
    fn test_sign_and_verify() {
        let claims = TunnelClaims::new("deadbeef");
        let token = sign_token(SECRET, &claims).unwrap();

        let verifier = TokenVerifier::new(SECRET, "deadbeef");
        let decoded = verifier.verify(&token).unwrap();
        assert_eq!(decoded.token, "deadbeef");
        assert_eq!(decoded.iat, claims.iat);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let claims = TunnelClaims::new("deadbeef");
        let token = sign_token(SECRET, &claims).unwrap();

        let verifier = TokenVerifier::new(b"other_secret", "deadbeef");
        let err = verifier.verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
        assert_eq!(err.to_string(), "Authentication error");
    }

    #[test]
    fn test_claim_mismatch_rejected() {
        let claims = TunnelClaims::new("not-the-configured-claim");
        let token = sign_token(SECRET, &claims).unwrap();

        let verifier = TokenVerifier::new(SECRET, "deadbeef");
        let err = verifier.verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::ClaimMismatch));
        assert_eq!(err.to_string(), "Authentication error");
    }

    #[test]
    fn test_garbage_token_rejected() {
        let verifier = TokenVerifier::new(SECRET, "deadbeef");
        assert!(verifier.verify("not.a.jwt").is_err());
        assert!(verifier.verify("").is_err());
    }
}
