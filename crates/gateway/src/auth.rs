use std::time::Duration;

use {
    axum::http::{HeaderMap, header::AUTHORIZATION},
    jsonwebtoken::{
        Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
        get_current_timestamp,
    },
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use duet_config::{AuthConfig, ConfigError};

use crate::{error::GatewayError, rooms::validate_user_id};

// ── Types ────────────────────────────────────────────────────────────────────

/// The verified caller behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
}

/// Session token claims. The identity service writes the user id as `id`;
/// `sub` is accepted for standard issuers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub exp: u64,
}

// ── Verification ─────────────────────────────────────────────────────────────

/// Verifies HS256 session tokens. Holds no state beyond the key.
pub struct SessionAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl SessionAuthenticator {
    pub fn new(secret: &str, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn from_config(auth: &AuthConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(auth.secret()?, auth.leeway_secs))
    }

    /// Every failure collapses into [`GatewayError::Unauthenticated`]; the
    /// reason is only logged.
    pub fn authenticate(&self, token: Option<&str>) -> Result<Identity, GatewayError> {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            debug!("handshake without credential");
            return Err(GatewayError::Unauthenticated);
        };

        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "credential rejected");
                GatewayError::Unauthenticated
            })?
            .claims;

        let Some(user_id) = claims.id.or(claims.sub) else {
            debug!("credential carries no user id");
            return Err(GatewayError::Unauthenticated);
        };
        if let Err(e) = validate_user_id(&user_id) {
            debug!(error = %e, "credential user id is unusable");
            return Err(GatewayError::Unauthenticated);
        }

        Ok(Identity {
            user_id,
            email: claims.email,
        })
    }
}

/// The bearer credential of an upgrade request: `?token=` first, then
/// `Authorization: Bearer`.
pub fn credential_from_request(query_token: Option<String>, headers: &HeaderMap) -> Option<String> {
    query_token.or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.trim().to_string())
    })
}

// ── Issuing ──────────────────────────────────────────────────────────────────

/// Mints tokens the authenticator accepts. Used by the CLI and tests.
pub struct TokenIssuer {
    key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(secret: &str) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn from_config(auth: &AuthConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(auth.secret()?))
    }

    pub fn issue(
        &self,
        user_id: &str,
        email: Option<&str>,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            id: Some(user_id.to_string()),
            sub: None,
            email: email.map(str::to_string),
            exp: get_current_timestamp() + ttl.as_secs(),
        };
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
        encode(&Header::new(Algorithm::HS256), claims, &self.key)
    }
}
