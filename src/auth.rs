//! Resolves the identity a realtime connection claims in its handshake.

use crate::entity::{Participant, Role};
use crate::error::{ChatError, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by the portal login tokens. `exp` is optional because the
/// portals issue tokens without expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

#[derive(Clone)]
pub struct IdentityResolver {
    secret: String,
}

impl IdentityResolver {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Sign a token for `id`, valid for `ttl` when given.
    pub fn issue(&self, id: &str, ttl: Option<Duration>) -> Result<String> {
        let claims = Claims {
            id: id.to_string(),
            exp: ttl.map(|ttl| (Utc::now() + ttl).timestamp()),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ChatError::Unauthorized(e.to_string()))
    }

    /// Verify `token` and pair its subject with the declared `role`.
    pub fn resolve(&self, token: &str, role: Role) -> Result<Participant> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| ChatError::Unauthorized(e.to_string()))?;

        if data.claims.id.is_empty() {
            return Err(ChatError::Unauthorized("token carries no id".into()));
        }

        Ok(Participant::new(data.claims.id, role))
    }
}
