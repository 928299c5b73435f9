//! Token decoding. Tokens are opaque to the engine; the authenticator turns
//! one into session claims.

use crate::core::{EngineError, Result, codes};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Tenant org code.
    pub org: Option<String>,
    pub account: Option<i64>,
    pub session: Option<String>,
    /// System-admin key, checked against the configured admin keys.
    pub admin_key: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn decode(&self, token: &str) -> Result<SessionClaims>;
}

/// Claims carried as plain JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTokenAuthenticator;

impl JsonTokenAuthenticator {
    pub fn token(claims: &SessionClaims) -> Result<String> {
        Ok(serde_json::to_string(claims)?)
    }
}

#[async_trait]
impl Authenticator for JsonTokenAuthenticator {
    async fn decode(&self, token: &str) -> Result<SessionClaims> {
        serde_json::from_str(token)
            .map_err(|err| EngineError::functional(codes::TOKEN_INVALID, format!("bad token: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_tokens_round_trip() {
        let claims = SessionClaims {
            org: Some("demo".into()),
            account: Some(7),
            session: Some("s1".into()),
            admin_key: None,
        };
        let token = JsonTokenAuthenticator::token(&claims).unwrap();
        assert_eq!(JsonTokenAuthenticator.decode(&token).await.unwrap(), claims);

        let err = JsonTokenAuthenticator.decode("garbage").await.unwrap_err();
        assert_eq!(err.code(), codes::TOKEN_INVALID);
    }
}
