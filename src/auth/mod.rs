//! Three-mode authentication for the MCP tool-call surface (§4.7, §10.5).
//!
//! `TokenVerifier` is selected once at startup from which of `bearer_token`
//! / `oauth_bundled` are configured: `NoAuth` when neither is set,
//! `ApiKeyOnly` when only a static bearer token is set, `Hybrid` when OAuth
//! is bundled (the static key, if any, is still checked first).

mod oauth;

pub use oauth::{OAuthProvider, PendingAuthorization};

use std::sync::Arc;

use crate::config::Config;
use crate::error::{MemoryError, Result};
use crate::types::Principal;

/// Resolves a bearer credential from an `Authorization: Bearer <token>`
/// header into an authenticated `Principal`.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, bearer: Option<&str>) -> Result<Principal>;
}

/// No credential required; every request authenticates as the anonymous
/// principal with unrestricted scope.
pub struct NoAuth;

impl TokenVerifier for NoAuth {
    fn verify(&self, _bearer: Option<&str>) -> Result<Principal> {
        Ok(Principal::anonymous())
    }
}

/// A single static bearer token, configured out of band.
pub struct ApiKeyOnly {
    api_key: String,
}

impl ApiKeyOnly {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

impl TokenVerifier for ApiKeyOnly {
    fn verify(&self, bearer: Option<&str>) -> Result<Principal> {
        match bearer {
            Some(token) if token == self.api_key => Ok(Principal::api_key_client()),
            _ => Err(unauthorized()),
        }
    }
}

/// Static API key (optional) checked first, then the bundled OAuth
/// authorization server's access-token table.
pub struct Hybrid {
    api_key: Option<String>,
    oauth: Arc<OAuthProvider>,
}

impl Hybrid {
    pub fn new(api_key: Option<String>, oauth: Arc<OAuthProvider>) -> Self {
        Self { api_key, oauth }
    }
}

impl TokenVerifier for Hybrid {
    fn verify(&self, bearer: Option<&str>) -> Result<Principal> {
        let token = bearer.ok_or_else(unauthorized)?;
        if let Some(api_key) = &self.api_key {
            if token == api_key {
                return Ok(Principal::api_key_client());
            }
        }
        self.oauth.validate_access_token(token).ok_or_else(unauthorized)
    }
}

fn unauthorized() -> MemoryError {
    MemoryError::Unauthorized("missing or invalid bearer token".to_string())
}

/// Build the verifier implied by `bearer_token` / `oauth_bundled`, per §4.7's
/// validation priority.
pub fn build_verifier(config: &Config, oauth: Option<Arc<OAuthProvider>>) -> Arc<dyn TokenVerifier> {
    match (config.bearer_token.clone(), oauth) {
        (_, Some(provider)) => Arc::new(Hybrid::new(config.bearer_token.clone(), provider)),
        (Some(key), None) => Arc::new(ApiKeyOnly::new(key)),
        (None, None) => Arc::new(NoAuth),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_auth_always_succeeds() {
        let verifier = NoAuth;
        assert!(verifier.verify(None).is_ok());
        assert!(verifier.verify(Some("anything")).is_ok());
    }

    #[test]
    fn api_key_only_rejects_wrong_token() {
        let verifier = ApiKeyOnly::new("secret".to_string());
        assert!(verifier.verify(Some("secret")).is_ok());
        assert!(verifier.verify(Some("wrong")).is_err());
        assert!(verifier.verify(None).is_err());
    }
}
