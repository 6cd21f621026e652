//! Bundled OAuth 2.1 authorization server (§4.7).
//!
//! Authorization codes live in memory only. Clients, access tokens, refresh
//! tokens, and the refresh→access mapping are mirrored into `system_state`
//! under hashed keys (§3) so a process restart does not sign clients out;
//! persistence happens inside the same lock guard as the in-memory mutation,
//! per §5's "never see a persisted token absent from memory" guarantee.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::{MemoryError, Result};
use crate::storage::queries;
use crate::storage::Storage;
use crate::types::{
    AuthorizationCode, OAuthAccessToken, OAuthClient, OAuthRefreshToken, Principal,
    RefreshToAccess,
};

/// A half-completed `/authorize` request, keyed by CSRF `state` until the
/// login form posts back.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
}

pub struct OAuthProvider {
    storage: Storage,
    username: String,
    password: Option<String>,
    access_token_ttl: i64,
    refresh_token_ttl: i64,
    auth_code_ttl: i64,

    clients: Mutex<HashMap<String, OAuthClient>>,
    access_tokens: Mutex<HashMap<String, OAuthAccessToken>>,
    refresh_tokens: Mutex<HashMap<String, OAuthRefreshToken>>,
    refresh_to_access: Mutex<HashMap<String, String>>,
    auth_codes: Mutex<HashMap<String, AuthorizationCode>>,
    state_mapping: Mutex<HashMap<String, PendingAuthorization>>,
}

impl OAuthProvider {
    /// Seed the default client from configuration, then load the persisted
    /// client/token set, dropping anything already expired.
    pub fn load(storage: Storage, config: &Config) -> Result<Arc<Self>> {
        let provider = Arc::new(Self {
            storage,
            username: config.oauth_username.clone(),
            password: config.oauth_password.clone(),
            access_token_ttl: config.oauth_access_token_expiry,
            refresh_token_ttl: config.oauth_refresh_token_expiry,
            auth_code_ttl: config.oauth_auth_code_expiry,
            clients: Mutex::new(HashMap::new()),
            access_tokens: Mutex::new(HashMap::new()),
            refresh_tokens: Mutex::new(HashMap::new()),
            refresh_to_access: Mutex::new(HashMap::new()),
            auth_codes: Mutex::new(HashMap::new()),
            state_mapping: Mutex::new(HashMap::new()),
        });

        provider.seed_default_client(config)?;
        provider.load_persisted()?;
        Ok(provider)
    }

    fn seed_default_client(&self, config: &Config) -> Result<()> {
        let redirect_uris: Vec<String> = config
            .oauth_redirect_uris
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let client = OAuthClient {
            client_id: config.oauth_client_id.clone(),
            client_secret: config.oauth_client_secret.clone(),
            redirect_uris,
            client_name: Some("default".to_string()),
        };

        self.storage.with_connection(|conn| {
            queries::kv_set(
                conn,
                &client_key(&client.client_id),
                &serde_json::to_value(&client)?,
            )
        })?;
        self.clients.lock().insert(client.client_id.clone(), client);
        Ok(())
    }

    fn load_persisted(&self) -> Result<()> {
        let now = Utc::now();
        self.storage.with_connection(|conn| {
            for (key, value) in queries::kv_scan_prefix(conn, "oauth:client:")? {
                if let Ok(client) = serde_json::from_value::<OAuthClient>(value) {
                    self.clients.lock().insert(client.client_id.clone(), client);
                }
                let _ = key;
            }

            for (key, value) in queries::kv_scan_prefix(conn, "oauth:access_token:")? {
                match serde_json::from_value::<OAuthAccessToken>(value) {
                    Ok(token) if token.expires_at > now => {
                        self.access_tokens.lock().insert(token.token.clone(), token);
                    }
                    _ => queries::kv_delete(conn, &key)?,
                }
            }

            for (key, value) in queries::kv_scan_prefix(conn, "oauth:refresh_token:")? {
                match serde_json::from_value::<OAuthRefreshToken>(value) {
                    Ok(token) if token.expires_at > now => {
                        self.refresh_tokens.lock().insert(token.token.clone(), token);
                    }
                    _ => queries::kv_delete(conn, &key)?,
                }
            }

            for (key, value) in queries::kv_scan_prefix(conn, "oauth:refresh_to_access:")? {
                if let Ok(mapping) = serde_json::from_value::<RefreshToAccess>(value) {
                    let hash = key.rsplit(':').next().unwrap_or_default().to_string();
                    self.refresh_to_access.lock().insert(hash, mapping.access_token);
                }
            }

            Ok(())
        })
    }

    /// Register a dynamic client (§4.7: "dynamic client registration is
    /// supported").
    pub fn register_client(
        &self,
        client_secret: Option<String>,
        redirect_uris: Vec<String>,
        client_name: Option<String>,
    ) -> Result<OAuthClient> {
        let client = OAuthClient {
            client_id: format!("mcp_client_{}", random_hex(12)),
            client_secret,
            redirect_uris,
            client_name,
        };
        self.storage.with_connection(|conn| {
            queries::kv_set(conn, &client_key(&client.client_id), &serde_json::to_value(&client)?)
        })?;
        self.clients.lock().insert(client.client_id.clone(), client.clone());
        Ok(client)
    }

    pub fn get_client(&self, client_id: &str) -> Option<OAuthClient> {
        self.clients.lock().get(client_id).cloned()
    }

    /// `GET /authorize`: validate the client and redirect URI, mint a CSRF
    /// `state`, and stash the pending request until `/login/callback`.
    pub fn begin_authorize(
        &self,
        client_id: &str,
        redirect_uri: &str,
        scopes: Vec<String>,
        resource: Option<String>,
    ) -> Result<String> {
        let client = self
            .get_client(client_id)
            .ok_or_else(|| MemoryError::InvalidParameter(format!("unknown client_id: {client_id}")))?;

        if !client.redirect_uris.is_empty() && !client.redirect_uris.iter().any(|u| u == redirect_uri) {
            return Err(MemoryError::InvalidParameter(
                "redirect_uri is not registered for this client".to_string(),
            ));
        }

        let state = random_hex(16);
        self.state_mapping.lock().insert(
            state.clone(),
            PendingAuthorization {
                client_id: client_id.to_string(),
                redirect_uri: redirect_uri.to_string(),
                scopes,
                resource,
            },
        );
        Ok(state)
    }

    pub fn pending_authorization(&self, state: &str) -> Option<PendingAuthorization> {
        self.state_mapping.lock().get(state).cloned()
    }

    fn check_credentials(&self, username: &str, password: &str) -> bool {
        username == self.username && self.password.as_deref() == Some(password)
    }

    /// `POST /login/callback`: validate credentials, consume the pending
    /// state, and mint a short-lived authorization code.
    pub fn login(&self, state: &str, username: &str, password: &str) -> Result<AuthorizationCode> {
        if !self.check_credentials(username, password) {
            return Err(MemoryError::Unauthorized("invalid username or password".to_string()));
        }

        let pending = self
            .state_mapping
            .lock()
            .remove(state)
            .ok_or_else(|| MemoryError::InvalidParameter("unknown or expired state".to_string()))?;

        let code = AuthorizationCode {
            code: format!("mcp_code_{}", random_hex(24)),
            client_id: pending.client_id,
            redirect_uri: pending.redirect_uri,
            scopes: pending.scopes,
            expires_at: Utc::now() + Duration::seconds(self.auth_code_ttl),
            resource: pending.resource,
        };
        self.auth_codes.lock().insert(code.code.clone(), code.clone());
        Ok(code)
    }

    /// `POST /token` with `grant_type=authorization_code`.
    pub fn exchange_code(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
    ) -> Result<(OAuthAccessToken, OAuthRefreshToken)> {
        let record = {
            let mut codes = self.auth_codes.lock();
            codes.remove(code)
        }
        .ok_or_else(|| MemoryError::InvalidParameter("unknown or already-used code".to_string()))?;

        if record.expires_at <= Utc::now() {
            return Err(MemoryError::InvalidParameter("authorization code expired".to_string()));
        }
        if record.client_id != client_id || record.redirect_uri != redirect_uri {
            return Err(MemoryError::InvalidParameter(
                "client_id or redirect_uri does not match the authorization request".to_string(),
            ));
        }

        self.issue_token_pair(client_id, record.scopes)
    }

    /// `POST /token` with `grant_type=refresh_token`. Rotation is mandatory:
    /// the old access/refresh pair is invalidated before the new pair is
    /// returned.
    pub fn refresh(
        &self,
        refresh_token: &str,
        requested_scopes: Option<Vec<String>>,
    ) -> Result<(OAuthAccessToken, OAuthRefreshToken)> {
        let old_hash = hash_token(refresh_token);
        let old = {
            let mut refresh_tokens = self.refresh_tokens.lock();
            refresh_tokens.remove(refresh_token)
        }
        .ok_or_else(|| MemoryError::Unauthorized("unknown or expired refresh token".to_string()))?;

        if old.expires_at <= Utc::now() {
            return Err(MemoryError::Unauthorized("refresh token expired".to_string()));
        }

        let scopes = match requested_scopes {
            Some(requested) if requested.iter().all(|s| old.scopes.contains(s)) => requested,
            Some(_) => {
                return Err(MemoryError::InvalidParameter(
                    "requested scopes are not a subset of the original grant".to_string(),
                ))
            }
            None => old.scopes.clone(),
        };

        self.storage.with_connection(|conn| {
            queries::kv_delete(conn, &format!("oauth:refresh_token:{old_hash}"))?;
            queries::kv_delete(conn, &format!("oauth:refresh_to_access:{old_hash}"))
        })?;
        if let Some(old_access) = self.refresh_to_access.lock().remove(&old_hash) {
            self.revoke_access_token(&old_access)?;
        }

        self.issue_token_pair(&old.client_id, scopes)
    }

    fn issue_token_pair(
        &self,
        client_id: &str,
        scopes: Vec<String>,
    ) -> Result<(OAuthAccessToken, OAuthRefreshToken)> {
        let now = Utc::now();
        let access = OAuthAccessToken {
            token: format!("mcp_{}", random_hex(32)),
            client_id: client_id.to_string(),
            scopes: scopes.clone(),
            expires_at: now + Duration::seconds(self.access_token_ttl),
            resource: None,
        };
        let refresh = OAuthRefreshToken {
            token: format!("mcp_refresh_{}", random_hex(32)),
            client_id: client_id.to_string(),
            scopes,
            expires_at: now + Duration::seconds(self.refresh_token_ttl),
        };

        let access_hash = hash_token(&access.token);
        let refresh_hash = hash_token(&refresh.token);

        self.storage.with_connection(|conn| {
            queries::kv_set(conn, &format!("oauth:access_token:{access_hash}"), &serde_json::to_value(&access)?)?;
            queries::kv_set(conn, &format!("oauth:refresh_token:{refresh_hash}"), &serde_json::to_value(&refresh)?)?;
            queries::kv_set(
                conn,
                &format!("oauth:refresh_to_access:{refresh_hash}"),
                &serde_json::to_value(&RefreshToAccess { access_token: access.token.clone() })?,
            )
        })?;

        self.access_tokens.lock().insert(access.token.clone(), access.clone());
        self.refresh_tokens.lock().insert(refresh.token.clone(), refresh.clone());
        self.refresh_to_access.lock().insert(refresh_hash, access.token.clone());

        Ok((access, refresh))
    }

    fn revoke_access_token(&self, token: &str) -> Result<()> {
        let hash = hash_token(token);
        self.access_tokens.lock().remove(token);
        self.storage
            .with_connection(|conn| queries::kv_delete(conn, &format!("oauth:access_token:{hash}")))
    }

    /// Revoke both tokens of a grant, looked up by either member.
    pub fn revoke(&self, token: &str) -> Result<()> {
        self.revoke_access_token(token)?;

        let hash = hash_token(token);
        if self.refresh_tokens.lock().remove(token).is_some() {
            self.refresh_to_access.lock().remove(&hash);
            self.storage.with_connection(|conn| {
                queries::kv_delete(conn, &format!("oauth:refresh_token:{hash}"))?;
                queries::kv_delete(conn, &format!("oauth:refresh_to_access:{hash}"))
            })?;
        }
        Ok(())
    }

    /// Hot-path lookup used by `Hybrid::verify`. Lazily drops expired
    /// entries as they're observed (§5's lazy cleanup policy).
    pub fn validate_access_token(&self, token: &str) -> Option<Principal> {
        let mut tokens = self.access_tokens.lock();
        let record = tokens.get(token)?;
        if record.expires_at <= Utc::now() {
            tokens.remove(token);
            return None;
        }
        Some(Principal {
            client_id: record.client_id.clone(),
            scopes: record.scopes.clone(),
        })
    }
}

fn client_key(client_id: &str) -> String {
    format!("oauth:client:{client_id}")
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn test_config() -> Config {
        let mut config = Config::parse_from(["memory-mcp"]);
        config.oauth_bundled = true;
        config.oauth_client_id = "test-client".to_string();
        config.oauth_password = Some("hunter2".to_string());
        config.oauth_redirect_uris = "https://client.example/callback".to_string();
        config
    }

    fn provider() -> Arc<OAuthProvider> {
        let storage = Storage::open_in_memory().unwrap();
        OAuthProvider::load(storage, &test_config()).unwrap()
    }

    #[test]
    fn authorization_code_flow_issues_tokens() {
        let provider = provider();
        let state = provider
            .begin_authorize("test-client", "https://client.example/callback", vec!["*".to_string()], None)
            .unwrap();
        let code = provider.login(&state, "admin", "hunter2").unwrap();
        let (access, refresh) = provider
            .exchange_code(&code.code, "test-client", "https://client.example/callback")
            .unwrap();
        assert!(access.token.starts_with("mcp_"));
        assert!(refresh.token.starts_with("mcp_refresh_"));
        assert_eq!(
            provider.validate_access_token(&access.token).unwrap().client_id,
            "test-client"
        );
    }

    #[test]
    fn refresh_rotation_invalidates_old_pair() {
        let provider = provider();
        let state = provider
            .begin_authorize("test-client", "https://client.example/callback", vec!["*".to_string()], None)
            .unwrap();
        let code = provider.login(&state, "admin", "hunter2").unwrap();
        let (access, refresh) = provider
            .exchange_code(&code.code, "test-client", "https://client.example/callback")
            .unwrap();

        let (new_access, _new_refresh) = provider.refresh(&refresh.token, None).unwrap();

        assert!(provider.validate_access_token(&access.token).is_none());
        assert!(provider.validate_access_token(&new_access.token).is_some());
        assert!(provider.refresh(&refresh.token, None).is_err());
    }

    #[test]
    fn refresh_rejects_scope_widening() {
        let provider = provider();
        let state = provider
            .begin_authorize("test-client", "https://client.example/callback", vec!["read".to_string()], None)
            .unwrap();
        let code = provider.login(&state, "admin", "hunter2").unwrap();
        let (_access, refresh) = provider
            .exchange_code(&code.code, "test-client", "https://client.example/callback")
            .unwrap();

        assert!(provider.refresh(&refresh.token, Some(vec!["read".to_string(), "write".to_string()])).is_err());
    }

    #[test]
    fn login_rejects_bad_credentials() {
        let provider = provider();
        let state = provider
            .begin_authorize("test-client", "https://client.example/callback", vec!["*".to_string()], None)
            .unwrap();
        assert!(provider.login(&state, "admin", "wrong").is_err());
    }
}
