//! Process-wide configuration.
//!
//! Loading mechanics (env-var parsing) are someone else's concern per the
//! specification; this module only fixes the *shape* every other subsystem
//! depends on, following the clap derive+env convention already used by the
//! rest of this codebase's binaries.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "memory-mcp", about = "Memory storage and retrieval MCP service")]
pub struct Config {
    /// Path to the SQLite database file, or ":memory:" for an ephemeral store.
    #[arg(long, env = "DATABASE_PATH", default_value = "memories.db")]
    pub database_path: String,

    /// Embedding endpoint base URL (OpenAI-compatible).
    #[arg(long, env = "EMBEDDING_URL")]
    pub embedding_url: Option<String>,

    /// Embedding model identifier.
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    pub embedding_model: String,

    /// Optional API key for the embedding endpoint.
    #[arg(long, env = "EMBEDDING_API_KEY")]
    pub embedding_api_key: Option<String>,

    /// Requested embedding dimensionality (Matryoshka-capable models).
    #[arg(long, env = "EMBEDDING_DIMS")]
    pub embedding_dims: Option<usize>,

    /// Static bearer token enabling API-key auth on the MCP surface.
    #[arg(long, env = "BEARER_TOKEN")]
    pub bearer_token: Option<String>,

    /// Bearer token guarding the admin re-embed endpoint. Unset => 404.
    #[arg(long, env = "API_BEARER_TOKEN")]
    pub api_bearer_token: Option<String>,

    /// Tenant partition key. Empty/unset means wildcard (all namespaces visible).
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Non-empty enables per-record content encryption.
    #[arg(long, env = "ENCRYPTION_KEY")]
    pub encryption_key: Option<String>,

    /// Enable the bundled OAuth 2.1 authorization server.
    #[arg(long, env = "OAUTH_BUNDLED", default_value_t = false)]
    pub oauth_bundled: bool,

    #[arg(long, env = "OAUTH_CLIENT_ID", default_value = "default-client")]
    pub oauth_client_id: String,

    #[arg(long, env = "OAUTH_CLIENT_SECRET")]
    pub oauth_client_secret: Option<String>,

    #[arg(long, env = "OAUTH_USERNAME", default_value = "admin")]
    pub oauth_username: String,

    #[arg(long, env = "OAUTH_PASSWORD")]
    pub oauth_password: Option<String>,

    /// Comma-separated redirect URI allow-list.
    #[arg(long, env = "OAUTH_REDIRECT_URIS", default_value = "")]
    pub oauth_redirect_uris: String,

    #[arg(long, env = "OAUTH_ACCESS_TOKEN_EXPIRY", default_value_t = 3600)]
    pub oauth_access_token_expiry: i64,

    #[arg(long, env = "OAUTH_REFRESH_TOKEN_EXPIRY", default_value_t = 604_800)]
    pub oauth_refresh_token_expiry: i64,

    #[arg(long, env = "OAUTH_AUTH_CODE_EXPIRY", default_value_t = 300)]
    pub oauth_auth_code_expiry: i64,

    /// Absolute base URL used as the OAuth issuer and for redirects.
    #[arg(long, env = "SERVER_URL", default_value = "http://localhost:5005")]
    pub server_url: String,

    /// IANA zone name, "false" to disable, unset => UTC.
    #[arg(long, env = "TIMEZONE", default_value = "UTC")]
    pub timezone: String,

    /// Append a "performance" field (embed/db/total seconds) to every response.
    #[arg(long, env = "PERFORMANCE_METRICS", default_value_t = false)]
    pub performance_metrics: bool,

    /// Bind address for the HTTP surface.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:5005")]
    pub bind_addr: String,
}

impl Config {
    /// Namespace mode is "wildcard" when the namespace is empty.
    pub fn namespace_is_wildcard(&self) -> bool {
        self.namespace.trim().is_empty()
    }

    /// Timezone is disabled when explicitly set to the literal "false".
    pub fn timezone_enabled(&self) -> bool {
        !self.timezone.eq_ignore_ascii_case("false")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_wildcard_detection() {
        let mut cfg = Config::parse_from(["memory-mcp"]);
        assert!(!cfg.namespace_is_wildcard());
        cfg.namespace = "  ".to_string();
        assert!(cfg.namespace_is_wildcard());
    }

    #[test]
    fn timezone_disable_sentinel() {
        let mut cfg = Config::parse_from(["memory-mcp"]);
        assert!(cfg.timezone_enabled());
        cfg.timezone = "false".to_string();
        assert!(!cfg.timezone_enabled());
    }
}
