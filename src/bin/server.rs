//! HTTP transport for the MCP tool-call surface plus the bundled OAuth 2.1
//! authorization server and the admin re-embed endpoint (§6, §10.5).
//!
//! Run with: memory-mcp-server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memory_mcp::auth::{build_verifier, OAuthProvider, TokenVerifier};
use memory_mcp::config::Config;
use memory_mcp::embedding::{Embedder, EmbeddingConfig, HttpEmbedder};
use memory_mcp::encryption::Encryptor;
use memory_mcp::error::{MemoryError, Result};
use memory_mcp::mcp::{
    get_tool_definitions, methods, InitializeResult, McpRequest, McpResponse, ToolCallResult,
};
use memory_mcp::storage::queries;
use memory_mcp::storage::Storage;
use memory_mcp::tools::ToolExecutor;
use memory_mcp::types::LabelFilter;

#[derive(Clone)]
struct AppState {
    storage: Storage,
    config: Config,
    executor: Arc<ToolExecutor>,
    verifier: Arc<dyn TokenVerifier>,
    oauth: Option<Arc<OAuthProvider>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();

    let storage = Storage::open(&config.database_path)?;
    tracing::info!(path = %storage.db_path(), "storage opened");

    let embedding_url = config
        .embedding_url
        .clone()
        .ok_or_else(|| MemoryError::Config("EMBEDDING_URL is required".to_string()))?;

    let http_embedder = HttpEmbedder::new(EmbeddingConfig {
        url: embedding_url,
        model: config.embedding_model.clone(),
        api_key: config.embedding_api_key.clone(),
        dims: config.embedding_dims,
    });
    let dims = http_embedder.detect_dimension().await?;
    tracing::info!(model = %config.embedding_model, dims, "embedding dimension detected");
    let embedder: Arc<dyn Embedder> = Arc::new(http_embedder);

    let encryptor_for_executor = config.encryption_key.clone().map(Encryptor::new);
    if encryptor_for_executor.is_some() {
        tracing::info!("per-record encryption enabled");
    }

    let oauth = if config.oauth_bundled {
        tracing::info!("bundled OAuth authorization server enabled");
        Some(OAuthProvider::load(storage.clone(), &config)?)
    } else {
        None
    };
    let verifier = build_verifier(&config, oauth.clone());

    let executor = Arc::new(ToolExecutor::new(
        storage.clone(),
        embedder.clone(),
        encryptor_for_executor,
        config.clone(),
    ));

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        storage,
        config,
        executor,
        verifier,
        oauth,
    };

    let app = build_router(state);

    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| MemoryError::Config(format!("invalid BIND_ADDR {bind_addr}: {e}")))?;
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp", post(mcp_handler))
        .route("/authorize", get(authorize))
        .route("/login", get(login_form))
        .route("/login/callback", post(login_callback))
        .route("/auth/success", get(auth_success))
        .route("/token", post(token_handler))
        .route("/revoke", post(revoke_handler))
        .route("/register", post(register_client))
        .route("/api/embeddings/generate", post(admin_reembed))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

// --- MCP tool-call surface (§6, §10.5) -------------------------------------

async fn mcp_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<McpRequest>,
) -> Json<McpResponse> {
    let bearer = extract_bearer(&headers);
    if let Err(err) = state.verifier.verify(bearer.as_deref()) {
        return Json(McpResponse::from_error(req.id, err));
    }

    let response = match req.method.as_str() {
        methods::INITIALIZE => McpResponse::success(
            req.id.clone(),
            serde_json::to_value(InitializeResult::default()).unwrap_or_default(),
        ),
        methods::INITIALIZED => McpResponse::success(req.id.clone(), json!({})),
        methods::LIST_TOOLS => {
            McpResponse::success(req.id.clone(), json!({ "tools": get_tool_definitions() }))
        }
        methods::CALL_TOOL => {
            let name = req.params.get("name").and_then(Value::as_str).unwrap_or_default();
            let arguments = req.params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            let result = state.executor.call(name, arguments);
            let tool_result = if result.get("error").is_some() {
                ToolCallResult::error(result.to_string())
            } else {
                ToolCallResult::json(&result)
            };
            McpResponse::success(req.id.clone(), serde_json::to_value(tool_result).unwrap_or_default())
        }
        methods::LIST_RESOURCES => McpResponse::success(req.id.clone(), json!({ "resources": [] })),
        methods::READ_RESOURCE => {
            McpResponse::error(req.id.clone(), -32601, "no resources are exposed".to_string())
        }
        other => McpResponse::error(req.id.clone(), -32601, format!("method not found: {other}")),
    };

    Json(response)
}

// --- bundled OAuth 2.1 authorization server (§4.7, §6) ---------------------

#[derive(Deserialize)]
struct AuthorizeQuery {
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    scope: String,
    resource: Option<String>,
}

async fn authorize(State(state): State<AppState>, Query(q): Query<AuthorizeQuery>) -> impl IntoResponse {
    let oauth = match &state.oauth {
        Some(o) => o,
        None => return (StatusCode::NOT_FOUND, Json(json!({"error": "oauth not enabled"}))).into_response(),
    };

    let scopes: Vec<String> = if q.scope.trim().is_empty() {
        vec!["*".to_string()]
    } else {
        q.scope.split_whitespace().map(str::to_string).collect()
    };

    match oauth.begin_authorize(&q.client_id, &q.redirect_uri, scopes, q.resource) {
        Ok(state_token) => Redirect::to(&format!("/login?state={state_token}")).into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(err.as_tool_error())).into_response(),
    }
}

#[derive(Deserialize)]
struct LoginQuery {
    state: String,
}

async fn login_form(State(state): State<AppState>, Query(q): Query<LoginQuery>) -> impl IntoResponse {
    if state.oauth.as_ref().and_then(|o| o.pending_authorization(&q.state)).is_none() {
        return (StatusCode::BAD_REQUEST, Html("unknown or expired authorization request".to_string())).into_response();
    }

    let html = format!(
        r#"<!doctype html>
<html><body>
<form method="post" action="/login/callback">
  <input type="hidden" name="state" value="{state}">
  <label>Username <input type="text" name="username"></label>
  <label>Password <input type="password" name="password"></label>
  <button type="submit">Sign in</button>
</form>
</body></html>"#,
        state = q.state
    );
    Html(html).into_response()
}

#[derive(Deserialize)]
struct LoginCallback {
    state: String,
    username: String,
    password: String,
}

async fn login_callback(State(state): State<AppState>, Form(form): Form<LoginCallback>) -> impl IntoResponse {
    let oauth = match &state.oauth {
        Some(o) => o,
        None => return (StatusCode::NOT_FOUND, Json(json!({"error": "oauth not enabled"}))).into_response(),
    };
    let pending = match oauth.pending_authorization(&form.state) {
        Some(p) => p,
        None => return (StatusCode::BAD_REQUEST, Json(json!({"error": "unknown or expired state"}))).into_response(),
    };

    match oauth.login(&form.state, &form.username, &form.password) {
        Ok(code) => Redirect::to(&format!("{}?code={}", pending.redirect_uri, code.code)).into_response(),
        Err(err) => (StatusCode::UNAUTHORIZED, Json(err.as_tool_error())).into_response(),
    }
}

async fn auth_success() -> Html<&'static str> {
    Html("<!doctype html><html><body><p>Authorization complete. You may close this window.</p></body></html>")
}

async fn token_handler(State(state): State<AppState>, Form(body): Form<HashMap<String, String>>) -> impl IntoResponse {
    let oauth = match &state.oauth {
        Some(o) => o,
        None => return (StatusCode::NOT_FOUND, Json(json!({"error": "oauth not enabled"}))).into_response(),
    };

    let grant_type = body.get("grant_type").map(String::as_str).unwrap_or_default();
    let result = match grant_type {
        "authorization_code" => {
            let code = body.get("code").cloned().unwrap_or_default();
            let client_id = body.get("client_id").cloned().unwrap_or_default();
            let redirect_uri = body.get("redirect_uri").cloned().unwrap_or_default();
            oauth.exchange_code(&code, &client_id, &redirect_uri)
        }
        "refresh_token" => {
            let refresh_token = body.get("refresh_token").cloned().unwrap_or_default();
            let scopes = body
                .get("scope")
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.split_whitespace().map(str::to_string).collect());
            oauth.refresh(&refresh_token, scopes)
        }
        other => Err(MemoryError::InvalidParameter(format!("unsupported grant_type: {other}"))),
    };

    match result {
        Ok((access, refresh)) => (
            StatusCode::OK,
            Json(json!({
                "access_token": access.token,
                "token_type": "Bearer",
                "expires_in": state.config.oauth_access_token_expiry,
                "refresh_token": refresh.token,
                "scope": access.scopes.join(" "),
            })),
        )
            .into_response(),
        Err(err @ MemoryError::Unauthorized(_)) => (StatusCode::UNAUTHORIZED, Json(err.as_tool_error())).into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(err.as_tool_error())).into_response(),
    }
}

async fn revoke_handler(State(state): State<AppState>, Form(body): Form<HashMap<String, String>>) -> impl IntoResponse {
    let oauth = match &state.oauth {
        Some(o) => o,
        None => return (StatusCode::NOT_FOUND, Json(json!({"error": "oauth not enabled"}))).into_response(),
    };
    let token = body.get("token").cloned().unwrap_or_default();
    match oauth.revoke(&token) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(err.as_tool_error())).into_response(),
    }
}

#[derive(Deserialize)]
struct RegisterRequest {
    client_name: Option<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
    client_secret: Option<String>,
}

async fn register_client(State(state): State<AppState>, Json(body): Json<RegisterRequest>) -> impl IntoResponse {
    let oauth = match &state.oauth {
        Some(o) => o,
        None => return (StatusCode::NOT_FOUND, Json(json!({"error": "oauth not enabled"}))).into_response(),
    };
    match oauth.register_client(body.client_secret, body.redirect_uris, body.client_name) {
        Ok(client) => (
            StatusCode::CREATED,
            Json(json!({
                "client_id": client.client_id,
                "client_secret": client.client_secret,
                "redirect_uris": client.redirect_uris,
                "client_name": client.client_name,
            })),
        )
            .into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(err.as_tool_error())).into_response(),
    }
}

// --- admin re-embed endpoint (§6) -------------------------------------------

#[derive(Deserialize)]
struct ReembedRequest {
    embedding_url: String,
    embedding_model: String,
    embedding_api_key: Option<String>,
    embedding_dims: Option<usize>,
    namespace: Option<String>,
}

async fn admin_reembed(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<ReembedRequest>) -> impl IntoResponse {
    let configured = match &state.config.api_bearer_token {
        Some(token) => token.clone(),
        None => return (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response(),
    };
    if extract_bearer(&headers).as_deref() != Some(configured.as_str()) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response();
    }

    let embedder = HttpEmbedder::new(EmbeddingConfig {
        url: body.embedding_url.clone(),
        model: body.embedding_model.clone(),
        api_key: body.embedding_api_key.clone(),
        dims: body.embedding_dims,
    });
    let dims = match embedder.detect_dimension().await {
        Ok(d) => d,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(err.as_tool_error())).into_response(),
    };

    let table = match state.storage.with_connection(|conn| queries::ensure_embedding_table(conn, dims)) {
        Ok(t) => t,
        Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, Json(err.as_tool_error())).into_response(),
    };

    let namespace = body.namespace.clone().unwrap_or_else(|| state.config.namespace.clone());
    let storage = state.storage.clone();
    let model = body.embedding_model.clone();
    let embedder = Arc::new(embedder);
    let table_for_task = table.clone();
    let namespace_for_task = namespace.clone();

    tokio::spawn(async move {
        if let Err(err) = reembed_namespace(storage, embedder, &namespace_for_task, &table_for_task, &model).await {
            tracing::error!(error = %err, namespace = %namespace_for_task, "re-embed worker failed");
        }
    });

    let response = json!({
        "status": "accepted",
        "message": "re-embedding started in the background",
        "namespace": namespace,
        "embedding_table": table,
        "embedding_dims": dims,
    });

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

/// Re-embed every memory in `namespace` into `embedding_table`, one at a
/// time so a single bad decrypt/embed doesn't abort the whole run.
async fn reembed_namespace(
    storage: Storage,
    embedder: Arc<HttpEmbedder>,
    namespace: &str,
    embedding_table: &str,
    embedding_model: &str,
) -> Result<()> {
    let memories = storage.with_connection(|conn| {
        queries::list_recent(conn, namespace, &LabelFilter::default(), "", 1_000_000)
    })?;

    for memory in memories {
        if memory.enc {
            tracing::warn!(memory_id = memory.id, "skipping encrypted memory during re-embed");
            continue;
        }
        let text = String::from_utf8_lossy(&memory.content).into_owned();
        let embedding = match embedder.embed(&text) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(memory_id = memory.id, error = %err, "re-embed failed for memory");
                continue;
            }
        };

        let result = storage.with_connection(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {embedding_table} (memory_id, embedding, namespace, embedding_model)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(memory_id, embedding_model) DO UPDATE SET embedding = excluded.embedding"
                ),
                rusqlite::params![
                    memory.id,
                    queries::encode_embedding(&embedding),
                    namespace,
                    embedding_model,
                ],
            )?;
            Ok(())
        });
        if let Err(err) = result {
            tracing::warn!(memory_id = memory.id, error = %err, "failed to persist re-embedded vector");
        }
    }

    Ok(())
}
