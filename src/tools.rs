//! Tool operation logic for the nine MCP tools (§4.5), wired on top of
//! `storage::queries`, `embedding`, `encryption`, and `trending`.
//!
//! Every tool shares the wrapper behavior from §4.5: parameter validation
//! up front (failures become a `{error, details}` tool result, never a
//! transport error), timing instrumented separately around the embedding
//! call and the database work, an optional `current_time`/`timezone`
//! prefix, and an optional `performance` suffix.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::embedding::Embedder;
use crate::encryption::Encryptor;
use crate::error::{MemoryError, Result};
use crate::storage::queries::{self, NewMemory};
use crate::storage::Storage;
use crate::trending;
use crate::types::{DuplicateTier, LabelFilter, Memory};

#[derive(Debug, Default, Clone, Copy)]
struct Timings {
    embed_secs: f64,
    db_secs: f64,
}

fn timed<T>(acc: &mut f64, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let start = Instant::now();
    let result = f();
    *acc += start.elapsed().as_secs_f64();
    result
}

/// Executes the nine tools against a shared storage/embedding/encryption
/// stack, applying the common response wrapper from §4.5.
pub struct ToolExecutor {
    storage: Storage,
    embedder: Arc<dyn Embedder>,
    encryptor: Option<Encryptor>,
    config: Config,
}

impl ToolExecutor {
    pub fn new(
        storage: Storage,
        embedder: Arc<dyn Embedder>,
        encryptor: Option<Encryptor>,
        config: Config,
    ) -> Self {
        Self {
            storage,
            embedder,
            encryptor,
            config,
        }
    }

    /// Dispatch one tool call by name, returning the final JSON response
    /// (success shape or `{error, details}`) with every common wrapper
    /// already applied.
    pub fn call(&self, name: &str, arguments: Value) -> Value {
        let total_start = Instant::now();
        let outcome = self.dispatch(name, arguments);

        match outcome {
            Ok((mut result, timings)) => {
                self.apply_wrappers(&mut result, timings, total_start.elapsed().as_secs_f64());
                result
            }
            Err(err) => err.as_tool_error(),
        }
    }

    fn dispatch(&self, name: &str, arguments: Value) -> Result<(Value, Timings)> {
        match name {
            "store_memory" => self.store_memory(arguments),
            "retrieve_memories" => self.retrieve_memories(arguments),
            "add_labels" => self.add_labels(arguments),
            "del_labels" => self.del_labels(arguments),
            "delete_memory" => self.delete_memory(arguments),
            "get_memory" => self.get_memory(arguments),
            "random_memory" => self.random_memory(arguments),
            "memory_stats" => self.memory_stats(arguments),
            "trending_labels" => self.trending_labels(arguments),
            other => Err(MemoryError::InvalidParameter(format!("unknown tool: {other}"))),
        }
    }

    fn apply_wrappers(&self, result: &mut Value, timings: Timings, total_secs: f64) {
        let obj = match result.as_object_mut() {
            Some(obj) => obj,
            None => return,
        };

        if self.config.timezone_enabled() {
            let mut prefixed = Map::new();
            prefixed.insert("current_time".to_string(), json!(format_current_time()));
            prefixed.insert("timezone".to_string(), json!(self.config.timezone));
            prefixed.append(obj);
            *obj = prefixed;
        }

        if self.config.performance_metrics {
            obj.insert(
                "performance".to_string(),
                json!(format!(
                    "{:.3} {:.3} {:.3}",
                    timings.embed_secs, timings.db_secs, total_secs
                )),
            );
        }
    }

    // --- store_memory ----------------------------------------------------

    fn store_memory(&self, arguments: Value) -> Result<(Value, Timings)> {
        let mut timings = Timings::default();

        let raw_content = require_str(&arguments, "content")?;
        let mut content = raw_content.clone();
        let mut labels = parse_labels_value(arguments.get("labels"));
        let mut source = optional_str(&arguments, "source");

        if let Some(over) = try_json_object(&raw_content) {
            if let Some(c) = over.get("content").and_then(Value::as_str) {
                content = c.to_string();
            }
            if let Some(l) = over.get("labels") {
                labels = parse_labels_value(Some(l));
            }
            if let Some(s) = over.get("source").and_then(Value::as_str) {
                source = Some(s.to_string());
            }
        }

        if content.trim().is_empty() {
            return Err(MemoryError::InvalidParameter("content must not be empty".to_string()));
        }
        let labels = queries::dedup_labels(&labels);

        let embedding = timed(&mut timings.embed_secs, || self.embedder.embed(&content))?;
        let dims = embedding.len();
        let embedding_table = queries::table_name(dims);
        let embedding_model = self.embedder.model_name().to_string();
        let namespace = self.config.namespace.clone();

        let stored_bytes = match &self.encryptor {
            Some(enc) => enc.encrypt(content.as_bytes()),
            None => content.clone().into_bytes(),
        };
        let enc_flag = self.encryptor.is_some();

        let (memory, warnings) = timed(&mut timings.db_secs, || {
            self.storage.with_transaction(|conn| {
                queries::ensure_embedding_table(conn, dims)?;

                let nearest = queries::nearest_existing(
                    conn,
                    &embedding_table,
                    &namespace,
                    &embedding_model,
                    &embedding,
                    2,
                )?;
                let warnings: Vec<String> = nearest
                    .into_iter()
                    .filter_map(|(id, sim)| DuplicateTier::classify(sim).map(|tier| tier.message(id, sim)))
                    .collect();

                let memory = queries::insert_memory(
                    conn,
                    &NewMemory {
                        namespace: &namespace,
                        content: &stored_bytes,
                        enc: enc_flag,
                        labels: &labels,
                        source: source.as_deref(),
                        embedding_table: &embedding_table,
                        embedding_model: &embedding_model,
                        embedding: &embedding,
                    },
                )?;

                Ok((memory, warnings))
            })
        })?;

        // Fire-and-forget: failures here never fail the store (§4.5).
        let token_result = self
            .storage
            .with_connection(|conn| queries::upsert_label_tokens(conn, &namespace, &labels));
        if let Err(err) = token_result {
            tracing::warn!(error = %err, "label token tracking failed for stored memory");
        }

        let client_id = queries::client_facing_id(&namespace, &memory);
        let mut response = json!({
            "id": client_id,
            "source": memory.source,
            "message": "Memory stored successfully.",
            "current_embedding": embedding,
        });
        if !warnings.is_empty() {
            response["warnings"] = json!(warnings);
        }

        Ok((response, timings))
    }

    // --- retrieve_memories -------------------------------------------------

    fn retrieve_memories(&self, arguments: Value) -> Result<(Value, Timings)> {
        let mut timings = Timings::default();

        let mut query = optional_str(&arguments, "query").unwrap_or_default();
        let mut labels_filter = LabelFilter::parse(&optional_str(&arguments, "labels").unwrap_or_default());
        let mut source = optional_str(&arguments, "source").unwrap_or_default();

        if let Some(over) = try_json_object(&query) {
            if let Some(q) = over.get("query").and_then(Value::as_str) {
                query = q.to_string();
            }
            if let Some(l) = over.get("labels").and_then(Value::as_str) {
                labels_filter = LabelFilter::parse(l);
            }
            if let Some(s) = over.get("source").and_then(Value::as_str) {
                source = s.to_string();
            }
        }

        let num_results = arguments
            .get("num_results")
            .and_then(Value::as_u64)
            .unwrap_or(5) as usize;
        let namespace = self.config.namespace.clone();
        let oversample = if self.encryptor.is_some() { num_results * 2 } else { num_results };

        if query.trim().is_empty() {
            let memories = timed(&mut timings.db_secs, || {
                self.storage
                    .with_connection(|conn| queries::list_recent(conn, &namespace, &labels_filter, &source, oversample))
            })?;

            let views: Vec<Value> = memories
                .into_iter()
                .filter_map(|m| self.decode_view(&namespace, m, None))
                .take(num_results)
                .collect();

            return Ok((
                json!({ "memories": views.clone(), "count": views.len() }),
                timings,
            ));
        }

        let query_embedding = timed(&mut timings.embed_secs, || self.embedder.embed(&query))?;
        let dims = self.embedder.dimension()?;
        let embedding_table = queries::table_name(dims);
        let embedding_model = self.embedder.model_name().to_string();

        let matches = timed(&mut timings.db_secs, || {
            self.storage.with_connection(|conn| {
                queries::semantic_search(
                    conn,
                    &embedding_table,
                    &embedding_model,
                    &namespace,
                    &labels_filter,
                    &source,
                    &query_embedding,
                    oversample,
                )
            })
        })?;

        let views: Vec<Value> = matches
            .into_iter()
            .filter_map(|m| self.decode_view(&namespace, m.memory, Some(m.similarity_pct)))
            .take(num_results)
            .collect();

        Ok((
            json!({
                "memories": views.clone(),
                "count": views.len(),
                "current_embedding": query_embedding,
            }),
            timings,
        ))
    }

    /// Decrypt (if needed) and project a `Memory` into the client-facing
    /// view, returning `None` on decryption failure (listings silently
    /// skip these per §4.4's read-time policy).
    fn decode_view(&self, namespace: &str, memory: Memory, similarity: Option<i32>) -> Option<Value> {
        let content = self.decode_content(&memory)?;
        let id = queries::client_facing_id(namespace, &memory);
        let mut view = json!({
            "id": id,
            "content": content,
            "labels": memory.labels,
            "source": memory.source,
            "timestamp": memory.timestamp,
        });
        if let Some(sim) = similarity {
            view["similarity"] = json!(sim);
        }
        Some(view)
    }

    fn decode_content(&self, memory: &Memory) -> Option<String> {
        if !memory.enc {
            return Some(String::from_utf8_lossy(&memory.content).into_owned());
        }
        let encryptor = self.encryptor.as_ref()?;
        let plaintext = encryptor.decrypt(&memory.content)?;
        Some(String::from_utf8_lossy(&plaintext).into_owned())
    }

    // --- add_labels / del_labels --------------------------------------------

    fn add_labels(&self, arguments: Value) -> Result<(Value, Timings)> {
        let mut timings = Timings::default();
        let namespace = self.config.namespace.clone();
        let client_id = require_i64(&arguments, "memory_id")?;
        let additions = parse_labels_value(arguments.get("labels"));
        if additions.is_empty() {
            return Err(MemoryError::InvalidParameter("labels must not be empty".to_string()));
        }

        let labels = timed(&mut timings.db_secs, || {
            self.storage.with_transaction(|conn| {
                let id = queries::resolve_client_id(conn, &namespace, client_id)?;
                let memory = queries::get_memory_by_id(conn, id)?;
                let merged = queries::merge_labels(&memory.labels, &additions);
                queries::write_labels(conn, id, &merged)?;
                Ok(merged)
            })
        })?;

        // Fire-and-forget: failures here never fail the label update (§4.5/§9).
        let token_result = self
            .storage
            .with_connection(|conn| queries::upsert_label_tokens(conn, &namespace, &additions));
        if let Err(err) = token_result {
            tracing::warn!(error = %err, "label token tracking failed for added labels");
        }

        Ok((json!({ "memory_id": client_id, "labels": labels }), timings))
    }

    fn del_labels(&self, arguments: Value) -> Result<(Value, Timings)> {
        let mut timings = Timings::default();
        let namespace = self.config.namespace.clone();
        let client_id = require_i64(&arguments, "memory_id")?;
        let removals = parse_labels_value(arguments.get("labels"));
        if removals.is_empty() {
            return Err(MemoryError::InvalidParameter("labels must not be empty".to_string()));
        }

        let labels = timed(&mut timings.db_secs, || {
            self.storage.with_transaction(|conn| {
                let id = queries::resolve_client_id(conn, &namespace, client_id)?;
                let memory = queries::get_memory_by_id(conn, id)?;
                let remaining = queries::subtract_labels(&memory.labels, &removals);
                queries::write_labels(conn, id, &remaining)?;
                Ok(remaining)
            })
        })?;

        Ok((json!({ "memory_id": client_id, "labels": labels }), timings))
    }

    // --- delete_memory / get_memory / random_memory -------------------------

    fn delete_memory(&self, arguments: Value) -> Result<(Value, Timings)> {
        let mut timings = Timings::default();
        let namespace = self.config.namespace.clone();
        let client_id = require_i64(&arguments, "memory_id")?;

        timed(&mut timings.db_secs, || {
            self.storage.with_transaction(|conn| {
                let id = queries::resolve_client_id(conn, &namespace, client_id)?;
                let memory = queries::get_memory_by_id(conn, id)?;
                queries::delete_memory(conn, &memory)
            })
        })?;

        Ok((json!({ "success": true, "memory_id": client_id }), timings))
    }

    fn get_memory(&self, arguments: Value) -> Result<(Value, Timings)> {
        let mut timings = Timings::default();
        let namespace = self.config.namespace.clone();
        let client_id = require_i64(&arguments, "memory_id")?;

        let memory = timed(&mut timings.db_secs, || {
            self.storage.with_connection(|conn| {
                let id = queries::resolve_client_id(conn, &namespace, client_id)?;
                queries::get_memory_by_id(conn, id)
            })
        })?;

        let view = self
            .decode_view(&namespace, memory, None)
            .ok_or(MemoryError::DecryptionFailure)?;
        Ok((view, timings))
    }

    fn random_memory(&self, arguments: Value) -> Result<(Value, Timings)> {
        let mut timings = Timings::default();
        let namespace = self.config.namespace.clone();
        let labels_filter = LabelFilter::parse(&optional_str(&arguments, "labels").unwrap_or_default());
        let source = optional_str(&arguments, "source").unwrap_or_default();
        let oversample = if self.encryptor.is_some() { 10 } else { 5 };

        let candidates = timed(&mut timings.db_secs, || {
            self.storage
                .with_connection(|conn| queries::random_candidates(conn, &namespace, &labels_filter, &source, oversample))
        })?;

        let view = candidates
            .into_iter()
            .find_map(|m| self.decode_view(&namespace, m, None))
            .ok_or_else(|| MemoryError::NotFound("no decodable memory matched the filter".to_string()))?;

        Ok((view, timings))
    }

    // --- memory_stats / trending_labels --------------------------------------

    fn memory_stats(&self, arguments: Value) -> Result<(Value, Timings)> {
        let mut timings = Timings::default();
        let namespace = self.config.namespace.clone();
        let labels_filter = LabelFilter::parse(&optional_str(&arguments, "labels").unwrap_or_default());
        let source = optional_str(&arguments, "source").unwrap_or_default();

        let stats = timed(&mut timings.db_secs, || {
            self.storage
                .with_connection(|conn| queries::stats_with_filters(conn, &namespace, &labels_filter, &source))
        })?;

        if labels_filter.is_empty() && source.trim().is_empty() {
            return Ok((json!({ "total_memories": stats.total }), timings));
        }

        let ratio = if stats.total > 0 {
            stats.matching as f64 / stats.total as f64
        } else {
            0.0
        };
        let mut response = json!({
            "matching": stats.matching,
            "total": stats.total,
            "ratio": ratio,
            "percentage": (ratio * 100.0).round(),
        });
        if !stats.labels_matched.is_empty() {
            response["labels_matched"] = json!(stats.labels_matched);
        }
        if !stats.sources_matched.is_empty() {
            response["sources_matched"] = json!(stats.sources_matched);
        }

        Ok((response, timings))
    }

    fn trending_labels(&self, arguments: Value) -> Result<(Value, Timings)> {
        let mut timings = Timings::default();
        let namespace = self.config.namespace.clone();
        let days = arguments.get("days").and_then(Value::as_i64).unwrap_or(30);
        let limit = arguments.get("limit").and_then(Value::as_u64).unwrap_or(10) as usize;

        let (tokens, memory_labels) = timed(&mut timings.db_secs, || {
            self.storage.with_connection(|conn| {
                let tokens = queries::label_tokens_in_window(conn, &namespace, days)?;
                let labels = queries::all_memory_labels(conn, &namespace)?;
                Ok((tokens, labels))
            })
        })?;

        if tokens.is_empty() {
            return Ok((json!({ "trending_labels": Vec::<Value>::new() }), timings));
        }

        let now = Utc::now();
        let scored = trending::score_tokens(&tokens, now, days.max(1) as f64);
        let top_tokens: Vec<(String, f64)> = scored.into_iter().take(limit.max(1) * 4).collect();
        let trending = trending::match_labels_to_tokens(&memory_labels, &top_tokens, limit);

        Ok((json!({ "trending_labels": trending }), timings))
    }
}

// --- parameter coercion helpers -------------------------------------------

fn require_str(arguments: &Value, key: &str) -> Result<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| MemoryError::InvalidParameter(format!("{key} is required")))
}

fn optional_str(arguments: &Value, key: &str) -> Option<String> {
    arguments.get(key).and_then(Value::as_str).map(str::to_string).filter(|s| !s.is_empty())
}

fn require_i64(arguments: &Value, key: &str) -> Result<i64> {
    arguments
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| MemoryError::InvalidParameter(format!("{key} is required and must be an integer")))
}

/// The dual label format from §4.5: a JSON array literal or a
/// comma-separated string. Also used for `store_memory`'s plain
/// comma-separated `labels` parameter, since JSON-array parsing simply
/// fails closed for a bare CSV string.
fn parse_labels_value(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        Some(Value::String(raw)) => match serde_json::from_str::<Vec<String>>(raw) {
            Ok(items) => items,
            Err(_) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        },
        _ => Vec::new(),
    }
}

/// The JSON-object-literal-in-a-string workaround from §4.5, used by
/// `store_memory`'s `content` and `retrieve_memories`'s `query`.
fn try_json_object(raw: &str) -> Option<Map<String, Value>> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<Value>(trimmed).ok()?.as_object().cloned()
}

/// "Thursday, August 1st, 2026 at 3:04 PM UTC" — an ordinal day and an
/// abbreviated zone, per §4.5.
fn format_current_time() -> String {
    let now = Utc::now();
    let day = now.format("%-d").to_string().parse::<u32>().unwrap_or(1);
    let suffix = match (day % 10, day % 100) {
        (1, 11) | (2, 12) | (3, 13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!(
        "{} {}{}, {}",
        now.format("%A, %B"),
        day,
        suffix,
        now.format("%Y at %-I:%M %p UTC")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Embedder;
    use clap::Parser;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEmbedder {
        dims: usize,
        calls: AtomicUsize,
    }

    impl Embedder for FakeEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut v = vec![0.0f32; self.dims];
            for (i, b) in text.bytes().enumerate() {
                v[i % self.dims] += b as f32;
            }
            Ok(v)
        }
        fn model_name(&self) -> &str {
            "fake-model"
        }
        fn dimension(&self) -> Result<usize> {
            Ok(self.dims)
        }
    }

    fn executor() -> ToolExecutor {
        let storage = Storage::open_in_memory().unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(FakeEmbedder { dims: 4, calls: AtomicUsize::new(0) });
        let config = Config::parse_from(["memory-mcp"]);
        ToolExecutor::new(storage, embedder, None, config)
    }

    #[test]
    fn store_then_get_round_trips() {
        let exec = executor();
        let stored = exec.call(
            "store_memory",
            json!({ "content": "brewed a saison today", "labels": "beer,brewday" }),
        );
        assert!(stored.get("error").is_none(), "unexpected error: {stored}");
        let id = stored["id"].as_i64().unwrap();

        let fetched = exec.call("get_memory", json!({ "memory_id": id }));
        assert_eq!(fetched["content"], "brewed a saison today");
        assert_eq!(fetched["labels"], json!(["beer", "brewday"]));
    }

    #[test]
    fn store_rejects_empty_content() {
        let exec = executor();
        let result = exec.call("store_memory", json!({ "content": "   " }));
        assert!(result.get("error").is_some());
    }

    #[test]
    fn add_and_del_labels_round_trip() {
        let exec = executor();
        let stored = exec.call("store_memory", json!({ "content": "hello", "labels": "a" }));
        let id = stored["id"].as_i64().unwrap();

        let added = exec.call("add_labels", json!({ "memory_id": id, "labels": "b,c" }));
        assert_eq!(added["labels"], json!(["a", "b", "c"]));

        let removed = exec.call("del_labels", json!({ "memory_id": id, "labels": "[\"b\"]" }));
        assert_eq!(removed["labels"], json!(["a", "c"]));
    }

    #[test]
    fn delete_then_get_reports_not_found() {
        let exec = executor();
        let stored = exec.call("store_memory", json!({ "content": "ephemeral" }));
        let id = stored["id"].as_i64().unwrap();

        let deleted = exec.call("delete_memory", json!({ "memory_id": id }));
        assert_eq!(deleted["success"], json!(true));

        let fetched = exec.call("get_memory", json!({ "memory_id": id }));
        assert!(fetched.get("error").is_some());
    }

    #[test]
    fn retrieve_without_query_lists_by_recency() {
        let exec = executor();
        exec.call("store_memory", json!({ "content": "first" }));
        exec.call("store_memory", json!({ "content": "second" }));

        let result = exec.call("retrieve_memories", json!({ "num_results": 10 }));
        assert_eq!(result["count"], json!(2));
    }

    #[test]
    fn memory_stats_without_filters_returns_total_only() {
        let exec = executor();
        exec.call("store_memory", json!({ "content": "one" }));
        let stats = exec.call("memory_stats", json!({}));
        assert_eq!(stats["total_memories"], json!(1));
    }

    #[test]
    fn store_memory_json_override_replaces_sibling_params() {
        let exec = executor();
        let stored = exec.call(
            "store_memory",
            json!({ "content": "{\"content\": \"overridden\", \"labels\": [\"x\"]}", "labels": "ignored" }),
        );
        let id = stored["id"].as_i64().unwrap();
        let fetched = exec.call("get_memory", json!({ "memory_id": id }));
        assert_eq!(fetched["content"], "overridden");
        assert_eq!(fetched["labels"], json!(["x"]));
    }
}
