//! Split-table reads/writes for the nine MCP tools (§4.1, §4.5), the
//! `system_state` key-value store (§3), and trending-labels token storage.
//!
//! Every function here takes a `&Connection` (which may be a live
//! `rusqlite::Transaction`, since it derefs to `Connection`) so callers
//! control transaction boundaries via `Storage::with_connection` /
//! `Storage::with_transaction`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use crate::embedding::cosine_similarity;
use crate::error::{MemoryError, Result};
use crate::types::{LabelFilter, LabelToken, Memory, MemoryState};

use super::filter::{combine, label_predicate, source_predicate};

// --- blob / json codecs -----------------------------------------------

/// Pack an embedding as little-endian float32 bytes, the native storage
/// format for `memory_<D>.embedding`.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Dedup an ordered label list, preserving first-seen order (§9).
pub fn dedup_labels(labels: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for label in labels {
        if seen.insert(label.clone()) {
            out.push(label.clone());
        }
    }
    out
}

fn labels_to_json(labels: &[String]) -> String {
    serde_json::to_string(&dedup_labels(labels)).unwrap_or_else(|_| "[]".to_string())
}

fn labels_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn state_to_json(state: &MemoryState) -> String {
    serde_json::to_string(state).unwrap_or_else(|_| "{}".to_string())
}

fn state_from_json(raw: &str) -> MemoryState {
    serde_json::from_str(raw).unwrap_or_default()
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub fn memory_from_row(row: &Row) -> rusqlite::Result<Memory> {
    let content: Vec<u8> = row.get("content")?;
    let labels_raw: String = row.get("labels")?;
    let state_raw: String = row.get("state")?;
    let timestamp_raw: String = row.get("timestamp")?;

    Ok(Memory {
        id: row.get("id")?,
        content_id: row.get("content_id")?,
        content,
        enc: row.get("enc")?,
        namespace: row.get("namespace")?,
        labels: labels_from_json(&labels_raw),
        source: row.get("source")?,
        timestamp: parse_timestamp(&timestamp_raw),
        state: state_from_json(&state_raw),
    })
}

const MEMORY_COLUMNS: &str =
    "id, content_id, content, enc, namespace, labels, source, timestamp, state";

// --- embedding table management (§4.1) ---------------------------------

pub fn table_name(dims: usize) -> String {
    crate::embedding::table_name_for_dimension(dims)
}

/// `CREATE TABLE IF NOT EXISTS memory_<D> (...)`, idempotent. The ANN index
/// migration (V3->V4) re-indexes this table once it exists; freshly created
/// tables start directly on the uncapped index shape.
pub fn ensure_embedding_table(conn: &Connection, dims: usize) -> Result<String> {
    let table = table_name(dims);
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
            embedding BLOB NOT NULL,
            namespace TEXT NOT NULL,
            embedding_model TEXT NOT NULL,
            UNIQUE(memory_id, embedding_model)
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_namespace ON {table}(namespace);
        CREATE INDEX IF NOT EXISTS idx_{table}_model ON {table}(embedding_model);
        CREATE INDEX IF NOT EXISTS idx_{table}_memory_id ON {table}(memory_id);"
    ))?;
    Ok(table)
}

fn embedding_table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
        [table],
        |r| r.get(0),
    )?;
    Ok(exists)
}

// --- content_id allocation (§3, invariant 2) ---------------------------

fn next_content_id(conn: &Connection, namespace: &str) -> Result<i64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(content_id) FROM memories WHERE namespace = ?1",
        [namespace],
        |r| r.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}

// --- store_memory --------------------------------------------------------

pub struct NewMemory<'a> {
    pub namespace: &'a str,
    pub content: &'a [u8],
    pub enc: bool,
    pub labels: &'a [String],
    pub source: Option<&'a str>,
    pub embedding_table: &'a str,
    pub embedding_model: &'a str,
    pub embedding: &'a [f32],
}

/// Insert the memory row and its embedding row in one transaction,
/// allocating `content_id` and populating `state.embedding_tables`.
pub fn insert_memory(conn: &Connection, input: &NewMemory) -> Result<Memory> {
    let content_id = next_content_id(conn, input.namespace)?;
    let timestamp = Utc::now();
    let labels_json = labels_to_json(input.labels);

    let mut tables: HashMap<String, Vec<String>> = HashMap::new();
    tables.insert(
        input.embedding_table.to_string(),
        vec![input.embedding_model.to_string()],
    );
    let state = MemoryState {
        embedding_tables: tables,
    };
    let state_json = state_to_json(&state);

    conn.execute(
        "INSERT INTO memories (content_id, content, enc, namespace, labels, source, timestamp, state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            content_id,
            input.content,
            input.enc as i64,
            input.namespace,
            labels_json,
            input.source,
            timestamp.to_rfc3339(),
            state_json,
        ],
    )?;
    let id = conn.last_insert_rowid();

    conn.execute(
        &format!(
            "INSERT INTO {} (memory_id, embedding, namespace, embedding_model) VALUES (?1, ?2, ?3, ?4)",
            input.embedding_table
        ),
        params![
            id,
            encode_embedding(input.embedding),
            input.namespace,
            input.embedding_model,
        ],
    )?;

    Ok(Memory {
        id,
        content_id,
        content: input.content.to_vec(),
        enc: input.enc,
        namespace: input.namespace.to_string(),
        labels: dedup_labels(input.labels),
        source: input.source.map(str::to_string),
        timestamp,
        state,
    })
}

/// Cosine similarity against every existing `(namespace, embedding_model)`
/// row in `embedding_table`, sorted descending, for duplicate detection.
/// Only `limit` best matches are returned (§4.5 probes up to two).
pub fn nearest_existing(
    conn: &Connection,
    embedding_table: &str,
    namespace: &str,
    embedding_model: &str,
    query: &[f32],
    limit: usize,
) -> Result<Vec<(i64, f32)>> {
    if !embedding_table_exists(conn, embedding_table)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT memory_id, embedding FROM {embedding_table} WHERE namespace = ?1 AND embedding_model = ?2"
    ))?;
    let rows: Vec<(i64, Vec<u8>)> = stmt
        .query_map(params![namespace, embedding_model], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut scored: Vec<(i64, f32)> = rows
        .into_iter()
        .map(|(id, blob)| (id, cosine_similarity(query, &decode_embedding(&blob))))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    Ok(scored)
}

// --- lookups and ID resolution (§4.5) ------------------------------------

pub fn get_memory_by_id(conn: &Connection, id: i64) -> Result<Memory> {
    conn.query_row(
        &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
        [id],
        memory_from_row,
    )
    .optional()?
    .ok_or_else(|| MemoryError::NotFound(format!("memory {id} not found")))
}

pub fn get_memory_by_content_id(conn: &Connection, namespace: &str, content_id: i64) -> Result<Memory> {
    conn.query_row(
        &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE namespace = ?1 AND content_id = ?2"),
        params![namespace, content_id],
        memory_from_row,
    )
    .optional()?
    .ok_or_else(|| MemoryError::NotFound(format!("memory {content_id} not found in namespace {namespace}")))
}

/// Resolve a client-facing ID to the internal `id` (§4.5's "ID semantics").
/// When `namespace` is empty (wildcard), the client-facing ID already is
/// the internal ID.
pub fn resolve_client_id(conn: &Connection, namespace: &str, client_id: i64) -> Result<i64> {
    if namespace.trim().is_empty() {
        get_memory_by_id(conn, client_id)?;
        Ok(client_id)
    } else {
        Ok(get_memory_by_content_id(conn, namespace, client_id)?.id)
    }
}

/// The ID a client should see for a stored/loaded memory, per namespace mode.
pub fn client_facing_id(namespace: &str, memory: &Memory) -> i64 {
    if namespace.trim().is_empty() {
        memory.id
    } else {
        memory.content_id
    }
}

// --- retrieve_memories / random_memory / memory_stats --------------------

fn namespace_clause(namespace: &str) -> (&'static str, Option<String>) {
    if namespace.trim().is_empty() {
        ("1=1", None)
    } else {
        ("m.namespace = ?", Some(namespace.to_string()))
    }
}

fn bind_params(ns: &Option<String>, filter_params: &[String]) -> Vec<Box<dyn rusqlite::ToSql>> {
    let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(ns) = ns {
        bind.push(Box::new(ns.clone()));
    }
    for p in filter_params {
        bind.push(Box::new(p.clone()));
    }
    bind
}

/// Direct (non-semantic) listing ordered by timestamp descending (§4.5).
pub fn list_recent(
    conn: &Connection,
    namespace: &str,
    labels: &LabelFilter,
    source: &str,
    limit: usize,
) -> Result<Vec<Memory>> {
    let (ns_sql, ns_param) = namespace_clause(namespace);
    let filter = combine(label_predicate(labels, "m"), source_predicate(source, "m"));

    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m WHERE {ns_sql} AND {} ORDER BY m.timestamp DESC LIMIT ?",
        filter.sql
    );
    let mut stmt = conn.prepare(&sql)?;

    let mut bind = bind_params(&ns_param, &filter.params);
    bind.push(Box::new(limit as i64));

    let refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(refs.as_slice(), memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// A semantic-search match: the memory plus its cosine similarity as an
/// integer percentage (0-100).
pub struct SemanticMatch {
    pub memory: Memory,
    pub similarity_pct: i32,
}

/// Join `memories` with `memory_<D>`, filter, and rank by cosine similarity
/// descending then timestamp descending (§4.5).
pub fn semantic_search(
    conn: &Connection,
    embedding_table: &str,
    embedding_model: &str,
    namespace: &str,
    labels: &LabelFilter,
    source: &str,
    query_embedding: &[f32],
    limit: usize,
) -> Result<Vec<SemanticMatch>> {
    if !embedding_table_exists(conn, embedding_table)? {
        return Ok(Vec::new());
    }

    let (ns_sql, ns_param) = namespace_clause(namespace);
    let filter = combine(label_predicate(labels, "m"), source_predicate(source, "m"));

    let sql = format!(
        "SELECT {MEMORY_COLUMNS}, e.embedding as emb
         FROM memories m JOIN {embedding_table} e ON e.memory_id = m.id
         WHERE {ns_sql} AND e.embedding_model = ? AND {}
         ORDER BY m.timestamp DESC",
        filter.sql
    );
    let mut stmt = conn.prepare(&sql)?;

    let mut bind = bind_params(&ns_param, &[]);
    bind.push(Box::new(embedding_model.to_string()));
    for p in &filter.params {
        bind.push(Box::new(p.clone()));
    }

    let refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let mut rows = stmt.query(refs.as_slice())?;

    let mut scored: Vec<(Memory, f32)> = Vec::new();
    while let Some(row) = rows.next()? {
        let memory = memory_from_row(row)?;
        let emb: Vec<u8> = row.get("emb")?;
        let similarity = cosine_similarity(query_embedding, &decode_embedding(&emb));
        scored.push((memory, similarity));
    }

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.0.timestamp.cmp(&a.0.timestamp))
    });
    scored.truncate(limit);

    Ok(scored
        .into_iter()
        .map(|(memory, sim)| SemanticMatch {
            memory,
            similarity_pct: (sim * 100.0).round() as i32,
        })
        .collect())
}

/// Oversampling listing used by `random_memory`/encrypted listings to
/// absorb decryption failures (§4.5).
pub fn random_candidates(
    conn: &Connection,
    namespace: &str,
    labels: &LabelFilter,
    source: &str,
    oversample: usize,
) -> Result<Vec<Memory>> {
    let (ns_sql, ns_param) = namespace_clause(namespace);
    let filter = combine(label_predicate(labels, "m"), source_predicate(source, "m"));

    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m WHERE {ns_sql} AND {} ORDER BY RANDOM() LIMIT ?",
        filter.sql
    );
    let mut stmt = conn.prepare(&sql)?;

    let mut bind = bind_params(&ns_param, &filter.params);
    bind.push(Box::new(oversample as i64));

    let refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(refs.as_slice(), memory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub struct MemoryStatsCounts {
    pub matching: i64,
    pub total: i64,
    pub labels_matched: Vec<String>,
    pub sources_matched: Vec<String>,
}

pub fn count_total(conn: &Connection, namespace: &str) -> Result<i64> {
    let (ns_sql, ns_param) = namespace_clause(namespace);
    let sql = format!("SELECT COUNT(*) FROM memories m WHERE {ns_sql}");
    let count = match ns_param {
        Some(ns) => conn.query_row(&sql, [ns], |r| r.get(0))?,
        None => conn.query_row(&sql, [], |r| r.get(0))?,
    };
    Ok(count)
}

fn distinct_matching_labels(
    conn: &Connection,
    namespace: &str,
    labels: &LabelFilter,
) -> Result<Vec<String>> {
    if labels.include.is_empty() {
        return Ok(Vec::new());
    }
    let (ns_sql, ns_param) = namespace_clause(namespace);
    let include_only = LabelFilter {
        include: labels.include.clone(),
        exclude: Vec::new(),
    };
    let clause = label_predicate(&include_only, "m");
    let sql = format!(
        "SELECT DISTINCT je.value FROM memories m, json_each(m.labels) je WHERE {ns_sql} AND {}",
        clause.sql
    );
    let bind = bind_params(&ns_param, &clause.params);
    let refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let mut matched: Vec<String> = stmt
        .query_map(refs.as_slice(), |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    matched.sort();
    matched.dedup();
    Ok(matched)
}

fn distinct_matching_sources(conn: &Connection, namespace: &str, source: &str) -> Result<Vec<String>> {
    let trimmed = source.trim();
    if trimmed.is_empty() || trimmed.starts_with('!') {
        return Ok(Vec::new());
    }
    let (ns_sql, ns_param) = namespace_clause(namespace);
    let clause = source_predicate(source, "m");
    let sql = format!(
        "SELECT DISTINCT m.source FROM memories m WHERE {ns_sql} AND {} AND m.source IS NOT NULL",
        clause.sql
    );
    let bind = bind_params(&ns_param, &clause.params);
    let refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let matched = stmt
        .query_map(refs.as_slice(), |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(matched)
}

/// Counts plus matched-label/matched-source bookkeeping for `memory_stats`.
pub fn stats_with_filters(
    conn: &Connection,
    namespace: &str,
    labels: &LabelFilter,
    source: &str,
) -> Result<MemoryStatsCounts> {
    let total = count_total(conn, namespace)?;

    let (ns_sql, ns_param) = namespace_clause(namespace);
    let filter = combine(label_predicate(labels, "m"), source_predicate(source, "m"));
    let count_sql = format!("SELECT COUNT(*) FROM memories m WHERE {ns_sql} AND {}", filter.sql);
    let bind = bind_params(&ns_param, &filter.params);
    let refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let matching: i64 = conn.query_row(&count_sql, refs.as_slice(), |r| r.get(0))?;

    let labels_matched = distinct_matching_labels(conn, namespace, labels)?;
    let sources_matched = distinct_matching_sources(conn, namespace, source)?;

    Ok(MemoryStatsCounts {
        matching,
        total,
        labels_matched,
        sources_matched,
    })
}

// --- add_labels / del_labels ----------------------------------------------

pub fn write_labels(conn: &Connection, id: i64, labels: &[String]) -> Result<()> {
    conn.execute(
        "UPDATE memories SET labels = ?1 WHERE id = ?2",
        params![labels_to_json(labels), id],
    )?;
    Ok(())
}

/// Append new labels, preserving order, dropping exact duplicates (§4.5).
pub fn merge_labels(existing: &[String], additions: &[String]) -> Vec<String> {
    let mut merged = existing.to_vec();
    for label in additions {
        if !merged.contains(label) {
            merged.push(label.clone());
        }
    }
    merged
}

/// Exact case-sensitive removal; unknown labels are ignored silently (§4.5,
/// §9's note about the corrected `del_labels` semantics).
pub fn subtract_labels(existing: &[String], removals: &[String]) -> Vec<String> {
    existing
        .iter()
        .filter(|label| !removals.contains(label))
        .cloned()
        .collect()
}

// --- delete_memory ---------------------------------------------------------

/// Best-effort delete from every embedding table the memory's state lists,
/// then the memory row itself; current-dimension cascade is a safety net,
/// not the primary path (§4.5).
pub fn delete_memory(conn: &Connection, memory: &Memory) -> Result<()> {
    for table in memory.state.embedding_tables.keys() {
        if embedding_table_exists(conn, table).unwrap_or(false) {
            let _ = conn.execute(&format!("DELETE FROM {table} WHERE memory_id = ?1"), [memory.id]);
        }
    }
    conn.execute("DELETE FROM memories WHERE id = ?1", [memory.id])?;
    Ok(())
}

// --- label_tokens (trending labels feeding path, §4.6) ---------------------

/// Tokenize `labels` and batch-upsert counts. Called fire-and-forget after
/// `store_memory`/`add_labels` commit (§4.6, §9).
pub fn upsert_label_tokens(conn: &Connection, namespace: &str, labels: &[String]) -> Result<()> {
    let counts = crate::trending::tokenize_labels(labels);
    let now = Utc::now().to_rfc3339();
    for (token, delta) in counts {
        conn.execute(
            "INSERT INTO label_tokens (namespace, token, count, last_seen, last_decay)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(namespace, token) DO UPDATE SET
                count = count + excluded.count,
                last_seen = excluded.last_seen",
            params![namespace, token, delta, now],
        )?;
    }
    Ok(())
}

pub fn label_tokens_in_window(conn: &Connection, namespace: &str, days: i64) -> Result<Vec<LabelToken>> {
    let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
    let row_mapper = |r: &Row| -> rusqlite::Result<LabelToken> {
        let last_seen: String = r.get(3)?;
        let last_decay: String = r.get(4)?;
        Ok(LabelToken {
            namespace: r.get(0)?,
            token: r.get(1)?,
            count: r.get(2)?,
            last_seen: parse_timestamp(&last_seen),
            last_decay: parse_timestamp(&last_decay),
        })
    };

    if namespace.trim().is_empty() {
        let mut stmt = conn.prepare(
            "SELECT namespace, token, count, last_seen, last_decay FROM label_tokens WHERE last_seen >= ?1",
        )?;
        let rows = stmt
            .query_map(params![cutoff], row_mapper)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    } else {
        let mut stmt = conn.prepare(
            "SELECT namespace, token, count, last_seen, last_decay FROM label_tokens WHERE last_seen >= ?1 AND namespace = ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, namespace], row_mapper)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

pub fn all_memory_labels(conn: &Connection, namespace: &str) -> Result<Vec<(i64, Vec<String>)>> {
    let (ns_sql, ns_param) = namespace_clause(namespace);
    let sql = format!("SELECT m.id, m.labels FROM memories m WHERE {ns_sql}");
    let mut stmt = conn.prepare(&sql)?;
    let mapper = |r: &Row| -> rusqlite::Result<(i64, Vec<String>)> {
        let raw: String = r.get(1)?;
        Ok((r.get(0)?, labels_from_json(&raw)))
    };
    let rows = match ns_param {
        Some(ns) => stmt.query_map([ns], mapper)?.collect::<rusqlite::Result<Vec<_>>>()?,
        None => stmt.query_map([], mapper)?.collect::<rusqlite::Result<Vec<_>>>()?,
    };
    Ok(rows)
}

// --- system_state key-value store (§3, §6) ---------------------------------

pub fn kv_get(conn: &Connection, key: &str) -> Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM system_state WHERE key = ?1", [key], |r| r.get(0))
        .optional()?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn kv_set(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO system_state (key, value, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, raw, now],
    )?;
    Ok(())
}

pub fn kv_delete(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM system_state WHERE key = ?1", [key])?;
    Ok(())
}

/// Every `(key, value)` pair whose key starts with `prefix`, e.g. `oauth:access_token:`.
pub fn kv_scan_prefix(conn: &Connection, prefix: &str) -> Result<Vec<(String, serde_json::Value)>> {
    let like = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
    let mut stmt = conn.prepare("SELECT key, value FROM system_state WHERE key LIKE ?1 ESCAPE '\\'")?;
    let rows = stmt
        .query_map([like], |r| {
            let key: String = r.get(0)?;
            let raw: String = r.get(1)?;
            Ok((key, raw))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows
        .into_iter()
        .filter_map(|(k, v)| serde_json::from_str(&v).ok().map(|v| (k, v)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn setup() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    fn new_memory(embedding: &[f32]) -> NewMemory<'_> {
        NewMemory {
            namespace: "default",
            content: b"hello world",
            enc: false,
            labels: &[],
            source: None,
            embedding_table: "memory_3",
            embedding_model: "test-model",
            embedding,
        }
    }

    #[test]
    fn insert_allocates_sequential_content_ids() {
        let storage = setup();
        storage
            .with_transaction(|conn| {
                ensure_embedding_table(conn, 3)?;
                let a = insert_memory(conn, &new_memory(&[1.0, 0.0, 0.0]))?;
                let b = insert_memory(conn, &new_memory(&[0.0, 1.0, 0.0]))?;
                assert_eq!(a.content_id, 1);
                assert_eq!(b.content_id, 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_memory_removes_embedding_rows() {
        let storage = setup();
        storage
            .with_transaction(|conn| {
                ensure_embedding_table(conn, 3)?;
                let m = insert_memory(conn, &new_memory(&[1.0, 0.0, 0.0]))?;
                delete_memory(conn, &m)?;
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM memory_3 WHERE memory_id = ?1", [m.id], |r| r.get(0))?;
                assert_eq!(count, 0);
                let remaining: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
                assert_eq!(remaining, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn label_merge_and_subtract() {
        let existing = vec!["a".to_string(), "b".to_string()];
        let merged = merge_labels(&existing, &["b".to_string(), "c".to_string()]);
        assert_eq!(merged, vec!["a", "b", "c"]);

        let remaining = subtract_labels(&merged, &["b".to_string()]);
        assert_eq!(remaining, vec!["a", "c"]);
    }

    #[test]
    fn nearest_existing_ranks_by_similarity() {
        let storage = setup();
        storage
            .with_transaction(|conn| {
                ensure_embedding_table(conn, 3)?;
                insert_memory(conn, &new_memory(&[1.0, 0.0, 0.0]))?;
                insert_memory(conn, &new_memory(&[0.0, 1.0, 0.0]))?;
                let top = nearest_existing(conn, "memory_3", "default", "test-model", &[1.0, 0.0, 0.0], 2)?;
                assert_eq!(top.len(), 2);
                assert!((top[0].1 - 1.0).abs() < 0.001);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn kv_roundtrip() {
        let storage = setup();
        storage
            .with_connection(|conn| {
                kv_set(conn, "db_version", &serde_json::json!(7))?;
                assert_eq!(kv_get(conn, "db_version")?, Some(serde_json::json!(7)));
                kv_delete(conn, "db_version")?;
                assert_eq!(kv_get(conn, "db_version")?, None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn kv_scan_prefix_filters_by_key() {
        let storage = setup();
        storage
            .with_connection(|conn| {
                kv_set(conn, "oauth:client:a", &serde_json::json!({"x": 1}))?;
                kv_set(conn, "oauth:client:b", &serde_json::json!({"x": 2}))?;
                kv_set(conn, "db_version", &serde_json::json!(7))?;
                let scanned = kv_scan_prefix(conn, "oauth:client:")?;
                assert_eq!(scanned.len(), 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn namespace_scoped_ids_are_isolated() {
        let storage = setup();
        storage
            .with_transaction(|conn| {
                ensure_embedding_table(conn, 3)?;
                let mut alice = new_memory(&[1.0, 0.0, 0.0]);
                alice.namespace = "alice";
                let mut bob = new_memory(&[1.0, 0.0, 0.0]);
                bob.namespace = "bob";
                let a = insert_memory(conn, &alice)?;
                let b = insert_memory(conn, &bob)?;
                assert_eq!(a.content_id, 1);
                assert_eq!(b.content_id, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn stats_reports_matched_labels_and_sources() {
        let storage = setup();
        storage
            .with_transaction(|conn| {
                ensure_embedding_table(conn, 3)?;
                let labels = vec!["beer".to_string(), "ale".to_string()];
                let mut m = new_memory(&[1.0, 0.0, 0.0]);
                m.labels = &labels;
                m.source = Some("brewday");
                insert_memory(conn, &m)?;

                let filter = LabelFilter::parse("beer");
                let stats = stats_with_filters(conn, "default", &filter, "brew")?;
                assert_eq!(stats.total, 1);
                assert_eq!(stats.matching, 1);
                assert_eq!(stats.labels_matched, vec!["beer".to_string()]);
                assert_eq!(stats.sources_matched, vec!["brewday".to_string()]);
                Ok(())
            })
            .unwrap();
    }
}
