//! Versioned schema evolution, gated by a cross-process lock (§4.2).
//!
//! SQLite has no `pg_try_advisory_lock` equivalent, so the lock is emulated
//! with a sentinel row whose primary key collides under concurrent INSERTs:
//! the engine enforces that collision atomically regardless of journal mode,
//! which is the property an advisory lock needs here. See DESIGN.md for why
//! this was chosen over a held `BEGIN IMMEDIATE` transaction (which would
//! serialize with the migration writes themselves, not just with other
//! processes).

use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::Result;

pub const SCHEMA_VERSION: i32 = 7;

/// Bring `conn`'s database to [`SCHEMA_VERSION`]. No-op if another process
/// currently holds the migration lock.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    ensure_lock_table(conn)?;
    if !try_acquire_lock(conn)? {
        tracing::info!("migration lock held by another process, skipping");
        return Ok(());
    }

    let result = run_migrations_locked(conn);
    release_lock(conn);
    result
}

fn ensure_lock_table(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS migration_lock (id INTEGER PRIMARY KEY);")?;
    Ok(())
}

fn try_acquire_lock(conn: &Connection) -> Result<bool> {
    match conn.execute("INSERT INTO migration_lock (id) VALUES (123456789)", []) {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn release_lock(conn: &Connection) {
    if let Err(e) = conn.execute("DELETE FROM migration_lock WHERE id = 123456789", []) {
        tracing::warn!(error = %e, "failed to release migration lock");
    }
}

fn run_migrations_locked(conn: &Connection) -> Result<()> {
    let current = detect_version(conn)?;
    tracing::info!(current_version = current, target_version = SCHEMA_VERSION, "running migrations");

    if current == 0 {
        create_fresh_schema(conn)?;
        tracing::info!("fresh install, schema created directly at target version");
        return Ok(());
    }

    let mut version = current;
    if version < 2 {
        migrate_v1_to_v2(conn)?;
        version = 2;
        tracing::info!("migrated to v2");
    }
    if version < 3 {
        migrate_v2_to_v3(conn)?;
        version = 3;
        tracing::info!("migrated to v3");
    }
    if version < 4 {
        migrate_v3_to_v4(conn)?;
        version = 4;
        tracing::info!("migrated to v4");
    }
    if version < 5 {
        migrate_v4_to_v5(conn)?;
        version = 5;
        tracing::info!("migrated to v5");
    }
    if version < 6 {
        migrate_v5_to_v6(conn)?;
        version = 6;
        tracing::info!("migrated to v6");
    }
    if version < 7 {
        migrate_v6_to_v7(conn)?;
        version = 7;
        tracing::info!("migrated to v7");
    }

    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
        [name],
        |r| r.get(0),
    )?;
    Ok(exists)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn legacy_memory_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'memory\\_%' ESCAPE '\\'",
    )?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Detect the schema version of an existing database, or `0` for a fresh
/// install (step 2 of the protocol).
fn detect_version(conn: &Connection) -> Result<i32> {
    if !table_exists(conn, "system_state")? {
        if !legacy_memory_tables(conn)?.is_empty() {
            return Ok(1);
        }
        return Ok(0);
    }

    if column_exists(conn, "system_state", "key")? {
        let value: String = conn.query_row(
            "SELECT value FROM system_state WHERE key = 'db_version'",
            [],
            |r| r.get(0),
        )?;
        Ok(value.parse().unwrap_or(SCHEMA_VERSION))
    } else {
        let version: i64 =
            conn.query_row("SELECT db_version FROM system_state WHERE id = 1", [], |r| r.get(0))?;
        Ok(version as i32)
    }
}

fn create_fresh_schema(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        r#"
        CREATE TABLE system_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE memories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_id INTEGER NOT NULL,
            content BLOB NOT NULL,
            enc INTEGER NOT NULL DEFAULT 0,
            namespace TEXT NOT NULL DEFAULT 'default',
            labels TEXT NOT NULL DEFAULT '[]',
            source TEXT,
            timestamp TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX idx_memories_namespace ON memories(namespace);
        CREATE INDEX idx_memories_source ON memories(source);
        CREATE INDEX idx_memories_timestamp ON memories(timestamp DESC);
        CREATE INDEX idx_memories_namespace_content_id ON memories(namespace, content_id DESC);

        CREATE TABLE label_tokens (
            namespace TEXT NOT NULL,
            token TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            last_seen TEXT NOT NULL,
            last_decay TEXT NOT NULL,
            PRIMARY KEY (namespace, token)
        );
        CREATE INDEX idx_label_tokens_namespace ON label_tokens(namespace);
        CREATE INDEX idx_label_tokens_last_seen ON label_tokens(last_seen DESC);
        "#,
    )?;
    tx.execute(
        "INSERT INTO system_state (key, value, created_at, updated_at) VALUES ('db_version', '7', datetime('now'), datetime('now'))",
        [],
    )?;
    tx.commit()?;
    Ok(())
}

fn set_legacy_version(tx: &Connection, version: i32) -> Result<()> {
    tx.execute(
        "INSERT INTO system_state (id, db_version, updated_at) VALUES (1, ?1, datetime('now')) \
         ON CONFLICT(id) DO UPDATE SET db_version = excluded.db_version, updated_at = excluded.updated_at",
        [version],
    )?;
    Ok(())
}

fn set_kv_version(tx: &Connection, version: i32) -> Result<()> {
    tx.execute(
        "INSERT INTO system_state (key, value, created_at, updated_at) VALUES ('db_version', ?1, datetime('now'), datetime('now')) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        [version.to_string()],
    )?;
    Ok(())
}

/// Split the single mixed content+embedding table(s) into `memories` plus
/// one embedding-only `memory_<D>` table per dimension, deduplicating
/// content by SHA-256.
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS system_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            db_version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS memories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            enc INTEGER NOT NULL DEFAULT 0,
            namespace TEXT NOT NULL DEFAULT 'default',
            labels TEXT NOT NULL DEFAULT '[]',
            source TEXT,
            timestamp TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT '{}'
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_content_hash ON memories(content_hash);
        CREATE INDEX IF NOT EXISTS idx_memories_namespace ON memories(namespace);
        CREATE INDEX IF NOT EXISTS idx_memories_source ON memories(source);
        CREATE INDEX IF NOT EXISTS idx_memories_timestamp ON memories(timestamp DESC);
        "#,
    )?;

    let legacy_tables = legacy_memory_tables(&tx)?
        .into_iter()
        .filter(|t| t != "memories")
        .collect::<Vec<_>>();

    for table in &legacy_tables {
        migrate_legacy_table(&tx, table)?;
    }

    set_legacy_version(&tx, 2)?;
    tx.commit()?;
    Ok(())
}

fn migrate_legacy_table(tx: &Connection, table: &str) -> Result<()> {
    let new_name = format!("{table}__v2");
    tx.execute_batch(&format!(
        "CREATE TABLE {new_name} (
            memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
            embedding BLOB NOT NULL,
            namespace TEXT NOT NULL,
            embedding_model TEXT NOT NULL,
            UNIQUE(memory_id, embedding_model)
        );
        CREATE INDEX idx_{table}_namespace ON {new_name}(namespace);
        CREATE INDEX idx_{table}_model ON {new_name}(embedding_model);
        CREATE INDEX idx_{table}_memory_id ON {new_name}(memory_id);"
    ))?;

    let rows: Vec<(Vec<u8>, Vec<u8>, String, String, Option<String>, String)> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT content, embedding, namespace, labels, source, timestamp FROM {table}"
        ))?;
        let result = stmt.query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
        })?
        .collect::<rusqlite::Result<_>>()?;
        result
    };

    for (content, embedding, namespace, labels, source, timestamp) in rows {
        let hash = hex::encode(Sha256::digest(&content));
        let existing: Option<i64> = tx
            .query_row("SELECT id FROM memories WHERE content_hash = ?1", [&hash], |r| r.get(0))
            .optional()?;

        let memory_id = match existing {
            Some(id) => id,
            None => {
                let state = serde_json::json!({ "embedding_tables": [table] }).to_string();
                tx.execute(
                    "INSERT INTO memories (content, content_hash, enc, namespace, labels, source, timestamp, state) \
                     VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![content, hash, namespace, labels, source, timestamp, state],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.execute(
            &format!(
                "INSERT OR IGNORE INTO {new_name} (memory_id, embedding, namespace, embedding_model) \
                 VALUES (?1, ?2, ?3, 'legacy')"
            ),
            rusqlite::params![memory_id, embedding, namespace],
        )?;
    }

    tx.execute_batch(&format!("DROP TABLE {table}; ALTER TABLE {new_name} RENAME TO {table};"))?;
    Ok(())
}

/// Rewrite `state.embedding_tables` from a list of table names into a
/// mapping from table name to the list of models populated in it.
fn migrate_v2_to_v3(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    let rows: Vec<(i64, String)> = {
        let mut stmt = tx.prepare("SELECT id, state FROM memories")?;
        let result = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        result
    };

    for (id, state_json) in rows {
        let state: serde_json::Value =
            serde_json::from_str(&state_json).unwrap_or_else(|_| serde_json::json!({}));
        let tables: Vec<String> = state
            .get("embedding_tables")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        let mut mapping = serde_json::Map::new();
        for table in &tables {
            let models: Vec<String> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT DISTINCT embedding_model FROM {table} WHERE memory_id = ?1"
                ))?;
                let result = stmt.query_map([id], |r| r.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .unwrap_or_default();
                result
            };
            mapping.insert(table.clone(), serde_json::json!(models));
        }

        let new_state = serde_json::json!({ "embedding_tables": mapping }).to_string();
        tx.execute("UPDATE memories SET state = ?1 WHERE id = ?2", rusqlite::params![new_state, id])?;
    }

    set_legacy_version(&tx, 3)?;
    tx.commit()?;
    Ok(())
}

/// `sqlite-vec`'s ANN index has no dimension cap to begin with, so this step
/// is a deliberate no-op kept to preserve the version sequence.
fn migrate_v3_to_v4(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    set_legacy_version(&tx, 4)?;
    tx.commit()?;
    Ok(())
}

/// Collapse the fixed-column `system_state` singleton into a flexible
/// key-value schema, preserving `db_version`.
fn migrate_v4_to_v5(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    let current_version: i64 =
        tx.query_row("SELECT db_version FROM system_state WHERE id = 1", [], |r| r.get(0))?;

    tx.execute_batch(
        "CREATE TABLE system_state_new (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )?;
    tx.execute(
        "INSERT INTO system_state_new (key, value, created_at, updated_at) \
         VALUES ('db_version', ?1, datetime('now'), datetime('now'))",
        [current_version.to_string()],
    )?;
    tx.execute_batch("DROP TABLE system_state; ALTER TABLE system_state_new RENAME TO system_state;")?;

    set_kv_version(&tx, 5)?;
    tx.commit()?;
    Ok(())
}

/// Add `content_id`, back-filled from `id` for pre-existing rows, plus the
/// `(namespace, content_id DESC)` index.
fn migrate_v5_to_v6(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    if !column_exists(&tx, "memories", "content_id")? {
        tx.execute_batch("ALTER TABLE memories ADD COLUMN content_id INTEGER;")?;
        tx.execute("UPDATE memories SET content_id = id WHERE content_id IS NULL", [])?;
    }
    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_memories_namespace_content_id ON memories(namespace, content_id DESC);",
    )?;

    set_kv_version(&tx, 6)?;
    tx.commit()?;
    Ok(())
}

/// Create `label_tokens` and its indexes.
fn migrate_v6_to_v7(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS label_tokens (
            namespace TEXT NOT NULL,
            token TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            last_seen TEXT NOT NULL,
            last_decay TEXT NOT NULL,
            PRIMARY KEY (namespace, token)
        );
        CREATE INDEX IF NOT EXISTS idx_label_tokens_namespace ON label_tokens(namespace);
        CREATE INDEX IF NOT EXISTS idx_label_tokens_last_seen ON label_tokens(last_seen DESC);",
    )?;

    set_kv_version(&tx, 7)?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_install_reaches_target_version() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let version: String = conn
            .query_row("SELECT value FROM system_state WHERE key='db_version'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, "7");
        assert!(table_exists(&conn, "label_tokens").unwrap());
        assert!(column_exists(&conn, "memories", "content_id").unwrap());
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let version: String = conn
            .query_row("SELECT value FROM system_state WHERE key='db_version'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, "7");
    }

    #[test]
    fn legacy_pre_v2_database_migrates_forward() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE memory_4 (
                id INTEGER PRIMARY KEY,
                content BLOB NOT NULL,
                embedding BLOB NOT NULL,
                namespace TEXT NOT NULL,
                labels TEXT NOT NULL,
                source TEXT,
                timestamp TEXT NOT NULL
            );
            INSERT INTO memory_4 (content, embedding, namespace, labels, source, timestamp)
            VALUES ('hello', x'00010203', 'default', '[]', NULL, '2026-01-01T00:00:00Z');",
        )
        .unwrap();

        run_migrations(&conn).unwrap();

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0)).unwrap();
        assert_eq!(total, 1);
        let embeddings: i64 = conn.query_row("SELECT COUNT(*) FROM memory_4", [], |r| r.get(0)).unwrap();
        assert_eq!(embeddings, 1);
    }

    #[test]
    fn second_lock_holder_is_skipped() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_lock_table(&conn).unwrap();
        assert!(try_acquire_lock(&conn).unwrap());
        assert!(!try_acquire_lock(&conn).unwrap());
        release_lock(&conn);
        assert!(try_acquire_lock(&conn).unwrap());
    }
}
