use crate::app_error::{AppError, AppResult};
use crate::types::Scope;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const LATEST_SCHEMA_VERSION: i64 = 1;

pub const META_CURRENT_VERSION: &str = "current_version";
pub const META_LAST_PUSHED_VERSION: &str = "last_pushed_version";
pub const META_WALLET_ADDRESS: &str = "wallet_address";
pub const META_IDENTITY_PUSHED: &str = "identity_pushed";
pub const META_INITIALIZED_AT: &str = "initialized_at";

pub fn conversation_offset_key(client: &str, session: &str) -> String {
    format!("conversation_offset:{}:{}", client, session)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub fact_id: String,
    pub key: String,
    pub scope: Scope,
    pub value: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub source_session: Option<String>,
    pub created: String,
    pub last_confirmed: String,
    pub access_count: i64,
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactUpsert {
    pub key: String,
    pub scope: Scope,
    pub value: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub source_session: Option<String>,
    pub fact_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelete {
    pub key: String,
    pub deleted_at: String,
}

fn store_error(code: &str, message: &str, details: serde_json::Value) -> AppError {
    AppError::new(code, "store", message, false, details)
}

fn db_error(message: &str, e: &dyn std::fmt::Display) -> AppError {
    store_error(
        "MV_DB_QUERY_FAILED",
        message,
        serde_json::json!({ "error": e.to_string() }),
    )
}

pub fn open_store(db_path: &Path) -> AppResult<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            store_error(
                "MV_DB_OPEN_FAILED",
                "failed to create database parent directory",
                serde_json::json!({ "error": e.to_string(), "path": parent }),
            )
        })?;
    }

    let conn = Connection::open(db_path).map_err(|e| {
        store_error(
            "MV_DB_OPEN_FAILED",
            "failed to open sqlite database",
            serde_json::json!({ "error": e.to_string(), "path": db_path }),
        )
    })?;

    conn.pragma_update(None, "foreign_keys", "ON").map_err(|e| {
        store_error(
            "MV_DB_OPEN_FAILED",
            "failed to enable foreign_keys pragma",
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;

    apply_migrations(&conn)?;
    Ok(conn)
}

pub fn apply_migrations(conn: &Connection) -> AppResult<()> {
    let current = schema_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(store_error(
            "MV_DB_SCHEMA_INCOMPATIBLE",
            "database schema version is newer than supported",
            serde_json::json!({ "current": current, "latest": LATEST_SCHEMA_VERSION }),
        ));
    }

    if current < 1 {
        let tx = conn.unchecked_transaction().map_err(|e| {
            store_error(
                "MV_DB_MIGRATION_FAILED",
                "failed to begin migration transaction",
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;

        tx.execute_batch(include_str!("../migrations/0001_init.sql"))
            .map_err(|e| {
                store_error(
                    "MV_DB_MIGRATION_FAILED",
                    "failed to apply migration 0001",
                    serde_json::json!({ "error": e.to_string() }),
                )
            })?;

        tx.pragma_update(None, "user_version", 1i64).map_err(|e| {
            store_error(
                "MV_DB_MIGRATION_FAILED",
                "failed to set schema user_version",
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;

        tx.commit().map_err(|e| {
            store_error(
                "MV_DB_MIGRATION_FAILED",
                "failed to commit migration transaction",
                serde_json::json!({ "error": e.to_string() }),
            )
        })?;
    }

    Ok(())
}

pub fn schema_version(conn: &Connection) -> AppResult<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| {
            store_error(
                "MV_DB_SCHEMA_INCOMPATIBLE",
                "failed to read schema version",
                serde_json::json!({ "error": e.to_string() }),
            )
        })
}

fn row_to_fact(row: &Row<'_>) -> rusqlite::Result<FactRecord> {
    let scope_text: String = row.get(2)?;
    let scope = Scope::parse(&scope_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid scope: {scope_text}"),
            )),
        )
    })?;
    let tags_json: String = row.get(4)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
    })?;

    Ok(FactRecord {
        key: row.get(0)?,
        fact_id: row.get(1)?,
        scope,
        value: row.get(3)?,
        tags,
        confidence: row.get(5)?,
        source_session: row.get(6)?,
        created: row.get(7)?,
        last_confirmed: row.get(8)?,
        access_count: row.get(9)?,
        dirty: row.get::<_, i64>(10)? != 0,
    })
}

const FACT_COLUMNS: &str = "key, fact_id, scope, value, tags_json, confidence, source_session, \
                            created, last_confirmed, access_count, dirty";

fn query_facts(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> AppResult<Vec<FactRecord>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| db_error("failed preparing fact query", &e))?;
    let rows = stmt
        .query_map(args, row_to_fact)
        .map_err(|e| db_error("failed querying facts", &e))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| db_error("failed decoding fact row", &e))?);
    }
    Ok(out)
}

// Inserts or overwrites by key; either way the row comes out dirty and any
// tombstone for the key is gone, in one transaction.
pub fn upsert_fact(conn: &Connection, input: &FactUpsert, now: &str) -> AppResult<FactRecord> {
    let tags_json = serde_json::to_string(&input.tags).map_err(|e| {
        store_error(
            "MV_DB_QUERY_FAILED",
            "failed encoding fact tags",
            serde_json::json!({ "error": e.to_string(), "key": input.key }),
        )
    })?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_error("failed to begin upsert transaction", &e))?;

    let existing = tx
        .query_row(
            &format!("SELECT {FACT_COLUMNS} FROM facts WHERE key=?1"),
            [&input.key],
            row_to_fact,
        )
        .optional()
        .map_err(|e| db_error("failed reading existing fact", &e))?;

    let record = match existing {
        Some(previous) => {
            let fact_id = input.fact_id.clone().unwrap_or(previous.fact_id);
            tx.execute(
                "UPDATE facts
                 SET fact_id=?2, scope=?3, value=?4, tags_json=?5, confidence=?6,
                     source_session=?7, last_confirmed=?8, dirty=1
                 WHERE key=?1",
                params![
                    input.key,
                    fact_id,
                    input.scope.to_string(),
                    input.value,
                    tags_json,
                    input.confidence,
                    input.source_session,
                    now
                ],
            )
            .map_err(|e| db_error("failed updating fact", &e))?;
            FactRecord {
                fact_id,
                key: input.key.clone(),
                scope: input.scope.clone(),
                value: input.value.clone(),
                tags: input.tags.clone(),
                confidence: input.confidence,
                source_session: input.source_session.clone(),
                created: previous.created,
                last_confirmed: now.to_string(),
                access_count: previous.access_count,
                dirty: true,
            }
        }
        None => {
            let fact_id = input
                .fact_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            tx.execute(
                "INSERT INTO facts(key, fact_id, scope, value, tags_json, confidence,
                                   source_session, created, last_confirmed, access_count, dirty)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 0, 1)",
                params![
                    input.key,
                    fact_id,
                    input.scope.to_string(),
                    input.value,
                    tags_json,
                    input.confidence,
                    input.source_session,
                    now
                ],
            )
            .map_err(|e| db_error("failed inserting fact", &e))?;
            FactRecord {
                fact_id,
                key: input.key.clone(),
                scope: input.scope.clone(),
                value: input.value.clone(),
                tags: input.tags.clone(),
                confidence: input.confidence,
                source_session: input.source_session.clone(),
                created: now.to_string(),
                last_confirmed: now.to_string(),
                access_count: 0,
                dirty: true,
            }
        }
    };

    tx.execute("DELETE FROM pending_deletes WHERE key=?1", [&input.key])
        .map_err(|e| db_error("failed clearing tombstone on upsert", &e))?;

    tx.commit()
        .map_err(|e| db_error("failed committing upsert transaction", &e))?;
    Ok(record)
}

// Used by restore: writes the full replayed row as-is, not dirty.
pub fn insert_restored_fact(conn: &Connection, record: &FactRecord) -> AppResult<()> {
    let tags_json = serde_json::to_string(&record.tags).map_err(|e| {
        store_error(
            "MV_DB_QUERY_FAILED",
            "failed encoding fact tags",
            serde_json::json!({ "error": e.to_string(), "key": record.key }),
        )
    })?;
    conn.execute(
        "INSERT OR REPLACE INTO facts(key, fact_id, scope, value, tags_json, confidence,
                                      source_session, created, last_confirmed, access_count, dirty)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
        params![
            record.key,
            record.fact_id,
            record.scope.to_string(),
            record.value,
            tags_json,
            record.confidence,
            record.source_session,
            record.created,
            record.last_confirmed,
            record.access_count
        ],
    )
    .map_err(|e| db_error("failed writing restored fact", &e))?;
    Ok(())
}

// Returns whether the fact existed. A tombstone is created only then.
pub fn delete_fact(conn: &Connection, key: &str, now: &str) -> AppResult<bool> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_error("failed to begin delete transaction", &e))?;
    let removed = tx
        .execute("DELETE FROM facts WHERE key=?1", [key])
        .map_err(|e| db_error("failed deleting fact", &e))?;
    if removed > 0 {
        tx.execute(
            "INSERT OR REPLACE INTO pending_deletes(key, deleted_at) VALUES(?1, ?2)",
            params![key, now],
        )
        .map_err(|e| db_error("failed inserting tombstone", &e))?;
    }
    tx.commit()
        .map_err(|e| db_error("failed committing delete transaction", &e))?;
    Ok(removed > 0)
}

pub fn get_fact(conn: &Connection, key: &str) -> AppResult<Option<FactRecord>> {
    conn.query_row(
        &format!("SELECT {FACT_COLUMNS} FROM facts WHERE key=?1"),
        [key],
        row_to_fact,
    )
    .optional()
    .map_err(|e| db_error("failed reading fact", &e))
}

pub fn list_all(conn: &Connection) -> AppResult<Vec<FactRecord>> {
    query_facts(
        conn,
        &format!("SELECT {FACT_COLUMNS} FROM facts ORDER BY last_confirmed DESC, key ASC"),
        &[],
    )
}

// Project-scoped listings always include global facts.
pub fn list_by_scope(conn: &Connection, scope: &Scope) -> AppResult<Vec<FactRecord>> {
    let scope_text = scope.to_string();
    query_facts(
        conn,
        &format!(
            "SELECT {FACT_COLUMNS} FROM facts WHERE scope=?1 OR scope='global'
             ORDER BY last_confirmed DESC, key ASC"
        ),
        &[&scope_text],
    )
}

pub fn get_dirty(conn: &Connection) -> AppResult<Vec<FactRecord>> {
    query_facts(
        conn,
        &format!(
            "SELECT {FACT_COLUMNS} FROM facts WHERE dirty=1
             ORDER BY last_confirmed DESC, key ASC"
        ),
        &[],
    )
}

pub fn get_pending_deletes(conn: &Connection) -> AppResult<Vec<PendingDelete>> {
    let mut stmt = conn
        .prepare("SELECT key, deleted_at FROM pending_deletes ORDER BY key ASC")
        .map_err(|e| db_error("failed preparing tombstone query", &e))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PendingDelete {
                key: row.get(0)?,
                deleted_at: row.get(1)?,
            })
        })
        .map_err(|e| db_error("failed querying tombstones", &e))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| db_error("failed decoding tombstone row", &e))?);
    }
    Ok(out)
}

// Called only after a push has fully succeeded.
pub fn clear_dirty(conn: &Connection) -> AppResult<()> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_error("failed to begin clear_dirty transaction", &e))?;
    tx.execute("UPDATE facts SET dirty=0 WHERE dirty=1", [])
        .map_err(|e| db_error("failed clearing dirty flags", &e))?;
    tx.execute("DELETE FROM pending_deletes", [])
        .map_err(|e| db_error("failed clearing tombstones", &e))?;
    tx.commit()
        .map_err(|e| db_error("failed committing clear_dirty transaction", &e))?;
    Ok(())
}

pub fn increment_access_count(conn: &Connection, key: &str) -> AppResult<()> {
    conn.execute(
        "UPDATE facts SET access_count = access_count + 1 WHERE key=?1",
        [key],
    )
    .map_err(|e| db_error("failed incrementing access count", &e))?;
    Ok(())
}

pub fn get_meta(conn: &Connection, key: &str) -> AppResult<Option<String>> {
    conn.query_row(
        "SELECT meta_value FROM meta WHERE meta_key=?1",
        [key],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| db_error("failed reading meta", &e))
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> AppResult<()> {
    conn.execute(
        "INSERT INTO meta(meta_key, meta_value) VALUES(?1, ?2)
         ON CONFLICT(meta_key) DO UPDATE SET meta_value=excluded.meta_value",
        params![key, value],
    )
    .map_err(|e| db_error("failed writing meta", &e))?;
    Ok(())
}

// Missing entries read as zero; the cursors all start there.
pub fn meta_u64(conn: &Connection, key: &str) -> AppResult<u64> {
    match get_meta(conn, key)? {
        None => Ok(0),
        Some(value) => value.parse().map_err(|_| {
            store_error(
                "MV_DB_INTEGRITY_FAILED",
                "meta value is not a non-negative integer",
                serde_json::json!({ "key": key, "value": value }),
            )
        }),
    }
}
