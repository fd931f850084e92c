//! Rekord persistence: a small SQLite record store holding the latest observed state of
//! every run, and the sync engine that keeps it current.

#![forbid(unsafe_code)]

mod engine;

pub use engine::{EngineConfig, RecordEngine, FINALIZER, STORED_ANNOTATION};

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use rusqlite::{ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Latest known state of one run, keyed by the resource uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub uid: [u8; 16],
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    /// `True`/`False`/`Unknown` of the `Succeeded` condition, if the run reports one.
    pub status: Option<String>,
    pub reason: String,
    pub message: String,
    pub transition_ts: Option<i64>,
    /// JSON of the full object, zstd-compressed when the feature is on.
    pub data: Vec<u8>,
    pub updated_ts: i64,
}

impl Record {
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_str(&maybe_decompress(&self.data)).context("decoding record data")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Written,
    /// Same resourceVersion as the stored row; nothing was touched.
    Unchanged,
}

pub trait RecordStore: Send + Sync {
    fn upsert(&self, rec: &Record) -> Result<Upsert>;
    fn get(&self, uid: [u8; 16]) -> Result<Option<Record>>;
    fn delete(&self, uid: [u8; 16]) -> Result<bool>;
}

/// SQLite-backed store. Synchronous; callers in async code move calls to the blocking pool.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.busy_timeout(Duration::from_millis(250)).context("setting busy timeout")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS records (
                uid              BLOB PRIMARY KEY,
                kind             TEXT NOT NULL,
                namespace        TEXT NOT NULL,
                name             TEXT NOT NULL,
                resource_version TEXT NOT NULL,
                status           TEXT,
                reason           TEXT NOT NULL,
                message          TEXT NOT NULL,
                transition_ts    INTEGER,
                data             BLOB NOT NULL,
                updated_ts       INTEGER NOT NULL
            )",
            [],
        )
        .context("creating records table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_records_ns_name ON records(namespace, name)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("record store lock poisoned"))
    }
}

impl RecordStore for SqliteStore {
    fn upsert(&self, rec: &Record) -> Result<Upsert> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let changed = db
            .execute(
                "INSERT INTO records(uid, kind, namespace, name, resource_version, status, reason, message, transition_ts, data, updated_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(uid) DO UPDATE SET
                    kind = excluded.kind,
                    namespace = excluded.namespace,
                    name = excluded.name,
                    resource_version = excluded.resource_version,
                    status = excluded.status,
                    reason = excluded.reason,
                    message = excluded.message,
                    transition_ts = excluded.transition_ts,
                    data = excluded.data,
                    updated_ts = excluded.updated_ts
                 WHERE records.resource_version IS NOT excluded.resource_version",
                rusqlite::params![
                    &rec.uid[..],
                    rec.kind,
                    rec.namespace,
                    rec.name,
                    rec.resource_version,
                    rec.status,
                    rec.reason,
                    rec.message,
                    rec.transition_ts,
                    rec.data,
                    rec.updated_ts,
                ],
            )
            .with_context(|| format!("upserting record {}/{}", rec.namespace, rec.name))?;
        histogram!("persist_upsert_ms", started.elapsed().as_secs_f64() * 1000.0);
        if changed == 0 {
            counter!("records_unchanged_total", 1u64, "kind" => rec.kind.clone());
            return Ok(Upsert::Unchanged);
        }
        counter!("records_upserted_total", 1u64, "kind" => rec.kind.clone());
        Ok(Upsert::Written)
    }

    fn get(&self, uid: [u8; 16]) -> Result<Option<Record>> {
        let db = self.conn()?;
        db.query_row(
            "SELECT kind, namespace, name, resource_version, status, reason, message, transition_ts, data, updated_ts
             FROM records WHERE uid = ?1",
            [&uid[..]],
            |row| {
                Ok(Record {
                    uid,
                    kind: row.get(0)?,
                    namespace: row.get(1)?,
                    name: row.get(2)?,
                    resource_version: row.get(3)?,
                    status: row.get(4)?,
                    reason: row.get(5)?,
                    message: row.get(6)?,
                    transition_ts: row.get(7)?,
                    data: row.get(8)?,
                    updated_ts: row.get(9)?,
                })
            },
        )
        .optional()
        .context("reading record")
    }

    fn delete(&self, uid: [u8; 16]) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute("DELETE FROM records WHERE uid = ?1", [&uid[..]]).context("deleting record")?;
        Ok(n > 0)
    }
}

/// True when the failure is SQLite reporting a locked database.
pub fn is_busy(err: &anyhow::Error) -> bool {
    err.chain().any(|c| {
        c.downcast_ref::<rusqlite::Error>()
            .and_then(|e| e.sqlite_error_code())
            .is_some_and(|code| matches!(code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked))
    })
}

/// `$HOME/.rekord/rekord.db`, or `rekord.db` in the working directory without a home.
pub fn default_db_path() -> String {
    match std::env::var_os("HOME") {
        Some(home) => std::path::PathBuf::from(home).join(".rekord").join("rekord.db").to_string_lossy().to_string(),
        None => "rekord.db".to_string(),
    }
}

pub fn now_ts() -> i64 { chrono::Utc::now().timestamp() }

pub fn maybe_compress(json: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("REKORD_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(json.as_bytes(), lvl).unwrap_or_else(|_| json.as_bytes().to_vec());
    }
    json.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}

#[cfg(test)]
pub(crate) fn temp_db() -> String {
    let f = format!("rekord-test-{}-{}.db", std::process::id(), uuid::Uuid::new_v4());
    std::env::temp_dir().join(f).to_string_lossy().to_string()
}
