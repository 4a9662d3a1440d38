//! Ferry persistence: a local SQLite table of watermarks, one row per
//! (application, runner, resource type). Rows hold the JSON record; writes
//! replace the row, and a row that no longer decodes reads as no watermark.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use ferry_core::{ScopeKey, Watermark, WatermarkStorage};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use tracing::warn;

/// SQLite-backed watermark store. Simple, synchronous; a run touches it twice.
pub struct SqliteWatermarkStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteWatermarkStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("FERRY_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS watermarks (
                application   TEXT NOT NULL,
                runner        TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                record        TEXT NOT NULL,
                PRIMARY KEY (application, runner, resource_type)
            )",
            [],
        )
        .context("creating watermarks table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read the raw record text for a scope.
    pub fn get_raw(&self, scope: &ScopeKey) -> Result<Option<String>> {
        let db = self.lock();
        db.query_row(
            "SELECT record FROM watermarks WHERE application = ?1 AND runner = ?2 AND resource_type = ?3",
            (&scope.application, &scope.runner, scope.resource_type.as_str()),
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| format!("reading watermark for {}", scope))
    }

    /// Overwrite the raw record text for a scope (last write wins).
    pub fn put_raw(&self, scope: &ScopeKey, record: &str) -> Result<()> {
        let db = self.lock();
        db.execute(
            "INSERT INTO watermarks(application, runner, resource_type, record) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(application, runner, resource_type) DO UPDATE SET record = excluded.record",
            (&scope.application, &scope.runner, scope.resource_type.as_str(), record),
        )
        .with_context(|| format!("writing watermark for {}", scope))?;
        Ok(())
    }

    pub fn get_watermark(&self, scope: &ScopeKey) -> Result<Option<Watermark>> {
        let started = std::time::Instant::now();
        let out = self.get_raw(scope)?.and_then(|text| decode_record(scope, &text));
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    pub fn put_watermark(&self, scope: &ScopeKey, watermark: &Watermark) -> Result<()> {
        let started = std::time::Instant::now();
        let text = serde_json::to_string(watermark).context("serializing watermark")?;
        self.put_raw(scope, &text)?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }
}

/// Decode a stored record. Anything unreadable is treated as absent.
pub fn decode_record(scope: &ScopeKey, text: &str) -> Option<Watermark> {
    match serde_json::from_str::<Watermark>(text) {
        Ok(w) => Some(w),
        Err(e) => {
            counter!("persist_corrupt_total", 1u64);
            warn!(scope = %scope, error = %e, "stored watermark is unreadable; treating as absent");
            None
        }
    }
}

#[async_trait::async_trait]
impl WatermarkStorage for SqliteWatermarkStore {
    async fn get(&self, scope: &ScopeKey) -> Result<Option<Watermark>> { self.get_watermark(scope) }

    async fn put(&self, scope: &ScopeKey, watermark: Watermark) -> Result<Watermark> {
        self.put_watermark(scope, &watermark)?;
        Ok(watermark)
    }
}

fn default_db_path() -> String { db_path_in(std::env::var_os("HOME").map(PathBuf::from)) }

/// `<home>/.ferry/watermarks.db`, or `watermarks.db` in the working directory without a home.
fn db_path_in(home: Option<PathBuf>) -> String {
    let Some(home) = home else { return "watermarks.db".to_string() };
    let dir = home.join(".ferry");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(dir = %dir.display(), error = %e, "cannot create watermark directory");
    }
    dir.join("watermarks.db").to_string_lossy().into_owned()
}
