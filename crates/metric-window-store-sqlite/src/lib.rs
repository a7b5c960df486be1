#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use metric_window_core::{
    decode_member, encode_member, trim_bounds, StoreError, TimestampedValue, WindowResult,
    WindowStore,
};
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};

const WINDOW_MIGRATION_VERSION: i64 = 1;

const SCHEMA_WINDOW_V1: &str = r"
CREATE TABLE IF NOT EXISTS window_entries (
  entity_key TEXT NOT NULL,
  member TEXT NOT NULL,
  score INTEGER NOT NULL,
  PRIMARY KEY (entity_key, member)
);

CREATE INDEX IF NOT EXISTS idx_window_entries_key_rank
  ON window_entries(entity_key, score, member);
";

/// Window buffers kept in a local `SQLite` database.
///
/// Every append runs insert, trim and read inside one `IMMEDIATE`
/// transaction, so writers on the same database file are serialized by
/// `SQLite` itself.
pub struct SqliteWindowStore {
    conn: Mutex<Connection>,
    trim_slack: usize,
}

impl SqliteWindowStore {
    pub fn open(path: &Path, trim_slack: usize) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let store = Self {
            conn: Mutex::new(conn),
            trim_slack,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_WINDOW_V1)
            .context("failed to apply window schema")?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at)
             VALUES (?1, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
            params![WINDOW_MIGRATION_VERSION],
        )
        .context("failed to register window schema migration")?;

        Ok(())
    }

    #[must_use]
    pub fn trim_slack(&self) -> usize {
        self.trim_slack
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection lock poisoned"))
    }

    fn append_in_transaction(
        &self,
        key: &str,
        entry: TimestampedValue,
        window_size: usize,
        buffer_size: usize,
    ) -> Result<WindowResult> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start window transaction")?;

        let added = tx
            .execute(
                "INSERT OR IGNORE INTO window_entries(entity_key, member, score) VALUES (?1, ?2, ?3)",
                params![key, encode_member(entry.value, entry.timestamp), entry.timestamp],
            )
            .context("failed to insert window member")?;

        let len: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM window_entries WHERE entity_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .context("failed to count window members")?;
        let len = usize::try_from(len).with_context(|| format!("invalid buffer length: {len}"))?;

        if let Some((start, end)) = trim_bounds(len, buffer_size, self.trim_slack) {
            tx.execute(
                "DELETE FROM window_entries
                 WHERE entity_key = ?1 AND member IN (
                   SELECT member FROM window_entries
                   WHERE entity_key = ?1
                   ORDER BY score ASC, member ASC
                   LIMIT ?2 OFFSET ?3
                 )",
                params![key, to_sql_int(end - start + 1)?, to_sql_int(start)?],
            )
            .context("failed to trim window buffer")?;
        }

        let mut window = {
            let mut stmt = tx.prepare(
                "SELECT member, score FROM window_entries
                 WHERE entity_key = ?1
                 ORDER BY score DESC, member DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![key, to_sql_int(window_size)?], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut window = Vec::new();
            for row in rows {
                let (member, score) = row.context("failed to read window member")?;
                window.push(decode_member(&member, score)?);
            }
            window
        };
        window.reverse();

        tx.commit().context("failed to commit window transaction")?;

        if added != 1 {
            return Ok(WindowResult::Duplicate);
        }
        Ok(WindowResult::Window(window))
    }

    fn count(&self, key: &str) -> Result<usize> {
        let conn = self.lock()?;
        let len: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM window_entries WHERE entity_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .context("failed to count window members")?;
        usize::try_from(len).with_context(|| format!("invalid buffer length: {len}"))
    }
}

impl WindowStore for SqliteWindowStore {
    fn append(
        &self,
        key: &str,
        entry: TimestampedValue,
        window_size: usize,
        buffer_size: usize,
    ) -> std::result::Result<WindowResult, StoreError> {
        self.append_in_transaction(key, entry, window_size, buffer_size)
            .map_err(|err| classify(&err))
    }

    fn buffer_len(&self, key: &str) -> std::result::Result<usize, StoreError> {
        self.count(key).map_err(|err| classify(&err))
    }
}

/// Opens a store behind a trait object, for use as a provider factory.
pub fn connect(
    path: &Path,
    trim_slack: usize,
) -> std::result::Result<Arc<dyn WindowStore>, StoreError> {
    let store = SqliteWindowStore::open(path, trim_slack).map_err(|err| classify(&err))?;
    Ok(Arc::new(store))
}

fn to_sql_int(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("value {value} exceeds sqlite integer range"))
}

/// Maps failures onto the store taxonomy; lock contention and I/O faults
/// count as connection failures.
fn classify(err: &anyhow::Error) -> StoreError {
    if let Some(store_err) = err.downcast_ref::<StoreError>() {
        return store_err.clone();
    }

    let message = format!("{err:#}");
    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(failure, _))
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
            ) =>
        {
            StoreError::Connection(message)
        }
        _ => StoreError::Backend(message),
    }
}
