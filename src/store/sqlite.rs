use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{info, warn};

use super::{KeyValueStore, OrderSample, OrderSampleSink};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS key_values (
    owner TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (owner, key)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS order_samples (
    simulation_id TEXT NOT NULL,
    sampled_at INTEGER NOT NULL,
    order_id TEXT NOT NULL,
    power_limit REAL NOT NULL,
    price REAL NOT NULL,
    PRIMARY KEY (simulation_id, order_id, sampled_at)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_order_samples_ts
    ON order_samples(simulation_id, sampled_at ASC);
"#;

/// SQLite-backed store. All access is serialized through one connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        Self::init(conn, db_path)
    }

    /// Private in-memory database, gone when the store is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if label != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!(db = %label, "key-value store initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, owner: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT value FROM key_values WHERE owner = ?1 AND key = ?2")?;
        let mut rows = stmt.query(params![owner, key])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row.get(0)?))
    }

    fn put(&self, owner: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO key_values (owner, key, value, updated_at) \
             VALUES (?1, ?2, ?3, strftime('%s', 'now')) \
             ON CONFLICT(owner, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![owner, key, value],
        )
        .with_context(|| format!("Failed to put {}/{}", owner, key))?;
        Ok(())
    }

    fn list_keys(&self, owner: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT key FROM key_values WHERE owner = ?1 ORDER BY key ASC")?;
        let keys = stmt
            .query_map([owner], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    fn delete(&self, owner: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM key_values WHERE owner = ?1 AND key = ?2",
            params![owner, key],
        )?;
        Ok(deleted > 0)
    }
}

impl OrderSampleSink for SqliteStore {
    fn record_samples(&self, samples: &[OrderSample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO order_samples \
             (simulation_id, sampled_at, order_id, power_limit, price) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for s in samples {
            stmt.execute(params![
                &s.simulation_id,
                s.sampled_at,
                &s.order_id,
                s.limit,
                s.price
            ])
            .with_context(|| format!("Failed to record sample for {}", s.order_id))?;
        }
        Ok(samples.len())
    }

    fn samples_for(&self, simulation_id: &str) -> Result<Vec<OrderSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT simulation_id, sampled_at, order_id, power_limit, price FROM order_samples \
             WHERE simulation_id = ?1 ORDER BY sampled_at ASC, order_id ASC",
        )?;
        let samples = stmt
            .query_map([simulation_id], |row| {
                Ok(OrderSample {
                    simulation_id: row.get(0)?,
                    sampled_at: row.get(1)?,
                    order_id: row.get(2)?,
                    limit: row.get(3)?,
                    price: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(samples)
    }

    fn purge_unfinished(&self, finished: &[String]) -> Result<usize> {
        let conn = self.conn.lock();
        let simulation_ids = conn
            .prepare_cached("SELECT DISTINCT simulation_id FROM order_samples")?
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut purged = 0;
        let mut stmt = conn.prepare_cached("DELETE FROM order_samples WHERE simulation_id = ?1")?;
        for simulation_id in simulation_ids.iter().filter(|id| !finished.contains(id)) {
            let removed = stmt
                .execute([simulation_id])
                .with_context(|| format!("Failed to purge samples of {}", simulation_id))?;
            info!(simulation_id = %simulation_id, removed, "purged samples of unfinished simulation");
            purged += removed;
        }
        Ok(purged)
    }
}
