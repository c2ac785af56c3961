//! Durable SQLite store for canonical readings.
//!
//! # Schema
//! - `readings`: one row per (device_id, received_at), enforced by a UNIQUE
//!   constraint. Rows are never updated by the ingestion path.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000, foreign_keys=ON.
//! PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! # Ordering
//! Readers get rows ordered by `received_at`, then `ingested_at`, then `id`.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use thiserror::Error;
use uplink_core::{CanonicalReading, NormalizedReading, canonical_timestamp};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const SELECT_COLUMNS: &str = "id, device_id, received_at, temperature_c, humidity, \
     battery_voltage, motion_counts, timestamp_degraded, ingested_at";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a single insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// A new row was written with this id.
    Inserted(i64),
    /// A row for the same (device_id, received_at) already exists; nothing
    /// was written.
    Duplicate(i64),
}

/// Filter for [`Store::range`]. Both time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadingQuery {
    pub device_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The canonical reading store.
pub struct Store {
    conn: Connection,
    /// Most recent `ingested_at` handed out; keeps the column strictly
    /// increasing across clock steps.
    last_ingested_at: Option<DateTime<Utc>>,
}

impl Store {
    /// Open (or create) the store at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates tables if needed.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let last: Option<String> =
            conn.query_row("SELECT MAX(ingested_at) FROM readings", [], |row| row.get(0))?;
        let last_ingested_at = last
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Store {
            conn,
            last_ingested_at,
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert a reading unless one with the same (device_id, received_at)
    /// already exists.
    ///
    /// The UNIQUE constraint decides; there is no separate existence check,
    /// so racing inserts of the same key produce exactly one row.
    pub fn insert(&mut self, reading: &NormalizedReading) -> StoreResult<InsertResult> {
        let received_at = reading.received_at_key();
        let ingested_at = self.next_ingested_at(Utc::now());
        let m = &reading.measurements;

        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO readings
                 (device_id, received_at, temperature_c, humidity, battery_voltage,
                  motion_counts, timestamp_degraded, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                reading.device_id,
                received_at,
                m.temperature_c,
                m.humidity,
                m.battery_voltage,
                m.motion_counts,
                reading.timestamp_degraded,
                canonical_timestamp(&ingested_at),
            ],
        )?;

        if changed == 1 {
            self.last_ingested_at = Some(ingested_at);
            return Ok(InsertResult::Inserted(self.conn.last_insert_rowid()));
        }

        let existing: i64 = self.conn.query_row(
            "SELECT id FROM readings WHERE device_id = ?1 AND received_at = ?2",
            params![reading.device_id, received_at],
            |row| row.get(0),
        )?;
        Ok(InsertResult::Duplicate(existing))
    }

    fn next_ingested_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_ingested_at {
            Some(last) if now <= last => last + Duration::nanoseconds(1),
            _ => now,
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, id: i64) -> StoreResult<Option<CanonicalReading>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM readings WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], map_reading)
            .optional()?)
    }

    /// Readings matching `query`, ascending by event time.
    pub fn range(&self, query: &ReadingQuery) -> StoreResult<Vec<CanonicalReading>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM readings
             WHERE (?1 IS NULL OR device_id = ?1)
               AND (?2 IS NULL OR received_at >= ?2)
               AND (?3 IS NULL OR received_at <= ?3)
             ORDER BY received_at ASC, ingested_at ASC, id ASC
             LIMIT ?4"
        );
        let limit = query
            .limit
            .and_then(|l| i64::try_from(l).ok())
            .unwrap_or(-1);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                query.device_id,
                query.from.as_ref().map(canonical_timestamp),
                query.to.as_ref().map(canonical_timestamp),
                limit,
            ],
            map_reading,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent reading (by event time) for one device.
    pub fn latest(&self, device_id: &str) -> StoreResult<Option<CanonicalReading>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM readings
             WHERE device_id = ?1
             ORDER BY received_at DESC, ingested_at DESC, id DESC
             LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![device_id], map_reading)
            .optional()?)
    }

    /// Most recent reading for every device, ordered by device id.
    pub fn latest_per_device(&self) -> StoreResult<Vec<CanonicalReading>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM readings r
             WHERE r.id = (
                 SELECT r2.id FROM readings r2
                 WHERE r2.device_id = r.device_id
                 ORDER BY r2.received_at DESC, r2.ingested_at DESC, r2.id DESC
                 LIMIT 1)
             ORDER BY r.device_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_reading)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> StoreResult<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> StoreResult<()> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn map_reading(row: &rusqlite::Row<'_>) -> Result<CanonicalReading, rusqlite::Error> {
    Ok(CanonicalReading {
        id: row.get(0)?,
        device_id: row.get(1)?,
        received_at: timestamp_column(row, 2)?,
        temperature_c: row.get(3)?,
        humidity: row.get(4)?,
        battery_voltage: row.get(5)?,
        motion_counts: row.get(6)?,
        timestamp_degraded: row.get(7)?,
        ingested_at: timestamp_column(row, 8)?,
    })
}

fn timestamp_column(row: &rusqlite::Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uplink_core::Measurements;

    fn reading(device: &str, minute: u32) -> NormalizedReading {
        NormalizedReading::new(
            device,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0).unwrap(),
            Measurements {
                temperature_c: Some(20.0 + f64::from(minute)),
                ..Measurements::default()
            },
        )
    }

    #[test]
    fn ingested_at_is_strictly_monotonic_when_clock_steps_back() {
        let mut store = Store::open_in_memory().unwrap();
        let future = Utc::now() + Duration::days(1);
        store.last_ingested_at = Some(future);

        let InsertResult::Inserted(id) = store.insert(&reading("d", 0)).unwrap() else {
            panic!("expected insert");
        };
        let row = store.get(id).unwrap().unwrap();
        assert_eq!(row.ingested_at, future + Duration::nanoseconds(1));
    }

    #[test]
    fn range_filters_and_limits() {
        let mut store = Store::open_in_memory().unwrap();
        for m in [30, 10, 20] {
            store.insert(&reading("a", m)).unwrap();
        }
        store.insert(&reading("b", 15)).unwrap();

        let all_a = store
            .range(&ReadingQuery {
                device_id: Some("a".to_owned()),
                ..ReadingQuery::default()
            })
            .unwrap();
        let minutes: Vec<_> = all_a
            .iter()
            .map(|r| r.temperature_c.unwrap() as u32 - 20)
            .collect();
        assert_eq!(minutes, vec![10, 20, 30]);

        let window = store
            .range(&ReadingQuery {
                from: Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap()),
                to: Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 20, 0).unwrap()),
                limit: Some(10),
                ..ReadingQuery::default()
            })
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].device_id, "b");
        assert_eq!(window[1].device_id, "a");

        let limited = store
            .range(&ReadingQuery {
                limit: Some(1),
                ..ReadingQuery::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn latest_lookups() {
        let mut store = Store::open_in_memory().unwrap();
        store.insert(&reading("a", 5)).unwrap();
        store.insert(&reading("a", 25)).unwrap();
        store.insert(&reading("a", 15)).unwrap();
        store.insert(&reading("b", 1)).unwrap();

        let latest_a = store.latest("a").unwrap().unwrap();
        assert_eq!(latest_a.temperature_c, Some(45.0));
        assert!(store.latest("zzz").unwrap().is_none());

        let per_device = store.latest_per_device().unwrap();
        assert_eq!(per_device.len(), 2);
        assert_eq!(per_device[0].device_id, "a");
        assert_eq!(per_device[0].temperature_c, Some(45.0));
        assert_eq!(per_device[1].device_id, "b");
    }
}
