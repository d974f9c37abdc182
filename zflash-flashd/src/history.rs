//! Attempt history, persisted to SQLite.
//!
//! One append-only table, one row per terminal flash attempt. Rows are
//! never updated after insertion, so every write is an independent,
//! immediately-committed insert and no cross-record transactions exist.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// History store errors.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV export error: {0}")]
    Csv(#[from] csv::Error),
}

/// Terminal status of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Success,
    Fail,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Fail => "fail",
        }
    }
}

/// A record to be appended.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub port: String,
    pub status: AttemptStatus,
    pub mac: Option<String>,
    pub chip_type: Option<String>,
    pub duration_secs: f64,
    pub firmware: Option<String>,
    pub log_path: Option<String>,
    pub error_msg: Option<String>,
}

/// A persisted attempt record.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub id: i64,
    pub timestamp: String,
    pub port: String,
    pub mac: Option<String>,
    pub chip_type: Option<String>,
    pub status: String,
    pub duration: Option<f64>,
    pub firmware: Option<String>,
    pub log_path: Option<String>,
    pub error_msg: Option<String>,
}

/// Aggregate counts over the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statistics {
    pub success: u64,
    pub fail: u64,
    pub total: u64,
}

const COLUMNS: [&str; 10] = [
    "id",
    "timestamp",
    "port",
    "mac",
    "chip_type",
    "status",
    "duration",
    "firmware",
    "log_path",
    "error_msg",
];

/// SQLite-backed attempt history.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Open (creating if necessary) the history database at `path`.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    /// In-memory store; used by tests.
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS flash_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                port TEXT NOT NULL,
                mac TEXT,
                chip_type TEXT,
                status TEXT NOT NULL,
                duration REAL,
                firmware TEXT,
                log_path TEXT,
                error_msg TEXT
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one attempt record, returning its row id.
    pub fn add_record(&self, record: &NewRecord) -> Result<i64, HistoryError> {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO flash_history
             (timestamp, port, mac, chip_type, status, duration, firmware, log_path, error_msg)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                timestamp,
                record.port,
                record.mac,
                record.chip_type,
                record.status.as_str(),
                record.duration_secs,
                record.firmware,
                record.log_path,
                record.error_msg,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, port, mac, chip_type, status, duration,
                    firmware, log_path, error_msg
             FROM flash_history
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Aggregate counts, over all records or those at/after `since`.
    pub fn statistics(&self, since: Option<OffsetDateTime>) -> Result<Statistics, HistoryError> {
        let conn = self.conn.lock().unwrap();

        let mut stats = Statistics::default();
        let mut tally = |status: String, count: u64| {
            match status.as_str() {
                "success" => stats.success = count,
                "fail" => stats.fail = count,
                _ => {}
            }
            stats.total += count;
        };

        match since {
            Some(cutoff) => {
                let cutoff = cutoff.format(&Rfc3339).unwrap_or_default();
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM flash_history
                     WHERE timestamp >= ?1 GROUP BY status",
                )?;
                let rows = stmt.query_map([cutoff], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })?;
                for row in rows {
                    let (status, count) = row?;
                    tally(status, count);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT status, COUNT(*) FROM flash_history GROUP BY status")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })?;
                for row in rows {
                    let (status, count) = row?;
                    tally(status, count);
                }
            }
        }

        Ok(stats)
    }

    /// Export matching records as CSV with a header row.
    ///
    /// Returns the number of exported records; when nothing matches, no
    /// file is written and 0 is returned.
    pub fn export_csv(
        &self,
        path: &Path,
        since: Option<OffsetDateTime>,
    ) -> Result<usize, HistoryError> {
        let records = match since {
            Some(cutoff) => self.records_since(cutoff)?,
            None => self.all_records()?,
        };
        if records.is_empty() {
            return Ok(0);
        }

        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(COLUMNS)?;
        for record in &records {
            writer.write_record([
                record.id.to_string(),
                record.timestamp.clone(),
                record.port.clone(),
                record.mac.clone().unwrap_or_default(),
                record.chip_type.clone().unwrap_or_default(),
                record.status.clone(),
                record.duration.map(|d| d.to_string()).unwrap_or_default(),
                record.firmware.clone().unwrap_or_default(),
                record.log_path.clone().unwrap_or_default(),
                record.error_msg.clone().unwrap_or_default(),
            ])?;
        }
        writer.flush()?;
        Ok(records.len())
    }

    /// Delete all records. Idempotent.
    pub fn reset(&self) -> Result<(), HistoryError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM flash_history", [])?;
        Ok(())
    }

    fn all_records(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, port, mac, chip_type, status, duration,
                    firmware, log_path, error_msg
             FROM flash_history
             ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn records_since(&self, cutoff: OffsetDateTime) -> Result<Vec<HistoryRecord>, HistoryError> {
        let cutoff = cutoff.format(&Rfc3339).unwrap_or_default();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, port, mac, chip_type, status, duration,
                    firmware, log_path, error_msg
             FROM flash_history
             WHERE timestamp >= ?1
             ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map([cutoff], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        port: row.get(2)?,
        mac: row.get(3)?,
        chip_type: row.get(4)?,
        status: row.get(5)?,
        duration: row.get(6)?,
        firmware: row.get(7)?,
        log_path: row.get(8)?,
        error_msg: row.get(9)?,
    })
}
