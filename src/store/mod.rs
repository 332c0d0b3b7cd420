//! Delivery log store.
//!
//! An append-only SQLite table with one row per attempted send. The
//! handle is cheap to clone; all access goes through one
//! `Mutex<Connection>`, and every append is committed before it
//! returns.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Row};

mod error;

pub use error::LogStoreError;

/// Format SQLite uses for `CURRENT_TIMESTAMP`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS email_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient TEXT,
    subject TEXT,
    status TEXT,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
)";

/// Outcome recorded for a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The server accepted the message.
    Success,
    /// The attempt failed for any reason.
    Failed,
}

impl DeliveryStatus {
    /// Returns the stored text form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Success => "Success",
            DeliveryStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Success" => Ok(DeliveryStatus::Success),
            "Failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// A row of the `email_logs` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryLogEntry {
    /// Row id assigned by the store.
    pub id: i64,
    /// Recipient as given to the mailer.
    pub recipient: String,
    /// Message subject.
    pub subject: String,
    /// Outcome of the attempt.
    pub status: DeliveryStatus,
    /// UTC insert time, second precision.
    pub timestamp: NaiveDateTime,
}

impl DeliveryLogEntry {
    fn from_row(row: &Row<'_>) -> Result<Self, LogStoreError> {
        let id: i64 = row.get(0)?;
        let status: String = row.get(3)?;
        let timestamp: String = row.get(4)?;

        Ok(Self {
            id,
            recipient: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            subject: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            status: status
                .parse()
                .map_err(|reason| LogStoreError::CorruptRow { id, reason })?,
            timestamp: NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT).map_err(|e| {
                LogStoreError::CorruptRow {
                    id,
                    reason: format!("bad timestamp '{}': {}", timestamp, e),
                }
            })?,
        })
    }
}

/// Handle to the delivery log.
#[derive(Clone)]
pub struct DeliveryLogStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl fmt::Debug for DeliveryLogStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryLogStore")
            .field("open", &self.is_open())
            .finish()
    }
}

impl DeliveryLogStore {
    /// Opens (or creates) the log at the given path and ensures the
    /// table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LogStoreError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn)?;

        tracing::debug!(path = %path.display(), "Delivery log opened");
        Ok(store)
    }

    /// Opens an in-memory log for testing.
    pub fn open_in_memory() -> Result<Self, LogStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, LogStoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Creates the `email_logs` table if it does not exist.
    pub fn initialize(&self) -> Result<(), LogStoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(CREATE_TABLE)?;
            Ok(())
        })
    }

    /// Provides locked access to the open connection.
    fn with_conn<F, T>(&self, f: F) -> Result<T, LogStoreError>
    where
        F: FnOnce(&Connection) -> Result<T, LogStoreError>,
    {
        let guard = self.conn.lock().map_err(|_| LogStoreError::LockPoisoned)?;
        let conn = guard.as_ref().ok_or(LogStoreError::Closed)?;
        f(conn)
    }

    /// Records one send attempt and returns its row id.
    pub fn append(
        &self,
        recipient: &str,
        subject: &str,
        status: DeliveryStatus,
    ) -> Result<i64, LogStoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO email_logs (recipient, subject, status) VALUES (?1, ?2, ?3)",
                params![recipient, subject, status.as_str()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Returns all entries in insertion order.
    pub fn entries(&self) -> Result<Vec<DeliveryLogEntry>, LogStoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, recipient, subject, status, timestamp FROM email_logs ORDER BY id",
            )?;
            let mut rows = stmt.query([])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(DeliveryLogEntry::from_row(row)?);
            }
            Ok(entries)
        })
    }

    /// Returns the number of entries.
    pub fn count(&self) -> Result<u64, LogStoreError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM email_logs", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// Returns the number of entries with the given status.
    pub fn count_by_status(&self, status: DeliveryStatus) -> Result<u64, LogStoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM email_logs WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Returns true until [`close`](Self::close) succeeds.
    pub fn is_open(&self) -> bool {
        self.conn
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Closes the connection for every clone of this handle. Idempotent.
    pub fn close(&self) -> Result<(), LogStoreError> {
        let mut guard = self.conn.lock().map_err(|_| LogStoreError::LockPoisoned)?;
        match guard.take() {
            Some(conn) => conn.close().map_err(|(conn, e)| {
                *guard = Some(conn);
                LogStoreError::Sqlite(e)
            }),
            None => Ok(()),
        }
    }
}
