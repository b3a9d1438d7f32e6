//! atlas-store — SQLite persistence for the roster, enrolled face signatures
//! and the attendance log.
//!
//! One database file backs all three collaborator traits of `atlas-core`.
//! Student, parent and settings rows are owned by the school administration
//! system; this crate only reads them, apart from stamping the face
//! registration time when signatures are enrolled or removed.

use atlas_core::backend::{AttendanceStore, RosterStore, SignatureStore, StoreError};
use atlas_core::types::format_time;
use atlas_core::{
    AttendanceEvent, AttendanceStatus, EnrolledSignature, HistoryEntry, LateCutoff,
    RegisteredStudent, RosterEntry, Signature,
};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS parents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        full_name TEXT,
        fcm_token TEXT
    );

    CREATE TABLE IF NOT EXISTS students (
        nisn TEXT PRIMARY KEY,
        full_name TEXT NOT NULL,
        parent_id INTEGER REFERENCES parents(id),
        face_registered_at TEXT
    );

    CREATE TABLE IF NOT EXISTS system_settings (
        id INTEGER PRIMARY KEY,
        late_limit TEXT
    );

    CREATE TABLE IF NOT EXISTS face_signatures (
        signature_id TEXT PRIMARY KEY,
        identity_id TEXT NOT NULL,
        pose TEXT,
        embedding TEXT NOT NULL,
        enrolled_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS attendance_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        student_nisn TEXT NOT NULL,
        date TEXT NOT NULL,
        time_log TEXT NOT NULL,
        status TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_face_signatures_identity ON face_signatures(identity_id);
    CREATE INDEX IF NOT EXISTS idx_attendance_logs_date ON attendance_logs(date);
";

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<SqliteStoreError> for StoreError {
    fn from(e: SqliteStoreError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    SqliteStoreError::from(e).into()
}

/// SQLite-backed roster, signature and attendance store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SqliteStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SqliteStoreError::Corrupt(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA foreign_keys=ON;",
        )?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::with_connection(conn)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SqliteStoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or update a student row, creating a parent row for the token.
    ///
    /// Roster maintenance belongs to the administration system; this exists
    /// for seeding and tests.
    pub fn upsert_student(
        &self,
        nisn: &str,
        full_name: &str,
        parent_token: Option<&str>,
    ) -> Result<(), SqliteStoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let parent_id: Option<i64> = match parent_token {
            Some(token) => {
                tx.execute(
                    "INSERT INTO parents (full_name, fcm_token) VALUES (NULL, ?1)",
                    params![token],
                )?;
                Some(tx.last_insert_rowid())
            }
            None => None,
        };
        tx.execute(
            "INSERT INTO students (nisn, full_name, parent_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(nisn) DO UPDATE SET full_name = excluded.full_name,
                                             parent_id = excluded.parent_id",
            params![nisn, full_name, parent_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Set the late cutoff setting as the administration system would.
    pub fn set_late_limit(&self, late_limit: &str) -> Result<(), SqliteStoreError> {
        self.conn().execute(
            "INSERT INTO system_settings (id, late_limit) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET late_limit = excluded.late_limit",
            params![late_limit],
        )?;
        Ok(())
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, SqliteStoreError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| SqliteStoreError::Corrupt(format!("date {s:?}: {e}")))
}

fn parse_time(s: &str) -> Result<NaiveTime, SqliteStoreError> {
    NaiveTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|e| SqliteStoreError::Corrupt(format!("time {s:?}: {e}")))
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, SqliteStoreError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map_err(|e| SqliteStoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

impl RosterStore for SqliteStore {
    fn lookup(&self, identity_id: &str) -> Result<RosterEntry, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT s.full_name, p.fcm_token
                 FROM students s
                 LEFT JOIN parents p ON s.parent_id = p.id
                 WHERE s.nisn = ?1",
                params![identity_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
            .map_err(backend)?;

        let (display_name, token) =
            row.ok_or_else(|| StoreError::NotFound(identity_id.to_string()))?;
        Ok(RosterEntry {
            identity_id: identity_id.to_string(),
            display_name,
            notification_address: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn late_cutoff(&self) -> Result<Option<LateCutoff>, StoreError> {
        let value: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT late_limit FROM system_settings ORDER BY id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;

        match value.flatten() {
            Some(raw) if !raw.trim().is_empty() => raw
                .parse::<LateCutoff>()
                .map(Some)
                .map_err(|e| SqliteStoreError::Corrupt(e.to_string()).into()),
            _ => Ok(None),
        }
    }

    fn registered_students(&self) -> Result<Vec<RegisteredStudent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT nisn, full_name, face_registered_at
                 FROM students
                 WHERE face_registered_at IS NOT NULL
                 ORDER BY face_registered_at DESC",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        rows.into_iter()
            .map(|(identity_id, display_name, registered)| -> Result<_, StoreError> {
                Ok(RegisteredStudent {
                    identity_id,
                    display_name,
                    face_registered_at: parse_timestamp(&registered)?,
                })
            })
            .collect()
    }
}

impl AttendanceStore for SqliteStore {
    fn append_event(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO attendance_logs (student_nisn, date, time_log, status)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.identity_id,
                    event.date.format(DATE_FORMAT).to_string(),
                    format_time(event.time),
                    event.status.as_str(),
                ],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn query_events(&self, date: NaiveDate) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT a.student_nisn, s.full_name, a.date, a.time_log, a.status
                 FROM attendance_logs a
                 LEFT JOIN students s ON a.student_nisn = s.nisn
                 WHERE a.date = ?1
                 ORDER BY a.time_log DESC, a.id DESC",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![date.format(DATE_FORMAT).to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        rows.into_iter()
            .map(|(identity_id, display_name, date, time, status)| -> Result<_, StoreError> {
                let status = AttendanceStatus::parse(&status)
                    .ok_or_else(|| SqliteStoreError::Corrupt(format!("status {status:?}")))?;
                Ok(HistoryEntry {
                    identity_id,
                    display_name,
                    date: parse_date(&date)?,
                    time: parse_time(&time)?,
                    status,
                })
            })
            .collect()
    }
}

impl SignatureStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<EnrolledSignature>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT signature_id, identity_id, pose, embedding, enrolled_at
                 FROM face_signatures
                 ORDER BY rowid",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        rows.into_iter()
            .map(|(signature_id, identity_id, pose, embedding, enrolled_at)| -> Result<_, StoreError> {
                let signature: Signature = serde_json::from_str(&embedding)
                    .map_err(SqliteStoreError::from)?;
                Ok(EnrolledSignature {
                    signature_id,
                    identity_id,
                    pose,
                    signature,
                    enrolled_at: parse_timestamp(&enrolled_at)?,
                })
            })
            .collect()
    }

    fn insert_signature(&self, enrolled: &EnrolledSignature) -> Result<(), StoreError> {
        let embedding = serde_json::to_string(&enrolled.signature).map_err(SqliteStoreError::from)?;
        let enrolled_at = format_timestamp(enrolled.enrolled_at);

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(backend)?;
        tx.execute(
            "INSERT INTO face_signatures (signature_id, identity_id, pose, embedding, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                enrolled.signature_id,
                enrolled.identity_id,
                enrolled.pose,
                embedding,
                enrolled_at,
            ],
        )
        .map_err(backend)?;
        tx.execute(
            "UPDATE students SET face_registered_at = ?2 WHERE nisn = ?1",
            params![enrolled.identity_id, enrolled_at],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;

        tracing::debug!(
            identity_id = %enrolled.identity_id,
            signature_id = %enrolled.signature_id,
            "signature persisted"
        );
        Ok(())
    }

    fn delete_identity(&self, identity_id: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(backend)?;
        let removed = tx
            .execute(
                "DELETE FROM face_signatures WHERE identity_id = ?1",
                params![identity_id],
            )
            .map_err(backend)?;
        tx.execute(
            "UPDATE students SET face_registered_at = NULL WHERE nisn = ?1",
            params![identity_id],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(removed)
    }
}
