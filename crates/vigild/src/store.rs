//! SQLite persistence for detections, known persons, alerts and system logs.
//!
//! Timestamps are local RFC 3339 strings; the first ten characters are the
//! local calendar date, which is what the per-day queries match on.

use chrono::{Local, NaiveDate};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use vigil_core::{Embedding, IdentityLabel, KnownPerson};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("known person '{0}' already exists")]
    Duplicate(String),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS detection_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    person_id TEXT,
    person_name TEXT,
    confidence REAL,
    face_image_path TEXT,
    video_path TEXT,
    camera_id TEXT
);
CREATE TABLE IF NOT EXISTS known_persons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    date_added TEXT NOT NULL,
    image_path TEXT,
    embedding BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS system_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT
);
CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    alert_type TEXT NOT NULL,
    person_id TEXT,
    person_name TEXT,
    description TEXT,
    acknowledged INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_detection_events_timestamp ON detection_events(timestamp);
";

/// A detection about to be appended.
#[derive(Debug, Clone)]
pub struct NewDetection<'a> {
    pub identity: &'a IdentityLabel,
    /// Match similarity; 0 for unrecognized faces.
    pub confidence: f32,
    pub face_image_path: Option<&'a Path>,
    pub video_path: Option<&'a Path>,
    pub camera_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionRow {
    pub id: i64,
    pub timestamp: String,
    pub person_id: Option<String>,
    pub person_name: Option<String>,
    pub confidence: f64,
    pub face_image_path: Option<String>,
    pub video_path: Option<String>,
    pub camera_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonRow {
    pub id: i64,
    pub name: String,
    pub date_added: String,
    pub image_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRow {
    pub id: i64,
    pub timestamp: String,
    pub alert_type: String,
    pub person_id: Option<String>,
    pub person_name: Option<String>,
    pub description: Option<String>,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Statistics {
    pub total_detections: i64,
    pub known_persons: i64,
    pub pending_alerts: i64,
    pub detections_today: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonDay {
    pub name: String,
    pub detections: i64,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRow {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyReport {
    pub date: String,
    pub known: Vec<PersonDay>,
    pub unrecognized_sightings: i64,
    pub alerts: i64,
}

pub struct Store {
    conn: Mutex<Connection>,
}

fn now_stamp() -> String {
    Local::now().to_rfc3339()
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn log_detection(&self, event: &NewDetection<'_>) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO detection_events
                (timestamp, person_id, person_name, confidence, face_image_path, video_path, camera_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                now_stamp(),
                event.identity.person_id(),
                event.identity.name(),
                event.confidence as f64,
                event.face_image_path.map(|p| p.to_string_lossy().into_owned()),
                event.video_path.map(|p| p.to_string_lossy().into_owned()),
                event.camera_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_alert(
        &self,
        alert_type: &str,
        subject: &IdentityLabel,
        description: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO alerts (timestamp, alert_type, person_id, person_name, description)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                now_stamp(),
                alert_type,
                subject.person_id(),
                subject.name(),
                description
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn log_system_event(
        &self,
        level: &str,
        message: &str,
        details: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO system_logs (timestamp, level, message, details) VALUES (?1, ?2, ?3, ?4)",
            params![now_stamp(), level, message, details],
        )?;
        Ok(())
    }

    pub fn insert_known_person(
        &self,
        name: &str,
        image_path: Option<&Path>,
        embedding: &Embedding,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO known_persons (name, date_added, image_path, embedding)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                now_stamp(),
                image_path.map(|p| p.to_string_lossy().into_owned()),
                embedding.to_le_bytes(),
            ],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns whether a row was deleted.
    pub fn delete_known_person(&self, name: &str) -> Result<bool, StoreError> {
        let n = self
            .conn()
            .execute("DELETE FROM known_persons WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    /// Full gallery contents, oldest registration first. Rows whose
    /// embedding does not decode are skipped.
    pub fn load_known_persons(&self) -> Result<Vec<KnownPerson>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT name, image_path, embedding FROM known_persons ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut persons = Vec::new();
        for row in rows {
            let (name, image_path, blob) = row?;
            let Some(embedding) = Embedding::from_le_bytes(&blob).filter(|e| !e.is_empty()) else {
                tracing::warn!(name, bytes = blob.len(), "skipping known person with corrupt embedding");
                continue;
            };
            persons.push(KnownPerson {
                name,
                embedding,
                image_path: image_path.map(PathBuf::from),
            });
        }
        Ok(persons)
    }

    pub fn list_known_persons(&self) -> Result<Vec<PersonRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, date_added, image_path FROM known_persons ORDER BY date_added DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PersonRow {
                id: row.get(0)?,
                name: row.get(1)?,
                date_added: row.get(2)?,
                image_path: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn recent_detections(&self, limit: u32) -> Result<Vec<DetectionRow>, StoreError> {
        self.query_detections(
            "SELECT * FROM detection_events ORDER BY id DESC LIMIT ?1",
            params![limit],
        )
    }

    pub fn detections_by_person(&self, name: &str) -> Result<Vec<DetectionRow>, StoreError> {
        self.query_detections(
            "SELECT * FROM detection_events WHERE person_name = ?1 ORDER BY id DESC",
            params![name],
        )
    }

    /// Unrecognized sightings, newest first.
    pub fn intruder_detections(&self, limit: u32) -> Result<Vec<DetectionRow>, StoreError> {
        self.query_detections(
            "SELECT * FROM detection_events WHERE person_name IS NULL ORDER BY id DESC LIMIT ?1",
            params![limit],
        )
    }

    fn query_detections(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<DetectionRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok(DetectionRow {
                id: row.get("id")?,
                timestamp: row.get("timestamp")?,
                person_id: row.get("person_id")?,
                person_name: row.get("person_name")?,
                confidence: row.get::<_, Option<f64>>("confidence")?.unwrap_or(0.0),
                face_image_path: row.get("face_image_path")?,
                video_path: row.get("video_path")?,
                camera_id: row.get("camera_id")?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn unacknowledged_alerts(&self) -> Result<Vec<AlertRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, alert_type, person_id, person_name, description, acknowledged
             FROM alerts WHERE acknowledged = 0 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AlertRow {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                alert_type: row.get(2)?,
                person_id: row.get(3)?,
                person_name: row.get(4)?,
                description: row.get(5)?,
                acknowledged: row.get::<_, i64>(6)? != 0,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Returns whether an alert with this id existed.
    pub fn acknowledge_alert(&self, id: i64) -> Result<bool, StoreError> {
        let n = self
            .conn()
            .execute("UPDATE alerts SET acknowledged = 1 WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn statistics(&self) -> Result<Statistics, StoreError> {
        let today = Local::now().date_naive().to_string();
        let conn = self.conn();
        let count = |sql: &str, p: &[&dyn rusqlite::ToSql]| -> Result<i64, rusqlite::Error> {
            conn.query_row(sql, p, |row| row.get(0))
        };
        Ok(Statistics {
            total_detections: count("SELECT COUNT(*) FROM detection_events", &[])?,
            known_persons: count("SELECT COUNT(*) FROM known_persons", &[])?,
            pending_alerts: count("SELECT COUNT(*) FROM alerts WHERE acknowledged = 0", &[])?,
            detections_today: count(
                "SELECT COUNT(*) FROM detection_events WHERE substr(timestamp, 1, 10) = ?1",
                &[&today],
            )?,
        })
    }

    /// Per-person attendance for one local calendar day.
    pub fn daily_report(&self, date: NaiveDate) -> Result<DailyReport, StoreError> {
        let day = date.to_string();
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT person_name, COUNT(*), MIN(timestamp), MAX(timestamp)
             FROM detection_events
             WHERE substr(timestamp, 1, 10) = ?1 AND person_name IS NOT NULL
             GROUP BY person_name ORDER BY person_name",
        )?;
        let known = stmt
            .query_map(params![day], |row| {
                Ok(PersonDay {
                    name: row.get(0)?,
                    detections: row.get(1)?,
                    first_seen: row.get(2)?,
                    last_seen: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let unrecognized_sightings: i64 = conn.query_row(
            "SELECT COUNT(*) FROM detection_events
             WHERE substr(timestamp, 1, 10) = ?1 AND person_name IS NULL",
            params![day],
            |row| row.get(0),
        )?;
        let alerts: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE substr(timestamp, 1, 10) = ?1",
            params![day],
            |row| row.get(0),
        )?;

        Ok(DailyReport {
            date: day,
            known,
            unrecognized_sightings,
            alerts,
        })
    }

    /// Most recent system log lines, newest first.
    pub fn recent_logs(&self, limit: u32) -> Result<Vec<LogRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT timestamp, level, message, details FROM system_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(LogRow {
                timestamp: row.get(0)?,
                level: row.get(1)?,
                message: row.get(2)?,
                details: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

/// Persistence is fire-and-forget from the pipeline: log and move on.
pub fn log_failure<T>(what: &str, result: Result<T, StoreError>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "{what} failed");
            None
        }
    }
}
