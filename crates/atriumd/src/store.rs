//! SQLite persistence for identities, visitor sessions, alerts and plates.
//!
//! One connection behind a mutex; every public call is a short critical
//! section. Timestamps are stored as unix milliseconds.

use atrium_core::types::normalize_plate;
use atrium_core::{
    Alert, AlertDraft, AlertType, FaceIdentity, IdentityStore, Plate, ReconciliationEntry,
    StoreError, VisitorSession,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS face_identities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        collection_id TEXT NOT NULL,
        external_image_id TEXT NOT NULL,
        face_descriptor_id TEXT,
        storage_key TEXT NOT NULL,
        status TEXT NOT NULL,
        kind TEXT NOT NULL DEFAULT 'regular',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(user_id, collection_id)
    );
    CREATE INDEX IF NOT EXISTS idx_face_identities_external
        ON face_identities(collection_id, external_image_id);

    CREATE TABLE IF NOT EXISTS reconciliation_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        collection_id TEXT NOT NULL,
        face_descriptor_id TEXT,
        storage_key TEXT NOT NULL,
        reason TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS visitor_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        login_at INTEGER NOT NULL,
        logout_at INTEGER,
        similarity REAL NOT NULL DEFAULT 0,
        storage_key TEXT NOT NULL DEFAULT '',
        event_type TEXT NOT NULL DEFAULT 'session'
    );
    CREATE INDEX IF NOT EXISTS idx_visitor_sessions_user_login
        ON visitor_sessions(user_id, login_at);
    CREATE INDEX IF NOT EXISTS idx_visitor_sessions_user_logout
        ON visitor_sessions(user_id, logout_at);

    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT NOT NULL,
        camera_id TEXT,
        video_key TEXT NOT NULL,
        image_key TEXT,
        timestamp_ms INTEGER NOT NULL,
        confidence REAL NOT NULL DEFAULT 0,
        extra TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_alerts_type_created ON alerts(type, created_at);

    CREATE TABLE IF NOT EXISTS plates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        number TEXT NOT NULL,
        user_id INTEGER NOT NULL,
        UNIQUE(number, user_id)
    );
    CREATE INDEX IF NOT EXISTS idx_plates_number ON plates(number);
";

const IDENTITY_COLUMNS: &str = "id, user_id, collection_id, external_image_id, face_descriptor_id,
     storage_key, status, kind, created_at, updated_at";
const SESSION_COLUMNS: &str =
    "id, user_id, login_at, logout_at, similarity, storage_key, event_type";
const ALERT_COLUMNS: &str =
    "id, type, camera_id, video_key, image_key, timestamp_ms, confidence, extra, created_at";

/// Sort order accepted by the session listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionOrdering {
    LoginAsc,
    #[default]
    LoginDesc,
    LogoutAsc,
    LogoutDesc,
}

impl SessionOrdering {
    fn sql(&self) -> &'static str {
        match self {
            Self::LoginAsc => "login_at ASC, id ASC",
            Self::LoginDesc => "login_at DESC, id DESC",
            Self::LogoutAsc => "logout_at ASC, id ASC",
            Self::LogoutDesc => "logout_at DESC, id DESC",
        }
    }
}

impl FromStr for SessionOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login_at" => Ok(Self::LoginAsc),
            "-login_at" => Ok(Self::LoginDesc),
            "logout_at" => Ok(Self::LogoutAsc),
            "-logout_at" => Ok(Self::LogoutDesc),
            other => Err(format!("unsupported ordering: {other}")),
        }
    }
}

/// Filters for [`Store::list_sessions`]. Date bounds are inclusive calendar days (UTC).
#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    pub user_id: Option<i64>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub ordering: SessionOrdering,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub active: i64,
    pub today: i64,
    pub total: i64,
}

pub struct Store {
    conn: Mutex<Connection>,
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or_default()
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<FaceIdentity> {
    Ok(FaceIdentity {
        id: Some(row.get(0)?),
        user_id: row.get(1)?,
        collection_id: row.get(2)?,
        external_image_id: row.get(3)?,
        face_descriptor_id: row.get(4)?,
        storage_key: row.get(5)?,
        status: parse_column(row, 6)?,
        kind: parse_column(row, 7)?,
        created_at: from_millis(row.get(8)?),
        updated_at: from_millis(row.get(9)?),
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<VisitorSession> {
    Ok(VisitorSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        login_at: from_millis(row.get(2)?),
        logout_at: row.get::<_, Option<i64>>(3)?.map(from_millis),
        similarity: row.get::<_, f64>(4)? as f32,
        storage_key: row.get(5)?,
        event_type: row.get(6)?,
    })
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let raw_type: String = row.get(1)?;
    let alert_type = AlertType::from_stored(&raw_type)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let raw_extra: String = row.get(7)?;
    let extra = serde_json::from_str(&raw_extra)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

    Ok(Alert {
        id: row.get(0)?,
        draft: AlertDraft {
            alert_type,
            camera_id: row.get(2)?,
            video_key: row.get(3)?,
            image_key: row.get(4)?,
            timestamp_ms: row.get::<_, i64>(5)?.max(0) as u64,
            confidence: row.get::<_, f64>(6)? as f32,
            extra,
        },
        created_at: from_millis(row.get(8)?),
    })
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(backend)?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;

        let migrated = conn
            .execute(
                "UPDATE alerts SET type = ?1 WHERE type = ?2",
                params![AlertType::BadParking.as_str(), AlertType::LEGACY_VEHICLE_SEEN],
            )
            .map_err(backend)?;
        if migrated > 0 {
            tracing::info!(rows = migrated, "migrated legacy vehicle_seen alerts");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("connection lock poisoned".into()))
    }

    // --- alerts -----------------------------------------------------------

    /// Persist drafts in one transaction, returning the stored rows in order.
    pub fn insert_alerts(
        &self,
        drafts: &[AlertDraft],
        now: DateTime<Utc>,
    ) -> Result<Vec<Alert>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;
        let mut stored = Vec::with_capacity(drafts.len());
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO alerts
                        (type, camera_id, video_key, image_key, timestamp_ms, confidence, extra, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(backend)?;
            for draft in drafts {
                stmt.execute(params![
                    draft.alert_type.as_str(),
                    draft.camera_id,
                    draft.video_key,
                    draft.image_key,
                    i64::try_from(draft.timestamp_ms).unwrap_or(i64::MAX),
                    draft.confidence as f64,
                    draft.extra.to_string(),
                    to_millis(now),
                ])
                .map_err(backend)?;
                stored.push(Alert {
                    id: tx.last_insert_rowid(),
                    draft: draft.clone(),
                    created_at: now,
                });
            }
        }
        tx.commit().map_err(backend)?;
        Ok(stored)
    }

    /// Most recent alerts of the accepted types, newest first.
    pub fn list_alerts(&self, limit: u32) -> Result<Vec<Alert>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ALERT_COLUMNS} FROM alerts
                 WHERE type IN (?1, ?2, ?3)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?4"
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(
                params![
                    AlertType::DogLoose.as_str(),
                    AlertType::DogWaste.as_str(),
                    AlertType::BadParking.as_str(),
                    limit,
                ],
                row_to_alert,
            )
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    // --- visitor sessions -------------------------------------------------

    /// Open a session for `user_id`. Any session the user still has open is
    /// closed at `now` first, so a user never has more than one open row.
    pub fn open_session(
        &self,
        user_id: i64,
        similarity: f32,
        storage_key: &str,
        now: DateTime<Utc>,
    ) -> Result<VisitorSession, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;
        let superseded = tx
            .execute(
                "UPDATE visitor_sessions SET logout_at = ?1
                 WHERE user_id = ?2 AND logout_at IS NULL",
                params![to_millis(now), user_id],
            )
            .map_err(backend)?;
        if superseded > 0 {
            tracing::info!(user_id, superseded, "closed stale open session on new login");
        }
        tx.execute(
            "INSERT INTO visitor_sessions (user_id, login_at, similarity, storage_key, event_type)
             VALUES (?1, ?2, ?3, ?4, 'session')",
            params![user_id, to_millis(now), similarity as f64, storage_key],
        )
        .map_err(backend)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(backend)?;
        Ok(VisitorSession {
            id,
            user_id,
            login_at: now,
            logout_at: None,
            similarity,
            storage_key: storage_key.to_string(),
            event_type: "session".into(),
        })
    }

    /// Close the user's open session, returning the most recent one. With none open, record an
    /// already-closed session so the logout still leaves a trace.
    pub fn close_latest_session(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<VisitorSession, StoreError> {
        let conn = self.conn()?;
        let open = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM visitor_sessions
                     WHERE user_id = ?1 AND logout_at IS NULL
                     ORDER BY login_at DESC, id DESC LIMIT 1"
                ),
                params![user_id],
                row_to_session,
            )
            .optional()
            .map_err(backend)?;

        match open {
            Some(mut session) => {
                // Rows left open by older versions are closed along with the latest.
                conn.execute(
                    "UPDATE visitor_sessions SET logout_at = ?1
                     WHERE user_id = ?2 AND logout_at IS NULL",
                    params![to_millis(now), user_id],
                )
                .map_err(backend)?;
                session.logout_at = Some(now);
                Ok(session)
            }
            None => {
                conn.execute(
                    "INSERT INTO visitor_sessions
                        (user_id, login_at, logout_at, similarity, storage_key, event_type)
                     VALUES (?1, ?2, ?2, 0, '', 'session')",
                    params![user_id, to_millis(now)],
                )
                .map_err(backend)?;
                tracing::debug!(user_id, "logout without open session; recorded closed session");
                Ok(VisitorSession {
                    id: conn.last_insert_rowid(),
                    user_id,
                    login_at: now,
                    logout_at: Some(now),
                    similarity: 0.0,
                    storage_key: String::new(),
                    event_type: "session".into(),
                })
            }
        }
    }

    pub fn last_session(&self, user_id: i64) -> Result<Option<VisitorSession>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM visitor_sessions
                 WHERE user_id = ?1 ORDER BY login_at DESC, id DESC LIMIT 1"
            ),
            params![user_id],
            row_to_session,
        )
        .optional()
        .map_err(backend)
    }

    pub fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<VisitorSession>, StoreError> {
        let from = query.from.map(|d| to_millis(day_start(d)));
        // Inclusive end day: everything before the start of the next day.
        let until = query
            .to
            .map(|d| to_millis(day_start(d) + Duration::days(1)));
        let limit = if query.limit == 0 { u32::MAX } else { query.limit };

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM visitor_sessions
                 WHERE (?1 IS NULL OR user_id = ?1)
                   AND (?2 IS NULL OR login_at >= ?2)
                   AND (?3 IS NULL OR login_at < ?3)
                 ORDER BY {}
                 LIMIT ?4",
                query.ordering.sql()
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![query.user_id, from, until, limit], row_to_session)
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    /// Users with an open session, sessions started on `now`'s UTC day, and all sessions.
    pub fn session_stats(&self, now: DateTime<Utc>) -> Result<SessionStats, StoreError> {
        let start = day_start(now.date_naive());
        let end = start + Duration::days(1);
        let conn = self.conn()?;
        conn.query_row(
            "SELECT
                COUNT(DISTINCT CASE WHEN logout_at IS NULL THEN user_id END),
                COALESCE(SUM(CASE WHEN login_at >= ?1 AND login_at < ?2 THEN 1 ELSE 0 END), 0),
                COUNT(*)
             FROM visitor_sessions",
            params![to_millis(start), to_millis(end)],
            |row| {
                Ok(SessionStats {
                    active: row.get(0)?,
                    today: row.get(1)?,
                    total: row.get(2)?,
                })
            },
        )
        .map_err(backend)
    }

    // --- plates -----------------------------------------------------------

    /// Assign a normalized plate to a user. The same (number, user) pair twice is a conflict.
    pub fn assign_plate(&self, user_id: i64, number: &str) -> Result<Plate, StoreError> {
        let number = normalize_plate(number);
        let conn = self.conn()?;
        match conn.execute(
            "INSERT INTO plates (number, user_id) VALUES (?1, ?2)",
            params![number, user_id],
        ) {
            Ok(_) => Ok(Plate {
                id: conn.last_insert_rowid(),
                number,
                user_id,
            }),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(format!(
                "plate {number} is already registered for user {user_id}"
            ))),
            Err(e) => Err(backend(e)),
        }
    }

    /// Whether any user holds the normalized plate.
    pub fn verify_plate(&self, number: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM plates WHERE number = ?1)",
            params![normalize_plate(number)],
            |row| row.get(0),
        )
        .map_err(backend)
    }

    // --- reconciliation ---------------------------------------------------

    pub fn list_reconciliations(&self) -> Result<Vec<ReconciliationEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT user_id, collection_id, face_descriptor_id, storage_key, reason, created_at
                 FROM reconciliation_queue ORDER BY id",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ReconciliationEntry {
                    user_id: row.get(0)?,
                    collection_id: row.get(1)?,
                    face_descriptor_id: row.get(2)?,
                    storage_key: row.get(3)?,
                    reason: row.get(4)?,
                    created_at: from_millis(row.get(5)?),
                })
            })
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }
}

impl IdentityStore for Store {
    fn upsert_identity(&self, identity: &FaceIdentity) -> Result<FaceIdentity, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO face_identities
                (user_id, collection_id, external_image_id, face_descriptor_id,
                 storage_key, status, kind, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id, collection_id) DO UPDATE SET
                external_image_id = excluded.external_image_id,
                face_descriptor_id = excluded.face_descriptor_id,
                storage_key = excluded.storage_key,
                status = excluded.status,
                kind = excluded.kind,
                updated_at = excluded.updated_at",
            params![
                identity.user_id,
                identity.collection_id,
                identity.external_image_id,
                identity.face_descriptor_id,
                identity.storage_key,
                identity.status.as_str(),
                identity.kind.as_str(),
                to_millis(identity.created_at),
                to_millis(identity.updated_at),
            ],
        )
        .map_err(backend)?;

        conn.query_row(
            &format!(
                "SELECT {IDENTITY_COLUMNS} FROM face_identities
                 WHERE user_id = ?1 AND collection_id = ?2"
            ),
            params![identity.user_id, identity.collection_id],
            row_to_identity,
        )
        .map_err(backend)
    }

    fn find_identity(
        &self,
        user_id: i64,
        collection: &str,
    ) -> Result<Option<FaceIdentity>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {IDENTITY_COLUMNS} FROM face_identities
                 WHERE user_id = ?1 AND collection_id = ?2"
            ),
            params![user_id, collection],
            row_to_identity,
        )
        .optional()
        .map_err(backend)
    }

    fn find_by_external_id(
        &self,
        collection: &str,
        external_id: &str,
    ) -> Result<Option<FaceIdentity>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {IDENTITY_COLUMNS} FROM face_identities
                 WHERE collection_id = ?1 AND external_image_id = ?2
                 ORDER BY updated_at DESC LIMIT 1"
            ),
            params![collection, external_id],
            row_to_identity,
        )
        .optional()
        .map_err(backend)
    }

    fn record_reconciliation(&self, entry: &ReconciliationEntry) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reconciliation_queue
                (user_id, collection_id, face_descriptor_id, storage_key, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.user_id,
                entry.collection_id,
                entry.face_descriptor_id,
                entry.storage_key,
                entry.reason,
                to_millis(entry.created_at),
            ],
        )
        .map_err(backend)?;
        Ok(())
    }
}
