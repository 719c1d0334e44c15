//! Call session store
//!
//! SQLite-backed record of every call: who called whom, for which booking,
//! audio or video, and how the call ended. The status column only ever
//! moves forward (initiated, then ongoing, then completed or failed);
//! updates that would move it backwards are rejected.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Call session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Booking not found: {0}")]
    BookingNotFound(Uuid),

    #[error("Caller and callee must be different users")]
    InvalidParticipants,

    #[error("Booking {0} already has an active call")]
    BookingBusy(Uuid),

    #[error("Session {session} is already {status}, cannot change it")]
    InvalidTransition { session: Uuid, status: CallStatus },
}

// ============================================================================
// CALL TYPES
// ============================================================================

/// Audio-only or audio+video call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Audio => "audio",
            CallKind::Video => "video",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(CallKind::Audio),
            "video" => Some(CallKind::Video),
            _ => None,
        }
    }
}

/// Lifecycle of a call session. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Ongoing,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ongoing => "ongoing",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(CallStatus::Initiated),
            "ongoing" => Some(CallStatus::Ongoing),
            "completed" => Some(CallStatus::Completed),
            "failed" => Some(CallStatus::Failed),
            _ => None,
        }
    }

    /// Completed and failed sessions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Completed | CallStatus::Failed)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row in `call_sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CallSession {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub caller_id: Uuid,
    pub callee_id: Uuid,
    pub call_type: CallKind,
    pub status: CallStatus,
    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub recording_url: Option<String>,
}

/// Session to insert (id and timestamps are assigned by the store).
#[derive(Debug, Clone)]
pub struct NewCallSession {
    pub booking_id: Uuid,
    pub caller_id: Uuid,
    pub callee_id: Uuid,
    pub call_type: CallKind,
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite store for call sessions plus the booking/profile rows needed to
/// resolve a caller's display name (thread-safe through a Mutex).
pub struct CallStore {
    conn: Mutex<Connection>,
}

impl CallStore {
    /// Opens or creates the database in the platform data directory.
    pub fn open() -> Result<Self, StoreError> {
        let db_path = Self::get_database_path()?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call store at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Opens or creates a database at an explicit path.
    pub fn open_at(path: &std::path::Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn get_database_path() -> Result<PathBuf, StoreError> {
        let proj_dirs = directories::ProjectDirs::from("com", "mentorlink", "mentorlink-call")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("calls.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS call_sessions (
                id TEXT PRIMARY KEY,
                booking_id TEXT NOT NULL,
                caller_id TEXT NOT NULL,
                callee_id TEXT NOT NULL,
                call_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'initiated',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                started_at TEXT,
                ended_at TEXT,
                duration_seconds INTEGER,
                recording_url TEXT
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_call_sessions_booking ON call_sessions(booking_id)
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_call_sessions_callee ON call_sessions(callee_id)
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS bookings (
                id TEXT PRIMARY KEY,
                mentor_id TEXT NOT NULL,
                mentee_id TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS mentors (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL
            )
            "#,
            [],
        )?;

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Call sessions
    // ------------------------------------------------------------------------

    /// Creates a new call session in status `initiated`.
    ///
    /// Rejects calls to oneself and refuses to create a second session for a
    /// booking that still has one in `initiated` or `ongoing`.
    pub fn initiate(&self, new: NewCallSession) -> Result<CallSession, StoreError> {
        if new.caller_id == new.callee_id {
            return Err(StoreError::InvalidParticipants);
        }

        let conn = self.conn.lock();

        let active: Option<String> = conn
            .query_row(
                r#"
                SELECT id FROM call_sessions
                WHERE booking_id = ?1 AND status IN ('initiated', 'ongoing')
                "#,
                params![new.booking_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if active.is_some() {
            return Err(StoreError::BookingBusy(new.booking_id));
        }

        let id = Uuid::new_v4();
        conn.execute(
            r#"
            INSERT INTO call_sessions (id, booking_id, caller_id, callee_id, call_type, status)
            VALUES (?1, ?2, ?3, ?4, ?5, 'initiated')
            "#,
            params![
                id.to_string(),
                new.booking_id.to_string(),
                new.caller_id.to_string(),
                new.callee_id.to_string(),
                new.call_type.as_str(),
            ],
        )?;

        Self::get_session_inner(&conn, id)
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> SqliteResult<CallSession> {
        let parse_uuid = |idx: usize| -> SqliteResult<Uuid> {
            let text: String = row.get(idx)?;
            text.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        };

        let kind_text: String = row.get(4)?;
        let status_text: String = row.get(5)?;

        Ok(CallSession {
            id: parse_uuid(0)?,
            booking_id: parse_uuid(1)?,
            caller_id: parse_uuid(2)?,
            callee_id: parse_uuid(3)?,
            call_type: CallKind::parse(&kind_text).unwrap_or(CallKind::Audio),
            status: CallStatus::parse(&status_text).unwrap_or(CallStatus::Failed),
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            ended_at: row.get(8)?,
            duration_seconds: row.get(9)?,
            recording_url: row.get(10)?,
        })
    }

    fn get_session_inner(conn: &Connection, id: Uuid) -> Result<CallSession, StoreError> {
        conn.query_row(
            r#"
            SELECT id, booking_id, caller_id, callee_id, call_type, status,
                   created_at, started_at, ended_at, duration_seconds, recording_url
            FROM call_sessions
            WHERE id = ?1
            "#,
            params![id.to_string()],
            Self::row_to_session,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::SessionNotFound(id),
            other => StoreError::Sqlite(other),
        })
    }

    /// Fetches a session by id.
    pub fn get_session(&self, id: Uuid) -> Result<CallSession, StoreError> {
        let conn = self.conn.lock();
        Self::get_session_inner(&conn, id)
    }

    /// The session currently in `initiated` or `ongoing` for a booking, if any.
    pub fn active_session_for_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Option<CallSession>, StoreError> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                r#"
                SELECT id, booking_id, caller_id, callee_id, call_type, status,
                       created_at, started_at, ended_at, duration_seconds, recording_url
                FROM call_sessions
                WHERE booking_id = ?1 AND status IN ('initiated', 'ongoing')
                "#,
                params![booking_id.to_string()],
                Self::row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Moves a session from `initiated` to `ongoing` and stamps `started_at`.
    pub fn mark_ongoing(&self, id: Uuid) -> Result<CallSession, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE call_sessions
            SET status = 'ongoing', started_at = datetime('now')
            WHERE id = ?1 AND status = 'initiated'
            "#,
            params![id.to_string()],
        )?;

        if changed == 0 {
            let session = Self::get_session_inner(&conn, id)?;
            return Err(StoreError::InvalidTransition {
                session: id,
                status: session.status,
            });
        }

        Self::get_session_inner(&conn, id)
    }

    /// Closes a session with a terminal status and computes its duration.
    ///
    /// Only sessions still in `initiated` or `ongoing` can be closed; a
    /// session that never reached `ongoing` has no duration.
    pub fn finish(&self, id: Uuid, status: CallStatus) -> Result<CallSession, StoreError> {
        debug_assert!(status.is_terminal());

        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE call_sessions
            SET status = ?2,
                ended_at = datetime('now'),
                duration_seconds = CASE
                    WHEN started_at IS NOT NULL
                    THEN CAST(strftime('%s', 'now') - strftime('%s', started_at) AS INTEGER)
                    ELSE NULL
                END
            WHERE id = ?1 AND status IN ('initiated', 'ongoing')
            "#,
            params![id.to_string(), status.as_str()],
        )?;

        if changed == 0 {
            let session = Self::get_session_inner(&conn, id)?;
            return Err(StoreError::InvalidTransition {
                session: id,
                status: session.status,
            });
        }

        Self::get_session_inner(&conn, id)
    }

    /// Attaches a recording URL to a session.
    pub fn set_recording_url(&self, id: Uuid, url: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE call_sessions SET recording_url = ?2 WHERE id = ?1
            "#,
            params![id.to_string(), url],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Bookings and profiles
    // ------------------------------------------------------------------------

    /// Registers a booking between a mentor profile and a mentee user.
    pub fn add_booking(
        &self,
        id: Uuid,
        mentor_id: Uuid,
        mentee_id: Uuid,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO bookings (id, mentor_id, mentee_id)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                mentor_id = excluded.mentor_id,
                mentee_id = excluded.mentee_id
            "#,
            params![id.to_string(), mentor_id.to_string(), mentee_id.to_string()],
        )?;
        Ok(())
    }

    /// Registers a mentor profile (its public name and the user behind it).
    pub fn add_mentor(&self, id: Uuid, user_id: Uuid, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO mentors (id, user_id, name)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                name = excluded.name
            "#,
            params![id.to_string(), user_id.to_string(), name],
        )?;
        Ok(())
    }

    /// Registers a user profile.
    pub fn add_user(
        &self,
        id: Uuid,
        first_name: &str,
        last_name: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO users (id, first_name, last_name)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name
            "#,
            params![id.to_string(), first_name, last_name],
        )?;
        Ok(())
    }

    /// Resolves the display name of a session's caller.
    ///
    /// Looks at the session's booking: when the caller is the mentor side,
    /// the mentor profile's public name wins; otherwise the caller's own
    /// first and last name are used.
    pub fn caller_display_name(&self, session: &CallSession) -> Result<String, StoreError> {
        let conn = self.conn.lock();

        let (mentor_id, _mentee_id): (String, String) = conn
            .query_row(
                r#"
                SELECT mentor_id, mentee_id FROM bookings WHERE id = ?1
                "#,
                params![session.booking_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::BookingNotFound(session.booking_id)
                }
                other => StoreError::Sqlite(other),
            })?;

        let mentor: Option<(String, String)> = conn
            .query_row(
                r#"
                SELECT user_id, name FROM mentors WHERE id = ?1
                "#,
                params![mentor_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((mentor_user, mentor_name)) = mentor {
            if mentor_user == session.caller_id.to_string() {
                return Ok(mentor_name);
            }
        }

        let name: Option<(String, String)> = conn
            .query_row(
                r#"
                SELECT first_name, last_name FROM users WHERE id = ?1
                "#,
                params![session.caller_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match name {
            Some((first, last)) => Ok(format!("{} {}", first, last)),
            None => Ok("Unknown caller".to_string()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(store: &CallStore) -> CallSession {
        let booking = Uuid::new_v4();
        let caller = Uuid::new_v4();
        let callee = Uuid::new_v4();
        store
            .initiate(NewCallSession {
                booking_id: booking,
                caller_id: caller,
                callee_id: callee,
                call_type: CallKind::Video,
            })
            .unwrap()
    }

    #[test]
    fn test_initiate_and_get() {
        let store = CallStore::open_in_memory().unwrap();
        let session = new_session(&store);

        assert_eq!(session.status, CallStatus::Initiated);
        assert_eq!(session.call_type, CallKind::Video);
        assert!(session.started_at.is_none());

        let fetched = store.get_session(session.id).unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.caller_id, session.caller_id);
    }

    #[test]
    fn test_calling_yourself_is_rejected() {
        let store = CallStore::open_in_memory().unwrap();
        let me = Uuid::new_v4();

        let result = store.initiate(NewCallSession {
            booking_id: Uuid::new_v4(),
            caller_id: me,
            callee_id: me,
            call_type: CallKind::Audio,
        });

        assert!(matches!(result, Err(StoreError::InvalidParticipants)));
    }

    #[test]
    fn test_one_active_call_per_booking() {
        let store = CallStore::open_in_memory().unwrap();
        let session = new_session(&store);

        let second = store.initiate(NewCallSession {
            booking_id: session.booking_id,
            caller_id: Uuid::new_v4(),
            callee_id: Uuid::new_v4(),
            call_type: CallKind::Audio,
        });
        assert!(matches!(second, Err(StoreError::BookingBusy(_))));

        // Once the first call is over the booking is free again.
        store.finish(session.id, CallStatus::Completed).unwrap();
        let third = store.initiate(NewCallSession {
            booking_id: session.booking_id,
            caller_id: Uuid::new_v4(),
            callee_id: Uuid::new_v4(),
            call_type: CallKind::Audio,
        });
        assert!(third.is_ok());
    }

    #[test]
    fn test_status_only_moves_forward() {
        let store = CallStore::open_in_memory().unwrap();
        let session = new_session(&store);

        let ongoing = store.mark_ongoing(session.id).unwrap();
        assert_eq!(ongoing.status, CallStatus::Ongoing);
        assert!(ongoing.started_at.is_some());

        // ongoing -> ongoing is not a valid step.
        assert!(matches!(
            store.mark_ongoing(session.id),
            Err(StoreError::InvalidTransition { .. })
        ));

        let done = store.finish(session.id, CallStatus::Completed).unwrap();
        assert_eq!(done.status, CallStatus::Completed);
        assert!(done.ended_at.is_some());
        assert!(done.duration_seconds.is_some());

        // Terminal sessions are frozen.
        assert!(matches!(
            store.finish(session.id, CallStatus::Failed),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.mark_ongoing(session.id),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_failed_before_answer_has_no_duration() {
        let store = CallStore::open_in_memory().unwrap();
        let session = new_session(&store);

        let failed = store.finish(session.id, CallStatus::Failed).unwrap();
        assert_eq!(failed.status, CallStatus::Failed);
        assert!(failed.started_at.is_none());
        assert!(failed.duration_seconds.is_none());
    }

    #[test]
    fn test_active_session_lookup() {
        let store = CallStore::open_in_memory().unwrap();
        let session = new_session(&store);

        let active = store
            .active_session_for_booking(session.booking_id)
            .unwrap();
        assert_eq!(active.map(|s| s.id), Some(session.id));

        store.finish(session.id, CallStatus::Failed).unwrap();
        let active = store
            .active_session_for_booking(session.booking_id)
            .unwrap();
        assert!(active.is_none());
    }

    #[test]
    fn test_caller_name_prefers_mentor_profile() {
        let store = CallStore::open_in_memory().unwrap();

        let mentor_user = Uuid::new_v4();
        let mentee_user = Uuid::new_v4();
        let mentor_profile = Uuid::new_v4();
        let booking = Uuid::new_v4();

        store
            .add_mentor(mentor_profile, mentor_user, "Dr. Ada Lovelace")
            .unwrap();
        store.add_user(mentee_user, "Grace", "Hopper").unwrap();
        store
            .add_booking(booking, mentor_profile, mentee_user)
            .unwrap();

        // Mentor calls: the profile name is shown.
        let from_mentor = store
            .initiate(NewCallSession {
                booking_id: booking,
                caller_id: mentor_user,
                callee_id: mentee_user,
                call_type: CallKind::Audio,
            })
            .unwrap();
        assert_eq!(
            store.caller_display_name(&from_mentor).unwrap(),
            "Dr. Ada Lovelace"
        );
        store.finish(from_mentor.id, CallStatus::Failed).unwrap();

        // Mentee calls: first and last name are shown.
        let from_mentee = store
            .initiate(NewCallSession {
                booking_id: booking,
                caller_id: mentee_user,
                callee_id: mentor_user,
                call_type: CallKind::Audio,
            })
            .unwrap();
        assert_eq!(
            store.caller_display_name(&from_mentee).unwrap(),
            "Grace Hopper"
        );
    }

    #[test]
    fn test_caller_name_without_booking_is_an_error() {
        let store = CallStore::open_in_memory().unwrap();
        let session = new_session(&store);

        assert!(matches!(
            store.caller_display_name(&session),
            Err(StoreError::BookingNotFound(_))
        ));
    }

    #[test]
    fn test_recording_url() {
        let store = CallStore::open_in_memory().unwrap();
        let session = new_session(&store);

        store
            .set_recording_url(session.id, "https://recordings.example/abc.webm")
            .unwrap();
        let fetched = store.get_session(session.id).unwrap();
        assert_eq!(
            fetched.recording_url.as_deref(),
            Some("https://recordings.example/abc.webm")
        );

        assert!(matches!(
            store.set_recording_url(Uuid::new_v4(), "x"),
            Err(StoreError::SessionNotFound(_))
        ));
    }
}
