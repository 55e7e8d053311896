use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{ParticipantId, SessionId},
    task::TaskProgress,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredSession {
    pub session_id: SessionId,
    pub code: String,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredParticipant {
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    pub code: String,
    pub label: Option<String>,
    pub progress: TaskProgress,
    pub advanced_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_session(&self, code: &str, label: Option<&str>) -> Result<StoredSession> {
        let row = sqlx::query(
            "INSERT INTO sessions (code, label) VALUES (?, ?)
             RETURNING id, code, label, created_at",
        )
        .bind(code)
        .bind(label)
        .fetch_one(&self.pool)
        .await?;
        Ok(session_from_row(&row))
    }

    pub async fn session_by_code(&self, code: &str) -> Result<Option<StoredSession>> {
        let row = sqlx::query("SELECT id, code, label, created_at FROM sessions WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    pub async fn create_participant(
        &self,
        session_id: SessionId,
        code: &str,
        label: Option<&str>,
    ) -> Result<StoredParticipant> {
        let row = sqlx::query(
            "INSERT INTO participants (session_id, code, label) VALUES (?, ?, ?)
             RETURNING id, session_id, code, label, shapes_sorted, rounds_completed,
                       advanced_at, last_event_at, created_at",
        )
        .bind(session_id.0)
        .bind(code)
        .bind(label)
        .fetch_one(&self.pool)
        .await?;
        Ok(participant_from_row(&row))
    }

    pub async fn participant_by_code(&self, code: &str) -> Result<Option<StoredParticipant>> {
        let row = sqlx::query(
            "SELECT id, session_id, code, label, shapes_sorted, rounds_completed,
                    advanced_at, last_event_at, created_at
             FROM participants
             WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(participant_from_row))
    }

    pub async fn list_participants_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<StoredParticipant>> {
        let rows = sqlx::query(
            "SELECT id, session_id, code, label, shapes_sorted, rounds_completed,
                    advanced_at, last_event_at, created_at
             FROM participants
             WHERE session_id = ?
             ORDER BY id ASC",
        )
        .bind(session_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(participant_from_row).collect())
    }

    pub async fn task_progress(
        &self,
        participant_id: ParticipantId,
    ) -> Result<Option<TaskProgress>> {
        let row =
            sqlx::query("SELECT shapes_sorted, rounds_completed FROM participants WHERE id = ?")
                .bind(participant_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| TaskProgress {
            shapes_sorted: r.get::<i64, _>(0),
            rounds_completed: r.get::<i64, _>(1),
        }))
    }

    /// Writes back a participant's counters and stamps the event time.
    ///
    /// The write is a single-row UPDATE; the counters belong to exactly one
    /// participant, so there is nothing to coordinate across rows.
    pub async fn save_task_progress(
        &self,
        participant_id: ParticipantId,
        progress: TaskProgress,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE participants
             SET shapes_sorted = ?, rounds_completed = ?, last_event_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(progress.shapes_sorted)
        .bind(progress.rounds_completed)
        .bind(participant_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks a participant as advanced past the task page.
    ///
    /// Advancing is one-shot: a second call leaves the first timestamp in
    /// place. Returns the timestamp and whether this call set it, or `None`
    /// for an unknown participant.
    pub async fn mark_advanced(
        &self,
        participant_id: ParticipantId,
    ) -> Result<Option<(DateTime<Utc>, bool)>> {
        let newly_advanced = sqlx::query(
            "UPDATE participants
             SET advanced_at = CURRENT_TIMESTAMP
             WHERE id = ? AND advanced_at IS NULL",
        )
        .bind(participant_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        let row = sqlx::query("SELECT advanced_at FROM participants WHERE id = ?")
            .bind(participant_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|r| r.get::<Option<DateTime<Utc>>, _>(0))
            .map(|advanced_at| (advanced_at, newly_advanced)))
    }
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredSession {
    StoredSession {
        session_id: SessionId(row.get::<i64, _>(0)),
        code: row.get::<String, _>(1),
        label: row.get::<Option<String>, _>(2),
        created_at: row.get::<DateTime<Utc>, _>(3),
    }
}

fn participant_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredParticipant {
    StoredParticipant {
        participant_id: ParticipantId(row.get::<i64, _>(0)),
        session_id: SessionId(row.get::<i64, _>(1)),
        code: row.get::<String, _>(2),
        label: row.get::<Option<String>, _>(3),
        progress: TaskProgress {
            shapes_sorted: row.get::<i64, _>(4),
            rounds_completed: row.get::<i64, _>(5),
        },
        advanced_at: row.get::<Option<DateTime<Utc>>, _>(6),
        last_event_at: row.get::<Option<DateTime<Utc>>, _>(7),
        created_at: row.get::<DateTime<Utc>, _>(8),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
