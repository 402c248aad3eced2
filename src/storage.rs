use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::event::{Event, Seq};
use crate::source::Checkpoint;

/// A writeup waiting for a reviewer's decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReview {
    pub id: String,
    pub user_id: u64,
    pub username: Option<String>,
    pub file_id: String,
    pub reviewer_id: u64,
    pub created_at: String,
}

/// Thread-safe SQLite store for review data and the update checkpoint
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        // Run migrations on the raw connection before wrapping in Mutex.
        Self::run_migrations(&conn)?;

        info!("Store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            -- Reviewers in rotation order
            CREATE TABLE IF NOT EXISTS reviewers (
                position INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL UNIQUE
            );

            -- Single-row rotation cursor
            CREATE TABLE IF NOT EXISTS rotation (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                next_index INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO rotation (id, next_index) VALUES (0, 0);

            -- Submissions awaiting a decision, one per applicant
            CREATE TABLE IF NOT EXISTS pending_reviews (
                user_id INTEGER PRIMARY KEY,
                id TEXT NOT NULL,
                username TEXT,
                file_id TEXT NOT NULL,
                reviewer_id INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS blocked_users (
                user_id INTEGER PRIMARY KEY,
                blocked_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Update source checkpoint
            CREATE TABLE IF NOT EXISTS update_cursor (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                watermark INTEGER
            );

            CREATE TABLE IF NOT EXISTS completed_updates (
                seq INTEGER PRIMARY KEY
            );

            -- Accepted webhook updates that were not dispatched before shutdown
            CREATE TABLE IF NOT EXISTS stranded_updates (
                seq INTEGER PRIMARY KEY,
                event TEXT NOT NULL
            );
            ",
        )
        .context("Failed to run migrations")?;
        Ok(())
    }

    // ── Reviewers ─────────────────────────────────────────────────────────

    pub async fn add_reviewer(&self, user_id: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO reviewers (user_id) VALUES (?1)",
            rusqlite::params![user_id as i64],
        )
        .context("Failed to add reviewer")?;
        Ok(())
    }

    pub async fn reviewers(&self) -> Result<Vec<u64>> {
        let conn = self.conn.lock().await;
        Self::reviewers_locked(&conn)
    }

    fn reviewers_locked(conn: &Connection) -> Result<Vec<u64>> {
        let mut stmt = conn.prepare("SELECT user_id FROM reviewers ORDER BY position ASC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load reviewers")?;
        Ok(ids.into_iter().map(|id| id as u64).collect())
    }

    pub async fn is_reviewer(&self, user_id: u64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT user_id FROM reviewers WHERE user_id = ?1",
                rusqlite::params![user_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Round-robin pick. Advances the rotation in the same critical section.
    pub async fn next_reviewer(&self) -> Result<Option<u64>> {
        let conn = self.conn.lock().await;
        let reviewers = Self::reviewers_locked(&conn)?;
        if reviewers.is_empty() {
            return Ok(None);
        }

        let index: i64 = conn.query_row("SELECT next_index FROM rotation WHERE id = 0", [], |row| {
            row.get(0)
        })?;
        let len = reviewers.len() as i64;
        let reviewer = reviewers[index.rem_euclid(len) as usize];

        conn.execute(
            "UPDATE rotation SET next_index = ?1 WHERE id = 0",
            rusqlite::params![(index + 1).rem_euclid(len)],
        )
        .context("Failed to advance reviewer rotation")?;
        Ok(Some(reviewer))
    }

    // ── Pending reviews ───────────────────────────────────────────────────

    /// Record a submission. A newer submission from the same user replaces
    /// the older one.
    pub async fn put_pending(
        &self,
        user_id: u64,
        username: Option<&str>,
        file_id: &str,
        reviewer_id: u64,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pending_reviews (user_id, id, username, file_id, reviewer_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                id = excluded.id,
                username = excluded.username,
                file_id = excluded.file_id,
                reviewer_id = excluded.reviewer_id,
                created_at = datetime('now')",
            rusqlite::params![user_id as i64, &id, username, file_id, reviewer_id as i64],
        )
        .context("Failed to store pending review")?;
        Ok(id)
    }

    pub async fn get_pending(&self, user_id: u64) -> Result<Option<PendingReview>> {
        let conn = self.conn.lock().await;
        Self::get_pending_locked(&conn, user_id)
    }

    fn get_pending_locked(conn: &Connection, user_id: u64) -> Result<Option<PendingReview>> {
        conn.query_row(
            "SELECT id, user_id, username, file_id, reviewer_id, created_at
             FROM pending_reviews WHERE user_id = ?1",
            rusqlite::params![user_id as i64],
            |row| {
                Ok(PendingReview {
                    id: row.get(0)?,
                    user_id: row.get::<_, i64>(1)? as u64,
                    username: row.get(2)?,
                    file_id: row.get(3)?,
                    reviewer_id: row.get::<_, i64>(4)? as u64,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()
        .context("Failed to query pending review")
    }

    /// Remove and return the user's pending submission. Only one caller can
    /// win for a given submission.
    pub async fn take_pending(&self, user_id: u64) -> Result<Option<PendingReview>> {
        let conn = self.conn.lock().await;
        let pending = Self::get_pending_locked(&conn, user_id)?;
        if pending.is_some() {
            conn.execute(
                "DELETE FROM pending_reviews WHERE user_id = ?1",
                rusqlite::params![user_id as i64],
            )
            .context("Failed to remove pending review")?;
        }
        Ok(pending)
    }

    // ── Block list ────────────────────────────────────────────────────────

    pub async fn is_blocked(&self, user_id: u64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT user_id FROM blocked_users WHERE user_id = ?1",
                rusqlite::params![user_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub async fn block(&self, user_id: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO blocked_users (user_id) VALUES (?1)",
            rusqlite::params![user_id as i64],
        )
        .context("Failed to block user")?;
        Ok(())
    }

    /// Returns false when the user was not blocked.
    pub async fn unblock(&self, user_id: u64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM blocked_users WHERE user_id = ?1",
                rusqlite::params![user_id as i64],
            )
            .context("Failed to unblock user")?;
        Ok(removed > 0)
    }

    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().await.execute_batch(sql)?;
        Ok(())
    }

    // ── Update checkpoint ─────────────────────────────────────────────────

    pub async fn load_checkpoint(&self) -> Result<Checkpoint> {
        let conn = self.conn.lock().await;
        let watermark: Option<Seq> = conn
            .query_row("SELECT watermark FROM update_cursor WHERE id = 0", [], |row| {
                row.get::<_, Option<Seq>>(0)
            })
            .optional()?
            .flatten();

        let mut stmt = conn.prepare("SELECT seq FROM completed_updates ORDER BY seq ASC")?;
        let completed = stmt
            .query_map([], |row| row.get::<_, Seq>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load completed updates")?;

        let mut stmt = conn.prepare("SELECT event FROM stranded_updates ORDER BY seq ASC")?;
        let stranded = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load stranded updates")?
            .iter()
            .map(|json| serde_json::from_str::<Event>(json))
            .collect::<serde_json::Result<Vec<_>>>()
            .context("Failed to decode stranded update")?;

        Ok(Checkpoint {
            watermark,
            completed,
            stranded,
        })
    }

    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO update_cursor (id, watermark) VALUES (0, ?1)
             ON CONFLICT(id) DO UPDATE SET watermark = excluded.watermark",
            rusqlite::params![checkpoint.watermark],
        )?;
        tx.execute("DELETE FROM completed_updates", [])?;
        for seq in &checkpoint.completed {
            tx.execute(
                "INSERT OR IGNORE INTO completed_updates (seq) VALUES (?1)",
                rusqlite::params![seq],
            )?;
        }
        tx.execute("DELETE FROM stranded_updates", [])?;
        for event in &checkpoint.stranded {
            tx.execute(
                "INSERT OR REPLACE INTO stranded_updates (seq, event) VALUES (?1, ?2)",
                rusqlite::params![event.seq, serde_json::to_string(event)?],
            )?;
        }
        tx.commit().context("Failed to save update checkpoint")?;
        Ok(())
    }
}
