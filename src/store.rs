use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::{DailySchedule, Preferences, Subscription};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subscriptions (
    user_id    TEXT PRIMARY KEY,
    endpoint   TEXT NOT NULL,
    p256dh     TEXT NOT NULL,
    auth       TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS preferences (
    user_id        TEXT PRIMARY KEY,
    daily_reminder INTEGER NOT NULL DEFAULT 1,
    friend_posts   INTEGER NOT NULL DEFAULT 1,
    updated_at     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS daily_schedule (
    scheduled_time TEXT NOT NULL,
    generated_at   TEXT NOT NULL
);
";

/// SQLite-backed store for the three notification entities. All writes that
/// must be atomic (subscription replace, schedule replace) run inside a
/// transaction on the single shared connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;

        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store mutex poisoned"))
    }

    /// Register an endpoint for a user, replacing any previous registration
    /// (delete-then-insert, never a second row). Lazily creates the user's
    /// preference row with both flags on.
    pub fn replace_subscription(
        &self,
        user_id: &str,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM subscriptions WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.execute(
            "INSERT INTO subscriptions (user_id, endpoint, p256dh, auth, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, endpoint, p256dh, auth, now],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO preferences (user_id, daily_reminder, friend_posts, updated_at)
             VALUES (?1, 1, 1, ?2)",
            params![user_id, now],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn delete_subscription(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM subscriptions WHERE user_id = ?1",
            params![user_id],
        )?;

        Ok(deleted > 0)
    }

    pub fn subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
        let conn = self.conn()?;
        let subscription = conn
            .query_row(
                "SELECT user_id, endpoint, p256dh, auth, created_at
                 FROM subscriptions WHERE user_id = ?1",
                params![user_id],
                row_to_subscription,
            )
            .optional()?;

        Ok(subscription)
    }

    /// Read a user's preferences, falling back to the implicit default when
    /// no row has been created yet.
    pub fn preferences(&self, user_id: &str) -> Result<Preferences> {
        let conn = self.conn()?;
        let preferences = conn
            .query_row(
                "SELECT user_id, daily_reminder, friend_posts, updated_at
                 FROM preferences WHERE user_id = ?1",
                params![user_id],
                row_to_preferences,
            )
            .optional()?;

        Ok(preferences.unwrap_or_else(|| Preferences::default_for(user_id, Utc::now())))
    }

    /// Apply a partial preference update, creating the row from the default
    /// if the user never subscribed.
    pub fn update_preferences(
        &self,
        user_id: &str,
        daily_reminder: Option<bool>,
        friend_posts: Option<bool>,
        now: DateTime<Utc>,
    ) -> Result<Preferences> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current = tx
            .query_row(
                "SELECT user_id, daily_reminder, friend_posts, updated_at
                 FROM preferences WHERE user_id = ?1",
                params![user_id],
                row_to_preferences,
            )
            .optional()?;

        let mut preferences = current.unwrap_or_else(|| Preferences::default_for(user_id, now));
        if let Some(value) = daily_reminder {
            preferences.daily_reminder = value;
        }
        if let Some(value) = friend_posts {
            preferences.friend_posts = value;
        }
        preferences.updated_at = now;

        tx.execute(
            "INSERT INTO preferences (user_id, daily_reminder, friend_posts, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id) DO UPDATE
             SET daily_reminder = ?2, friend_posts = ?3, updated_at = ?4",
            params![
                user_id,
                preferences.daily_reminder,
                preferences.friend_posts,
                now
            ],
        )?;

        tx.commit()?;
        Ok(preferences)
    }

    /// Everyone who should receive the daily reminder: subscriptions joined
    /// against preferences, not a per-subscription scan.
    pub fn daily_reminder_recipients(&self) -> Result<Vec<Subscription>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.user_id, s.endpoint, s.p256dh, s.auth, s.created_at
             FROM subscriptions s
             INNER JOIN preferences p ON p.user_id = s.user_id
             WHERE p.daily_reminder = 1",
        )?;
        let rows = stmt.query_map([], row_to_subscription)?;

        collect_subscriptions(rows)
    }

    /// Everyone who should hear about a new post: friend-posts opt-ins,
    /// excluding the poster themselves.
    pub fn friend_post_recipients(&self, poster_id: &str) -> Result<Vec<Subscription>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.user_id, s.endpoint, s.p256dh, s.auth, s.created_at
             FROM subscriptions s
             INNER JOIN preferences p ON p.user_id = s.user_id
             WHERE p.friend_posts = 1 AND s.user_id != ?1",
        )?;
        let rows = stmt.query_map(params![poster_id], row_to_subscription)?;

        collect_subscriptions(rows)
    }

    pub fn schedule(&self) -> Result<Option<DailySchedule>> {
        let conn = self.conn()?;
        let schedule = conn
            .query_row(
                "SELECT scheduled_time, generated_at FROM daily_schedule LIMIT 1",
                [],
                |row| {
                    Ok(DailySchedule {
                        scheduled_time: row.get(0)?,
                        generated_at: row.get(1)?,
                    })
                },
            )
            .optional()?;

        Ok(schedule)
    }

    /// Replace the singleton schedule row: clear-then-insert in one
    /// transaction so a concurrent reader never observes a partial record.
    pub fn replace_schedule(&self, schedule: DailySchedule) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM daily_schedule", [])?;
        tx.execute(
            "INSERT INTO daily_schedule (scheduled_time, generated_at) VALUES (?1, ?2)",
            params![schedule.scheduled_time, schedule.generated_at],
        )?;

        tx.commit()?;
        Ok(())
    }
}

fn row_to_subscription(row: &Row) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        user_id: row.get(0)?,
        endpoint: row.get(1)?,
        p256dh: row.get(2)?,
        auth: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_preferences(row: &Row) -> rusqlite::Result<Preferences> {
    Ok(Preferences {
        user_id: row.get(0)?,
        daily_reminder: row.get(1)?,
        friend_posts: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn collect_subscriptions(
    rows: impl Iterator<Item = rusqlite::Result<Subscription>>,
) -> Result<Vec<Subscription>> {
    let mut subscriptions = Vec::new();
    for row in rows {
        subscriptions.push(row?);
    }

    Ok(subscriptions)
}
