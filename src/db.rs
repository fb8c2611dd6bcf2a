use log::{error, info};
use rusqlite::{params, Connection, Result};
use std::sync::{Mutex, PoisonError};

use crate::notifications::{Level, Notification};

/// Plain notifications kept once the newest are stored. Rows carrying a
/// dedupe key are never trimmed.
pub const MAX_NOTIFICATIONS: i64 = 200;

pub struct DatabaseService {
    conn: Mutex<Connection>,
}

impl DatabaseService {
    /// Creates a new `DatabaseService` and ensures the database connection is valid.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<()> {
        let conn = self.lock();

        info!("Initializing notification store...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dedupe_key TEXT UNIQUE,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        "#,
        ) {
            Ok(_) => {
                info!("Notification store initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize notification store: {:?}", e);
                Err(e)
            }
        }
    }

    /// Inserts a notification. Returns `false` when `dedupe_key` was already
    /// recorded, in which case nothing is written. Keyless rows beyond
    /// [`MAX_NOTIFICATIONS`] are dropped oldest first.
    pub fn insert_notification(
        &self,
        dedupe_key: Option<&str>,
        level: Level,
        message: &str,
        created_at: &str,
    ) -> Result<bool> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO notifications (dedupe_key, level, message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![dedupe_key, level.as_str(), message, created_at],
        )?;

        conn.execute(
            "DELETE FROM notifications
             WHERE id NOT IN (
                 SELECT id
                 FROM notifications
                 WHERE dedupe_key IS NULL
                 ORDER BY id DESC
                 LIMIT ?1
             ) AND dedupe_key IS NULL",
            params![MAX_NOTIFICATIONS],
        )?;
        Ok(inserted > 0)
    }

    /// Retrieves the newest `limit` notifications.
    pub fn recent_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let conn = self.lock();

        let mut stmt = conn.prepare(
            "SELECT id, dedupe_key, level, message, created_at FROM notifications
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let level: String = row.get(2)?;
            Ok(Notification {
                id: row.get(0)?,
                dedupe_key: row.get(1)?,
                level: Level::parse(&level),
                message: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DatabaseService {
        let db = DatabaseService::in_memory().unwrap();
        db.initialize_db().unwrap();
        db
    }

    #[test]
    fn dedupe_key_is_written_once() {
        let db = store();
        assert!(db
            .insert_notification(Some("connected"), Level::Success, "Connected", "t0")
            .unwrap());
        assert!(!db
            .insert_notification(Some("connected"), Level::Success, "Connected", "t1")
            .unwrap());
        assert_eq!(db.recent_notifications(10).unwrap().len(), 1);
    }

    #[test]
    fn notifications_without_key_are_never_deduplicated() {
        let db = store();
        db.insert_notification(None, Level::Error, "Timeout", "t0").unwrap();
        db.insert_notification(None, Level::Error, "Timeout", "t1").unwrap();
        let recent = db.recent_notifications(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].created_at, "t1");
    }

    #[test]
    fn plain_notifications_are_trimmed_to_the_newest() {
        let db = store();
        db.insert_notification(Some("connected:localhost:1883"), Level::Success, "Connected", "t0")
            .unwrap();
        for i in 0..MAX_NOTIFICATIONS + 25 {
            db.insert_notification(None, Level::Error, &format!("Timeout {}", i), "t")
                .unwrap();
        }

        let all = db.recent_notifications(1000).unwrap();
        assert_eq!(all.len() as i64, MAX_NOTIFICATIONS + 1);
        assert_eq!(all[0].message, format!("Timeout {}", MAX_NOTIFICATIONS + 24));
        assert!(all.iter().any(|n| n.dedupe_key.as_deref() == Some("connected:localhost:1883")));
        assert!(!all.iter().any(|n| n.message == "Timeout 0"));
    }
}
