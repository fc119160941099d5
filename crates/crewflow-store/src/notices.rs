use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crewflow_core::error::Result;
use crewflow_core::traits::SiteNotifier;
use crewflow_core::types::SiteNotice;

use crate::{db_err, ensure_parent};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS notices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        recipients TEXT NOT NULL,
        created_at TEXT NOT NULL,
        read INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_notices_tenant ON notices(tenant_id, id);
";

/// A notice as stored on the board.
#[derive(Debug, Clone)]
pub struct StoredNotice {
    pub id: i64,
    pub notice: SiteNotice,
    pub read: bool,
}

/// In-app notice board backed by SQLite.
///
/// A notice with no recipients is visible to everyone in its tenant.
pub struct SqliteNoticeBoard {
    conn: Mutex<Connection>,
}

impl SqliteNoticeBoard {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent(path)?;
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!(path = %path.display(), "Notice board opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Newest first. With a recipient, only notices addressed to them or to everyone.
    pub fn list(
        &self,
        tenant_id: &str,
        recipient: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredNotice>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, tenant_id, title, message, recipients, created_at, read
                 FROM notices
                 WHERE tenant_id = ?1
                 ORDER BY id DESC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![tenant_id], |row| {
                let recipients: String = row.get(4)?;
                let created_at: String = row.get(5)?;
                let read: i64 = row.get(6)?;
                Ok(StoredNotice {
                    id: row.get(0)?,
                    notice: SiteNotice {
                        tenant_id: row.get(1)?,
                        title: row.get(2)?,
                        message: row.get(3)?,
                        recipients: serde_json::from_str(&recipients).unwrap_or_default(),
                        created_at: DateTime::parse_from_rfc3339(&created_at)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    },
                    read: read != 0,
                })
            })
            .map_err(db_err)?;

        let mut notices: Vec<StoredNotice> = Vec::new();
        for row in rows {
            if notices.len() >= limit {
                break;
            }
            let stored = row.map_err(db_err)?;
            let visible = match recipient {
                Some(user) => {
                    stored.notice.recipients.is_empty()
                        || stored.notice.recipients.iter().any(|r| r == user)
                }
                None => true,
            };
            if visible {
                notices.push(stored);
            }
        }
        Ok(notices)
    }

    /// Returns whether the notice existed.
    pub fn mark_read(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().map_err(db_err)?;
        let n = conn
            .execute("UPDATE notices SET read = 1 WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(n > 0)
    }
}

impl SiteNotifier for SqliteNoticeBoard {
    fn post(&self, notice: SiteNotice) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let recipients = serde_json::to_string(&notice.recipients)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO notices (tenant_id, title, message, recipients, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    notice.tenant_id,
                    notice.title,
                    notice.message,
                    recipients,
                    notice.created_at.to_rfc3339()
                ],
            )
            .map_err(db_err)?;
            info!(tenant_id = %notice.tenant_id, title = %notice.title, "Site notice posted");
            Ok(())
        })
    }
}
