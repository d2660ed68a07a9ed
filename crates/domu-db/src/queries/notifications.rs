use anyhow::{Result, anyhow};
use rusqlite::Connection;
use rusqlite::types::ToSql;
use tracing::warn;
use uuid::Uuid;

use domu_types::models::{Notification, NotificationKind};

use crate::Database;
use crate::models::{parse_id, parse_opt_id, parse_timestamp};

const NOTIFICATION_COLUMNS: &str =
    "id, recipient_id, kind, message, related_id, actor_id, is_read, created_at";

fn map_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let id: String = row.get(0)?;
    let recipient: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let created_at: String = row.get(7)?;
    Ok(Notification {
        kind: kind.parse().unwrap_or_else(|e| {
            warn!("Corrupt kind on notification '{}': {}", id, e);
            NotificationKind::System
        }),
        id: parse_id(&id),
        recipient_id: parse_id(&recipient),
        message: row.get(3)?,
        related_id: parse_opt_id(row.get(4)?),
        actor_id: parse_opt_id(row.get(5)?),
        read: row.get(6)?,
        created_at: parse_timestamp(&created_at),
    })
}

impl Database {
    /// Stores a notification and returns it as persisted.
    pub fn insert_notification(
        &self,
        recipient_id: Uuid,
        kind: NotificationKind,
        message: &str,
        related_id: Option<Uuid>,
        actor_id: Option<Uuid>,
    ) -> Result<Notification> {
        let id = Uuid::new_v4();
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, recipient_id, kind, message, related_id, actor_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.to_string(),
                    recipient_id.to_string(),
                    kind.as_str(),
                    message,
                    related_id.map(|r| r.to_string()),
                    actor_id.map(|a| a.to_string()),
                ],
            )?;
            query_notification(conn, id)
        })
    }

    /// Newest first.
    pub fn list_notifications(&self, recipient_id: Uuid, limit: u32, unread_only: bool) -> Result<Vec<Notification>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM notifications
                 WHERE recipient_id = ?1 AND (?2 = 0 OR is_read = 0)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?3",
                NOTIFICATION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![recipient_id.to_string(), unread_only, limit],
                    map_notification,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn unread_count(&self, recipient_id: Uuid) -> Result<u32> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND is_read = 0",
                [recipient_id.to_string()],
                |r| r.get(0),
            )?;
            Ok(count)
        })
    }

    /// Marks the given ids read, scoped to the recipient. Unknown ids and ids
    /// owned by someone else are skipped. Returns the number of rows flipped.
    pub fn mark_read(&self, recipient_id: Uuid, ids: &[Uuid]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut params: Vec<String> = vec![recipient_id.to_string()];
        params.extend(ids.iter().map(|id| id.to_string()));
        let id_placeholders: Vec<String> = (2..=params.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "UPDATE notifications SET is_read = 1
             WHERE recipient_id = ?1 AND is_read = 0 AND id IN ({})",
            id_placeholders.join(", ")
        );

        self.with_conn_mut(|conn| {
            let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
            Ok(conn.execute(&sql, refs.as_slice())?)
        })
    }

    pub fn mark_all_read(&self, recipient_id: Uuid) -> Result<usize> {
        self.with_conn_mut(|conn| {
            Ok(conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE recipient_id = ?1 AND is_read = 0",
                [recipient_id.to_string()],
            )?)
        })
    }
}

fn query_notification(conn: &Connection, id: Uuid) -> Result<Notification> {
    conn.query_row(
        &format!("SELECT {} FROM notifications WHERE id = ?1", NOTIFICATION_COLUMNS),
        [id.to_string()],
        map_notification,
    )
    .map_err(|e| anyhow!("Notification {} not readable after insert: {}", id, e))
}
