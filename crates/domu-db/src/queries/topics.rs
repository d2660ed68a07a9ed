use anyhow::Result;
use rusqlite::Connection;
use uuid::Uuid;

use domu_types::models::DailyTopic;

use super::OptionalExt;
use crate::Database;
use crate::models::{parse_id, parse_timestamp};

const TOPIC_COLUMNS: &str = "id, title, description, is_active, created_at";

fn map_topic(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyTopic> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(4)?;
    Ok(DailyTopic {
        id: parse_id(&id),
        title: row.get(1)?,
        description: row.get(2)?,
        is_active: row.get(3)?,
        created_at: parse_timestamp(&created_at),
    })
}

impl Database {
    /// Inserts a topic; with `activate` it becomes the single active topic
    /// in the same transaction.
    pub fn insert_topic(&self, id: Uuid, title: &str, description: Option<&str>, activate: bool) -> Result<DailyTopic> {
        self.with_tx(|tx| {
            if activate {
                tx.execute("UPDATE daily_topics SET is_active = 0 WHERE is_active = 1", [])?;
            }
            tx.execute(
                "INSERT INTO daily_topics (id, title, description, is_active) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.to_string(), title, description, activate],
            )?;
            query_topic(tx, id)?.ok_or_else(|| anyhow::anyhow!("Topic {} vanished inside its own transaction", id))
        })
    }

    pub fn get_topic(&self, id: Uuid) -> Result<Option<DailyTopic>> {
        self.with_conn(|conn| query_topic(conn, id))
    }

    pub fn get_active_topic(&self) -> Result<Option<DailyTopic>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM daily_topics WHERE is_active = 1", TOPIC_COLUMNS),
                [],
                map_topic,
            )
            .optional()
        })
    }

    /// Newest first.
    pub fn list_topics(&self) -> Result<Vec<DailyTopic>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM daily_topics ORDER BY created_at DESC, rowid DESC",
                TOPIC_COLUMNS
            ))?;
            let topics = stmt
                .query_map([], map_topic)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(topics)
        })
    }

    pub fn update_topic(&self, id: Uuid, title: Option<&str>, description: Option<&str>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE daily_topics
                 SET title = COALESCE(?2, title),
                     description = COALESCE(?3, description)
                 WHERE id = ?1",
                rusqlite::params![id.to_string(), title, description],
            )?;
            Ok(changed > 0)
        })
    }

    /// Deactivate-all then activate-one as a single atomic unit, so no reader
    /// ever observes zero or two active topics mid-flight. Returns false
    /// (and changes nothing) when the topic does not exist.
    pub fn set_active_topic(&self, id: Uuid) -> Result<bool> {
        self.with_tx(|tx| {
            if query_topic(tx, id)?.is_none() {
                return Ok(false);
            }
            tx.execute("UPDATE daily_topics SET is_active = 0 WHERE is_active = 1 AND id != ?1", [id.to_string()])?;
            tx.execute("UPDATE daily_topics SET is_active = 1 WHERE id = ?1", [id.to_string()])?;
            Ok(true)
        })
    }

    pub fn deactivate_topic(&self, id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE daily_topics SET is_active = 0 WHERE id = ?1",
                [id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Threads answering the topic keep their content; their `topic_id` is cleared.
    pub fn delete_topic(&self, id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute("DELETE FROM daily_topics WHERE id = ?1", [id.to_string()])?;
            Ok(changed > 0)
        })
    }
}

fn query_topic(conn: &Connection, id: Uuid) -> Result<Option<DailyTopic>> {
    conn.query_row(
        &format!("SELECT {} FROM daily_topics WHERE id = ?1", TOPIC_COLUMNS),
        [id.to_string()],
        map_topic,
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use crate::testutil;

    #[test]
    fn activating_second_topic_leaves_exactly_one_active() {
        let (_dir, db) = testutil::open();
        let first = db.insert_topic(Uuid::new_v4(), "Favourite book", None, true).unwrap();
        let second = db.insert_topic(Uuid::new_v4(), "Best city", Some("and why"), false).unwrap();
        assert!(first.is_active);
        assert!(!second.is_active);

        assert!(db.set_active_topic(second.id).unwrap());

        let active: Vec<_> = db.list_topics().unwrap().into_iter().filter(|t| t.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
        assert_eq!(db.get_active_topic().unwrap().unwrap().id, second.id);
    }

    #[test]
    fn racing_activations_converge_on_one_active_topic() {
        let (_dir, db) = testutil::open();
        let ids: Vec<Uuid> = (0..4)
            .map(|i| db.insert_topic(Uuid::new_v4(), &format!("topic {}", i), None, false).unwrap().id)
            .collect();

        let db = Arc::new(db);
        let handles: Vec<_> = ids
            .iter()
            .copied()
            .map(|id| {
                let db = db.clone();
                std::thread::spawn(move || db.set_active_topic(id).unwrap())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }

        let active = db.list_topics().unwrap().into_iter().filter(|t| t.is_active).count();
        assert_eq!(active, 1);
    }

    #[test]
    fn activating_unknown_topic_changes_nothing() {
        let (_dir, db) = testutil::open();
        let topic = db.insert_topic(Uuid::new_v4(), "Only one", None, true).unwrap();
        assert!(!db.set_active_topic(Uuid::new_v4()).unwrap());
        assert_eq!(db.get_active_topic().unwrap().unwrap().id, topic.id);
    }
}
