use anyhow::Result;
use rusqlite::Connection;
use uuid::Uuid;

use crate::Database;
use crate::models::parse_id;

impl Database {
    /// Idempotent. Returns true only when the edge was newly created.
    /// Self-follows hit the CHECK constraint and are ignored.
    pub fn follow(&self, follower_id: Uuid, followee_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO follows (follower_id, followee_id) VALUES (?1, ?2)",
                rusqlite::params![follower_id.to_string(), followee_id.to_string()],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Idempotent. Returns true only when an edge was removed.
    pub fn unfollow(&self, follower_id: Uuid, followee_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute(
                "DELETE FROM follows WHERE follower_id = ?1 AND followee_id = ?2",
                rusqlite::params![follower_id.to_string(), followee_id.to_string()],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn following_ids(&self, account_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| query_following_ids(conn, &account_id.to_string()))
    }

    pub fn follower_ids(&self, account_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| query_follower_ids(conn, &account_id.to_string()))
    }
}

pub(crate) fn query_following_ids(conn: &Connection, account_id: &str) -> Result<Vec<Uuid>> {
    query_ids(
        conn,
        "SELECT followee_id FROM follows WHERE follower_id = ?1 ORDER BY created_at",
        account_id,
    )
}

pub(crate) fn query_follower_ids(conn: &Connection, account_id: &str) -> Result<Vec<Uuid>> {
    query_ids(
        conn,
        "SELECT follower_id FROM follows WHERE followee_id = ?1 ORDER BY created_at",
        account_id,
    )
}

fn query_ids(conn: &Connection, sql: &str, param: &str) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([param], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids.iter().map(|id| parse_id(id)).collect())
}

#[cfg(test)]
mod tests {
    use crate::testutil;

    #[test]
    fn follow_then_unfollow_clears_both_sides() {
        let (_dir, db) = testutil::open();
        let a = testutil::account(&db, "anna");
        let b = testutil::account(&db, "bert");

        assert!(db.follow(a, b).unwrap());
        assert!(!db.follow(a, b).unwrap());
        assert_eq!(db.get_account(a).unwrap().unwrap().following, vec![b]);
        assert_eq!(db.get_account(b).unwrap().unwrap().followers, vec![a]);

        assert!(db.unfollow(a, b).unwrap());
        assert!(!db.unfollow(a, b).unwrap());
        assert!(!db.get_account(a).unwrap().unwrap().following.contains(&b));
        assert!(!db.get_account(b).unwrap().unwrap().followers.contains(&a));
    }

    #[test]
    fn self_follow_never_creates_an_edge() {
        let (_dir, db) = testutil::open();
        let a = testutil::account(&db, "solo");
        assert!(!db.follow(a, a).unwrap());
        assert!(db.following_ids(a).unwrap().is_empty());
    }
}
