use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rusqlite::types::ToSql;
use uuid::Uuid;

use domu_types::models::Session;

use super::OptionalExt;
use crate::Database;
use crate::models::{NewSession, SessionRow, from_unix, parse_id, parse_timestamp};

impl SessionRow {
    pub fn into_session(self) -> Session {
        Session {
            id: parse_id(&self.id),
            account_id: parse_id(&self.account_id),
            ip: self.ip,
            user_agent: self.user_agent,
            expires_at: from_unix(self.expires_at),
            created_at: parse_timestamp(&self.created_at),
        }
    }
}

impl Database {
    pub fn create_session(&self, new: &NewSession<'_>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, account_id, token_hash, ip, user_agent, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    new.id.to_string(),
                    new.account_id.to_string(),
                    new.token_hash,
                    new.ip,
                    new.user_agent,
                    new.expires_at.timestamp(),
                ],
            )?;
            Ok(())
        })
    }

    /// Session for `token_hash` that has not expired at `now`.
    pub fn get_live_session(&self, token_hash: &str, now: DateTime<Utc>) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, account_id, token_hash, ip, user_agent, expires_at, created_at
                 FROM sessions WHERE token_hash = ?1 AND expires_at > ?2",
                rusqlite::params![token_hash, now.timestamp()],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        account_id: row.get(1)?,
                        token_hash: row.get(2)?,
                        ip: row.get(3)?,
                        user_agent: row.get(4)?,
                        expires_at: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn session_exists(&self, session_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    [session_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn list_sessions(&self, account_id: Uuid) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, token_hash, ip, user_agent, expires_at, created_at
                 FROM sessions WHERE account_id = ?1
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map([account_id.to_string()], |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        account_id: row.get(1)?,
                        token_hash: row.get(2)?,
                        ip: row.get(3)?,
                        user_agent: row.get(4)?,
                        expires_at: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows.into_iter().map(SessionRow::into_session).collect())
        })
    }

    /// Id of the deleted session, `None` when nothing matched; callers treat
    /// that as success.
    pub fn delete_session_by_hash(&self, token_hash: &str) -> Result<Option<Uuid>> {
        self.with_conn_mut(|conn| {
            let id = delete_returning_ids(conn, "token_hash = ?1", &[&token_hash])?;
            Ok(id.into_iter().next())
        })
    }

    /// Deletes one session, scoped to its owner.
    pub fn delete_session(&self, account_id: Uuid, session_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "DELETE FROM sessions WHERE id = ?1 AND account_id = ?2",
                rusqlite::params![session_id.to_string(), account_id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn delete_sessions_for_account(&self, account_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn_mut(|conn| delete_returning_ids(conn, "account_id = ?1", &[&account_id.to_string()]))
    }

    pub fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.with_conn_mut(|conn| delete_returning_ids(conn, "expires_at <= ?1", &[&now.timestamp()]))
    }
}

/// `predicate` is one of our own literals.
fn delete_returning_ids(conn: &Connection, predicate: &str, params: &[&dyn ToSql]) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(&format!("DELETE FROM sessions WHERE {} RETURNING id", predicate))?;
    let ids = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids.iter().map(|id| parse_id(id)).collect())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use crate::models::NewSession;
    use crate::testutil;

    #[test]
    fn expired_sessions_are_not_live_and_get_pruned() {
        let (_dir, db) = testutil::open();
        let account = testutil::account(&db, "gina");
        let now = Utc::now();

        for (hash, expires_at) in [("live", now + Duration::hours(1)), ("dead", now - Duration::hours(1))] {
            db.create_session(&NewSession {
                id: Uuid::new_v4(),
                account_id: account,
                token_hash: hash,
                ip: Some("127.0.0.1"),
                user_agent: Some("test"),
                expires_at,
            })
            .unwrap();
        }

        assert!(db.get_live_session("live", now).unwrap().is_some());
        assert!(db.get_live_session("dead", now).unwrap().is_none());

        assert_eq!(db.delete_expired_sessions(now).unwrap().len(), 1);
        assert_eq!(db.list_sessions(account).unwrap().len(), 1);
    }

    #[test]
    fn session_delete_is_scoped_to_owner() {
        let (_dir, db) = testutil::open();
        let owner = testutil::account(&db, "hank");
        let other = testutil::account(&db, "ivy");
        let session_id = Uuid::new_v4();
        db.create_session(&NewSession {
            id: session_id,
            account_id: owner,
            token_hash: "h",
            ip: None,
            user_agent: None,
            expires_at: Utc::now() + Duration::days(7),
        })
        .unwrap();

        assert!(!db.delete_session(other, session_id).unwrap());
        assert!(db.delete_session(owner, session_id).unwrap());
        assert!(db.delete_session_by_hash("h").unwrap().is_none());
    }

    #[test]
    fn bulk_deletes_report_which_sessions_went() {
        let (_dir, db) = testutil::open();
        let owner = testutil::account(&db, "jade");
        let ids: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        for (id, hash) in ids.iter().zip(["a", "b"]) {
            db.create_session(&NewSession {
                id: *id,
                account_id: owner,
                token_hash: hash,
                ip: None,
                user_agent: None,
                expires_at: Utc::now() + Duration::days(1),
            })
            .unwrap();
        }

        assert_eq!(db.delete_session_by_hash("a").unwrap(), Some(ids[0]));
        assert!(!db.session_exists(ids[0]).unwrap());
        assert!(db.session_exists(ids[1]).unwrap());
        assert_eq!(db.delete_sessions_for_account(owner).unwrap(), vec![ids[1]]);
        assert!(db.delete_sessions_for_account(owner).unwrap().is_empty());
    }
}
