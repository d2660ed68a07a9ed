use anyhow::Result;
use rusqlite::Connection;
use uuid::Uuid;

use domu_types::models::{Account, Role};

use super::OptionalExt;
use super::social::{query_follower_ids, query_following_ids};
use crate::Database;
use crate::models::{AccountRow, NewAccount};

const ACCOUNT_COLUMNS: &str =
    "id, username, email, display_name, password_hash, avatar, bio, role, created_at";

impl Database {
    pub fn create_account(&self, new: &NewAccount) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO accounts (id, username, email, display_name, password_hash, avatar, bio, role)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    new.id.to_string(),
                    new.username,
                    new.email,
                    new.display_name,
                    new.password_hash,
                    new.avatar,
                    new.bio,
                    new.role.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    /// Full account view including follow sets.
    pub fn get_account(&self, id: Uuid) -> Result<Option<Account>> {
        self.with_conn(|conn| {
            let row = query_account_row(conn, "id", &id.to_string())?;
            row.map(|row| hydrate(conn, row)).transpose()
        })
    }

    /// Raw row (with password hash) for credential checks.
    pub fn get_account_row_by_email(&self, email: &str) -> Result<Option<AccountRow>> {
        self.with_conn(|conn| query_account_row(conn, "email", email))
    }

    pub fn get_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        self.with_conn(|conn| {
            let row = query_account_row(conn, "email", email)?;
            row.map(|row| hydrate(conn, row)).transpose()
        })
    }

    /// Returns `(email_taken, username_taken)`.
    pub fn identity_taken(&self, email: &str, username: &str) -> Result<(bool, bool)> {
        self.with_conn(|conn| {
            let email_taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM accounts WHERE email = ?1)",
                [email],
                |r| r.get(0),
            )?;
            let username_taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM accounts WHERE username = ?1 COLLATE NOCASE)",
                [username],
                |r| r.get(0),
            )?;
            Ok((email_taken, username_taken))
        })
    }

    pub fn account_exists(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM accounts WHERE id = ?1)",
                [id.to_string()],
                |r| r.get(0),
            )?;
            Ok(exists)
        })
    }

    pub fn list_accounts(&self, limit: u32, offset: u32) -> Result<Vec<Account>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM accounts ORDER BY created_at ASC, rowid ASC LIMIT ?1 OFFSET ?2",
                ACCOUNT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![limit, offset], map_account_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(|row| hydrate(conn, row)).collect()
        })
    }

    /// `None` leaves a field unchanged. Returns false when the account is gone.
    pub fn update_profile(
        &self,
        id: Uuid,
        display_name: Option<&str>,
        bio: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE accounts
                 SET display_name = COALESCE(?2, display_name),
                     bio = COALESCE(?3, bio),
                     avatar = COALESCE(?4, avatar)
                 WHERE id = ?1",
                rusqlite::params![id.to_string(), display_name, bio, avatar],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_role(&self, id: Uuid, role: Role) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE accounts SET role = ?2 WHERE id = ?1",
                rusqlite::params![id.to_string(), role.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Cascades to sessions, threads, likes, comments, follows, memberships
    /// and notifications through foreign keys.
    pub fn delete_account(&self, id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute("DELETE FROM accounts WHERE id = ?1", [id.to_string()])?;
            Ok(changed > 0)
        })
    }
}

fn map_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        password_hash: row.get(4)?,
        avatar: row.get(5)?,
        bio: row.get(6)?,
        role: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// `column` is always one of our own literals, never user input.
fn query_account_row(conn: &Connection, column: &str, value: &str) -> Result<Option<AccountRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM accounts WHERE {} = ?1",
        ACCOUNT_COLUMNS, column
    ))?;
    stmt.query_row([value], map_account_row).optional()
}

fn hydrate(conn: &Connection, row: AccountRow) -> Result<Account> {
    let following = query_following_ids(conn, &row.id)?;
    let followers = query_follower_ids(conn, &row.id)?;
    Ok(row.into_account(following, followers))
}

#[cfg(test)]
mod tests {
    use crate::testutil;
    use domu_types::models::Role;

    #[test]
    fn profile_update_keeps_unset_fields() {
        let (_dir, db) = testutil::open();
        let id = testutil::account(&db, "carol");

        assert!(db.update_profile(id, None, Some("hello"), None).unwrap());
        let account = db.get_account(id).unwrap().unwrap();
        assert_eq!(account.display_name, "CAROL");
        assert_eq!(account.bio.as_deref(), Some("hello"));
    }

    #[test]
    fn username_check_ignores_case() {
        let (_dir, db) = testutil::open();
        testutil::account(&db, "dave");
        assert_eq!(db.identity_taken("new@example.com", "DAVE").unwrap(), (false, true));
        assert_eq!(db.identity_taken("dave@example.com", "eve").unwrap(), (true, false));
    }

    #[test]
    fn delete_cascades_sessions() {
        let (_dir, db) = testutil::open();
        let id = testutil::account(&db, "frank");
        db.create_session(&crate::models::NewSession {
            id: uuid::Uuid::new_v4(),
            account_id: id,
            token_hash: "abc",
            ip: None,
            user_agent: None,
            expires_at: chrono::Utc::now() + chrono::Duration::days(1),
        })
        .unwrap();

        assert!(db.set_role(id, Role::Admin).unwrap());
        assert!(db.delete_account(id).unwrap());
        assert!(db.get_account(id).unwrap().is_none());
        assert!(db.list_sessions(id).unwrap().is_empty());
    }
}
