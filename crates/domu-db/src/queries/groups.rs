use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use domu_types::models::{Group, GroupMember, GroupMessage, GroupRole};

use super::OptionalExt;
use crate::Database;
use crate::models::{author_from_row, format_timestamp, parse_id, parse_timestamp};

const GROUP_SELECT: &str = "
    SELECT g.id, g.name, g.description, g.owner_id, g.is_private, g.created_at,
           (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id)
    FROM chat_groups g";

fn map_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let id: String = row.get(0)?;
    let owner: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    Ok(Group {
        id: parse_id(&id),
        name: row.get(1)?,
        description: row.get(2)?,
        owner_id: parse_id(&owner),
        is_private: row.get(4)?,
        created_at: parse_timestamp(&created_at),
        member_count: row.get(6)?,
    })
}

impl Database {
    /// Creates the group and its owner membership atomically.
    pub fn create_group(
        &self,
        id: Uuid,
        name: &str,
        description: Option<&str>,
        owner_id: Uuid,
        is_private: bool,
    ) -> Result<Group> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO chat_groups (id, name, description, owner_id, is_private) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.to_string(), name, description, owner_id.to_string(), is_private],
            )?;
            tx.execute(
                "INSERT INTO group_members (group_id, account_id, role) VALUES (?1, ?2, ?3)",
                rusqlite::params![id.to_string(), owner_id.to_string(), GroupRole::Owner.as_str()],
            )?;
            query_group(tx, id)?.ok_or_else(|| anyhow!("Group {} vanished inside its own transaction", id))
        })
    }

    pub fn get_group(&self, id: Uuid) -> Result<Option<Group>> {
        self.with_conn(|conn| query_group(conn, id))
    }

    /// Public groups plus private groups `viewer` belongs to.
    pub fn list_groups(&self, viewer: Uuid) -> Result<Vec<Group>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE g.is_private = 0
                    OR EXISTS (SELECT 1 FROM group_members m WHERE m.group_id = g.id AND m.account_id = ?1)
                 ORDER BY g.created_at DESC, g.rowid DESC",
                GROUP_SELECT
            ))?;
            let groups = stmt
                .query_map([viewer.to_string()], map_group)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(groups)
        })
    }

    pub fn update_group(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
        is_private: Option<bool>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE chat_groups
                 SET name = COALESCE(?2, name),
                     description = COALESCE(?3, description),
                     is_private = COALESCE(?4, is_private)
                 WHERE id = ?1",
                rusqlite::params![id.to_string(), name, description, is_private],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn delete_group(&self, id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute("DELETE FROM chat_groups WHERE id = ?1", [id.to_string()])?;
            Ok(changed > 0)
        })
    }

    // -- Membership --

    pub fn member_role(&self, group_id: Uuid, account_id: Uuid) -> Result<Option<GroupRole>> {
        self.with_conn(|conn| {
            let role: Option<String> = conn
                .query_row(
                    "SELECT role FROM group_members WHERE group_id = ?1 AND account_id = ?2",
                    rusqlite::params![group_id.to_string(), account_id.to_string()],
                    |r| r.get(0),
                )
                .optional()?;
            role.map(|r| r.parse::<GroupRole>().map_err(|e: String| anyhow!(e))).transpose()
        })
    }

    /// Adds a plain member and accepts any pending invite in one transaction.
    /// Returns false when the account was already a member.
    pub fn join_group(&self, group_id: Uuid, account_id: Uuid) -> Result<bool> {
        self.with_tx(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO group_members (group_id, account_id, role) VALUES (?1, ?2, ?3)",
                rusqlite::params![group_id.to_string(), account_id.to_string(), GroupRole::Member.as_str()],
            )?;
            tx.execute(
                "UPDATE group_invites SET status = 'accepted'
                 WHERE group_id = ?1 AND invitee_id = ?2 AND status = 'pending'",
                rusqlite::params![group_id.to_string(), account_id.to_string()],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn leave_group(&self, group_id: Uuid, account_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND account_id = ?2",
                rusqlite::params![group_id.to_string(), account_id.to_string()],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn list_members(&self, group_id: Uuid) -> Result<Vec<GroupMember>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.role, m.joined_at, m.account_id, a.username, a.display_name, a.avatar
                 FROM group_members m
                 LEFT JOIN accounts a ON a.id = m.account_id
                 WHERE m.group_id = ?1
                 ORDER BY m.joined_at ASC, m.rowid ASC",
            )?;
            let members = stmt
                .query_map([group_id.to_string()], |row| {
                    let role: String = row.get(0)?;
                    let joined_at: String = row.get(1)?;
                    Ok(GroupMember {
                        role: role.parse().unwrap_or(GroupRole::Member),
                        joined_at: parse_timestamp(&joined_at),
                        account: author_from_row(row, 2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(members)
        })
    }

    pub fn member_ids(&self, group_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT account_id FROM group_members WHERE group_id = ?1")?;
            let ids = stmt
                .query_map([group_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids.iter().map(|id| parse_id(id)).collect())
        })
    }

    // -- Invites --

    /// Records a pending invite. Re-inviting someone whose earlier invite was
    /// accepted (and who has since left) reopens it. Returns false when a
    /// pending invite already exists.
    pub fn create_invite(&self, group_id: Uuid, inviter_id: Uuid, invitee_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "INSERT INTO group_invites (id, group_id, inviter_id, invitee_id) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(group_id, invitee_id) DO UPDATE
                    SET status = 'pending', inviter_id = excluded.inviter_id
                    WHERE group_invites.status != 'pending'",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    group_id.to_string(),
                    inviter_id.to_string(),
                    invitee_id.to_string(),
                ],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn has_pending_invite(&self, group_id: Uuid, invitee_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM group_invites
                    WHERE group_id = ?1 AND invitee_id = ?2 AND status = 'pending')",
                rusqlite::params![group_id.to_string(), invitee_id.to_string()],
                |r| r.get(0),
            )?;
            Ok(exists)
        })
    }

    // -- Chat --

    pub fn insert_group_message(
        &self,
        id: Uuid,
        group_id: Uuid,
        author_id: Uuid,
        content: &str,
        attachment_url: Option<&str>,
    ) -> Result<GroupMessage> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO group_messages (id, group_id, author_id, content, attachment_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.to_string(),
                    group_id.to_string(),
                    author_id.to_string(),
                    content,
                    attachment_url,
                    format_timestamp(Utc::now()),
                ],
            )?;
            let mut messages = query_group_messages(conn, "gm.id = ?1", &id.to_string(), None, 1)?;
            messages.pop().ok_or_else(|| anyhow!("Group message {} not readable after insert", id))
        })
    }

    /// The latest `limit` messages (older than `before` when given), returned
    /// oldest first for display.
    pub fn list_group_messages(
        &self,
        group_id: Uuid,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<GroupMessage>> {
        let before = before.map(format_timestamp);
        self.with_conn(|conn| {
            let mut messages =
                query_group_messages(conn, "gm.group_id = ?1", &group_id.to_string(), before.as_deref(), limit)?;
            messages.reverse();
            Ok(messages)
        })
    }
}

fn query_group(conn: &Connection, id: Uuid) -> Result<Option<Group>> {
    conn.query_row(
        &format!("{} WHERE g.id = ?1", GROUP_SELECT),
        [id.to_string()],
        map_group,
    )
    .optional()
}

/// Newest first. `predicate` is one of our own literals binding `?1`.
fn query_group_messages(
    conn: &Connection,
    predicate: &str,
    key: &str,
    before: Option<&str>,
    limit: u32,
) -> Result<Vec<GroupMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT gm.id, gm.group_id, gm.content, gm.attachment_url, gm.created_at,
                gm.author_id, a.username, a.display_name, a.avatar
         FROM group_messages gm
         LEFT JOIN accounts a ON a.id = gm.author_id
         WHERE {} AND (?2 IS NULL OR gm.created_at < ?2)
         ORDER BY gm.created_at DESC, gm.rowid DESC
         LIMIT ?3",
        predicate
    ))?;
    let messages = stmt
        .query_map(rusqlite::params![key, before, limit], |row| {
            let id: String = row.get(0)?;
            let group_id: String = row.get(1)?;
            let created_at: String = row.get(4)?;
            Ok(GroupMessage {
                id: parse_id(&id),
                group_id: parse_id(&group_id),
                content: row.get(2)?,
                attachment_url: row.get(3)?,
                created_at: parse_timestamp(&created_at),
                author: author_from_row(row, 5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use domu_types::models::GroupRole;
    use uuid::Uuid;

    use crate::testutil;

    #[test]
    fn owner_is_a_member_from_the_start() {
        let (_dir, db) = testutil::open();
        let owner = testutil::account(&db, "tess");
        let group = db.create_group(Uuid::new_v4(), "climbers", None, owner, false).unwrap();

        assert_eq!(group.member_count, 1);
        assert_eq!(db.member_role(group.id, owner).unwrap(), Some(GroupRole::Owner));
        assert!(!db.join_group(group.id, owner).unwrap());
    }

    #[test]
    fn private_groups_are_hidden_from_outsiders() {
        let (_dir, db) = testutil::open();
        let owner = testutil::account(&db, "uma");
        let outsider = testutil::account(&db, "vic");
        db.create_group(Uuid::new_v4(), "open", None, owner, false).unwrap();
        let secret = db.create_group(Uuid::new_v4(), "secret", None, owner, true).unwrap();

        let names: Vec<_> = db.list_groups(outsider).unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["open".to_string()]);
        assert_eq!(db.list_groups(owner).unwrap().len(), 2);

        assert!(db.create_invite(secret.id, owner, outsider).unwrap());
        assert!(!db.create_invite(secret.id, owner, outsider).unwrap());
        assert!(db.has_pending_invite(secret.id, outsider).unwrap());

        assert!(db.join_group(secret.id, outsider).unwrap());
        assert!(!db.has_pending_invite(secret.id, outsider).unwrap());
        assert_eq!(db.member_ids(secret.id).unwrap().len(), 2);
    }

    #[test]
    fn chat_history_is_oldest_first() {
        let (_dir, db) = testutil::open();
        let owner = testutil::account(&db, "wes");
        let group = db.create_group(Uuid::new_v4(), "chat", None, owner, false).unwrap();
        for text in ["one", "two", "three"] {
            db.insert_group_message(Uuid::new_v4(), group.id, owner, text, None).unwrap();
        }

        let latest_two: Vec<_> = db
            .list_group_messages(group.id, 2, None)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(latest_two, vec!["two".to_string(), "three".to_string()]);
    }

    #[test]
    fn older_history_pages_by_cursor() {
        let (_dir, db) = testutil::open();
        let owner = testutil::account(&db, "xena");
        let group = db.create_group(Uuid::new_v4(), "history", None, owner, false).unwrap();
        for text in ["one", "two", "three"] {
            db.insert_group_message(Uuid::new_v4(), group.id, owner, text, None).unwrap();
        }

        let latest = db.list_group_messages(group.id, 2, None).unwrap();
        let older: Vec<_> = db
            .list_group_messages(group.id, 2, Some(latest[0].created_at))
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(older, vec!["one".to_string()]);
    }
}
