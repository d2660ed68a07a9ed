use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;
use rusqlite::types::ToSql;
use uuid::Uuid;

use domu_types::models::{AuthorSummary, Comment, Thread};

use super::{OptionalExt, placeholders};
use crate::Database;
use crate::models::{
    ThreadFilter, author_from_row, format_timestamp, parse_id, parse_opt_id, parse_timestamp,
};

// JOIN accounts to fetch author fields in a single query (no N+1)
const THREAD_SELECT: &str = "
    SELECT t.id, t.content, t.image_url, t.topic_id, t.created_at, t.updated_at,
           (SELECT COUNT(*) FROM comments c WHERE c.thread_id = t.id),
           t.author_id, a.username, a.display_name, a.avatar
    FROM threads t
    LEFT JOIN accounts a ON a.id = t.author_id";

struct ThreadRow {
    id: String,
    content: String,
    image_url: Option<String>,
    topic_id: Option<String>,
    created_at: String,
    updated_at: String,
    comment_count: u32,
    author: AuthorSummary,
}

fn map_thread_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadRow> {
    Ok(ThreadRow {
        id: row.get(0)?,
        content: row.get(1)?,
        image_url: row.get(2)?,
        topic_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        comment_count: row.get(6)?,
        author: author_from_row(row, 7)?,
    })
}

impl Database {
    pub fn insert_thread(
        &self,
        id: Uuid,
        author_id: Uuid,
        content: &str,
        image_url: Option<&str>,
        topic_id: Option<Uuid>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO threads (id, author_id, content, image_url, topic_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![
                    id.to_string(),
                    author_id.to_string(),
                    content,
                    image_url,
                    topic_id.map(|t| t.to_string()),
                    format_timestamp(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_thread(&self, id: Uuid) -> Result<Option<Thread>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{} WHERE t.id = ?1", THREAD_SELECT),
                    [id.to_string()],
                    map_thread_row,
                )
                .optional()?;
            match row {
                Some(row) => Ok(hydrate(conn, vec![row])?.pop()),
                None => Ok(None),
            }
        })
    }

    pub fn thread_author(&self, id: Uuid) -> Result<Option<Uuid>> {
        self.with_conn(|conn| {
            let author: Option<String> = conn
                .query_row("SELECT author_id FROM threads WHERE id = ?1", [id.to_string()], |r| {
                    r.get(0)
                })
                .optional()?;
            Ok(author.as_deref().map(parse_id))
        })
    }

    /// Newest first. Ties on `created_at` break on insertion order.
    pub fn list_threads(&self, filter: &ThreadFilter) -> Result<Vec<Thread>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(author) = filter.author_id {
            params.push(Box::new(author.to_string()));
            clauses.push(format!("t.author_id = ?{}", params.len()));
        }
        if let Some(topic) = filter.topic_id {
            params.push(Box::new(topic.to_string()));
            clauses.push(format!("t.topic_id = ?{}", params.len()));
        }
        if let Some(viewer) = filter.following_of {
            params.push(Box::new(viewer.to_string()));
            let n = params.len();
            clauses.push(format!(
                "(t.author_id = ?{n} OR t.author_id IN (SELECT followee_id FROM follows WHERE follower_id = ?{n}))"
            ));
        }
        if let Some(before) = filter.before {
            params.push(Box::new(format_timestamp(before)));
            clauses.push(format!("t.created_at < ?{}", params.len()));
        }
        params.push(Box::new(filter.limit));
        let limit_idx = params.len();

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "{}{} ORDER BY t.created_at DESC, t.rowid DESC LIMIT ?{}",
            THREAD_SELECT, where_sql, limit_idx
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            let rows = stmt
                .query_map(param_refs.as_slice(), map_thread_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            hydrate(conn, rows)
        })
    }

    /// Case-insensitive substring match on content or author username.
    pub fn search_threads(&self, query: &str, limit: u32) -> Result<Vec<Thread>> {
        let pattern = format!("%{}%", escape_like(query));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE t.content LIKE ?1 ESCAPE '\\' OR a.username LIKE ?1 ESCAPE '\\'
                 ORDER BY t.created_at DESC, t.rowid DESC LIMIT ?2",
                THREAD_SELECT
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![pattern, limit], map_thread_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            hydrate(conn, rows)
        })
    }

    /// `None` leaves a field unchanged. Returns false when the thread is gone.
    pub fn update_thread(&self, id: Uuid, content: Option<&str>, image_url: Option<&str>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE threads
                 SET content = COALESCE(?2, content),
                     image_url = COALESCE(?3, image_url),
                     updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
                 WHERE id = ?1",
                rusqlite::params![id.to_string(), content, image_url],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn delete_thread(&self, id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute("DELETE FROM threads WHERE id = ?1", [id.to_string()])?;
            Ok(changed > 0)
        })
    }

    // -- Likes --

    /// Idempotent: the likes set holds each account at most once, no matter
    /// how many concurrent requests race here. Returns true if newly liked.
    pub fn like_thread(&self, thread_id: Uuid, account_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO thread_likes (thread_id, account_id) VALUES (?1, ?2)",
                rusqlite::params![thread_id.to_string(), account_id.to_string()],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn unlike_thread(&self, thread_id: Uuid, account_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute(
                "DELETE FROM thread_likes WHERE thread_id = ?1 AND account_id = ?2",
                rusqlite::params![thread_id.to_string(), account_id.to_string()],
            )?;
            Ok(removed > 0)
        })
    }

    // -- Comments --

    pub fn insert_comment(&self, id: Uuid, thread_id: Uuid, author_id: Uuid, content: &str) -> Result<Comment> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO comments (id, thread_id, author_id, content) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.to_string(), thread_id.to_string(), author_id.to_string(), content],
            )?;
            let comment = conn.query_row(
                &format!("{} WHERE c.id = ?1", COMMENT_SELECT),
                [id.to_string()],
                map_comment,
            )?;
            Ok(comment)
        })
    }

    /// Oldest first, the natural reading order under a thread.
    pub fn list_comments(&self, thread_id: Uuid) -> Result<Vec<Comment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE c.thread_id = ?1 ORDER BY c.created_at ASC, c.rowid ASC",
                COMMENT_SELECT
            ))?;
            let comments = stmt
                .query_map([thread_id.to_string()], map_comment)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(comments)
        })
    }
}

const COMMENT_SELECT: &str = "
    SELECT c.id, c.thread_id, c.content, c.created_at,
           c.author_id, a.username, a.display_name, a.avatar
    FROM comments c
    LEFT JOIN accounts a ON a.id = c.author_id";

fn map_comment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comment> {
    let id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let created_at: String = row.get(3)?;
    Ok(Comment {
        id: parse_id(&id),
        thread_id: parse_id(&thread_id),
        content: row.get(2)?,
        created_at: parse_timestamp(&created_at),
        author: author_from_row(row, 4)?,
    })
}

/// Attach like sets to thread rows with one batched lookup.
fn hydrate(conn: &Connection, rows: Vec<ThreadRow>) -> Result<Vec<Thread>> {
    if rows.is_empty() {
        return Ok(vec![]);
    }

    let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    let sql = format!(
        "SELECT thread_id, account_id FROM thread_likes WHERE thread_id IN ({}) ORDER BY created_at, rowid",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();
    let like_rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut likes: HashMap<String, Vec<Uuid>> = HashMap::new();
    for (thread_id, account_id) in like_rows {
        likes.entry(thread_id).or_default().push(parse_id(&account_id));
    }

    Ok(rows
        .into_iter()
        .map(|row| Thread {
            likes: likes.remove(&row.id).unwrap_or_default(),
            id: parse_id(&row.id),
            author: row.author,
            content: row.content,
            image_url: row.image_url,
            topic_id: parse_opt_id(row.topic_id),
            comment_count: row.comment_count,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        })
        .collect())
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use crate::models::ThreadFilter;
    use crate::testutil;

    #[test]
    fn concurrent_likes_leave_one_entry() {
        let (_dir, db) = testutil::open();
        let author = testutil::account(&db, "jill");
        let fan = testutil::account(&db, "kurt");
        let thread = Uuid::new_v4();
        db.insert_thread(thread, author, "hello", None, None).unwrap();

        let db = Arc::new(db);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || db.like_thread(thread, fan).unwrap())
            })
            .collect();
        let newly_liked = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|added| *added)
            .count();

        assert_eq!(newly_liked, 1);
        assert_eq!(db.get_thread(thread).unwrap().unwrap().likes, vec![fan]);
    }

    #[test]
    fn following_feed_includes_self_and_followees_only() {
        let (_dir, db) = testutil::open();
        let me = testutil::account(&db, "lena");
        let friend = testutil::account(&db, "milo");
        let stranger = testutil::account(&db, "nora");
        db.follow(me, friend).unwrap();

        for (author, text) in [(me, "mine"), (friend, "friend's"), (stranger, "stranger's")] {
            db.insert_thread(Uuid::new_v4(), author, text, None, None).unwrap();
        }

        let feed = db
            .list_threads(&ThreadFilter {
                following_of: Some(me),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        let contents: Vec<_> = feed.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["friend's", "mine"]);
    }

    #[test]
    fn before_cursor_walks_every_page_once() {
        let (_dir, db) = testutil::open();
        let author = testutil::account(&db, "ozzy");
        for text in ["t0", "t1", "t2"] {
            db.insert_thread(Uuid::new_v4(), author, text, None, None).unwrap();
        }

        let page = |before| {
            db.list_threads(&ThreadFilter {
                before,
                limit: 2,
                ..Default::default()
            })
            .unwrap()
        };
        let first = page(None);
        let contents: Vec<_> = first.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["t2", "t1"]);

        // The cursor is the created_at the API handed out, not the stored text.
        let second = page(Some(first[1].created_at));
        let contents: Vec<_> = second.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["t0"]);

        assert!(page(Some(second[0].created_at)).is_empty());
    }

    #[test]
    fn search_treats_wildcards_literally() {
        let (_dir, db) = testutil::open();
        let author = testutil::account(&db, "otto");
        db.insert_thread(Uuid::new_v4(), author, "100% real", None, None).unwrap();
        db.insert_thread(Uuid::new_v4(), author, "1000 fake", None, None).unwrap();

        let hits = db.search_threads("100%", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "100% real");
        assert_eq!(hits[0].author.username, "otto");
    }

    #[test]
    fn comments_count_and_order() {
        let (_dir, db) = testutil::open();
        let author = testutil::account(&db, "pia");
        let thread = Uuid::new_v4();
        db.insert_thread(thread, author, "question", None, None).unwrap();
        db.insert_comment(Uuid::new_v4(), thread, author, "first").unwrap();
        db.insert_comment(Uuid::new_v4(), thread, author, "second").unwrap();

        let comments = db.list_comments(thread).unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].content, "first");
        assert_eq!(db.get_thread(thread).unwrap().unwrap().comment_count, 2);

        assert!(db.delete_thread(thread).unwrap());
        assert!(db.list_comments(thread).unwrap().is_empty());
    }
}
