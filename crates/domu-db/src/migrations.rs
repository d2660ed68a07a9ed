use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE accounts (
                id              TEXT PRIMARY KEY,
                username        TEXT NOT NULL UNIQUE,
                email           TEXT NOT NULL UNIQUE,
                display_name    TEXT NOT NULL,
                password_hash   TEXT NOT NULL,
                avatar          TEXT,
                bio             TEXT,
                role            TEXT NOT NULL DEFAULT 'member',
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            );

            CREATE TABLE sessions (
                id              TEXT PRIMARY KEY,
                account_id      TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                token_hash      TEXT NOT NULL UNIQUE,
                ip              TEXT,
                user_agent      TEXT,
                expires_at      INTEGER NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            );

            CREATE INDEX idx_sessions_account ON sessions(account_id);
            CREATE INDEX idx_sessions_expiry ON sessions(expires_at);

            CREATE TABLE follows (
                follower_id     TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                followee_id     TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
                PRIMARY KEY (follower_id, followee_id),
                CHECK (follower_id != followee_id)
            );

            CREATE INDEX idx_follows_followee ON follows(followee_id);

            CREATE TABLE daily_topics (
                id              TEXT PRIMARY KEY,
                title           TEXT NOT NULL,
                description     TEXT,
                is_active       INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            );

            -- At most one active topic, enforced by the engine as well.
            CREATE UNIQUE INDEX idx_topics_single_active
                ON daily_topics(is_active) WHERE is_active = 1;

            CREATE TABLE threads (
                id              TEXT PRIMARY KEY,
                author_id       TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                content         TEXT NOT NULL,
                image_url       TEXT,
                topic_id        TEXT REFERENCES daily_topics(id) ON DELETE SET NULL,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
                updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            );

            CREATE INDEX idx_threads_created ON threads(created_at);
            CREATE INDEX idx_threads_author ON threads(author_id, created_at);
            CREATE INDEX idx_threads_topic ON threads(topic_id, created_at);

            CREATE TABLE thread_likes (
                thread_id       TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                account_id      TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
                PRIMARY KEY (thread_id, account_id)
            );

            CREATE TABLE comments (
                id              TEXT PRIMARY KEY,
                thread_id       TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                author_id       TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                content         TEXT NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            );

            CREATE INDEX idx_comments_thread ON comments(thread_id, created_at);

            CREATE TABLE notifications (
                id              TEXT PRIMARY KEY,
                recipient_id    TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                kind            TEXT NOT NULL,
                message         TEXT NOT NULL,
                related_id      TEXT,
                actor_id        TEXT REFERENCES accounts(id) ON DELETE SET NULL,
                is_read         INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            );

            CREATE INDEX idx_notifications_recipient ON notifications(recipient_id, created_at);

            CREATE TABLE chat_groups (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL UNIQUE,
                description     TEXT,
                owner_id        TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                is_private      INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            );

            CREATE TABLE group_members (
                group_id        TEXT NOT NULL REFERENCES chat_groups(id) ON DELETE CASCADE,
                account_id      TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                role            TEXT NOT NULL DEFAULT 'member',
                joined_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
                PRIMARY KEY (group_id, account_id)
            );

            CREATE INDEX idx_group_members_account ON group_members(account_id);

            CREATE TABLE group_invites (
                id              TEXT PRIMARY KEY,
                group_id        TEXT NOT NULL REFERENCES chat_groups(id) ON DELETE CASCADE,
                inviter_id      TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                invitee_id      TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                status          TEXT NOT NULL DEFAULT 'pending',
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
                UNIQUE (group_id, invitee_id)
            );

            CREATE TABLE group_messages (
                id              TEXT PRIMARY KEY,
                group_id        TEXT NOT NULL REFERENCES chat_groups(id) ON DELETE CASCADE,
                author_id       TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                content         TEXT NOT NULL,
                attachment_url  TEXT,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            );

            CREATE INDEX idx_group_messages_group ON group_messages(group_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
