//! Database row types and their conversion into `domu-types` models.
//! Ids and timestamps are stored as TEXT; conversion tolerates corrupt rows
//! with a warning instead of failing the whole query.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use domu_types::models::{Account, AuthorSummary, Role};

pub struct AccountRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub role: String,
    pub created_at: String,
}

impl AccountRow {
    pub fn into_account(self, following: Vec<Uuid>, followers: Vec<Uuid>) -> Account {
        let role = self.role.parse().unwrap_or_else(|e| {
            warn!("Corrupt role on account '{}': {}", self.id, e);
            Role::Member
        });
        Account {
            id: parse_id(&self.id),
            username: self.username,
            email: self.email,
            display_name: self.display_name,
            avatar: self.avatar,
            bio: self.bio,
            role,
            following,
            followers,
            created_at: parse_timestamp(&self.created_at),
        }
    }
}

/// Insert parameters for a new account.
pub struct NewAccount {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub role: Role,
}

pub struct SessionRow {
    pub id: String,
    pub account_id: String,
    pub token_hash: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: i64,
    pub created_at: String,
}

pub struct NewSession<'a> {
    pub id: Uuid,
    pub account_id: Uuid,
    pub token_hash: &'a str,
    pub ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub expires_at: DateTime<Utc>,
}

/// Filters for thread listings. All filters combine with AND.
#[derive(Debug, Default, Clone)]
pub struct ThreadFilter {
    pub author_id: Option<Uuid>,
    pub topic_id: Option<Uuid>,
    /// Only threads by accounts this account follows (plus its own).
    pub following_of: Option<Uuid>,
    /// Cursor: only threads created strictly before this timestamp.
    pub before: Option<DateTime<Utc>>,
    pub limit: u32,
}

pub(crate) fn author_from_row(
    row: &rusqlite::Row<'_>,
    start: usize,
) -> rusqlite::Result<AuthorSummary> {
    let id: String = row.get(start)?;
    Ok(AuthorSummary {
        id: parse_id(&id),
        username: row
            .get::<_, Option<String>>(start + 1)?
            .unwrap_or_else(|| "unknown".to_string()),
        display_name: row
            .get::<_, Option<String>>(start + 2)?
            .unwrap_or_default(),
        avatar: row.get(start + 3)?,
    })
}

pub fn parse_id(raw: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt id '{}': {}", raw, e);
        Uuid::default()
    })
}

pub fn parse_opt_id(raw: Option<String>) -> Option<Uuid> {
    raw.as_deref().map(parse_id)
}

/// SQLite stores timestamps as "YYYY-MM-DD HH:MM:SS[.fff]" without timezone.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map(|ndt| ndt.and_utc()))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc()))
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

/// Stored form for rows written from Rust. Microsecond precision, and
/// lexical order matches time order so cursors compare as text.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

pub fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn parses_sqlite_timestamps_with_and_without_fraction() {
        let with = parse_timestamp("2026-03-01 10:20:30.250");
        assert_eq!(with.second(), 30);
        assert_eq!(with.nanosecond(), 250_000_000);

        let without = parse_timestamp("2026-03-01 10:20:30");
        assert_eq!(without.minute(), 20);
    }

    #[test]
    fn stored_form_round_trips_and_sorts() {
        let ts = parse_timestamp("2026-03-01T10:20:30.123456Z");
        assert_eq!(format_timestamp(ts), "2026-03-01 10:20:30.123456");
        assert_eq!(parse_timestamp(&format_timestamp(ts)), ts);
        assert!(format_timestamp(ts) < format_timestamp(ts + chrono::Duration::microseconds(1)));
    }

    #[test]
    fn corrupt_values_fall_back_to_defaults() {
        assert_eq!(parse_id("not-a-uuid"), Uuid::default());
        assert_eq!(parse_timestamp("yesterday"), DateTime::<Utc>::default());
    }
}
