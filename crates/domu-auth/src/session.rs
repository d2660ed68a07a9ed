use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use domu_db::Database;
use domu_db::models::{NewAccount, NewSession};
use domu_types::models::{Account, Role, Session};

use crate::AuthError;
use crate::password::{hash_password, verify_password};
use crate::token::{TokenSigner, hash_token};

const MIN_PASSWORD_LEN: usize = 6;
const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 32;
const MAX_DISPLAY_NAME_LEN: usize = 64;
const MAX_BIO_LEN: usize = 280;

#[derive(Debug, Clone)]
pub struct RegisterInput {
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub password: String,
    pub bio: Option<String>,
    pub avatar: Option<String>,
}

/// Where a login came from, recorded on the session row.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub account: Account,
    pub token: String,
    pub session_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Told synchronously whenever session rows are deleted, so anything keyed
/// by session (open sockets, caches) can drop them before the call returns.
pub trait RevocationListener: Send + Sync {
    fn sessions_revoked(&self, session_ids: &[Uuid]);
}

/// Registers accounts, issues sessions, and authenticates tokens in two
/// tiers: a stateless signature/expiry check, then a session-row lookup so
/// a still-valid token can be revoked server-side.
///
/// Every method blocks (argon2, SQLite); async callers wrap them in
/// `spawn_blocking`.
pub struct SessionManager {
    db: Arc<Database>,
    signer: TokenSigner,
    listeners: RwLock<Vec<Arc<dyn RevocationListener>>>,
}

impl SessionManager {
    pub fn new(db: Arc<Database>, secret: &str, ttl: Duration) -> Self {
        Self {
            db,
            signer: TokenSigner::new(secret, ttl),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn RevocationListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    fn notify_revoked(&self, session_ids: &[Uuid]) {
        if session_ids.is_empty() {
            return;
        }
        let listeners = self.listeners.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        for listener in listeners.iter() {
            listener.sessions_revoked(session_ids);
        }
    }

    pub fn ttl(&self) -> Duration {
        self.signer.ttl()
    }

    pub fn register(&self, input: RegisterInput) -> Result<Account, AuthError> {
        let username = input.username.trim().to_string();
        let display_name = input.display_name.trim().to_string();
        let email = normalize_email(&input.email);

        validate_username(&username)?;
        validate_email(&email)?;
        if input.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::InvalidInput(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        if display_name.is_empty() || display_name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(AuthError::InvalidInput(format!(
                "display name must be 1-{} characters",
                MAX_DISPLAY_NAME_LEN
            )));
        }
        let bio = input.bio.map(|b| b.trim().to_string()).filter(|b| !b.is_empty());
        if bio.as_ref().is_some_and(|b| b.chars().count() > MAX_BIO_LEN) {
            return Err(AuthError::InvalidInput(format!(
                "bio must be at most {} characters",
                MAX_BIO_LEN
            )));
        }

        let (email_taken, username_taken) = self.db.identity_taken(&email, &username)?;
        if email_taken {
            return Err(AuthError::Conflict("email already registered".into()));
        }
        if username_taken {
            return Err(AuthError::Conflict("username already taken".into()));
        }

        let id = Uuid::new_v4();
        let new = NewAccount {
            id,
            username,
            email,
            display_name,
            password_hash: hash_password(&input.password)?,
            avatar: input.avatar.filter(|a| !a.trim().is_empty()),
            bio,
            role: Role::Member,
        };

        // A concurrent register can slip between the check and the insert;
        // the UNIQUE constraints catch it.
        if let Err(e) = self.db.create_account(&new) {
            if domu_db::is_unique_violation(&e) {
                return Err(AuthError::Conflict("email or username already taken".into()));
            }
            return Err(e.into());
        }

        info!("Registered {} ({})", new.username, id);
        self.db
            .get_account(id)?
            .ok_or_else(|| AuthError::Internal(anyhow::anyhow!("account {} missing after insert", id)))
    }

    pub fn login(&self, email: &str, password: &str, client: ClientInfo) -> Result<IssuedSession, AuthError> {
        let email = normalize_email(email);
        let Some(row) = self.db.get_account_row_by_email(&email)? else {
            debug!("Login for unknown email");
            return Err(AuthError::Unauthorized);
        };

        if !verify_password(password, &row.password_hash)? {
            warn!("Failed login for {}", row.username);
            return Err(AuthError::Unauthorized);
        }

        let account_id: Uuid = row
            .id
            .parse()
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("corrupt account id '{}': {}", row.id, e)))?;
        self.issue(account_id, client)
    }

    /// Issue a token and its session row for an already-verified account.
    pub fn issue(&self, account_id: Uuid, client: ClientInfo) -> Result<IssuedSession, AuthError> {
        let account = self.db.get_account(account_id)?.ok_or(AuthError::Unauthorized)?;
        let (token, expires_at) = self
            .signer
            .issue(account.id, &account.email, &account.username, Utc::now())?;

        let session_id = Uuid::new_v4();
        let token_hash = hash_token(&token);
        self.db.create_session(&NewSession {
            id: session_id,
            account_id: account.id,
            token_hash: &token_hash,
            ip: client.ip.as_deref(),
            user_agent: client.user_agent.as_deref(),
            expires_at,
        })?;

        info!("Session {} opened for {}", session_id, account.username);
        Ok(IssuedSession {
            account,
            token,
            session_id,
            expires_at,
        })
    }

    /// Idempotent: deleting a missing session is not an error.
    pub fn logout(&self, token: &str) -> Result<(), AuthError> {
        if let Some(session_id) = self.db.delete_session_by_hash(&hash_token(token))? {
            debug!("Session {} closed", session_id);
            self.notify_revoked(&[session_id]);
        }
        Ok(())
    }

    /// Resolve a token to its account. Any failure is `Unauthorized`.
    pub fn authenticate(&self, token: &str) -> Result<Account, AuthError> {
        self.authenticate_session(token).map(|(account, _)| account)
    }

    /// Like `authenticate`, also returning the session id.
    pub fn authenticate_session(&self, token: &str) -> Result<(Account, Uuid), AuthError> {
        let claims = self.signer.verify(token)?;

        let session = self
            .db
            .get_live_session(&hash_token(token), Utc::now())?
            .ok_or(AuthError::Unauthorized)?
            .into_session();

        if session.account_id != claims.sub {
            warn!(
                "Token subject {} does not match session owner {}",
                claims.sub, session.account_id
            );
            return Err(AuthError::Unauthorized);
        }

        let account = self.db.get_account(claims.sub)?.ok_or(AuthError::Unauthorized)?;
        Ok((account, session.id))
    }

    /// Whether the session row is still present, expired or not.
    pub fn session_exists(&self, session_id: Uuid) -> Result<bool, AuthError> {
        Ok(self.db.session_exists(session_id)?)
    }

    pub fn list_sessions(&self, account_id: Uuid) -> Result<Vec<Session>, AuthError> {
        Ok(self.db.list_sessions(account_id)?)
    }

    /// Revoke one of the caller's own sessions.
    pub fn revoke_session(&self, account_id: Uuid, session_id: Uuid) -> Result<(), AuthError> {
        if self.db.delete_session(account_id, session_id)? {
            self.notify_revoked(&[session_id]);
            Ok(())
        } else {
            Err(AuthError::NotFound)
        }
    }

    /// Forced invalidation of every session an account holds.
    pub fn revoke_all(&self, account_id: Uuid) -> Result<usize, AuthError> {
        let removed = self.db.delete_sessions_for_account(account_id)?;
        if !removed.is_empty() {
            info!("Revoked {} sessions for {}", removed.len(), account_id);
            self.notify_revoked(&removed);
        }
        Ok(removed.len())
    }

    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let removed = self.db.delete_expired_sessions(now)?;
        self.notify_revoked(&removed);
        Ok(removed.len())
    }
}

/// `Forbidden` unless `account.role` satisfies `required`.
pub fn authorize(account: &Account, required: Role) -> Result<(), AuthError> {
    if account.role.satisfies(required) {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn validate_email(email: &str) -> Result<(), AuthError> {
    let invalid = || AuthError::InvalidInput("email is malformed".into());
    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let (host, tld) = domain.rsplit_once('.').ok_or_else(invalid)?;
    if host.is_empty() || tld.is_empty() || domain.starts_with('.') {
        return Err(invalid());
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<(), AuthError> {
    let len = username.chars().count();
    if len < MIN_USERNAME_LEN {
        return Err(AuthError::InvalidInput(format!(
            "username must be at least {} characters",
            MIN_USERNAME_LEN
        )));
    }
    if len > MAX_USERNAME_LEN {
        return Err(AuthError::InvalidInput(format!(
            "username must be at most {} characters",
            MAX_USERNAME_LEN
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(AuthError::InvalidInput(
            "username may only contain letters, digits, '_' and '.'".into(),
        ));
    }
    Ok(())
}
