//! Credential & session management: password hashing, signed session
//! tokens, and the server-side session rows that make those tokens revocable.

mod error;
mod password;
mod session;
mod token;

pub use error::AuthError;
pub use session::{
    ClientInfo, IssuedSession, RegisterInput, RevocationListener, SessionManager, authorize,
};
pub use token::{hash_token, TokenSigner};

/// Cookie carrying the session token for browsers.
pub const AUTH_COOKIE: &str = "auth-token";
