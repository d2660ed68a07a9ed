//! REST surface: axum handlers over the session manager, storage and the
//! push dispatcher.

pub mod admin;
pub mod auth;
pub mod error;
pub mod extract;
pub mod groups;
pub mod middleware;
pub mod notifications;
pub mod routes;
pub mod state;
pub mod threads;
pub mod topics;
pub mod upload;
pub mod users;

pub use error::ApiError;
pub use routes::router;
pub use state::{ApiConfig, AppState, AppStateInner};
