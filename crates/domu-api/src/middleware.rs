use axum::{
    Extension,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use uuid::Uuid;

use domu_auth::AUTH_COOKIE;
use domu_types::models::{Account, Role};

use crate::error::ApiError;
use crate::state::AppState;

/// The authenticated caller, inserted by `require_auth`.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub account: Account,
    pub session_id: Uuid,
    pub token: String,
}

impl CurrentUser {
    pub fn id(&self) -> Uuid {
        self.account.id
    }

    pub fn is_admin(&self) -> bool {
        self.account.role == Role::Admin
    }
}

/// Bearer header first, then the `auth-token` cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>() {
        return Some(bearer.token().to_string());
    }
    CookieJar::from_headers(headers)
        .get(AUTH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolve the token to a live session; 401 otherwise.
pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, ApiError> {
    let token = token_from_headers(req.headers()).ok_or(ApiError::Unauthorized)?;

    let lookup = token.clone();
    let (account, session_id) = state
        .blocking(move |s| Ok(s.sessions.authenticate_session(&lookup)?))
        .await?;

    req.extensions_mut().insert(CurrentUser {
        account,
        session_id,
        token,
    });
    Ok(next.run(req).await)
}

/// Layered inside `require_auth`.
pub async fn require_admin(
    Extension(user): Extension<CurrentUser>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    domu_auth::authorize(&user.account, Role::Admin)?;
    Ok(next.run(req).await)
}
