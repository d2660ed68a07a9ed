use axum::{
    Extension, Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use tracing::{error, info};
use uuid::Uuid;

use domu_auth::{AUTH_COOKIE, IssuedSession, RegisterInput};
use domu_types::api::{
    AccountPayload, Empty, Envelope, LoginPayload, LoginRequest, RegisterRequest, SessionsPayload,
};

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ClientMeta};
use crate::middleware::{CurrentUser, token_from_headers};
use crate::state::AppState;

/// `POST /api/auth/register`: creates the account and signs it in.
pub async fn register(
    State(state): State<AppState>,
    ClientMeta(client): ClientMeta,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let input = RegisterInput {
        username: req.username,
        display_name: req.display_name,
        email: req.email,
        password: req.password,
        bio: req.bio,
        avatar: req.avatar,
    };

    let issued = state
        .blocking(move |s| {
            let account = s.sessions.register(input)?;
            Ok(s.sessions.issue(account.id, client)?)
        })
        .await?;

    let cookie = session_cookie(&state, &issued);
    Ok((StatusCode::CREATED, [(header::SET_COOKIE, cookie)], Json(login_payload(issued))))
}

pub async fn login(
    State(state): State<AppState>,
    ClientMeta(client): ClientMeta,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let issued = state
        .blocking(move |s| Ok(s.sessions.login(&req.email, &req.password, client)?))
        .await?;

    let cookie = session_cookie(&state, &issued);
    Ok(([(header::SET_COOKIE, cookie)], Json(login_payload(issued))))
}

/// Always succeeds and always clears the cookie, even without a session or
/// when the session row could not be deleted.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = token_from_headers(&headers) {
        if let Err(e) = state.blocking(move |s| Ok(s.sessions.logout(&token)?)).await {
            error!("Logout could not delete its session: {}", e);
        }
    }

    let cookie = cookie_header("", 0, state.config.secure_cookies);
    ([(header::SET_COOKIE, cookie)], Json(Envelope::ok(Empty {})))
}

pub async fn me(Extension(user): Extension<CurrentUser>) -> Json<Envelope<AccountPayload>> {
    Json(Envelope::ok(AccountPayload { user: user.account }))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = user.id();
    let sessions = state
        .blocking(move |s| Ok(s.sessions.list_sessions(account_id)?))
        .await?;

    Ok(Json(Envelope::ok(SessionsPayload {
        sessions,
        current: Some(user.session_id),
    })))
}

pub async fn revoke_session(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(session_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = user.id();
    state
        .blocking(move |s| Ok(s.sessions.revoke_session(account_id, session_id)?))
        .await?;

    info!("{} revoked session {}", user.account.username, session_id);
    Ok(Json(Envelope::ok(Empty {})))
}

fn login_payload(issued: IssuedSession) -> Envelope<LoginPayload> {
    Envelope::ok(LoginPayload {
        user: issued.account,
        token: issued.token,
        expires_at: issued.expires_at,
    })
}

fn session_cookie(state: &AppState, issued: &IssuedSession) -> String {
    cookie_header(
        &issued.token,
        state.sessions.ttl().num_seconds(),
        state.config.secure_cookies,
    )
}

fn cookie_header(token: &str, max_age_secs: i64, secure: bool) -> String {
    Cookie::build((AUTH_COOKIE, token.to_string()))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .secure(secure)
        .max_age(time::Duration::seconds(max_age_secs))
        .build()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_attributes() {
        let cookie = Cookie::parse(cookie_header("abc", 604800, false)).unwrap();
        assert_eq!(cookie.name(), "auth-token");
        assert_eq!(cookie.value(), "abc");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.max_age(), Some(time::Duration::days(7)));
        assert_ne!(cookie.secure(), Some(true));

        let cleared = Cookie::parse(cookie_header("", 0, true)).unwrap();
        assert_eq!(cleared.value(), "");
        assert_eq!(cleared.secure(), Some(true));
        assert_eq!(cleared.max_age(), Some(time::Duration::ZERO));
    }
}
