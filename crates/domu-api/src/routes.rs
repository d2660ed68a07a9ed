use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
};

use crate::middleware::{require_admin, require_auth};
use crate::state::AppState;
use crate::{admin, auth, groups, notifications, threads, topics, upload, users};

/// The whole `/api` surface. Static file serving and CORS are added by the
/// server binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/topics/active", get(topics::active));

    let protected_routes = Router::new()
        // Auth
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/sessions", get(auth::list_sessions))
        .route("/api/auth/sessions/{id}", axum::routing::delete(auth::revoke_session))
        // Threads
        .route("/api/threads", get(threads::list).post(threads::create))
        .route("/api/threads/search", get(threads::search))
        .route(
            "/api/threads/{id}",
            get(threads::get).put(threads::update).delete(threads::delete),
        )
        .route("/api/threads/{id}/like", post(threads::like).delete(threads::unlike))
        .route(
            "/api/threads/{id}/comments",
            get(threads::list_comments).post(threads::create_comment),
        )
        // Users
        .route("/api/users/me", get(users::me).put(users::update_me))
        .route("/api/users/{id}", get(users::get))
        .route("/api/users/{id}/follow", post(users::follow).delete(users::unfollow))
        // Groups
        .route("/api/groups", get(groups::list).post(groups::create))
        .route("/api/groups/join", post(groups::join))
        .route("/api/groups/invite", post(groups::invite))
        .route(
            "/api/groups/{id}",
            get(groups::get).put(groups::update).delete(groups::delete),
        )
        .route("/api/groups/{id}/leave", post(groups::leave))
        .route("/api/groups/{id}/members", get(groups::members))
        .route(
            "/api/groups/{id}/messages",
            get(groups::list_messages).post(groups::send_message),
        )
        // Notifications (POST checks for admin itself)
        .route(
            "/api/notifications",
            get(notifications::list)
                .post(notifications::create)
                .put(notifications::mark_read),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Everything else keeps axum's default body limit.
    let upload_routes = Router::new()
        .route("/api/upload/chat", post(upload::chat))
        .route("/api/upload/avatar", post(upload::avatar))
        .layer(DefaultBodyLimit::max(upload::UPLOAD_BODY_LIMIT))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let admin_routes = Router::new()
        .route("/api/admin/daily-topics", get(topics::list).post(topics::create))
        .route(
            "/api/admin/daily-topics/{id}",
            put(topics::update).delete(topics::delete),
        )
        .route("/api/admin/daily-topics/{id}/activate", post(topics::activate))
        .route("/api/admin/users", get(admin::list_users))
        .route("/api/admin/users/{id}", axum::routing::delete(admin::delete_user))
        .route("/api/admin/users/{id}/role", put(admin::set_role))
        .layer(middleware::from_fn(require_admin))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(upload_routes)
        .merge(admin_routes)
        .with_state(state)
}
