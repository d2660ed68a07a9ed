use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use domu_db::models::ThreadFilter;
use domu_types::api::{
    CommentPayload, CommentsPayload, CreateCommentRequest, CreateThreadRequest, Empty, Envelope,
    LikePayload, ThreadPayload, ThreadsPayload, UpdateThreadRequest,
};
use domu_types::events::PushEvent;
use domu_types::models::{Notification, NotificationKind, Thread};

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::middleware::CurrentUser;
use crate::notifications::deliver;
use crate::state::AppState;

const MAX_CONTENT_LEN: usize = 500;
const MAX_COMMENT_LEN: usize = 1000;
const DEFAULT_PAGE: u32 = 20;
const MAX_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct ThreadQuery {
    pub author: Option<Uuid>,
    pub topic: Option<Uuid>,
    /// `following` restricts to the caller and the accounts they follow
    pub feed: Option<String>,
    /// Cursor: `created_at` of the oldest thread on the previous page
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    pub limit: Option<u32>,
}

fn page_size(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

fn validate_text(raw: &str, field: &str, max: usize) -> Result<String, ApiError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ApiError::InvalidInput(format!("{} must not be empty", field)));
    }
    if text.chars().count() > max {
        return Err(ApiError::InvalidInput(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(text.to_string())
}

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiQuery(query): ApiQuery<ThreadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let following_of = match query.feed.as_deref() {
        None | Some("all") => None,
        Some("following") => Some(user.id()),
        Some(other) => return Err(ApiError::InvalidInput(format!("unknown feed '{}'", other))),
    };
    let filter = ThreadFilter {
        author_id: query.author,
        topic_id: query.topic,
        following_of,
        before: query.before,
        limit: page_size(query.limit),
    };

    let threads = state.blocking(move |s| Ok(s.db.list_threads(&filter)?)).await?;
    Ok(Json(Envelope::ok(ThreadsPayload { threads })))
}

pub async fn search(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let q = query.q.trim().to_string();
    if q.is_empty() {
        return Err(ApiError::InvalidInput("search query must not be empty".into()));
    }
    let limit = page_size(query.limit);

    let threads = state.blocking(move |s| Ok(s.db.search_threads(&q, limit)?)).await?;
    Ok(Json(Envelope::ok(ThreadsPayload { threads })))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiJson(req): ApiJson<CreateThreadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = validate_text(&req.content, "content", MAX_CONTENT_LEN)?;
    let author_id = user.id();
    let thread_id = Uuid::new_v4();

    let thread = state
        .blocking(move |s| {
            if let Some(topic_id) = req.topic_id {
                if s.db.get_topic(topic_id)?.is_none() {
                    return Err(ApiError::InvalidInput("unknown topic".into()));
                }
            }
            s.db.insert_thread(thread_id, author_id, &content, req.image_url.as_deref(), req.topic_id)?;
            load_thread(s, thread_id)
        })
        .await?;

    info!("{} posted thread {}", user.account.username, thread_id);
    state.dispatcher.broadcast(PushEvent::ThreadCreated { thread: thread.clone() });
    Ok((StatusCode::CREATED, Json(Envelope::ok(ThreadPayload { thread }))))
}

pub async fn get(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<impl IntoResponse, ApiError> {
    let thread = state.blocking(move |s| load_thread(s, id)).await?;
    Ok(Json(Envelope::ok(ThreadPayload { thread })))
}

/// Author or admin only.
pub async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateThreadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req
        .content
        .as_deref()
        .map(|c| validate_text(c, "content", MAX_CONTENT_LEN))
        .transpose()?;

    let thread = state
        .blocking(move |s| {
            ensure_can_modify(s, id, &user)?;
            if !s.db.update_thread(id, content.as_deref(), req.image_url.as_deref())? {
                return Err(ApiError::NotFound);
            }
            load_thread(s, id)
        })
        .await?;

    state.dispatcher.broadcast(PushEvent::ThreadUpdated { thread: thread.clone() });
    Ok(Json(Envelope::ok(ThreadPayload { thread })))
}

/// Author or admin only.
pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let username = user.account.username.clone();
    state
        .blocking(move |s| {
            ensure_can_modify(s, id, &user)?;
            if !s.db.delete_thread(id)? {
                return Err(ApiError::NotFound);
            }
            Ok(())
        })
        .await?;

    info!("{} deleted thread {}", username, id);
    state.dispatcher.broadcast(PushEvent::ThreadDeleted { thread_id: id });
    Ok(Json(Envelope::ok(Empty {})))
}

/// `POST /api/threads/{id}/like`. Liking twice is a no-op.
pub async fn like(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let liker = user.account.clone();
    let (thread, notification) = state
        .blocking(move |s| {
            let thread = load_thread(s, id)?;
            let newly_liked = s.db.like_thread(id, liker.id)?;

            let notification = if newly_liked && thread.author.id != liker.id {
                Some(s.db.insert_notification(
                    thread.author.id,
                    NotificationKind::Like,
                    &format!("{} liked your thread", liker.display_name),
                    Some(id),
                    Some(liker.id),
                )?)
            } else {
                None
            };
            Ok((load_thread(s, id)?, notification))
        })
        .await?;

    finish_like(&state, thread, notification, true)
}

/// `DELETE /api/threads/{id}/like`. Unliking twice is a no-op.
pub async fn unlike(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = user.id();
    let thread = state
        .blocking(move |s| {
            load_thread(s, id)?;
            s.db.unlike_thread(id, account_id)?;
            load_thread(s, id)
        })
        .await?;

    finish_like(&state, thread, None, false)
}

fn finish_like(
    state: &AppState,
    thread: Thread,
    notification: Option<Notification>,
    liked: bool,
) -> Result<Json<Envelope<LikePayload>>, ApiError> {
    if let Some(notification) = notification {
        deliver(state, notification);
    }
    let likes = thread.likes.clone();
    state.dispatcher.broadcast(PushEvent::ThreadUpdated { thread });
    Ok(Json(Envelope::ok(LikePayload { liked, likes })))
}

pub async fn list_comments(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let comments = state
        .blocking(move |s| {
            if s.db.thread_author(id)?.is_none() {
                return Err(ApiError::NotFound);
            }
            Ok(s.db.list_comments(id)?)
        })
        .await?;
    Ok(Json(Envelope::ok(CommentsPayload { comments })))
}

pub async fn create_comment(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<CreateCommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = validate_text(&req.content, "comment", MAX_COMMENT_LEN)?;
    let commenter = user.account.clone();

    let (comment, thread, notification) = state
        .blocking(move |s| {
            let author_id = s.db.thread_author(id)?.ok_or(ApiError::NotFound)?;
            let comment = s.db.insert_comment(Uuid::new_v4(), id, commenter.id, &content)?;

            let notification = if author_id != commenter.id {
                Some(s.db.insert_notification(
                    author_id,
                    NotificationKind::Comment,
                    &format!("{} commented on your thread", commenter.display_name),
                    Some(id),
                    Some(commenter.id),
                )?)
            } else {
                None
            };
            Ok((comment, load_thread(s, id)?, notification))
        })
        .await?;

    if let Some(notification) = notification {
        deliver(&state, notification);
    }
    state.dispatcher.broadcast(PushEvent::ThreadUpdated { thread });
    Ok((StatusCode::CREATED, Json(Envelope::ok(CommentPayload { comment }))))
}

fn load_thread(s: &crate::state::AppStateInner, id: Uuid) -> Result<Thread, ApiError> {
    s.db.get_thread(id)?.ok_or(ApiError::NotFound)
}

fn ensure_can_modify(s: &crate::state::AppStateInner, id: Uuid, user: &CurrentUser) -> Result<(), ApiError> {
    let author = s.db.thread_author(id)?.ok_or(ApiError::NotFound)?;
    if author == user.id() || user.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}
