use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use domu_types::api::{CreateTopicRequest, Empty, Envelope, TopicPayload, TopicsPayload, UpdateTopicRequest};

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath};
use crate::middleware::CurrentUser;
use crate::state::AppState;

const MAX_TITLE_LEN: usize = 120;
const MAX_DESCRIPTION_LEN: usize = 1000;

fn validate_title(raw: &str) -> Result<String, ApiError> {
    let title = raw.trim();
    if title.is_empty() || title.chars().count() > MAX_TITLE_LEN {
        return Err(ApiError::InvalidInput(format!(
            "title must be 1-{} characters",
            MAX_TITLE_LEN
        )));
    }
    Ok(title.to_string())
}

fn validate_description(raw: Option<&str>) -> Result<Option<String>, ApiError> {
    match raw.map(str::trim) {
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LEN => Err(ApiError::InvalidInput(format!(
            "description must be at most {} characters",
            MAX_DESCRIPTION_LEN
        ))),
        other => Ok(other.map(str::to_string)),
    }
}

/// `GET /api/topics/active`: `topic` is null when none is active.
pub async fn active(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let topic = state.blocking(|s| Ok(s.db.get_active_topic()?)).await?;
    Ok(Json(Envelope::ok(TopicPayload { topic })))
}

pub async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let topics = state.blocking(|s| Ok(s.db.list_topics()?)).await?;
    Ok(Json(Envelope::ok(TopicsPayload { topics })))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiJson(req): ApiJson<CreateTopicRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = validate_title(&req.title)?;
    let description = validate_description(req.description.as_deref())?;

    let topic = state
        .blocking(move |s| {
            Ok(s.db
                .insert_topic(Uuid::new_v4(), &title, description.as_deref(), req.is_active)?)
        })
        .await?;

    info!("{} created topic '{}' (active: {})", user.account.username, topic.title, topic.is_active);
    Ok((StatusCode::CREATED, Json(Envelope::ok(TopicPayload { topic: Some(topic) }))))
}

/// `is_active: true` makes this the single active topic.
pub async fn update(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateTopicRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = req.title.as_deref().map(validate_title).transpose()?;
    let description = validate_description(req.description.as_deref())?;

    let topic = state
        .blocking(move |s| {
            if !s.db.update_topic(id, title.as_deref(), description.as_deref())? {
                return Err(ApiError::NotFound);
            }
            match req.is_active {
                Some(true) => {
                    s.db.set_active_topic(id)?;
                }
                Some(false) => {
                    s.db.deactivate_topic(id)?;
                }
                None => {}
            }
            s.db.get_topic(id)?.ok_or(ApiError::NotFound)
        })
        .await?;

    Ok(Json(Envelope::ok(TopicPayload { topic: Some(topic) })))
}

/// `POST /api/admin/daily-topics/{id}/activate`
pub async fn activate(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let topic = state
        .blocking(move |s| {
            if !s.db.set_active_topic(id)? {
                return Err(ApiError::NotFound);
            }
            s.db.get_topic(id)?.ok_or(ApiError::NotFound)
        })
        .await?;

    info!("{} activated topic '{}'", user.account.username, topic.title);
    Ok(Json(Envelope::ok(TopicPayload { topic: Some(topic) })))
}

pub async fn delete(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<impl IntoResponse, ApiError> {
    state
        .blocking(move |s| {
            if !s.db.delete_topic(id)? {
                return Err(ApiError::NotFound);
            }
            Ok(())
        })
        .await?;
    Ok(Json(Envelope::ok(Empty {})))
}
