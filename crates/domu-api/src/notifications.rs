use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::debug;

use domu_types::api::{
    CreateNotificationRequest, Envelope, MarkReadPayload, MarkReadRequest, NotificationPayload,
    NotificationsPayload,
};
use domu_types::events::PushEvent;
use domu_types::models::{Notification, Role};

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery};
use crate::middleware::CurrentUser;
use crate::state::AppState;

const MAX_MESSAGE_LEN: usize = 500;

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub unread_only: bool,
}

fn default_limit() -> u32 {
    50
}

/// Push a stored notification to every socket of its recipient. Offline
/// recipients pick it up on their next poll.
pub(crate) fn deliver(state: &AppState, notification: Notification) {
    let recipient = notification.recipient_id;
    let kind = notification.kind;
    let sockets = state
        .dispatcher
        .send_to_user(recipient, PushEvent::NotificationReceived { notification });
    debug!("{} notification for {} pushed to {} sockets", kind.as_str(), recipient, sockets);
}

/// `GET /api/notifications`: the polling endpoint.
pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiQuery(query): ApiQuery<NotificationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = user.id();
    let limit = query.limit.clamp(1, 200);
    let (notifications, unread_count) = state
        .blocking(move |s| {
            let notifications = s.db.list_notifications(account_id, limit, query.unread_only)?;
            let unread = s.db.unread_count(account_id)?;
            Ok((notifications, unread))
        })
        .await?;

    Ok(Json(Envelope::ok(NotificationsPayload {
        notifications,
        unread_count,
    })))
}

/// `POST /api/notifications`: admin-authored notification for one account.
pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiJson(req): ApiJson<CreateNotificationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    domu_auth::authorize(&user.account, Role::Admin)?;

    let message = req.message.trim().to_string();
    if message.is_empty() || message.chars().count() > MAX_MESSAGE_LEN {
        return Err(ApiError::InvalidInput(format!(
            "message must be 1-{} characters",
            MAX_MESSAGE_LEN
        )));
    }

    let actor_id = user.id();
    let notification = state
        .blocking(move |s| {
            if !s.db.account_exists(req.recipient_id)? {
                return Err(ApiError::NotFound);
            }
            Ok(s.db
                .insert_notification(req.recipient_id, req.kind, &message, req.related_id, Some(actor_id))?)
        })
        .await?;

    deliver(&state, notification.clone());
    Ok((StatusCode::CREATED, Json(Envelope::ok(NotificationPayload { notification }))))
}

/// `PUT /api/notifications`: mark the given ids read, or all of them.
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiJson(req): ApiJson<MarkReadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = user.id();
    let (updated, unread_count) = state
        .blocking(move |s| {
            let updated = match req.ids {
                Some(ids) => s.db.mark_read(account_id, &ids)?,
                None => s.db.mark_all_read(account_id)?,
            };
            Ok((updated, s.db.unread_count(account_id)?))
        })
        .await?;

    Ok(Json(Envelope::ok(MarkReadPayload {
        updated: updated as u32,
        unread_count,
    })))
}
