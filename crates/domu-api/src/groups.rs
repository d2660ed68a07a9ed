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

use domu_types::api::{
    CreateGroupRequest, Empty, Envelope, GroupMessagePayload, GroupMessagesPayload, GroupPayload,
    GroupsPayload, InviteRequest, JoinGroupRequest, MembersPayload, SendGroupMessageRequest,
    UpdateGroupRequest,
};
use domu_types::events::PushEvent;
use domu_types::models::{Group, GroupRole, NotificationKind};

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::middleware::CurrentUser;
use crate::notifications::deliver;
use crate::state::{AppState, AppStateInner};

const MAX_NAME_LEN: usize = 64;
const MAX_DESCRIPTION_LEN: usize = 500;
const MAX_MESSAGE_LEN: usize = 2000;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: `created_at` of the oldest message from the previous page
    pub before: Option<DateTime<Utc>>,
}

fn default_limit() -> u32 {
    50
}

fn validate_name(raw: &str) -> Result<String, ApiError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::InvalidInput(format!(
            "group name must be 1-{} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

fn validate_description(raw: Option<&str>) -> Result<Option<String>, ApiError> {
    let description = raw.map(str::trim).filter(|d| !d.is_empty());
    if description.is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LEN) {
        return Err(ApiError::InvalidInput(format!(
            "description must be at most {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(description.map(str::to_string))
}

fn name_conflict(err: anyhow::Error) -> ApiError {
    if domu_db::is_unique_violation(&err) {
        ApiError::Conflict("group name already taken".into())
    } else {
        ApiError::Internal(err)
    }
}

/// Private groups are invisible to outsiders, so they read as missing.
fn visible_group(s: &AppStateInner, id: Uuid, user: &CurrentUser) -> Result<(Group, Option<GroupRole>), ApiError> {
    let group = s.db.get_group(id)?.ok_or(ApiError::NotFound)?;
    let role = s.db.member_role(id, user.id())?;
    if group.is_private && role.is_none() && !user.is_admin() {
        return Err(ApiError::NotFound);
    }
    Ok((group, role))
}

fn ensure_owner_or_admin(s: &AppStateInner, id: Uuid, user: &CurrentUser) -> Result<(), ApiError> {
    let (_, role) = visible_group(s, id, user)?;
    if role == Some(GroupRole::Owner) || user.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

fn ensure_member(s: &AppStateInner, id: Uuid, user: &CurrentUser) -> Result<GroupRole, ApiError> {
    let (_, role) = visible_group(s, id, user)?;
    role.ok_or(ApiError::Forbidden)
}

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let viewer = user.id();
    let groups = state.blocking(move |s| Ok(s.db.list_groups(viewer)?)).await?;
    Ok(Json(Envelope::ok(GroupsPayload { groups })))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiJson(req): ApiJson<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = validate_name(&req.name)?;
    let description = validate_description(req.description.as_deref())?;
    let owner_id = user.id();

    let group = state
        .blocking(move |s| {
            s.db.create_group(Uuid::new_v4(), &name, description.as_deref(), owner_id, req.is_private)
                .map_err(name_conflict)
        })
        .await?;

    info!("{} created group '{}' ({})", user.account.username, group.name, group.id);
    Ok((StatusCode::CREATED, Json(Envelope::ok(GroupPayload { group }))))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (group, _) = state.blocking(move |s| visible_group(s, id, &user)).await?;
    Ok(Json(Envelope::ok(GroupPayload { group })))
}

/// Owner or admin only.
pub async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.as_deref().map(validate_name).transpose()?;
    let description = validate_description(req.description.as_deref())?;

    let group = state
        .blocking(move |s| {
            ensure_owner_or_admin(s, id, &user)?;
            s.db.update_group(id, name.as_deref(), description.as_deref(), req.is_private)
                .map_err(name_conflict)?;
            s.db.get_group(id)?.ok_or(ApiError::NotFound)
        })
        .await?;

    Ok(Json(Envelope::ok(GroupPayload { group })))
}

/// Owner or admin only. Members, invites and messages go with it.
pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let username = user.account.username.clone();
    state
        .blocking(move |s| {
            ensure_owner_or_admin(s, id, &user)?;
            if !s.db.delete_group(id)? {
                return Err(ApiError::NotFound);
            }
            Ok(())
        })
        .await?;

    info!("{} deleted group {}", username, id);
    Ok(Json(Envelope::ok(Empty {})))
}

/// `POST /api/groups/join`. Public groups are open; private ones need a
/// pending invite.
pub async fn join(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiJson(req): ApiJson<JoinGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = user.id();
    let group_id = req.group_id;

    let group = state
        .blocking(move |s| {
            let group = s.db.get_group(group_id)?.ok_or(ApiError::NotFound)?;
            if s.db.member_role(group_id, account_id)?.is_some() {
                return Err(ApiError::Conflict("already a member".into()));
            }
            if group.is_private && !s.db.has_pending_invite(group_id, account_id)? {
                return Err(ApiError::Forbidden);
            }
            if !s.db.join_group(group_id, account_id)? {
                return Err(ApiError::Conflict("already a member".into()));
            }
            s.db.get_group(group_id)?.ok_or(ApiError::NotFound)
        })
        .await?;

    info!("{} joined group {}", user.account.username, group_id);
    Ok(Json(Envelope::ok(GroupPayload { group })))
}

/// `POST /api/groups/invite`. Any member may invite.
pub async fn invite(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiJson(req): ApiJson<InviteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let InviteRequest { group_id, user_id: invitee } = req;
    if invitee == user.id() {
        return Err(ApiError::InvalidInput("cannot invite yourself".into()));
    }

    let inviter = user.account.clone();
    let notification = state
        .blocking(move |s| {
            ensure_member(s, group_id, &user)?;
            let group = s.db.get_group(group_id)?.ok_or(ApiError::NotFound)?;
            if !s.db.account_exists(invitee)? {
                return Err(ApiError::NotFound);
            }
            if s.db.member_role(group_id, invitee)?.is_some() {
                return Err(ApiError::Conflict("already a member".into()));
            }
            if !s.db.create_invite(group_id, inviter.id, invitee)? {
                // Still pending from an earlier invite; do not notify twice.
                return Ok(None);
            }
            Ok(Some(s.db.insert_notification(
                invitee,
                NotificationKind::GroupInvite,
                &format!("{} invited you to join {}", inviter.display_name, group.name),
                Some(group_id),
                Some(inviter.id),
            )?))
        })
        .await?;

    if let Some(notification) = notification {
        deliver(&state, notification);
    }
    Ok(Json(Envelope::ok(Empty {})))
}

pub async fn leave(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = user.id();
    state
        .blocking(move |s| {
            match ensure_member(s, id, &user)? {
                GroupRole::Owner => Err(ApiError::InvalidInput(
                    "the owner cannot leave; delete the group instead".into(),
                )),
                GroupRole::Member => {
                    s.db.leave_group(id, account_id)?;
                    Ok(())
                }
            }
        })
        .await?;

    Ok(Json(Envelope::ok(Empty {})))
}

pub async fn members(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let members = state
        .blocking(move |s| {
            visible_group(s, id, &user)?;
            Ok(s.db.list_members(id)?)
        })
        .await?;
    Ok(Json(Envelope::ok(MembersPayload { members })))
}

/// Members only.
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<MessageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.clamp(1, 200);
    let messages = state
        .blocking(move |s| {
            ensure_member(s, id, &user)?;
            Ok(s.db.list_group_messages(id, limit, query.before)?)
        })
        .await?;
    Ok(Json(Envelope::ok(GroupMessagesPayload { messages })))
}

/// Members only. Pushed to every member's sockets, the sender's included.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<SendGroupMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.chars().count() > MAX_MESSAGE_LEN {
        return Err(ApiError::InvalidInput(format!(
            "message must be at most {} characters",
            MAX_MESSAGE_LEN
        )));
    }
    let attachment = req.attachment_url.filter(|a| !a.trim().is_empty());
    if content.is_empty() && attachment.is_none() {
        return Err(ApiError::InvalidInput("message must not be empty".into()));
    }

    let author_id = user.id();
    let (message, recipients) = state
        .blocking(move |s| {
            ensure_member(s, id, &user)?;
            let message = s
                .db
                .insert_group_message(Uuid::new_v4(), id, author_id, &content, attachment.as_deref())?;
            Ok((message, s.db.member_ids(id)?))
        })
        .await?;

    state
        .dispatcher
        .send_to_users(&recipients, PushEvent::GroupMessageCreated { message: message.clone() });
    Ok((StatusCode::CREATED, Json(Envelope::ok(GroupMessagePayload { message }))))
}
