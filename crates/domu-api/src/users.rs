use axum::{
    Extension, Json,
    extract::State,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use domu_types::api::{AccountPayload, Envelope, FollowPayload, UpdateProfileRequest};
use domu_types::events::PushEvent;
use domu_types::models::NotificationKind;

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath};
use crate::middleware::CurrentUser;
use crate::notifications::deliver;
use crate::state::AppState;

const MAX_DISPLAY_NAME_LEN: usize = 64;
const MAX_BIO_LEN: usize = 280;

pub async fn me(Extension(user): Extension<CurrentUser>) -> Json<Envelope<AccountPayload>> {
    Json(Envelope::ok(AccountPayload { user: user.account }))
}

/// `PUT /api/users/me`. Omitted fields stay as they are.
pub async fn update_me(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiJson(req): ApiJson<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let display_name = req.display_name.map(|d| d.trim().to_string());
    if display_name
        .as_ref()
        .is_some_and(|d| d.is_empty() || d.chars().count() > MAX_DISPLAY_NAME_LEN)
    {
        return Err(ApiError::InvalidInput(format!(
            "display name must be 1-{} characters",
            MAX_DISPLAY_NAME_LEN
        )));
    }
    if req.bio.as_ref().is_some_and(|b| b.chars().count() > MAX_BIO_LEN) {
        return Err(ApiError::InvalidInput(format!(
            "bio must be at most {} characters",
            MAX_BIO_LEN
        )));
    }

    let account_id = user.id();
    let account = state
        .blocking(move |s| {
            s.db.update_profile(
                account_id,
                display_name.as_deref(),
                req.bio.as_deref(),
                req.avatar.as_deref(),
            )?;
            s.db.get_account(account_id)?.ok_or(ApiError::NotFound)
        })
        .await?;

    Ok(Json(Envelope::ok(AccountPayload { user: account })))
}

pub async fn get(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<impl IntoResponse, ApiError> {
    let account = state
        .blocking(move |s| s.db.get_account(id)?.ok_or(ApiError::NotFound))
        .await?;
    Ok(Json(Envelope::ok(AccountPayload { user: account })))
}

/// `POST /api/users/{id}/follow`. Idempotent; only a new edge notifies.
pub async fn follow(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(target): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    set_following(state, user, target, true).await
}

pub async fn unfollow(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    ApiPath(target): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    set_following(state, user, target, false).await
}

async fn set_following(
    state: AppState,
    user: CurrentUser,
    target: Uuid,
    following: bool,
) -> Result<Json<Envelope<FollowPayload>>, ApiError> {
    let follower = user.account;
    if follower.id == target {
        return Err(ApiError::InvalidInput("cannot follow yourself".into()));
    }

    let follower_id = follower.id;
    let (account, changed, notification) = state
        .blocking(move |s| {
            if !s.db.account_exists(target)? {
                return Err(ApiError::NotFound);
            }
            let changed = if following {
                s.db.follow(follower_id, target)?
            } else {
                s.db.unfollow(follower_id, target)?
            };

            let notification = if following && changed {
                Some(s.db.insert_notification(
                    target,
                    NotificationKind::Follow,
                    &format!("{} started following you", follower.display_name),
                    Some(follower_id),
                    Some(follower_id),
                )?)
            } else {
                None
            };

            let account = s.db.get_account(target)?.ok_or(ApiError::NotFound)?;
            Ok((account, changed, notification))
        })
        .await?;

    if changed {
        info!(
            "{} {} {}",
            follower_id,
            if following { "followed" } else { "unfollowed" },
            target
        );
        let event = PushEvent::FollowUpdated {
            follower_id,
            followee_id: target,
            following,
        };
        state.dispatcher.send_to_users(&[follower_id, target], event);
    }
    if let Some(notification) = notification {
        deliver(&state, notification);
    }

    Ok(Json(Envelope::ok(FollowPayload {
        following,
        user: account,
    })))
}
