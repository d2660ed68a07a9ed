use axum::{
    Extension, Json,
    extract::State,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use domu_types::api::{AccountPayload, Empty, Envelope, SetRoleRequest, UsersPayload};
use domu_types::models::Role;

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::middleware::CurrentUser;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UserListQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_users(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<UserListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.clamp(1, 200);
    let users = state
        .blocking(move |s| Ok(s.db.list_accounts(limit, query.offset)?))
        .await?;
    Ok(Json(Envelope::ok(UsersPayload { users })))
}

/// Removes the account and everything it owns. Its sessions are revoked
/// first so outstanding tokens stop working immediately.
pub async fn delete_user(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if id == admin.id() {
        return Err(ApiError::InvalidInput("cannot delete your own account".into()));
    }

    state
        .blocking(move |s| {
            s.sessions.revoke_all(id)?;
            if !s.db.delete_account(id)? {
                return Err(ApiError::NotFound);
            }
            Ok(())
        })
        .await?;

    warn!("{} deleted account {}", admin.account.username, id);
    Ok(Json(Envelope::ok(Empty {})))
}

pub async fn set_role(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentUser>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<SetRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if id == admin.id() {
        return Err(ApiError::InvalidInput("cannot change your own role".into()));
    }

    let role = req.role;
    let account = state
        .blocking(move |s| {
            if !s.db.set_role(id, role)? {
                return Err(ApiError::NotFound);
            }
            // Demotion signs the account out everywhere.
            if role == Role::Member {
                s.sessions.revoke_all(id)?;
            }
            s.db.get_account(id)?.ok_or(ApiError::NotFound)
        })
        .await?;

    info!("{} set role of {} to {}", admin.account.username, account.username, role);
    Ok(Json(Envelope::ok(AccountPayload { user: account })))
}
