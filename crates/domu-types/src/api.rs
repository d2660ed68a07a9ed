use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    Account, Comment, DailyTopic, Group, GroupMember, GroupMessage, Notification, NotificationKind,
    Role, Session, Thread,
};

// -- JWT Claims --

/// JWT claims shared by the REST layer and the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub username: String,
    pub iat: usize,
    pub exp: usize,
    /// Unique per issue so two logins in the same second get distinct sessions.
    pub jti: Uuid,
}

// -- Envelope --

/// Every response body is `{ "success": bool, ...payload }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn ok(body: T) -> Self {
        Self {
            success: true,
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Empty {}

// -- Auth --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountPayload {
    pub user: Account,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginPayload {
    pub user: Account,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsPayload {
    pub sessions: Vec<Session>,
    pub current: Option<Uuid>,
}

// -- Users --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FollowPayload {
    pub following: bool,
    pub user: Account,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsersPayload {
    pub users: Vec<Account>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SetRoleRequest {
    pub role: Role,
}

// -- Threads --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreateThreadRequest {
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub topic_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateThreadRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThreadPayload {
    pub thread: Thread,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThreadsPayload {
    pub threads: Vec<Thread>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LikePayload {
    pub liked: bool,
    pub likes: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreateCommentRequest {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommentPayload {
    pub comment: Comment,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommentsPayload {
    pub comments: Vec<Comment>,
}

// -- Notifications --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreateNotificationRequest {
    pub recipient_id: Uuid,
    #[serde(rename = "type", default = "default_notification_kind")]
    pub kind: NotificationKind,
    pub message: String,
    #[serde(default)]
    pub related_id: Option<Uuid>,
}

fn default_notification_kind() -> NotificationKind {
    NotificationKind::System
}

/// `ids: None` marks everything read.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    #[serde(default)]
    pub ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification: Notification,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationsPayload {
    pub notifications: Vec<Notification>,
    pub unread_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadPayload {
    pub updated: u32,
    pub unread_count: u32,
}

// -- Daily topics --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTopicRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTopicRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopicPayload {
    pub topic: Option<DailyTopic>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopicsPayload {
    pub topics: Vec<DailyTopic>,
}

// -- Groups --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateGroupRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_private: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JoinGroupRequest {
    pub group_id: Uuid,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InviteRequest {
    pub group_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SendGroupMessageRequest {
    pub content: String,
    #[serde(default)]
    pub attachment_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupPayload {
    pub group: Group,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupsPayload {
    pub groups: Vec<Group>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MembersPayload {
    pub members: Vec<GroupMember>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupMessagePayload {
    pub message: GroupMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupMessagesPayload {
    pub messages: Vec<GroupMessage>,
}

// -- Uploads --

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadPayload {
    pub url: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_flattens_payload() {
        let body = Envelope::ok(MarkReadPayload {
            updated: 2,
            unread_count: 0,
        });
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "success": true, "updated": 2, "unread_count": 0 }));

        let back: Envelope<MarkReadPayload> = serde_json::from_value(json).unwrap();
        assert!(back.success);
        assert_eq!(back.body.updated, 2);
    }

    #[test]
    fn register_rejects_unknown_fields() {
        let raw = r#"{"username":"al","display_name":"Al","email":"a@x.com","password":"p","admin":true}"#;
        assert!(serde_json::from_str::<RegisterRequest>(raw).is_err());
    }

    #[test]
    fn create_notification_defaults_to_system() {
        let raw = format!(r#"{{"recipient_id":"{}","message":"maintenance tonight"}}"#, Uuid::nil());
        let req: CreateNotificationRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(req.kind, NotificationKind::System);
    }
}
