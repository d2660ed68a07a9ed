use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{GroupMessage, Notification, Thread};

/// Events pushed FROM server TO client over the WebSocket gateway.
/// Wire shape: `{ "type": "<snake_case tag>", "data": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    /// Server acknowledges an `authenticate` command. `None` after a logout.
    Authenticated { user_id: Option<Uuid> },

    /// A thread was posted
    ThreadCreated { thread: Thread },

    /// A thread's content or likes changed
    ThreadUpdated { thread: Thread },

    /// A thread was removed by its author or an admin
    ThreadDeleted { thread_id: Uuid },

    /// A notification was stored for the receiving account
    NotificationReceived { notification: Notification },

    /// `follower_id` started (`following = true`) or stopped following `followee_id`
    FollowUpdated {
        follower_id: Uuid,
        followee_id: Uuid,
        following: bool,
    },

    /// A chat message was posted in a group the receiver belongs to
    GroupMessageCreated { message: GroupMessage },
}

impl PushEvent {
    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::ThreadCreated { .. } => "thread_created",
            Self::ThreadUpdated { .. } => "thread_updated",
            Self::ThreadDeleted { .. } => "thread_deleted",
            Self::NotificationReceived { .. } => "notification_received",
            Self::FollowUpdated { .. } => "follow_updated",
            Self::GroupMessageCreated { .. } => "group_message_created",
        }
    }
}

/// Commands sent FROM client TO server over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Bind this connection to `user_id` so targeted events reach it.
    /// `user_id: None` unbinds. When `token` is absent the server falls back
    /// to the `auth-token` cookie sent with the upgrade request.
    Authenticate {
        user_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}
