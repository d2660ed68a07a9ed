//! WebSocket push channel: global broadcasts plus per-account targeted events.

pub mod connection;
pub mod dispatcher;

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use axum_extra::extract::CookieJar;

use domu_auth::{AUTH_COOKIE, SessionManager};

pub use dispatcher::Dispatcher;

#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Dispatcher,
    pub sessions: Arc<SessionManager>,
}

impl GatewayState {
    /// Registers the dispatcher for revocations so a closed session stops
    /// receiving targeted events the moment its row is deleted.
    pub fn new(dispatcher: Dispatcher, sessions: Arc<SessionManager>) -> Self {
        sessions.add_listener(Arc::new(dispatcher.clone()));
        Self { dispatcher, sessions }
    }
}

/// Upgrade routes for the gateway port. Clients connect to `/` or `/ws`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<GatewayState>,
    jar: CookieJar,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let cookie_token = jar.get(AUTH_COOKIE).map(|c| c.value().to_string());
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.sessions, cookie_token)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::time::Duration;

    use domu_auth::ClientInfo;
    use domu_db::Database;
    use domu_db::models::NewAccount;
    use domu_types::events::{ClientCommand, PushEvent};
    use domu_types::models::Role;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use uuid::Uuid;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Harness {
        _dir: tempfile::TempDir,
        addr: SocketAddr,
        dispatcher: Dispatcher,
        sessions: Arc<SessionManager>,
        db: Arc<Database>,
    }

    async fn start() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("gw.db")).unwrap());
        let sessions = Arc::new(SessionManager::new(db.clone(), "test-secret", chrono::Duration::days(7)));
        let dispatcher = Dispatcher::new();

        let app = router(GatewayState::new(dispatcher.clone(), sessions.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Harness {
            _dir: dir,
            addr,
            dispatcher,
            sessions,
            db,
        }
    }

    impl Harness {
        /// Account plus a live token, skipping password hashing.
        fn login(&self, username: &str) -> (Uuid, String) {
            let id = Uuid::new_v4();
            self.db
                .create_account(&NewAccount {
                    id,
                    username: username.into(),
                    email: format!("{}@example.com", username),
                    display_name: username.into(),
                    password_hash: "$argon2id$stub".into(),
                    avatar: None,
                    bio: None,
                    role: Role::Member,
                })
                .unwrap();
            let issued = self.sessions.issue(id, ClientInfo::default()).unwrap();
            (id, issued.token)
        }

        /// A second session for an existing account.
        fn login_again(&self, id: Uuid) -> (Uuid, String) {
            let issued = self.sessions.issue(id, ClientInfo::default()).unwrap();
            (issued.session_id, issued.token)
        }

        async fn connect(&self) -> Client {
            let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", self.addr))
                .await
                .unwrap();
            ws
        }
    }

    async fn send(ws: &mut Client, cmd: &ClientCommand) {
        let text = serde_json::to_string(cmd).unwrap();
        ws.send(Message::Text(text.into())).await.unwrap();
    }

    async fn next_event(ws: &mut Client) -> PushEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                    _ => continue,
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn authenticated_connection_receives_targeted_events() {
        let h = start().await;
        let (alice, token) = h.login("alice");
        let mut ws = h.connect().await;

        send(&mut ws, &ClientCommand::Authenticate { user_id: Some(alice), token: Some(token) }).await;
        assert_eq!(next_event(&mut ws).await, PushEvent::Authenticated { user_id: Some(alice) });

        let event = PushEvent::FollowUpdated {
            follower_id: Uuid::new_v4(),
            followee_id: alice,
            following: true,
        };
        assert_eq!(h.dispatcher.send_to_user(alice, event.clone()), 1);
        assert_eq!(next_event(&mut ws).await, event);

        // Logout unbinds.
        send(&mut ws, &ClientCommand::Authenticate { user_id: None, token: None }).await;
        assert_eq!(next_event(&mut ws).await, PushEvent::Authenticated { user_id: None });
        assert_eq!(h.dispatcher.connection_count(alice), 0);
    }

    #[tokio::test]
    async fn mismatched_or_revoked_token_does_not_bind() {
        let h = start().await;
        let (alice, _) = h.login("alice");
        let (_bob, bob_token) = h.login("bob");
        let mut ws = h.connect().await;

        send(&mut ws, &ClientCommand::Authenticate { user_id: Some(alice), token: Some(bob_token.clone()) }).await;
        assert_eq!(next_event(&mut ws).await, PushEvent::Authenticated { user_id: None });
        assert_eq!(h.dispatcher.connection_count(alice), 0);

        let (carol, carol_token) = h.login("carol");
        h.sessions.logout(&carol_token).unwrap();
        send(&mut ws, &ClientCommand::Authenticate { user_id: Some(carol), token: Some(carol_token) }).await;
        assert_eq!(next_event(&mut ws).await, PushEvent::Authenticated { user_id: None });
    }

    #[tokio::test]
    async fn logout_stops_targeted_events_to_a_bound_socket() {
        let h = start().await;
        let (alice, token) = h.login("alice");
        let (_, other_tab) = h.login_again(alice);
        let mut ws = h.connect().await;
        let mut ws2 = h.connect().await;

        send(&mut ws, &ClientCommand::Authenticate { user_id: Some(alice), token: Some(token.clone()) }).await;
        assert_eq!(next_event(&mut ws).await, PushEvent::Authenticated { user_id: Some(alice) });
        send(&mut ws2, &ClientCommand::Authenticate { user_id: Some(alice), token: Some(other_tab) }).await;
        assert_eq!(next_event(&mut ws2).await, PushEvent::Authenticated { user_id: Some(alice) });
        assert_eq!(h.dispatcher.connection_count(alice), 2);

        h.sessions.logout(&token).unwrap();
        assert_eq!(next_event(&mut ws).await, PushEvent::Authenticated { user_id: None });

        let event = PushEvent::FollowUpdated {
            follower_id: Uuid::new_v4(),
            followee_id: alice,
            following: true,
        };
        assert_eq!(h.dispatcher.send_to_user(alice, event.clone()), 1);
        assert_eq!(next_event(&mut ws2).await, event);

        h.sessions.revoke_all(alice).unwrap();
        assert_eq!(h.dispatcher.send_to_user(alice, event), 0);
    }

    #[tokio::test]
    async fn anonymous_connections_still_get_broadcasts() {
        let h = start().await;
        let mut ws = h.connect().await;

        // Bad frames are skipped, not fatal.
        ws.send(Message::Text("{\"type\":\"nope\"}".into())).await.unwrap();

        let event = PushEvent::ThreadDeleted { thread_id: Uuid::new_v4() };
        // The subscription is taken right after the upgrade; give it a moment.
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.dispatcher.broadcast(event.clone());
        assert_eq!(next_event(&mut ws).await, event);
    }
}
