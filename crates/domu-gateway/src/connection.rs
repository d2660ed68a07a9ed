use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use domu_auth::SessionManager;
use domu_types::events::{ClientCommand, PushEvent};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drive one WebSocket until either side goes away.
///
/// Connections start anonymous and receive only global broadcasts. An
/// `authenticate` command binds the connection to an account so targeted
/// events reach it. `cookie_token` is the `auth-token` cookie from the upgrade
/// request, used when the command carries no token of its own.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    sessions: Arc<SessionManager>,
    cookie_token: Option<String>,
) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (user_tx, mut user_rx) = mpsc::unbounded_channel::<PushEvent>();
    let mut broadcast_rx = dispatcher.subscribe();

    debug!("Connection {} opened", conn_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            let event = tokio::select! {
                result = broadcast_rx.recv() => match result {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Connection {} lagged, skipped {} events", conn_id, n);
                        continue;
                    }
                    Err(_) => break,
                },
                result = user_rx.recv() => match result {
                    Some(event) => event,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping {}", missed_heartbeats, conn_id);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {} event: {}", event.kind(), e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_dispatcher = dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(
                            &recv_dispatcher,
                            &sessions,
                            conn_id,
                            &user_tx,
                            cookie_token.as_deref(),
                            cmd,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            "Connection {} bad command: {} -- raw: {}",
                            conn_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if let Some(account_id) = dispatcher.unbind(conn_id) {
        info!("{} disconnected from gateway ({})", account_id, conn_id);
    } else {
        debug!("Connection {} closed", conn_id);
    }
}

async fn handle_command(
    dispatcher: &Dispatcher,
    sessions: &Arc<SessionManager>,
    conn_id: Uuid,
    user_tx: &mpsc::UnboundedSender<PushEvent>,
    cookie_token: Option<&str>,
    cmd: ClientCommand,
) {
    match cmd {
        ClientCommand::Authenticate { user_id, token } => {
            let bound = match user_id {
                None => None,
                Some(claimed) => {
                    let token = token.or_else(|| cookie_token.map(str::to_string));
                    verify_binding(sessions, claimed, token).await
                }
            };

            let bound = match bound {
                Some((account_id, session_id)) => {
                    dispatcher.bind(conn_id, account_id, session_id, user_tx.clone());
                    // A revocation that landed between the lookup and the bind
                    // found nothing to unbind.
                    if session_still_live(sessions, session_id).await {
                        info!("{} bound to connection {}", account_id, conn_id);
                        Some(account_id)
                    } else {
                        dispatcher.unbind(conn_id);
                        None
                    }
                }
                None => {
                    if let Some(previous) = dispatcher.unbind(conn_id) {
                        info!("{} unbound from connection {}", previous, conn_id);
                    }
                    None
                }
            };

            let _ = user_tx.send(PushEvent::Authenticated { user_id: bound });
        }
    }
}

/// The session behind `token`, only when it authenticates to exactly the
/// claimed account.
async fn verify_binding(
    sessions: &Arc<SessionManager>,
    claimed: Uuid,
    token: Option<String>,
) -> Option<(Uuid, Uuid)> {
    let Some(token) = token else {
        warn!("authenticate for {} without a token", claimed);
        return None;
    };

    let sessions = sessions.clone();
    let result = tokio::task::spawn_blocking(move || sessions.authenticate_session(&token)).await;

    match result {
        Ok(Ok((account, session_id))) if account.id == claimed => Some((claimed, session_id)),
        Ok(Ok((account, _))) => {
            warn!("authenticate claimed {} but token belongs to {}", claimed, account.id);
            None
        }
        Ok(Err(e)) => {
            debug!("authenticate for {} rejected: {}", claimed, e);
            None
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            None
        }
    }
}

async fn session_still_live(sessions: &Arc<SessionManager>, session_id: Uuid) -> bool {
    let sessions = sessions.clone();
    match tokio::task::spawn_blocking(move || sessions.session_exists(session_id)).await {
        Ok(Ok(live)) => live,
        Ok(Err(e)) => {
            warn!("session {} recheck failed: {}", session_id, e);
            false
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            false
        }
    }
}
