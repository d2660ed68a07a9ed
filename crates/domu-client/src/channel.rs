//! Persistent WebSocket to the gateway with fixed-delay reconnect.

use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use domu_types::events::{ClientCommand, PushEvent};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Gateway URL, e.g. `ws://localhost:3001/`
    pub url: String,
    /// Fixed wait between a drop and the next attempt. No backoff.
    pub reconnect_delay: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Who the socket should be bound to. `user_id: None` means signed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<Uuid>,
    pub token: Option<String>,
}

impl Identity {
    pub fn signed_in(user_id: Uuid, token: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            token: Some(token.into()),
        }
    }

    fn command(&self) -> ClientCommand {
        ClientCommand::Authenticate {
            user_id: self.user_id,
            token: self.token.clone(),
        }
    }
}

/// Logged and retried, never surfaced to consumers.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("socket error: {0}")]
    Socket(#[source] tungstenite::Error),

    #[error("connection closed by server")]
    Closed,

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Client side of the push channel. Consumers watch the connection state,
/// the last received event, or the full event stream, and branch on the
/// event type.
pub struct RealtimeChannel {
    config: ChannelConfig,
    state_tx: watch::Sender<ChannelState>,
    last_tx: watch::Sender<Option<PushEvent>>,
    events_tx: broadcast::Sender<PushEvent>,
}

impl RealtimeChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (last_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            config,
            state_tx,
            last_tx,
            events_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn last_event(&self) -> watch::Receiver<Option<PushEvent>> {
        self.last_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events_tx.subscribe()
    }

    /// Connect and stay connected until `shutdown` flips. Every drop is
    /// followed by `reconnect_delay` and a fresh attempt.
    pub async fn run(&self, mut identity: watch::Receiver<Identity>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect_and_run(&mut identity, &mut shutdown).await {
                Ok(()) => {
                    info!("Realtime channel shut down");
                    break;
                }
                Err(e) => {
                    self.set_state(ChannelState::Disconnected);
                    warn!(
                        error = %e,
                        delay_ms = self.config.reconnect_delay.as_millis() as u64,
                        "Realtime channel dropped, reconnecting"
                    );
                }
            }

            tokio::select! {
                () = sleep(self.config.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.set_state(ChannelState::Disconnected);
    }

    async fn connect_and_run(
        &self,
        identity: &mut watch::Receiver<Identity>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ChannelError> {
        self.set_state(ChannelState::Connecting);
        let (ws, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(ChannelError::Connect)?;
        self.set_state(ChannelState::Connected);
        info!(url = %self.config.url, "Realtime channel connected");

        let (mut sink, mut stream) = ws.split();

        let current = identity.borrow_and_update().clone();
        send_command(&mut sink, &current.command()).await?;

        let mut identity_open = true;
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(_))) | None => return Err(ChannelError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ChannelError::Socket(e)),
                },
                changed = identity.changed(), if identity_open => {
                    if changed.is_err() {
                        identity_open = false;
                        continue;
                    }
                    let current = identity.borrow_and_update().clone();
                    debug!(user_id = ?current.user_id, "Identity changed, re-authenticating");
                    send_command(&mut sink, &current.command()).await?;
                }
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<PushEvent>(text) {
            Ok(event) => {
                debug!(kind = event.kind(), "Push event");
                self.last_tx.send_replace(Some(event.clone()));
                let _ = self.events_tx.send(event);
            }
            Err(e) => {
                let raw: String = text.chars().take(200).collect();
                warn!(error = %e, raw = %raw, "Skipping unrecognised frame");
            }
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }
}

async fn send_command<S>(sink: &mut S, cmd: &ClientCommand) -> Result<(), ChannelError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(cmd)?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(ChannelError::Socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Accepts sockets, reports every received command, and closes each
    /// connection right after greeting it with one event.
    async fn flaky_server() -> (String, mpsc::UnboundedReceiver<ClientCommand>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut n = 0u32;
            while let Ok((stream, _)) = listener.accept().await {
                n += 1;
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let cmd: ClientCommand = serde_json::from_str(&text).unwrap();
                        tx.send(cmd).unwrap();
                        let event = PushEvent::ThreadDeleted {
                            thread_id: Uuid::from_u128(n as u128),
                        };
                        let json = serde_json::to_string(&event).unwrap();
                        ws.send(Message::Text("not json".into())).await.unwrap();
                        ws.send(Message::Text(json.into())).await.unwrap();
                        if n == 1 {
                            let _ = ws.close(None).await;
                            return;
                        }
                    }
                });
            }
        });

        (url, rx)
    }

    #[tokio::test]
    async fn reconnects_and_reauthenticates() {
        let (url, mut commands) = flaky_server().await;
        let channel = Arc::new(RealtimeChannel::new(ChannelConfig {
            url,
            reconnect_delay: Duration::from_millis(50),
        }));
        let mut events = channel.subscribe();
        let me = Identity::signed_in(Uuid::new_v4(), "tok");
        let (_identity_tx, identity_rx) = watch::channel(me.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = channel.clone();
        let task = tokio::spawn(async move { runner.run(identity_rx, shutdown_rx).await });

        for expected in 1..=2u128 {
            let cmd = tokio::time::timeout(Duration::from_secs(5), commands.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(cmd, me.command());

            // The garbage frame is skipped; the event still arrives.
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event, PushEvent::ThreadDeleted { thread_id: Uuid::from_u128(expected) });
        }
        assert_eq!(
            *channel.last_event().borrow(),
            Some(PushEvent::ThreadDeleted { thread_id: Uuid::from_u128(2) })
        );
        assert_eq!(*channel.state().borrow(), ChannelState::Connected);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(*channel.state().borrow(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn identity_change_is_resent_while_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let (tx, mut commands) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                tx.send(serde_json::from_str::<ClientCommand>(&text).unwrap()).unwrap();
            }
        });

        let channel = Arc::new(RealtimeChannel::new(ChannelConfig::new(url)));
        let (identity_tx, identity_rx) = watch::channel(Identity::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = channel.clone();
        tokio::spawn(async move { runner.run(identity_rx, shutdown_rx).await });

        let anonymous = commands.recv().await.unwrap();
        assert_eq!(anonymous, ClientCommand::Authenticate { user_id: None, token: None });

        let me = Identity::signed_in(Uuid::new_v4(), "tok");
        identity_tx.send(me.clone()).unwrap();
        assert_eq!(commands.recv().await.unwrap(), me.command());

        identity_tx.send(Identity::default()).unwrap();
        assert_eq!(
            commands.recv().await.unwrap(),
            ClientCommand::Authenticate { user_id: None, token: None }
        );
    }

    #[tokio::test]
    async fn unreachable_server_keeps_retrying_until_shutdown() {
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let channel = Arc::new(RealtimeChannel::new(ChannelConfig {
            url: format!("ws://{}/", addr),
            reconnect_delay: Duration::from_millis(20),
        }));
        let (_identity_tx, identity_rx) = watch::channel(Identity::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = channel.clone();
        let task = tokio::spawn(async move { runner.run(identity_rx, shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(*channel.state().borrow(), ChannelState::Disconnected);
    }
}
