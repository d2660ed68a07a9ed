//! One notification list fed by both the push channel and the poller.

use std::sync::Mutex;

use tokio::sync::{broadcast, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};
use uuid::Uuid;

use domu_types::api::NotificationsPayload;
use domu_types::events::PushEvent;
use domu_types::models::Notification;

use crate::channel::Identity;
use crate::poller::NotificationPoller;
use crate::store::NotificationStore;

pub struct NotificationFeed {
    poller: NotificationPoller,
    store: Mutex<NotificationStore>,
    unread_tx: watch::Sender<usize>,
}

impl NotificationFeed {
    pub fn new(poller: NotificationPoller) -> Self {
        let (unread_tx, _) = watch::channel(0);
        Self {
            poller,
            store: Mutex::new(NotificationStore::new()),
            unread_tx,
        }
    }

    pub fn unread(&self) -> watch::Receiver<usize> {
        self.unread_tx.subscribe()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.with_store(|store| store.list())
    }

    pub fn mark_read(&self, ids: &[Uuid]) {
        self.with_store(|store| store.mark_read(ids));
    }

    /// Merge a pushed event. Anything other than a notification is ignored.
    pub fn apply_event(&self, event: &PushEvent) -> bool {
        match event {
            PushEvent::NotificationReceived { notification } => {
                self.with_store(|store| store.merge(notification.clone()))
            }
            _ => false,
        }
    }

    pub fn apply_poll(&self, payload: NotificationsPayload) -> usize {
        self.with_store(|store| store.merge_all(payload.notifications))
    }

    /// Poll on a fixed interval and merge pushed notifications until
    /// `shutdown` flips. Signing in as someone else empties the list.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<PushEvent>,
        mut identity: watch::Receiver<Identity>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.poller.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut current = identity.borrow_and_update().clone();
        let mut events_open = true;
        let mut identity_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(token) = current.token.as_deref() else { continue };
                    match self.poller.fetch(token).await {
                        Ok(payload) => {
                            let fresh = self.apply_poll(payload);
                            if fresh > 0 {
                                debug!(fresh, "Poll picked up notifications");
                            }
                        }
                        Err(e) => warn!(error = %e, "Notification poll failed"),
                    }
                }
                event = events.recv(), if events_open => match event {
                    Ok(event) => {
                        self.apply_event(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Feed lagged behind the channel; next poll fills the gap");
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
                changed = identity.changed(), if identity_open => {
                    if changed.is_err() {
                        identity_open = false;
                        continue;
                    }
                    let next = identity.borrow_and_update().clone();
                    if next.user_id != current.user_id {
                        self.with_store(|store| store.clear());
                    }
                    current = next;
                    ticker.reset_immediately();
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut NotificationStore) -> T) -> T {
        let mut store = self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let out = f(&mut store);
        let unread = store.unread_count();
        drop(store);
        self.unread_tx.send_if_modified(|current| {
            let changed = *current != unread;
            *current = unread;
            changed
        });
        out
    }
}
