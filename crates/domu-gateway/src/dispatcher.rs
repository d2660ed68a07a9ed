use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{broadcast, mpsc};
use tracing::info;
use uuid::Uuid;

use domu_auth::RevocationListener;
use domu_types::events::PushEvent;

const BROADCAST_CAPACITY: usize = 1024;

/// Fans events out to connected sockets: global events over a broadcast
/// channel, targeted events to every connection bound to the recipient.
///
/// Bindings sit behind a std lock and never across an await, so the session
/// manager can drop revoked connections synchronously.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Every connection receives every global event
    broadcast_tx: broadcast::Sender<PushEvent>,

    bindings: RwLock<Bindings>,
}

struct Binding {
    account_id: Uuid,
    session_id: Uuid,
    tx: mpsc::UnboundedSender<PushEvent>,
}

#[derive(Default)]
struct Bindings {
    by_conn: HashMap<Uuid, Binding>,

    /// account -> conn_ids; one account may be open in several tabs/devices
    by_account: HashMap<Uuid, HashSet<Uuid>>,
}

impl Bindings {
    fn remove(&mut self, conn_id: Uuid) -> Option<Uuid> {
        let Binding { account_id, .. } = self.by_conn.remove(&conn_id)?;
        if let Some(conns) = self.by_account.get_mut(&account_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                self.by_account.remove(&account_id);
            }
        }
        Some(account_id)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                bindings: RwLock::new(Bindings::default()),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Bindings> {
        self.inner.bindings.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Bindings> {
        self.inner.bindings.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Send to all connected clients. Nobody listening is not an error.
    pub fn broadcast(&self, event: PushEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Bind a connection to the account behind `session_id`, replacing any
    /// earlier binding of the same connection.
    pub fn bind(&self, conn_id: Uuid, account_id: Uuid, session_id: Uuid, tx: mpsc::UnboundedSender<PushEvent>) {
        let mut bindings = self.write();
        bindings.remove(conn_id);
        bindings.by_conn.insert(
            conn_id,
            Binding {
                account_id,
                session_id,
                tx,
            },
        );
        bindings.by_account.entry(account_id).or_default().insert(conn_id);
    }

    /// Returns the account the connection was bound to, if any.
    pub fn unbind(&self, conn_id: Uuid) -> Option<Uuid> {
        self.write().remove(conn_id)
    }

    /// Drop every binding that rode on one of `session_ids`. The sockets stay
    /// open as anonymous connections. Returns how many were unbound.
    pub fn unbind_sessions(&self, session_ids: &[Uuid]) -> usize {
        let mut bindings = self.write();
        let doomed: Vec<Uuid> = bindings
            .by_conn
            .iter()
            .filter(|(_, b)| session_ids.contains(&b.session_id))
            .map(|(conn_id, _)| *conn_id)
            .collect();
        for conn_id in &doomed {
            if let Some(binding) = bindings.by_conn.get(conn_id) {
                let _ = binding.tx.send(PushEvent::Authenticated { user_id: None });
            }
            bindings.remove(*conn_id);
        }
        doomed.len()
    }

    /// Deliver to every connection bound to `account_id`. Returns how many
    /// connections accepted the event; zero means the account is offline and
    /// the client will pick it up on its next poll.
    pub fn send_to_user(&self, account_id: Uuid, event: PushEvent) -> usize {
        let bindings = self.read();
        let Some(conns) = bindings.by_account.get(&account_id) else {
            return 0;
        };

        conns
            .iter()
            .filter_map(|conn_id| bindings.by_conn.get(conn_id))
            .filter(|b| b.tx.send(event.clone()).is_ok())
            .count()
    }

    pub fn send_to_users(&self, account_ids: &[Uuid], event: PushEvent) -> usize {
        account_ids
            .iter()
            .map(|account_id| self.send_to_user(*account_id, event.clone()))
            .sum()
    }

    pub fn connected_accounts(&self) -> Vec<Uuid> {
        self.read().by_account.keys().copied().collect()
    }

    pub fn connection_count(&self, account_id: Uuid) -> usize {
        self.read().by_account.get(&account_id).map_or(0, HashSet::len)
    }
}

impl RevocationListener for Dispatcher {
    fn sessions_revoked(&self, session_ids: &[Uuid]) {
        let dropped = self.unbind_sessions(session_ids);
        if dropped > 0 {
            info!("Unbound {} connections after session revocation", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn follow(follower_id: Uuid, followee_id: Uuid) -> PushEvent {
        PushEvent::FollowUpdated {
            follower_id,
            followee_id,
            following: true,
        }
    }

    #[tokio::test]
    async fn targeted_events_reach_every_tab_of_the_account() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        dispatcher.bind(Uuid::new_v4(), alice, Uuid::new_v4(), tx1);
        dispatcher.bind(Uuid::new_v4(), alice, Uuid::new_v4(), tx2);
        dispatcher.bind(Uuid::new_v4(), bob, Uuid::new_v4(), tx3);

        let event = follow(bob, alice);
        assert_eq!(dispatcher.send_to_user(alice, event.clone()), 2);
        assert_eq!(rx1.recv().await, Some(event.clone()));
        assert_eq!(rx2.recv().await, Some(event));
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn unbind_and_rebind() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.bind(conn, alice, Uuid::new_v4(), tx.clone());
        assert_eq!(dispatcher.connected_accounts(), vec![alice]);

        // Rebinding the same connection moves it to the new account.
        dispatcher.bind(conn, bob, Uuid::new_v4(), tx);
        assert_eq!(dispatcher.connection_count(alice), 0);
        assert_eq!(dispatcher.send_to_user(alice, follow(bob, alice)), 0);
        assert_eq!(dispatcher.send_to_user(bob, follow(alice, bob)), 1);
        assert!(rx.recv().await.is_some());

        assert_eq!(dispatcher.unbind(conn), Some(bob));
        assert_eq!(dispatcher.unbind(conn), None);
        assert!(dispatcher.connected_accounts().is_empty());
    }

    #[tokio::test]
    async fn closed_receivers_are_not_counted() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.bind(Uuid::new_v4(), alice, Uuid::new_v4(), tx);
        drop(rx);
        assert_eq!(dispatcher.send_to_user(alice, follow(Uuid::new_v4(), alice)), 0);
    }

    #[tokio::test]
    async fn revoked_sessions_lose_their_bindings() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let (phone, laptop) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        dispatcher.bind(Uuid::new_v4(), alice, phone, tx1);
        dispatcher.bind(Uuid::new_v4(), alice, laptop, tx2);

        dispatcher.sessions_revoked(&[phone]);
        assert_eq!(dispatcher.connection_count(alice), 1);
        assert_eq!(rx1.recv().await, Some(PushEvent::Authenticated { user_id: None }));

        assert_eq!(dispatcher.send_to_user(alice, follow(Uuid::new_v4(), alice)), 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.recv().await.is_some());

        assert_eq!(dispatcher.unbind_sessions(&[laptop, Uuid::new_v4()]), 1);
        assert!(dispatcher.connected_accounts().is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let dispatcher = Dispatcher::new();
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();
        let event = PushEvent::ThreadDeleted { thread_id: Uuid::new_v4() };

        dispatcher.broadcast(event.clone());
        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }
}
