use std::collections::HashMap;

use uuid::Uuid;

use domu_types::models::Notification;

/// Notifications keyed by id. Push and poll both feed it, so the same
/// notification arriving twice is merged instead of shown twice.
#[derive(Debug, Default)]
pub struct NotificationStore {
    by_id: HashMap<Uuid, Notification>,
}

impl NotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the id was not seen before. A known id is
    /// overwritten so a later read flag from the server wins.
    pub fn merge(&mut self, notification: Notification) -> bool {
        self.by_id.insert(notification.id, notification).is_none()
    }

    /// Number of previously unseen notifications.
    pub fn merge_all(&mut self, notifications: impl IntoIterator<Item = Notification>) -> usize {
        notifications.into_iter().filter(|n| self.merge(n.clone())).count()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.by_id.values().filter(|n| !n.read).count()
    }

    /// Newest first.
    pub fn list(&self) -> Vec<Notification> {
        let mut all: Vec<Notification> = self.by_id.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        all
    }

    pub fn mark_read(&mut self, ids: &[Uuid]) {
        for id in ids {
            if let Some(n) = self.by_id.get_mut(id) {
                n.read = true;
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, Utc};
    use domu_types::models::NotificationKind;

    fn note(id: u128, minutes_ago: i64) -> Notification {
        Notification {
            id: Uuid::from_u128(id),
            recipient_id: Uuid::from_u128(99),
            kind: NotificationKind::Like,
            message: format!("n{}", id),
            related_id: None,
            actor_id: None,
            read: false,
            created_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn same_id_is_kept_once() {
        let mut store = NotificationStore::new();
        assert!(store.merge(note(1, 0)));
        assert!(!store.merge(note(1, 0)));
        assert_eq!(store.merge_all(vec![note(1, 0), note(2, 1)]), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.unread_count(), 2);
    }

    #[test]
    fn list_is_newest_first_and_read_flags_stick() {
        let mut store = NotificationStore::new();
        store.merge_all(vec![note(1, 10), note(2, 0), note(3, 5)]);
        let ids: Vec<u128> = store.list().iter().map(|n| n.id.as_u128()).collect();
        assert_eq!(ids, vec![2, 3, 1]);

        store.mark_read(&[Uuid::from_u128(3), Uuid::from_u128(42)]);
        assert_eq!(store.unread_count(), 2);

        store.clear();
        assert!(store.is_empty());
    }
}
