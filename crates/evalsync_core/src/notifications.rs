use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: Option<String>,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    pub read: bool,
}

/// Bounded newest-first inbox of user notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationInbox {
    items: VecDeque<Notification>,
    capacity: usize,
}

impl NotificationInbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, notification: Notification) {
        self.items.push_front(notification);
        self.items.truncate(self.capacity);
    }

    pub fn unread(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    /// Returns how many were unread.
    pub fn mark_all_read(&mut self) -> usize {
        let mut marked = 0;
        for item in self.items.iter_mut().filter(|n| !n.read) {
            item.read = true;
            marked += 1;
        }
        marked
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
