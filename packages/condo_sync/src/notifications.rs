use std::collections::HashSet;
use tracing::debug;

use crate::model::{Notification, NotificationId};

/// Badge shown once the unread count exceeds this.
const BADGE_CAP: usize = 9;

/// Per-user notification feed, most recent first.
///
/// `unread` is adjusted in the same call that flips a `read` flag, so it
/// always equals the number of unread entries.
#[derive(Default)]
pub struct NotificationStore {
    items: Vec<Notification>,
    unread: usize,
}

impl NotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the feed with fetched history.
    ///
    /// History is authoritative for the ids it carries. Entries pushed live
    /// that it does not know about are kept whatever their timestamp, since
    /// a history page can miss them; the result is ordered most recent
    /// first and the unread count is recomputed from it.
    pub fn load(&mut self, history: Vec<Notification>) {
        let mut seen = HashSet::new();
        let history: Vec<Notification> = history
            .into_iter()
            .filter(|n| seen.insert(n.id.clone()))
            .collect();

        let mut items: Vec<Notification> = std::mem::take(&mut self.items)
            .into_iter()
            .filter(|n| !seen.contains(&n.id))
            .collect();
        if !items.is_empty() {
            debug!(kept = items.len(), history = history.len(), "live notifications missing from history");
        }
        items.extend(history);
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        self.unread = items.iter().filter(|n| !n.read).count();
        self.items = items;
    }

    /// Prepend a notification pushed over the channel. It is unread
    /// whatever the payload says. Returns false for an id already in the
    /// feed, which is left untouched.
    pub fn push_live(&mut self, mut notification: Notification) -> bool {
        if self.items.iter().any(|n| n.id == notification.id) {
            return false;
        }
        notification.read = false;
        self.items.insert(0, notification);
        self.unread += 1;
        true
    }

    /// Flip one notification to read. Returns true if it was unread.
    pub fn mark_read(&mut self, id: &NotificationId) -> bool {
        match self.items.iter_mut().find(|n| &n.id == id) {
            Some(n) if !n.read => {
                n.read = true;
                self.unread = self.unread.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Flip every notification to read. Returns how many changed.
    pub fn mark_all_read(&mut self) -> usize {
        let mut flipped = 0;
        for n in self.items.iter_mut().filter(|n| !n.read) {
            n.read = true;
            flipped += 1;
        }
        self.unread = 0;
        flipped
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    /// Label for the unread badge: nothing at zero, `9+` past nine.
    pub fn badge(&self) -> Option<String> {
        match self.unread {
            0 => None,
            n if n > BADGE_CAP => Some(format!("{BADGE_CAP}+")),
            n => Some(n.to_string()),
        }
    }

    pub fn get(&self, id: &NotificationId) -> Option<&Notification> {
        self.items.iter().find(|n| &n.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.items.clone()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.unread = 0;
    }
}
