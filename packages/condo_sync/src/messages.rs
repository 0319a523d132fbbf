//! The message list of the open conversation.
//!
//! Entries come from three places: optimistic placeholders created on send,
//! history fetched over HTTP, and live `message.sent` events. Nothing orders
//! a fetch completing against an event arriving, so the store never decides
//! a placeholder's fate on arrival. It keeps every placeholder and every
//! server entry, and [`reconcile`] recomputes the visible list from both
//! sets, which makes the result independent of delivery order.

use chrono::{TimeDelta, TimeZone};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::config::SyncConfig;
use crate::model::{ConversationId, DeliveryStatus, Message, MessageId};

/// What happened to a server entry offered to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// It superseded the placeholder `local_id`
    Replaced { local_id: MessageId },
    /// It was new and shown on its own
    Inserted,
    /// Its id was already present; nothing changed
    Duplicate,
    /// It belongs to a conversation that is not open; discarded
    Stale,
}

fn same_send(local: &Message, server: &Message, window: TimeDelta) -> bool {
    local.is_local()
        && local.sender_id == server.sender_id
        && local.text.trim() == server.text.trim()
        && (server.created_at - local.created_at).abs() < window
}

fn by_time(a: &&Message, b: &&Message) -> std::cmp::Ordering {
    (a.created_at, &a.id).cmp(&(b.created_at, &b.id))
}

/// A message tagged with the order in which the store received it.
#[derive(Clone, Debug)]
pub struct Received {
    pub seq: u64,
    pub message: Message,
}

/// Decide which placeholder each server entry supersedes, as a map from
/// placeholder id to server id.
///
/// Pairs in `bound` (a send response naming its placeholder) are taken as
/// given. The remaining server entries are visited oldest first and each
/// takes the oldest free placeholder that was already pending when it
/// arrived, from the same sender with the same text, stamped within
/// `window` of it. The result depends only on the two sets, never on the
/// order in which server entries came in.
pub fn pair_placeholders(
    placeholders: &[Received],
    server: &[Received],
    bound: &HashMap<MessageId, MessageId>,
    window: TimeDelta,
) -> HashMap<MessageId, MessageId> {
    let server_ids: HashSet<&MessageId> = server.iter().map(|r| &r.message.id).collect();
    let mut pairs = HashMap::new();
    let mut claimed = HashSet::new();
    for placeholder in placeholders {
        if let Some(server_id) = bound.get(&placeholder.message.id) {
            if server_ids.contains(server_id) && claimed.insert(server_id) {
                pairs.insert(placeholder.message.id.clone(), server_id.clone());
            }
        }
    }

    let mut free: Vec<&Received> = placeholders
        .iter()
        .filter(|p| !pairs.contains_key(&p.message.id))
        .collect();
    free.sort_by(|a, b| by_time(&&a.message, &&b.message));
    let mut arrivals: Vec<&Received> = server
        .iter()
        .filter(|r| !claimed.contains(&r.message.id))
        .collect();
    arrivals.sort_by(|a, b| by_time(&&a.message, &&b.message));

    for incoming in arrivals {
        let found = free
            .iter()
            .position(|p| p.seq < incoming.seq && same_send(&p.message, &incoming.message, window));
        if let Some(pos) = found {
            let local = free.remove(pos);
            pairs.insert(local.message.id.clone(), incoming.message.id.clone());
        }
    }
    pairs
}

fn visible(
    placeholders: &[Received],
    server: &[Received],
    pairs: &HashMap<MessageId, MessageId>,
) -> Vec<Message> {
    let mut out: Vec<Message> = server
        .iter()
        .chain(placeholders.iter().filter(|p| !pairs.contains_key(&p.message.id)))
        .map(|r| r.message.clone())
        .collect();
    out.sort_by(|a, b| by_time(&a, &b));
    out
}

/// The entry set shown for `placeholders` and `server` entries: every
/// server entry plus the placeholders none of them supersedes, ordered by
/// timestamp with ties broken by id.
pub fn reconcile(
    placeholders: &[Received],
    server: &[Received],
    bound: &HashMap<MessageId, MessageId>,
    window: TimeDelta,
) -> Vec<Message> {
    let pairs = pair_placeholders(placeholders, server, bound, window);
    visible(placeholders, server, &pairs)
}

/// Ordered messages of at most one open conversation.
pub struct MessageStore {
    conversation: Option<ConversationId>,
    /// Every placeholder of the conversation, superseded or not
    placeholders: Vec<Received>,
    /// Server entries, unique by id
    server: Vec<Received>,
    received: u64,
    /// Placeholder id to the server id its send response returned
    bound: HashMap<MessageId, MessageId>,
    pairs: HashMap<MessageId, MessageId>,
    entries: Vec<Message>,
    window: TimeDelta,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(SyncConfig::default().reconciliation_window)
    }
}

impl MessageStore {
    pub fn new(window: Duration) -> Self {
        Self {
            conversation: None,
            placeholders: Vec::new(),
            server: Vec::new(),
            received: 0,
            bound: HashMap::new(),
            pairs: HashMap::new(),
            entries: Vec::new(),
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.conversation
    }

    /// Switch to `conversation`, discarding every entry of the previous one.
    pub fn open(&mut self, conversation: Option<ConversationId>) {
        self.conversation = conversation;
        self.placeholders.clear();
        self.server.clear();
        self.bound.clear();
        self.pairs.clear();
        self.entries.clear();
    }

    fn is_open(&self, conversation: ConversationId) -> bool {
        self.conversation == Some(conversation)
    }

    fn has_server(&self, id: &MessageId) -> bool {
        self.server.iter().any(|r| &r.message.id == id)
    }

    fn receive(&mut self, message: Message) -> Received {
        self.received += 1;
        Received {
            seq: self.received,
            message,
        }
    }

    fn refresh(&mut self) {
        self.pairs = pair_placeholders(&self.placeholders, &self.server, &self.bound, self.window);
        self.entries = visible(&self.placeholders, &self.server, &self.pairs);
    }

    fn superseded_by(&self, server_id: &MessageId) -> Option<MessageId> {
        self.pairs
            .iter()
            .find(|(_, s)| *s == server_id)
            .map(|(local, _)| local.clone())
    }

    /// Install fetched history for `conversation`.
    ///
    /// Entries that arrived live before the fetch completed are kept and
    /// pending placeholders are matched against the history, so loading is
    /// equivalent to receiving every history entry live. Returns false, and
    /// changes nothing, when another conversation is open.
    pub fn load(&mut self, conversation: ConversationId, history: Vec<Message>) -> bool {
        match self.conversation {
            Some(open) if open != conversation => return false,
            Some(_) => {}
            None => self.conversation = Some(conversation),
        }

        for mut msg in history {
            if self.has_server(&msg.id) {
                continue;
            }
            msg.conversation_id = conversation;
            let received = self.receive(msg.confirmed());
            self.server.push(received);
        }
        self.refresh();
        true
    }

    /// Add an optimistic placeholder at the tail. Returns false when its
    /// conversation is not open.
    pub fn append_local(&mut self, message: Message) -> bool {
        if !self.is_open(message.conversation_id) {
            return false;
        }
        let received = self.receive(message);
        self.placeholders.push(received);
        self.refresh();
        true
    }

    /// Merge a server entry, typically a live event.
    pub fn reconcile_server(&mut self, message: Message) -> Reconciled {
        if !self.is_open(message.conversation_id) {
            return Reconciled::Stale;
        }
        if self.has_server(&message.id) {
            return Reconciled::Duplicate;
        }
        let id = message.id.clone();
        let received = self.receive(message.confirmed());
        self.server.push(received);
        self.refresh();
        match self.superseded_by(&id) {
            Some(local_id) => Reconciled::Replaced { local_id },
            None => Reconciled::Inserted,
        }
    }

    /// Settle the placeholder `local_id` with the entry the send call
    /// returned. The pairing is fixed from then on; a placeholder that a
    /// live echo had provisionally paired with that entry is released and
    /// waits for its own.
    pub fn confirm_local(&mut self, local_id: &MessageId, message: Message) -> Reconciled {
        if !self.is_open(message.conversation_id) {
            return Reconciled::Stale;
        }
        let message = message.confirmed();
        let server_id = message.id.clone();
        let duplicate = self.has_server(&server_id);
        if !duplicate {
            let received = self.receive(message);
            self.server.push(received);
        }

        let known = self.placeholders.iter().any(|p| &p.message.id == local_id);
        if known && !self.bound.values().any(|s| *s == server_id) {
            self.bound.insert(local_id.clone(), server_id);
        }
        self.refresh();

        if duplicate {
            Reconciled::Duplicate
        } else if known {
            Reconciled::Replaced {
                local_id: local_id.clone(),
            }
        } else {
            Reconciled::Inserted
        }
    }

    /// Mark a placeholder whose send was rejected. It stays visible.
    pub fn mark_failed(&mut self, local_id: &MessageId) -> bool {
        let Some(placeholder) = self
            .placeholders
            .iter_mut()
            .find(|p| &p.message.id == local_id)
        else {
            return false;
        };
        placeholder.message.status = DeliveryStatus::Failed;
        self.refresh();
        true
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries.iter().find(|m| &m.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Placeholders no server entry supersedes yet.
    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|m| m.is_local()).count()
    }

    /// Entries ordered by timestamp, ties broken by id.
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.clone()
    }
}

/// Positions in `messages` where a new calendar day starts in `tz`,
/// including the first message.
pub fn day_breaks<Tz: TimeZone>(messages: &[Message], tz: &Tz) -> Vec<usize> {
    let mut breaks = Vec::new();
    let mut previous = None;
    for (i, msg) in messages.iter().enumerate() {
        let day = msg.created_at.with_timezone(tz).date_naive();
        if previous != Some(day) {
            breaks.push(i);
        }
        previous = Some(day);
    }
    breaks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Origin, UserId};
    use chrono::{DateTime, FixedOffset, Utc};

    const CONV: ConversationId = ConversationId(2);
    const ME: UserId = UserId(1);

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_769_500_000 + secs, 0).unwrap()
    }

    fn server(id: u64, sender: UserId, text: &str, secs: i64) -> Message {
        Message::server(id, CONV, sender, "someone", text, at(secs))
    }

    fn local(text: &str, secs: i64) -> Message {
        Message::local(CONV, ME, "Admin", text).with_created_at(at(secs))
    }

    fn open_store() -> MessageStore {
        let mut store = MessageStore::default();
        store.open(Some(CONV));
        store
    }

    #[test]
    fn live_event_shows_once() {
        let mut store = open_store();
        assert_eq!(
            store.reconcile_server(server(9, UserId(3), "hola", 0)),
            Reconciled::Inserted
        );
        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, MessageId::from(9));
    }

    #[test]
    fn server_echo_replaces_placeholder() {
        let mut store = open_store();
        let placeholder = local("hi", 0);
        let local_id = placeholder.id.clone();
        store.append_local(placeholder);

        let outcome = store.reconcile_server(server(55, ME, "hi", 2));
        assert_eq!(outcome, Reconciled::Replaced { local_id });

        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, MessageId::from(55));
        assert_eq!(snap[0].origin, Origin::Server);
    }

    #[test]
    fn echo_outside_window_is_appended() {
        let mut store = open_store();
        store.append_local(local("hi", 0));
        assert_eq!(
            store.reconcile_server(server(55, ME, "hi", 31)),
            Reconciled::Inserted
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn other_senders_text_never_matches() {
        let mut store = open_store();
        store.append_local(local("hi", 0));
        store.reconcile_server(server(55, UserId(4), "hi", 1));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn oldest_placeholder_is_superseded_first() {
        let mut store = open_store();
        let first = local("ok", 0);
        let second = local("ok", 1);
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        store.append_local(first);
        store.append_local(second);

        store.reconcile_server(server(10, ME, "ok", 2));
        assert!(store.get(&first_id).is_none());
        assert!(store.get(&second_id).is_some());

        store.reconcile_server(server(11, ME, "ok", 3));
        assert!(store.get(&second_id).is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn duplicate_delivery_is_idempotent() {
        let mut store = open_store();
        store.append_local(local("hi", 0));
        store.reconcile_server(server(55, ME, "hi", 1));
        assert_eq!(
            store.reconcile_server(server(55, ME, "hi", 1)),
            Reconciled::Duplicate
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duplicate_never_consumes_a_placeholder() {
        let mut store = open_store();
        store.reconcile_server(server(55, ME, "hi", 0));
        store.append_local(local("hi", 1));
        store.reconcile_server(server(55, ME, "hi", 0));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn load_keeps_live_entries() {
        let mut store = open_store();
        store.reconcile_server(server(5, UserId(3), "late", 10));
        assert!(store.load(CONV, vec![server(1, UserId(3), "a", 0), server(5, UserId(3), "late", 10)]));
        let ids: Vec<_> = store.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![MessageId::from(1), MessageId::from(5)]);
    }

    #[test]
    fn load_settles_pending_placeholders() {
        let mut store = open_store();
        store.append_local(local("hi", 0));
        store.load(CONV, vec![server(55, ME, "hi", 1)]);
        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, MessageId::from(55));
    }

    #[test]
    fn load_for_other_conversation_is_stale() {
        let mut store = open_store();
        assert!(!store.load(ConversationId(3), vec![server(1, UserId(3), "x", 0)]));
        assert!(store.is_empty());
    }

    #[test]
    fn events_for_closed_conversation_are_stale() {
        let mut store = open_store();
        let mut foreign = server(1, UserId(3), "x", 0);
        foreign.conversation_id = ConversationId(8);
        assert_eq!(store.reconcile_server(foreign), Reconciled::Stale);

        let mut placeholder = local("x", 0);
        placeholder.conversation_id = ConversationId(8);
        assert!(!store.append_local(placeholder));
        assert!(store.is_empty());
    }

    #[test]
    fn switching_discards_previous_entries() {
        let mut store = open_store();
        store.reconcile_server(server(1, UserId(3), "x", 0));
        store.open(Some(ConversationId(3)));
        assert!(store.is_empty());
        assert_eq!(store.conversation(), Some(ConversationId(3)));
    }

    #[test]
    fn confirm_local_replaces_named_placeholder() {
        let mut store = open_store();
        let a = local("same", 0);
        let b = local("same", 1);
        let b_id = b.id.clone();
        store.append_local(a.clone());
        store.append_local(b);

        let outcome = store.confirm_local(&b_id, server(20, ME, "same", 1));
        assert_eq!(outcome, Reconciled::Replaced { local_id: b_id });
        assert!(store.get(&a.id).is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn confirm_after_live_echo_rebinds_placeholders() {
        let mut store = open_store();
        let a = local("same", 0);
        let b = local("same", 1);
        let a_id = a.id.clone();
        let b_id = b.id.clone();
        store.append_local(a);
        store.append_local(b);

        // The echo of b's send first pairs with the older placeholder a.
        assert_eq!(
            store.reconcile_server(server(20, ME, "same", 1)),
            Reconciled::Replaced {
                local_id: a_id.clone()
            }
        );
        assert!(store.get(&b_id).is_some());

        // b's response claims 20, so a is pending again until its own echo.
        assert_eq!(
            store.confirm_local(&b_id, server(20, ME, "same", 1)),
            Reconciled::Duplicate
        );
        assert!(store.get(&b_id).is_none());
        assert!(store.get(&a_id).is_some());
        assert_eq!(store.pending(), 1);

        assert_eq!(
            store.reconcile_server(server(21, ME, "same", 2)),
            Reconciled::Replaced { local_id: a_id }
        );
        assert_eq!(store.pending(), 0);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn history_and_live_pair_placeholders_in_either_order() {
        let seed = || {
            let mut store = open_store();
            store.append_local(local("ok", 0));
            store.append_local(local("ok", 40));
            store
        };
        let history = vec![server(11, ME, "ok", 5)];
        let live = server(10, ME, "ok", 25);

        let mut load_first = seed();
        load_first.load(CONV, history.clone());
        load_first.reconcile_server(live.clone());

        let mut live_first = seed();
        live_first.reconcile_server(live);
        live_first.load(CONV, history);

        for store in [&load_first, &live_first] {
            let ids: Vec<_> = store.snapshot().into_iter().map(|m| m.id).collect();
            assert_eq!(ids, vec![MessageId::from(11), MessageId::from(10)]);
            assert_eq!(store.pending(), 0);
        }
    }

    #[test]
    fn later_entry_releases_placeholder_to_a_better_match() {
        let mut store = open_store();
        let early = local("ok", 0);
        let late = local("ok", 40);
        let early_id = early.id.clone();
        let late_id = late.id.clone();
        store.append_local(early);
        store.append_local(late);

        store.reconcile_server(server(10, ME, "ok", 25));
        assert!(store.get(&late_id).is_some());

        // 11 is older, so it takes the t0 placeholder and 10 moves to t40.
        assert_eq!(
            store.reconcile_server(server(11, ME, "ok", 5)),
            Reconciled::Replaced { local_id: early_id }
        );
        assert!(store.get(&late_id).is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn reconcile_is_a_function_of_the_sets() {
        let received = |seq, message| Received { seq, message };
        let placeholders = vec![received(1, local("ok", 0)), received(2, local("ok", 40))];
        let pending_id = placeholders[1].message.id.clone();
        let server_a = vec![
            received(3, server(11, ME, "ok", 5)),
            received(4, server(10, ME, "ok", 25)),
        ];
        let server_b: Vec<_> = server_a.iter().rev().cloned().collect();

        let bound = HashMap::new();
        let window = TimeDelta::seconds(30);
        let a = reconcile(&placeholders, &server_a, &bound, window);
        let b = reconcile(&placeholders, &server_b, &bound, window);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);

        // Pinning 10 to the t0 placeholder leaves 11 nothing inside its window.
        let bound = HashMap::from([(placeholders[0].message.id.clone(), MessageId::from(10))]);
        let pinned = reconcile(&placeholders, &server_a, &bound, window);
        assert_eq!(pinned.len(), 3);
        assert!(pinned.iter().any(|m| m.id == pending_id));
    }

    #[test]
    fn entry_received_before_a_placeholder_never_supersedes_it() {
        let mut store = open_store();
        store.reconcile_server(server(55, ME, "hi", 0));
        store.append_local(local("hi", 1));
        store.load(CONV, vec![server(55, ME, "hi", 0)]);
        assert_eq!(store.pending(), 1);
    }

    #[test]
    fn failed_placeholder_stays_visible() {
        let mut store = open_store();
        let placeholder = local("hi", 0);
        let id = placeholder.id.clone();
        store.append_local(placeholder);
        assert!(store.mark_failed(&id));
        assert_eq!(store.get(&id).unwrap().status, DeliveryStatus::Failed);
        assert_eq!(store.len(), 1);
        assert!(!store.mark_failed(&MessageId::from(999)));
    }

    #[test]
    fn snapshot_orders_by_time_then_id() {
        let mut store = open_store();
        store.reconcile_server(server(10, UserId(3), "b", 5));
        store.reconcile_server(server(9, UserId(3), "a", 5));
        store.reconcile_server(server(3, UserId(3), "c", 7));
        store.reconcile_server(server(12, UserId(3), "z", 1));
        let ids: Vec<_> = store.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(
            ids,
            vec![
                MessageId::from(12),
                MessageId::from(9),
                MessageId::from(10),
                MessageId::from(3)
            ]
        );
    }

    #[test]
    fn day_breaks_follow_the_timezone() {
        let base = DateTime::parse_from_rfc3339("2026-01-27T05:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let msgs = vec![
            server(1, UserId(3), "a", 0).with_created_at(base),
            server(2, UserId(3), "b", 0).with_created_at(base + TimeDelta::hours(1)),
            server(3, UserId(3), "c", 0).with_created_at(base + TimeDelta::hours(26)),
        ];
        assert_eq!(day_breaks(&msgs, &Utc), vec![0, 2]);

        // 05:30Z and 06:30Z straddle midnight at UTC-6.
        let mexico = FixedOffset::west_opt(6 * 3600).unwrap();
        assert_eq!(day_breaks(&msgs, &mexico), vec![0, 1, 2]);
        assert!(day_breaks(&[], &Utc).is_empty());
    }
}
