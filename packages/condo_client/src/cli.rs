use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, TimeZone};
use serde_json::json;
use std::collections::HashSet;

use condo_client::Engine;
use condo_client::config::CondoConfig;
use condo_sync::{
    ChannelState, ChatApi, ConversationId, LoadOutcome, Message, MessageId, NotificationApi,
    Notification, NotificationId, NotificationPayload, NotificationStore, UserId, day_breaks,
};

// =============================================================================
// Formatting
// =============================================================================

fn day_divider<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("──── {} ────", at.format("%A, %d %B %Y"))
}

fn format_message<Tz: TimeZone>(message: &Message, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let at = message.created_at.with_timezone(tz);
    let marker = match message.status {
        condo_sync::DeliveryStatus::Pending => " (sending)",
        condo_sync::DeliveryStatus::Failed => " (failed)",
        condo_sync::DeliveryStatus::Confirmed => "",
    };
    format!(
        "[{}] {}: {}{}",
        at.format("%H:%M"),
        message.sender_name,
        message.text,
        marker
    )
}

/// Render messages with a divider wherever the calendar day changes.
fn render_messages<Tz: TimeZone>(messages: &[Message], tz: &Tz) -> Vec<String>
where
    Tz::Offset: std::fmt::Display,
{
    let breaks: HashSet<usize> = day_breaks(messages, tz).into_iter().collect();
    let mut lines = Vec::with_capacity(messages.len() + breaks.len());
    for (i, message) in messages.iter().enumerate() {
        if breaks.contains(&i) {
            lines.push(day_divider(&message.created_at.with_timezone(tz)));
        }
        lines.push(format_message(message, tz));
    }
    lines
}

fn payload_detail(payload: &NotificationPayload) -> Option<String> {
    match payload {
        NotificationPayload::Fine {
            amount: Some(amount),
            currency,
        }
        | NotificationPayload::OverduePayment {
            amount: Some(amount),
            currency,
        } => Some(format!("${amount:.2} {currency}")),
        NotificationPayload::Assembly {
            date: Some(date),
            time,
        } => Some(match time {
            Some(time) => format!("{date} {time}"),
            None => date.clone(),
        }),
        NotificationPayload::Message {
            department_id: Some(department),
        } => Some(format!("department {}", department.0)),
        _ => None,
    }
}

fn format_notification(notification: &Notification) -> String {
    let marker = if notification.read { ' ' } else { '*' };
    let mut line = format!(
        "{marker} {:<8} [{}] {}",
        notification.id.as_str(),
        notification.kind.label(),
        notification.title
    );
    if !notification.body.is_empty() {
        line.push_str(": ");
        line.push_str(&notification.body);
    }
    if let Some(detail) = payload_detail(&notification.payload) {
        line.push_str(&format!(" ({detail})"));
    }
    line
}

fn badge_line(store: &NotificationStore) -> String {
    match store.badge() {
        Some(badge) => format!("{badge} unread"),
        None => "no unread notifications".to_string(),
    }
}

fn report_load(what: &str, outcome: &LoadOutcome) {
    if let LoadOutcome::Degraded(e) = outcome {
        eprintln!("[condo: could not load {what}: {e}]");
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Follow the notification feed (and optionally a department chat) until Ctrl-C.
pub async fn watch_command(
    config: &CondoConfig,
    user: Option<u64>,
    department: Option<u64>,
) -> Result<()> {
    let engine = Engine::new(config)?;
    let user = UserId(user.unwrap_or(config.file.user.id));
    let tz = Local;

    let outcome = engine.feed.start(user).await;
    report_load("notifications", &outcome);
    let mut seen_notifications: HashSet<NotificationId> = HashSet::new();
    for notification in engine.feed.snapshot().iter().rev() {
        seen_notifications.insert(notification.id.clone());
        println!("{}", format_notification(notification));
    }
    if let Some(badge) = engine.feed.badge() {
        println!("[{badge} unread]");
    }

    let mut seen_messages: HashSet<MessageId> = HashSet::new();
    if let Some(department) = department {
        let outcome = engine
            .controller
            .select_conversation(Some(ConversationId(department)))
            .await;
        report_load("chat history", &outcome);
        let snapshot = engine.controller.snapshot();
        for line in render_messages(&snapshot, &tz) {
            println!("{line}");
        }
        seen_messages.extend(snapshot.into_iter().map(|m| m.id));
    }

    let mut feed_revision = engine.feed.watch_revision();
    let mut chat_revision = engine.controller.watch_revision();
    let mut feed_state = engine.feed.watch_connectivity();
    let mut chat_state = engine.controller.watch_connectivity();
    let mut last_day = engine
        .controller
        .snapshot()
        .last()
        .map(|m| m.created_at.with_timezone(&tz).date_naive());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            Ok(()) = feed_revision.changed() => {
                let fresh: Vec<Notification> = engine
                    .feed
                    .snapshot()
                    .into_iter()
                    .filter(|n| !seen_notifications.contains(&n.id))
                    .collect();
                for notification in fresh.iter().rev() {
                    seen_notifications.insert(notification.id.clone());
                    println!("{}", format_notification(notification));
                }
            }

            Ok(()) = chat_revision.changed() => {
                for message in engine.controller.snapshot() {
                    if message.is_local() || seen_messages.contains(&message.id) {
                        continue;
                    }
                    let day = message.created_at.with_timezone(&tz).date_naive();
                    if last_day != Some(day) {
                        println!("{}", day_divider(&message.created_at.with_timezone(&tz)));
                        last_day = Some(day);
                    }
                    println!("{}", format_message(&message, &tz));
                    seen_messages.insert(message.id);
                }
            }

            Ok(()) = feed_state.changed() => {
                let state = *feed_state.borrow_and_update();
                if state == ChannelState::Error {
                    eprintln!("[condo: notifications offline]");
                }
            }

            Ok(()) = chat_state.changed() => {
                let state = *chat_state.borrow_and_update();
                if state == ChannelState::Error {
                    eprintln!("[condo: chat offline]");
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// Send one message to a department and print the confirmed entry.
pub async fn send_command(config: &CondoConfig, department: u64, text: &str) -> Result<()> {
    let engine = Engine::new(config)?;
    let outcome = engine
        .controller
        .select_conversation(Some(ConversationId(department)))
        .await;
    report_load("chat history", &outcome);

    let result = engine.controller.send(text).await;
    engine.shutdown().await;

    let message = result.with_context(|| format!("Failed to send to department {department}"))?;
    println!("{}", format_message(&message, &Local));
    Ok(())
}

/// One-shot listing of a user's notifications.
pub async fn notifications_command(config: &CondoConfig, user: Option<u64>, json: bool) -> Result<()> {
    let user = UserId(user.unwrap_or(config.file.user.id));
    let engine = Engine::new(config)?;
    let page = engine
        .backend
        .fetch_notifications(user)
        .await
        .context("Failed to fetch notifications")?;

    let mut store = NotificationStore::new();
    store.load(page.notifications);

    if json {
        let out = json!({
            "user_id": user.0,
            "unread_count": store.unread_count(),
            "notifications": store.snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if store.is_empty() {
        println!("No notifications.");
    } else {
        for notification in store.snapshot() {
            println!("{}", format_notification(&notification));
        }
        println!("\n{}", badge_line(&store));
    }
    Ok(())
}

/// Mark one notification, or all of a user's, as read.
pub async fn mark_read_command(
    config: &CondoConfig,
    user: Option<u64>,
    id: Option<String>,
    all: bool,
) -> Result<()> {
    let engine = Engine::new(config)?;
    match (id, all) {
        (_, true) => {
            let user = UserId(user.unwrap_or(config.file.user.id));
            engine
                .backend
                .mark_all_notifications_read(user)
                .await
                .context("Failed to mark notifications read")?;
            println!("All notifications marked read.");
        }
        (Some(id), false) => {
            let id = NotificationId::new(id);
            engine
                .backend
                .mark_notification_read(&id)
                .await
                .with_context(|| format!("Failed to mark notification {id} read"))?;
            println!("Notification {id} marked read.");
        }
        (None, false) => bail!("Pass a notification id or --all"),
    }
    Ok(())
}

/// Print a department's history without subscribing.
pub async fn history_command(config: &CondoConfig, department: u64) -> Result<()> {
    let engine = Engine::new(config)?;
    let messages = engine
        .backend
        .fetch_history(ConversationId(department))
        .await
        .context("Failed to fetch chat history")?;
    if messages.is_empty() {
        println!("No messages.");
        return Ok(());
    }
    let mut store = condo_sync::MessageStore::new(config.sync().reconciliation_window);
    let conversation = ConversationId(department);
    store.open(Some(conversation));
    store.load(conversation, messages);
    for line in render_messages(&store.snapshot(), &Local) {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use condo_sync::{NotificationKind, wire};

    fn at(raw: &str) -> DateTime<Utc> {
        wire::parse_timestamp(raw).unwrap()
    }

    #[test]
    fn dividers_only_where_the_day_changes() {
        let conv = ConversationId(2);
        let messages = vec![
            Message::server(1, conv, UserId(1), "Ana", "hola", at("2026-01-27T09:00:00")),
            Message::server(2, conv, UserId(2), "Luis", "buenas", at("2026-01-27T18:30:00")),
            Message::server(3, conv, UserId(1), "Ana", "¿y hoy?", at("2026-01-28T08:00:00")),
        ];
        let lines = render_messages(&messages, &Utc);
        assert_eq!(
            lines,
            vec![
                "──── Tuesday, 27 January 2026 ────",
                "[09:00] Ana: hola",
                "[18:30] Luis: buenas",
                "──── Wednesday, 28 January 2026 ────",
                "[08:00] Ana: ¿y hoy?",
            ]
        );
    }

    #[test]
    fn pending_and_failed_sends_are_marked() {
        let conv = ConversationId(2);
        let pending = Message::local(conv, UserId(1), "Ana", "hola")
            .with_created_at(at("2026-01-27T09:00:00"));
        assert_eq!(format_message(&pending, &Utc), "[09:00] Ana: hola (sending)");
    }

    #[test]
    fn notification_lines_show_type_and_detail() {
        let fine = Notification {
            id: NotificationId::from(12),
            kind: NotificationKind::Fine,
            title: "Multa".into(),
            body: "Ruido excesivo".into(),
            payload: NotificationPayload::Fine {
                amount: Some(500.0),
                currency: "MXN".into(),
            },
            read: false,
            created_at: at("2026-01-27T09:00:00"),
        };
        assert_eq!(
            format_notification(&fine),
            "* 12       [Multa] Multa: Ruido excesivo ($500.00 MXN)"
        );

        let assembly = Notification {
            kind: NotificationKind::Assembly,
            title: "Asamblea General".into(),
            body: String::new(),
            payload: NotificationPayload::Assembly {
                date: Some("2026-02-15".into()),
                time: None,
            },
            read: true,
            ..fine
        };
        assert_eq!(
            format_notification(&assembly),
            "  12       [Asamblea] Asamblea General (2026-02-15)"
        );
    }

    #[test]
    fn badge_line_caps_at_nine() {
        let mut store = NotificationStore::new();
        assert_eq!(badge_line(&store), "no unread notifications");
        let base = Notification {
            id: NotificationId::from(0),
            kind: NotificationKind::Message,
            title: "Nuevo mensaje".into(),
            body: String::new(),
            payload: NotificationPayload::Message { department_id: None },
            read: false,
            created_at: Utc::now(),
        };
        for id in 1..=12u64 {
            store.push_live(Notification {
                id: NotificationId::from(id),
                ..base.clone()
            });
        }
        assert_eq!(badge_line(&store), "9+ unread");
    }
}
