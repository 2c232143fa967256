use chrono::{DateTime, Utc};
use itom_core::{Message, Role};

/// Append-only message list for the active conversation.
///
/// Only a whole-conversation clear removes entries.
#[derive(Debug, Default, Clone)]
pub struct History {
    messages: Vec<Message>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// True if a message with the same role and content was created within
    /// `window_ms` of `now`.
    pub fn has_recent(&self, role: Role, content: &str, now: DateTime<Utc>, window_ms: u64) -> bool {
        let window = i64::try_from(window_ms).unwrap_or(i64::MAX);
        self.messages.iter().rev().any(|m| {
            m.role == role
                && m.content == content
                && (now - m.created_at).num_milliseconds().abs() <= window
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn recent_duplicate_detected_within_window() {
        let mut history = History::new();
        history.push(Message::user("show servers"));
        let now = Utc::now();
        assert!(history.has_recent(Role::User, "show servers", now, 5_000));
        assert!(!history.has_recent(Role::Assistant, "show servers", now, 5_000));
        assert!(!history.has_recent(Role::User, "show routers", now, 5_000));
    }

    #[test]
    fn old_duplicate_is_not_recent() {
        let mut msg = Message::user("show servers");
        msg.created_at = Utc::now() - Duration::seconds(10);
        let history = History::from_messages(vec![msg]);
        assert!(!history.has_recent(Role::User, "show servers", Utc::now(), 5_000));
    }
}
