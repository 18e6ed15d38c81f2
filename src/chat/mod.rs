//! Chat over the signaling channel.
//!
//! Sends are optimistic: the message appears locally before the server
//! confirms anything, correlated by a client-generated id. The broadcast
//! echo reconciles the optimistic entry in place; `chat.persisted` /
//! `chat.persist_failed` notices settle its fate. Display order is always
//! creation/arrival order, never persistence-completion order.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::api::HistoryMessage;
use crate::signaling::event::{SenderRole, SignalEvent};

/// Echoes without a correlation id are considered duplicates of an existing
/// entry when sender role and trimmed text match within this window.
pub const DEDUPE_WINDOW_MS: i64 = 5_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Server-assigned id, set once persisted.
    pub id: Option<String>,
    /// Client-generated correlation id.
    pub client_id: String,
    pub text: String,
    pub sender: SenderRole,
    pub display_name: String,
    pub timestamp: DateTime<Utc>,
    pub persisted: bool,
    /// Human-readable persist error; the message can be resubmitted.
    pub failed: Option<String>,
}

pub struct MessageChannel {
    session_id: String,
    display_name: String,
    role: SenderRole,
    messages: Vec<ChatMessage>,
}

impl MessageChannel {
    pub fn new(session_id: &str, display_name: &str, role: SenderRole) -> Self {
        Self {
            session_id: session_id.to_string(),
            display_name: display_name.to_string(),
            role,
            messages: Vec::new(),
        }
    }

    /// Messages in display order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Optimistically append a local message and produce the wire event.
    pub fn send(&mut self, text: &str) -> SignalEvent {
        let client_id = Uuid::new_v4().to_string();
        self.messages.push(ChatMessage {
            id: None,
            client_id: client_id.clone(),
            text: text.to_string(),
            sender: self.role,
            display_name: self.display_name.clone(),
            timestamp: Utc::now(),
            persisted: false,
            failed: None,
        });
        SignalEvent::ChatMessage {
            session_id: self.session_id.clone(),
            text: text.to_string(),
            display_name: self.display_name.clone(),
            sender_type: self.role,
            client_id,
        }
    }

    /// Reconcile a broadcast echo. An echo carrying a known correlation id
    /// updates the optimistic entry in place and never duplicates it. An
    /// echo without one falls back to a best-effort heuristic: same sender
    /// role + same trimmed text + timestamps within [`DEDUPE_WINDOW_MS`].
    /// The heuristic can misjudge rapid repeated identical texts; sends
    /// from this client always carry a correlation id, so it only applies
    /// to cross-device echoes of the same user.
    pub fn on_echo(
        &mut self,
        text: &str,
        display_name: &str,
        sender: SenderRole,
        client_id: Option<&str>,
    ) {
        if let Some(cid) = client_id.filter(|c| !c.is_empty()) {
            if self.messages.iter().any(|m| m.client_id == cid) {
                tracing::debug!("Echo reconciled in place (clientId {})", cid);
                return;
            }
            self.messages.push(ChatMessage {
                id: None,
                client_id: cid.to_string(),
                text: text.to_string(),
                sender,
                display_name: display_name.to_string(),
                timestamp: Utc::now(),
                persisted: false,
                failed: None,
            });
            return;
        }

        let now = Utc::now();
        let trimmed = text.trim();
        let duplicate = self.messages.iter().any(|m| {
            m.sender == sender
                && m.text.trim() == trimmed
                && (now - m.timestamp).num_milliseconds().abs() <= DEDUPE_WINDOW_MS
        });
        if duplicate {
            tracing::debug!("Echo without clientId deduped by role/text/window");
            return;
        }

        self.messages.push(ChatMessage {
            id: None,
            client_id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            sender,
            display_name: display_name.to_string(),
            timestamp: now,
            persisted: false,
            failed: None,
        });
    }

    /// Server persisted the message: record its id and flip the flag.
    pub fn on_persisted(&mut self, id: &str, client_id: &str) {
        if let Some(msg) = self.messages.iter_mut().find(|m| m.client_id == client_id) {
            msg.id = Some(id.to_string());
            msg.persisted = true;
            msg.failed = None;
        }
    }

    /// Persistence failed: mark the entry so the UI can offer a retry.
    pub fn on_persist_failed(&mut self, id: Option<&str>, client_id: &str, error: &str) {
        if let Some(msg) = self.messages.iter_mut().find(|m| m.client_id == client_id) {
            if let Some(id) = id {
                msg.id = Some(id.to_string());
            }
            msg.persisted = false;
            msg.failed = Some(error.to_string());
        }
    }

    /// Resubmit a failed message: a new send attempt under the same visible
    /// slot (same correlation id). Returns the wire event, or `None` if the
    /// message is unknown or not failed.
    pub fn resubmit(&mut self, client_id: &str) -> Option<SignalEvent> {
        let msg = self
            .messages
            .iter_mut()
            .find(|m| m.client_id == client_id && m.failed.is_some())?;
        msg.failed = None;
        msg.timestamp = Utc::now();
        Some(SignalEvent::ChatMessage {
            session_id: self.session_id.clone(),
            text: msg.text.clone(),
            display_name: msg.display_name.clone(),
            sender_type: msg.sender,
            client_id: msg.client_id.clone(),
        })
    }

    /// Merge server history fetched on mount below the optimistic entries.
    /// Entries already present (by server id or correlation id) are skipped.
    pub fn merge_history(&mut self, history: Vec<HistoryMessage>) {
        let mut merged: Vec<ChatMessage> = Vec::with_capacity(history.len() + self.messages.len());
        for item in history {
            let already = self.messages.iter().any(|m| {
                m.id.as_deref() == Some(item.id.as_str())
                    || item.client_id.as_deref() == Some(m.client_id.as_str())
            });
            if already {
                continue;
            }
            let client_id = item
                .client_id
                .clone()
                .unwrap_or_else(|| item.id.clone());
            merged.push(ChatMessage {
                id: Some(item.id),
                client_id,
                text: item.text,
                sender: item.sender_type,
                display_name: item.display_name,
                timestamp: item.created_at,
                persisted: true,
                failed: None,
            });
        }
        merged.append(&mut self.messages);
        self.messages = merged;
    }

    #[cfg(test)]
    fn backdate(&mut self, index: usize, seconds: i64) {
        self.messages[index].timestamp =
            self.messages[index].timestamp - chrono::Duration::seconds(seconds);
    }
}
