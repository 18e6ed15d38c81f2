//! REST collaborator: historical messages for a session.
//!
//! Fetched once on mount and merged below any optimistic entries; the live
//! channel takes over from there.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::signaling::event::SenderRole;

/// One persisted message as the history endpoint returns it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub id: String,
    /// Correlation id, when the sender supplied one.
    pub client_id: Option<String>,
    pub text: String,
    pub display_name: String,
    pub sender_type: SenderRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    messages: Option<Vec<HistoryMessage>>,
}

/// Fetch the persisted messages for a session, oldest first.
pub async fn fetch_history(
    http: &reqwest::Client,
    base_url: &str,
    session_id: &str,
) -> Result<Vec<HistoryMessage>> {
    let url = format!(
        "{}/api/sessions/{}/messages",
        base_url.trim_end_matches('/'),
        session_id
    );

    tracing::debug!("Fetching message history from {}", url);
    let resp = http
        .get(&url)
        .send()
        .await
        .context("History request failed")?;

    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("History fetch failed ({})", status);
    }

    let body: HistoryResponse = resp
        .json()
        .await
        .context("Failed to parse history response")?;

    Ok(body.messages.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_message_decodes_wire_shape() {
        let raw = r#"{
            "id": "m1",
            "clientId": "c1",
            "text": "Hello",
            "displayName": "Ana",
            "senderType": "visitor",
            "createdAt": "2026-03-01T12:00:00Z"
        }"#;
        let msg: HistoryMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.client_id.as_deref(), Some("c1"));
        assert_eq!(msg.sender_type, SenderRole::Visitor);
    }

    #[test]
    fn test_history_message_without_client_id() {
        let raw = r#"{
            "id": "m2",
            "text": "Hi",
            "displayName": "Bo",
            "senderType": "resident",
            "createdAt": "2026-03-01T12:01:00Z"
        }"#;
        let msg: HistoryMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.client_id.is_none());
    }
}
