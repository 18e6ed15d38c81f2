//! Signaling wire protocol — JSON event envelope shared by both directions.
//!
//! Every event is scoped by `sessionId`. The server relays `webrtc.*` events
//! between the two participants verbatim and echoes `chat.message` back to
//! the whole session, including the sender.

use serde::{Deserialize, Serialize};

/// Role of a chat/call participant within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Visitor,
    Resident,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Visitor => "visitor",
            SenderRole::Resident => "resident",
        }
    }
}

/// In-band control actions carried by `session.control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Mute,
    Unmute,
    End,
    CallRejected,
}

/// A signaling-channel event, serialized as `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalEvent {
    /// Join the signaling room for a session.
    #[serde(rename = "session.join", rename_all = "camelCase")]
    Join {
        session_id: String,
        display_name: String,
    },

    /// Join confirmation from the server.
    #[serde(rename = "session.joined")]
    Joined { sid: String },

    #[serde(rename = "session.participant_joined", rename_all = "camelCase")]
    ParticipantJoined {
        session_id: String,
        display_name: String,
    },

    #[serde(rename = "session.participant_left", rename_all = "camelCase")]
    ParticipantLeft {
        session_id: String,
        display_name: String,
    },

    /// SDP offer. `retry_attempt` counts fixed-interval resends of the same
    /// offer; it is absent on the first send.
    #[serde(rename = "webrtc.offer", rename_all = "camelCase")]
    Offer {
        session_id: String,
        sdp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_attempt: Option<u32>,
    },

    #[serde(rename = "webrtc.answer", rename_all = "camelCase")]
    Answer { session_id: String, sdp: String },

    #[serde(rename = "webrtc.ice", rename_all = "camelCase")]
    Ice {
        session_id: String,
        candidate: String,
    },

    /// Chat text with a client-generated correlation id. The broadcast echo
    /// carries the same shape back to every participant.
    #[serde(rename = "chat.message", rename_all = "camelCase")]
    ChatMessage {
        session_id: String,
        text: String,
        display_name: String,
        sender_type: SenderRole,
        client_id: String,
    },

    /// Server persisted a message; `id` is the server-assigned id.
    #[serde(rename = "chat.persisted", rename_all = "camelCase")]
    ChatPersisted {
        session_id: String,
        id: String,
        client_id: String,
    },

    #[serde(rename = "chat.persist_failed", rename_all = "camelCase")]
    ChatPersistFailed {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        client_id: String,
        error: String,
    },

    #[serde(rename = "session.control", rename_all = "camelCase")]
    Control {
        session_id: String,
        action: ControlAction,
    },
}

impl SignalEvent {
    /// The session this event is scoped to. `session.joined` confirmations
    /// carry the id under `sid`.
    pub fn session_id(&self) -> &str {
        match self {
            SignalEvent::Join { session_id, .. }
            | SignalEvent::ParticipantJoined { session_id, .. }
            | SignalEvent::ParticipantLeft { session_id, .. }
            | SignalEvent::Offer { session_id, .. }
            | SignalEvent::Answer { session_id, .. }
            | SignalEvent::Ice { session_id, .. }
            | SignalEvent::ChatMessage { session_id, .. }
            | SignalEvent::ChatPersisted { session_id, .. }
            | SignalEvent::ChatPersistFailed { session_id, .. }
            | SignalEvent::Control { session_id, .. } => session_id,
            SignalEvent::Joined { sid } => sid,
        }
    }
}
