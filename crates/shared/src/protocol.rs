use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, MessageId, MessageKind, UserId};

/// Success codes the backend hands out. Each call site declares the subset
/// it accepts; there is no single global success constant.
pub mod codes {
    pub const OK: &str = "OK";
    pub const CREATED: &str = "CREATED";
    pub const SUCCESS: &str = "SUCCESS";
}

/// Uniform response body for every REST call and broker push:
/// `{ code, message, data }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>"))]
pub struct Envelope<T> {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn success(code: &str, data: T) -> Self {
        Self {
            code: code.to_string(),
            message: String::new(),
            data: Some(data),
        }
    }

    pub fn is_success(&self, success_codes: &[&str]) -> bool {
        success_codes.iter().any(|code| self.code == *code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Client-generated correlation key, stable across the
    /// optimistic-to-confirmed transition. History rows predating the
    /// current process carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<ChatMessage>,
    pub next_cursor: Option<i64>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub chat_id: ChatId,
    pub content: String,
    pub kind: MessageKind,
    pub client_message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// One logical broker channel per chat room.
pub fn chat_destination(chat_id: ChatId) -> String {
    format!("/topic/chats/{}", chat_id.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        destination: String,
        subscription_id: u64,
    },
    Unsubscribe {
        subscription_id: u64,
    },
    Publish {
        destination: String,
        body: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        destination: String,
        envelope: Envelope<ChatMessage>,
    },
    Receipt {
        subscription_id: u64,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_use_tagged_wire_format() {
        let frame = ClientFrame::Subscribe {
            destination: chat_destination(ChatId(7)),
            subscription_id: 3,
        };
        let encoded = serde_json::to_value(&frame).expect("encode");
        assert_eq!(encoded["type"], "subscribe");
        assert_eq!(encoded["payload"]["destination"], "/topic/chats/7");
    }

    #[test]
    fn envelope_data_defaults_to_none() {
        let raw = r#"{"code":"SUCCESS","message":"marked"}"#;
        let envelope: Envelope<ChatMessage> = serde_json::from_str(raw).expect("decode");
        assert!(envelope.is_success(&[codes::OK, codes::SUCCESS]));
        assert!(envelope.data.is_none());
    }

    #[test]
    fn message_without_correlation_key_decodes() {
        let raw = r#"{
            "message_id": 41,
            "chat_id": 7,
            "sender_id": 2,
            "kind": "text",
            "content": "hello",
            "created_at": "2026-01-05T09:30:00Z"
        }"#;
        let message: ChatMessage = serde_json::from_str(raw).expect("decode");
        assert_eq!(message.message_id, MessageId(41));
        assert!(message.client_message_id.is_none());
    }
}
