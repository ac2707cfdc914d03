use crate::aggregate::StreamAggregate;
use crate::types::now_millis;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_data: Option<StreamAggregate>,
}

impl ChatMessage {
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Self::new_id(),
            role: Role::User,
            content: content.into(),
            timestamp: now_millis(),
            is_streaming: false,
            stream_data: None,
        }
    }

    pub fn assistant(
        id: impl Into<String>,
        content: impl Into<String>,
        stream_data: Option<StreamAggregate>,
    ) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: content.into(),
            timestamp: now_millis(),
            is_streaming: false,
            stream_data,
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            role: self.role.as_str().to_string(),
            content: self.content.clone(),
        }
    }
}

/// A date as the browser sends it: an ISO-ish string or epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DateInput {
    Millis(i64),
    Text(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    #[serde(default)]
    pub stock_ticker: Option<String>,
    #[serde(default)]
    pub form_types: Option<String>,
    #[serde(default)]
    pub start_date: Option<DateInput>,
    #[serde(default)]
    pub end_date: Option<DateInput>,
    #[serde(default)]
    pub deep_analysis: Option<bool>,
}

impl ChatSettings {
    pub fn ticker(&self) -> Option<&str> {
        self.stock_ticker
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub settings: Option<ChatSettings>,
}

impl ChatRequest {
    pub fn new(messages: &[ChatMessage], settings: &ChatSettings) -> Self {
        Self {
            messages: messages.iter().map(ChatMessage::to_wire).collect(),
            settings: Some(settings.clone()),
        }
    }

    /// Content of the most recent user message, untrimmed.
    pub fn latest_user_query(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User.as_str())
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub settings: ChatSettings,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_accept_browser_shapes() {
        let settings: ChatSettings = serde_json::from_value(serde_json::json!({
            "stockTicker": " AAPL ",
            "formTypes": "",
            "startDate": "2023-01-01T05:00:00.000Z",
            "endDate": null,
            "temperature": 0.7
        }))
        .unwrap();
        assert_eq!(settings.ticker(), Some("AAPL"));
        assert_eq!(settings.end_date, None);
        assert!(matches!(settings.start_date, Some(DateInput::Text(_))));
    }

    #[test]
    fn latest_user_query_skips_assistant_turns() {
        let request: ChatRequest = serde_json::from_value(serde_json::json!({
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "answer"},
                {"role": "user", "content": "  second  "},
                {"role": "assistant", "content": "pending"}
            ]
        }))
        .unwrap();
        assert_eq!(request.latest_user_query(), "  second  ");
        assert_eq!(ChatRequest::default().latest_user_query(), "");
    }

    #[test]
    fn streaming_flag_is_omitted_once_settled() {
        let msg = ChatMessage::assistant("m1", "done", None);
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("isStreaming").is_none());
        assert!(json.get("streamData").is_none());
        assert_eq!(json["role"], "assistant");
    }
}
