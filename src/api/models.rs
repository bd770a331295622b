//! Request and response payloads exchanged with the assistant backend.
//! Ids are always carried as strings.

use serde::{Deserialize, Deserializer, Serialize};

// --- Auth ---
#[derive(Serialize)]
pub struct LoginPayload<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Deserialize)]
pub struct LoginResponse {
    #[serde(alias = "access_token", alias = "accessToken")]
    pub token: String,
}

// --- Directory ---
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// --- Conversations ---
#[derive(Serialize)]
pub struct CreateConversationPayload<'a> {
    pub agent_id: &'a str,
}

#[derive(Deserialize)]
pub struct ConversationCreated {
    #[serde(deserialize_with = "string_or_number", alias = "conversation_id")]
    pub id: String,
}

/// A conversation handle: created lazily per (organization, agent) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub organization_id: String,
    pub agent_id: String,
    pub conversation_id: String,
}

#[derive(Serialize)]
pub struct MessagePayload<'a> {
    pub content: &'a str,
    pub attachments: Vec<serde_json::Value>,
}

impl<'a> MessagePayload<'a> {
    pub fn text(content: &'a str) -> Self {
        Self {
            content,
            attachments: Vec::new(),
        }
    }
}

// --- Errors ---
#[derive(Deserialize, Default)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl ErrorBody {
    pub fn into_message(self) -> Option<String> {
        self.error.or(self.message).or(self.detail)
    }
}

/// The backend sends ids as strings or numbers; both become strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}
