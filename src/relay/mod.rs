//! Relay between the foreground agent and the background service.
//!
//! Requests and results are plain sum types, so every action and every result
//! shape is matched exhaustively on both ends. On the wire they keep the
//! `{ action, ... }` / `{ success, data?, error? }` envelope shapes.

/// The channel itself and the background dispatch loop.
pub mod bus;
/// The background service that answers each request.
pub mod service;

pub use bus::{RelayBus, RelayStream};
pub use service::{BackgroundService, RemoteBackend};

use serde::{Deserialize, Serialize};

use crate::api::ApiError;
use crate::api::models::{Agent, Conversation, Organization};
use crate::store::{StoreError, StoreKey, StoredRecord};

/// One request sent across the relay.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayRequest {
    Authenticate {
        email: String,
        password: String,
    },
    ListOrganizations,
    ListAgents {
        organization_id: String,
    },
    CreateConversation {
        organization_id: String,
        agent_id: String,
    },
    StreamMessage {
        organization_id: String,
        conversation_id: String,
        text: String,
    },
    GetStoredData {
        keys: Vec<StoreKey>,
    },
    StoreData {
        record: StoredRecord,
    },
    ClearStoredData,
}

impl RelayRequest {
    /// Wire name of the action, also used in log lines.
    pub fn action(&self) -> &'static str {
        match self {
            RelayRequest::Authenticate { .. } => "authenticate",
            RelayRequest::ListOrganizations => "list-organizations",
            RelayRequest::ListAgents { .. } => "list-agents",
            RelayRequest::CreateConversation { .. } => "create-conversation",
            RelayRequest::StreamMessage { .. } => "stream-message",
            RelayRequest::GetStoredData { .. } => "get-stored-data",
            RelayRequest::StoreData { .. } => "store-data",
            RelayRequest::ClearStoredData => "clear-stored-data",
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, RelayRequest::StreamMessage { .. })
    }
}

// Credentials and message bodies stay out of logs.
impl std::fmt::Debug for RelayRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRequest")
            .field("action", &self.action())
            .finish_non_exhaustive()
    }
}

/// Payload of a successful result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum RelayData {
    Authenticated,
    Organizations(Vec<Organization>),
    Agents(Vec<Agent>),
    Conversation(Conversation),
    Streamed,
    StoredData(StoredRecord),
    Ack,
}

/// Errors produced on either side of the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A failure reported by the other side, carried as text.
    #[error("{0}")]
    Remote(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("background service is not running")]
    Disconnected,
    #[error("background handler for `{action}` panicked")]
    HandlerPanicked { action: &'static str },
    #[error("unexpected result for `{action}`")]
    UnexpectedData { action: &'static str },
}

/// The terminal result of one relay call.
///
/// Only [`RelayResult::ok`] and [`RelayResult::failure`] build one, so
/// `success == false` always comes with an error and no data, and vice versa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RelayResultWire", into = "RelayResultWire")]
pub struct RelayResult {
    outcome: Result<RelayData, String>,
}

impl RelayResult {
    pub fn ok(data: RelayData) -> Self {
        Self { outcome: Ok(data) }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            outcome: Err(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn data(&self) -> Option<&RelayData> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }

    pub fn into_result(self) -> Result<RelayData, RelayError> {
        self.outcome.map_err(RelayError::Remote)
    }
}

impl From<Result<RelayData, RelayError>> for RelayResult {
    fn from(outcome: Result<RelayData, RelayError>) -> Self {
        match outcome {
            Ok(data) => RelayResult::ok(data),
            Err(err) => RelayResult::failure(err.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RelayResultWire {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<RelayData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TryFrom<RelayResultWire> for RelayResult {
    type Error = String;

    fn try_from(wire: RelayResultWire) -> Result<Self, Self::Error> {
        match (wire.success, wire.data, wire.error) {
            (true, Some(data), None) => Ok(RelayResult::ok(data)),
            (false, None, Some(error)) => Ok(RelayResult::failure(error)),
            (success, _, _) => Err(format!(
                "inconsistent relay result (success = {success})"
            )),
        }
    }
}

impl From<RelayResult> for RelayResultWire {
    fn from(result: RelayResult) -> Self {
        match result.outcome {
            Ok(data) => RelayResultWire {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(error) => RelayResultWire {
                success: false,
                data: None,
                error: Some(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_carry_kebab_case_action_tags() {
        let request = RelayRequest::StreamMessage {
            organization_id: "42".into(),
            conversation_id: "c1".into(),
            text: "hello".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["action"], "stream-message");
        assert_eq!(json["organizationId"], "42");
        assert_eq!(json["action"], request.action());

        let json = serde_json::to_value(RelayRequest::ClearStoredData).unwrap();
        assert_eq!(json, serde_json::json!({"action": "clear-stored-data"}));
    }

    #[test]
    fn debug_output_hides_payload() {
        let request = RelayRequest::Authenticate {
            email: "me@example.com".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{request:?}");
        assert!(rendered.contains("authenticate"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn result_wire_shape_matches_invariant() {
        let ok = serde_json::to_value(RelayResult::ok(RelayData::Ack)).unwrap();
        assert_eq!(ok["success"], true);
        assert!(ok.get("error").is_none());
        assert!(ok.get("data").is_some());

        let failed = serde_json::to_value(RelayResult::failure("boom")).unwrap();
        assert_eq!(failed, serde_json::json!({"success": false, "error": "boom"}));

        let inconsistent = serde_json::from_value::<RelayResult>(
            serde_json::json!({"success": false, "data": {"kind": "ack"}}),
        );
        assert!(inconsistent.is_err());
    }

    #[test]
    fn errors_become_failures() {
        let result = RelayResult::from(Err(RelayError::Cancelled));
        assert!(!result.is_success());
        assert_eq!(result.error(), Some("request cancelled"));
        assert!(result.data().is_none());
        assert!(matches!(result.into_result(), Err(RelayError::Remote(message)) if message == "request cancelled"));
    }
}
