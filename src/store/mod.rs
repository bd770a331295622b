//! Durable key-value storage shared by the background service and the foreground agent.
//!
//! The store is the single source of truth for the bearer token and the last known
//! widget state. Neither side keeps a long-lived copy: every consumer re-reads the
//! keys it needs right before acting on them.

/// One JSON file that survives restarts.
pub mod file;
/// In-memory only; for tests and throwaway runs.
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors raised by a [`DurableStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize store contents: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// On-screen origin of the chat widget, in terminal cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: u16,
    pub y: u16,
}

impl Position {
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}

/// The keys the store understands. Each one is independently readable and writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreKey {
    Token,
    SelectedOrg,
    SelectedAgent,
    IsVisible,
    IsMinimized,
    ChatbotPosition,
}

impl StoreKey {
    pub const ALL: [StoreKey; 6] = [
        StoreKey::Token,
        StoreKey::SelectedOrg,
        StoreKey::SelectedAgent,
        StoreKey::IsVisible,
        StoreKey::IsMinimized,
        StoreKey::ChatbotPosition,
    ];

    /// Widget-related keys, i.e. everything except the credentials.
    pub const WIDGET: [StoreKey; 5] = [
        StoreKey::SelectedOrg,
        StoreKey::SelectedAgent,
        StoreKey::IsVisible,
        StoreKey::IsMinimized,
        StoreKey::ChatbotPosition,
    ];

    /// Name of the key as it appears in the persisted JSON object.
    pub fn name(self) -> &'static str {
        match self {
            StoreKey::Token => "token",
            StoreKey::SelectedOrg => "selectedOrg",
            StoreKey::SelectedAgent => "selectedAgent",
            StoreKey::IsVisible => "isVisible",
            StoreKey::IsMinimized => "isMinimized",
            StoreKey::ChatbotPosition => "chatbotPosition",
        }
    }
}

/// A partial view of the store. Absent fields are either unset in the store or
/// were not requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_minimized: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chatbot_position: Option<Position>,
}

impl StoredRecord {
    pub fn is_empty(&self) -> bool {
        self == &StoredRecord::default()
    }

    /// Overwrites every field that is present in `update`; absent fields are left alone.
    pub fn merge(&mut self, update: StoredRecord) {
        if update.token.is_some() {
            self.token = update.token;
        }
        if update.selected_org.is_some() {
            self.selected_org = update.selected_org;
        }
        if update.selected_agent.is_some() {
            self.selected_agent = update.selected_agent;
        }
        if update.is_visible.is_some() {
            self.is_visible = update.is_visible;
        }
        if update.is_minimized.is_some() {
            self.is_minimized = update.is_minimized;
        }
        if update.chatbot_position.is_some() {
            self.chatbot_position = update.chatbot_position;
        }
    }

    /// Returns a copy holding only the requested keys.
    pub fn project(&self, keys: &[StoreKey]) -> StoredRecord {
        let mut out = StoredRecord::default();
        for key in keys {
            match key {
                StoreKey::Token => out.token = self.token.clone(),
                StoreKey::SelectedOrg => out.selected_org = self.selected_org.clone(),
                StoreKey::SelectedAgent => out.selected_agent = self.selected_agent.clone(),
                StoreKey::IsVisible => out.is_visible = self.is_visible,
                StoreKey::IsMinimized => out.is_minimized = self.is_minimized,
                StoreKey::ChatbotPosition => out.chatbot_position = self.chatbot_position,
            }
        }
        out
    }

    /// Unsets the given keys.
    pub fn remove(&mut self, keys: &[StoreKey]) {
        for key in keys {
            match key {
                StoreKey::Token => self.token = None,
                StoreKey::SelectedOrg => self.selected_org = None,
                StoreKey::SelectedAgent => self.selected_agent = None,
                StoreKey::IsVisible => self.is_visible = None,
                StoreKey::IsMinimized => self.is_minimized = None,
                StoreKey::ChatbotPosition => self.chatbot_position = None,
            }
        }
    }
}

/// Asynchronous key-value store that survives across sessions.
///
/// Implementations must tolerate concurrent callers from both the background
/// service and the foreground agent. Conflicting writes resolve last-writer-wins.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Reads the requested keys. Missing keys come back as `None`.
    async fn get(&self, keys: &[StoreKey]) -> Result<StoredRecord, StoreError>;

    /// Writes every field present in `record`.
    async fn set(&self, record: StoredRecord) -> Result<(), StoreError>;

    /// Unsets the given keys.
    async fn remove(&self, keys: &[StoreKey]) -> Result<(), StoreError>;

    /// Removes everything.
    async fn clear(&self) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn DurableStore>;

/// Read-through view of the bearer token.
///
/// Obtained fresh from the store for every remote call so a login performed on
/// the other side of the relay is picked up immediately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
}

impl Credentials {
    pub async fn load(store: &dyn DurableStore) -> Result<Self, StoreError> {
        let record = store.get(&[StoreKey::Token]).await?;
        Ok(Self {
            token: record.token.filter(|token| !token.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_uses_persisted_key_names() {
        let record = StoredRecord {
            token: Some("t".into()),
            selected_org: Some("42".into()),
            is_visible: Some(true),
            chatbot_position: Some(Position::new(3, 4)),
            ..StoredRecord::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["token"], "t");
        assert_eq!(json["selectedOrg"], "42");
        assert_eq!(json["isVisible"], true);
        assert_eq!(json["chatbotPosition"]["x"], 3);
        assert!(json.get("selectedAgent").is_none());
        for key in StoreKey::ALL {
            assert_eq!(serde_json::to_value(key).unwrap(), key.name());
        }
    }

    #[test]
    fn merge_only_touches_present_fields() {
        let mut record = StoredRecord {
            selected_org: Some("1".into()),
            selected_agent: Some("2".into()),
            ..StoredRecord::default()
        };
        record.merge(StoredRecord {
            selected_agent: Some("3".into()),
            is_minimized: Some(true),
            ..StoredRecord::default()
        });
        assert_eq!(record.selected_org.as_deref(), Some("1"));
        assert_eq!(record.selected_agent.as_deref(), Some("3"));
        assert_eq!(record.is_minimized, Some(true));
    }

    #[test]
    fn project_and_remove() {
        let mut record = StoredRecord {
            token: Some("secret".into()),
            selected_org: Some("1".into()),
            is_visible: Some(false),
            ..StoredRecord::default()
        };
        let projected = record.project(&[StoreKey::SelectedOrg, StoreKey::IsVisible]);
        assert_eq!(projected.token, None);
        assert_eq!(projected.selected_org.as_deref(), Some("1"));
        assert_eq!(projected.is_visible, Some(false));

        record.remove(&[StoreKey::Token]);
        assert_eq!(record.token, None);
        assert_eq!(record.selected_org.as_deref(), Some("1"));
    }
}
