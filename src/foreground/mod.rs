//! The foreground agent: the chat widget plus the conversations it shows.
//!
//! It never touches the network. Directory lookups and message streams go
//! through the relay bus; widget state goes straight to the durable store.

pub mod conversation;
pub mod widget;

pub use conversation::{
    ConversationKey, ConversationManager, ConversationPhase, EntryStatus, PendingSend, Role,
    SendMessage, SendOutcome, Transcript, TranscriptEntry,
};
pub use widget::{Widget, WidgetPhase, WidgetState};

use log::{info, warn};

use crate::api::models::{Agent, Organization};
use crate::relay::{RelayBus, RelayData, RelayError, RelayRequest};
use crate::store::{SharedStore, StoreError};

/// Errors surfaced to the host while driving the foreground agent.
#[derive(Debug, thiserror::Error)]
pub enum ForegroundError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Owns the widget state machine and the conversation manager for one surface.
pub struct ForegroundAgent {
    bus: RelayBus,
    widget: Widget,
    conversations: ConversationManager,
    organizations: Vec<Organization>,
    agents: Vec<Agent>,
}

impl ForegroundAgent {
    /// Restores the persisted widget state. A widget that was open with a full
    /// selection comes back open without any user action.
    pub async fn start(bus: RelayBus, store: SharedStore) -> Result<Self, ForegroundError> {
        let widget = Widget::restore(store).await?;
        Ok(Self {
            conversations: ConversationManager::new(bus.clone()),
            bus,
            widget,
            organizations: Vec::new(),
            agents: Vec::new(),
        })
    }

    pub fn widget(&self) -> &Widget {
        &self.widget
    }

    pub fn widget_mut(&mut self) -> &mut Widget {
        &mut self.widget
    }

    pub fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    pub fn organizations(&self) -> &[Organization] {
        &self.organizations
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// The conversation the widget currently shows, if a full selection exists.
    pub fn active_key(&self) -> Option<ConversationKey> {
        self.widget
            .state()
            .selection()
            .map(|(org, agent)| ConversationKey::new(org, agent))
    }

    /// Input is disabled while no agent is selected or a reply is streaming.
    pub fn is_input_enabled(&self) -> bool {
        self.active_key()
            .map(|key| self.conversations.is_input_enabled(&key))
            .unwrap_or(false)
    }

    /// Loads organizations and, when one is selected, its agents.
    pub async fn refresh_directory(&mut self) -> Result<(), ForegroundError> {
        let request = RelayRequest::ListOrganizations;
        let action = request.action();
        self.organizations = match self.bus.send(request).await.into_result()? {
            RelayData::Organizations(organizations) => organizations,
            _ => return Err(RelayError::UnexpectedData { action }.into()),
        };
        info!("Loaded {} organizations", self.organizations.len());
        if let Some(org) = self.widget.state().selected_organization.clone() {
            self.load_agents(&org).await?;
        }
        Ok(())
    }

    async fn load_agents(&mut self, organization_id: &str) -> Result<(), ForegroundError> {
        let request = RelayRequest::ListAgents {
            organization_id: organization_id.to_string(),
        };
        let action = request.action();
        self.agents = match self.bus.send(request).await.into_result()? {
            RelayData::Agents(agents) => agents,
            _ => return Err(RelayError::UnexpectedData { action }.into()),
        };
        Ok(())
    }

    pub async fn show(&mut self) -> Result<(), ForegroundError> {
        Ok(self.widget.show().await?)
    }

    /// Hides the widget and stops every reply still streaming for it.
    pub async fn hide(&mut self) -> Result<(), ForegroundError> {
        self.conversations.cancel_all();
        Ok(self.widget.hide().await?)
    }

    pub async fn toggle_minimize(&mut self) -> Result<(), ForegroundError> {
        Ok(self.widget.toggle_minimize().await?)
    }

    pub async fn select_organization(&mut self, organization_id: String) -> Result<(), ForegroundError> {
        self.widget.select_organization(organization_id.clone()).await?;
        self.agents.clear();
        self.load_agents(&organization_id).await
    }

    pub async fn select_agent(&mut self, agent_id: String) -> Result<(), ForegroundError> {
        Ok(self.widget.select_agent(agent_id).await?)
    }

    /// Moves the organization selection by `delta`, wrapping around.
    pub async fn cycle_organization(&mut self, delta: isize) -> Result<(), ForegroundError> {
        let current = self.widget.state().selected_organization.as_deref();
        let Some(next) = cycle(&self.organizations, current, delta, |org| &org.id) else {
            warn!("No organizations to choose from");
            return Ok(());
        };
        self.select_organization(next).await
    }

    /// Moves the agent selection by `delta`, wrapping around.
    pub async fn cycle_agent(&mut self, delta: isize) -> Result<(), ForegroundError> {
        let current = self.widget.state().selected_agent.as_deref();
        let Some(next) = cycle(&self.agents, current, delta, |agent| &agent.id) else {
            warn!("No agents to choose from");
            return Ok(());
        };
        self.select_agent(next).await
    }

    /// Builds the message for the current selection, or `None` when no agent
    /// is selected.
    pub fn compose(&self, text: impl Into<String>) -> Option<SendMessage> {
        let key = self.active_key()?;
        Some(SendMessage {
            organization_id: key.organization_id,
            agent_id: key.agent_id,
            text: text.into(),
        })
    }
}

fn cycle<T>(items: &[T], current: Option<&str>, delta: isize, id: impl Fn(&T) -> &String) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    let len = items.len() as isize;
    let next = match current.and_then(|current| items.iter().position(|item| id(item) == current)) {
        Some(index) => (index as isize + delta).rem_euclid(len),
        None => 0,
    };
    Some(id(&items[next as usize]).clone())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::api::stream::StreamEvent;
    use crate::relay::BackgroundService;
    use crate::relay::service::testing::{Script, ScriptedBackend};
    use crate::store::{MemoryStore, StoredRecord};

    async fn start(store: Arc<MemoryStore>, backend: Arc<ScriptedBackend>) -> ForegroundAgent {
        let service = BackgroundService::new(backend, store.clone());
        let (bus, _) = RelayBus::spawn(service);
        ForegroundAgent::start(bus, store).await.unwrap()
    }

    #[tokio::test]
    async fn selection_drives_directory_and_compose() {
        let store = Arc::new(MemoryStore::new());
        let mut agent = start(store.clone(), Arc::new(ScriptedBackend::new())).await;
        agent.refresh_directory().await.unwrap();
        assert_eq!(agent.organizations().len(), 1);
        assert!(agent.compose("hi").is_none());
        assert!(!agent.is_input_enabled());

        agent.cycle_organization(1).await.unwrap();
        assert_eq!(agent.agents().len(), 2);
        agent.cycle_agent(1).await.unwrap();
        assert_eq!(agent.widget().state().selection(), Some(("42", "7")));
        agent.cycle_agent(1).await.unwrap();
        assert_eq!(agent.widget().state().selection(), Some(("42", "8")));
        agent.cycle_agent(1).await.unwrap();
        assert_eq!(agent.widget().state().selection(), Some(("42", "7")));

        let message = agent.compose("hi").unwrap();
        assert_eq!(message.organization_id, "42");
        assert!(agent.is_input_enabled());
        assert_eq!(store.snapshot().await.selected_agent.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn hide_cancels_streaming_reply() {
        let store = Arc::new(MemoryStore::with_record(StoredRecord {
            is_visible: Some(true),
            selected_org: Some("42".into()),
            selected_agent: Some("7".into()),
            ..StoredRecord::default()
        }));
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(Script::Hang(vec![StreamEvent::content("partial")]));
        let mut agent = start(store.clone(), backend).await;
        assert_eq!(agent.widget().phase(), WidgetPhase::Expanded);

        let manager = agent.conversations().clone();
        let message = agent.compose("hello").unwrap();
        let running = tokio::spawn(async move { manager.send_message(message).await });
        let key = agent.active_key().unwrap();
        while agent.conversations().transcript(&key).last().map(|entry| entry.text.as_str())
            != Some("partial")
        {
            tokio::task::yield_now().await;
        }

        agent.hide().await.unwrap();
        assert_eq!(running.await.unwrap(), SendOutcome::Cancelled);
        assert_eq!(agent.widget().phase(), WidgetPhase::Hidden);
        assert_eq!(store.snapshot().await.is_visible, Some(false));
        assert!(agent.is_input_enabled());
    }
}
