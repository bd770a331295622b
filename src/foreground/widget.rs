use log::{debug, info};

use crate::store::{DurableStore, Position, SharedStore, StoreError, StoreKey, StoredRecord};

/// Visibility of the chat widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetPhase {
    Hidden,
    Expanded,
    Minimized,
}

impl WidgetPhase {
    pub fn is_visible(self) -> bool {
        !matches!(self, WidgetPhase::Hidden)
    }
}

/// Everything about the widget that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WidgetState {
    pub is_visible: bool,
    pub is_minimized: bool,
    pub selected_organization: Option<String>,
    pub selected_agent: Option<String>,
    /// `None` until the user first drags the widget; the host picks a default spot.
    pub position: Option<Position>,
}

impl WidgetState {
    pub fn phase(&self) -> WidgetPhase {
        match (self.is_visible, self.is_minimized) {
            (false, _) => WidgetPhase::Hidden,
            (true, false) => WidgetPhase::Expanded,
            (true, true) => WidgetPhase::Minimized,
        }
    }

    /// Both an organization and an agent are chosen.
    pub fn selection(&self) -> Option<(&str, &str)> {
        match (&self.selected_organization, &self.selected_agent) {
            (Some(org), Some(agent)) => Some((org.as_str(), agent.as_str())),
            _ => None,
        }
    }

    fn from_record(record: StoredRecord) -> Self {
        Self {
            is_visible: record.is_visible.unwrap_or(false),
            is_minimized: record.is_minimized.unwrap_or(false),
            selected_organization: record.selected_org,
            selected_agent: record.selected_agent,
            position: record.chatbot_position,
        }
    }
}

/// Tracks where the header was grabbed, relative to the widget origin.
#[derive(Debug, Clone, Copy)]
struct DragAnchor {
    dx: u16,
    dy: u16,
}

/// The widget presentation state machine.
///
/// Hidden → Expanded via `show`, any visible phase → Hidden via `hide`, and
/// Expanded ⇄ Minimized via `toggle_minimize`. Every transition is written to
/// the durable store before the method returns.
pub struct Widget {
    state: WidgetState,
    store: SharedStore,
    drag: Option<DragAnchor>,
}

impl Widget {
    /// Reads the persisted state once at startup.
    ///
    /// A visible phase is only restored when both an organization and an agent
    /// are selected; otherwise the widget starts hidden and keeps the selection.
    pub async fn restore(store: SharedStore) -> Result<Self, StoreError> {
        let record = store.get(&StoreKey::WIDGET).await?;
        let mut state = WidgetState::from_record(record);
        if state.is_visible && state.selection().is_none() {
            debug!("Persisted widget was visible without a full selection, starting hidden");
            state.is_visible = false;
        }
        info!("Widget restored as {:?}", state.phase());
        Ok(Self {
            state,
            store,
            drag: None,
        })
    }

    pub fn state(&self) -> &WidgetState {
        &self.state
    }

    pub fn phase(&self) -> WidgetPhase {
        self.state.phase()
    }

    pub fn is_dragging(&self) -> bool {
        self.drag.is_some()
    }

    async fn persist(&self, record: StoredRecord) -> Result<(), StoreError> {
        self.store.set(record).await
    }

    async fn persist_visibility(&self) -> Result<(), StoreError> {
        self.persist(StoredRecord {
            is_visible: Some(self.state.is_visible),
            is_minimized: Some(self.state.is_minimized),
            ..StoredRecord::default()
        })
        .await
    }

    /// Hidden → Expanded. The last organization/agent selection is kept.
    pub async fn show(&mut self) -> Result<(), StoreError> {
        if self.phase() != WidgetPhase::Hidden {
            return Ok(());
        }
        self.state.is_visible = true;
        self.state.is_minimized = false;
        self.persist_visibility().await
    }

    /// Any visible phase → Hidden.
    pub async fn hide(&mut self) -> Result<(), StoreError> {
        if self.phase() == WidgetPhase::Hidden {
            return Ok(());
        }
        self.state.is_visible = false;
        self.state.is_minimized = false;
        self.drag = None;
        self.persist_visibility().await
    }

    /// Expanded ⇄ Minimized. Does nothing while hidden.
    pub async fn toggle_minimize(&mut self) -> Result<(), StoreError> {
        if self.phase() == WidgetPhase::Hidden {
            return Ok(());
        }
        self.state.is_minimized = !self.state.is_minimized;
        self.persist_visibility().await
    }

    /// Selects an organization. A different organization clears the agent.
    pub async fn select_organization(&mut self, organization_id: String) -> Result<(), StoreError> {
        if self.state.selected_organization.as_deref() == Some(organization_id.as_str()) {
            return Ok(());
        }
        self.state.selected_organization = Some(organization_id.clone());
        self.state.selected_agent = None;
        self.persist(StoredRecord {
            selected_org: Some(organization_id),
            ..StoredRecord::default()
        })
        .await?;
        self.store.remove(&[StoreKey::SelectedAgent]).await
    }

    pub async fn select_agent(&mut self, agent_id: String) -> Result<(), StoreError> {
        self.state.selected_agent = Some(agent_id.clone());
        self.persist(StoredRecord {
            selected_agent: Some(agent_id),
            ..StoredRecord::default()
        })
        .await
    }

    /// Starts dragging the header. `origin` is where the widget is currently
    /// drawn and `pointer` where it was grabbed.
    pub fn begin_drag(&mut self, origin: Position, pointer: Position) {
        self.state.position = Some(origin);
        self.drag = Some(DragAnchor {
            dx: pointer.x.saturating_sub(origin.x),
            dy: pointer.y.saturating_sub(origin.y),
        });
    }

    /// Moves the widget with the pointer. Only the in-memory position changes.
    pub fn drag_to(&mut self, pointer: Position) {
        if let Some(anchor) = self.drag {
            self.state.position = Some(Position::new(
                pointer.x.saturating_sub(anchor.dx),
                pointer.y.saturating_sub(anchor.dy),
            ));
        }
    }

    /// Releases the header and persists the final position.
    pub async fn end_drag(&mut self) -> Result<(), StoreError> {
        if self.drag.take().is_none() {
            return Ok(());
        }
        let Some(position) = self.state.position else {
            return Ok(());
        };
        debug!("Widget moved to {},{}", position.x, position.y);
        self.persist(StoredRecord {
            chatbot_position: Some(position),
            ..StoredRecord::default()
        })
        .await
    }
}
