use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::api::stream::StreamEvent;
use crate::relay::{RelayBus, RelayData, RelayError, RelayRequest};

/// Text shown in place of an assistant reply whenever sending fails.
pub const ERROR_REPLY: &str = "Sorry, I encountered an error. Please try again.";

/// Identifies a conversation: one per (organization, agent) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub organization_id: String,
    pub agent_id: String,
}

impl ConversationKey {
    pub fn new(organization_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            agent_id: agent_id.into(),
        }
    }
}

/// Where a conversation is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationPhase {
    /// No conversation has been created for this pair yet.
    Uninitialized,
    /// A conversation exists and no reply is in flight.
    Active,
    /// A reply is streaming in.
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Streaming,
    Done,
    Failed,
    /// The stream was stopped before it finished; the text so far is kept.
    Cancelled,
}

/// One bubble in the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    pub status: EntryStatus,
}

impl TranscriptEntry {
    fn user(text: &str) -> Self {
        Self {
            role: Role::User,
            text: text.to_string(),
            status: EntryStatus::Done,
        }
    }

    fn assistant_pending() -> Self {
        Self {
            role: Role::Assistant,
            text: String::new(),
            status: EntryStatus::Streaming,
        }
    }

    fn assistant_error() -> Self {
        Self {
            role: Role::Assistant,
            text: ERROR_REPLY.to_string(),
            status: EntryStatus::Failed,
        }
    }
}

/// The visible message list of one conversation.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    /// Number of entries with the given role.
    pub fn count(&self, role: Role) -> usize {
        self.entries.iter().filter(|entry| entry.role == role).count()
    }

    fn push(&mut self, entry: TranscriptEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }
}

/// What happened to a `send_message` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The assistant reply arrived in full.
    Completed,
    /// Something failed; an error bubble was added to the transcript.
    Failed,
    /// The reply was stopped through [`ConversationManager::cancel_all`].
    Cancelled,
    /// A reply for this conversation is still streaming; nothing was sent.
    Busy,
    /// The text was empty; nothing was sent.
    Empty,
}

/// A user message addressed to one (organization, agent) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
    pub organization_id: String,
    pub agent_id: String,
    pub text: String,
}

/// A send that already holds its conversation's lock token. Dropping it
/// without calling [`PendingSend::run`] releases the lock.
pub struct PendingSend {
    manager: ConversationManager,
    key: ConversationKey,
    text: String,
    guard: StreamingGuard,
}

impl PendingSend {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub async fn run(self) -> SendOutcome {
        let PendingSend {
            manager,
            key,
            text,
            guard,
        } = self;
        let outcome = manager.deliver(&key, &text, &guard).await;
        drop(guard);
        outcome
    }
}

#[derive(Default)]
struct ManagerState {
    conversations: HashMap<ConversationKey, String>,
    transcripts: HashMap<ConversationKey, Transcript>,
    in_flight: HashMap<ConversationKey, CancellationToken>,
}

/// Drives the send-message life cycle for every conversation of one foreground agent.
///
/// Cloning is cheap and every clone shares the same state, so the host can run
/// a send on its own task while it keeps rendering from `transcript()`.
#[derive(Clone)]
pub struct ConversationManager {
    bus: RelayBus,
    state: Arc<Mutex<ManagerState>>,
}

/// Lock token for one streaming reply. While it lives, the conversation is in
/// `Streaming` and its input control is disabled; dropping it releases both.
struct StreamingGuard {
    key: ConversationKey,
    cancel: CancellationToken,
    state: Arc<Mutex<ManagerState>>,
}

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        lock(&self.state).in_flight.remove(&self.key);
    }
}

fn lock(state: &Mutex<ManagerState>) -> MutexGuard<'_, ManagerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConversationManager {
    pub fn new(bus: RelayBus) -> Self {
        Self {
            bus,
            state: Arc::new(Mutex::new(ManagerState::default())),
        }
    }

    pub fn phase(&self, key: &ConversationKey) -> ConversationPhase {
        let state = lock(&self.state);
        if state.in_flight.contains_key(key) {
            ConversationPhase::Streaming
        } else if state.conversations.contains_key(key) {
            ConversationPhase::Active
        } else {
            ConversationPhase::Uninitialized
        }
    }

    pub fn conversation_id(&self, key: &ConversationKey) -> Option<String> {
        lock(&self.state).conversations.get(key).cloned()
    }

    /// Snapshot of the transcript for `key`.
    pub fn transcript(&self, key: &ConversationKey) -> Transcript {
        lock(&self.state)
            .transcripts
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// The input control is enabled unless a reply for `key` is streaming.
    pub fn is_input_enabled(&self, key: &ConversationKey) -> bool {
        !lock(&self.state).in_flight.contains_key(key)
    }

    /// Stops every reply that is still streaming.
    pub fn cancel_all(&self) {
        let state = lock(&self.state);
        for (key, token) in state.in_flight.iter() {
            info!(
                "Cancelling reply for organization {} / agent {}",
                key.organization_id, key.agent_id
            );
            token.cancel();
        }
    }

    fn try_begin(&self, key: &ConversationKey) -> Option<StreamingGuard> {
        let mut state = lock(&self.state);
        if state.in_flight.contains_key(key) {
            return None;
        }
        let cancel = CancellationToken::new();
        state.in_flight.insert(key.clone(), cancel.clone());
        Some(StreamingGuard {
            key: key.clone(),
            cancel,
            state: self.state.clone(),
        })
    }

    fn with_transcript<R>(&self, key: &ConversationKey, f: impl FnOnce(&mut Transcript) -> R) -> R {
        let mut state = lock(&self.state);
        f(state.transcripts.entry(key.clone()).or_default())
    }

    fn update_entry(&self, key: &ConversationKey, index: usize, f: impl FnOnce(&mut TranscriptEntry)) {
        self.with_transcript(key, |transcript| {
            if let Some(entry) = transcript.entries.get_mut(index) {
                f(entry);
            }
        });
    }

    /// Returns the cached conversation for `key`, creating it on first use.
    async fn ensure_conversation(&self, key: &ConversationKey) -> Result<String, RelayError> {
        if let Some(id) = self.conversation_id(key) {
            return Ok(id);
        }
        let request = RelayRequest::CreateConversation {
            organization_id: key.organization_id.clone(),
            agent_id: key.agent_id.clone(),
        };
        let action = request.action();
        match self.bus.send(request).await.into_result()? {
            RelayData::Conversation(conversation) => {
                let id = conversation.conversation_id;
                lock(&self.state)
                    .conversations
                    .insert(key.clone(), id.clone());
                Ok(id)
            }
            _ => Err(RelayError::UnexpectedData { action }),
        }
    }

    /// Claims the conversation for `message` right away, before anything is
    /// sent. Input for that conversation reads disabled from here on, so a
    /// second submit cannot slip in while the returned [`PendingSend`] waits
    /// to be run.
    ///
    /// Returns `Err(SendOutcome::Empty)` for blank text and
    /// `Err(SendOutcome::Busy)` while a reply is still streaming.
    pub fn start_send(&self, message: SendMessage) -> Result<PendingSend, SendOutcome> {
        let text = message.text.trim();
        if text.is_empty() {
            return Err(SendOutcome::Empty);
        }
        let key = ConversationKey::new(message.organization_id, message.agent_id);
        let Some(guard) = self.try_begin(&key) else {
            warn!(
                "Reply for organization {} / agent {} still streaming, message not sent",
                key.organization_id, key.agent_id
            );
            return Err(SendOutcome::Busy);
        };
        Ok(PendingSend {
            manager: self.clone(),
            text: text.to_string(),
            key,
            guard,
        })
    }

    /// Sends a user message and streams the assistant reply into the transcript.
    ///
    /// Failures never escape: they end up as a single assistant error entry, and
    /// the input control is enabled again whatever the outcome.
    pub async fn send_message(&self, message: SendMessage) -> SendOutcome {
        match self.start_send(message) {
            Ok(pending) => pending.run().await,
            Err(outcome) => outcome,
        }
    }

    async fn deliver(&self, key: &ConversationKey, text: &str, guard: &StreamingGuard) -> SendOutcome {
        self.with_transcript(key, |transcript| transcript.push(TranscriptEntry::user(text)));

        let conversation_id = match self.ensure_conversation(key).await {
            Ok(id) => id,
            Err(err) => {
                error!("Failed to create conversation: {}", err);
                self.with_transcript(key, |transcript| {
                    transcript.push(TranscriptEntry::assistant_error())
                });
                return SendOutcome::Failed;
            }
        };
        if guard.cancel.is_cancelled() {
            debug!("Send cancelled before conversation {} started streaming", conversation_id);
            return SendOutcome::Cancelled;
        }

        let index = self.with_transcript(key, |transcript| {
            transcript.push(TranscriptEntry::assistant_pending())
        });
        let mut stream = self.bus.stream_with_cancel(
            RelayRequest::StreamMessage {
                organization_id: key.organization_id.clone(),
                conversation_id: conversation_id.clone(),
                text: text.to_string(),
            },
            guard.cancel.clone(),
        );

        let mut outcome = None;
        while let Some(event) = stream.next_event().await {
            match event {
                StreamEvent::Content { text } => {
                    self.update_entry(key, index, |entry| entry.text.push_str(&text));
                }
                StreamEvent::Complete => {
                    self.update_entry(key, index, |entry| entry.status = EntryStatus::Done);
                    outcome = Some(SendOutcome::Completed);
                    break;
                }
                StreamEvent::Error { message } => {
                    outcome = Some(self.fail_entry(key, index, guard, &message));
                    break;
                }
            }
        }

        let result = stream.finish().await;
        let outcome = match outcome {
            Some(outcome) => outcome,
            // The relay went away without a terminal event.
            None => {
                let message = result.error().unwrap_or("stream ended unexpectedly").to_string();
                self.fail_entry(key, index, guard, &message)
            }
        };
        debug!(
            "Reply in conversation {} finished: {:?}",
            conversation_id, outcome
        );
        outcome
    }

    fn fail_entry(
        &self,
        key: &ConversationKey,
        index: usize,
        guard: &StreamingGuard,
        message: &str,
    ) -> SendOutcome {
        if guard.cancel.is_cancelled() {
            self.update_entry(key, index, |entry| entry.status = EntryStatus::Cancelled);
            return SendOutcome::Cancelled;
        }
        warn!("Assistant reply failed: {}", message);
        self.update_entry(key, index, |entry| {
            entry.text = ERROR_REPLY.to_string();
            entry.status = EntryStatus::Failed;
        });
        SendOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::relay::BackgroundService;
    use crate::relay::service::testing::{Script, ScriptedBackend};
    use crate::store::MemoryStore;

    fn manager(backend: Arc<ScriptedBackend>) -> ConversationManager {
        let service = BackgroundService::new(backend, Arc::new(MemoryStore::new()));
        let (bus, _) = RelayBus::spawn(service);
        ConversationManager::new(bus)
    }

    fn message(org: &str, agent: &str, text: &str) -> SendMessage {
        SendMessage {
            organization_id: org.into(),
            agent_id: agent.into(),
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn hello_scenario_produces_one_concatenated_reply() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(Script::events(vec![
            StreamEvent::content("hi"),
            StreamEvent::content(" there"),
            StreamEvent::Complete,
        ]));
        let manager = manager(backend.clone());
        let key = ConversationKey::new("42", "7");
        assert_eq!(manager.phase(&key), ConversationPhase::Uninitialized);

        let outcome = manager.send_message(message("42", "7", "hello")).await;
        assert_eq!(outcome, SendOutcome::Completed);
        assert_eq!(manager.conversation_id(&key).as_deref(), Some("c1"));
        assert_eq!(manager.phase(&key), ConversationPhase::Active);

        let transcript = manager.transcript(&key);
        assert_eq!(
            transcript.entries(),
            &[
                TranscriptEntry {
                    role: Role::User,
                    text: "hello".into(),
                    status: EntryStatus::Done,
                },
                TranscriptEntry {
                    role: Role::Assistant,
                    text: "hi there".into(),
                    status: EntryStatus::Done,
                },
            ]
        );
        assert_eq!(backend.stream_texts.lock().unwrap().as_slice(), ["hello"]);
    }

    #[tokio::test]
    async fn conversations_are_reused_per_pair() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend.clone());

        manager.send_message(message("42", "7", "one")).await;
        manager.send_message(message("42", "7", "two")).await;
        assert_eq!(backend.create_count(), 1);
        let first = manager.conversation_id(&ConversationKey::new("42", "7"));

        manager.send_message(message("42", "8", "three")).await;
        assert_eq!(backend.create_count(), 2);
        let second = manager.conversation_id(&ConversationKey::new("42", "8"));
        assert!(first.is_some() && second.is_some());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn transport_failure_leaves_one_error_reply_and_enabled_input() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(Script::events(vec![StreamEvent::error(
            "server returned 500: Internal Server Error",
        )]));
        let manager = manager(backend);
        let key = ConversationKey::new("42", "7");

        let outcome = manager.send_message(message("42", "7", "hello")).await;
        assert_eq!(outcome, SendOutcome::Failed);
        let transcript = manager.transcript(&key);
        assert_eq!(transcript.count(Role::Assistant), 1);
        let reply = transcript.last().unwrap();
        assert_eq!(reply.text, ERROR_REPLY);
        assert_eq!(reply.status, EntryStatus::Failed);
        assert!(manager.is_input_enabled(&key));
    }

    #[tokio::test]
    async fn conversation_creation_failure_is_reported_in_transcript() {
        let backend = Arc::new(ScriptedBackend::new());
        *backend.fail_create.lock().unwrap() = Some("no such agent".into());
        let manager = manager(backend.clone());
        let key = ConversationKey::new("42", "7");

        let outcome = manager.send_message(message("42", "7", "hello")).await;
        assert_eq!(outcome, SendOutcome::Failed);
        assert_eq!(manager.phase(&key), ConversationPhase::Uninitialized);
        let transcript = manager.transcript(&key);
        assert_eq!(transcript.count(Role::User), 1);
        assert_eq!(transcript.count(Role::Assistant), 1);
        assert!(manager.is_input_enabled(&key));

        // The widget stays usable once the backend recovers.
        *backend.fail_create.lock().unwrap() = None;
        let outcome = manager.send_message(message("42", "7", "again")).await;
        assert_eq!(outcome, SendOutcome::Completed);
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_rejected() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(Script::Events {
            events: vec![StreamEvent::content("slow"), StreamEvent::Complete],
            delay: Duration::from_millis(200),
        });
        let manager = manager(backend.clone());
        let key = ConversationKey::new("42", "7");

        let running = tokio::spawn({
            let manager = manager.clone();
            async move { manager.send_message(message("42", "7", "first")).await }
        });
        while manager.phase(&key) != ConversationPhase::Streaming {
            tokio::task::yield_now().await;
        }
        assert!(!manager.is_input_enabled(&key));
        assert_eq!(
            manager.send_message(message("42", "7", "second")).await,
            SendOutcome::Busy
        );

        assert_eq!(running.await.unwrap(), SendOutcome::Completed);
        assert!(manager.is_input_enabled(&key));
        assert_eq!(manager.transcript(&key).count(Role::User), 1);
        assert_eq!(backend.stream_texts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_all_stops_streaming_reply() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(Script::Hang(vec![StreamEvent::content("partial")]));
        let manager = manager(backend);
        let key = ConversationKey::new("42", "7");

        let running = tokio::spawn({
            let manager = manager.clone();
            async move { manager.send_message(message("42", "7", "hello")).await }
        });
        while manager.transcript(&key).last().map(|entry| entry.text.as_str()) != Some("partial") {
            tokio::task::yield_now().await;
        }
        manager.cancel_all();

        assert_eq!(running.await.unwrap(), SendOutcome::Cancelled);
        let reply = manager.transcript(&key).last().cloned().unwrap();
        assert_eq!(reply.text, "partial");
        assert_eq!(reply.status, EntryStatus::Cancelled);
        assert!(manager.is_input_enabled(&key));
    }

    #[tokio::test]
    async fn start_send_locks_the_conversation_immediately() {
        let manager = manager(Arc::new(ScriptedBackend::new()));
        let key = ConversationKey::new("42", "7");

        let pending = manager.start_send(message("42", "7", "first")).unwrap();
        assert_eq!(pending.key(), &key);
        assert!(!manager.is_input_enabled(&key));
        assert!(matches!(
            manager.start_send(message("42", "7", "second")),
            Err(SendOutcome::Busy)
        ));

        assert_eq!(pending.run().await, SendOutcome::Completed);
        assert!(manager.is_input_enabled(&key));
        assert_eq!(manager.transcript(&key).count(Role::User), 1);
    }

    #[tokio::test]
    async fn cancel_before_streaming_leaves_no_empty_reply() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend.clone());
        let key = ConversationKey::new("42", "7");

        let pending = manager.start_send(message("42", "7", "hello")).unwrap();
        manager.cancel_all();
        assert_eq!(pending.run().await, SendOutcome::Cancelled);

        let transcript = manager.transcript(&key);
        assert_eq!(transcript.count(Role::User), 1);
        assert_eq!(transcript.count(Role::Assistant), 0);
        assert!(backend.stream_texts.lock().unwrap().is_empty());
        assert!(manager.is_input_enabled(&key));
    }

    #[tokio::test]
    async fn blank_text_is_ignored() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend.clone());
        assert_eq!(
            manager.send_message(message("42", "7", "  \n")).await,
            SendOutcome::Empty
        );
        assert!(manager.transcript(&ConversationKey::new("42", "7")).is_empty());
        assert_eq!(backend.create_count(), 0);
    }
}
