use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::{RelayData, RelayError, RelayRequest};
use crate::api::ApiError;
use crate::api::models::{Agent, Conversation, Organization};
use crate::api::stream::StreamEvent;
use crate::store::{DurableStore, SharedStore};

/// What the background service needs from the remote side.
///
/// All network access goes through this trait; tests swap in a scripted one.
#[async_trait]
pub trait RemoteBackend: Send + Sync + 'static {
    /// Shown in logs.
    fn name(&self) -> &str;

    async fn authenticate(&self, email: &str, password: &str) -> Result<(), ApiError>;

    async fn list_organizations(&self) -> Result<Vec<Organization>, ApiError>;

    async fn list_agents(&self, organization_id: &str) -> Result<Vec<Agent>, ApiError>;

    async fn create_conversation(
        &self,
        organization_id: &str,
        agent_id: &str,
    ) -> Result<Conversation, ApiError>;

    /// Opens a message stream. The returned sequence must end with exactly one
    /// terminal event.
    fn open_stream(
        &self,
        organization_id: &str,
        conversation_id: &str,
        text: &str,
    ) -> BoxStream<'static, StreamEvent>;
}

/// Where a handler delivers stream events, plus the signal that stops it.
pub struct StreamSink {
    events: Option<UnboundedSender<StreamEvent>>,
    cancel: CancellationToken,
}

impl StreamSink {
    pub fn new(events: Option<UnboundedSender<StreamEvent>>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Returns `false` once nobody is listening any more.
    fn emit(&self, event: StreamEvent) -> bool {
        match &self.events {
            Some(tx) => tx.send(event).is_ok(),
            None => true,
        }
    }
}

/// The privileged side of the relay. Owns the backend and answers every request.
pub struct BackgroundService {
    backend: Arc<dyn RemoteBackend>,
    store: SharedStore,
}

impl BackgroundService {
    pub fn new(backend: Arc<dyn RemoteBackend>, store: SharedStore) -> Self {
        Self { backend, store }
    }

    /// Handles one request. Streaming requests push their events into `sink`
    /// and resolve once a terminal event has been delivered.
    pub async fn handle(
        &self,
        request: RelayRequest,
        sink: &StreamSink,
    ) -> Result<RelayData, RelayError> {
        debug!("Handling `{}` via {}", request.action(), self.backend.name());
        match request {
            RelayRequest::Authenticate { email, password } => {
                self.backend.authenticate(&email, &password).await?;
                Ok(RelayData::Authenticated)
            }
            RelayRequest::ListOrganizations => {
                let organizations = self.backend.list_organizations().await?;
                Ok(RelayData::Organizations(organizations))
            }
            RelayRequest::ListAgents { organization_id } => {
                let agents = self.backend.list_agents(&organization_id).await?;
                Ok(RelayData::Agents(agents))
            }
            RelayRequest::CreateConversation {
                organization_id,
                agent_id,
            } => {
                let conversation = self
                    .backend
                    .create_conversation(&organization_id, &agent_id)
                    .await?;
                Ok(RelayData::Conversation(conversation))
            }
            RelayRequest::StreamMessage {
                organization_id,
                conversation_id,
                text,
            } => {
                self.relay_stream(&organization_id, &conversation_id, &text, sink)
                    .await
            }
            RelayRequest::GetStoredData { keys } => {
                let record = self.store.get(&keys).await?;
                Ok(RelayData::StoredData(record))
            }
            RelayRequest::StoreData { record } => {
                self.store.set(record).await?;
                Ok(RelayData::Ack)
            }
            RelayRequest::ClearStoredData => {
                self.store.clear().await?;
                info!("Durable store cleared");
                Ok(RelayData::Ack)
            }
        }
    }

    /// Forwards events in production order until a terminal one, cancellation,
    /// or the caller going away.
    async fn relay_stream(
        &self,
        organization_id: &str,
        conversation_id: &str,
        text: &str,
        sink: &StreamSink,
    ) -> Result<RelayData, RelayError> {
        let mut events = self
            .backend
            .open_stream(organization_id, conversation_id, text);
        let mut forwarded = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = sink.cancel.cancelled() => {
                    info!(
                        "Stream for conversation {} cancelled after {} fragments",
                        conversation_id, forwarded
                    );
                    sink.emit(StreamEvent::error(RelayError::Cancelled.to_string()));
                    return Err(RelayError::Cancelled);
                }
                next = events.next() => next,
            };
            match next {
                Some(StreamEvent::Content { text }) => {
                    forwarded += 1;
                    if !sink.emit(StreamEvent::Content { text }) {
                        debug!("Caller stopped listening to conversation {}", conversation_id);
                        return Err(RelayError::Cancelled);
                    }
                }
                Some(StreamEvent::Error { message }) => {
                    warn!("Stream for conversation {} failed: {}", conversation_id, message);
                    sink.emit(StreamEvent::error(message.clone()));
                    return Err(RelayError::Remote(message));
                }
                Some(StreamEvent::Complete) => {
                    debug!(
                        "Stream for conversation {} complete ({} fragments)",
                        conversation_id, forwarded
                    );
                    sink.emit(StreamEvent::Complete);
                    return Ok(RelayData::Streamed);
                }
                None => {
                    // Ended without a terminal event; treat it as complete.
                    warn!("Stream for conversation {} ended without a terminal event", conversation_id);
                    sink.emit(StreamEvent::Complete);
                    return Ok(RelayData::Streamed);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted backend shared by the relay and foreground tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures_util::stream;

    use super::*;

    /// How one `open_stream` call behaves.
    #[derive(Clone)]
    pub enum Script {
        /// Emit these events, pausing `delay` before each.
        Events {
            events: Vec<StreamEvent>,
            delay: Duration,
        },
        /// Emit the first events, then never finish.
        Hang(Vec<StreamEvent>),
        /// Panic inside the handler.
        Panic,
    }

    impl StreamSink {
        /// A sink for one-shot calls: events are dropped, only the result matters.
        pub fn detached() -> Self {
            Self::new(None, CancellationToken::new())
        }
    }

    impl Script {
        pub fn events(events: Vec<StreamEvent>) -> Self {
            Script::Events {
                events,
                delay: Duration::ZERO,
            }
        }
    }

    #[derive(Default)]
    pub struct ScriptedBackend {
        scripts: Mutex<VecDeque<Script>>,
        pub create_calls: AtomicUsize,
        pub stream_texts: Mutex<Vec<String>>,
        pub fail_create: Mutex<Option<String>>,
    }

    impl ScriptedBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_script(&self, script: Script) {
            self.scripts.lock().unwrap().push_back(script);
        }

        pub fn create_count(&self) -> usize {
            self.create_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn authenticate(&self, _email: &str, password: &str) -> Result<(), ApiError> {
            if password == "wrong" {
                return Err(ApiError::Status {
                    status: 401,
                    message: "invalid credentials".into(),
                });
            }
            Ok(())
        }

        async fn list_organizations(&self) -> Result<Vec<Organization>, ApiError> {
            Ok(vec![Organization {
                id: "42".into(),
                name: "Acme".into(),
            }])
        }

        async fn list_agents(&self, organization_id: &str) -> Result<Vec<Agent>, ApiError> {
            if organization_id == "panic" {
                panic!("scripted panic");
            }
            Ok(vec![
                Agent {
                    id: "7".into(),
                    name: "Helper".into(),
                    description: None,
                },
                Agent {
                    id: "8".into(),
                    name: "Writer".into(),
                    description: None,
                },
            ])
        }

        async fn create_conversation(
            &self,
            organization_id: &str,
            agent_id: &str,
        ) -> Result<Conversation, ApiError> {
            if let Some(message) = self.fail_create.lock().unwrap().clone() {
                return Err(ApiError::Status {
                    status: 500,
                    message,
                });
            }
            let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Conversation {
                organization_id: organization_id.to_string(),
                agent_id: agent_id.to_string(),
                conversation_id: format!("c{n}"),
            })
        }

        fn open_stream(
            &self,
            _organization_id: &str,
            _conversation_id: &str,
            text: &str,
        ) -> BoxStream<'static, StreamEvent> {
            self.stream_texts.lock().unwrap().push(text.to_string());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Script::events(vec![StreamEvent::Complete]));
            match script {
                Script::Events { events, delay } => Box::pin(stream::iter(events).then(
                    move |event| async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        event
                    },
                )),
                Script::Hang(events) => Box::pin(stream::iter(events).chain(stream::pending())),
                Script::Panic => Box::pin(stream::iter([()]).map(|()| -> StreamEvent {
                    panic!("scripted stream panic")
                })),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Script, ScriptedBackend};
    use super::*;
    use crate::store::{MemoryStore, StoreKey, StoredRecord};
    use tokio::sync::mpsc;

    fn service(backend: Arc<ScriptedBackend>) -> BackgroundService {
        BackgroundService::new(backend, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn store_actions_round_trip_through_the_service() {
        let service = service(Arc::new(ScriptedBackend::new()));
        let sink = StreamSink::detached();
        let stored = service
            .handle(
                RelayRequest::StoreData {
                    record: StoredRecord {
                        selected_org: Some("42".into()),
                        ..StoredRecord::default()
                    },
                },
                &sink,
            )
            .await
            .unwrap();
        assert_eq!(stored, RelayData::Ack);

        let data = service
            .handle(
                RelayRequest::GetStoredData {
                    keys: vec![StoreKey::SelectedOrg],
                },
                &sink,
            )
            .await
            .unwrap();
        match data {
            RelayData::StoredData(record) => assert_eq!(record.selected_org.as_deref(), Some("42")),
            other => panic!("unexpected data: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_events_are_forwarded_in_order() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_script(Script::events(vec![
            StreamEvent::content("a"),
            StreamEvent::content("b"),
            StreamEvent::Complete,
        ]));
        let service = service(backend);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = StreamSink::new(Some(tx), CancellationToken::new());

        let data = service
            .handle(
                RelayRequest::StreamMessage {
                    organization_id: "42".into(),
                    conversation_id: "c1".into(),
                    text: "hello".into(),
                },
                &sink,
            )
            .await
            .unwrap();
        assert_eq!(data, RelayData::Streamed);
        drop(sink);

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                StreamEvent::content("a"),
                StreamEvent::content("b"),
                StreamEvent::Complete
            ]
        );
    }

    #[tokio::test]
    async fn backend_errors_surface_as_relay_errors() {
        let service = service(Arc::new(ScriptedBackend::new()));
        let err = service
            .handle(
                RelayRequest::Authenticate {
                    email: "me@example.com".into(),
                    password: "wrong".into(),
                },
                &StreamSink::detached(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid credentials"));
    }
}
