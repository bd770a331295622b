use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::service::StreamSink;
use super::{BackgroundService, RelayError, RelayRequest, RelayResult};
use crate::api::stream::StreamEvent;

/// One request in flight, together with everything needed to answer it.
struct Envelope {
    request: RelayRequest,
    reply: oneshot::Sender<RelayResult>,
    events: Option<UnboundedSender<StreamEvent>>,
    cancel: CancellationToken,
}

/// Foreground handle to the relay. Cheap to clone.
///
/// Every call yields exactly one terminal [`RelayResult`]. There are no
/// timeouts and no retries: a streaming call stays open until the background
/// side reports `Complete` or `Error`.
#[derive(Clone)]
pub struct RelayBus {
    tx: UnboundedSender<Envelope>,
}

impl RelayBus {
    /// Starts the background dispatch loop and returns a handle to it.
    ///
    /// The loop ends once every `RelayBus` clone has been dropped.
    pub fn spawn(service: BackgroundService) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(Arc::new(service), rx));
        (Self { tx }, handle)
    }

    /// Sends a one-shot request and waits for its result. Stream events of a
    /// streaming request sent this way are discarded.
    pub async fn send(&self, request: RelayRequest) -> RelayResult {
        let action = request.action();
        let (reply, result) = oneshot::channel();
        let envelope = Envelope {
            request,
            reply,
            events: None,
            cancel: CancellationToken::new(),
        };
        if self.tx.send(envelope).is_err() {
            warn!("Relay closed before `{}` could be sent", action);
            return RelayResult::failure(RelayError::Disconnected.to_string());
        }
        result
            .await
            .unwrap_or_else(|_| RelayResult::failure(RelayError::Disconnected.to_string()))
    }

    /// Starts a streaming request. Events arrive on the returned [`RelayStream`]
    /// in the order the remote side produced them.
    pub fn stream(&self, request: RelayRequest) -> RelayStream {
        self.stream_with_cancel(request, CancellationToken::new())
    }

    /// Same as [`RelayBus::stream`], stopped early when `cancel` fires.
    pub fn stream_with_cancel(&self, request: RelayRequest, cancel: CancellationToken) -> RelayStream {
        let action = request.action();
        let (reply, result) = oneshot::channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let envelope = Envelope {
            request,
            reply,
            events: Some(events_tx),
            cancel: cancel.clone(),
        };
        if self.tx.send(envelope).is_err() {
            // The envelope is dropped here, which closes both channels; the
            // stream then reports `Disconnected` from `finish`.
            warn!("Relay closed before `{}` could be sent", action);
        }
        RelayStream {
            events,
            result,
            cancel,
        }
    }
}

/// The foreground end of one streaming call.
pub struct RelayStream {
    events: UnboundedReceiver<StreamEvent>,
    result: oneshot::Receiver<RelayResult>,
    cancel: CancellationToken,
}

impl RelayStream {
    /// Next event, or `None` once the background side is done with this call.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Waits for the terminal result. Events not yet read are discarded.
    pub async fn finish(self) -> RelayResult {
        let RelayStream { events, result, .. } = self;
        drop(events);
        result
            .await
            .unwrap_or_else(|_| RelayResult::failure(RelayError::Disconnected.to_string()))
    }

    /// Asks the background side to stop; a terminal `Error` event follows.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Background dispatch loop: one task per envelope, so a long stream never
/// holds up other calls.
async fn run(service: Arc<BackgroundService>, mut rx: UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        tokio::spawn(dispatch(service.clone(), envelope));
    }
    debug!("Relay bus closed, background dispatch loop exiting");
}

async fn dispatch(service: Arc<BackgroundService>, envelope: Envelope) {
    let Envelope {
        request,
        reply,
        events,
        cancel,
    } = envelope;
    let action = request.action();
    let streaming = request.is_streaming();
    let fallback = events.clone();

    // Run the handler on its own task so a panic still gets a reply.
    let handler = tokio::spawn(async move {
        let sink = StreamSink::new(events, cancel);
        service.handle(request, &sink).await
    });
    let outcome = match handler.await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Handler for `{}` aborted: {}", action, err);
            let err = RelayError::HandlerPanicked { action };
            if streaming && let Some(tx) = fallback.as_ref() {
                let _ = tx.send(StreamEvent::error(err.to_string()));
            }
            Err(err)
        }
    };
    drop(fallback);
    if let Err(err) = &outcome {
        debug!("`{}` failed: {}", action, err);
    }
    if reply.send(RelayResult::from(outcome)).is_err() {
        debug!("Caller of `{}` left before the result arrived", action);
    }
}
