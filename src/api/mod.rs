//! HTTP client for the assistant backend.
//!
//! `ApiClient` is the only component that talks to the network. It lives in the
//! background service and reads the bearer token from the durable store on every
//! call instead of keeping its own copy.

pub mod models;
pub mod stream;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, warn};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};

use crate::relay::service::RemoteBackend;
use crate::store::{Credentials, DurableStore, SharedStore, StoreError, StoredRecord};

use models::{
    Agent, Conversation, ConversationCreated, CreateConversationPayload, ErrorBody, LoginPayload,
    LoginResponse, MessagePayload, Organization,
};
pub use stream::StreamEvent;

/// Errors produced while talking to the backend.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not signed in; run `chatrelay login` first")]
    MissingToken,
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected response body: {0}")]
    Decode(#[source] reqwest::Error),
    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// HTTP implementation of [`RemoteBackend`].
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    client: Client,
    store: SharedStore,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, store: SharedStore) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: Client::new(),
            store,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Re-reads the token for this call only.
    async fn bearer(&self) -> Result<String, ApiError> {
        Credentials::load(self.store.as_ref())
            .await?
            .token
            .ok_or(ApiError::MissingToken)
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let token = self.bearer().await?;
        Ok(builder.headers(build_headers(Some(&token), false)?))
    }

    async fn execute(&self, url: String, builder: RequestBuilder) -> Result<Response, ApiError> {
        debug!("Calling {}", url);
        let response = builder
            .send()
            .await
            .map_err(|source| ApiError::Transport { url, source })?;
        ensure_success(response).await
    }
}

/// Streaming requests also accept `text/event-stream`.
fn build_headers(token: Option<&str>, streaming: bool) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if streaming {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    } else {
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    }
    if let Some(token) = token {
        let value = format!("Bearer {}", token);
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&value)?);
    }
    Ok(headers)
}

/// Converts a non-2xx response into `ApiError::Status`, using the backend's JSON
/// error body as the message when it has one.
async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(ErrorBody::into_message)
        .unwrap_or_else(|| {
            if text.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                text.trim().to_string()
            }
        });
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl RemoteBackend for ApiClient {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn authenticate(&self, email: &str, password: &str) -> Result<(), ApiError> {
        let url = self.url("auth/login");
        let builder = self
            .client
            .post(&url)
            .headers(build_headers(None, false)?)
            .json(&LoginPayload { email, password });
        let response = self.execute(url, builder).await?;
        let login: LoginResponse = response.json().await.map_err(ApiError::Decode)?;
        self.store
            .set(StoredRecord {
                token: Some(login.token),
                ..StoredRecord::default()
            })
            .await?;
        info!("Signed in as {}", email);
        Ok(())
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>, ApiError> {
        let url = self.url("organizations");
        let builder = self.authorized(self.client.get(&url)).await?;
        let response = self.execute(url, builder).await?;
        response.json().await.map_err(ApiError::Decode)
    }

    async fn list_agents(&self, organization_id: &str) -> Result<Vec<Agent>, ApiError> {
        let url = self.url(&format!("organizations/{}/agents", organization_id));
        let builder = self.authorized(self.client.get(&url)).await?;
        let response = self.execute(url, builder).await?;
        response.json().await.map_err(ApiError::Decode)
    }

    async fn create_conversation(
        &self,
        organization_id: &str,
        agent_id: &str,
    ) -> Result<Conversation, ApiError> {
        let url = self.url(&format!("organizations/{}/conversations", organization_id));
        let builder = self
            .authorized(self.client.post(&url))
            .await?
            .json(&CreateConversationPayload { agent_id });
        let response = self.execute(url, builder).await?;
        let created: ConversationCreated = response.json().await.map_err(ApiError::Decode)?;
        info!(
            "Created conversation {} for organization {} / agent {}",
            created.id, organization_id, agent_id
        );
        Ok(Conversation {
            organization_id: organization_id.to_string(),
            agent_id: agent_id.to_string(),
            conversation_id: created.id,
        })
    }

    /// Lazy: nothing is sent until the stream is first polled.
    fn open_stream(
        &self,
        organization_id: &str,
        conversation_id: &str,
        text: &str,
    ) -> BoxStream<'static, StreamEvent> {
        let this = self.clone();
        let url = self.url(&format!(
            "organizations/{}/conversations/{}/messages",
            organization_id, conversation_id
        ));
        let text = text.to_string();
        Box::pin(async_stream::stream! {
            if text.trim().is_empty() {
                yield StreamEvent::error(ApiError::EmptyMessage.to_string());
                return;
            }
            let token = match this.bearer().await {
                Ok(token) => token,
                Err(err) => {
                    yield StreamEvent::error(err.to_string());
                    return;
                }
            };
            let headers = match build_headers(Some(&token), true) {
                Ok(headers) => headers,
                Err(err) => {
                    yield StreamEvent::error(err.to_string());
                    return;
                }
            };
            let builder = this
                .client
                .post(&url)
                .headers(headers)
                .json(&MessagePayload::text(&text));
            let response = match this.execute(url.clone(), builder).await {
                Ok(response) => response,
                Err(err) => {
                    warn!("Streaming request failed: {}", err);
                    yield StreamEvent::error(err.to_string());
                    return;
                }
            };
            let mut events = stream::decode_stream(response.bytes_stream());
            while let Some(event) = events.next().await {
                yield event;
            }
        })
    }
}
