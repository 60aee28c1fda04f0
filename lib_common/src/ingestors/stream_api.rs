//! # Streaming API Provider
//!
//! Talks to the headset vendor's cloud:
//!
//! - Credential exchange is one `POST` to the OAuth endpoint carrying the
//!   client id, the client secret and the entity's external id. The answer is
//!   either `{"token": ".."}` or a bare JSON string.
//! - Each feed is one WebSocket at `<stream_url>/<feedName>`, authorized with
//!   the exchanged credential as a bearer token. Text frames are decoded into
//!   `FeedEvent`s; frames that do not decode are logged and skipped.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::ingestors::{Credential, FeedEvent, FeedKind, FeedStream, Provider, ProviderError};
use crate::retrieve::http_client::ApiClient;
use crate::telemetry::{Entity, ProviderKind};

/// Endpoints and application credentials of the streaming API.
#[derive(Clone)]
pub struct StreamApiConfig {
    /// Absolute URL of the OAuth token endpoint.
    pub oauth_url: String,
    /// Application client id.
    pub client_id: String,
    /// Application client secret.
    pub client_secret: String,
    /// Base `ws://` or `wss://` URL; the feed name is appended.
    pub stream_url: String,
}

impl std::fmt::Debug for StreamApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamApiConfig")
            .field("oauth_url", &self.oauth_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("stream_url", &self.stream_url)
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    user_id: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExchangeResponse {
    Wrapped {
        #[serde(default)]
        token: Option<String>,
    },
    Bare(String),
}

impl ExchangeResponse {
    fn into_token(self) -> Option<String> {
        match self {
            ExchangeResponse::Wrapped { token } => token,
            ExchangeResponse::Bare(token) => Some(token),
        }
        .filter(|t| !t.is_empty())
    }
}

/// # Stream API Provider
///
/// `Provider` implementation over HTTP and WebSockets.
pub struct StreamApiProvider {
    config: StreamApiConfig,
    http: ApiClient,
}

impl StreamApiProvider {
    /// Builds the provider. Fails if the OAuth URL is not absolute.
    pub fn new(config: StreamApiConfig) -> Result<Self, ProviderError> {
        let http = ApiClient::new(&config.oauth_url, None).map_err(|e| ProviderError::Exchange(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn feed_url(&self, feed: FeedKind) -> String {
        format!("{}/{}", self.config.stream_url.trim_end_matches('/'), feed.name())
    }
}

#[async_trait]
impl Provider for StreamApiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Neurosity
    }

    async fn exchange_credential(&self, entity: &Entity) -> Result<Credential, ProviderError> {
        let body = ExchangeRequest {
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
            user_id: &entity.external_id,
        };

        let path = self.http.base_url().path().to_string();
        let resp = self
            .http
            .request::<ExchangeResponse, _>(Method::POST, &path, None, Some(&body))
            .await
            .map_err(|e| ProviderError::Exchange(e.to_string()))?;

        if !resp.success {
            return Err(ProviderError::Exchange(format!(
                "status {}: {}",
                resp.status,
                resp.error_body.unwrap_or_default()
            )));
        }

        match resp.data.and_then(ExchangeResponse::into_token) {
            Some(token) => Ok(Credential::new(&token)),
            None => Err(ProviderError::NoCredential {
                external_id: entity.external_id.clone(),
            }),
        }
    }

    async fn subscribe(&self, credential: &Credential, feed: FeedKind) -> Result<FeedStream, ProviderError> {
        let sub_err = |reason: String| ProviderError::Subscribe { feed, reason };

        let mut request = self.feed_url(feed).into_client_request().map_err(|e| sub_err(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose())).map_err(|e| sub_err(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _) = connect_async(request).await.map_err(|e| sub_err(e.to_string()))?;
        log::debug!("Feed '{}' connected", feed);

        let events = stream::unfold(ws, move |mut ws| async move {
            loop {
                match ws.next().await? {
                    Ok(Message::Text(text)) => match FeedEvent::from_frame(feed, text.as_str()) {
                        Ok(event) => return Some((event, ws)),
                        Err(e) => log::warn!("Skipping frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        log::info!("Feed '{}' closed by remote host", feed);
                        return None;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Feed '{}' read error: {}", feed, e);
                        return None;
                    }
                }
            }
        });

        Ok(events.boxed())
    }
}
