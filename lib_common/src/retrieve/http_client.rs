//! # HTTP Client
//!
//! Asynchronous API client wrapper around `reqwest` with exponential backoff
//! retries and standardized JSON response handling.

use reqwest::{
    header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE},
    Method, Url,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Errors raised while building or executing a request.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The base URL or a joined path is not a valid absolute URL.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    /// The request body could not be serialized.
    #[error("Failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    /// The request could not be sent, even after retries.
    #[error("Request failed: {0}")]
    Transport(String),
    /// The response body did not match the expected shape.
    #[error("Failed to decode response body: {0}")]
    Decode(String),
}

/// A standardized container for API responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized response body, when the call succeeded.
    pub data: Option<T>,
    /// The raw body returned by the server when the call failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// True for 2xx status codes.
    pub success: bool,
}

/// A retrying asynchronous HTTP client bound to a base URL.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client with three retries of exponential backoff.
    ///
    /// # Errors
    /// Returns `HttpError::Url` if `base_url` is not absolute.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, HttpError> {
        Self::with_retries(base_url, auth_token, 3)
    }

    /// Creates a client retrying transient failures `max_retries` times.
    pub fn with_retries(base_url: &str, auth_token: Option<String>, max_retries: u32) -> Result<Self, HttpError> {
        let url = Url::parse(base_url)?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token,
        })
    }

    /// The base URL every path is joined to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs an HTTP request and decodes a JSON response.
    ///
    /// Non-2xx answers are not errors: they come back with `success == false`
    /// and the raw body in `error_body`.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<&B>,
    ) -> Result<ApiResponse<T>, HttpError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        // 1. Resolve the path against the base URL
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url);

        // 2. Per-request headers and bearer auth
        if let Some(h) = headers {
            req = req.headers(h);
        }
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        // 3. JSON body
        if let Some(b) = body {
            let json_body = serde_json::to_string(b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        // 4. Execute
        let response = req.send().await.map_err(|e| HttpError::Transport(e.to_string()))?;
        let status = response.status();

        if status.is_success() {
            let data = response
                .json::<T>()
                .await
                .map_err(|e| HttpError::Decode(e.to_string()))?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_relative_base_url_is_rejected() {
        assert!(matches!(ApiClient::new("not a url", None), Err(HttpError::Url(_))));
    }

    #[tokio::test]
    async fn test_post_json_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .and(header("authorization", "Bearer abc"))
            .and(body_json(json!({ "k": 1 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), Some("abc".into())).unwrap();
        let resp: ApiResponse<Value> = client
            .request(Method::POST, "/echo", None, Some(&json!({ "k": 1 })))
            .await
            .unwrap();

        assert!(resp.success);
        assert_eq!(resp.data, Some(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn test_client_error_is_reported_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let client = ApiClient::with_retries(&server.uri(), None, 0).unwrap();
        let resp: ApiResponse<Value> = client.request::<Value, ()>(Method::GET, "/missing", None, None).await.unwrap();

        assert!(!resp.success);
        assert_eq!(resp.status, 404);
        assert_eq!(resp.error_body.as_deref(), Some("nope"));
    }
}
