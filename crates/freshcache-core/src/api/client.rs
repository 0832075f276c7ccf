//! HTTP client for the backing REST API.
//!
//! Requests are single attempts. Retrying is the caller's decision, made
//! through `RetryExecutor` with the error classification from `ApiError`.

use std::time::Duration;

use futures::future::FutureExt;
use reqwest::{header, Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::ApiError;
use crate::mutation::MutationFn;

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// REST client bound to one base URL.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token.into()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::Validation("token contains invalid characters".into()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        let text = response.text().await?;
        debug!(url = %url, bytes = text.len(), "GET complete");
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", url, e)))
    }

    /// Send a request with an optional JSON body. An empty response body
    /// (e.g. 204 No Content) yields `Value::Null`.
    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let url = self.url(path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .headers(self.auth_headers()?);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = Self::check_response(request.send().await?).await?;
        let text = response.text().await?;
        debug!(method = %method, url = %url, bytes = text.len(), "Request complete");
        parse_body(&text)
    }

    /// A mutation function that sends its variables as the JSON body.
    pub fn json_mutation(&self, method: Method, path: impl Into<String>) -> MutationFn<Value> {
        let client = self.clone();
        let path = path.into();
        std::sync::Arc::new(move |variables: Value| {
            let client = client.clone();
            let method = method.clone();
            let path = path.clone();
            async move { client.send_json(method, &path, Some(&variables)).await }.boxed()
        })
    }
}

fn parse_body(text: &str) -> Result<Value, ApiError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| ApiError::InvalidResponse(e.to_string()))
}
