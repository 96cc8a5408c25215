//! HTTP transport used by the runner.

use crate::auth::Credentials;
use crate::model::HttpMethod;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method as ReqMethod};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Status, headers and raw body of a received response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.body).context("Failed to parse response as JSON")
    }
}

/// A fully resolved request: placeholders substituted, URL absolute,
/// defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
    pub credentials: Option<Credentials>,
}

impl PreparedRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
            connection_timeout: None,
            credentials: None,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Sends one request and waits for the complete response.
///
/// Transport failures (connection refused, timeouts, invalid URLs) are
/// returned as errors; any HTTP status is a successful response.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: &PreparedRequest) -> Result<HttpResponse>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
    connect_timeout: Duration,
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            connect_timeout,
        })
    }

    fn convert_method(method: HttpMethod) -> ReqMethod {
        match method {
            HttpMethod::Get => ReqMethod::GET,
            HttpMethod::Post => ReqMethod::POST,
            HttpMethod::Put => ReqMethod::PUT,
            HttpMethod::Delete => ReqMethod::DELETE,
            HttpMethod::Patch => ReqMethod::PATCH,
            HttpMethod::Head => ReqMethod::HEAD,
            HttpMethod::Options => ReqMethod::OPTIONS,
        }
    }

    /// The shared client, or a dedicated one when the request asks for a
    /// different connection timeout.
    fn client_for(&self, request: &PreparedRequest) -> Result<Client> {
        match request.connection_timeout {
            Some(timeout) if timeout != self.connect_timeout => Client::builder()
                .connect_timeout(timeout)
                .build()
                .context("Failed to build HTTP client"),
            _ => Ok(self.client.clone()),
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: &PreparedRequest) -> Result<HttpResponse> {
        let client = self.client_for(request)?;
        let mut builder =
            client.request(Self::convert_method(request.method), &request.url);

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match &request.credentials {
            Some(Credentials::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            Some(Credentials::Bearer(token)) => builder.bearer_auth(token),
            Some(Credentials::ApiKey { header, key }) => builder.header(header, key),
            None => builder,
        };
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        debug!("Sending request to {}", request.url);
        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", request.url))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;
        debug!("Received response with status: {}", status);

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(200, "{}")
            .with_header("Content-Type", "application/json")
            .with_header("X-Trace", "1");
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.header("X-TRACE"), Some("1"));
        assert_eq!(response.header("missing"), None);
    }

    #[test]
    fn test_response_json() {
        let response = HttpResponse::new(200, r#"{"a": [1]}"#);
        assert_eq!(response.json().unwrap()["a"][0], 1);
        assert!(HttpResponse::new(200, "oops").json().is_err());
    }

    #[test]
    fn test_prepared_request_header_lookup() {
        let mut request = PreparedRequest::new(HttpMethod::Get, "http://x/");
        request
            .headers
            .insert("Accept".to_string(), "application/json".to_string());
        assert_eq!(request.header("accept"), Some("application/json"));
        assert!(request.header("content-type").is_none());
    }
}
