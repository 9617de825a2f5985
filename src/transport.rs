//! HTTP transport for the chat-completion API.
//!
//! One call carries bearer auth, the configured extra header lines, and an
//! optional JSON body; a call without a body becomes a GET (the catalog
//! fetch). Responses come back as parsed JSON plus a flat list of
//! lowercased header pairs so the rate-limit ledger can read them.

use crate::error::{PoolError, Result};
use async_trait::async_trait;
use reqwest::header::{self, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use tracing::{trace, warn};

/// One request to the API.
#[derive(Debug, Clone)]
pub struct ApiCall {
    /// Full request URL.
    pub url: String,
    /// Bearer token sent with every request.
    pub api_key: String,
    /// Literal `Name: value` header lines, sent verbatim.
    pub extra_headers: Vec<String>,
    /// JSON body; `None` turns the call into a GET without `Content-Type`.
    pub body: Option<Value>,
}

/// A parsed response: JSON body plus lowercased response headers.
#[derive(Debug, Clone)]
pub struct ApiReply {
    /// The parsed JSON body.
    pub body: Value,
    /// Response headers, names lowercased, in wire order.
    pub headers: Vec<(String, String)>,
}

/// The seam between the dispatcher and the network.
///
/// The production implementation is [`HttpTransport`]; tests substitute
/// counting or scripted fakes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one call and return the parsed reply.
    async fn execute(&self, call: &ApiCall) -> Result<ApiReply>;
}

/// reqwest-backed transport with a pooled client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with connection pooling enabled.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .tcp_nodelay(true)
            .build()
            .map_err(PoolError::HttpRequest)?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, call: &ApiCall) -> Result<ApiReply> {
        let mut request = match &call.body {
            Some(body) => self.client.post(&call.url).json(body),
            None => self.client.get(&call.url),
        };

        request = request.header(
            header::AUTHORIZATION,
            format!("Bearer {}", call.api_key),
        );

        for line in &call.extra_headers {
            match parse_header_line(line) {
                Some((name, value)) => request = request.header(name, value),
                None => warn!(line = %line, "skipping malformed header line"),
            }
        }

        trace!(url = %call.url, "sending request");

        let response = request.send().await.map_err(PoolError::HttpRequest)?;
        let status = response.status();

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let text = response.text().await.map_err(PoolError::HttpRequest)?;

        match serde_json::from_str::<Value>(&text) {
            // Error bodies parse too; the caller classifies them.
            Ok(body) => Ok(ApiReply { body, headers }),
            Err(e) if status.is_success() => Err(PoolError::Api {
                message: format!("failed to parse response body: {e}"),
            }),
            Err(_) => Err(PoolError::Api {
                message: format!("HTTP {}: {}", status.as_u16(), truncate(&text, 500)),
            }),
        }
    }
}

/// Split a literal `Name: value` line into a typed header pair.
fn parse_header_line(line: &str) -> Option<(HeaderName, HeaderValue)> {
    let (name, value) = line.split_once(':')?;
    let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
    let value = HeaderValue::from_str(value.trim()).ok()?;

    Some((name, value))
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() > limit {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text.to_owned()
    }
}
