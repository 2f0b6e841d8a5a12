//! The HTTP boundary. Providers render an [`HttpRequest`] and read the body of
//! an [`HttpResponse`] as a stream of byte chunks; dropping that stream aborts
//! the underlying connection.

use crate::llm::LlmError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;

pub type ByteStream = BoxStream<'static, Result<Bytes, LlmError>>;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// URL with any `key=` query parameter masked, for logging.
    pub fn redacted_url(&self) -> String {
        match self.url.split_once("key=") {
            Some((head, tail)) => {
                let rest = tail.find('&').map(|i| &tail[i..]).unwrap_or("");
                format!("{head}key=***{rest}")
            }
            None => self.url.clone(),
        }
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ByteStream,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Collects the whole body as UTF-8 text (lossy).
    pub async fn text(self) -> Result<String, LlmError> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        let bytes: Vec<u8> = chunks.concat();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// POSTs the JSON body and returns once status and headers are known.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LlmError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LlmError> {
        tracing::debug!(url = %request.redacted_url(), "sending provider request");
        let mut req = self
            .client
            .post(&request.url)
            .header("Content-Type", "application/json")
            .json(&request.body);
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp.bytes_stream().map_err(LlmError::from).boxed();

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
    fn test_redacted_url_masks_query_key() {
        let request = HttpRequest {
            url: "https://example.test/v1beta/models/m:generateContent?alt=sse&key=secret&x=1"
                .to_string(),
            headers: Vec::new(),
            body: serde_json::Value::Null,
        };
        assert_eq!(
            request.redacted_url(),
            "https://example.test/v1beta/models/m:generateContent?alt=sse&key=***&x=1"
        );
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let request = HttpRequest {
            url: String::new(),
            headers: vec![("x-api-key".to_string(), "k".to_string())],
            body: serde_json::Value::Null,
        };
        assert_eq!(request.header("X-API-Key"), Some("k"));
        assert_eq!(request.header("authorization"), None);
    }
}
