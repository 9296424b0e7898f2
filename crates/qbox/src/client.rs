//! Outbound HTTP, abstracted behind a trait.
//!
//! The coordinator and the passthrough proxy only ever see [`HttpClient`];
//! the production implementation wraps a shared `reqwest` client, and tests
//! inject a scripted double instead.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::tree::Headers;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The whole request/response cycle exceeded the per-attempt cap.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection, DNS, or protocol failure. Not retried.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// A complete downstream response, body buffered in memory.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

/// One operation: perform a request, bounded by `timeout`.
///
/// Implementations must be safe for concurrent use across sagas.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(
        &self,
        method: &str,
        url: &str,
        headers: &Headers,
        body: Bytes,
        timeout: Duration,
    ) -> Result<HttpResponse, ClientError>;
}

/// Production client over a shared connection pool.
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self {
            inner: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(
        &self,
        method: &str,
        url: &str,
        headers: &Headers,
        body: Bytes,
        timeout: Duration,
    ) -> Result<HttpResponse, ClientError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        let mut header_map = reqwest::header::HeaderMap::new();
        for (name, value) in headers.iter() {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| ClientError::Transport(err.to_string()))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|err| ClientError::Transport(err.to_string()))?;
            header_map.insert(name, value);
        }

        let response = self
            .inner
            .request(method, url)
            .headers(header_map)
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify(err, timeout))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| classify(err, timeout))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout(timeout)
    } else {
        ClientError::Transport(err.to_string())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted client double that records every outbound message, in the
    //! style of the saga executor's mock backends.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub(crate) struct RecordedCall {
        pub method: String,
        pub url: String,
        pub headers: Headers,
        pub body: Bytes,
    }

    /// Scripted responses are keyed by URL and consumed in order; the last
    /// entry for a URL repeats. Unscripted URLs answer `200` with an empty
    /// body.
    #[derive(Default)]
    pub(crate) struct RecordingClient {
        responses: Mutex<HashMap<String, VecDeque<Result<HttpResponse, ClientError>>>>,
        calls: Mutex<Vec<RecordedCall>>,
    }

    impl RecordingClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, url: &str, result: Result<HttpResponse, ClientError>) {
            self.responses
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(result);
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn urls(&self) -> Vec<String> {
            self.calls().into_iter().map(|call| call.url).collect()
        }

        pub fn call_count(&self, url: &str) -> usize {
            self.calls()
                .iter()
                .filter(|call| call.url == url)
                .count()
        }
    }

    pub(crate) fn response(status: u16) -> HttpResponse {
        HttpResponse {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub(crate) fn response_with_body(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: Headers::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn execute(
            &self,
            method: &str,
            url: &str,
            headers: &Headers,
            body: Bytes,
            _timeout: Duration,
        ) -> Result<HttpResponse, ClientError> {
            self.calls.lock().unwrap().push(RecordedCall {
                method: method.to_string(),
                url: url.to_string(),
                headers: headers.clone(),
                body,
            });

            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(url) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue.front().cloned().unwrap_or(Ok(response(200))),
                None => Ok(response(200)),
            }
        }
    }
}
