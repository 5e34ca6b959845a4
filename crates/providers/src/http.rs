//! Outgoing HTTP for provider adapters.
//!
//! One `reqwest::Client` is built per process and cloned into every
//! adapter; clones share the connection pool, and any clone held by an
//! in-flight stream keeps the pool alive for the lifetime of that
//! stream. Adapters never build their own clients.

use std::time::Duration;

use serde_json::Value;

use helm_domain::error::{Error, Result};

/// Default timeout for fully-buffered requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
/// Default timeout for SSE streams. Streams are expected to stay open
/// for the whole assistant turn, so this is effectively "a day".
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// How much of a non-2xx body is read back into the error.
const ERROR_BODY_CAP: usize = 64 * 1024;

/// Cheaply-clonable handle around the process-wide HTTP client.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let inner = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self { inner })
    }

    /// Execute a fully-buffered JSON POST.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let response = self
            .send(url, headers, body, timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT), false)
            .await?;
        let response = check_status(response).await?;
        response.json().await.map_err(from_reqwest)
    }

    /// Execute a streaming POST with `Accept: text/event-stream`.
    ///
    /// The returned response holds the live connection; dropping it
    /// cancels the request.
    pub async fn post_sse(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let response = self
            .send(url, headers, body, timeout.unwrap_or(DEFAULT_STREAM_TIMEOUT), true)
            .await?;
        check_status(response).await
    }

    async fn send(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        timeout: Duration,
        sse: bool,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .inner
            .post(url)
            .timeout(timeout)
            .header("Content-Type", "application/json");
        if sse {
            request = request.header("Accept", "text/event-stream");
        }
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request.json(body).send().await.map_err(from_reqwest)
    }
}

/// Pass 2xx responses through; read up to [`ERROR_BODY_CAP`] of the body
/// on anything else.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = read_capped(response, ERROR_BODY_CAP).await;
    Err(Error::HttpStatus {
        status: status.as_u16(),
        body,
    })
}

async fn read_capped(mut response: reqwest::Response, cap: usize) -> String {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < cap {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(cap - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Body-decode failures map to [`Error::Decoding`]; everything else
/// (connect, timeout, broken pipe) is [`Error::Transport`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_decode() {
        Error::Decoding(e.to_string())
    } else if e.is_timeout() {
        Error::Transport(format!("timeout: {e}"))
    } else {
        Error::Transport(e.to_string())
    }
}
