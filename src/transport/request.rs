//! Request and response shapes exchanged with a [`Transport`](super::Transport).
//!
//! [`RequestSpec`] is a plain description of one HTTP call; it can be sent
//! any number of times by the retry loop. [`Response`] wraps the status,
//! headers and a cancellable body stream, and exposes the status helpers the
//! handlers branch on.

use std::fmt;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, HeaderMap, RANGE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::TransportError;

/// Body stream type carried by [`Response`].
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Description of a single HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    /// HTTP method.
    pub method: Method,
    /// Absolute request URL.
    pub url: String,
    /// Extra request headers, applied after auth headers.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
}

impl RequestSpec {
    /// Creates a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Creates a HEAD request.
    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: Method::HEAD,
            ..Self::get(url)
        }
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Requests the bytes from `offset` to the end of the resource.
    #[must_use]
    pub fn with_range_from(self, offset: u64) -> Self {
        self.with_header(RANGE.as_str(), format!("bytes={offset}-"))
    }

    /// Sets a JSON body (and the matching content type).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Decode`] if `value` cannot be serialized.
    pub fn with_json<T: serde::Serialize>(mut self, value: &T) -> Result<Self, TransportError> {
        let body = serde_json::to_vec(value).map_err(|e| TransportError::decode(&self.url, e))?;
        self.body = Some(body);
        Ok(self.with_header("Content-Type", "application/json"))
    }

    /// Returns the value of a header set on this spec (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// HTTP response with status helpers and a cancellable body.
///
/// Dropping a `Response` (or calling [`discard`](Self::discard)) releases
/// the underlying connection.
pub struct Response {
    url: String,
    status: StatusCode,
    headers: HeaderMap,
    body: Option<BodyStream>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url)
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .field("body_pending", &self.body.is_some())
            .finish()
    }
}

impl Response {
    /// Wraps a reqwest response, streaming its body lazily.
    #[must_use]
    pub fn from_reqwest(response: reqwest::Response) -> Self {
        let url = response.url().to_string();
        let status = response.status();
        let headers = response.headers().clone();
        let body_url = url.clone();
        let body = response
            .bytes_stream()
            .map_err(move |e| TransportError::network(body_url.clone(), e))
            .boxed();
        Self {
            url,
            status,
            headers,
            body: Some(body),
        }
    }

    /// Builds a response from a fully buffered body.
    #[must_use]
    pub fn from_bytes(
        url: impl Into<String>,
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Self {
        let body: Bytes = body.into();
        let stream = if body.is_empty() {
            stream::empty().boxed()
        } else {
            stream::once(async move { Ok(body) }).boxed()
        };
        Self::from_stream(url, status, headers, stream)
    }

    /// Builds a response from an arbitrary chunk stream.
    #[must_use]
    pub fn from_stream(
        url: impl Into<String>,
        status: StatusCode,
        headers: HeaderMap,
        body: BodyStream,
    ) -> Self {
        Self {
            url: url.into(),
            status,
            headers,
            body: Some(body),
        }
    }

    /// Final URL of the response.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// HTTP status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// HTTP status as a number.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// 2xx.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    /// 206 Partial Content.
    #[must_use]
    pub fn is_partial_content(&self) -> bool {
        self.status == StatusCode::PARTIAL_CONTENT
    }

    /// 429 or 504: the upstream is throttling.
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self.status,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::GATEWAY_TIMEOUT
        )
    }

    /// 403.
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        self.status == StatusCode::FORBIDDEN
    }

    /// 400 or 401: the session or request signature was rejected.
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self.status,
            StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST
        )
    }

    /// 404.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }

    /// 5xx.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// Raw Retry-After header value, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<String> {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Announced Content-Length, if any.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    /// Reads the next body chunk; `Ok(None)` at end of body.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Cancelled`] if `cancel` fires first, or the
    /// stream's own network error.
    pub async fn chunk(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, TransportError> {
        let next = {
            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                next = body.next() => next,
            }
        };

        match next {
            Some(chunk) => chunk.map(Some),
            None => {
                self.body = None;
                Ok(None)
            }
        }
    }

    /// Reads the whole body into memory.
    ///
    /// # Errors
    ///
    /// Same as [`chunk`](Self::chunk).
    pub async fn bytes(mut self, cancel: &CancellationToken) -> Result<Vec<u8>, TransportError> {
        let mut buffer = Vec::new();
        while let Some(chunk) = self.chunk(cancel).await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }

    /// Reads the body as UTF-8 text (lossy).
    ///
    /// # Errors
    ///
    /// Same as [`chunk`](Self::chunk).
    pub async fn text(self, cancel: &CancellationToken) -> Result<String, TransportError> {
        let bytes = self.bytes(cancel).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Decode`] for a malformed body, otherwise the
    /// same errors as [`chunk`](Self::chunk).
    pub async fn json<T: DeserializeOwned>(
        self,
        cancel: &CancellationToken,
    ) -> Result<T, TransportError> {
        let url = self.url.clone();
        let bytes = self.bytes(cancel).await?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::decode(url, e))
    }

    /// Drops the body without reading it, releasing the connection.
    pub fn discard(self) {
        drop(self);
    }
}
