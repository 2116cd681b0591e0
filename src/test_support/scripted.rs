//! In-process [`Transport`] that replays a script of replies.
//!
//! Works under `tokio::time::pause()`, which a real socket cannot.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::{RequestSpec, Response, Transport, TransportError};

type Reply = Box<dyn FnOnce(&RequestSpec) -> Result<Response, TransportError> + Send>;
type Fallback = Box<dyn Fn(&RequestSpec) -> Result<Response, TransportError> + Send + Sync>;

/// Scripted transport: queued one-shot replies first, then the fallback.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Option<Fallback>,
    calls: Mutex<Vec<(Instant, RequestSpec)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a one-shot reply.
    #[must_use]
    pub fn then(
        self,
        reply: impl FnOnce(&RequestSpec) -> Result<Response, TransportError> + Send + 'static,
    ) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(Box::new(reply));
        self
    }

    /// Queues a bodiless reply with `status`.
    #[must_use]
    pub fn then_status(self, status: u16) -> Self {
        self.then(move |spec| Ok(status_response(&spec.url, status)))
    }

    /// Replies used once the queue is empty.
    #[must_use]
    pub fn otherwise(
        mut self,
        reply: impl Fn(&RequestSpec) -> Result<Response, TransportError> + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Box::new(reply));
        self
    }

    /// Answers every request with `status` once the queue is empty.
    #[must_use]
    pub fn always_status(self, status: u16) -> Self {
        self.otherwise(move |spec| Ok(status_response(&spec.url, status)))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(at, _)| *at).collect())
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<RequestSpec> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(_, spec)| spec.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        cancel: &CancellationToken,
        spec: &RequestSpec,
    ) -> Result<Response, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((Instant::now(), spec.clone()));
        }

        let queued = self
            .replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        match (queued, &self.fallback) {
            (Some(reply), _) => reply(spec),
            (None, Some(fallback)) => fallback(spec),
            (None, None) => Err(TransportError::invalid_request(
                &spec.url,
                "scripted transport exhausted",
            )),
        }
    }
}

/// Response with `status` and an empty body.
pub fn status_response(url: &str, status: u16) -> Response {
    response_with_body(url, status, &[], Vec::new())
}

/// Response with `status`, the given headers and a buffered body.
pub fn response_with_body(
    url: &str,
    status: u16,
    headers: &[(&str, &str)],
    body: Vec<u8>,
) -> Response {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Response::from_bytes(url, status, map, Bytes::from(body))
}
