//! A [`Transport`] whose response body is a fixed list of chunk results.
//!
//! Lets tests cut a transfer off after a known number of bytes, which a
//! mock HTTP server cannot do mid-body.

use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use mediafetch_core::transport::{BodyStream, RequestSpec, Response, Transport, TransportError};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

/// One planned piece of the body.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// Bytes delivered to the handler.
    Data(Vec<u8>),
    /// Connection reset at this point.
    Reset,
}

/// Serves `status` with the planned body to every request and records the
/// `Range` headers it saw.
pub struct ChunkedTransport {
    status: StatusCode,
    content_length: Option<u64>,
    chunks: Vec<Chunk>,
    ranges: Mutex<Vec<Option<String>>>,
}

impl ChunkedTransport {
    pub fn new(status: u16, chunks: Vec<Chunk>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            content_length: None,
            chunks,
            ranges: Mutex::new(Vec::new()),
        }
    }

    pub fn with_content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ChunkedTransport {
    async fn send(
        &self,
        cancel: &CancellationToken,
        spec: &RequestSpec,
    ) -> Result<Response, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if let Ok(mut ranges) = self.ranges.lock() {
            ranges.push(spec.header("range").map(str::to_string));
        }

        let url = spec.url.clone();
        let items: Vec<Result<Bytes, TransportError>> = self
            .chunks
            .iter()
            .map(|chunk| match chunk {
                Chunk::Data(data) => Ok(Bytes::from(data.clone())),
                Chunk::Reset => Err(TransportError::io(
                    url.clone(),
                    io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
                )),
            })
            .collect();
        let body: BodyStream = stream::iter(items).boxed();

        let mut headers = HeaderMap::new();
        if let Some(length) = self.content_length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        Ok(Response::from_stream(url, self.status, headers, body))
    }
}
