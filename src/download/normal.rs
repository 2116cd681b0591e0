//! Direct-URL handler: resumable streaming into a temporary sibling file.
//!
//! On-disk states for a destination `path`:
//!
//! | Files present | Meaning |
//! |---------------|---------|
//! | neither | not started |
//! | `path.part` | incomplete, resumable |
//! | `path` | complete |
//!
//! The rename from `path.part` to `path` is the only commit point; any
//! error before it leaves the temporary file in place for the next run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::constants::DEFAULT_TEMP_SUFFIX;
use super::{DownloadError, ProgressTracker, Throttle};
use crate::transport::{RequestSpec, Response, RetryConfig, RetryExecutor};

/// Settings for [`NormalHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalHandlerConfig {
    /// Continue from an existing temporary file.
    pub resume: bool,
    /// Throughput cap in bytes per second.
    pub speed_limit: Option<u64>,
    /// Suffix of the temporary sibling file (without the dot).
    pub temp_suffix: String,
    /// Retry settings for the content request.
    pub retry: RetryConfig,
}

impl Default for NormalHandlerConfig {
    fn default() -> Self {
        Self {
            resume: true,
            speed_limit: None,
            temp_suffix: DEFAULT_TEMP_SUFFIX.to_string(),
            retry: RetryConfig::default(),
        }
    }
}

/// What a handler produced for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutput {
    /// Final file path.
    pub path: PathBuf,
    /// Final file size.
    pub bytes: u64,
    /// Offset the transfer resumed from (0 for a fresh download).
    pub resumed_from: u64,
    /// Content key used, for protected items.
    pub content_key_id: Option<String>,
}

/// Streams a direct URL to disk with resume and atomic commit.
#[derive(Debug)]
pub struct NormalHandler {
    executor: Arc<RetryExecutor>,
    config: NormalHandlerConfig,
    progress: Option<Arc<ProgressTracker>>,
}

impl NormalHandler {
    /// Creates a handler sending through `executor`.
    #[must_use]
    pub fn new(executor: Arc<RetryExecutor>, config: NormalHandlerConfig) -> Self {
        Self {
            executor,
            config,
            progress: None,
        }
    }

    /// Reports expected sizes to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The executor used for content requests.
    #[must_use]
    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }

    /// Handler settings.
    #[must_use]
    pub fn config(&self) -> &NormalHandlerConfig {
        &self.config
    }

    /// `<destination>.<suffix>`.
    #[must_use]
    pub fn temp_path(&self, destination: &Path) -> PathBuf {
        let mut name = destination.as_os_str().to_os_string();
        name.push(".");
        name.push(&self.config.temp_suffix);
        PathBuf::from(name)
    }

    /// Downloads `url` to `destination`.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::Io`] for directory, open, write or rename failures
    /// - [`DownloadError::HttpStatus`] for any status other than 200 or 206
    /// - [`DownloadError::Transport`] / [`DownloadError::Cancelled`] from the
    ///   request or the body stream
    /// - [`DownloadError::Integrity`] when a partial response is short or long
    #[instrument(skip(self, cancel), fields(url = %url, path = %destination.display()))]
    pub async fn download(
        &self,
        cancel: &CancellationToken,
        url: &str,
        destination: &Path,
    ) -> Result<HandlerOutput, DownloadError> {
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let temp_path = self.temp_path(destination);
        let mut offset = if self.config.resume {
            existing_len(&temp_path).await
        } else {
            0
        };

        let mut spec = RequestSpec::get(url);
        if offset > 0 {
            debug!(offset, "resuming from partial file");
            spec = spec
                .with_range_from(offset)
                .with_header("Accept-Encoding", "identity");
        }

        let mut response = self
            .executor
            .execute(cancel, &spec, &self.config.retry)
            .await
            .map_err(DownloadError::transport)?
            .into_response();

        let status = response.status_code();
        if status != 200 && status != 206 {
            response.discard();
            return Err(DownloadError::http_status(url, status));
        }

        let append = offset > 0 && response.is_partial_content();
        if offset > 0 && !append {
            info!(offset, status, "server ignored range request, restarting from zero");
            offset = 0;
        }

        let expected = if response.is_partial_content() {
            response.content_length().map(|len| offset + len)
        } else {
            None
        };
        if let Some(progress) = &self.progress {
            if let Some(len) = response.content_length() {
                progress.add_bytes_total(offset + len);
            }
        }

        let file = open_temp(&temp_path, append).await?;
        let written = self
            .stream_to_file(cancel, &mut response, file, &temp_path)
            .await?;
        let actual = offset + written;

        if let Some(expected) = expected.filter(|expected| *expected != actual) {
            warn!(expected, actual, "partial response size mismatch");
            return Err(DownloadError::Integrity {
                path: temp_path,
                expected,
                actual,
            });
        }

        tokio::fs::rename(&temp_path, destination)
            .await
            .map_err(|e| DownloadError::io(destination, e))?;

        info!(bytes = actual, resumed_from = offset, "download committed");
        Ok(HandlerOutput {
            path: destination.to_path_buf(),
            bytes: actual,
            resumed_from: offset,
            content_key_id: None,
        })
    }

    /// Streams the body into `file`; on error, flushes what was received so
    /// the temporary file keeps every byte written.
    async fn stream_to_file(
        &self,
        cancel: &CancellationToken,
        response: &mut Response,
        file: File,
        temp_path: &Path,
    ) -> Result<u64, DownloadError> {
        let mut writer = BufWriter::new(file);
        let mut throttle = self.config.speed_limit.and_then(Throttle::new);
        let mut written: u64 = 0;

        let result = async {
            while let Some(chunk) = response
                .chunk(cancel)
                .await
                .map_err(DownloadError::transport)?
            {
                writer
                    .write_all(&chunk)
                    .await
                    .map_err(|e| DownloadError::io(temp_path, e))?;
                written += chunk.len() as u64;

                if let Some(throttle) = throttle.as_mut() {
                    throttle.consume(chunk.len(), cancel).await?;
                }
            }
            Ok::<(), DownloadError>(())
        }
        .await;

        let flushed = writer
            .flush()
            .await
            .map_err(|e| DownloadError::io(temp_path, e));

        match (result, flushed) {
            (Err(error), _) => {
                debug!(written, error = %error, "transfer interrupted, keeping partial file");
                Err(error)
            }
            (Ok(()), Err(error)) => Err(error),
            (Ok(()), Ok(())) => Ok(written),
        }
    }
}

/// Length of an existing temporary file, 0 if there is none.
async fn existing_len(path: &Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        _ => 0,
    }
}

async fn open_temp(path: &Path, append: bool) -> Result<File, DownloadError> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::io;

    use bytes::Bytes;
    use futures_util::StreamExt;
    use futures_util::stream;
    use reqwest::StatusCode;
    use reqwest::header::HeaderMap;
    use tempfile::TempDir;

    use crate::test_support::scripted::{ScriptedTransport, response_with_body, status_response};
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use crate::transport::{BodyStream, TransportError};

    fn handler(transport: Arc<ScriptedTransport>, config: NormalHandlerConfig) -> NormalHandler {
        NormalHandler::new(Arc::new(RetryExecutor::new(transport)), config)
    }

    fn single_attempt() -> NormalHandlerConfig {
        NormalHandlerConfig {
            retry: RetryConfig::with_max_attempts(1),
            ..NormalHandlerConfig::default()
        }
    }

    #[test]
    fn test_temp_path_appends_suffix() {
        let handler = handler(
            Arc::new(ScriptedTransport::new()),
            NormalHandlerConfig::default(),
        );
        assert_eq!(
            handler.temp_path(Path::new("/data/a.mp4")),
            PathBuf::from("/data/a.mp4.part")
        );
    }

    #[tokio::test]
    async fn test_fresh_download_commits_and_removes_temp() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested/dir/a.bin");
        let transport = Arc::new(ScriptedTransport::new().then(|spec| {
            assert!(spec.header("range").is_none());
            Ok(response_with_body(&spec.url, 200, &[], b"hello world".to_vec()))
        }));
        let handler = handler(transport, single_attempt());

        let output = handler
            .download(&CancellationToken::new(), "https://cdn.example.com/a", &dest)
            .await
            .unwrap();

        assert_eq!(output.bytes, 11);
        assert_eq!(output.resumed_from, 0);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert!(!handler.temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_resume_appends_on_partial_content() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("video.mp4");
        let original = vec![b'a'; 1000];
        std::fs::write(dir.path().join("video.mp4.part"), &original).unwrap();

        let transport = Arc::new(ScriptedTransport::new().then(|spec| {
            assert_eq!(spec.header("range"), Some("bytes=1000-"));
            Ok(response_with_body(
                &spec.url,
                206,
                &[("content-length", "500")],
                vec![b'b'; 500],
            ))
        }));
        let handler = handler(transport, single_attempt());

        let output = handler
            .download(&CancellationToken::new(), "https://cdn.example.com/v", &dest)
            .await
            .unwrap();

        let content = std::fs::read(&dest).unwrap();
        assert_eq!(content.len(), 1500);
        assert!(content[..1000].iter().all(|b| *b == b'a'));
        assert!(content[1000..].iter().all(|b| *b == b'b'));
        assert_eq!(output.resumed_from, 1000);
    }

    #[tokio::test]
    async fn test_resume_restarts_when_range_ignored() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("video.mp4");
        std::fs::write(dir.path().join("video.mp4.part"), vec![b'a'; 1000]).unwrap();

        let transport = Arc::new(ScriptedTransport::new().then(|spec| {
            Ok(response_with_body(&spec.url, 200, &[], vec![b'c'; 1200]))
        }));
        let handler = handler(transport, single_attempt());

        let output = handler
            .download(&CancellationToken::new(), "https://cdn.example.com/v", &dest)
            .await
            .unwrap();

        let content = std::fs::read(&dest).unwrap();
        assert_eq!(content, vec![b'c'; 1200]);
        assert_eq!(output.resumed_from, 0);
    }

    #[tokio::test]
    async fn test_resume_disabled_ignores_temp_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.bin");
        std::fs::write(dir.path().join("a.bin.part"), b"stale").unwrap();

        let transport = Arc::new(ScriptedTransport::new().then(|spec| {
            assert!(spec.header("range").is_none());
            Ok(response_with_body(&spec.url, 200, &[], b"fresh".to_vec()))
        }));
        let config = NormalHandlerConfig {
            resume: false,
            ..single_attempt()
        };
        let handler = handler(transport, config);

        handler
            .download(&CancellationToken::new(), "https://cdn.example.com/a", &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_non_success_status_fails_and_keeps_temp() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.bin");
        std::fs::write(dir.path().join("a.bin.part"), b"partial").unwrap();

        let transport =
            Arc::new(ScriptedTransport::new().then(|spec| Ok(status_response(&spec.url, 404))));
        let handler = handler(transport, single_attempt());

        let result = handler
            .download(&CancellationToken::new(), "https://cdn.example.com/a", &dest)
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::HttpStatus { status: 404, .. })
        ));
        assert!(!dest.exists());
        assert_eq!(std::fs::read(dir.path().join("a.bin.part")).unwrap(), b"partial");
    }

    #[tokio::test]
    async fn test_stream_error_keeps_received_bytes() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.bin");
        let transport = Arc::new(ScriptedTransport::new().then(|spec| {
            let url = spec.url.clone();
            let body: BodyStream = stream::iter(vec![
                Ok(Bytes::from(vec![b'x'; 300])),
                Err(TransportError::io(
                    url.clone(),
                    io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
                )),
            ])
            .boxed();
            Ok(Response::from_stream(url, StatusCode::OK, HeaderMap::new(), body))
        }));
        let handler = handler(transport, single_attempt());

        let result = handler
            .download(&CancellationToken::new(), "https://cdn.example.com/a", &dest)
            .await;

        assert!(matches!(result, Err(DownloadError::Transport(_))));
        assert!(!dest.exists());
        assert_eq!(
            std::fs::metadata(dir.path().join("a.bin.part")).unwrap().len(),
            300
        );
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_keeps_partial_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.bin");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let transport = Arc::new(ScriptedTransport::new().then(move |spec| {
            let body: BodyStream = stream::iter(vec![Ok(Bytes::from(vec![b'x'; 256]))])
                .chain(stream::once(async move {
                    trigger.cancel();
                    futures_util::future::pending::<()>().await;
                    Ok(Bytes::new())
                }))
                .boxed();
            Ok(Response::from_stream(
                spec.url.clone(),
                StatusCode::OK,
                HeaderMap::new(),
                body,
            ))
        }));
        let handler = handler(transport, single_attempt());

        let result = handler
            .download(&cancel, "https://cdn.example.com/a", &dest)
            .await;

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(!dest.exists());
        assert_eq!(
            std::fs::metadata(dir.path().join("a.bin.part")).unwrap().len(),
            256
        );
    }

    #[tokio::test]
    async fn test_partial_size_mismatch_fails_integrity() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.bin");
        std::fs::write(dir.path().join("a.bin.part"), vec![b'a'; 100]).unwrap();

        let transport = Arc::new(ScriptedTransport::new().then(|spec| {
            Ok(response_with_body(
                &spec.url,
                206,
                &[("content-length", "50")],
                vec![b'b'; 20],
            ))
        }));
        let handler = handler(transport, single_attempt());

        let result = handler
            .download(&CancellationToken::new(), "https://cdn.example.com/a", &dest)
            .await;

        match result {
            Err(DownloadError::Integrity {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 150);
                assert_eq!(actual, 120);
            }
            other => panic!("expected Integrity, got {other:?}"),
        }
        assert!(!dest.exists());
        assert!(dir.path().join("a.bin.part").exists());
    }

    #[tokio::test]
    async fn test_retries_server_error_before_streaming() {
        tokio::time::pause();
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("a.bin");
        let transport = Arc::new(
            ScriptedTransport::new()
                .then_status(503)
                .then(|spec| Ok(response_with_body(&spec.url, 200, &[], b"ok".to_vec()))),
        );
        let handler = handler(transport.clone(), NormalHandlerConfig::default());

        handler
            .download(&CancellationToken::new(), "https://cdn.example.com/a", &dest)
            .await
            .unwrap();

        assert_eq!(transport.call_count(), 2);
        assert_eq!(handler.executor().retries(), 1);
    }

    #[tokio::test]
    async fn test_range_request_against_http_server() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, ResponseTemplate};

        use crate::transport::{Auth, SessionConfig, SessionManager};

        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/media/7.mp4"))
            .and(header("range", "bytes=4-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 4-9/10")
                    .set_body_bytes(b"456789".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("7.mp4");
        std::fs::write(dir.path().join("7.mp4.part"), b"0123").unwrap();

        let session =
            Arc::new(SessionManager::new(SessionConfig::default(), Auth::default()).unwrap());
        let handler = NormalHandler::new(
            Arc::new(RetryExecutor::new(session)),
            NormalHandlerConfig::default(),
        );

        handler
            .download(
                &CancellationToken::new(),
                &format!("{}/media/7.mp4", server.uri()),
                &dest,
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
    }
}
