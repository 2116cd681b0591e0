//! Shared HTTP session: pooled client, swappable auth and throttling feedback.
//!
//! [`SessionManager`] is the production [`Transport`]. Every call passes
//! through the shared [`RateLimiter`] and [`AdaptiveSleeper`] before it
//! reaches the network, and feeds the sleeper from the status it observes.
//!
//! # Example
//!
//! ```no_run
//! use mediafetch_core::transport::{Auth, RequestSpec, SessionConfig, SessionManager, Transport};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), mediafetch_core::transport::TransportError> {
//! let session = SessionManager::new(SessionConfig::default(), Auth::default())?;
//! let cancel = CancellationToken::new();
//!
//! let response = session.send(&cancel, &RequestSpec::get("https://api.example.com/me")).await?;
//! println!("status: {}", response.status());
//!
//! session.update_auth(Auth::default().with_cookie("sess=rotated"));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::{AdaptiveSleeper, RateLimiter, RequestSpec, Response, SleeperConfig, TransportError};

/// Default User-Agent sent when none is configured.
pub const DEFAULT_USER_AGENT: &str = concat!("mediafetch/", env!("CARGO_PKG_VERSION"));

/// Executes a single HTTP request.
///
/// Implementations must honor `cancel` at every suspension point so an
/// in-flight request aborts promptly when the batch is cancelled.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request and returns the raw response, whatever its status.
    async fn send(
        &self,
        cancel: &CancellationToken,
        spec: &RequestSpec,
    ) -> Result<Response, TransportError>;
}

/// Credentials injected into every request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Auth {
    /// Extra headers (signatures, bearer tokens).
    pub headers: Vec<(String, String)>,
    /// Raw `Cookie` header value.
    pub cookie: Option<String>,
    /// User-Agent override.
    pub user_agent: Option<String>,
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("Auth")
            .field("headers", &header_names)
            .field("cookie", &self.cookie.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl Auth {
    /// Adds an auth header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the cookie header value.
    #[must_use]
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    /// Sets the User-Agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Returns true if no credential material is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.cookie.is_none() && self.user_agent.is_none()
    }
}

/// Client construction settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Per-read timeout while streaming a body.
    pub read_timeout: Duration,
    /// Default User-Agent (an [`Auth`] override wins).
    pub user_agent: String,
    /// Minimum spacing between requests; zero disables the limiter.
    pub rate_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rate_interval: Duration::ZERO,
        }
    }
}

struct SessionState {
    /// `None` once the session is closed.
    client: Option<Client>,
    auth: Auth,
}

/// Production [`Transport`] backed by a pooled reqwest client.
///
/// The client and auth sit behind one read/write lock: request construction
/// takes the read side, [`update_auth`](Self::update_auth) and
/// [`close`](Self::close) take the write side. A request built before a
/// rotation keeps the credentials it was built with.
pub struct SessionManager {
    state: RwLock<SessionState>,
    limiter: Arc<RateLimiter>,
    sleeper: Arc<AdaptiveSleeper>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("limiter", &self.limiter)
            .field("sleeper", &self.sleeper)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a session with its own limiter (from `config.rate_interval`)
    /// and a default adaptive sleeper.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ClientBuild`] if the HTTP client cannot be built.
    pub fn new(config: SessionConfig, auth: Auth) -> Result<Self, TransportError> {
        let limiter = Arc::new(RateLimiter::new(config.rate_interval));
        let sleeper = Arc::new(AdaptiveSleeper::new(SleeperConfig::default()));
        Self::with_components(&config, auth, limiter, sleeper)
    }

    /// Creates a session sharing an existing limiter and sleeper.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ClientBuild`] if the HTTP client cannot be built.
    #[instrument(level = "debug", skip(auth, limiter, sleeper))]
    pub fn with_components(
        config: &SessionConfig,
        auth: Auth,
        limiter: Arc<RateLimiter>,
        sleeper: Arc<AdaptiveSleeper>,
    ) -> Result<Self, TransportError> {
        let client = build_client(config).map_err(TransportError::ClientBuild)?;
        debug!("HTTP session created");
        Ok(Self {
            state: RwLock::new(SessionState {
                client: Some(client),
                auth,
            }),
            limiter,
            sleeper,
        })
    }

    /// The shared rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The shared adaptive sleeper.
    #[must_use]
    pub fn sleeper(&self) -> &Arc<AdaptiveSleeper> {
        &self.sleeper
    }

    /// Replaces the credentials used by all subsequent requests.
    pub fn update_auth(&self, auth: Auth) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.auth = auth;
        info!("session credentials updated");
    }

    /// Returns a copy of the current credentials.
    #[must_use]
    pub fn auth(&self) -> Auth {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .auth
            .clone()
    }

    /// Drops the pooled client; later sends fail with [`TransportError::Closed`].
    pub fn close(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.client.take().is_some() {
            debug!("HTTP session closed");
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .client
            .is_none()
    }

    /// Builds the reqwest request under the read lock.
    fn build_request(&self, spec: &RequestSpec) -> Result<reqwest::RequestBuilder, TransportError> {
        let url = Url::parse(&spec.url)
            .map_err(|e| TransportError::invalid_request(&spec.url, e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransportError::invalid_request(
                &spec.url,
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let client = state.client.as_ref().ok_or(TransportError::Closed)?;

        let mut headers = HeaderMap::new();
        if let Some(user_agent) = &state.auth.user_agent {
            insert_header(&mut headers, &spec.url, USER_AGENT.as_str(), user_agent)?;
        }
        if let Some(cookie) = &state.auth.cookie {
            insert_header(&mut headers, &spec.url, COOKIE.as_str(), cookie)?;
        }
        for (name, value) in state.auth.headers.iter().chain(spec.headers.iter()) {
            insert_header(&mut headers, &spec.url, name, value)?;
        }

        let mut builder = client.request(spec.method.clone(), url).headers(headers);
        if let Some(body) = &spec.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }
}

#[async_trait]
impl Transport for SessionManager {
    #[instrument(level = "debug", skip(self, cancel, spec), fields(method = %spec.method, url = %spec.url))]
    async fn send(
        &self,
        cancel: &CancellationToken,
        spec: &RequestSpec,
    ) -> Result<Response, TransportError> {
        self.limiter.wait(cancel).await?;
        self.sleeper.sleep(cancel).await?;

        let request = self.build_request(spec)?;
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = request.send() => result.map_err(|e| TransportError::network(&spec.url, e))?,
        };

        let response = Response::from_reqwest(response);
        if response.is_rate_limit() {
            self.sleeper.on_rate_limit();
        } else if response.is_forbidden() {
            self.sleeper.on_forbidden();
        }
        debug!(status = response.status_code(), "response received");
        Ok(response)
    }
}

fn insert_header(
    headers: &mut HeaderMap,
    url: &str,
    name: &str,
    value: &str,
) -> Result<(), TransportError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| TransportError::invalid_request(url, format!("header name '{name}': {e}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| TransportError::invalid_request(url, format!("header '{name}' value: {e}")))?;
    headers.insert(name, value);
    Ok(())
}

fn build_client(config: &SessionConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .gzip(true)
        .user_agent(config.user_agent.clone())
        .build()
}
